use crate::{EngineError, Result};
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

pub const RULE_TABLE_VERSION: u32 = 4;
pub const MIN_CONTEXT_WINDOW: usize = 400;
pub const MAX_CONTEXT_WINDOW: usize = 600;
pub const DEFAULT_CONTEXT_WINDOW: usize = 500;

const DEFAULT_SIZE_SUFFIX_PATTERNS: &[&str] = &[
    // ._AC_SL1500_.  ._SS40_.  ._SX38_SY50_CR,0,0,38,50_.
    r"\._[^/]*?_\.",
    // ._SY88.  ._AC_UL320.  (no trailing underscore, common on review tiles)
    r"\._(?:AC|S[XYSLR]|U[SLXY]|CR|QL|FM|BO|PI|SR)[A-Za-z0-9,%_-]*\.",
];

const DEFAULT_INVALID_IMAGE_MARKERS: &[&str] = &[
    "sprite",
    "icon",
    "placeholder",
    "avatar",
    "/images/g/",
    "nav-",
    "navfoot",
    "transparent-pixel",
    "grey-pixel",
    "gray-pixel",
    "spacer",
    "loading",
    "spinner",
    "zoom",
    "play-button",
    "play_button",
    "badge",
    "logo",
    "x-locale",
    "blank.gif",
    "1x1",
];

const DEFAULT_REVIEW_MARKERS: &[&str] = &[
    "customer",
    "review",
    "ugc",
    "cr-media",
    "crmedia",
    "reviewer",
];

const DEFAULT_PROMO_MARKERS: &[&str] = &[
    "sponsored",
    "similar",
    "/brand",
    "brand-story",
    "brandstory",
    "/aplus",
    "aplus-media",
    "adsystem",
    "sp_detail",
    "sims-",
    "compare",
];

const DEFAULT_OFFICIAL_VIDEO_MARKERS: &[&str] = &[
    "official",
    "vendor",
    "merchant",
    "manufacturer",
    "productvideo",
    "product_video",
];

const DEFAULT_PRODUCT_GALLERY_SELECTORS: &[&str] = &[
    "#imageBlock",
    "#imageBlock_feature_div",
    "#altImages",
    "#main-image-container",
    "#imgTagWrapperId",
    "#ivLargeImage",
    "#ebooksImageBlock",
    "#dp-container #leftCol",
];

const DEFAULT_REVIEW_CONTAINER_SELECTORS: &[&str] = &[
    "#customer-reviews",
    "#customerReviews",
    "#reviewsMedley",
    "#cm-cr-dp-review-list",
    "#cm_cr-review_list",
    "#cr-media-gallery-popover",
    "[data-hook=\"review\"]",
    "[data-hook=\"cr-media-gallery\"]",
    "[data-hook=\"review-image-tile\"]",
    ".review-image-tile-section",
    ".cr-lightbox-image-thumbnail",
    "#vse-related-videos",
];

const DEFAULT_PROMO_CONTAINER_SELECTORS: &[&str] = &[
    "#sp_detail",
    "#sp_detail2",
    "#sp_detail_thematic",
    "#sims-consolidated-1_feature_div",
    "#sims-consolidated-2_feature_div",
    "#similarities_feature_div",
    "#HLCXComparisonWidget_feature_div",
    "#aplus",
    "#aplus_feature_div",
    "#brandSnapshot_feature_div",
    "[data-ad-details]",
    "[cel_widget_id*=\"sp_detail\"]",
    "[data-component-type=\"sp-sponsored-result\"]",
    ".AdHolder",
];

const DEFAULT_REVIEW_PAGE_HEADER_SELECTORS: &[&str] = &[
    "#cm_cr-product_info",
    "[data-hook=\"cr-product-image\"]",
    "[data-hook=\"cr-product-title\"]",
];

/// How to classify a video that carries both review and official markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoConflictPolicy {
    PreferProduct,
    PreferReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleTable {
    pub version: u32,
    pub size_suffix_patterns: Vec<String>,
    pub invalid_image_markers: Vec<String>,
    pub review_markers: Vec<String>,
    pub promo_markers: Vec<String>,
    pub official_video_markers: Vec<String>,
    pub product_gallery_selectors: Vec<String>,
    pub review_container_selectors: Vec<String>,
    pub promo_container_selectors: Vec<String>,
    /// Product header on review-listing pages; never review media.
    pub review_page_header_selectors: Vec<String>,
    pub context_window: usize,
    pub video_conflict_policy: VideoConflictPolicy,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            version: RULE_TABLE_VERSION,
            size_suffix_patterns: to_strings(DEFAULT_SIZE_SUFFIX_PATTERNS),
            invalid_image_markers: to_strings(DEFAULT_INVALID_IMAGE_MARKERS),
            review_markers: to_strings(DEFAULT_REVIEW_MARKERS),
            promo_markers: to_strings(DEFAULT_PROMO_MARKERS),
            official_video_markers: to_strings(DEFAULT_OFFICIAL_VIDEO_MARKERS),
            product_gallery_selectors: to_strings(DEFAULT_PRODUCT_GALLERY_SELECTORS),
            review_container_selectors: to_strings(DEFAULT_REVIEW_CONTAINER_SELECTORS),
            promo_container_selectors: to_strings(DEFAULT_PROMO_CONTAINER_SELECTORS),
            review_page_header_selectors: to_strings(DEFAULT_REVIEW_PAGE_HEADER_SELECTORS),
            context_window: DEFAULT_CONTEXT_WINDOW,
            video_conflict_policy: VideoConflictPolicy::PreferProduct,
        }
    }
}

impl RuleTable {
    pub fn normalized(mut self) -> Self {
        self.invalid_image_markers = normalize_markers(self.invalid_image_markers);
        self.review_markers = normalize_markers(self.review_markers);
        self.promo_markers = normalize_markers(self.promo_markers);
        self.official_video_markers = normalize_markers(self.official_video_markers);
        self.context_window = self
            .context_window
            .clamp(MIN_CONTEXT_WINDOW, MAX_CONTEXT_WINDOW);
        self
    }

    pub fn compile(&self) -> Result<CompiledRules> {
        let table = self.clone().normalized();

        let mut size_suffixes = Vec::with_capacity(table.size_suffix_patterns.len());
        for pattern in &table.size_suffix_patterns {
            let re = Regex::new(pattern).map_err(|e| EngineError::InvalidRule {
                field: "size_suffix_patterns".to_string(),
                message: format!("{pattern}: {e}"),
            })?;
            size_suffixes.push(re);
        }

        Ok(CompiledRules {
            size_suffixes,
            product_gallery: compile_selectors(
                "product_gallery_selectors",
                &table.product_gallery_selectors,
            )?,
            review_containers: compile_selectors(
                "review_container_selectors",
                &table.review_container_selectors,
            )?,
            promo_containers: compile_selectors(
                "promo_container_selectors",
                &table.promo_container_selectors,
            )?,
            review_page_headers: compile_selectors(
                "review_page_header_selectors",
                &table.review_page_header_selectors,
            )?,
            table,
        })
    }
}

/// A rule table with its regexes and selectors parsed.
#[derive(Debug)]
pub struct CompiledRules {
    pub table: RuleTable,
    pub size_suffixes: Vec<Regex>,
    pub product_gallery: Vec<Selector>,
    pub review_containers: Vec<Selector>,
    pub promo_containers: Vec<Selector>,
    pub review_page_headers: Vec<Selector>,
}

impl CompiledRules {
    pub fn builtin() -> Self {
        RuleTable::default()
            .compile()
            .unwrap_or_else(|e| panic!("builtin rule table must compile: {e}"))
    }

    pub fn context_window(&self) -> usize {
        self.table.context_window
    }
}

fn compile_selectors(field: &str, raw: &[String]) -> Result<Vec<Selector>> {
    let mut out = Vec::with_capacity(raw.len());
    for css in raw {
        let selector = Selector::parse(css).map_err(|e| EngineError::InvalidRule {
            field: field.to_string(),
            message: format!("{css}: {e}"),
        })?;
        out.push(selector);
    }
    Ok(out)
}

fn normalize_markers(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in values {
        let trimmed = raw.trim().to_ascii_lowercase();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|existing| existing == &trimmed) {
            out.push(trimmed);
        }
    }
    out
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub(crate) fn any_marker(haystack_lower: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .any(|marker| haystack_lower.contains(marker.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_compiles() {
        let rules = CompiledRules::builtin();
        assert_eq!(rules.table.version, RULE_TABLE_VERSION);
        assert!(!rules.size_suffixes.is_empty());
        assert!(!rules.review_containers.is_empty());
        assert!(!rules.promo_containers.is_empty());
    }

    #[test]
    fn normalized_dedupes_markers_and_clamps_window() {
        let table = RuleTable {
            review_markers: vec![" Review ".into(), "review".into(), "".into()],
            context_window: 5_000,
            ..RuleTable::default()
        }
        .normalized();
        assert_eq!(table.review_markers, vec!["review".to_string()]);
        assert_eq!(table.context_window, MAX_CONTEXT_WINDOW);
    }

    #[test]
    fn invalid_selector_is_reported_with_field_name() {
        let table = RuleTable {
            promo_container_selectors: vec!["div[[".into()],
            ..RuleTable::default()
        };
        let err = table.compile().expect_err("bad selector");
        match err {
            EngineError::InvalidRule { field, .. } => {
                assert_eq!(field, "promo_container_selectors")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let table = RuleTable {
            size_suffix_patterns: vec!["(unclosed".into()],
            ..RuleTable::default()
        };
        assert!(table.compile().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let table: RuleTable =
            serde_json::from_str(r#"{"promo_markers":["deal-of-the-day"]}"#).expect("json");
        assert_eq!(table.promo_markers, vec!["deal-of-the-day".to_string()]);
        assert_eq!(table.context_window, DEFAULT_CONTEXT_WINDOW);
        assert!(!table.review_markers.is_empty());
    }
}
