use crate::normalize::{marker_haystack, Normalizer};
use crate::rules::{any_marker, CompiledRules, VideoConflictPolicy};
use regex::Regex;
use scraper::ElementRef;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Promotional,
    InvalidAsset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ProductImage,
    ReviewImage,
    ProductVideo,
    ReviewVideo,
    Discard(DiscardReason),
}

impl Classification {
    pub fn is_promotional(&self) -> bool {
        matches!(self, Classification::Discard(DiscardReason::Promotional))
    }
}

/// Where an element sits in the page, as far as classification cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomContext {
    pub in_promo: bool,
    pub in_review: bool,
    pub in_product_gallery: bool,
    pub in_page_header: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Evidence<'a> {
    Dom(DomContext),
    Script { window: &'a str },
    ReviewPage,
}

#[derive(Debug, Clone, Copy)]
pub struct Classifier<'r> {
    rules: &'r CompiledRules,
}

impl<'r> Classifier<'r> {
    pub fn new(rules: &'r CompiledRules) -> Self {
        Self { rules }
    }

    pub fn dom_context(&self, el: &ElementRef<'_>) -> DomContext {
        let mut ctx = DomContext::default();
        let chain = std::iter::once(*el).chain(el.ancestors().filter_map(ElementRef::wrap));
        for node in chain {
            if !ctx.in_promo && self.rules.promo_containers.iter().any(|s| s.matches(&node)) {
                ctx.in_promo = true;
            }
            if !ctx.in_review && self.rules.review_containers.iter().any(|s| s.matches(&node)) {
                ctx.in_review = true;
            }
            if !ctx.in_product_gallery
                && self.rules.product_gallery.iter().any(|s| s.matches(&node))
            {
                ctx.in_product_gallery = true;
            }
            if !ctx.in_page_header
                && self.rules.review_page_headers.iter().any(|s| s.matches(&node))
            {
                ctx.in_page_header = true;
            }
        }
        ctx
    }

    pub fn classify_image(&self, url: &str, evidence: &Evidence<'_>) -> Classification {
        if !Normalizer::new(self.rules).is_valid_image(url) {
            return Classification::Discard(DiscardReason::InvalidAsset);
        }
        let signals = self.signals(url, evidence);
        if signals.promo {
            return Classification::Discard(DiscardReason::Promotional);
        }
        if signals.review {
            Classification::ReviewImage
        } else {
            Classification::ProductImage
        }
    }

    pub fn classify_video(&self, url: &str, evidence: &Evidence<'_>) -> Classification {
        let signals = self.signals(url, evidence);
        if signals.promo {
            return Classification::Discard(DiscardReason::Promotional);
        }
        if !signals.review {
            return Classification::ProductVideo;
        }
        if !signals.official {
            return Classification::ReviewVideo;
        }
        match self.rules.table.video_conflict_policy {
            VideoConflictPolicy::PreferProduct => Classification::ProductVideo,
            VideoConflictPolicy::PreferReview => Classification::ReviewVideo,
        }
    }

    fn signals(&self, url: &str, evidence: &Evidence<'_>) -> Signals {
        let table = &self.rules.table;
        let url_hay = marker_haystack(url);
        let mut signals = Signals {
            promo: any_marker(&url_hay, &table.promo_markers),
            review: any_marker(&url_hay, &table.review_markers),
            official: any_marker(&url_hay, &table.official_video_markers),
        };

        match evidence {
            Evidence::Dom(ctx) => {
                signals.promo |= ctx.in_promo;
                if ctx.in_review {
                    signals.review = true;
                } else if ctx.in_product_gallery {
                    // Gallery placement outranks URL wording.
                    signals.review = false;
                    signals.official = true;
                }
            }
            Evidence::Script { window } => {
                let window = window.to_ascii_lowercase();
                signals.promo |= any_marker(&window, &table.promo_markers);
                signals.review |= any_marker(&window, &table.review_markers);
                signals.official |= any_marker(&window, &table.official_video_markers);
            }
            Evidence::ReviewPage => signals.review = true,
        }
        signals
    }

    pub fn context_window(&self, text: &str, start: usize, end: usize) -> String {
        let radius = self.rules.context_window();
        let before_start = floor_char_boundary(text, start.saturating_sub(radius));
        let after_end = ceil_char_boundary(text, (end + radius).min(text.len()));
        let start = floor_char_boundary(text, start);
        let end = ceil_char_boundary(text, end);
        let mut out = String::with_capacity(after_end - before_start);
        out.push_str(&text[before_start..start]);
        out.push(' ');
        out.push_str(&text[end..after_end]);
        out
    }

    pub fn scan_script(&self, script: &str) -> Vec<ScriptHit> {
        let unescaped = script.replace("\\/", "/");
        let mut hits = Vec::new();
        for m in script_image_re().find_iter(&unescaped) {
            let window = self.context_window(&unescaped, m.start(), m.end());
            let class = self.classify_image(m.as_str(), &Evidence::Script { window: &window });
            hits.push(ScriptHit {
                url: m.as_str().to_string(),
                class,
            });
        }
        for m in script_video_re().find_iter(&unescaped) {
            let window = self.context_window(&unescaped, m.start(), m.end());
            let class = self.classify_video(m.as_str(), &Evidence::Script { window: &window });
            hits.push(ScriptHit {
                url: m.as_str().to_string(),
                class,
            });
        }
        hits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHit {
    pub url: String,
    pub class: Classification,
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    promo: bool,
    review: bool,
    official: bool,
}

fn script_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^"'\s<>\\]+?/images/I/[^"'\s<>\\]+?\.(?:jpe?g|png|gif|webp)"#)
            .expect("script image regex")
    })
}

fn script_video_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^"'\s<>\\]+?\.(?:mp4|m3u8|webm)(?:\?[^"'\s<>\\]*)?"#)
            .expect("script video regex")
    })
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
