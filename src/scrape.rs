use crate::classify::{Classification, Classifier, DiscardReason, Evidence};
use crate::config::SnapshotLimits;
use crate::models::{
    truncate_display, ListingProductSummary, MediaKind, PageType, ProductSnapshot, SnapshotBuilder,
};
use crate::normalize::{looks_like_video_url, MediaSet, Normalizer};
use crate::page::{asin_from_attr, element_text, is_valid_asin, PageDocument};
use crate::rules::CompiledRules;
use crate::variants::{carousel_supersedes, largest_dynamic_image, VariantResolver};
use regex::Regex;
use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

const MAIN_IMAGE_SELECTORS: &[&str] = &[
    "#landingImage",
    "#imgBlkFront",
    "#ebooksImgBlkFront",
    "#main-image",
    "#imgTagWrapperId img",
];

const CAROUSEL_SELECTORS: &[&str] = &[
    "#altImages img",
    "#imageBlockThumbs img",
    "#imageBlock_feature_div li.imageThumbnail img",
    "#ivThumbs img",
];

const VIDEO_SELECTORS: &[&str] = &["video[src]", "video source[src]", "[data-video-url]"];
const VIDEO_ATTRS: &[&str] = &["src", "data-video-url"];

const LISTING_CARD_SELECTOR: &str = "[data-component-type=\"s-search-result\"][data-asin]";
const SPONSORED_LABEL_SELECTORS: &[&str] = &[
    ".puis-sponsored-label-text",
    ".s-sponsored-label-text",
    "[data-component-type=\"sp-sponsored-result\"]",
];

fn rating_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)").expect("rating regex"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMedia {
    pub images: Vec<String>,
    pub videos: Vec<String>,
}

impl ReviewMedia {
    pub fn len(&self) -> usize {
        self.images.len() + self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }

    pub fn merge(&mut self, other: ReviewMedia) -> usize {
        let mut images = MediaSet::images();
        let mut videos = MediaSet::videos();
        for url in &self.images {
            images.insert(url);
        }
        for url in &self.videos {
            videos.insert(url);
        }
        let mut added = 0;
        for url in &other.images {
            if images.insert(url) {
                added += 1;
            }
        }
        for url in &other.videos {
            if videos.insert(url) {
                added += 1;
            }
        }
        self.images = images.into_vec();
        self.videos = videos.into_vec();
        added
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub snapshot: ProductSnapshot,
    pub invalid_sources: usize,
    pub discarded: usize,
}

pub struct Scraper<'r> {
    rules: &'r CompiledRules,
    limits: SnapshotLimits,
}

impl<'r> Scraper<'r> {
    pub fn new(rules: &'r CompiledRules, limits: SnapshotLimits) -> Self {
        Self { rules, limits }
    }

    /// One full pass over a page. `None` when the page is neither a product
    /// page nor a search listing.
    pub fn scrape(&self, doc: &PageDocument, reviews: Option<&ReviewMedia>) -> Option<ScrapeOutcome> {
        match doc.page_type()? {
            PageType::Product => Some(self.scrape_product(doc, reviews)),
            PageType::Listing => Some(self.scrape_listing(doc)),
        }
    }

    fn scrape_product(&self, doc: &PageDocument, reviews: Option<&ReviewMedia>) -> ScrapeOutcome {
        let classifier = Classifier::new(self.rules);
        let normalizer = Normalizer::new(self.rules);
        let resolution = VariantResolver::new(self.rules).resolve(doc);
        let mut pass = Pass::new(PageType::Product, &doc.url);
        pass.invalid_sources = resolution.invalid_sources;

        let asin = resolution
            .canonical_asin
            .clone()
            .or_else(|| resolution.selected().map(|v| v.asin.clone()))
            .unwrap_or_default();
        pass.builder
            .asin(&asin)
            .title(&doc.title(), self.limits.title_max_chars)
            .description(&doc.description(), self.limits.description_max_chars);

        // Authoritative gallery sources first: a later promotional discard
        // then never removes a confirmed product image.
        if let Some(main) = self.main_image(doc, &mut pass) {
            pass.builder.active_image(&main);
            pass.builder.push_product_image(&main);
        }
        for url in &resolution.initial_gallery {
            pass.builder.push_product_image(url);
        }
        for css in CAROUSEL_SELECTORS {
            for el in doc.select_all(css) {
                let Some(url) = image_src(doc, &el).map(|u| normalizer.to_high_res(&u)) else {
                    continue;
                };
                let evidence = Evidence::Dom(classifier.dom_context(&el));
                let class = classifier.classify_image(&url, &evidence);
                pass.apply(&url, class);
            }
        }
        let carousel = pass.builder.product_images().to_vec();

        // Other variants' galleries live in the same scripts; keep them out
        // of the active product gallery.
        let mut foreign: HashSet<String> = HashSet::new();
        let active: HashSet<String> = carousel.iter().map(|u| normalizer.image_base(u)).collect();
        for variant in resolution.variants.iter().filter(|v| !v.selected) {
            for url in &variant.images {
                let key = normalizer.image_base(url);
                if !active.contains(&key) {
                    foreign.insert(key);
                }
            }
        }

        for el in doc.select_all("img") {
            let ctx = classifier.dom_context(&el);
            if !(ctx.in_review || ctx.in_promo) {
                continue;
            }
            let Some(url) = image_src(doc, &el).map(|u| normalizer.to_high_res(&u)) else {
                continue;
            };
            pass.apply(&url, classifier.classify_image(&url, &Evidence::Dom(ctx)));
        }
        dom_videos(doc, &classifier, &mut pass, None);

        for script in doc.scripts() {
            for hit in classifier.scan_script(script) {
                let is_image = !looks_like_video_url(&hit.url);
                let url = if is_image {
                    normalizer.to_high_res(&hit.url)
                } else {
                    hit.url.clone()
                };
                if hit.class == Classification::ProductImage
                    && foreign.contains(&normalizer.image_base(&url))
                {
                    continue;
                }
                pass.apply(&url, hit.class);
            }
        }

        pass.builder.variants(resolution.variants.clone());
        let superseded = pass
            .builder
            .selected_variant()
            .filter(|v| carousel_supersedes(v, &carousel))
            .map(|v| v.asin.clone());
        if let Some(asin) = superseded {
            pass.builder.set_variant_images(&asin, carousel);
        }

        if let Some(reviews) = reviews {
            for url in &reviews.images {
                pass.builder.push_review_image(url);
            }
            for url in &reviews.videos {
                pass.builder.push_review_video(url);
            }
        }

        pass.finish()
    }

    fn main_image(&self, doc: &PageDocument, pass: &mut Pass) -> Option<String> {
        let normalizer = Normalizer::new(self.rules);
        let classifier = Classifier::new(self.rules);
        for css in MAIN_IMAGE_SELECTORS {
            let Some(el) = doc.select_first(css) else {
                continue;
            };
            let value = el.value();
            let mut candidate = value
                .attr("data-old-hires")
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.to_string());
            if candidate.is_none() {
                if let Some(raw) = value.attr("data-a-dynamic-image") {
                    match serde_json::from_str::<Map<String, Value>>(raw) {
                        Ok(map) => candidate = largest_dynamic_image(&map),
                        Err(_) => pass.invalid_sources += 1,
                    }
                }
            }
            let candidate = candidate.or_else(|| image_src(doc, &el));
            let Some(raw) = candidate.and_then(|c| doc.resolve(&c)) else {
                continue;
            };
            let url = normalizer.to_high_res(&raw);
            match classifier.classify_image(&url, &Evidence::Dom(classifier.dom_context(&el))) {
                Classification::ProductImage => return Some(url),
                other => pass.apply(&url, other),
            }
        }
        None
    }

    fn scrape_listing(&self, doc: &PageDocument) -> ScrapeOutcome {
        let classifier = Classifier::new(self.rules);
        let normalizer = Normalizer::new(self.rules);
        let sponsored: Vec<scraper::Selector> = SPONSORED_LABEL_SELECTORS
            .iter()
            .filter_map(|css| scraper::Selector::parse(css).ok())
            .collect();
        let mut pass = Pass::new(PageType::Listing, &doc.url);

        for card in doc.select_all(LISTING_CARD_SELECTOR) {
            let Some(asin) = card
                .value()
                .attr("data-asin")
                .and_then(asin_from_attr)
                .filter(|a| is_valid_asin(a))
            else {
                continue;
            };
            let is_sponsored = classifier.dom_context(&card).in_promo
                || sponsored.iter().any(|s| card.select(s).next().is_some());
            if is_sponsored {
                pass.discarded += 1;
                continue;
            }
            let title = first_text(&card, &["h2 span", "h2", ".a-size-medium"]).unwrap_or_default();
            let image = first_element(&card, "img.s-image")
                .and_then(|img| image_src(doc, &img))
                .map(|u| normalizer.to_high_res(&u))
                .filter(|u| normalizer.is_valid_image(u));
            let price = first_text(&card, &[".a-price .a-offscreen", ".a-price"]);
            let rating = first_text(&card, &["span.a-icon-alt", "[aria-label*=\"out of 5\"]"])
                .and_then(|text| parse_rating(&text));
            pass.builder.listing_product(ListingProductSummary {
                asin,
                title: truncate_display(&title, self.limits.title_max_chars),
                image,
                price,
                rating,
            });
        }
        pass.finish()
    }
}

/// Media on one fetched review-listing page. Everything there counts as
/// review content; promotional exclusion still applies.
pub fn extract_review_media(rules: &CompiledRules, doc: &PageDocument) -> ReviewMedia {
    let classifier = Classifier::new(rules);
    let normalizer = Normalizer::new(rules);
    let mut pass = Pass::new(PageType::Product, &doc.url);

    for el in doc.select_all("img") {
        let ctx = classifier.dom_context(&el);
        if ctx.in_product_gallery || ctx.in_page_header {
            continue;
        }
        let Some(url) = image_src(doc, &el).map(|u| normalizer.to_high_res(&u)) else {
            continue;
        };
        let evidence = if ctx.in_promo {
            Evidence::Dom(ctx)
        } else {
            Evidence::ReviewPage
        };
        pass.apply(&url, classifier.classify_image(&url, &evidence));
    }
    dom_videos(doc, &classifier, &mut pass, Some(Evidence::ReviewPage));
    for script in doc.scripts() {
        for hit in classifier.scan_script(script) {
            let class = match hit.class {
                Classification::ProductImage => Classification::ReviewImage,
                Classification::ProductVideo => Classification::ReviewVideo,
                other => other,
            };
            let url = if looks_like_video_url(&hit.url) {
                hit.url.clone()
            } else {
                normalizer.to_high_res(&hit.url)
            };
            pass.apply(&url, class);
        }
    }

    let snapshot = pass.builder.build();
    ReviewMedia {
        images: snapshot.review_images().to_vec(),
        videos: snapshot.review_videos().to_vec(),
    }
}

struct Pass {
    builder: SnapshotBuilder,
    invalid_sources: usize,
    discarded: usize,
}

impl Pass {
    fn new(page_type: PageType, url: &str) -> Self {
        Self {
            builder: SnapshotBuilder::new(page_type, url),
            invalid_sources: 0,
            discarded: 0,
        }
    }

    fn apply(&mut self, url: &str, class: Classification) {
        match class {
            Classification::ProductImage => {
                self.builder.push_product_image(url);
            }
            Classification::ReviewImage => {
                self.builder.push_review_image(url);
            }
            Classification::ProductVideo => {
                self.builder.push_video(url);
            }
            Classification::ReviewVideo => {
                self.builder.push_review_video(url);
            }
            Classification::Discard(DiscardReason::Promotional) => {
                let kind = if looks_like_video_url(url) {
                    MediaKind::Video
                } else {
                    MediaKind::Image
                };
                self.builder.discard(url, kind);
                self.discarded += 1;
            }
            Classification::Discard(DiscardReason::InvalidAsset) => self.discarded += 1,
        }
    }

    fn finish(self) -> ScrapeOutcome {
        ScrapeOutcome {
            snapshot: self.builder.build(),
            invalid_sources: self.invalid_sources,
            discarded: self.discarded,
        }
    }
}

fn dom_videos(
    doc: &PageDocument,
    classifier: &Classifier<'_>,
    pass: &mut Pass,
    forced: Option<Evidence<'_>>,
) {
    for css in VIDEO_SELECTORS {
        for el in doc.select_all(css) {
            let Some(url) = VIDEO_ATTRS
                .iter()
                .find_map(|attr| el.value().attr(attr))
                .and_then(|raw| doc.resolve(raw))
                .filter(|u| looks_like_video_url(u))
            else {
                continue;
            };
            let ctx = classifier.dom_context(&el);
            let evidence = match forced {
                Some(evidence) if !ctx.in_promo => evidence,
                _ => Evidence::Dom(ctx),
            };
            pass.apply(&url, classifier.classify_video(&url, &evidence));
        }
    }
}

fn image_src(doc: &PageDocument, el: &ElementRef<'_>) -> Option<String> {
    let value = el.value();
    ["data-old-hires", "data-a-hires", "src", "data-src"]
        .iter()
        .filter_map(|attr| value.attr(attr))
        .find(|v| !v.trim().is_empty() && !v.trim_start().starts_with("data:"))
        .and_then(|raw| doc.resolve(raw))
}

fn first_element<'a>(root: &ElementRef<'a>, css: &str) -> Option<ElementRef<'a>> {
    let selector = scraper::Selector::parse(css).ok()?;
    root.select(&selector).next()
}

fn first_text(root: &ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|css| {
        first_element(root, css)
            .map(|el| element_text(&el))
            .filter(|t| !t.is_empty())
    })
}

/// "4.5 out of 5 stars" and "4,5 von 5 Sternen" both give 4.5.
pub fn parse_rating(text: &str) -> Option<f32> {
    let caps = rating_re().captures(text)?;
    let value: f32 = caps.get(1)?.as_str().replace(',', ".").parse().ok()?;
    (0.0..=5.0).contains(&value).then_some(value)
}
