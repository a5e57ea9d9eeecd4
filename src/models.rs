use crate::normalize::{image_base, video_key, MediaSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Product,
    Listing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub asin: String,
    pub name: String,
    pub image: Option<String>,
    pub images: Vec<String>,
    pub available: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingProductSummary {
    pub asin: String,
    pub title: String,
    pub image: Option<String>,
    pub price: Option<String>,
    pub rating: Option<f32>,
}

/// One complete scrape result. Only `SnapshotBuilder` creates these, and
/// nothing mutates them afterwards; a rescrape produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    page_type: PageType,
    asin: String,
    title: String,
    description: String,
    source_url: String,
    active_image: Option<String>,
    product_images: Vec<String>,
    review_images: Vec<String>,
    videos: Vec<String>,
    review_videos: Vec<String>,
    variants: Vec<Variant>,
    variant_images: BTreeMap<String, Vec<String>>,
    variant_images_by_asin: BTreeMap<String, Vec<String>>,
    listing_products: Vec<ListingProductSummary>,
}

impl ProductSnapshot {
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn asin(&self) -> &str {
        &self.asin
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn active_image(&self) -> Option<&str> {
        self.active_image.as_deref()
    }

    pub fn product_images(&self) -> &[String] {
        &self.product_images
    }

    pub fn review_images(&self) -> &[String] {
        &self.review_images
    }

    pub fn videos(&self) -> &[String] {
        &self.videos
    }

    pub fn review_videos(&self) -> &[String] {
        &self.review_videos
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn variant(&self, asin: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.asin == asin)
    }

    pub fn selected_variant(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.selected)
    }

    pub fn variant_images(&self) -> &BTreeMap<String, Vec<String>> {
        &self.variant_images
    }

    pub fn variant_images_by_asin(&self) -> &BTreeMap<String, Vec<String>> {
        &self.variant_images_by_asin
    }

    pub fn listing_products(&self) -> &[ListingProductSummary] {
        &self.listing_products
    }

    pub fn media_count(&self) -> usize {
        self.product_images.len()
            + self.review_images.len()
            + self.videos.len()
            + self.review_videos.len()
            + self.listing_products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.media_count() == 0 && self.variants.is_empty()
    }

    /// Stable digest of the media lists; equal fingerprints mean a rescrape
    /// found nothing new to show.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.asin.as_bytes());
        for (label, list) in [
            ("p", &self.product_images),
            ("r", &self.review_images),
            ("v", &self.videos),
            ("rv", &self.review_videos),
        ] {
            hasher.update(label.as_bytes());
            for url in list {
                hasher.update(url.as_bytes());
                hasher.update([0u8]);
            }
        }
        for variant in &self.variants {
            hasher.update(variant.asin.as_bytes());
            hasher.update([variant.selected as u8, variant.available as u8]);
            hasher.update((variant.images.len() as u64).to_le_bytes());
        }
        for item in &self.listing_products {
            hasher.update(item.asin.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    page_type: PageType,
    source_url: String,
    asin: String,
    title: String,
    description: String,
    active_image: Option<String>,
    product_images: MediaSet,
    review_images: MediaSet,
    videos: MediaSet,
    review_videos: MediaSet,
    discarded: HashSet<String>,
    variants: Vec<Variant>,
    listing_products: Vec<ListingProductSummary>,
}

impl SnapshotBuilder {
    pub fn new(page_type: PageType, source_url: &str) -> Self {
        Self {
            page_type,
            source_url: source_url.to_string(),
            asin: String::new(),
            title: String::new(),
            description: String::new(),
            active_image: None,
            product_images: MediaSet::images(),
            review_images: MediaSet::images(),
            videos: MediaSet::videos(),
            review_videos: MediaSet::videos(),
            discarded: HashSet::new(),
            variants: Vec::new(),
            listing_products: Vec::new(),
        }
    }

    pub fn asin(&mut self, asin: &str) -> &mut Self {
        self.asin = asin.to_string();
        self
    }

    pub fn title(&mut self, title: &str, max_chars: usize) -> &mut Self {
        self.title = truncate_display(title, max_chars);
        self
    }

    pub fn description(&mut self, description: &str, max_chars: usize) -> &mut Self {
        self.description = truncate_display(description, max_chars);
        self
    }

    pub fn active_image(&mut self, url: &str) -> &mut Self {
        if !self.is_discarded_image(url) {
            self.active_image = Some(url.to_string());
        }
        self
    }

    /// Promotional items are terminal: once discarded, later discoveries of
    /// the same asset in this pass are dropped.
    pub fn discard(&mut self, url: &str, kind: MediaKind) {
        self.discarded.insert(discard_key(url, kind));
    }

    fn is_discarded_image(&self, url: &str) -> bool {
        self.discarded.contains(&discard_key(url, MediaKind::Image))
    }

    fn is_discarded_video(&self, url: &str) -> bool {
        self.discarded.contains(&discard_key(url, MediaKind::Video))
    }

    pub fn push_product_image(&mut self, url: &str) -> bool {
        if self.is_discarded_image(url) {
            return false;
        }
        self.product_images.insert(url)
    }

    pub fn push_review_image(&mut self, url: &str) -> bool {
        if self.is_discarded_image(url) || self.product_images.contains(url) {
            return false;
        }
        self.review_images.insert(url)
    }

    pub fn push_video(&mut self, url: &str) -> bool {
        if self.is_discarded_video(url) || self.review_videos.contains(url) {
            return false;
        }
        self.videos.insert(url)
    }

    pub fn push_review_video(&mut self, url: &str) -> bool {
        if self.is_discarded_video(url) || self.videos.contains(url) {
            return false;
        }
        self.review_videos.insert(url)
    }

    pub fn product_images(&self) -> &[String] {
        self.product_images.as_slice()
    }

    pub fn variants(&mut self, variants: Vec<Variant>) -> &mut Self {
        self.variants = variants;
        self
    }

    pub fn set_variant_images(&mut self, asin: &str, images: Vec<String>) -> bool {
        match self.variants.iter_mut().find(|v| v.asin == asin) {
            Some(variant) => {
                variant.images = images;
                true
            }
            None => false,
        }
    }

    pub fn selected_variant(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.selected)
    }

    pub fn listing_product(&mut self, item: ListingProductSummary) -> &mut Self {
        if !self.listing_products.iter().any(|p| p.asin == item.asin) {
            self.listing_products.push(item);
        }
        self
    }

    pub fn build(mut self) -> ProductSnapshot {
        if let Some(active) = self.active_image.clone() {
            self.product_images.insert_front(&active);
        }

        let product_keys: HashSet<String> = self
            .product_images
            .as_slice()
            .iter()
            .map(|u| image_base(u))
            .collect();
        // A discard can arrive after an item was already accepted from a
        // weaker source; it still wins. Product images are exempt, they only
        // come from gallery sources.
        let discarded = &self.discarded;
        let review_images: Vec<String> = self
            .review_images
            .into_vec()
            .into_iter()
            .filter(|u| !product_keys.contains(&image_base(u)))
            .filter(|u| !discarded.contains(&discard_key(u, MediaKind::Image)))
            .collect();
        let videos: Vec<String> = self
            .videos
            .into_vec()
            .into_iter()
            .filter(|u| !discarded.contains(&discard_key(u, MediaKind::Video)))
            .collect();
        let review_videos: Vec<String> = self
            .review_videos
            .into_vec()
            .into_iter()
            .filter(|u| !discarded.contains(&discard_key(u, MediaKind::Video)))
            .collect();

        let mut seen_selected = false;
        let mut seen_asins = HashSet::new();
        let mut variants = Vec::with_capacity(self.variants.len());
        for mut variant in self.variants {
            if !seen_asins.insert(variant.asin.clone()) {
                continue;
            }
            if variant.selected {
                if seen_selected {
                    variant.selected = false;
                }
                seen_selected = true;
            }
            variants.push(variant);
        }

        let mut variant_images = BTreeMap::new();
        let mut variant_images_by_asin = BTreeMap::new();
        for variant in &variants {
            if variant.images.is_empty() {
                continue;
            }
            if !variant.name.is_empty() {
                variant_images
                    .entry(variant.name.clone())
                    .or_insert_with(|| variant.images.clone());
            }
            variant_images_by_asin.insert(variant.asin.clone(), variant.images.clone());
        }

        ProductSnapshot {
            page_type: self.page_type,
            asin: self.asin,
            title: self.title,
            description: self.description,
            source_url: self.source_url,
            active_image: self.active_image,
            product_images: self.product_images.into_vec(),
            review_images,
            videos,
            review_videos,
            variants,
            variant_images,
            variant_images_by_asin,
            listing_products: self.listing_products,
        }
    }
}

fn discard_key(url: &str, kind: MediaKind) -> String {
    match kind {
        MediaKind::Image => format!("i:{}", image_base(url)),
        MediaKind::Video => format!("v:{}", video_key(url)),
    }
}

pub fn truncate_display(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out = out.trim_end().to_string();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(id: &str, suffix: &str) -> String {
        format!("https://m.media-amazon.com/images/I/{id}{suffix}.jpg")
    }

    fn variant(asin: &str, name: &str, images: Vec<String>, selected: bool) -> Variant {
        Variant {
            asin: asin.to_string(),
            name: name.to_string(),
            image: None,
            images,
            available: true,
            selected,
        }
    }

    #[test]
    fn active_image_is_always_first_product_image() {
        let mut builder = SnapshotBuilder::new(PageType::Product, "https://www.amazon.com/dp/B000000001");
        builder.push_product_image(&img("A1", ""));
        builder.push_product_image(&img("B2", ""));
        builder.active_image(&img("B2", ""));
        let snap = builder.build();
        assert_eq!(snap.product_images(), &[img("B2", ""), img("A1", "")]);
        assert_eq!(snap.active_image(), Some(img("B2", "").as_str()));
    }

    #[test]
    fn discarded_assets_never_enter_later_lists() {
        let mut builder = SnapshotBuilder::new(PageType::Product, "u");
        builder.discard(&img("AD", "._SL500_"), MediaKind::Image);
        assert!(!builder.push_product_image(&img("AD", "")));
        assert!(!builder.push_review_image(&img("AD", "._SY88")));
        builder.active_image(&img("AD", ""));
        let snap = builder.build();
        assert!(snap.product_images().is_empty());
        assert!(snap.review_images().is_empty());
        assert!(snap.active_image().is_none());
    }

    #[test]
    fn build_keeps_one_selected_variant_and_unique_asins() {
        let mut builder = SnapshotBuilder::new(PageType::Product, "u");
        builder.variants(vec![
            variant("B000000001", "Red", vec![img("R", "")], true),
            variant("B000000002", "Blue", vec![img("U", "")], true),
            variant("B000000001", "Red again", vec![], false),
        ]);
        let snap = builder.build();
        assert_eq!(snap.variants().len(), 2);
        assert_eq!(snap.variants().iter().filter(|v| v.selected).count(), 1);
        assert_eq!(snap.selected_variant().map(|v| v.asin.as_str()), Some("B000000001"));
    }

    #[test]
    fn variant_indices_follow_gallery_updates() {
        let mut builder = SnapshotBuilder::new(PageType::Product, "u");
        builder.variants(vec![variant("B000000001", "Red", vec![img("R", "")], true)]);
        assert!(builder.set_variant_images("B000000001", vec![img("R", ""), img("S", "")]));
        let snap = builder.build();
        assert_eq!(snap.variant_images()["Red"].len(), 2);
        assert_eq!(snap.variant_images_by_asin()["B000000001"].len(), 2);
    }

    #[test]
    fn review_images_never_duplicate_product_images() {
        let mut builder = SnapshotBuilder::new(PageType::Product, "u");
        builder.push_review_image(&img("X", "._SY88"));
        builder.push_product_image(&img("X", "._AC_SL1500_"));
        let snap = builder.build();
        assert_eq!(snap.product_images().len(), 1);
        assert!(snap.review_images().is_empty());
    }

    #[test]
    fn discard_after_acceptance_still_removes_review_media() {
        let mut builder = SnapshotBuilder::new(PageType::Product, "u");
        builder.push_review_image(&img("R", "._SY88"));
        builder.push_review_video("https://v.example/clip.mp4?t=1");
        builder.push_product_image(&img("P", ""));
        builder.discard(&img("R", "._SL500_"), MediaKind::Image);
        builder.discard("https://v.example/clip.mp4", MediaKind::Video);
        builder.discard(&img("P", ""), MediaKind::Image);
        let snap = builder.build();
        assert!(snap.review_images().is_empty());
        assert!(snap.review_videos().is_empty());
        // Gallery images are authoritative and stay.
        assert_eq!(snap.product_images().len(), 1);
    }

    #[test]
    fn fingerprint_changes_with_media() {
        let mut a = SnapshotBuilder::new(PageType::Product, "u");
        a.push_product_image(&img("A", ""));
        let mut b = a.clone();
        b.push_review_image(&img("C", ""));
        assert_ne!(a.build().fingerprint(), b.build().fingerprint());
    }

    #[test]
    fn truncate_display_respects_char_boundaries() {
        assert_eq!(truncate_display("  short ", 10), "short");
        let long = "é".repeat(20);
        let out = truncate_display(&long, 5);
        assert_eq!(out.chars().count(), 5);
        assert!(out.ends_with('…'));
    }
}
