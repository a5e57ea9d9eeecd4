use crate::classify::Classifier;
use crate::models::Variant;
use crate::normalize::{MediaSet, Normalizer};
use crate::page::{
    asin_from_attr, asin_from_url, element_text, json_parse_payloads, values_after_key,
    PageDocument,
};
use crate::rules::CompiledRules;
use scraper::ElementRef;
use serde_json::{Map, Value};

const SWATCH_SELECTORS: &[&str] = &[
    "li[data-asin]",
    "li[data-defaultasin]",
    "#twister li",
    "#inline-twister-expander-content li",
    "[id^=\"variation_\"] li",
    "[data-csa-c-item-id]",
];

const NON_SWATCH_ANCESTORS: &[&str] = &[
    "[data-component-type=\"s-search-result\"]",
    ".a-carousel-card",
];

const SELECTED_CLASSES: &[&str] = &["swatchSelect", "a-button-selected", "selected"];
const UNAVAILABLE_CLASSES: &[&str] = &["swatchUnavailable", "a-button-unavailable"];

const NAME_PREFIXES: &[&str] = &["Click to select ", "Select "];

#[derive(Debug, Clone, Default)]
pub struct VariantResolution {
    pub variants: Vec<Variant>,
    pub initial_gallery: Vec<String>,
    pub canonical_asin: Option<String>,
    pub invalid_sources: usize,
}

impl VariantResolution {
    pub fn selected(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.selected)
    }
}

/// The carousel wins when it shows more images than the active variant's
/// stored gallery, since it includes lazily revealed thumbnails.
pub fn carousel_supersedes(variant: &Variant, carousel: &[String]) -> bool {
    variant.images.len() < carousel.len()
}

#[derive(Debug, Default)]
struct JsonSources {
    initial: Option<Vec<String>>,
    by_name: Vec<(String, Vec<String>)>,
    asin_names: Vec<(String, String)>,
    landing_name: Option<String>,
    invalid: usize,
}

#[derive(Debug, Clone)]
struct Swatch {
    asin: String,
    name: String,
    image: Option<String>,
    selected: bool,
    available: bool,
}

pub struct VariantResolver<'r> {
    rules: &'r CompiledRules,
}

impl<'r> VariantResolver<'r> {
    pub fn new(rules: &'r CompiledRules) -> Self {
        Self { rules }
    }

    pub fn resolve(&self, doc: &PageDocument) -> VariantResolution {
        let sources = self.json_sources(doc);
        let swatches = self.swatches(doc);
        let canonical = doc.canonical_asin();

        let mut variants: Vec<Variant> = swatches
            .iter()
            .map(|s| Variant {
                asin: s.asin.clone(),
                name: s.name.clone(),
                image: s.image.clone(),
                images: Vec::new(),
                available: s.available,
                selected: s.selected,
            })
            .collect();

        // Names for swatches without one, and variants with no swatch at all.
        for (asin, name) in &sources.asin_names {
            match variants.iter_mut().find(|v| &v.asin == asin) {
                Some(variant) if variant.name.is_empty() => variant.name = name.clone(),
                Some(_) => {}
                None => variants.push(Variant {
                    asin: asin.clone(),
                    name: name.clone(),
                    image: None,
                    images: Vec::new(),
                    available: true,
                    selected: false,
                }),
            }
        }

        for variant in &mut variants {
            if let Some(images) = match_gallery(&variant.name, &sources.by_name) {
                variant.images = images.to_vec();
            } else if let Some(thumb) = &variant.image {
                variant.images = vec![thumb.clone()];
            }
        }

        let initial_gallery = sources.initial.clone().unwrap_or_default();
        if let Some(idx) = pick_selected(&variants, canonical.as_deref(), &sources) {
            for (i, variant) in variants.iter_mut().enumerate() {
                variant.selected = i == idx;
            }
            if !initial_gallery.is_empty() {
                variants[idx].images = initial_gallery.clone();
            }
        } else {
            for variant in &mut variants {
                variant.selected = false;
            }
        }

        VariantResolution {
            variants,
            initial_gallery,
            canonical_asin: canonical,
            invalid_sources: sources.invalid,
        }
    }

    fn json_sources(&self, doc: &PageDocument) -> JsonSources {
        let mut sources = JsonSources::default();
        for script in doc.scripts() {
            // The image block's initial gallery uses single-quoted JS keys, so
            // it is located structurally rather than parsed as a whole.
            for block in values_after_key(script, "colorImages") {
                if let Some(raw) = values_after_key(block, "initial").first() {
                    match serde_json::from_str::<Vec<Value>>(raw) {
                        Ok(items) => {
                            if sources.initial.is_none() {
                                let gallery = self.gallery_from_items(&items);
                                if !gallery.is_empty() {
                                    sources.initial = Some(gallery);
                                }
                            }
                        }
                        Err(_) => sources.invalid += 1,
                    }
                }
            }

            let payloads = json_parse_payloads(script);
            if !payloads.is_empty() {
                for payload in payloads {
                    match serde_json::from_str::<Value>(&payload) {
                        Ok(value) => self.absorb(&value, &mut sources),
                        Err(_) => sources.invalid += 1,
                    }
                }
                continue;
            }

            for key in ["colorImages", "variantImages", "colorToAsin", "dimensionValuesDisplayData"] {
                for raw in values_after_key(script, key) {
                    if key == "colorImages" && !values_after_key(raw, "initial").is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(raw) {
                        Ok(value) => {
                            let mut wrapper = Map::new();
                            wrapper.insert(key.to_string(), value);
                            self.absorb(&Value::Object(wrapper), &mut sources);
                        }
                        Err(_) => sources.invalid += 1,
                    }
                }
            }
            if sources.landing_name.is_none() {
                sources.landing_name = landing_color_literal(script);
            }
        }
        sources
    }

    fn absorb(&self, value: &Value, sources: &mut JsonSources) {
        for key in ["colorImages", "variantImages"] {
            let Some(map) = value.get(key).and_then(Value::as_object) else {
                continue;
            };
            for (name, items) in map {
                let Some(items) = items.as_array() else {
                    continue;
                };
                let gallery = self.gallery_from_items(items);
                if gallery.is_empty() {
                    continue;
                }
                if name == "initial" {
                    if sources.initial.is_none() {
                        sources.initial = Some(gallery);
                    }
                } else if !sources.by_name.iter().any(|(n, _)| n == name) {
                    sources.by_name.push((name.clone(), gallery));
                }
            }
        }

        if let Some(map) = value.get("colorToAsin").and_then(Value::as_object) {
            for (name, entry) in map {
                let asin = entry
                    .get("asin")
                    .and_then(Value::as_str)
                    .or_else(|| entry.as_str())
                    .and_then(asin_from_attr);
                if let Some(asin) = asin {
                    push_asin_name(&mut sources.asin_names, asin, name.clone());
                }
            }
        }

        if let Some(map) = value
            .get("dimensionValuesDisplayData")
            .and_then(Value::as_object)
        {
            for (asin, names) in map {
                let Some(asin) = asin_from_attr(asin) else {
                    continue;
                };
                let name = match names {
                    Value::Array(parts) => parts
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" "),
                    Value::String(s) => s.clone(),
                    _ => continue,
                };
                if !name.trim().is_empty() {
                    push_asin_name(&mut sources.asin_names, asin, name.trim().to_string());
                }
            }
        }

        if sources.landing_name.is_none() {
            sources.landing_name = value
                .get("landingAsinColor")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
        }
    }

    /// High-res URLs from a colorImages item list: `hiRes`, then `large`,
    /// then the biggest `main` entry, then `thumb`. Plain strings work too.
    pub(crate) fn gallery_from_items(&self, items: &[Value]) -> Vec<String> {
        let normalizer = Normalizer::new(self.rules);
        let mut gallery = MediaSet::images();
        for item in items {
            let candidate = match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => ["hiRes", "large"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))
                    .map(|s| s.to_string())
                    .or_else(|| obj.get("main").and_then(Value::as_object).and_then(largest_dynamic_image))
                    .or_else(|| obj.get("thumb").and_then(Value::as_str).map(|s| s.to_string())),
                _ => None,
            };
            let Some(url) = candidate.filter(|u| !u.trim().is_empty()) else {
                continue;
            };
            let high = normalizer.to_high_res(&url);
            if normalizer.is_valid_image(&high) {
                gallery.insert(&high);
            }
        }
        gallery.into_vec()
    }

    fn swatches(&self, doc: &PageDocument) -> Vec<Swatch> {
        let classifier = Classifier::new(self.rules);
        let normalizer = Normalizer::new(self.rules);
        let excluded: Vec<scraper::Selector> = NON_SWATCH_ANCESTORS
            .iter()
            .filter_map(|css| scraper::Selector::parse(css).ok())
            .collect();

        let mut out: Vec<Swatch> = Vec::new();
        for css in SWATCH_SELECTORS {
            for el in doc.select_all(css) {
                let ctx = classifier.dom_context(&el);
                if ctx.in_promo || ctx.in_review {
                    continue;
                }
                if el
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|a| excluded.iter().any(|s| s.matches(&a)))
                {
                    continue;
                }
                let Some(asin) = swatch_asin(&el) else {
                    continue;
                };
                let image = el
                    .select(&img_selector())
                    .next()
                    .and_then(|img| {
                        img.value()
                            .attr("src")
                            .or_else(|| img.value().attr("data-src"))
                    })
                    .and_then(|src| doc.resolve(src))
                    .map(|src| normalizer.to_high_res(&src))
                    .filter(|src| normalizer.is_valid_image(src));
                let swatch = Swatch {
                    asin,
                    name: swatch_name(&el),
                    image,
                    selected: has_indicator(&el, SELECTED_CLASSES, is_selected_attr),
                    available: !has_indicator(&el, UNAVAILABLE_CLASSES, is_unavailable_attr),
                };
                merge_swatch(&mut out, swatch);
            }
        }
        out
    }
}

fn img_selector() -> scraper::Selector {
    scraper::Selector::parse("img").unwrap_or_else(|e| panic!("static selector img: {e}"))
}

fn merge_swatch(out: &mut Vec<Swatch>, swatch: Swatch) {
    match out.iter_mut().find(|s| s.asin == swatch.asin) {
        Some(existing) => {
            if existing.name.is_empty() {
                existing.name = swatch.name;
            }
            if existing.image.is_none() {
                existing.image = swatch.image;
            }
            existing.selected |= swatch.selected;
            existing.available &= swatch.available;
        }
        None => out.push(swatch),
    }
}

fn push_asin_name(out: &mut Vec<(String, String)>, asin: String, name: String) {
    if !out.iter().any(|(a, _)| a == &asin) {
        out.push((asin, name));
    }
}

fn swatch_asin(el: &ElementRef<'_>) -> Option<String> {
    let value = el.value();
    for attr in ["data-asin", "data-defaultasin", "data-csa-c-item-id"] {
        if let Some(asin) = value.attr(attr).and_then(asin_from_attr) {
            return Some(asin);
        }
    }
    if let Some(asin) = value.attr("data-dp-url").and_then(asin_from_url) {
        return Some(asin);
    }
    el.descendants()
        .filter_map(ElementRef::wrap)
        .find_map(|child| {
            let v = child.value();
            v.attr("data-csa-c-item-id")
                .and_then(asin_from_attr)
                .or_else(|| v.attr("data-dp-url").and_then(asin_from_url))
                .or_else(|| v.attr("href").and_then(asin_from_url))
        })
}

fn swatch_name(el: &ElementRef<'_>) -> String {
    let from_title = std::iter::once(*el)
        .chain(el.descendants().filter_map(ElementRef::wrap))
        .find_map(|node| node.value().attr("title").map(clean_name))
        .filter(|n| !n.is_empty());
    if let Some(name) = from_title {
        return name;
    }
    let from_alt = el
        .select(&img_selector())
        .find_map(|img| img.value().attr("alt").map(clean_name))
        .filter(|n| !n.is_empty());
    if let Some(name) = from_alt {
        return name;
    }
    clean_name(&element_text(el))
}

fn clean_name(raw: &str) -> String {
    let mut name = raw.trim();
    for prefix in NAME_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest.trim();
        }
    }
    name.to_string()
}

fn is_selected_attr(name: &str, value: &str) -> bool {
    matches!(name, "aria-checked" | "aria-selected" | "aria-pressed") && value == "true"
}

fn is_unavailable_attr(name: &str, value: &str) -> bool {
    (name == "aria-disabled" && value == "true") || (name == "data-dp-url" && value.is_empty())
}

fn has_indicator(
    el: &ElementRef<'_>,
    classes: &[&str],
    attr_check: fn(&str, &str) -> bool,
) -> bool {
    std::iter::once(*el)
        .chain(el.descendants().filter_map(ElementRef::wrap))
        .any(|node| {
            let value = node.value();
            value.classes().any(|c| classes.contains(&c))
                || value.attrs().any(|(name, v)| attr_check(name, v.trim()))
        })
}

fn match_gallery<'a>(name: &str, by_name: &'a [(String, Vec<String>)]) -> Option<&'a [String]> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    if let Some((_, images)) = by_name.iter().find(|(n, _)| n == name) {
        return Some(images);
    }
    let lower = name.to_lowercase();
    if let Some((_, images)) = by_name.iter().find(|(n, _)| n.to_lowercase() == lower) {
        return Some(images);
    }
    by_name
        .iter()
        .find(|(n, _)| {
            let other = n.trim().to_lowercase();
            !other.is_empty() && (other.contains(&lower) || lower.contains(&other))
        })
        .map(|(_, images)| images.as_slice())
}

fn pick_selected(
    variants: &[Variant],
    canonical: Option<&str>,
    sources: &JsonSources,
) -> Option<usize> {
    let candidates: Vec<usize> = variants
        .iter()
        .enumerate()
        .filter(|(_, v)| v.selected || Some(v.asin.as_str()) == canonical)
        .map(|(i, _)| i)
        .collect();
    match candidates.as_slice() {
        [only] => return Some(*only),
        [] => {}
        many => {
            if let Some(idx) = many
                .iter()
                .copied()
                .find(|&i| Some(variants[i].asin.as_str()) == canonical)
            {
                return Some(idx);
            }
            return many
                .iter()
                .copied()
                .find(|&i| !variants[i].images.is_empty())
                .or_else(|| variants.iter().position(|v| !v.images.is_empty()));
        }
    }
    let landing = sources.landing_name.as_deref()?;
    variants.iter().position(|v| v.name.eq_ignore_ascii_case(landing))
}

/// Largest entry of a `{url: [w, h]}` map, as used by `main` items and the
/// `data-a-dynamic-image` attribute.
pub(crate) fn largest_dynamic_image(map: &Map<String, Value>) -> Option<String> {
    map.iter()
        .map(|(url, dims)| {
            let area = dims
                .as_array()
                .map(|d| d.iter().filter_map(Value::as_u64).product::<u64>())
                .unwrap_or(0);
            (area, url)
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, url)| url.clone())
}

fn landing_color_literal(script: &str) -> Option<String> {
    for key in ["\"landingAsinColor\"", "'landingAsinColor'"] {
        let Some(pos) = script.find(key) else {
            continue;
        };
        let rest = script[pos + key.len()..].trim_start().strip_prefix(':')?.trim_start();
        let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let body = &rest[1..];
        let end = body.find(quote)?;
        let value = body[..end].trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}
