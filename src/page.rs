use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use url::Url;

use crate::models::PageType;

/// Raw page content as captured from the host. Unlike the parsed document
/// this is `Send`, so it can cross into background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSource {
    pub url: String,
    pub html: String,
}

impl PageSource {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }
}

fn asin_in_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/(?:dp|gp/product|gp/aw/d|product-reviews|exec/obidos/ASIN)/([A-Z0-9]{10})(?:[/?#]|$)")
            .expect("asin path regex")
    })
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("static selector {css}: {e}"))
}

pub fn is_valid_asin(value: &str) -> bool {
    value.len() == 10 && value.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
}

pub fn asin_from_url(url: &str) -> Option<String> {
    asin_in_path_re()
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn asin_from_attr(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let candidate = trimmed.rsplit('.').next().unwrap_or(trimmed);
    if is_valid_asin(candidate) {
        Some(candidate.to_string())
    } else {
        asin_from_url(trimmed)
    }
}

pub struct PageDocument {
    pub url: String,
    pub base_url: Option<Url>,
    pub html: Html,
    scripts: Vec<String>,
}

impl PageDocument {
    pub fn parse(source: &PageSource) -> Self {
        Self::parse_html(&source.url, &source.html)
    }

    pub fn parse_html(url: &str, html: &str) -> Self {
        let html = Html::parse_document(html);
        let script_sel = selector("script");
        let scripts = html
            .select(&script_sel)
            .map(|el| el.text().collect::<String>())
            .filter(|text| !text.trim().is_empty())
            .collect();
        Self {
            url: url.to_string(),
            base_url: Url::parse(url).ok(),
            html,
            scripts,
        }
    }

    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    pub fn select_first(&self, css: &str) -> Option<ElementRef<'_>> {
        self.html.select(&selector(css)).next()
    }

    pub fn select_all(&self, css: &str) -> Vec<ElementRef<'_>> {
        self.html.select(&selector(css)).collect()
    }

    /// ASIN from the hidden form field; it tracks JS-driven variant switches
    /// before the address bar does.
    pub fn hidden_asin(&self) -> Option<String> {
        for css in ["input#ASIN", "input[name=\"ASIN\"]", "input[name=\"asin\"]"] {
            if let Some(value) = self
                .select_first(css)
                .and_then(|el| el.value().attr("value"))
                .map(str::trim)
                .filter(|v| is_valid_asin(v))
            {
                return Some(value.to_string());
            }
        }
        None
    }

    pub fn canonical_asin(&self) -> Option<String> {
        if let Some(asin) = self.hidden_asin() {
            return Some(asin);
        }
        if let Some(asin) = asin_from_url(&self.url) {
            return Some(asin);
        }
        self.select_first("link[rel=\"canonical\"]")
            .and_then(|el| el.value().attr("href"))
            .and_then(asin_from_url)
    }

    pub fn page_type(&self) -> Option<PageType> {
        if self
            .select_first("[data-component-type=\"s-search-result\"]")
            .is_some()
        {
            return Some(PageType::Listing);
        }
        let product_markers = ["#productTitle", "#dp", "#imageBlock", "#landingImage", "#ppd"];
        if self.canonical_asin().is_some()
            || product_markers.iter().any(|css| self.select_first(css).is_some())
        {
            return Some(PageType::Product);
        }
        None
    }

    pub fn title(&self) -> String {
        for css in ["#productTitle", "#title", "#ebooksProductTitle"] {
            if let Some(text) = self
                .select_first(css)
                .map(|el| element_text(&el))
                .filter(|t| !t.is_empty())
            {
                return text;
            }
        }
        if let Some(content) = self
            .select_first("meta[name=\"title\"]")
            .and_then(|el| el.value().attr("content"))
            .map(collapse_whitespace)
            .filter(|t| !t.is_empty())
        {
            return content;
        }
        self.select_first("title")
            .map(|el| element_text(&el))
            .unwrap_or_default()
    }

    pub fn description(&self) -> String {
        let bullets: Vec<String> = self
            .select_all("#feature-bullets li span.a-list-item, #feature-bullets li")
            .iter()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect();
        if !bullets.is_empty() {
            let mut unique: Vec<String> = Vec::new();
            for bullet in bullets {
                if !unique.iter().any(|u| u.contains(&bullet) || bullet.contains(u.as_str())) {
                    unique.push(bullet);
                }
            }
            return unique.join(" ");
        }
        if let Some(text) = self
            .select_first("#productDescription")
            .map(|el| element_text(&el))
            .filter(|t| !t.is_empty())
        {
            return text;
        }
        self.select_first("meta[name=\"description\"]")
            .and_then(|el| el.value().attr("content"))
            .map(collapse_whitespace)
            .unwrap_or_default()
    }

    pub fn host(&self) -> Option<String> {
        self.base_url
            .as_ref()
            .and_then(|u| u.host_str())
            .map(|h| h.to_ascii_lowercase())
    }

    pub fn resolve(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") || raw.starts_with("javascript:") {
            return None;
        }
        if let Some(rest) = raw.strip_prefix("//") {
            return Some(format!("https://{rest}"));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(raw.to_string());
        }
        let mut joined = self.base_url.as_ref()?.join(raw).ok()?;
        joined.set_fragment(None);
        Some(joined.to_string())
    }
}

pub fn element_text(el: &ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Return the balanced `{...}` or `[...]` starting at `open`, skipping
/// brackets inside string literals of either quote style.
pub fn extract_balanced(text: &str, open: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let first = *bytes.get(open)?;
    if first != b'{' && first != b'[' {
        return None;
    }

    let mut depth = 0_i32;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => in_string = Some(b),
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return text.get(open..open + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every balanced value that follows `key` (quoted with `"` or `'`) and a
/// colon. Keys without an object/array value are skipped.
pub fn values_after_key<'t>(text: &'t str, key: &str) -> Vec<&'t str> {
    let mut out = Vec::new();
    for quoted in [format!("\"{key}\""), format!("'{key}'")] {
        let mut search_from = 0;
        while let Some(pos) = text[search_from..].find(&quoted) {
            let after_key = search_from + pos + quoted.len();
            search_from = after_key;
            let rest = &text[after_key..];
            let trimmed = rest.trim_start();
            let Some(after_colon) = trimmed.strip_prefix(':') else {
                continue;
            };
            let value = after_colon.trim_start();
            let open = text.len() - value.len();
            if let Some(balanced) = extract_balanced(text, open) {
                out.push(balanced);
            }
        }
    }
    out
}

/// Payloads of `jQuery.parseJSON('...')` / `JSON.parse('...')` calls,
/// unescaped from their single-quoted JS literal form.
pub fn json_parse_payloads(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    for marker in ["parseJSON('", "JSON.parse('"] {
        let mut search_from = 0;
        while let Some(pos) = script[search_from..].find(marker) {
            let start = search_from + pos + marker.len();
            let Some(len) = single_quoted_len(&script[start..]) else {
                break;
            };
            out.push(unescape_js_single_quoted(&script[start..start + len]));
            search_from = start + len;
        }
    }
    out
}

fn single_quoted_len(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '\'' => return Some(idx),
            _ => {}
        }
    }
    None
}

fn unescape_js_single_quoted(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('/') => out.push('/'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
