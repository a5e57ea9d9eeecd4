use crate::models::{PageType, ProductSnapshot};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use url::Url;

const MAX_ARCHIVE_STEM_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveLayout {
    #[default]
    Flat,
    Structured,
}

/// Which parts of a snapshot go into the archive. A non-empty `only` list
/// restricts every group to those URLs (the panel's checkbox selection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSelection {
    pub product_images: bool,
    pub review_images: bool,
    pub videos: bool,
    pub review_videos: bool,
    pub variant_images: bool,
    pub only: Vec<String>,
}

impl Default for MediaSelection {
    fn default() -> Self {
        Self {
            product_images: true,
            review_images: true,
            videos: true,
            review_videos: true,
            variant_images: false,
            only: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub archive_name: String,
    pub layout: ArchiveLayout,
    pub entries: Vec<DownloadEntry>,
}

impl DownloadRequest {
    pub fn urls(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.url.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn build_download_request(
    snapshot: &ProductSnapshot,
    selection: &MediaSelection,
    layout: ArchiveLayout,
) -> DownloadRequest {
    let only: HashSet<&str> = selection.only.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();

    let mut add_group = |folder: &str, urls: &[String], fallback_ext: &str| {
        let mut n = 0;
        for url in urls {
            if !only.is_empty() && !only.contains(url.as_str()) {
                continue;
            }
            if !seen.insert(url.clone()) {
                continue;
            }
            n += 1;
            let filename = match layout {
                ArchiveLayout::Flat => None,
                ArchiveLayout::Structured => Some(format!(
                    "{folder}/{n:02}.{}",
                    extension_of(url).unwrap_or_else(|| fallback_ext.to_string())
                )),
            };
            entries.push(DownloadEntry {
                url: url.clone(),
                filename,
            });
        }
    };

    if selection.product_images {
        add_group("product", snapshot.product_images(), "jpg");
    }
    if selection.variant_images {
        for variant in snapshot.variants() {
            if variant.images.is_empty() {
                continue;
            }
            let label = sanitize_name(&variant.name);
            let folder = if label.is_empty() {
                format!("variants/{}", variant.asin.to_ascii_lowercase())
            } else {
                format!("variants/{label}_{}", variant.asin.to_ascii_lowercase())
            };
            add_group(&folder, &variant.images, "jpg");
        }
    }
    if selection.videos {
        add_group("videos", snapshot.videos(), "mp4");
    }
    if selection.review_images {
        add_group("reviews", snapshot.review_images(), "jpg");
    }
    if selection.review_videos {
        add_group("review_videos", snapshot.review_videos(), "mp4");
    }
    if snapshot.page_type() == PageType::Listing && selection.product_images {
        let images: Vec<String> = snapshot
            .listing_products()
            .iter()
            .filter_map(|p| p.image.clone())
            .collect();
        add_group("listing", &images, "jpg");
    }

    DownloadRequest {
        archive_name: archive_name(snapshot),
        layout,
        entries,
    }
}

pub fn archive_name(snapshot: &ProductSnapshot) -> String {
    let title: String = snapshot.title().chars().take(MAX_ARCHIVE_STEM_CHARS).collect();
    let title = sanitize_name(&title);
    let asin = snapshot.asin().to_ascii_lowercase();
    let stem = match (title.is_empty(), asin.is_empty()) {
        (false, false) => format!("{title}_{asin}"),
        (false, true) => title,
        (true, false) => asin,
        (true, true) => "amazon_media".to_string(),
    };
    format!("{stem}.zip")
}

/// Write `url,filename` rows for the archive builder. Returns the row count.
pub fn write_manifest(path: &Path, request: &DownloadRequest) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["url", "filename"])?;
    for entry in &request.entries {
        writer.write_record([entry.url.as_str(), entry.filename.as_deref().unwrap_or("")])?;
    }
    writer.flush()?;
    Ok(request.entries.len())
}

fn extension_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?.to_string();
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

fn sanitize_name(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches(|ch| ch == '.' || ch == '_').to_string()
}
