use crate::rules::{any_marker, CompiledRules};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

const MAX_SUFFIX_PASSES: usize = 6;

fn core_id_re() -> &'static Regex {
    static CORE_ID_RE: OnceLock<Regex> = OnceLock::new();
    CORE_ID_RE.get_or_init(|| {
        Regex::new(r"/images/I/([A-Za-z0-9%+\-]+)").expect("core id regex")
    })
}

fn builtin_rules() -> &'static CompiledRules {
    static RULES: OnceLock<CompiledRules> = OnceLock::new();
    RULES.get_or_init(CompiledRules::builtin)
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'r> {
    rules: &'r CompiledRules,
}

impl<'r> Normalizer<'r> {
    pub fn new(rules: &'r CompiledRules) -> Self {
        Self { rules }
    }

    pub fn to_high_res(&self, url: &str) -> String {
        let mut current = absolutize(url.trim());
        for _ in 0..MAX_SUFFIX_PASSES {
            let mut next = current.clone();
            for re in &self.rules.size_suffixes {
                next = re.replace_all(&next, ".").into_owned();
            }
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Dedup key for images: the core id, or the high-res URL without query.
    pub fn image_base(&self, url: &str) -> String {
        if let Some(id) = core_image_id(url) {
            return id;
        }
        strip_query(&self.to_high_res(url))
    }

    pub fn is_valid_image(&self, url: &str) -> bool {
        let url = absolutize(url.trim());
        let lower = url.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return false;
        }
        let path_lower = strip_query(&lower);
        if path_lower.ends_with(".svg") {
            return false;
        }
        !any_marker(
            &marker_haystack(&url),
            &self.rules.table.invalid_image_markers,
        )
    }
}

pub fn to_high_res(url: &str) -> String {
    Normalizer::new(builtin_rules()).to_high_res(url)
}

pub fn image_base(url: &str) -> String {
    Normalizer::new(builtin_rules()).image_base(url)
}

pub fn is_valid_image(url: &str) -> bool {
    Normalizer::new(builtin_rules()).is_valid_image(url)
}

pub fn core_image_id(url: &str) -> Option<String> {
    core_id_re()
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
}

/// Identity key for videos: path without query or fragment, since signed
/// tokens in the query vary per request.
pub fn video_key(url: &str) -> String {
    let url = absolutize(url.trim());
    match Url::parse(&url) {
        Ok(parsed) => format!(
            "{}://{}{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or(""),
            parsed.path()
        ),
        Err(_) => strip_query(&url),
    }
}

/// Lowercased URL with the core image id removed, so marker matching never
/// fires on random characters of an asset id.
pub fn marker_haystack(url: &str) -> String {
    let lowered = match core_image_id(url) {
        Some(id) => url.replacen(&id, "", 1),
        None => url.to_string(),
    };
    lowered.to_ascii_lowercase()
}

pub fn absolutize(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

pub fn strip_query(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}

pub fn looks_like_video_url(url: &str) -> bool {
    let path = strip_query(url).to_ascii_lowercase();
    path.ends_with(".mp4") || path.ends_with(".m3u8") || path.ends_with(".webm")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Image,
    Video,
}

/// Insertion-ordered URL list deduplicated by image core id or video key.
#[derive(Debug, Clone)]
pub struct MediaSet {
    kind: KeyKind,
    urls: Vec<String>,
    keys: HashSet<String>,
}

impl MediaSet {
    pub fn images() -> Self {
        Self::new(KeyKind::Image)
    }

    pub fn videos() -> Self {
        Self::new(KeyKind::Video)
    }

    fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            urls: Vec::new(),
            keys: HashSet::new(),
        }
    }

    pub fn key_of(&self, url: &str) -> String {
        match self.kind {
            KeyKind::Image => image_base(url),
            KeyKind::Video => video_key(url),
        }
    }

    pub fn insert(&mut self, url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() {
            return false;
        }
        if !self.keys.insert(self.key_of(url)) {
            return false;
        }
        self.urls.push(url.to_string());
        true
    }

    pub fn insert_front(&mut self, url: &str) {
        let key = self.key_of(url);
        if self.keys.contains(&key) {
            let kind = self.kind;
            self.urls.retain(|existing| match kind {
                KeyKind::Image => image_base(existing) != key,
                KeyKind::Video => video_key(existing) != key,
            });
        }
        self.keys.insert(key);
        self.urls.insert(0, url.to_string());
    }

    pub fn contains(&self, url: &str) -> bool {
        self.keys.contains(&self.key_of(url))
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.urls
    }

    pub fn into_vec(self) -> Vec<String> {
        self.urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://m.media-amazon.com/images/I/71AbCdEf12L";

    #[test]
    fn size_suffixes_collapse_to_same_base() {
        let urls = [
            format!("{BASE}._AC_SL1500_.jpg"),
            format!("{BASE}._SS40_.jpg"),
            format!("{BASE}._SX38_SY50_CR,0,0,38,50_.jpg"),
            format!("{BASE}._AC_UL320_QL65_.jpg"),
            format!("{BASE}._SY88.jpg"),
            format!("{BASE}.jpg"),
        ];
        for url in &urls {
            assert_eq!(image_base(url), "71AbCdEf12L", "url={url}");
            assert_eq!(to_high_res(url), format!("{BASE}.jpg"), "url={url}");
        }
    }

    #[test]
    fn to_high_res_is_idempotent() {
        let once = to_high_res(&format!("{BASE}._AC_SL1500_.jpg"));
        assert_eq!(to_high_res(&once), once);
    }

    #[test]
    fn stacked_suffixes_are_all_removed() {
        let url = format!("{BASE}._AC_._SL1500_.jpg");
        assert_eq!(to_high_res(&url), format!("{BASE}.jpg"));
    }

    #[test]
    fn unmatched_urls_pass_through() {
        assert_eq!(to_high_res("not a url"), "not a url");
        assert_eq!(
            to_high_res("https://example.com/a/b.png"),
            "https://example.com/a/b.png"
        );
        assert_eq!(
            image_base("https://example.com/a/b.png?x=1"),
            "https://example.com/a/b.png"
        );
    }

    #[test]
    fn protocol_relative_urls_are_absolutized() {
        assert_eq!(
            to_high_res("//m.media-amazon.com/images/I/41x._SS40_.jpg"),
            "https://m.media-amazon.com/images/I/41x.jpg"
        );
    }

    #[test]
    fn denylist_rejects_chrome_and_svg() {
        assert!(is_valid_image(&format!("{BASE}._AC_SL1500_.jpg")));
        assert!(!is_valid_image(
            "https://m.media-amazon.com/images/G/01/nav2/images/gui/sprite.png"
        ));
        assert!(!is_valid_image(
            "https://images-na.ssl-images-amazon.com/images/S/amazon-avatars-global/default.png"
        ));
        assert!(!is_valid_image("https://m.media-amazon.com/images/I/x.svg"));
        assert!(!is_valid_image("data:image/gif;base64,R0lGOD"));
        assert!(!is_valid_image(""));
    }

    #[test]
    fn markers_ignore_core_id_characters() {
        // "icon" inside the asset id must not trigger the denylist.
        let url = "https://m.media-amazon.com/images/I/61iconXyZ1L._AC_SX679_.jpg";
        assert!(is_valid_image(url));
    }

    #[test]
    fn video_key_drops_query() {
        let a = "https://m.media-amazon.com/images/S/vse-vms/abc/video.mp4?token=1";
        let b = "https://m.media-amazon.com/images/S/vse-vms/abc/video.mp4?token=2";
        assert_eq!(video_key(a), video_key(b));
        assert_eq!(
            video_key(a),
            "https://m.media-amazon.com/images/S/vse-vms/abc/video.mp4"
        );
    }

    #[test]
    fn media_set_dedupes_by_core_id() {
        let mut set = MediaSet::images();
        assert!(set.insert(&format!("{BASE}._AC_SL1500_.jpg")));
        assert!(!set.insert(&format!("{BASE}._SS40_.jpg")));
        assert!(set.insert("https://m.media-amazon.com/images/I/81Other.jpg"));
        assert_eq!(set.len(), 2);

        set.insert_front("https://m.media-amazon.com/images/I/81Other._SL500_.jpg");
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.as_slice()[0],
            "https://m.media-amazon.com/images/I/81Other._SL500_.jpg"
        );
    }
}
