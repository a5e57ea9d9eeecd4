use crate::models::MediaKind;
use crate::observer::ChangeNotification;
use crate::page::{is_valid_asin, PageDocument, PageSource};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use url::Url;

pub trait PageHost: Send + Sync {
    /// Current page content. `EngineError::NoActiveContext` once the page is gone.
    fn current_page(&self) -> Result<PageSource>;

    fn click(&self, selector: &str) -> Result<bool>;

    fn navigate(&self, url: &str) -> Result<()>;
}

pub trait PanelBridge: Send + Sync {
    fn notify(&self, notification: &ChangeNotification) -> Result<()>;

    fn show_preview(&self, request: &PreviewRequest) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub url: String,
    pub media_type: MediaKind,
    pub all_urls: Vec<String>,
    pub index: usize,
}

impl PreviewRequest {
    pub fn new(url: &str, media_type: MediaKind, all_urls: &[String]) -> Self {
        let mut all: Vec<String> = all_urls.to_vec();
        let index = match all.iter().position(|u| u == url) {
            Some(idx) => idx,
            None => {
                all.insert(0, url.to_string());
                0
            }
        };
        Self {
            url: url.to_string(),
            media_type,
            all_urls: all,
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantSwitch {
    Clicked,
    Navigated { url: String },
}

/// Canonical variant URL on the page's own host: `/dp/<ASIN>?th=1&psc=1`.
pub fn variant_url(page_url: &str, asin: &str) -> Result<String> {
    if !is_valid_asin(asin) {
        return Err(EngineError::InvalidUrl(format!("not an ASIN: {asin}")));
    }
    let mut url = Url::parse(page_url).map_err(|e| EngineError::InvalidUrl(format!("{page_url}: {e}")))?;
    if url.host_str().is_none() {
        return Err(EngineError::InvalidUrl(page_url.to_string()));
    }
    url.set_path(&format!("/dp/{asin}"));
    url.set_query(Some("th=1&psc=1"));
    url.set_fragment(None);
    Ok(url.to_string())
}

pub fn swatch_selectors(asin: &str) -> Vec<String> {
    vec![
        format!("li[data-asin=\"{asin}\"]"),
        format!("li[data-defaultasin=\"{asin}\"]"),
        format!("[data-csa-c-item-id=\"amzn1.asin.{asin}\"]"),
        format!("#twister a[href*=\"/dp/{asin}\"]"),
        format!("#inline-twister-expander-content a[href*=\"/dp/{asin}\"]"),
    ]
}

/// The first swatch selector for `asin` that matches an interactive element
/// on the page. Unavailable swatches are usually inert, so they don't count.
pub fn interactive_swatch(doc: &PageDocument, asin: &str) -> Option<String> {
    for css in swatch_selectors(asin) {
        let Ok(selector) = scraper::Selector::parse(&css) else {
            continue;
        };
        let Some(el) = doc.html.select(&selector).next() else {
            continue;
        };
        let value = el.value();
        let inert = value
            .classes()
            .any(|c| c == "swatchUnavailable" || c == "a-button-unavailable")
            || value.attr("aria-disabled") == Some("true")
            || value.attr("data-dp-url") == Some("");
        if !inert {
            return Some(css);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelMessage {
    Changed(ChangeNotification),
    Preview(PreviewRequest),
}

/// Panel bridge over an mpsc channel. A dropped receiver means the panel
/// closed, reported as `NoActiveContext`.
#[derive(Debug)]
pub struct ChannelBridge {
    tx: Mutex<Sender<PanelMessage>>,
}

impl ChannelBridge {
    pub fn new(tx: Sender<PanelMessage>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, message: PanelMessage) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| EngineError::Lifecycle("panel bridge lock poisoned".to_string()))?;
        tx.send(message).map_err(|_| EngineError::NoActiveContext)
    }
}

impl PanelBridge for ChannelBridge {
    fn notify(&self, notification: &ChangeNotification) -> Result<()> {
        self.send(PanelMessage::Changed(notification.clone()))
    }

    fn show_preview(&self, request: &PreviewRequest) -> Result<()> {
        self.send(PanelMessage::Preview(request.clone()))
    }
}

#[derive(Debug)]
pub struct StaticPageHost {
    page: Mutex<PageSource>,
    clicks: Mutex<Vec<String>>,
    navigations: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl StaticPageHost {
    pub fn new(page: PageSource) -> Self {
        Self {
            page: Mutex::new(page),
            clicks: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_page(&self, page: PageSource) {
        if let Ok(mut current) = self.page.lock() {
            *current = page;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::NoActiveContext);
        }
        Ok(())
    }
}

impl PageHost for StaticPageHost {
    fn current_page(&self) -> Result<PageSource> {
        self.ensure_open()?;
        self.page
            .lock()
            .map(|p| p.clone())
            .map_err(|_| EngineError::Lifecycle("page lock poisoned".to_string()))
    }

    fn click(&self, selector: &str) -> Result<bool> {
        let page = self.current_page()?;
        let doc = PageDocument::parse(&page);
        let Ok(parsed) = scraper::Selector::parse(selector) else {
            return Ok(false);
        };
        if doc.html.select(&parsed).next().is_none() {
            return Ok(false);
        }
        if let Ok(mut clicks) = self.clicks.lock() {
            clicks.push(selector.to_string());
        }
        Ok(true)
    }

    fn navigate(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        if let Ok(mut navigations) = self.navigations.lock() {
            navigations.push(url.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ChangeReason;
    use std::sync::mpsc;

    #[test]
    fn variant_url_keeps_host_and_sets_flags() {
        let url = variant_url("https://www.amazon.de/Some-Thing/dp/B000000001/ref=x?th=1#y", "B000000002")
            .expect("url");
        assert_eq!(url, "https://www.amazon.de/dp/B000000002?th=1&psc=1");
        assert!(variant_url("https://www.amazon.de/", "nope").is_err());
        assert!(variant_url("not a url", "B000000002").is_err());
    }

    #[test]
    fn interactive_swatch_skips_inert_elements() {
        let doc = PageDocument::parse_html(
            "https://www.amazon.com/dp/B000000001",
            r#"<div id="twister">
                 <li data-asin="B000000002" class="swatchAvailable"></li>
                 <li data-asin="B000000003" class="swatchUnavailable"></li>
               </div>"#,
        );
        assert_eq!(
            interactive_swatch(&doc, "B000000002").as_deref(),
            Some("li[data-asin=\"B000000002\"]")
        );
        assert!(interactive_swatch(&doc, "B000000003").is_none());
        assert!(interactive_swatch(&doc, "B000000009").is_none());
    }

    #[test]
    fn channel_bridge_reports_closed_panel() {
        let (tx, rx) = mpsc::channel();
        let bridge = ChannelBridge::new(tx);
        let note = ChangeNotification {
            reason: ChangeReason::UrlChanged,
            url: "https://www.amazon.com/dp/B000000001".to_string(),
        };
        bridge.notify(&note).expect("delivered");
        assert_eq!(rx.recv().expect("message"), PanelMessage::Changed(note.clone()));
        drop(rx);
        let err = bridge.notify(&note).expect_err("closed");
        assert!(err.is_no_active_context());
    }

    #[test]
    fn static_host_records_clicks_and_closes() {
        let host = StaticPageHost::new(PageSource::new(
            "https://www.amazon.com/dp/B000000001",
            r#"<li data-asin="B000000002"></li>"#,
        ));
        assert!(host.click("li[data-asin=\"B000000002\"]").expect("click"));
        assert!(!host.click("li[data-asin=\"B000000009\"]").expect("click"));
        assert_eq!(host.clicks().len(), 1);
        host.close();
        assert!(host.current_page().expect_err("closed").is_no_active_context());
    }

    #[test]
    fn preview_request_indexes_into_gallery() {
        let all = vec!["a".to_string(), "b".to_string()];
        assert_eq!(PreviewRequest::new("b", MediaKind::Image, &all).index, 1);
        let orphan = PreviewRequest::new("z", MediaKind::Video, &all);
        assert_eq!(orphan.index, 0);
        assert_eq!(orphan.all_urls.len(), 3);
    }
}
