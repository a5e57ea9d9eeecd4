use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amz_media_engine::config::{EngineConfig, ObserverConfig};
use amz_media_engine::engine::MediaEngine;
use amz_media_engine::host::{ChannelBridge, PanelMessage, StaticPageHost, VariantSwitch};
use amz_media_engine::logs::EventLog;
use amz_media_engine::observer::{
    run_observer, ChangeReason, MutationKind, ObserverExit, PageEvent, PageObserver,
    ScriptedChangeSource,
};
use amz_media_engine::page::PageSource;
use amz_media_engine::pagination::ReviewPageFetcher;
use amz_media_engine::paths::AppPaths;
use amz_media_engine::rules::CompiledRules;
use amz_media_engine::Result;

const IMG: &str = "https://m.media-amazon.com/images/I";

/// Review pages keyed by ASIN; only page 1 carries media.
struct ReviewsByAsin {
    pages: Vec<(&'static str, &'static str)>,
    requested: Mutex<Vec<String>>,
}

impl ReviewsByAsin {
    fn new(pages: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            pages,
            requested: Mutex::new(Vec::new()),
        }
    }
}

impl ReviewPageFetcher for ReviewsByAsin {
    fn fetch(&self, url: &str) -> Result<String> {
        self.requested.lock().expect("lock").push(url.to_string());
        if !url.contains("pageNumber=1&") {
            return Ok("<html></html>".to_string());
        }
        let id = self
            .pages
            .iter()
            .find(|(asin, _)| url.contains(&format!("/product-reviews/{asin}/")))
            .map(|(_, id)| *id);
        Ok(match id {
            Some(id) => format!(
                r#"<div id="cm_cr-review_list"><div data-hook="review"><img src="{IMG}/{id}._SY88.jpg"></div></div>"#
            ),
            None => "<html></html>".to_string(),
        })
    }
}

fn product_page(asin: &str, main: &str) -> String {
    format!(
        r#"<html><body>
        <input type="hidden" id="ASIN" value="{asin}">
        <span id="productTitle">  Enamel Camping Mug  </span>
        <div id="imageBlock">
          <img id="landingImage" data-old-hires="{IMG}/{main}._AC_SL1500_.jpg" src="{IMG}/{main}._SX300_.jpg">
          <div id="altImages">
            <img src="{IMG}/{main}._SS40_.jpg">
            <img src="{IMG}/71side._SS40_.jpg">
          </div>
        </div>
        <div id="twister">
          <li data-asin="B001000001" class="{sel1}" title="Click to select Red"><img src="{IMG}/41red._SS40_.jpg"></li>
          <li data-asin="B001000002" class="{sel2}" title="Click to select Blue"><img src="{IMG}/41blu._SS40_.jpg"></li>
          <li data-asin="B001000003" class="swatchUnavailable" title="Click to select Green"></li>
        </div>
        <div id="sp_detail"><img src="{IMG}/51ad._AC_UL160_.jpg"></div>
        </body></html>"#,
        sel1 = if asin == "B001000001" { "swatchSelect" } else { "swatchAvailable" },
        sel2 = if asin == "B001000002" { "swatchSelect" } else { "swatchAvailable" },
    )
}

fn page_source(asin: &str, main: &str) -> PageSource {
    PageSource::new(format!("https://www.amazon.com/dp/{asin}"), product_page(asin, main))
}

struct Harness {
    engine: MediaEngine,
    host: Arc<StaticPageHost>,
    panel: mpsc::Receiver<PanelMessage>,
    fetcher: Arc<ReviewsByAsin>,
}

fn harness(page: PageSource, fetcher: ReviewsByAsin) -> Harness {
    let host = Arc::new(StaticPageHost::new(page));
    let fetcher = Arc::new(fetcher);
    let (tx, panel) = mpsc::channel();
    let engine = MediaEngine::new(
        EngineConfig::default(),
        CompiledRules::builtin(),
        host.clone(),
        fetcher.clone(),
        Arc::new(ChannelBridge::new(tx)),
        EventLog::disabled(),
    );
    Harness {
        engine,
        host,
        panel,
        fetcher,
    }
}

#[test]
fn full_product_page_snapshot() {
    let h = harness(
        page_source("B001000001", "71main"),
        ReviewsByAsin::new(vec![("B001000001", "81rev")]),
    );
    let snap = h
        .engine
        .scrape_product_data(true)
        .expect("scrape")
        .expect("product page");

    assert_eq!(snap.asin(), "B001000001");
    assert_eq!(snap.title(), "Enamel Camping Mug");
    assert_eq!(snap.product_images()[0], format!("{IMG}/71main.jpg"));
    assert!(snap.product_images().contains(&format!("{IMG}/71side.jpg")));
    assert_eq!(snap.review_images(), &[format!("{IMG}/81rev.jpg")]);
    assert!(!snap
        .product_images()
        .iter()
        .chain(snap.review_images())
        .any(|u| u.contains("51ad")));

    assert_eq!(snap.variants().len(), 3);
    let selected: Vec<_> = snap.variants().iter().filter(|v| v.selected).collect();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].asin, "B001000001");
    assert!(!snap.variant("B001000003").expect("green").available);

    let latest = h.engine.latest_snapshot().expect("latest").expect("published");
    assert_eq!(latest.fingerprint(), snap.fingerprint());
}

#[test]
fn switching_asin_never_mixes_review_media() {
    let h = harness(
        page_source("B001000001", "71aaa"),
        ReviewsByAsin::new(vec![("B001000001", "81aaa"), ("B001000002", "81bbb")]),
    );
    let first = h.engine.scrape_product_data(true).expect("scrape").expect("product");
    assert_eq!(first.review_images(), &[format!("{IMG}/81aaa.jpg")]);

    h.host.set_page(page_source("B001000002", "71bbb"));
    let second = h.engine.scrape_product_data(true).expect("scrape").expect("product");
    assert_eq!(second.asin(), "B001000002");
    assert_eq!(second.review_images(), &[format!("{IMG}/81bbb.jpg")]);
    assert_eq!(second.product_images()[0], format!("{IMG}/71bbb.jpg"));

    // Rescraping the same ASIN reuses the cache instead of sweeping again.
    let before = h.fetcher.requested.lock().expect("lock").len();
    let again = h.engine.scrape_product_data(true).expect("scrape").expect("product");
    assert_eq!(again.review_images(), second.review_images());
    assert_eq!(h.fetcher.requested.lock().expect("lock").len(), before);
}

#[test]
fn background_prefetch_notifies_and_feeds_the_next_scrape() {
    let h = harness(
        page_source("B001000001", "71main"),
        ReviewsByAsin::new(vec![("B001000001", "81rev")]),
    );
    let handle = h.engine.prefetch_reviews().expect("prefetch").expect("started");
    assert_eq!(handle.join().expect("join"), 1);

    match h.panel.recv_timeout(Duration::from_secs(5)).expect("notification") {
        PanelMessage::Changed(note) => {
            assert_eq!(note.reason, ChangeReason::MediaLoaded);
            assert_eq!(note.url, "https://www.amazon.com/dp/B001000001");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let snap = h.engine.scrape_product_data(false).expect("scrape").expect("product");
    assert_eq!(snap.review_images(), &[format!("{IMG}/81rev.jpg")]);
}

#[test]
fn variant_requests_click_or_navigate() {
    let h = harness(page_source("B001000001", "71main"), ReviewsByAsin::new(vec![]));
    assert_eq!(
        h.engine.request_variant("B001000002").expect("switch"),
        VariantSwitch::Clicked
    );
    assert_eq!(
        h.engine.request_variant("B001000003").expect("switch"),
        VariantSwitch::Navigated {
            url: "https://www.amazon.com/dp/B001000003?th=1&psc=1".to_string()
        }
    );
    assert_eq!(h.host.clicks(), vec!["li[data-asin=\"B001000002\"]".to_string()]);
    assert_eq!(
        h.host.navigations(),
        vec!["https://www.amazon.com/dp/B001000003?th=1&psc=1".to_string()]
    );
}

#[test]
fn scripted_variant_switch_produces_one_asin_notification() {
    let (tx, rx) = mpsc::channel();
    let bridge = ChannelBridge::new(tx);
    let mut observer = PageObserver::new(
        ObserverConfig::default(),
        "https://www.amazon.com/dp/B001000001",
        Some("B001000001"),
    );
    let mut source = ScriptedChangeSource::new(vec![
        (0, PageEvent::Mutation(MutationKind::Variant)),
        (40, PageEvent::MainImageChanged(format!("{IMG}/71blu.jpg"))),
        (80, PageEvent::Mutation(MutationKind::Media)),
        (120, PageEvent::AsinInput("B001000002".to_string())),
        (
            200,
            PageEvent::UrlChanged("https://www.amazon.com/dp/B001000002?th=1&psc=1".to_string()),
        ),
    ]);
    let run = run_observer(
        &mut observer,
        &mut source,
        &bridge,
        &EventLog::disabled(),
        &AtomicBool::new(false),
    )
    .expect("run");
    assert_eq!(run.exit, ObserverExit::SourceClosed);
    assert_eq!(run.notifications, 1);
    drop(bridge);

    let notes: Vec<_> = rx
        .iter()
        .filter_map(|m| match m {
            PanelMessage::Changed(n) => Some(n),
            PanelMessage::Preview(_) => None,
        })
        .collect();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].reason, ChangeReason::AsinChanged);
    assert_eq!(notes[0].url, "https://www.amazon.com/dp/B001000002?th=1&psc=1");
    assert!(notes[0].forces_rescrape());
    assert_eq!(observer.asin(), Some("B001000002"));
}

#[test]
fn live_observer_reports_and_stops() {
    let h = harness(page_source("B001000001", "71main"), ReviewsByAsin::new(vec![]));
    let (events, rx) = mpsc::channel();
    let handle = h.engine.spawn_observer(rx).expect("spawn");
    events
        .send(PageEvent::AsinInput("B001000002".to_string()))
        .expect("send");

    match h.panel.recv_timeout(Duration::from_secs(5)).expect("notification") {
        PanelMessage::Changed(note) => assert_eq!(note.reason, ChangeReason::AsinChanged),
        other => panic!("unexpected message: {other:?}"),
    }
    handle.stop();
    let run = handle.join().expect("join");
    assert_eq!(run.exit, ObserverExit::Stopped);
    assert!(run.notifications >= 1);
}

#[test]
fn engine_opens_from_a_base_dir_and_logs_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let host = Arc::new(StaticPageHost::new(page_source("B001000001", "71main")));
    let (tx, _panel) = mpsc::channel();
    let engine = MediaEngine::open(&paths, host, Arc::new(ChannelBridge::new(tx))).expect("open");
    engine.scrape_product_data(false).expect("scrape").expect("product");

    let log = engine.log_path().expect("log path");
    let text = std::fs::read_to_string(log).expect("read log");
    assert!(text.contains("scrape_completed"), "{text}");
}
