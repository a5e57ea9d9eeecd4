use crate::config::{load_engine_config, load_rule_table, EngineConfig};
use crate::host::{
    interactive_swatch, variant_url, PageHost, PanelBridge, PreviewRequest, VariantSwitch,
};
use crate::logs::{redact_url_for_log, EventLog};
use crate::models::{MediaKind, PageType, ProductSnapshot};
use crate::observer::{
    run_observer, ChangeNotification, ChangeReason, ChannelChangeSource, ObserverRun, PageEvent,
    PageObserver,
};
use crate::page::PageDocument;
use crate::pagination::{HttpReviewFetcher, ReviewPageFetcher, ReviewSweep};
use crate::paths::AppPaths;
use crate::rules::CompiledRules;
use crate::scrape::{ReviewMedia, Scraper};
use crate::session::{ScrapeSession, SweepOutcome};
use crate::{EngineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

struct Shared {
    config: EngineConfig,
    rules: CompiledRules,
    session: Mutex<ScrapeSession>,
    host: Arc<dyn PageHost>,
    fetcher: Arc<dyn ReviewPageFetcher>,
    bridge: Arc<dyn PanelBridge>,
    log: EventLog,
    shut_down: AtomicBool,
}

impl Shared {
    fn session(&self) -> Result<MutexGuard<'_, ScrapeSession>> {
        self.session
            .lock()
            .map_err(|_| EngineError::Lifecycle("session lock poisoned".to_string()))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Lifecycle("engine has been shut down".to_string()));
        }
        Ok(())
    }

    fn sweep(&self, page_url: &str, asin: &str) -> Result<usize> {
        let report = ReviewSweep::new(
            &self.rules,
            self.config.pagination,
            self.fetcher.as_ref(),
            &self.log,
        )
        .run(page_url, asin);
        let report = match report {
            Ok(r) => r,
            Err(e) => {
                self.session()?.finish_sweep(asin, ReviewMedia::default());
                return Err(e);
            }
        };

        let outcome = self.session()?.finish_sweep(asin, report.media);
        match outcome {
            SweepOutcome::Merged { added } => {
                self.log.line(
                    "info",
                    "review_sweep_completed",
                    serde_json::json!({
                        "asin": asin,
                        "pages_requested": report.pages_requested,
                        "pages_failed": report.pages_failed,
                        "batches": report.batches,
                        "added": added
                    }),
                );
                Ok(added)
            }
            SweepOutcome::Stale => {
                self.log.line(
                    "info",
                    "review_sweep_discarded",
                    serde_json::json!({ "asin": asin }),
                );
                Ok(0)
            }
        }
    }

    fn notify(&self, notification: &ChangeNotification) {
        match self.bridge.notify(notification) {
            Ok(()) => {}
            Err(e) if e.is_no_active_context() => {}
            Err(e) => self.log.line(
                "warn",
                "observer_notify_failed",
                serde_json::json!({
                    "reason": notification.reason.as_str(),
                    "url": redact_url_for_log(&notification.url),
                    "error": e.to_string()
                }),
            ),
        }
    }
}

pub struct ObserverHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<ObserverRun>>,
}

impl ObserverHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(self) -> Result<ObserverRun> {
        self.thread
            .join()
            .map_err(|_| EngineError::Lifecycle("observer thread panicked".to_string()))?
    }
}

#[derive(Clone)]
pub struct MediaEngine {
    shared: Arc<Shared>,
}

impl MediaEngine {
    pub fn new(
        config: EngineConfig,
        rules: CompiledRules,
        host: Arc<dyn PageHost>,
        fetcher: Arc<dyn ReviewPageFetcher>,
        bridge: Arc<dyn PanelBridge>,
        log: EventLog,
    ) -> Self {
        Self::with_session(config, rules, ScrapeSession::new(), host, fetcher, bridge, log)
    }

    pub fn open(
        paths: &AppPaths,
        host: Arc<dyn PageHost>,
        bridge: Arc<dyn PanelBridge>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = load_engine_config(paths)?;
        let rules = load_rule_table(paths)?.compile()?;
        let session = ScrapeSession::new();
        let log = EventLog::for_session(paths, session.id());
        let fetcher: Arc<dyn ReviewPageFetcher> = Arc::new(HttpReviewFetcher::new(&config.http));
        Ok(Self::with_session(config, rules, session, host, fetcher, bridge, log))
    }

    fn with_session(
        config: EngineConfig,
        rules: CompiledRules,
        session: ScrapeSession,
        host: Arc<dyn PageHost>,
        fetcher: Arc<dyn ReviewPageFetcher>,
        bridge: Arc<dyn PanelBridge>,
        log: EventLog,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: config.clamped(),
                rules,
                session: Mutex::new(session),
                host,
                fetcher,
                bridge,
                log,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn session_id(&self) -> Result<String> {
        Ok(self.shared.session()?.id().to_string())
    }

    pub fn log_path(&self) -> Option<std::path::PathBuf> {
        self.shared.log.path().map(|p| p.to_path_buf())
    }

    pub fn latest_snapshot(&self) -> Result<Option<Arc<ProductSnapshot>>> {
        Ok(self.shared.session()?.latest())
    }

    /// Full scrape of the host's current page. With `trigger_scroll`, the
    /// review sweep for this ASIN runs first (once per ASIN per session) so
    /// its media is part of the snapshot.
    pub fn scrape_product_data(&self, trigger_scroll: bool) -> Result<Option<Arc<ProductSnapshot>>> {
        let shared = &self.shared;
        shared.ensure_live()?;
        let page = shared.host.current_page()?;
        let doc = PageDocument::parse(&page);
        let page_type = doc.page_type();
        let asin = doc.canonical_asin();

        if let Some(asin) = asin.as_deref() {
            shared.session()?.observe_asin(asin);
        }

        if let (true, Some(PageType::Product), Some(asin)) = (trigger_scroll, page_type, asin.as_deref()) {
            let claimed = shared.session()?.begin_sweep(asin);
            if claimed {
                if let Err(e) = shared.sweep(&page.url, asin) {
                    shared.log.line(
                        "warn",
                        "review_page_failed",
                        serde_json::json!({ "asin": asin, "error": e.to_string() }),
                    );
                }
            }
        }

        let reviews = match asin.as_deref() {
            Some(asin) => shared.session()?.review_media(asin).cloned(),
            None => None,
        };
        let scraper = Scraper::new(&shared.rules, shared.config.snapshot);
        let Some(outcome) = scraper.scrape(&doc, reviews.as_ref()) else {
            shared.log.line(
                "info",
                "scrape_skipped",
                serde_json::json!({ "url": redact_url_for_log(&page.url) }),
            );
            return Ok(None);
        };

        if outcome.invalid_sources > 0 {
            shared.log.line(
                "warn",
                "json_source_invalid",
                serde_json::json!({
                    "url": redact_url_for_log(&page.url),
                    "count": outcome.invalid_sources
                }),
            );
        }
        let snapshot = outcome.snapshot;
        shared.log.line(
            "info",
            "scrape_completed",
            serde_json::json!({
                "asin": snapshot.asin(),
                "page_type": snapshot.page_type(),
                "product_images": snapshot.product_images().len(),
                "review_images": snapshot.review_images().len(),
                "videos": snapshot.videos().len(),
                "review_videos": snapshot.review_videos().len(),
                "variants": snapshot.variants().len(),
                "listing_products": snapshot.listing_products().len(),
                "discarded": outcome.discarded,
                "fingerprint": snapshot.fingerprint()
            }),
        );
        Ok(Some(shared.session()?.publish(snapshot)))
    }

    pub fn select_variant(&self, asin: &str) -> Result<bool> {
        let shared = &self.shared;
        shared.ensure_live()?;
        let page = shared.host.current_page()?;
        let selector = {
            let doc = PageDocument::parse(&page);
            interactive_swatch(&doc, asin)
        };
        match selector {
            Some(css) => shared.host.click(&css),
            None => Ok(false),
        }
    }

    pub fn request_variant(&self, asin: &str) -> Result<VariantSwitch> {
        if self.select_variant(asin)? {
            return Ok(VariantSwitch::Clicked);
        }
        let page = self.shared.host.current_page()?;
        let url = variant_url(&page.url, asin)?;
        self.shared.host.navigate(&url)?;
        Ok(VariantSwitch::Navigated { url })
    }

    pub fn show_preview(&self, url: &str, media_type: MediaKind, all_urls: &[String]) {
        let shared = &self.shared;
        if shared.ensure_live().is_err() {
            return;
        }
        let request = PreviewRequest::new(url, media_type, all_urls);
        match shared.bridge.show_preview(&request) {
            Ok(()) => {}
            Err(e) if e.is_no_active_context() => {}
            Err(e) => shared.log.line(
                "warn",
                "preview_failed",
                serde_json::json!({
                    "url": redact_url_for_log(url),
                    "error": e.to_string()
                }),
            ),
        }
    }

    /// Start the review sweep for the current ASIN on a background thread.
    pub fn prefetch_reviews(&self) -> Result<Option<JoinHandle<usize>>> {
        let shared = &self.shared;
        shared.ensure_live()?;
        let page = shared.host.current_page()?;
        let asin = {
            let doc = PageDocument::parse(&page);
            if doc.page_type() != Some(PageType::Product) {
                return Ok(None);
            }
            doc.canonical_asin()
        };
        let Some(asin) = asin else {
            return Ok(None);
        };
        {
            let mut session = shared.session()?;
            session.observe_asin(&asin);
            if !session.begin_sweep(&asin) {
                return Ok(None);
            }
        }

        let worker = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            let added = match worker.sweep(&page.url, &asin) {
                Ok(n) => n,
                Err(e) => {
                    worker.log.line(
                        "warn",
                        "review_page_failed",
                        serde_json::json!({ "asin": asin, "error": e.to_string() }),
                    );
                    0
                }
            };
            if added > 0 {
                worker.notify(&ChangeNotification {
                    reason: ChangeReason::MediaLoaded,
                    url: page.url.clone(),
                });
            }
            added
        });
        Ok(Some(handle))
    }

    pub fn spawn_observer(&self, events: Receiver<PageEvent>) -> Result<ObserverHandle> {
        let shared = &self.shared;
        shared.ensure_live()?;
        let page = shared.host.current_page()?;
        let mut observer = {
            let doc = PageDocument::parse(&page);
            let mut observer =
                PageObserver::new(shared.config.observer, &page.url, doc.canonical_asin().as_deref());
            if let Some(main) = doc
                .select_first("#landingImage")
                .and_then(|el| el.value().attr("src"))
            {
                observer.remember_image(main);
            }
            observer
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let worker = Arc::clone(&self.shared);
        let thread = thread::spawn(move || {
            let mut source = ChannelChangeSource::new(
                events,
                Arc::clone(&worker.host),
                worker.config.observer.poll_interval_ms,
            );
            run_observer(
                &mut observer,
                &mut source,
                worker.bridge.as_ref(),
                &worker.log,
                &stop_thread,
            )
        });
        Ok(ObserverHandle { stop, thread })
    }

    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ChannelBridge, PanelMessage, StaticPageHost};
    use crate::page::PageSource;
    use std::sync::mpsc;

    struct NoReviews;

    impl ReviewPageFetcher for NoReviews {
        fn fetch(&self, _url: &str) -> Result<String> {
            Ok("<html></html>".to_string())
        }
    }

    fn engine(html: &str, url: &str) -> (MediaEngine, Arc<StaticPageHost>, mpsc::Receiver<PanelMessage>) {
        let host = Arc::new(StaticPageHost::new(PageSource::new(url, html)));
        let (tx, rx) = mpsc::channel();
        let engine = MediaEngine::new(
            EngineConfig::default(),
            CompiledRules::builtin(),
            host.clone(),
            Arc::new(NoReviews),
            Arc::new(ChannelBridge::new(tx)),
            EventLog::disabled(),
        );
        (engine, host, rx)
    }

    const PRODUCT: &str = r#"<span id="productTitle">Mug</span>
        <div id="twister">
          <li data-asin="B000000001" class="swatchSelect" title="Click to select Red"></li>
          <li data-asin="B000000002" class="swatchUnavailable" title="Click to select Blue"></li>
        </div>"#;

    #[test]
    fn non_product_page_returns_none() {
        let (engine, _host, _rx) = engine("<p>nothing</p>", "https://example.com/");
        assert!(engine.scrape_product_data(false).expect("scrape").is_none());
        assert!(engine.latest_snapshot().expect("latest").is_none());
    }

    #[test]
    fn scrape_publishes_latest_snapshot() {
        let (engine, _host, _rx) = engine(PRODUCT, "https://www.amazon.com/dp/B000000001");
        let snap = engine.scrape_product_data(false).expect("scrape").expect("product");
        assert_eq!(snap.asin(), "B000000001");
        let latest = engine.latest_snapshot().expect("latest").expect("some");
        assert!(Arc::ptr_eq(&snap, &latest));
    }

    #[test]
    fn unavailable_variant_falls_back_to_navigation() {
        let (engine, host, _rx) = engine(PRODUCT, "https://www.amazon.com/dp/B000000001");
        assert!(engine.select_variant("B000000001").expect("select"));
        assert!(!engine.select_variant("B000000002").expect("select"));
        match engine.request_variant("B000000002").expect("request") {
            VariantSwitch::Navigated { url } => {
                assert_eq!(url, "https://www.amazon.com/dp/B000000002?th=1&psc=1")
            }
            other => panic!("unexpected switch: {other:?}"),
        }
        assert_eq!(host.navigations().len(), 1);
        assert_eq!(host.clicks().len(), 1);
    }

    #[test]
    fn preview_goes_to_the_panel() {
        let (engine, _host, rx) = engine(PRODUCT, "https://www.amazon.com/dp/B000000001");
        engine.show_preview("b", MediaKind::Image, &["a".to_string(), "b".to_string()]);
        match rx.recv().expect("message") {
            PanelMessage::Preview(req) => assert_eq!(req.index, 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn shutdown_rejects_further_requests() {
        let (engine, _host, _rx) = engine(PRODUCT, "https://www.amazon.com/dp/B000000001");
        engine.shutdown();
        match engine.scrape_product_data(false) {
            Err(EngineError::Lifecycle(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn closed_page_is_a_recognizable_error() {
        let (engine, host, _rx) = engine(PRODUCT, "https://www.amazon.com/dp/B000000001");
        host.close();
        let err = engine.scrape_product_data(false).expect_err("closed");
        assert!(err.is_no_active_context());
    }

    #[test]
    fn prefetch_runs_once_per_asin() {
        let (engine, _host, _rx) = engine(PRODUCT, "https://www.amazon.com/dp/B000000001");
        let handle = engine.prefetch_reviews().expect("prefetch").expect("started");
        assert_eq!(handle.join().expect("join"), 0);
        assert!(engine.prefetch_reviews().expect("prefetch").is_none());
    }
}
