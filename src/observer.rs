use crate::config::ObserverConfig;
use crate::host::{PageHost, PanelBridge};
use crate::logs::{redact_url_for_log, EventLog};
use crate::normalize::image_base;
use crate::page::{asin_from_url, is_valid_asin, PageDocument};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    AsinChanged,
    UrlChanged,
    VariantChanged,
    MediaLoaded,
    ImageChanged,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::AsinChanged => "asin_changed",
            ChangeReason::UrlChanged => "url_changed",
            ChangeReason::VariantChanged => "variant_changed",
            ChangeReason::MediaLoaded => "media_loaded",
            ChangeReason::ImageChanged => "image_changed",
        }
    }

    fn priority(&self) -> u8 {
        match self {
            ChangeReason::AsinChanged => 5,
            ChangeReason::UrlChanged => 4,
            ChangeReason::VariantChanged => 3,
            ChangeReason::MediaLoaded => 2,
            ChangeReason::ImageChanged => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub reason: ChangeReason,
    pub url: String,
}

impl ChangeNotification {
    pub fn forces_rescrape(&self) -> bool {
        self.reason == ChangeReason::AsinChanged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Variant,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Mutation(MutationKind),
    AsinInput(String),
    UrlChanged(String),
    MainImageChanged(String),
    HoverStart,
    HoverEnd,
    Poll { url: String, asin: Option<String> },
    ReviewsLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Idle,
    PendingNotify,
    Notified,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    reason: ChangeReason,
    deadline_ms: u64,
}

#[derive(Debug)]
pub struct PageObserver {
    config: ObserverConfig,
    state: ObserverState,
    url: String,
    asin: Option<String>,
    seen_images: HashSet<String>,
    hovering: bool,
    pending: Option<Pending>,
}

impl PageObserver {
    pub fn new(config: ObserverConfig, url: &str, asin: Option<&str>) -> Self {
        Self {
            config,
            state: ObserverState::Idle,
            url: url.to_string(),
            asin: asin.filter(|a| is_valid_asin(a)).map(|a| a.to_string()),
            seen_images: HashSet::new(),
            hovering: false,
            pending: None,
        }
    }

    pub fn state(&self) -> ObserverState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn asin(&self) -> Option<&str> {
        self.asin.as_deref()
    }

    pub fn is_hovering(&self) -> bool {
        self.hovering
    }

    pub fn deadline(&self) -> Option<u64> {
        self.pending.map(|p| p.deadline_ms)
    }

    pub fn remember_image(&mut self, url: &str) {
        self.seen_images.insert(image_base(url));
    }

    pub fn handle(&mut self, now_ms: u64, event: PageEvent) {
        match event {
            PageEvent::Mutation(MutationKind::Variant) => {
                self.schedule(now_ms, ChangeReason::VariantChanged)
            }
            PageEvent::Mutation(MutationKind::Media) | PageEvent::ReviewsLoaded => {
                self.schedule(now_ms, ChangeReason::MediaLoaded)
            }
            PageEvent::AsinInput(asin) => self.observe_asin(now_ms, &asin),
            PageEvent::UrlChanged(url) => self.observe_url(now_ms, &url),
            PageEvent::Poll { url, asin } => {
                if let Some(asin) = asin {
                    self.observe_asin(now_ms, &asin);
                }
                self.observe_url(now_ms, &url);
            }
            PageEvent::MainImageChanged(src) => {
                if self.hovering {
                    return;
                }
                if self.seen_images.insert(image_base(&src)) {
                    self.schedule(now_ms, ChangeReason::ImageChanged);
                }
            }
            PageEvent::HoverStart => self.hovering = true,
            PageEvent::HoverEnd => self.hovering = false,
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<ChangeNotification> {
        let pending = self.pending?;
        if now_ms < pending.deadline_ms {
            return None;
        }
        self.pending = None;
        self.state = ObserverState::Notified;
        Some(ChangeNotification {
            reason: pending.reason,
            url: self.url.clone(),
        })
    }

    pub fn acknowledge(&mut self) {
        if self.state == ObserverState::Notified {
            self.state = ObserverState::Idle;
        }
    }

    fn observe_asin(&mut self, now_ms: u64, raw: &str) {
        let asin = raw.trim();
        if !is_valid_asin(asin) || self.asin.as_deref() == Some(asin) {
            return;
        }
        self.asin = Some(asin.to_string());
        self.seen_images.clear();
        self.schedule(now_ms, ChangeReason::AsinChanged);
    }

    fn observe_url(&mut self, now_ms: u64, url: &str) {
        let url = url.trim();
        if url.is_empty() || url == self.url {
            return;
        }
        self.url = url.to_string();
        match asin_from_url(url) {
            Some(asin) if self.asin.as_deref() != Some(asin.as_str()) => {
                self.observe_asin(now_ms, &asin)
            }
            _ => self.schedule(now_ms, ChangeReason::UrlChanged),
        }
    }

    fn schedule(&mut self, now_ms: u64, reason: ChangeReason) {
        let reason = match self.pending {
            Some(p) if p.reason.priority() >= reason.priority() => p.reason,
            _ => reason,
        };
        self.pending = Some(Pending {
            reason,
            deadline_ms: now_ms.saturating_add(self.config.debounce_ms),
        });
        self.state = ObserverState::PendingNotify;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    Event { at_ms: u64, event: PageEvent },
    Idle { at_ms: u64 },
    Closed,
}

pub trait ChangeSource {
    fn now_ms(&self) -> u64;

    fn next_event(&mut self, wait_ms: u64) -> SourceItem;
}

#[derive(Debug, Clone)]
pub struct ScriptedChangeSource {
    events: VecDeque<(u64, PageEvent)>,
    now_ms: u64,
    drained: bool,
}

impl ScriptedChangeSource {
    pub fn new(mut events: Vec<(u64, PageEvent)>) -> Self {
        events.sort_by_key(|(at, _)| *at);
        Self {
            events: events.into(),
            now_ms: 0,
            drained: false,
        }
    }
}

impl ChangeSource for ScriptedChangeSource {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn next_event(&mut self, wait_ms: u64) -> SourceItem {
        let horizon = self.now_ms.saturating_add(wait_ms);
        match self.events.front() {
            Some((at, _)) if *at <= horizon => {
                let Some((at, event)) = self.events.pop_front() else {
                    return SourceItem::Closed;
                };
                self.now_ms = self.now_ms.max(at);
                SourceItem::Event {
                    at_ms: self.now_ms,
                    event,
                }
            }
            Some(_) => {
                self.now_ms = horizon;
                SourceItem::Idle { at_ms: horizon }
            }
            // One last idle step lets a pending notification fire.
            None if !self.drained => {
                self.drained = true;
                self.now_ms = horizon;
                SourceItem::Idle { at_ms: horizon }
            }
            None => SourceItem::Closed,
        }
    }
}

/// Live source: events pushed by the host over a channel, plus a poll of the
/// host page on a fixed interval for navigations no event reports.
pub struct ChannelChangeSource {
    rx: Receiver<PageEvent>,
    host: Arc<dyn PageHost>,
    poll_interval: Duration,
    started: Instant,
    last_poll: Instant,
}

impl ChannelChangeSource {
    pub fn new(rx: Receiver<PageEvent>, host: Arc<dyn PageHost>, poll_interval_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            rx,
            host,
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            started: now,
            last_poll: now,
        }
    }

    fn poll(&mut self) -> SourceItem {
        self.last_poll = Instant::now();
        match self.host.current_page() {
            Ok(page) => {
                let asin = PageDocument::parse(&page).canonical_asin();
                SourceItem::Event {
                    at_ms: self.now_ms(),
                    event: PageEvent::Poll { url: page.url, asin },
                }
            }
            Err(e) if e.is_no_active_context() => SourceItem::Closed,
            Err(_) => SourceItem::Idle { at_ms: self.now_ms() },
        }
    }
}

impl ChangeSource for ChannelChangeSource {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn next_event(&mut self, wait_ms: u64) -> SourceItem {
        let until_poll = self.poll_interval.saturating_sub(self.last_poll.elapsed());
        if until_poll.is_zero() {
            return self.poll();
        }
        let timeout = until_poll.min(Duration::from_millis(wait_ms));
        match self.rx.recv_timeout(timeout) {
            Ok(event) => SourceItem::Event {
                at_ms: self.now_ms(),
                event,
            },
            Err(RecvTimeoutError::Timeout) => {
                if self.last_poll.elapsed() >= self.poll_interval {
                    self.poll()
                } else {
                    SourceItem::Idle { at_ms: self.now_ms() }
                }
            }
            Err(RecvTimeoutError::Disconnected) => SourceItem::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverExit {
    SourceClosed,
    PanelClosed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverRun {
    pub exit: ObserverExit,
    pub notifications: usize,
}

/// Drive `observer` from `source` until the source closes, the panel goes
/// away, or `stop` is set. Delivery failures other than a closed panel are
/// logged and the loop carries on.
pub fn run_observer(
    observer: &mut PageObserver,
    source: &mut dyn ChangeSource,
    bridge: &dyn PanelBridge,
    log: &EventLog,
    stop: &AtomicBool,
) -> Result<ObserverRun> {
    let mut notifications = 0;
    let idle_wait = observer.config.poll_interval_ms.max(1);
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(ObserverRun {
                exit: ObserverExit::Stopped,
                notifications,
            });
        }

        let now = source.now_ms();
        if let Some(note) = observer.tick(now) {
            match bridge.notify(&note) {
                Ok(()) => notifications += 1,
                Err(e) if e.is_no_active_context() => {
                    return Ok(ObserverRun {
                        exit: ObserverExit::PanelClosed,
                        notifications,
                    });
                }
                Err(e) => log.line(
                    "warn",
                    "observer_notify_failed",
                    serde_json::json!({
                        "reason": note.reason.as_str(),
                        "url": redact_url_for_log(&note.url),
                        "error": e.to_string()
                    }),
                ),
            }
            observer.acknowledge();
            continue;
        }

        let wait = match observer.deadline() {
            Some(deadline) => deadline.saturating_sub(now),
            None => idle_wait,
        };
        match source.next_event(wait) {
            SourceItem::Event { at_ms, event } => observer.handle(at_ms, event),
            SourceItem::Idle { .. } => {}
            SourceItem::Closed => {
                return Ok(ObserverRun {
                    exit: ObserverExit::SourceClosed,
                    notifications,
                });
            }
        }
    }
}
