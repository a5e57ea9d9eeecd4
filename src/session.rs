use crate::models::ProductSnapshot;
use crate::scrape::ReviewMedia;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Merged { added: usize },
    Stale,
}

/// Mutable state that outlives one scrape pass.
///
/// Everything else (dedup sets, classification state) is per pass. The
/// review cache is keyed by ASIN and only ever holds the current ASIN.
#[derive(Debug)]
pub struct ScrapeSession {
    id: String,
    current_asin: Option<String>,
    review_cache: HashMap<String, ReviewMedia>,
    last_fetched_asin: Option<String>,
    sweeps_in_flight: HashSet<String>,
    latest: Option<Arc<ProductSnapshot>>,
}

impl Default for ScrapeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrapeSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            current_asin: None,
            review_cache: HashMap::new(),
            last_fetched_asin: None,
            sweeps_in_flight: HashSet::new(),
            latest: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_asin(&self) -> Option<&str> {
        self.current_asin.as_deref()
    }

    /// Record the ASIN the page now shows. Returns true when it changed, in
    /// which case cached review media for other ASINs is dropped.
    pub fn observe_asin(&mut self, asin: &str) -> bool {
        let asin = asin.trim();
        if asin.is_empty() || self.current_asin.as_deref() == Some(asin) {
            return false;
        }
        self.current_asin = Some(asin.to_string());
        self.review_cache.retain(|key, _| key == asin);
        true
    }

    pub fn review_media(&self, asin: &str) -> Option<&ReviewMedia> {
        self.review_cache.get(asin)
    }

    pub fn last_fetched_asin(&self) -> Option<&str> {
        self.last_fetched_asin.as_deref()
    }

    pub fn needs_sweep(&self, asin: &str) -> bool {
        !asin.is_empty()
            && self.last_fetched_asin.as_deref() != Some(asin)
            && !self.sweeps_in_flight.contains(asin)
    }

    pub fn begin_sweep(&mut self, asin: &str) -> bool {
        if !self.needs_sweep(asin) {
            return false;
        }
        self.sweeps_in_flight.insert(asin.to_string());
        true
    }

    pub fn finish_sweep(&mut self, asin: &str, media: ReviewMedia) -> SweepOutcome {
        self.sweeps_in_flight.remove(asin);
        if self.current_asin.as_deref() != Some(asin) {
            return SweepOutcome::Stale;
        }
        self.last_fetched_asin = Some(asin.to_string());
        let added = self
            .review_cache
            .entry(asin.to_string())
            .or_default()
            .merge(media);
        SweepOutcome::Merged { added }
    }

    pub fn publish(&mut self, snapshot: ProductSnapshot) -> Arc<ProductSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.latest = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<ProductSnapshot>> {
        self.latest.clone()
    }
}
