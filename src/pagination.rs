use crate::config::{HttpConfig, PaginationConfig, MAX_CONCURRENCY, MAX_PAGE_CEILING};
use crate::logs::{redact_url_for_log, EventLog};
use crate::page::{is_valid_asin, PageDocument};
use crate::rules::CompiledRules;
use crate::scrape::{extract_review_media, ReviewMedia};
use crate::{EngineError, Result};
use std::io::Read;
use std::time::Duration;
use url::Url;

pub trait ReviewPageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<String>;
}

/// Blocking HTTP fetcher. Statuses >= 400 are errors.
pub struct HttpReviewFetcher {
    agent: ureq::Agent,
    max_body_bytes: u64,
}

impl HttpReviewFetcher {
    pub fn new(config: &HttpConfig) -> Self {
        let mut builder = ureq::Agent::config_builder();
        builder = builder
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(config.timeout_secs.max(1))))
            .user_agent(config.user_agent.as_str());
        Self {
            agent: builder.build().into(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl ReviewPageFetcher for HttpReviewFetcher {
    fn fetch(&self, url: &str) -> Result<String> {
        let mut response = self
            .agent
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.8")
            .call()
            .map_err(|e| EngineError::Http {
                url: redact_url_for_log(url),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(EngineError::HttpStatus {
                url: redact_url_for_log(url),
                status,
            });
        }
        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .take(self.max_body_bytes)
            .read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// `https://<host>/product-reviews/<ASIN>/?pageNumber=<n>&mediaType=media_reviews_only&reviewerType=all_reviews`
pub fn review_page_url(page_url: &str, asin: &str, page: u32) -> Result<String> {
    if !is_valid_asin(asin) {
        return Err(EngineError::InvalidUrl(format!("not an ASIN: {asin}")));
    }
    let parsed = Url::parse(page_url).map_err(|e| EngineError::InvalidUrl(format!("{page_url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| EngineError::InvalidUrl(page_url.to_string()))?;
    Ok(format!(
        "https://{host}/product-reviews/{asin}/?pageNumber={page}&mediaType=media_reviews_only&reviewerType=all_reviews"
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub media: ReviewMedia,
    pub pages_requested: u32,
    pub pages_failed: u32,
    pub batches: u32,
}

pub struct ReviewSweep<'a> {
    rules: &'a CompiledRules,
    config: PaginationConfig,
    fetcher: &'a dyn ReviewPageFetcher,
    log: &'a EventLog,
}

impl<'a> ReviewSweep<'a> {
    pub fn new(
        rules: &'a CompiledRules,
        config: PaginationConfig,
        fetcher: &'a dyn ReviewPageFetcher,
        log: &'a EventLog,
    ) -> Self {
        Self {
            rules,
            config,
            fetcher,
            log,
        }
    }

    pub fn run(&self, page_url: &str, asin: &str) -> Result<SweepReport> {
        let concurrency = self.config.concurrency.clamp(1, MAX_CONCURRENCY) as u32;
        let max_pages = self.config.max_pages.clamp(1, MAX_PAGE_CEILING);
        let mut report = SweepReport::default();
        let mut next_page = 1_u32;

        while next_page <= max_pages {
            let last = (next_page + concurrency - 1).min(max_pages);
            let urls = (next_page..=last)
                .map(|page| review_page_url(page_url, asin, page).map(|url| (page, url)))
                .collect::<Result<Vec<_>>>()?;
            next_page = last + 1;
            report.batches += 1;
            report.pages_requested += urls.len() as u32;

            let fetcher = self.fetcher;
            let results: Vec<(u32, String, Result<String>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = urls
                    .into_iter()
                    .map(|(page, url)| {
                        scope.spawn(move || {
                            let body = fetcher.fetch(&url);
                            (page, url, body)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join().unwrap_or_else(|_| {
                            (0, String::new(), Err(EngineError::Lifecycle("review fetch thread panicked".to_string())))
                        })
                    })
                    .collect()
            });

            let mut added = 0;
            for (page, url, body) in results {
                match body {
                    Ok(html) => {
                        let doc = PageDocument::parse_html(&url, &html);
                        added += report.media.merge(extract_review_media(self.rules, &doc));
                    }
                    Err(e) => {
                        report.pages_failed += 1;
                        self.log.line(
                            "warn",
                            "review_page_failed",
                            serde_json::json!({
                                "asin": asin,
                                "page": page,
                                "url": redact_url_for_log(&url),
                                "error": e.to_string()
                            }),
                        );
                    }
                }
            }
            if added == 0 {
                break;
            }
        }
        Ok(report)
    }
}
