use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use amz_media_engine::config::EngineConfig;
use amz_media_engine::download::{build_download_request, write_manifest, ArchiveLayout, MediaSelection};
use amz_media_engine::engine::MediaEngine;
use amz_media_engine::host::{ChannelBridge, PageHost, PanelBridge, StaticPageHost};
use amz_media_engine::logs::EventLog;
use amz_media_engine::page::PageSource;
use amz_media_engine::pagination::{HttpReviewFetcher, ReviewPageFetcher};
use amz_media_engine::paths::AppPaths;
use amz_media_engine::rules::CompiledRules;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut html_path: Option<PathBuf> = None;
    let mut url: Option<String> = None;
    let mut fetch = false;
    let mut base_dir: Option<PathBuf> = None;
    let mut reviews = false;
    let mut manifest: Option<PathBuf> = None;
    let mut structured = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--html" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--html requires a value".to_string())?;
                html_path = Some(PathBuf::from(v));
            }
            "--url" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--url requires a value".to_string())?;
                url = Some(v.to_string());
            }
            "--fetch" => fetch = true,
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--reviews" => reviews = true,
            "--manifest" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--manifest requires a value".to_string())?;
                manifest = Some(PathBuf::from(v));
            }
            "--structured" => structured = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    let url = url.ok_or_else(|| "--url is required (try --help)".to_string())?;
    let base_dir = base_dir.or_else(default_base_dir);
    let config = EngineConfig::default();

    let html = match (&html_path, fetch) {
        (Some(path), false) => std::fs::read_to_string(path).map_err(|e| e.to_string())?,
        (None, true) => HttpReviewFetcher::new(&config.http)
            .fetch(&url)
            .map_err(|e| e.to_string())?,
        (Some(_), true) => return Err("pass either --html or --fetch, not both".to_string()),
        (None, false) => return Err("nothing to scrape (pass --html <file> or --fetch)".to_string()),
    };

    let host: Arc<dyn PageHost> = Arc::new(StaticPageHost::new(PageSource::new(url, html)));
    // Nobody listens on the panel side here; notifications are dropped.
    let (tx, _rx) = mpsc::channel();
    let bridge: Arc<dyn PanelBridge> = Arc::new(ChannelBridge::new(tx));

    let (engine, paths) = match base_dir {
        Some(dir) => {
            let paths = AppPaths::new(dir);
            let engine = MediaEngine::open(&paths, host, bridge).map_err(|e| e.to_string())?;
            (engine, Some(paths))
        }
        None => {
            let fetcher: Arc<dyn ReviewPageFetcher> = Arc::new(HttpReviewFetcher::new(&config.http));
            let engine = MediaEngine::new(
                config,
                CompiledRules::builtin(),
                host,
                fetcher,
                bridge,
                EventLog::disabled(),
            );
            (engine, None)
        }
    };

    let Some(snapshot) = engine
        .scrape_product_data(reviews)
        .map_err(|e| e.to_string())?
    else {
        return Err("page is neither a product page nor a search listing".to_string());
    };

    let json = serde_json::to_string_pretty(snapshot.as_ref()).map_err(|e| e.to_string())?;
    println!("{json}");

    let layout = if structured {
        ArchiveLayout::Structured
    } else {
        ArchiveLayout::Flat
    };
    let request = build_download_request(&snapshot, &MediaSelection::default(), layout);
    let manifest = manifest.or_else(|| {
        paths
            .as_ref()
            .map(|p| p.default_manifest_path(&request.archive_name))
    });
    if let Some(path) = manifest {
        let rows = write_manifest(&path, &request).map_err(|e| e.to_string())?;
        eprintln!("Manifest: {} ({rows} entries)", path.to_string_lossy());
    }
    if let Some(log) = engine.log_path() {
        eprintln!("Log: {}", log.to_string_lossy());
    }

    Ok(())
}

fn default_base_dir() -> Option<PathBuf> {
    let v = std::env::var("AMZ_MEDIA_BASE_DIR").ok()?;
    let t = v.trim();
    if t.is_empty() {
        return None;
    }
    Some(PathBuf::from(t))
}

fn print_help() {
    println!(
        r#"amz_media_scrape

Scrapes product media from an Amazon product or search page and prints the
snapshot as JSON.

Usage:
  cargo run --bin amz_media_scrape -- --url https://www.amazon.com/dp/B0XXXXXXXX --html page.html
  cargo run --bin amz_media_scrape -- --url https://www.amazon.com/dp/B0XXXXXXXX --fetch --reviews

Options:
  --url <url>         Page URL (required; used to resolve relative links and the ASIN)
  --html <file>       Read the page from a saved HTML file
  --fetch             Download the page instead
  --reviews           Run the review-media sweep before building the snapshot
  --base-dir <path>   Config, rules and logs directory (default: $AMZ_MEDIA_BASE_DIR)
  --manifest <csv>    Write a download manifest (default with a base dir: <base-dir>/exports/<archive>.csv)
  --structured        Manifest uses per-group folders and numbered filenames
"#
    );
}
