use crate::paths::AppPaths;
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

const LOG_ROTATE_BYTES: u64 = 8 * 1024 * 1024;
const LOG_MAX_BACKUPS: usize = 3;

/// Append-only JSONL event log for one scrape session.
///
/// Logging is best effort: a failed write never interrupts scraping.
#[derive(Debug)]
pub struct EventLog {
    session_id: String,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn for_session(paths: &AppPaths, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            path: Some(paths.session_log_path(session_id)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            session_id: String::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&self, level: &str, event: &str, data: serde_json::Value) {
        let _ = self.append(level, event, data);
    }

    pub fn append(&self, level: &str, event: &str, data: serde_json::Value) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "session_id": self.session_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rotate_log_if_needed(path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

fn rotate_log_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };

    if len < LOG_ROTATE_BYTES {
        return Ok(());
    }

    rotate_file_backups(path, LOG_MAX_BACKUPS)?;
    Ok(())
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };

        if !src.exists() {
            continue;
        }

        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

/// Reduce a URL to its origin so log files never carry product paths or
/// signed query strings.
pub fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(uri) => {
            let scheme = uri.scheme();
            let authority = uri.host_str().unwrap_or("unknown-host");
            format!("{scheme}://{authority}/...")
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
