use crate::paths::AppPaths;
use crate::rules::RuleTable;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MAX_PAGE_CEILING: u32 = 100;
pub const MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub concurrency: usize,
    pub max_pages: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_pages: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotLimits {
    pub title_max_chars: usize,
    pub description_max_chars: usize,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            title_max_chars: 200,
            description_max_chars: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub max_body_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36".to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pagination: PaginationConfig,
    pub observer: ObserverConfig,
    pub snapshot: SnapshotLimits,
    pub http: HttpConfig,
}

impl EngineConfig {
    /// Pull every knob back into a usable range.
    pub fn clamped(mut self) -> Self {
        self.pagination.concurrency = self.pagination.concurrency.clamp(1, MAX_CONCURRENCY);
        self.pagination.max_pages = self.pagination.max_pages.clamp(1, MAX_PAGE_CEILING);
        self.observer.debounce_ms = self.observer.debounce_ms.clamp(50, 5_000);
        self.observer.poll_interval_ms = self.observer.poll_interval_ms.clamp(250, 60_000);
        self.snapshot.title_max_chars = self.snapshot.title_max_chars.clamp(16, 2_000);
        self.snapshot.description_max_chars =
            self.snapshot.description_max_chars.clamp(16, 20_000);
        self.http.timeout_secs = self.http.timeout_secs.clamp(1, 300);
        self.http.max_body_bytes = self.http.max_body_bytes.clamp(64 * 1024, 64 * 1024 * 1024);
        if self.http.user_agent.trim().is_empty() {
            self.http.user_agent = HttpConfig::default().user_agent;
        }
        self
    }
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let config: EngineConfig = load_json_or_default(&paths.engine_config_path(), "engine config")?;
    Ok(config.clamped())
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    save_json(&paths.engine_config_path(), config)
}

/// The rule table on disk, or the builtin one. Saved tables from an older
/// version still load; missing fields take builtin defaults.
pub fn load_rule_table(paths: &AppPaths) -> Result<RuleTable> {
    let table: RuleTable = load_json_or_default(&paths.rule_table_path(), "rule table")?;
    Ok(table.normalized())
}

pub fn save_rule_table(paths: &AppPaths, table: &RuleTable) -> Result<()> {
    save_json(&paths.rule_table_path(), table)
}

fn load_json_or_default<T>(path: &Path, label: &str) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse {label} at {}: {e}",
            path.to_string_lossy()
        ))
    })
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{VideoConflictPolicy, DEFAULT_CONTEXT_WINDOW, MIN_CONTEXT_WINDOW};

    fn temp_paths() -> (tempfile::TempDir, AppPaths) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        (dir, paths)
    }

    #[test]
    fn missing_files_give_defaults() {
        let (_dir, paths) = temp_paths();
        let config = load_engine_config(&paths).expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.pagination.concurrency, 5);
        assert_eq!(config.observer.debounce_ms, 300);
        let table = load_rule_table(&paths).expect("rules");
        assert_eq!(table.context_window, DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let (_dir, paths) = temp_paths();
        let mut config = EngineConfig::default();
        config.pagination.max_pages = 7;
        config.http.user_agent = "test-agent".to_string();
        save_engine_config(&paths, &config).expect("save");

        let raw = std::fs::read_to_string(paths.engine_config_path()).expect("read");
        assert!(raw.ends_with('\n'));
        assert_eq!(load_engine_config(&paths).expect("load"), config);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let (_dir, paths) = temp_paths();
        std::fs::create_dir_all(paths.config_dir()).expect("mkdir");
        std::fs::write(
            paths.engine_config_path(),
            r#"{"pagination":{"concurrency":0,"max_pages":5000},"observer":{"debounce_ms":1}}"#,
        )
        .expect("write");
        let config = load_engine_config(&paths).expect("load");
        assert_eq!(config.pagination.concurrency, 1);
        assert_eq!(config.pagination.max_pages, MAX_PAGE_CEILING);
        assert_eq!(config.observer.debounce_ms, 50);
        assert_eq!(config.observer.poll_interval_ms, 1_000);
    }

    #[test]
    fn parse_failure_names_the_file() {
        let (_dir, paths) = temp_paths();
        std::fs::create_dir_all(paths.config_dir()).expect("mkdir");
        std::fs::write(paths.rule_table_path(), "{not json").expect("write");
        let err = load_rule_table(&paths).expect_err("bad json");
        match err {
            EngineError::Config(message) => assert!(message.contains("rules.json"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rule_table_round_trips_through_disk() {
        let (_dir, paths) = temp_paths();
        let table = RuleTable {
            context_window: 10,
            video_conflict_policy: VideoConflictPolicy::PreferReview,
            ..RuleTable::default()
        };
        save_rule_table(&paths, &table).expect("save");
        let loaded = load_rule_table(&paths).expect("load");
        assert_eq!(loaded.context_window, MIN_CONTEXT_WINDOW);
        assert_eq!(loaded.video_conflict_policy, VideoConflictPolicy::PreferReview);
        loaded.compile().expect("compiles");
    }
}
