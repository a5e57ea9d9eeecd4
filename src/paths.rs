use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn rule_table_path(&self) -> PathBuf {
        self.config_dir().join("rules.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn scrape_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("scrape")
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.scrape_logs_dir().join(format!("{session_id}.jsonl"))
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.base_dir.join("exports")
    }

    pub fn default_manifest_path(&self, archive_name: &str) -> PathBuf {
        let stem = Path::new(archive_name)
            .file_stem()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_else(|| "media".to_string());
        self.exports_dir().join(format!("{stem}.csv"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.scrape_logs_dir())?;
        std::fs::create_dir_all(self.exports_dir())?;
        Ok(())
    }
}
