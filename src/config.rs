// Engine configuration
//
// Data directory resolution order:
// 1) MEDIA_ASSISTANT_DATA_DIR environment variable
// 2) --data-dir flag
// 3) Platform data directory (directories::ProjectDirs)
//
// Tunables come from <data>/config.json. Every field is optional.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::db::schema::Scope;
use crate::error::{MediaError, Result};

/// A directory the ingest pipeline watches and scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    pub path: PathBuf,
    /// "global" or "private"
    #[serde(default = "default_scope_name")]
    pub scope: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_scope_name() -> String {
    "global".to_string()
}

impl RootConfig {
    pub fn global(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scope: default_scope_name(),
            project_id: None,
        }
    }

    pub fn private(path: impl Into<PathBuf>, project_id: &str) -> Self {
        Self {
            path: path.into(),
            scope: "private".to_string(),
            project_id: Some(project_id.to_string()),
        }
    }

    /// Validated scope. Private roots must carry a project id.
    pub fn to_scope(&self) -> Result<Scope> {
        Scope::from_parts(&self.scope, self.project_id.clone())
    }
}

/// An executable that speaks the JSON parser protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalParserConfig {
    pub id: String,
    pub executable: PathBuf,
    pub extensions: Vec<String>,
    #[serde(default = "default_external_priority")]
    pub priority: i32,
}

fn default_external_priority() -> i32 {
    PRIORITY_EXTERNAL_PARSER
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub parse_deadline_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_parse_attempts: i64,
    pub poll_interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub submit_capacity: usize,
    pub debounce_ms: u64,
    pub subscriber_capacity: usize,
    pub event_log_max_rows: i64,
    pub event_log_max_age_days: i64,
    pub bloom_false_positive_rate: f64,
    pub startup_scan: bool,
    pub watch: bool,
    pub rescan_interval_secs: Option<u64>,
    pub roots: Vec<RootConfig>,
    pub external_parsers: Vec<ExternalParserConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            parse_deadline_secs: DEFAULT_PARSE_DEADLINE_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_parse_attempts: DEFAULT_MAX_PARSE_ATTEMPTS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            submit_capacity: DEFAULT_SUBMIT_CAPACITY,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            event_log_max_rows: DEFAULT_EVENT_LOG_MAX_ROWS,
            event_log_max_age_days: DEFAULT_EVENT_LOG_MAX_AGE_DAYS,
            bloom_false_positive_rate: DEFAULT_BLOOM_FPR,
            startup_scan: true,
            watch: true,
            rescan_interval_secs: None,
            roots: Vec::new(),
            external_parsers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load `<data>/config.json`. A missing file yields defaults; a malformed
    /// one is fatal.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILENAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            MediaError::Config(format!("Invalid config file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(MediaError::Config("worker_count must be at least 1".into()));
        }
        if self.max_parse_attempts < 1 {
            return Err(MediaError::Config("max_parse_attempts must be at least 1".into()));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(MediaError::Config(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }
        for root in &self.roots {
            root.to_scope()?;
        }
        for parser in &self.external_parsers {
            if parser.id.trim().is_empty() || parser.extensions.is_empty() {
                return Err(MediaError::Config(format!(
                    "External parser '{}' needs an id and at least one extension",
                    parser.id
                )));
            }
        }
        Ok(())
    }
}

/// Resolve the data directory and create its layout.
pub fn resolve_data_dir(cli_override: Option<&Path>) -> Result<PathBuf> {
    let dir = if let Some(v) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        PathBuf::from(v)
    } else if let Some(p) = cli_override {
        p.to_path_buf()
    } else {
        ProjectDirs::from("", "", APP_DIR_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| MediaError::Config("Could not resolve a data directory".into()))?
    };

    crate::db::init_data_folders(&dir).map_err(|e| {
        MediaError::Config(format!("Could not create data directory {}: {}", dir.display(), e))
    })?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.debounce_ms, 500);
        assert!(config.roots.is_empty());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"worker_count": 4, "roots": [{"path": "/media", "scope": "private", "project_id": "p1"}]}"#,
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.parse_deadline_secs, DEFAULT_PARSE_DEADLINE_SECS);
        assert_eq!(
            config.roots[0].to_scope().unwrap(),
            Scope::Private { project_id: "p1".into() }
        );
    }

    #[test]
    fn test_private_root_without_project_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"roots": [{"path": "/media", "scope": "private"}]}"#,
        )
        .unwrap();

        assert!(EngineConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_malformed_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), "{ not json").unwrap();
        let err = EngineConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, MediaError::Config(_)));
    }

    #[test]
    fn test_cli_data_dir_creates_layout() {
        // Only meaningful when the env override is not set in the test environment
        if std::env::var_os(DATA_DIR_ENV).is_some() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let resolved = resolve_data_dir(Some(&data)).unwrap();
        assert_eq!(resolved, data);
        assert!(data.join(DB_FOLDER).is_dir());
        assert!(data.join(CACHE_FOLDER).is_dir());
        assert!(data.join(LOGS_FOLDER).is_dir());
    }
}
