//! Configuration loader and validator for the opportunity sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::runner::RunnerOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub crm: Crm,
    pub sync: SyncSettings,
    #[serde(default)]
    pub notifications: Notifications,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Recorded as the lock owner prefix so operators can tell hosts apart.
    pub instance_name: String,
}

/// CRM REST endpoint and query limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crm {
    pub base_url: String,
    pub api_version: String,
    pub access_token: String,
    pub candidate_record_type: String,
    pub max_ids_per_request: usize,
    pub request_timeout_secs: u64,
}

/// Batch sizes and timings for the sync jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub chunk_size: usize,
    pub full_sync_group_size: usize,
    pub chunk_delay_ms: u64,
    pub initial_delay_ms: u64,
    pub incremental_interval_secs: u64,
    pub lock_hold_secs: u64,
    pub max_consecutive_faults: u32,
    #[serde(default)]
    pub chunk_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    #[serde(default)]
    pub telegram: Option<Telegram>,
}

/// Optional relay of chat posts to Telegram.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub routes: TelegramRoutes,
}

/// Telegram chat id per chat type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelegramRoutes {
    pub job_creator_source_partner: Option<i64>,
    pub candidate_recruiting: Option<i64>,
    pub candidate_prospect: Option<i64>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL, honouring `DATABASE_URL` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            let path: PathBuf = Path::new(&self.app.data_dir).join("oppsync.sqlite");
            format!("sqlite://{}", path.display())
        })
    }
}

impl SyncSettings {
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            delay: Duration::from_millis(self.chunk_delay_ms),
            chunk_timeout: self.chunk_timeout_secs.map(Duration::from_secs),
            max_consecutive_faults: self.max_consecutive_faults,
        }
    }

    pub fn lock_hold(&self) -> Duration {
        Duration::from_secs(self.lock_hold_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.instance_name.trim().is_empty() {
        return Err(ConfigError::Invalid("app.instance_name must be non-empty"));
    }

    if cfg.crm.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.crm.base_url).is_err() {
        return Err(ConfigError::Invalid("crm.base_url must be a valid URL"));
    }
    if cfg.crm.api_version.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.api_version must be non-empty"));
    }
    if cfg.crm.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.access_token must be non-empty"));
    }
    if cfg.crm.candidate_record_type.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.candidate_record_type must be non-empty"));
    }
    if cfg.crm.max_ids_per_request == 0 {
        return Err(ConfigError::Invalid("crm.max_ids_per_request must be > 0"));
    }
    if cfg.crm.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("crm.request_timeout_secs must be > 0"));
    }

    let s = &cfg.sync;
    if s.chunk_size == 0 {
        return Err(ConfigError::Invalid("sync.chunk_size must be > 0"));
    }
    if s.full_sync_group_size == 0 {
        return Err(ConfigError::Invalid("sync.full_sync_group_size must be > 0"));
    }
    if s.chunk_delay_ms == 0 {
        return Err(ConfigError::Invalid("sync.chunk_delay_ms must be > 0"));
    }
    if s.incremental_interval_secs == 0 {
        return Err(ConfigError::Invalid("sync.incremental_interval_secs must be > 0"));
    }
    if s.lock_hold_secs == 0 {
        return Err(ConfigError::Invalid("sync.lock_hold_secs must be > 0"));
    }
    if s.chunk_timeout_secs == Some(0) {
        return Err(ConfigError::Invalid("sync.chunk_timeout_secs must be > 0 when set"));
    }

    if let Some(tg) = &cfg.notifications.telegram {
        if tg.bot_token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "notifications.telegram.bot_token must be non-empty",
            ));
        }
    }

    Ok(())
}

/// Example configuration shipped with the service.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  instance_name: "oppsync-1"

crm:
  base_url: "https://example.my.salesforce.com/"
  api_version: "58.0"
  access_token: "YOUR_CRM_ACCESS_TOKEN"
  candidate_record_type: "Candidate_recruitment"
  max_ids_per_request: 200
  request_timeout_secs: 30

sync:
  chunk_size: 20
  full_sync_group_size: 10
  chunk_delay_ms: 2000
  initial_delay_ms: 0
  incremental_interval_secs: 3600
  lock_hold_secs: 1800
  max_consecutive_faults: 5
  chunk_timeout_secs: 120

notifications:
  telegram:
    bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
    routes:
      job_creator_source_partner: -1001000000001
      candidate_recruiting: -1001000000002
      candidate_prospect: null
"#
}
