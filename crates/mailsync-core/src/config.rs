//! Daemon configuration, read from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::account::AccountSeed;
use crate::pool::PoolSettings;
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerSettings, SyncRequest};
use crate::worker::WorkerSettings;
use crate::{Error, Result};

/// Everything the daemon can be tuned with. Missing fields take their
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Only sync accounts on this node; all nodes when unset.
    pub node: Option<i64>,
    /// Messages fetched per account and run.
    pub sync_limit: usize,
    /// Most messages one list phase inserts.
    pub list_batch: usize,
    /// Most workers running at once.
    pub max_concurrent_workers: usize,
    /// Hard limit on one worker's run.
    pub timeout_minutes: u64,
    /// Cadence of the periodic trigger.
    pub trigger_interval_secs: u64,
    /// Pause between two message fetches.
    pub pacing_millis: u64,
    /// Workers stop fetching this long before their deadline.
    pub safety_margin_secs: u64,
    /// Pooled sessions unused this long are closed.
    pub session_idle_secs: u64,
    /// Cadence of the idle sweep.
    pub sweep_interval_secs: u64,
    /// Health-check NOOP timeout.
    pub probe_timeout_secs: u64,
    /// Claims older than this are released.
    pub stuck_claim_minutes: u64,
    /// TCP and TLS connect timeout.
    pub connect_timeout_secs: u64,
    /// Timeout for each server response.
    pub io_timeout_secs: u64,
    /// Folder selected in every session.
    pub mailbox: String,
    /// `SQLite` database file.
    pub database_path: PathBuf,
    /// Root directory for attachment objects.
    pub object_store_dir: PathBuf,
    /// Accounts upserted at startup.
    pub accounts: Vec<AccountSeed>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            node: None,
            sync_limit: 30,
            list_batch: 100,
            max_concurrent_workers: 20,
            timeout_minutes: 25,
            trigger_interval_secs: 120,
            pacing_millis: 500,
            safety_margin_secs: 120,
            session_idle_secs: 240,
            sweep_interval_secs: 60,
            probe_timeout_secs: 5,
            stuck_claim_minutes: 40,
            connect_timeout_secs: 30,
            io_timeout_secs: 60,
            mailbox: "INBOX".to_string(),
            database_path: data_dir.join("mailsync.db"),
            object_store_dir: data_dir.join("objects"),
            accounts: Vec::new(),
        }
    }
}

/// Roughly a century; keeps the age inside chrono's range.
const MAX_CLAIM_MINUTES: u64 = 52_560_000;

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailsync")
}

impl SyncConfig {
    /// `config.json` in the user's configuration directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailsync")
            .join("config.json")
    }

    /// Reads the configuration at `path`. A missing file gives the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// values fail [`validate`](Self::validate).
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync_limit", self.sync_limit as u64),
            ("list_batch", self.list_batch as u64),
            ("max_concurrent_workers", self.max_concurrent_workers as u64),
            ("timeout_minutes", self.timeout_minutes),
            ("trigger_interval_secs", self.trigger_interval_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("stuck_claim_minutes", self.stuck_claim_minutes),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{field} must be greater than zero")));
        }
        if self.safety_margin() >= self.timeout() {
            return Err(Error::Config(
                "safety_margin_secs must be shorter than timeout_minutes".into(),
            ));
        }
        if self.mailbox.trim().is_empty() {
            return Err(Error::Config("mailbox must not be empty".into()));
        }
        Ok(())
    }

    /// Per-worker deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    /// Margin kept before the deadline.
    #[must_use]
    pub const fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Transport connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-response timeout.
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Cadence of the periodic trigger.
    #[must_use]
    pub const fn trigger_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_interval_secs)
    }

    /// Cadence of the idle sweep.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Age after which claims count as stuck.
    #[must_use]
    pub fn stuck_claim_age(&self) -> chrono::Duration {
        let minutes = self.stuck_claim_minutes.min(MAX_CLAIM_MINUTES);
        chrono::Duration::minutes(i64::try_from(minutes).unwrap_or_default())
    }

    /// Session pool tuning.
    #[must_use]
    pub const fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_secs(self.session_idle_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            connect_policy: RetryPolicy::CONNECT,
        }
    }

    /// Worker tuning.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            list_batch: self.list_batch,
            pacing: Duration::from_millis(self.pacing_millis),
            safety_margin: self.safety_margin(),
            ..WorkerSettings::default()
        }
    }

    /// Scheduler tuning.
    #[must_use]
    pub const fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: self.max_concurrent_workers,
            default_limit: self.sync_limit,
            timeout: self.timeout(),
        }
    }

    /// The request the periodic trigger sends.
    #[must_use]
    pub const fn sync_request(&self) -> SyncRequest {
        SyncRequest {
            node: self.node,
            limit: None,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(1500));
        assert_eq!(config.scheduler_settings().max_concurrent, 20);
        assert_eq!(config.pool_settings().idle_timeout, Duration::from_secs(240));
        assert!(config.database_path.ends_with("mailsync/mailsync.db"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{
            "node": 3,
            "sync_limit": 10,
            "accounts": [{"address": "a@gmail.com", "password": "pw"}]
        }"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.node, Some(3));
        assert_eq!(config.sync_limit, 10);
        assert_eq!(config.max_concurrent_workers, 20);
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].username(), "a@gmail.com");
        assert_eq!(config.sync_request().node, Some(3));
    }

    #[test]
    fn rejects_zero_ceiling() {
        let config = SyncConfig {
            max_concurrent_workers: 0,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_workers"));
    }

    #[test]
    fn rejects_margin_not_below_timeout() {
        let config = SyncConfig {
            timeout_minutes: 2,
            safety_margin_secs: 120,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("mailsync-config-test-missing.json");
        let config = SyncConfig::load(&path).await.unwrap();
        assert_eq!(config.sync_limit, 30);
    }

    #[tokio::test]
    async fn invalid_file_is_rejected() {
        let path = std::env::temp_dir().join(format!(
            "mailsync-config-test-{}.json",
            std::process::id()
        ));
        tokio::fs::write(&path, r#"{"sync_limit": 0}"#).await.unwrap();
        let result = SyncConfig::load(&path).await;
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
