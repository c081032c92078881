use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HindsightConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub streams: StreamConfig,
    pub recall: RecallConfig,
    pub episodes: EpisodeConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite index database (pointer table, producers, memory schema).
    pub db_path: String,
    /// Directory holding one append-only log file per stream.
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    /// Upper bound on a long-poll wait before returning "no data yet".
    pub long_poll_timeout_secs: u64,
    /// Producer rows untouched for this many days are garbage collected.
    pub producer_ttl_days: u64,
    /// Hard cap on a single append payload.
    pub max_append_bytes: usize,
    /// Interval between control messages on a push subscription.
    pub control_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecallConfig {
    pub default_limit: usize,
    pub token_budget: usize,
    pub rrf_k: usize,
    pub dedup_threshold: f64,
    /// Weight of encoding strength in cognitive-mode activation.
    pub encoding_weight: f64,
    /// Maximum working-memory recency boost in cognitive mode.
    pub working_memory_boost: f64,
    /// Per-session working memory capacity.
    pub working_memory_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EpisodeConfig {
    /// Idle gap (strictly greater than) that starts a new episode.
    pub time_gap_mins: u64,
}

impl Default for HindsightConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            streams: StreamConfig::default(),
            recall: RecallConfig::default(),
            episodes: EpisodeConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4418,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = default_hindsight_dir();
        Self {
            db_path: base.join("index.db").to_string_lossy().into_owned(),
            data_dir: base.join("streams").to_string_lossy().into_owned(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_secs: 30,
            producer_ttl_days: 7,
            max_append_bytes: 4 * 1024 * 1024,
            control_interval_secs: 20,
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            token_budget: 4000,
            rrf_k: 60,
            dedup_threshold: 0.92,
            encoding_weight: 0.1,
            working_memory_boost: 0.25,
            working_memory_capacity: 16,
        }
    }
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self { time_gap_mins: 45 }
    }
}

/// Returns `~/.hindsight/`
pub fn default_hindsight_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".hindsight")
}

/// Returns the default config file path: `~/.hindsight/config.toml`
pub fn default_config_path() -> PathBuf {
    default_hindsight_dir().join("config.toml")
}

impl HindsightConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            HindsightConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (HINDSIGHT_DB, HINDSIGHT_DATA_DIR,
    /// HINDSIGHT_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HINDSIGHT_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("HINDSIGHT_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("HINDSIGHT_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the stream data directory, expanding `~` if needed.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HindsightConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.streams.long_poll_timeout_secs, 30);
        assert_eq!(config.streams.producer_ttl_days, 7);
        assert_eq!(config.recall.rrf_k, 60);
        assert_eq!(config.episodes.time_gap_mins, 45);
        assert!(config.storage.db_path.ends_with("index.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
port = 9000

[storage]
db_path = "/tmp/test.db"
data_dir = "/tmp/streams"

[recall]
default_limit = 25
"#;
        let config: HindsightConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.recall.default_limit, 25);
        // defaults still apply for unset fields
        assert_eq!(config.recall.rrf_k, 60);
        assert_eq!(config.streams.long_poll_timeout_secs, 30);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = HindsightConfig::default();
        std::env::set_var("HINDSIGHT_DB", "/tmp/override.db");
        std::env::set_var("HINDSIGHT_DATA_DIR", "/tmp/override-streams");
        std::env::set_var("HINDSIGHT_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.storage.data_dir, "/tmp/override-streams");
        assert_eq!(config.server.log_level, "trace");

        // Clean up
        std::env::remove_var("HINDSIGHT_DB");
        std::env::remove_var("HINDSIGHT_DATA_DIR");
        std::env::remove_var("HINDSIGHT_LOG_LEVEL");
    }
}
