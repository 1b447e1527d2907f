//! Configuration system for Mercury.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MERCURY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mercury/config.toml
//!   3. ~/.config/mercury/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MercuryConfig {
    pub network: NetworkConfig,
    pub reliability: ReliabilityConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP listen address. Port 0 = OS-assigned.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Resend interval for unacked once-off reliable packets.
    pub once_off_resend_period_ms: u64,
    /// Resends before a once-off reliable packet is abandoned.
    pub once_off_max_resends: u32,
    /// Inactivity after which a condemned channel is force-deleted.
    pub condemned_age_limit_ms: u64,
    /// Age after which a half-assembled fragmented bundle is discarded.
    pub fragment_max_age_ms: u64,
    /// Duplicate-detection generation length; receipts survive two.
    pub receipt_tick_ms: u64,
    /// Default timeout for off-channel requests. 0 = never.
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Artificially drop roughly N per million outgoing packets.
    pub artificial_drop_per_million: u32,
    /// Artificial send latency range in milliseconds. 0/0 = off.
    pub artificial_latency_min_ms: u64,
    pub artificial_latency_max_ms: u64,
    pub verbose: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MercuryConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            reliability: ReliabilityConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            once_off_resend_period_ms: 200,
            once_off_max_resends: 50,
            condemned_age_limit_ms: 5_000,
            fragment_max_age_ms: 10_000,
            receipt_tick_ms: 30_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            artificial_drop_per_million: 0,
            artificial_latency_min_ms: 0,
            artificial_latency_max_ms: 0,
            verbose: false,
        }
    }
}

impl ReliabilityConfig {
    pub fn once_off_resend_period(&self) -> Duration {
        Duration::from_millis(self.once_off_resend_period_ms)
    }

    pub fn condemned_age_limit(&self) -> Duration {
        Duration::from_millis(self.condemned_age_limit_ms)
    }

    pub fn fragment_max_age(&self) -> Duration {
        Duration::from_millis(self.fragment_max_age_ms)
    }

    pub fn receipt_tick(&self) -> Duration {
        Duration::from_millis(self.receipt_tick_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mercury")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MercuryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MercuryConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MERCURY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MercuryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MERCURY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MERCURY_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("MERCURY_RELIABILITY__ONCE_OFF_RESEND_PERIOD_MS") {
            if let Ok(p) = v.parse() {
                self.reliability.once_off_resend_period_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MERCURY_RELIABILITY__ONCE_OFF_MAX_RESENDS") {
            if let Ok(p) = v.parse() {
                self.reliability.once_off_max_resends = p;
            }
        }
        if let Ok(v) = std::env::var("MERCURY_DEBUG__ARTIFICIAL_DROP_PER_MILLION") {
            if let Ok(p) = v.parse() {
                self.debug.artificial_drop_per_million = p;
            }
        }
        if let Ok(v) = std::env::var("MERCURY_DEBUG__VERBOSE") {
            self.debug.verbose = v == "true" || v == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_reliability_timers() {
        let config = MercuryConfig::default();
        assert_eq!(config.reliability.once_off_resend_period_ms, 200);
        assert_eq!(config.reliability.once_off_max_resends, 50);
        assert_eq!(config.reliability.condemned_age_limit_ms, 5_000);
        assert!(config.reliability.request_timeout().is_some());
    }

    #[test]
    fn zero_request_timeout_means_never() {
        let mut config = MercuryConfig::default();
        config.reliability.request_timeout_ms = 0;
        assert!(config.reliability.request_timeout().is_none());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = MercuryConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: MercuryConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.reliability.fragment_max_age_ms,
            config.reliability.fragment_max_age_ms
        );
        assert_eq!(parsed.network.listen_addr, config.network.listen_addr);
    }
}
