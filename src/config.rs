//! Configuration Management
//!
//! Engine tuning: backoff policies per call class, retry budgets, and
//! operation polling. Stored as JSON (or YAML) under the user config dir.

use crate::retry::{BackoffController, BackoffPolicy, CallClass, RateLimitConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "CLOUDRECON_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub read: BackoffPolicy,
    pub write: BackoffPolicy,
    /// Minimum wait after a throttling signal
    pub rate_limit_floor_ms: u64,
    /// Retry budget for Conflict failures (object mid-transition)
    pub conflict_budget_ms: u64,
    /// Hard ceiling on attempts per call
    pub max_attempts: u32,
    /// Retries allowed for unrecognized failures
    pub unknown_retries: u32,
    /// Client-side per-action request limit, checked before every attempt
    pub rate_limit: RateLimitConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            read: BackoffPolicy::read(),
            write: BackoffPolicy::write(),
            rate_limit_floor_ms: 10_000,
            conflict_budget_ms: 30 * 60 * 1_000,
            max_attempts: 20,
            unknown_retries: 1,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self, class: CallClass) -> &BackoffPolicy {
        match class {
            CallClass::Read => &self.read,
            CallClass::Write => &self.write,
        }
    }

    pub fn controller(&self, class: CallClass) -> BackoffController {
        BackoffController {
            policy: self.policy(class).clone(),
            rate_limit_floor: Duration::from_millis(self.rate_limit_floor_ms),
            conflict_budget: Duration::from_millis(self.conflict_budget_ms),
            max_attempts: self.max_attempts.max(1),
            unknown_retries: self.unknown_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Upper bound once polling slows down
    pub max_interval_ms: u64,
    /// Number of "running" answers before the interval starts growing
    pub slowdown_after: u32,
    pub multiplier: f64,
    /// Per-operation timeout; the caller deadline still applies
    pub timeout_ms: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            max_interval_ms: 30_000,
            slowdown_after: 10,
            multiplier: 1.5,
            timeout_ms: Some(20 * 60 * 1_000),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Wait after the `polls`-th "running" answer (1-based)
    pub fn interval_for(&self, polls: u32) -> Duration {
        if polls <= self.slowdown_after {
            return self.interval();
        }
        let exponent = (polls - self.slowdown_after).min(64) as i32;
        let grown = self.interval_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = grown.min(self.max_interval_ms.max(self.interval_ms) as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub poll: PollConfig,
}

impl EngineConfig {
    /// Get the config file path (env override > user config dir)
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|p| p.join("cloudrecon").join("config.json"))
    }

    /// Load configuration from disk, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {:?}: {:#}", path, e);
                Self::default()
            },
        }
    }

    /// Load a specific file; `.yaml`/`.yml` are parsed as YAML, anything else as JSON
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&content, is_yaml(path))
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn parse(content: &str, yaml: bool) -> Result<Self> {
        if yaml {
            Ok(serde_yaml::from_str(content)?)
        } else {
            Ok(serde_json::from_str(content)?)
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path().context("No config directory available")?;

        // Create parent directory
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = if is_yaml(&path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(&path, content)?;

        Ok(path)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Jitter;

    #[test]
    fn test_defaults_match_call_classes() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.read.base_ms, 1_000);
        assert_eq!(config.retry.read.cap_ms, 10_000);
        assert_eq!(config.retry.write.base_ms, 5_000);
        assert_eq!(config.retry.write.cap_ms, 60_000);
        assert!(config.retry.conflict_budget_ms > config.retry.write.budget_ms);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::parse(r#"{"poll": {"interval_ms": 500}}"#, false).unwrap();
        assert_eq!(config.poll.interval_ms, 500);
        assert_eq!(config.poll.max_interval_ms, 30_000);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = concat!(
            "retry:\n",
            "  max_attempts: 3\n",
            "  read:\n",
            "    base_ms: 10\n",
            "    cap_ms: 100\n",
            "    budget_ms: 1000\n",
            "    jitter: none\n",
            "  rate_limit:\n",
            "    requests_per_second: 5\n",
            "    action_limits:\n",
            "      mongodb_instance.create: 1\n",
        );
        let config = EngineConfig::parse(yaml, true).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.retry.rate_limit.enabled);
        assert_eq!(config.retry.rate_limit.limit_for("mongodb_instance.create"), 1);
        assert_eq!(config.retry.rate_limit.limit_for("mongodb_instance.read"), 5);
        assert_eq!(config.retry.read.jitter, Jitter::None);
        assert_eq!(config.retry.write, BackoffPolicy::write());
    }

    #[test]
    fn test_poll_interval_slows_down() {
        let poll = PollConfig {
            interval_ms: 1_000,
            max_interval_ms: 4_000,
            slowdown_after: 2,
            multiplier: 2.0,
            timeout_ms: None,
        };
        let waits: Vec<u64> = (1..=6).map(|n| poll.interval_for(n).as_millis() as u64).collect();
        assert_eq!(waits, vec![1_000, 1_000, 2_000, 4_000, 4_000, 4_000]);
    }
}
