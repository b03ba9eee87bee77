// Engine configuration (catalyst.yaml)

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::executor::{PoolConfig, RetryPolicy};
use crate::output::errors::EngineError;

/// Every engine tunable, with defaults
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_per_host: usize,
    pub max_global: usize,
    pub acquire_timeout: Duration,
    pub idle_ttl: Duration,
    pub connect_timeout: Duration,
    pub task_timeout: Duration,
    /// Captured output bound per result, in bytes
    pub output_limit: usize,
    /// Event channel capacity
    pub event_buffer: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_per_host: 1,
            max_global: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
            output_limit: 64 * 1024,
            event_buffer: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_per_host: self.max_per_host,
            max_global: self.max_global,
            acquire_timeout: self.acquire_timeout,
            idle_ttl: self.idle_ttl,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Io {
            message: format!("Failed to read config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, EngineError> {
        // An empty document is a valid all-defaults config
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: RawEngineConfig = serde_yaml::from_str(content).map_err(|e| EngineError::Config {
            message: format!("Invalid YAML: {}", e),
        })?;
        raw.convert()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("max_per_host", self.max_per_host as u128),
            ("max_global", self.max_global as u128),
            ("output_limit", self.output_limit as u128),
            ("event_buffer", self.event_buffer as u128),
            ("task_timeout", self.task_timeout.as_millis()),
            ("connect_timeout", self.connect_timeout.as_millis()),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Config {
                message: format!("'{}' must be greater than zero", name),
            });
        }
        Ok(())
    }
}

/// Retry settings as written in YAML (`retry:` in config and tasks)
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRetry {
    attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    budget_ms: Option<u64>,
    retry_on_timeout: Option<bool>,
}

impl RawRetry {
    /// Fill unset fields from `base`
    pub(crate) fn convert(self, base: &RetryPolicy) -> Result<RetryPolicy, EngineError> {
        if self.attempts == Some(0) {
            return Err(EngineError::Config {
                message: "retry.attempts must be at least 1".to_string(),
            });
        }
        if matches!(self.multiplier, Some(m) if m < 1.0) {
            return Err(EngineError::Config {
                message: "retry.multiplier must be at least 1.0".to_string(),
            });
        }
        if matches!(self.jitter, Some(j) if !(0.0..=1.0).contains(&j)) {
            return Err(EngineError::Config {
                message: "retry.jitter must be between 0.0 and 1.0".to_string(),
            });
        }

        Ok(RetryPolicy {
            max_attempts: self.attempts.unwrap_or(base.max_attempts),
            base_delay: self
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.base_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.max_delay),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            jitter: self.jitter.unwrap_or(base.jitter),
            budget: self.budget_ms.map(Duration::from_millis).or(base.budget),
            retry_on_timeout: self.retry_on_timeout.unwrap_or(base.retry_on_timeout),
        })
    }
}

/// Raw config structure (before conversion). Durations are seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    max_per_host: Option<usize>,
    max_global: Option<usize>,
    acquire_timeout: Option<u64>,
    idle_ttl: Option<u64>,
    connect_timeout: Option<u64>,
    task_timeout: Option<u64>,
    output_limit: Option<usize>,
    event_buffer: Option<usize>,
    retry: Option<RawRetry>,
}

impl RawEngineConfig {
    fn convert(self) -> Result<EngineConfig, EngineError> {
        let defaults = EngineConfig::default();
        let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);

        let config = EngineConfig {
            max_per_host: self.max_per_host.unwrap_or(defaults.max_per_host),
            max_global: self.max_global.unwrap_or(defaults.max_global),
            acquire_timeout: secs(self.acquire_timeout, defaults.acquire_timeout),
            idle_ttl: secs(self.idle_ttl, defaults.idle_ttl),
            connect_timeout: secs(self.connect_timeout, defaults.connect_timeout),
            task_timeout: secs(self.task_timeout, defaults.task_timeout),
            output_limit: self.output_limit.unwrap_or(defaults.output_limit),
            event_buffer: self.event_buffer.unwrap_or(defaults.event_buffer),
            retry: match self.retry {
                Some(raw) => raw.convert(&defaults.retry)?,
                None => defaults.retry,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_yaml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_global, 10);
        assert_eq!(config.output_limit, 65536);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_yaml(
            "max_global: 4\ntask_timeout: 60\nretry:\n  attempts: 5\n  jitter: 0.0\n",
        )
        .unwrap();

        assert_eq!(config.max_global, 4);
        assert_eq!(config.max_per_host, 1);
        assert_eq!(config.task_timeout, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_yaml("max_global: 0").is_err());
        assert!(EngineConfig::from_yaml("retry: { attempts: 0 }").is_err());
        assert!(EngineConfig::from_yaml("retry: { jitter: 2.0 }").is_err());
        assert!(EngineConfig::from_yaml("forks: 3").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_per_host: 2\nidle_ttl: 10").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_per_host, 2);
        assert_eq!(config.idle_ttl, Duration::from_secs(10));

        assert!(matches!(
            EngineConfig::from_file(Path::new("/nonexistent/catalyst.yaml")),
            Err(EngineError::Io { .. })
        ));
    }
}
