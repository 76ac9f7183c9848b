//! Coordination configuration.
//!
//! Every field has a default, so an empty document (or `CoordConfig::default()`)
//! is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::paths::PathScheme;

pub const DEFAULT_BASE_PATH: &str = "/quorum";
pub const DEFAULT_RELAY_CEILING_MS: u64 = 60_000;
pub const DEFAULT_TRANSIENT_RETRY_MS: u64 = 250;
pub const DEFAULT_CORE_WORKERS: usize = 2;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_RECHECK_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_ADMIN_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordConfig {
    pub base_path: String,
    /// Written into every reservation payload. Random when unset.
    pub owner_id: Option<String>,
    pub relay_ceiling_ms: u64,
    pub transient_retry_ms: u64,
    pub observer: ObserverConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObserverConfig {
    pub core_workers: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
    pub idle_timeout_ms: u64,
    pub recheck_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_reservation_hold_ms: Option<u64>,
    pub sweep_empty_entities: bool,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_owned(),
            owner_id: None,
            relay_ceiling_ms: DEFAULT_RELAY_CEILING_MS,
            transient_retry_ms: DEFAULT_TRANSIENT_RETRY_MS,
            observer: ObserverConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            core_workers: DEFAULT_CORE_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            recheck_interval_ms: DEFAULT_RECHECK_INTERVAL_MS,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_ADMIN_INTERVAL_MS,
            max_reservation_hold_ms: None,
            sweep_empty_entities: false,
        }
    }
}

impl CoordConfig {
    /// Reads a config file, trying JSON first and YAML second.
    pub fn parse<P: AsRef<Path>>(path: P) -> CoordResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|err| {
            CoordError::Config(format!("failed to read config at {}: {err}", path.display()))
        })?;
        Self::parse_str(input)
    }

    /// Decodes a config document, trying JSON first and YAML second.
    pub fn parse_str<S: AsRef<str>>(input: S) -> CoordResult<Self> {
        let input = input.as_ref();
        let config: CoordConfig = match serde_json::from_str(input) {
            Ok(config) => config,
            Err(json_err) => serde_yaml::from_str(input).map_err(|yaml_err| {
                CoordError::Config(format!(
                    "config is neither JSON ({json_err}) nor YAML ({yaml_err})"
                ))
            })?,
        };
        config.validate()?;
        debug!(?config);
        Ok(config)
    }

    pub fn validate(&self) -> CoordResult<()> {
        PathScheme::new(&self.base_path)?;
        if self.relay_ceiling_ms == 0 {
            return Err(CoordError::Config("relay_ceiling_ms must be > 0".into()));
        }
        if let Some(owner) = &self.owner_id
            && owner.is_empty()
        {
            return Err(CoordError::Config("owner_id must not be empty".into()));
        }
        self.observer.validate()?;
        self.admin.validate()
    }

    pub fn relay_ceiling(&self) -> Duration {
        Duration::from_millis(self.relay_ceiling_ms)
    }

    pub fn transient_retry(&self) -> Duration {
        Duration::from_millis(self.transient_retry_ms)
    }
}

impl ObserverConfig {
    pub fn validate(&self) -> CoordResult<()> {
        if self.core_workers == 0 {
            return Err(CoordError::Config("observer.core_workers must be > 0".into()));
        }
        if self.max_workers < self.core_workers {
            return Err(CoordError::Config(format!(
                "observer.max_workers ({}) must be >= core_workers ({})",
                self.max_workers, self.core_workers
            )));
        }
        if self.queue_depth == 0 {
            return Err(CoordError::Config("observer.queue_depth must be > 0".into()));
        }
        if self.recheck_interval_ms == 0 {
            return Err(CoordError::Config(
                "observer.recheck_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }
}

impl AdminConfig {
    pub fn validate(&self) -> CoordResult<()> {
        if self.enabled && self.interval_ms == 0 {
            return Err(CoordError::Config("admin.interval_ms must be > 0".into()));
        }
        if self.max_reservation_hold_ms == Some(0) {
            return Err(CoordError::Config(
                "admin.max_reservation_hold_ms must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_reservation_hold(&self) -> Option<Duration> {
        self.max_reservation_hold_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoordConfig::default();
        assert_eq!(cfg.base_path, DEFAULT_BASE_PATH);
        assert_eq!(cfg.relay_ceiling(), Duration::from_secs(60));
        assert_eq!(cfg.observer.recheck_interval(), Duration::from_secs(60));
        assert!(cfg.admin.enabled);
        assert!(cfg.admin.max_reservation_hold().is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let cfg = CoordConfig::parse_str(
            r#"
base_path: /apps/coord
owner_id: worker-7
observer:
  core_workers: 1
  max_workers: 4
admin:
  max_reservation_hold_ms: 30000
"#,
        )
        .unwrap();
        assert_eq!(cfg.base_path, "/apps/coord");
        assert_eq!(cfg.owner_id.as_deref(), Some("worker-7"));
        assert_eq!(cfg.observer.core_workers, 1);
        assert_eq!(cfg.observer.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(
            cfg.admin.max_reservation_hold(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_parse_json() {
        let cfg = CoordConfig::parse_str(r#"{"relay_ceiling_ms": 500}"#).unwrap();
        assert_eq!(cfg.relay_ceiling(), Duration::from_millis(500));
        assert_eq!(cfg.base_path, DEFAULT_BASE_PATH);
    }

    #[test]
    fn test_invalid_values() {
        assert!(CoordConfig::parse_str("base_path: relative").is_err());
        assert!(
            CoordConfig::parse_str("observer:\n  core_workers: 4\n  max_workers: 2\n")
                .unwrap_err()
                .is_config()
        );
        assert!(CoordConfig::parse_str("observer:\n  queue_depth: 0\n").is_err());
        assert!(CoordConfig::parse_str("unknown_field: 1").is_err());
        assert!(CoordConfig::parse_str("admin:\n  max_reservation_hold_ms: 0\n").is_err());
    }
}
