use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Visibility tracker configuration.
///
/// The numeric policy knobs here (compress heuristics, defer-cleanup age,
/// retry cadence) ship with the defaults the subsystem was tuned with, but
/// none of them is load-bearing for correctness and deployments override
/// them in `kestrel.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Maximum concurrently connected backends. Sizes the shared slot pool;
    /// exceeding it at runtime is a startup-sizing bug, not a recoverable
    /// condition.
    pub max_backends: usize,
    /// Maximum prepared (in-doubt two-phase) transactions held in
    /// placeholder slots at once.
    #[serde(default = "default_max_prepared")]
    pub max_prepared: usize,
    /// How many ids behind the computed oldest-running horizon cleanup is
    /// additionally deferred (0 = no deferral).
    #[serde(default)]
    pub defer_cleanup_age: u32,
    #[serde(default)]
    pub replay: ReplaySetConfig,
    #[serde(default)]
    pub backend_wait: BackendWaitConfig,
}

fn default_max_prepared() -> usize {
    32
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_backends: 128,
            max_prepared: default_max_prepared(),
            defer_cleanup_age: 0,
            replay: ReplaySetConfig::default(),
            backend_wait: BackendWaitConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Validate startup sizing. Called once before the shared state is
    /// allocated; all later capacity checks assume these hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_backends == 0 {
            return Err(ConfigError::ZeroBackends);
        }
        if self.replay.compress_min_density_pct == 0 || self.replay.compress_min_density_pct > 100
        {
            return Err(ConfigError::InvalidDensity(
                self.replay.compress_min_density_pct,
            ));
        }
        if self.replay.compress_span_factor == 0 {
            return Err(ConfigError::ZeroSpanFactor);
        }
        Ok(())
    }
}

/// Tuning for the known-assigned replay set used during hot-standby replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySetConfig {
    /// Lazy compaction runs only when valid entries occupy less than this
    /// percentage of the used span.
    pub compress_min_density_pct: u32,
    /// ... and the used span exceeds `compress_span_factor * max_backends`.
    pub compress_span_factor: usize,
    /// Extra arena entries on top of the worst-case
    /// `max_backends * (subxid cache + 1)` sizing.
    pub slack_entries: usize,
}

impl Default for ReplaySetConfig {
    fn default() -> Self {
        Self {
            compress_min_density_pct: 50,
            compress_span_factor: 4,
            slack_entries: 64,
        }
    }
}

/// Retry cadence for waiting on other backends to voluntarily exit
/// (e.g. before dropping a database).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendWaitConfig {
    /// Number of recheck attempts before giving up.
    pub attempts: u32,
    /// Sleep between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for BackendWaitConfig {
    fn default() -> Self {
        Self {
            attempts: 50,
            delay_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_backends_rejected() {
        let cfg = TrackerConfig {
            max_backends: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroBackends)));
    }

    #[test]
    fn test_bad_density_rejected() {
        let mut cfg = TrackerConfig::default();
        cfg.replay.compress_min_density_pct = 150;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidDensity(150))
        ));
        cfg.replay.compress_min_density_pct = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidDensity(0))));
    }

    #[test]
    fn test_serde_defaults_fill_sections() {
        let cfg: TrackerConfig =
            serde_json::from_str(r#"{"max_backends": 64}"#).expect("partial config parses");
        assert_eq!(cfg.max_backends, 64);
        assert_eq!(cfg.max_prepared, 32);
        assert_eq!(cfg.replay.compress_min_density_pct, 50);
        assert_eq!(cfg.backend_wait.attempts, 50);
    }
}
