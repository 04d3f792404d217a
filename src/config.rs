//! Configuration management for windowgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WindowgateError};
use crate::ratelimit::{
    default_policies, Clock, KeyScope, PolicyConfig, PolicyRegistry, RateLimiter, SystemClock,
};

/// Main configuration for the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowgateConfig {
    /// Limiter tuning
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Policy table, enumerated once at startup
    #[serde(default = "default_policies")]
    pub policies: Vec<PolicyConfig>,
}

impl Default for WindowgateConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterSettings::default(),
            policies: default_policies(),
        }
    }
}

/// Limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Minimum seconds between two sweeps of the same entry
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Whether histories are isolated per policy or shared per identifier
    #[serde(default)]
    pub key_scope: KeyScope,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            key_scope: KeyScope::default(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    10
}

impl WindowgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WindowgateError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Validate the policy table into a registry.
    pub fn registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::from_config(&self.policies)
    }

    /// Build a limiter over the system clock.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        self.build_limiter_with_clock(SystemClock)
    }

    /// Build a limiter driven by the given clock.
    pub fn build_limiter_with_clock<C: Clock>(&self, clock: C) -> Result<RateLimiter<C>> {
        Ok(RateLimiter::with_clock(self.registry()?, clock)
            .scope(self.limiter.key_scope)
            .sweep_interval(Duration::from_secs(self.limiter.sweep_interval_secs)))
    }
}
