//! Named rate limit policies and the registry that resolves them.
//!
//! Policies are registered once when the process starts and are read-only
//! afterwards. Call sites refer to them by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WindowgateError};

/// An immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    max_admissions: u32,
    window: Duration,
    denial_message: String,
}

impl Policy {
    /// Create a policy, rejecting a zero ceiling or an empty window.
    pub fn new(
        name: impl Into<String>,
        max_admissions: u32,
        window: Duration,
        denial_message: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(WindowgateError::Config(
                "policy name must not be empty".to_string(),
            ));
        }
        if max_admissions == 0 {
            return Err(WindowgateError::Config(format!(
                "policy '{}': max_admissions must be positive",
                name
            )));
        }
        if window.is_zero() {
            return Err(WindowgateError::Config(format!(
                "policy '{}': window must be positive",
                name
            )));
        }

        Ok(Self {
            name,
            max_admissions,
            window,
            denial_message: denial_message.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum admissions allowed within one window.
    pub fn max_admissions(&self) -> u32 {
        self.max_admissions
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Message shown to the end user when this policy denies a request.
    pub fn denial_message(&self) -> &str {
        &self.denial_message
    }
}

/// A policy as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Name call sites use to reference the policy
    pub name: String,
    /// Number of admissions allowed per window
    pub max_admissions: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// Message returned with a denial
    pub denial_message: String,
}

impl TryFrom<&PolicyConfig> for Policy {
    type Error = WindowgateError;

    fn try_from(config: &PolicyConfig) -> Result<Self> {
        Policy::new(
            config.name.clone(),
            config.max_admissions,
            Duration::from_secs(config.window_secs),
            config.denial_message.clone(),
        )
    }
}

/// The built-in policy table used when no configuration file is given.
pub fn default_policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig {
            name: "auth".to_string(),
            max_admissions: 5,
            window_secs: 60,
            denial_message: "Too many sign-in attempts. Please wait before trying again."
                .to_string(),
        },
        PolicyConfig {
            name: "search".to_string(),
            max_admissions: 30,
            window_secs: 60,
            denial_message: "Too many searches. Please slow down and try again shortly."
                .to_string(),
        },
        PolicyConfig {
            name: "upload".to_string(),
            max_admissions: 10,
            window_secs: 3600,
            denial_message: "Upload limit reached. Please try again later.".to_string(),
        },
    ]
}

/// Read-only set of named policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    /// Register a set of policies. Names must be unique.
    pub fn from_policies<I>(policies: I) -> Result<Self>
    where
        I: IntoIterator<Item = Policy>,
    {
        let mut map = HashMap::new();
        for policy in policies {
            let name = policy.name().to_string();
            if map.insert(name.clone(), Arc::new(policy)).is_some() {
                return Err(WindowgateError::Config(format!(
                    "policy '{}' is defined more than once",
                    name
                )));
            }
        }

        info!(count = map.len(), "Rate limit policies registered");
        Ok(Self { policies: map })
    }

    /// Build a registry from configuration entries.
    pub fn from_config(configs: &[PolicyConfig]) -> Result<Self> {
        let policies = configs
            .iter()
            .map(Policy::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::from_policies(policies)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Result<Arc<Policy>> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| WindowgateError::PolicyNotFound(name.to_string()))
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
