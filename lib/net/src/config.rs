// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network configuration.
//!
//! Configuration is loaded by merging, lowest priority first:
//! 1. Built-in defaults.
//! 2. An optional TOML file pointed to by the `ARB_CONFIG_PATH` environment
//!    variable.
//! 3. `ARB_`-prefixed environment variables (highest priority), e.g.
//!    `ARB_MAX_FANOUT=8`, `ARB_ADOPTION_POLICY=sorted_rr`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// ENV pointing at an optional TOML configuration file.
const CONFIG_PATH_ENV: &str = "ARB_CONFIG_PATH";

/// Prefix for configuration environment variables.
const ENV_PREFIX: &str = "ARB_";

/// Selection policy used when an orphaned subtree picks a new parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdoptionPolicy {
    /// Uniform choice over all valid candidates.
    Random,
    /// Weighted random sampling by adoption score (default).
    #[default]
    WeightedRandom,
    /// Deterministic best-score-first selection, for reproducible testing.
    SortedRoundRobin,
}

impl fmt::Display for AdoptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::WeightedRandom => write!(f, "wrs"),
            Self::SortedRoundRobin => write!(f, "sorted_rr"),
        }
    }
}

impl FromStr for AdoptionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "wrs" | "weighted" | "weighted_random" => Ok(Self::WeightedRandom),
            "sorted_rr" | "sorted" => Ok(Self::SortedRoundRobin),
            _ => Err(anyhow::anyhow!(
                "Invalid adoption policy: '{}'. Valid options are: 'random', 'wrs', 'sorted_rr'",
                s
            )),
        }
    }
}

/// Tunables for a [`crate::network::Network`] instance.
///
/// Every node in a tree should run with the same fan-out bounds; the adoption
/// policy and retry bound only matter on nodes that may become orphans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Fan-out an adopter is rewarded for reaching.
    pub min_fanout: usize,
    /// Fan-out an adopter is penalized for exceeding.
    pub max_fanout: usize,
    /// How an orphan picks among candidate adopters.
    pub adoption_policy: AdoptionPolicy,
    /// Distinct adopter connection attempts before a subtree is declared
    /// permanently failed.
    pub max_adoption_attempts: u32,
    /// Whether peer loss triggers automatic adoption at all.
    pub recovery_enabled: bool,
    /// Timeout for initial connection establishment and adoption connects.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long the front-end waits for shutdown acknowledgements.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Upper bound on a single wire frame.
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_fanout: 2,
            max_fanout: 32,
            adoption_policy: AdoptionPolicy::default(),
            max_adoption_attempts: 5,
            recovery_enabled: true,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from defaults, optional TOML file, and environment.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_fanout == 0 || self.min_fanout > self.max_fanout {
            anyhow::bail!(
                "invalid fanout bounds: min_fanout={} max_fanout={}",
                self.min_fanout,
                self.max_fanout
            );
        }
        if self.max_adoption_attempts == 0 {
            anyhow::bail!("max_adoption_attempts must be at least 1");
        }
        Ok(())
    }

    /// Builder-style override of the fan-out band.
    pub fn with_fanout(mut self, min: usize, max: usize) -> Self {
        self.min_fanout = min;
        self.max_fanout = max;
        self
    }

    pub fn with_adoption_policy(mut self, policy: AdoptionPolicy) -> Self {
        self.adoption_policy = policy;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adoption_policy_from_str() {
        assert_eq!(
            "random".parse::<AdoptionPolicy>().unwrap(),
            AdoptionPolicy::Random
        );
        assert_eq!(
            "wrs".parse::<AdoptionPolicy>().unwrap(),
            AdoptionPolicy::WeightedRandom
        );
        assert_eq!(
            "WEIGHTED".parse::<AdoptionPolicy>().unwrap(),
            AdoptionPolicy::WeightedRandom
        );
        assert_eq!(
            "sorted_rr".parse::<AdoptionPolicy>().unwrap(),
            AdoptionPolicy::SortedRoundRobin
        );
        assert!("invalid".parse::<AdoptionPolicy>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.adoption_policy, AdoptionPolicy::WeightedRandom);
        assert!(config.recovery_enabled);
    }

    #[test]
    fn test_invalid_fanout_band_rejected() {
        let config = NetworkConfig::default().with_fanout(8, 4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = NetworkConfig::default()
            .with_fanout(2, 4)
            .with_adoption_policy(AdoptionPolicy::SortedRoundRobin)
            .with_recovery(false);
        assert_eq!(config.min_fanout, 2);
        assert_eq!(config.max_fanout, 4);
        assert_eq!(config.adoption_policy, AdoptionPolicy::SortedRoundRobin);
        assert!(!config.recovery_enabled);
    }
}
