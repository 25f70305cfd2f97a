// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-group configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `VELO_COLLECTIVE_CONFIG_PATH` environment variable
//! 3. Environment variables (`VELO_COLLECTIVE_*`, backoff under `VELO_COLLECTIVE_BACKOFF_*`)

use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::backoff::{BackoffError, ExponentialBackoffWithJitter};
use crate::process_group::ProcessGroupOptions;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    /// Values were read but violate a constraint.
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    /// Anything else.
    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Verbosity of per-collective logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    /// No per-collective logging beyond `trace`.
    #[default]
    #[serde(alias = "OFF")]
    Off,
    /// Lifecycle events only.
    #[serde(alias = "INFO")]
    Info,
    /// Every routed collective at `debug`.
    #[serde(alias = "DETAIL")]
    Detail,
}

/// Longest accepted group timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted backoff cap: one hour.
pub const MAX_BACKOFF_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Retry pacing for backend construction.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_intervals"))]
#[serde(default)]
pub struct BackoffConfig {
    /// First wait, in milliseconds.
    #[validate(range(min = 1))]
    pub initial_interval_ms: u64,

    /// Growth factor between waits.
    #[validate(range(min = 1.0))]
    pub multiplier: f64,

    /// Jitter spread; each wait is scaled by a factor in `[1 - f, 1 + f]`.
    #[validate(range(min = 0.0, max = 1.0))]
    pub randomization_factor: f64,

    /// Cap on the wait before jitter, in milliseconds.
    #[validate(range(max = MAX_BACKOFF_INTERVAL_MS))]
    pub max_interval_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: ExponentialBackoffWithJitter::DEFAULT_INITIAL_INTERVAL.as_millis() as u64,
            multiplier: ExponentialBackoffWithJitter::DEFAULT_MULTIPLIER,
            randomization_factor: ExponentialBackoffWithJitter::DEFAULT_RANDOMIZATION_FACTOR,
            max_interval_ms: ExponentialBackoffWithJitter::DEFAULT_MAX_INTERVAL.as_millis() as u64,
        }
    }
}

impl BackoffConfig {
    /// Build the policy these settings describe.
    pub fn build(&self) -> Result<ExponentialBackoffWithJitter, BackoffError> {
        ExponentialBackoffWithJitter::with_params(
            Duration::from_millis(self.initial_interval_ms),
            self.multiplier,
            self.randomization_factor,
            Duration::from_millis(self.max_interval_ms),
        )
    }
}

fn validate_intervals(config: &BackoffConfig) -> Result<(), ValidationError> {
    if config.initial_interval_ms > config.max_interval_ms {
        return Err(ValidationError::new("initial_interval_exceeds_max"));
    }
    Ok(())
}

/// Top-level process-group configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CollectiveConfig {
    /// Backend spec, e.g. `"gloo"` or `"cpu:gloo,cuda:nccl"`.
    #[validate(length(min = 1))]
    pub backend: String,

    /// Default operation timeout, in seconds.
    #[validate(range(min = 1, max = MAX_TIMEOUT_SECS))]
    pub timeout_secs: u64,

    /// Per-collective logging verbosity.
    pub debug_level: DebugLevel,

    /// Initial group description.
    pub group_desc: String,

    /// Retry pacing for backend construction.
    #[validate(nested)]
    pub backoff: BackoffConfig,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            backend: "gloo".to_string(),
            timeout_secs: 1800,
            debug_level: DebugLevel::Off,
            group_desc: String::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl CollectiveConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("VELO_COLLECTIVE_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(CollectiveConfig::default()))
            .merge(Toml::file(&config_path))
            // Top-level: VELO_COLLECTIVE_BACKEND, VELO_COLLECTIVE_TIMEOUT_SECS, ...
            .merge(
                Env::prefixed("VELO_COLLECTIVE_").filter(|k| {
                    let key = k.as_str().to_lowercase();
                    !key.starts_with("backoff_") && key != "config_path"
                }),
            )
            // Backoff: VELO_COLLECTIVE_BACKOFF_INITIAL_INTERVAL_MS, ...
            .merge(
                Env::prefixed("VELO_COLLECTIVE_BACKOFF_")
                    .map(|k| format!("backoff.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Load configuration with JSON overrides at the highest priority.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }

    /// Default operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Options for [`ProcessGroup::new`](crate::ProcessGroup::new).
    pub fn process_group_options(&self) -> ProcessGroupOptions {
        ProcessGroupOptions {
            backend: self.backend.clone(),
            timeout: self.timeout(),
            group_desc: self.group_desc.clone(),
            debug_level: self.debug_level,
        }
    }
}
