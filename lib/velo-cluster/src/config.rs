// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network layer configuration.

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const MIB: usize = 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Staging segments used to pack and receive strided payloads.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StagingConfig {
    /// Capacity of the pack segment. Strided transfers reserve `size * count`
    /// bytes from it; running out is fatal.
    #[validate(range(min = 1))]
    pub pack_segment_bytes: usize,

    /// Capacity of the receive segment strided payloads land in before being
    /// unpacked.
    #[validate(range(min = 1))]
    pub receive_segment_bytes: usize,

    /// Largest packed length a single strided get may request. Larger gets
    /// are split into row-aligned chunks.
    #[validate(range(min = 1))]
    pub max_get_strided_len: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            pack_segment_bytes: 8 * MIB,
            receive_segment_bytes: 8 * MIB,
            max_get_strided_len: MIB,
        }
    }
}

/// Behaviour of the cooperative polling loops.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PollConfig {
    /// Spin iterations between `yield_now` calls while a synchronous call
    /// (malloc, get, barrier) waits for its reply.
    #[validate(range(min = 1))]
    pub yield_every: u32,

    /// Delay queue length above which a warning is logged.
    pub delay_queue_warn_len: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            yield_every: 64,
            delay_queue_warn_len: 1024,
        }
    }
}

/// Top-level configuration of the network layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct NetworkConfig {
    #[validate(nested)]
    #[serde(default)]
    pub staging: StagingConfig,

    #[validate(nested)]
    #[serde(default)]
    pub poll: PollConfig,
}

impl NetworkConfig {
    /// Create a Figment configuration with all sources merged.
    ///
    /// Configuration sources in priority order (lowest to highest):
    /// 1. Code defaults
    /// 2. TOML file from VELO_CLUSTER_CONFIG_PATH environment variable
    /// 3. Environment variables (VELO_CLUSTER_* prefixed)
    pub fn figment() -> Figment {
        let config_path = std::env::var("VELO_CLUSTER_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(NetworkConfig::default()))
            .merge(Toml::file(&config_path))
            // VELO_CLUSTER_STAGING_PACK_SEGMENT_BYTES, VELO_CLUSTER_STAGING_MAX_GET_STRIDED_LEN
            .merge(
                Env::prefixed("VELO_CLUSTER_STAGING_")
                    .map(|k| format!("staging.{}", k.as_str().to_lowercase()).into()),
            )
            // VELO_CLUSTER_POLL_YIELD_EVERY, VELO_CLUSTER_POLL_DELAY_QUEUE_WARN_LEN
            .merge(
                Env::prefixed("VELO_CLUSTER_POLL_")
                    .map(|k| format!("poll.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider and validate it.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = NetworkConfig::extract_from(
    ///     NetworkConfig::figment().merge(("staging.pack_segment_bytes", 4096usize))
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

impl Provider for NetworkConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("NetworkConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}
