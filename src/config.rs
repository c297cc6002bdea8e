//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. `APP_`-prefixed environment variables, sections separated by `__`
//!    (`APP_POOL__CAPACITY=8`, `APP_ENGINE__DEVICE=cuda`)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! ## Mutability:
//! Pool capacity and the engine settings are read once, when the transcription
//! service is built. Only `pool.default_threads` and `audio.max_body_mb` can be
//! changed at runtime through [`AppConfig::update_from_json`].

use crate::device::DevicePreference;
use crate::transcription::engine::{AlignmentHeadsPreset, ContextParams, SAMPLE_RATE};
use crate::transcription::pool::MAX_CAPACITY;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub engine: EngineConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// - `host`: IP address or hostname to bind to ("127.0.0.1", "0.0.0.0")
/// - `port`: TCP port to listen on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Context pool settings.
///
/// ## Fields:
/// - `capacity`: Number of context slots (each slot may hold one loaded model)
/// - `default_threads`: Thread count requested for a job when the client does not
///   ask for one. The job builder still applies its own caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub capacity: usize,
    pub default_threads: i32,
}

/// Inference engine settings, applied to every context at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// "auto", "cpu", "cuda" or "metal"
    pub device: String,
    /// Attention-head preset used for token timestamp alignment
    pub aheads_preset: String,
    pub dtw_token_timestamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Expected sample rate of uploaded audio (informational)
    pub sample_rate: u32,
    /// Largest accepted request body for a transcription upload
    pub max_body_mb: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            pool: PoolConfig {
                capacity: 4,
                default_threads: 4,
            },
            engine: EngineConfig {
                device: "cpu".to_string(),
                aheads_preset: AlignmentHeadsPreset::BaseEn.to_string(),
                dtw_token_timestamps: true,
            },
            audio: AudioConfig {
                sample_rate: SAMPLE_RATE as u32,
                max_body_mb: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms commonly set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.pool.capacity == 0 || self.pool.capacity > MAX_CAPACITY {
            return Err(anyhow!(
                "Pool capacity must be between 1 and {} (got {})",
                MAX_CAPACITY,
                self.pool.capacity
            ));
        }

        if self.pool.default_threads < 1 {
            return Err(anyhow!("Default thread count must be at least 1"));
        }

        if self.audio.max_body_mb == 0 {
            return Err(anyhow!("Maximum body size must be greater than 0"));
        }

        self.device_preference()?;
        self.context_params()?;

        Ok(())
    }

    pub fn device_preference(&self) -> Result<DevicePreference> {
        self.engine.device.parse::<DevicePreference>().map_err(|e| anyhow!(e))
    }

    /// Context construction parameters derived from the engine section.
    pub fn context_params(&self) -> Result<ContextParams> {
        Ok(ContextParams {
            dtw_token_timestamps: self.engine.dtw_token_timestamps,
            aheads_preset: self.engine.aheads_preset.parse()?,
        })
    }

    pub fn max_body_bytes(&self) -> usize {
        self.audio.max_body_mb * 1024 * 1024
    }

    /// Update runtime-mutable configuration from a JSON string.
    ///
    /// Accepts partial documents such as `{"pool": {"default_threads": 8}}`.
    /// Keys that are fixed for the lifetime of the process are rejected rather
    /// than silently ignored. The update is applied only if the result validates.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(object) = partial_config.as_object() {
            for (section, values) in object {
                let keys: Vec<&str> = values
                    .as_object()
                    .map(|v| v.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                for key in keys {
                    match (section.as_str(), key) {
                        ("pool", "default_threads") | ("audio", "max_body_mb") => {}
                        _ => return Err(anyhow!("{}.{} cannot be changed at runtime", section, key)),
                    }
                }
            }
        }

        if let Some(pool) = partial_config.get("pool") {
            if let Some(threads) = pool.get("default_threads").and_then(|v| v.as_i64()) {
                updated.pool.default_threads = i32::try_from(threads).unwrap_or(i32::MAX);
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(max_body) = audio.get("max_body_mb").and_then(|v| v.as_u64()) {
                updated.audio.max_body_mb = max_body as usize;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
