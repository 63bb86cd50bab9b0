use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CfsError, CfsResult};

/// Top-level configuration (loaded from veil.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub engine: EngineConfig,
    pub broker: BrokerConfig,
    pub log: LogConfig,
}

impl VeilConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(text: &str) -> CfsResult<Self> {
        let config: VeilConfig =
            toml::from_str(text).map_err(|e| CfsError::Config(format!("parsing config: {e}")))?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Header block size for newly encrypted files (multiple of 512)
    pub default_header_size: u32,
    /// Bytes copied per step while migrating file content
    pub migration_chunk_size: usize,
    /// Continue past tail verification failures instead of aborting
    pub recovery_mode: bool,
    /// Ancestor levels scanned for an AutoConfig file on an unmatched open
    pub discovery_depth: u32,
    /// Hidden per-directory policy file name
    pub autoconfig_name: String,
    /// Write AutoConfig files into directories created under a policy
    pub propagate_autoconfig: bool,
    /// TTL for directories known to have no AutoConfig file
    pub negative_cache_ttl_secs: u64,
    /// Window in which a copy/move out of a tracked tree is re-attached
    pub escape_window_ms: u64,
}

impl EngineConfig {
    pub fn validate(&self) -> CfsResult<()> {
        if self.default_header_size == 0 || self.default_header_size % 512 != 0 {
            return Err(CfsError::Config(format!(
                "engine.default_header_size must be a non-zero multiple of 512, got {}",
                self.default_header_size
            )));
        }
        if self.default_header_size > 64 * 1024 {
            return Err(CfsError::Config(format!(
                "engine.default_header_size must not exceed 65536, got {}",
                self.default_header_size
            )));
        }
        if self.migration_chunk_size < 512 {
            return Err(CfsError::Config(format!(
                "engine.migration_chunk_size must be at least 512, got {}",
                self.migration_chunk_size
            )));
        }
        if self.autoconfig_name.is_empty() || self.autoconfig_name.contains(['/', '\\']) {
            return Err(CfsError::Config(format!(
                "engine.autoconfig_name must be a plain file name, got {:?}",
                self.autoconfig_name
            )));
        }
        Ok(())
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl_secs)
    }

    pub fn escape_window(&self) -> Duration {
        Duration::from_millis(self.escape_window_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_header_size: 512,
            migration_chunk_size: 64 * 1024,
            recovery_mode: false,
            discovery_depth: 8,
            autoconfig_name: ".veil-autoconfig".into(),
            propagate_autoconfig: true,
            negative_cache_ttl_secs: 30,
            escape_window_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Time to wait for the key agent to answer one request
    pub timeout_ms: u64,
    /// Attempts made while another request occupies the slot
    pub max_attempts: u32,
    /// Delay between attempts on a busy slot
    pub backoff_ms: u64,
}

impl BrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_attempts: 5,
            backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
