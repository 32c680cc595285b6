//! Engine configuration, loadable from TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AofError, Result};

/// Which side of the protocol an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    /// Issues writes and durability requests.
    #[serde(rename = "rpma_aof_client")]
    Client,
    /// Exposes the workspace and answers durability requests.
    #[serde(rename = "rpma_aof_server")]
    Server,
}

impl EngineKind {
    /// Registered engine name.
    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Client => "rpma_aof_client",
            EngineKind::Server => "rpma_aof_server",
        }
    }

    /// Look an engine up by its registered name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rpma_aof_client" => Some(EngineKind::Client),
            "rpma_aof_server" => Some(EngineKind::Server),
            _ => None,
        }
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Client
    }
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Message buffer slots.
    pub msg_num: u32,
    /// Requests that may be outstanding at once (iodepth).
    pub max_outstanding_writes: u32,
    /// Durable requests that may be outstanding at once.
    pub durability_msg_count: u32,
    /// Size of the local data region writes are sourced from.
    pub data_region_size: u64,
    /// How long a posted request may wait for its outcome.
    pub response_timeout_ms: u64,
    /// Spin instead of sleeping while waiting for completions.
    pub busy_wait_polling: bool,
    /// Run every request synchronously.
    pub sync: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            msg_num: 64,
            max_outstanding_writes: 32,
            durability_msg_count: 32,
            data_region_size: 1 << 20,
            response_timeout_ms: 5000,
            busy_wait_polling: false,
            sync: false,
        }
    }
}

impl ClientConfig {
    /// Response timeout as a `Duration`.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.msg_num == 0 {
            return Err(AofError::invalid_config("client msg_num must be non-zero"));
        }
        if self.max_outstanding_writes == 0 {
            return Err(AofError::invalid_config(
                "max_outstanding_writes must be non-zero",
            ));
        }
        if self.data_region_size == 0 {
            return Err(AofError::invalid_config("data_region_size must be non-zero"));
        }
        if self.response_timeout_ms == 0 {
            return Err(AofError::invalid_config("response_timeout_ms must be non-zero"));
        }
        if self.durability_msg_count > self.msg_num {
            return Err(AofError::invalid_config(format!(
                "durability_msg_count {} exceeds msg_num {}",
                self.durability_msg_count, self.msg_num
            )));
        }
        Ok(())
    }
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Durability requests the server can hold; advertised to clients.
    pub max_msg_num: u32,
    /// Size of the workspace clients write into.
    pub workspace_size: u64,
    /// Spin instead of sleeping while waiting for completions.
    pub busy_wait_polling: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_msg_num: 64,
            workspace_size: 64 << 20,
            busy_wait_polling: false,
        }
    }
}

impl ServerConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_msg_num == 0 {
            return Err(AofError::invalid_config("max_msg_num must be non-zero"));
        }
        if self.workspace_size == 0 {
            return Err(AofError::invalid_config("workspace_size must be non-zero"));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine to run.
    pub engine: EngineKind,
    /// Client settings.
    pub client: ClientConfig,
    /// Server settings.
    pub server: ServerConfig,
}

impl EngineConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| AofError::invalid_config(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| AofError::invalid_config(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(AofError::invalid_config(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate both sides.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.server.validate()
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AofError::Serialization(e.to_string()))
    }
}
