//! Configuration for operators and clients. Every field has a default, so a
//! config file only needs to name what it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assembly::OffsetConvention;
use crate::error::{ProtocolError, Result};
use crate::protocol::{self, Protocol0, DEFAULT_MAX_PAYLOAD};
use crate::unit::VERSION_0;

/// Port operators listen on unless told otherwise
pub const DEFAULT_PORT: u16 = 1600;

// ── Transport ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Deadline for establishing a connection.
    pub connect_timeout_ms: u64,
    /// Read and write deadline on every socket. On the server side this is
    /// also how long an idle connection is kept.
    pub io_timeout_ms: u64,
    /// Largest payload accepted in a single frame.
    pub max_payload_bytes: u64,
    /// Version byte of the protocol variant spoken on every connection.
    pub protocol_version: u8,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            io_timeout_ms: 30_000,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
            protocol_version: VERSION_0,
        }
    }
}

impl NetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    /// Protocol variant named by `protocol_version`
    pub fn protocol(&self) -> Result<Protocol0> {
        protocol::select(self.protocol_version, self.max_payload_bytes)
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind. Empty binds every interface of the chosen family.
    pub host: String,
    pub port: u16,
    pub use_ipv6: bool,
    pub backlog: i32,
    /// Connections handled at the same time.
    pub workers: usize,
    /// Accepted connections waiting for a worker before new ones are refused.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            use_ipv6: false,
            backlog: 5,
            workers: 4,
            queue_capacity: 64,
        }
    }
}

// ── Assembly ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// How an operation's output window is written back into the rows.
    pub offset_convention: OffsetConvention,
}

// ── Top level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub net: NetConfig,
    pub server: ServerConfig,
    pub assembly: AssemblyConfig,
}

impl OperatorConfig {
    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.net.connect_timeout_ms == 0 || self.net.io_timeout_ms == 0 {
            return Err(ProtocolError::Config("timeouts must be non-zero".into()));
        }
        if self.server.workers == 0 {
            return Err(ProtocolError::Config("at least one worker is required".into()));
        }
        if self.server.queue_capacity == 0 {
            return Err(ProtocolError::Config("queue capacity must be non-zero".into()));
        }
        self.net
            .protocol()
            .map_err(|e| ProtocolError::Config(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OperatorConfig::default();
        assert_eq!(cfg.server.port, 1600);
        assert_eq!(cfg.server.backlog, 5);
        assert!(!cfg.server.use_ipv6);
        assert_eq!(cfg.net.io_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.assembly.offset_convention, OffsetConvention::Inclusive);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let cfg = OperatorConfig::from_json_str(
            r#"{"server": {"port": 1700, "workers": 8}, "assembly": {"offset_convention": "exclusive"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 1700);
        assert_eq!(cfg.server.workers, 8);
        assert_eq!(cfg.server.queue_capacity, 64);
        assert_eq!(cfg.net, NetConfig::default());
        assert_eq!(cfg.assembly.offset_convention, OffsetConvention::Exclusive);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = OperatorConfig::from_json_str(r#"{"server": {"workers": 0}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_protocol_version_selects_variant() {
        let cfg = OperatorConfig::default();
        assert_eq!(cfg.net.protocol_version, VERSION_0);
        assert!(cfg.net.protocol().is_ok());

        let err = OperatorConfig::from_json_str(r#"{"net": {"protocol_version": 1}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_json() {
        assert!(OperatorConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = OperatorConfig::load("/nonexistent/operator.json").unwrap_err();
        assert!(err.to_string().contains("operator.json"));
    }
}
