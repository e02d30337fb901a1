//! TOML configuration of the programs built on this crate.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:0"
//!
//! [responder]
//! size = 65536
//! num_sges = 4
//! persistent = true
//!
//! [initiator]
//! server = "10.0.0.1"
//! task_flags = 1
//!
//! [log]
//! debug_mask = 3
//! ```
//!
//! Every section and key is optional.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::ServerConfig;
use crate::task::{InitiatorConfig, ResponderConfig};

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration")]
    Io(#[from] io::Error),

    #[error("bad configuration")]
    Parse(#[from] toml::de::Error),
}

/// Debug verbosity bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugMask(pub u32);

impl DebugMask {
    pub const GENERAL: u32 = 1 << 0;
    pub const FAST_PATH: u32 = 1 << 1;

    /// The log level this mask asks for.
    pub fn level(self) -> log::LevelFilter {
        if self.0 & Self::FAST_PATH != 0 {
            log::LevelFilter::Trace
        } else if self.0 & Self::GENERAL != 0 {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub debug_mask: DebugMask,
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub responder: ResponderConfig,
    pub initiator: InitiatorConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::TaskOp;
    use crate::rdma::mr::MemoryKind;

    #[test]
    fn test_empty_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.responder.port, 18515);
        assert_eq!(config.responder.size, 4096);
        assert_eq!(config.initiator.iters, 1000);
        assert_eq!(config.server.backlog, 10);
        assert_eq!(config.log.debug_mask.level(), log::LevelFilter::Info);
    }

    #[test]
    fn test_sections() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind = "10.0.0.1:7471"
            repost_receive = true

            [responder]
            num_sges = 4
            memory = { device = 1 }
            persistent = true
            max_sessions = 2

            [initiator]
            server = "10.0.0.1"
            task_flags = 1

            [log]
            debug_mask = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind.port(), 7471);
        assert!(config.server.repost_receive);
        assert_eq!(config.server.buffer_size, 1024);
        assert_eq!(config.responder.memory, MemoryKind::Device(1));
        assert_eq!(config.responder.max_sessions, Some(2));
        assert_eq!(config.initiator.task_flags.op(), TaskOp::Read);
        assert_eq!(config.log.debug_mask.level(), log::LevelFilter::Trace);
    }

    #[test]
    fn test_bad_file() {
        assert!(matches!(
            Config::from_toml_str("[responder]\nport = \"x\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::load_toml("/nonexistent/rdmatask.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
