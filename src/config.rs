//! TOML configuration for the relay binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// On-disk configuration.
///
/// ```toml
/// listen_addr = "0.0.0.0:2222"
/// destination_port = 22
/// host_key = "/etc/sshgate/host_key"
///
/// [routes]
/// alice = "10.0.0.11"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the relay listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port resolved backend hosts are dialed on.
    #[serde(default = "default_destination_port")]
    pub destination_port: u16,

    /// Path to the OpenSSH private key presented to downstream clients.
    pub host_key: PathBuf,

    /// Optional pinned backend host key (authorized_keys format). When
    /// unset, any backend key is accepted: run the relay on a trusted
    /// network or pin a key here.
    #[serde(default)]
    pub backend_host_key: Option<String>,

    /// Username to backend host table for the built-in static resolver.
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:2222".to_owned()
}

fn default_destination_port() -> u16 {
    22
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })
    }
}
