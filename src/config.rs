//! Configuration loaded from `irwatch.toml` with CLI overrides.
//!
//! # Example
//!
//! ```toml
//! [serve]
//! interface = "127.0.0.1"   # Network interface (127.0.0.1 = localhost only)
//! port = 8080               # WebSocket port number
//! dir = "sources"           # Source root to watch
//!
//! [watch]
//! debounce_ms = 300         # Coalescing window for raw file events
//! ```
//!
//! Use `interface = "0.0.0.0"` to make the server accessible from LAN.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, Commands};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serve: ServeConfig,
    pub watch: WatchConfig,
}

/// `[serve]` section: listener settings and the source root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
    /// Network interface to bind.
    /// - `127.0.0.1` (default): localhost only
    /// - `0.0.0.0`: all interfaces (LAN accessible)
    pub interface: IpAddr,

    /// WebSocket port number.
    pub port: u16,

    /// Directory containing the source files viewers may subscribe to.
    pub dir: PathBuf,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            interface: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 8080,
            dir: PathBuf::from("."),
        }
    }
}

/// `[watch]` section: event coalescing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Coalescing window for raw filesystem events, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

impl Config {
    /// Load config from the CLI-specified file (missing file = defaults),
    /// then apply CLI flag overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("invalid config: {}", cli.config.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot read config: {}", cli.config.display()));
            }
        };

        let Commands::Serve {
            dir,
            interface,
            port,
        } = &cli.command;
        if let Some(dir) = dir {
            config.serve.dir = dir.clone();
        }
        if let Some(interface) = interface {
            config.serve.interface = *interface;
        }
        if let Some(port) = port {
            config.serve.port = *port;
        }

        Ok(config)
    }

    /// Absolute source root, resolved and validated.
    pub fn source_root(&self) -> Result<PathBuf> {
        let root = self.serve.dir.as_path();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        anyhow::ensure!(
            root.is_dir(),
            "source directory does not exist: {}",
            root.display()
        );
        // canonicalize so prefix checks against subscriber paths are reliable
        Ok(root.canonicalize()?)
    }
}

#[cfg(test)]
pub(crate) fn test_parse_config(toml_text: &str) -> Config {
    toml::from_str(toml_text).expect("test config must parse")
}
