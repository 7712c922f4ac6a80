//! Daemon configuration: a properties-style key=value file, re-read when it
//! changes on disk and broadcast to subscribers.
//!
//! `port` and `clientPort` are required; everything else falls back to a
//! default. The transport `mode` is read once at startup and never re-bound.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use bitbox_proto::HostPort;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not watch configuration: {0}")]
    Watch(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Udp,
}

impl FromStr for TransportMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportMode::Tcp),
            "udp" => Ok(TransportMode::Udp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub advertised_name: String,
    pub port: u16,
    pub peers: Vec<HostPort>,
    pub mode: TransportMode,
    pub block_size: u64,
    pub sync_interval: Duration,
    pub maximum_incoming_connections: usize,
    pub udp_timeout: Duration,
    pub udp_retries: u32,
    pub client_port: u16,
    /// Comma-separated OpenSSH public keys, parsed lazily by the control
    /// channel so invalid entries stay non-fatal.
    pub authorized_keys: String,
}

impl Config {
    /// Our advertised host:port, as sent in handshakes.
    pub fn host_port(&self) -> HostPort {
        HostPort::new(self.advertised_name.clone(), self.port)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut pairs = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let port = require_parsed(get("port"), "port")?;
        let client_port = require_parsed(get("clientPort"), "clientPort")?;

        let peers = match get("peers") {
            None | Some("") => Vec::new(),
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<HostPort>().map_err(|_| ConfigError::InvalidValue {
                        key: "peers",
                        value: s.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
        };

        Ok(Config {
            advertised_name: get("advertisedName").unwrap_or("localhost").to_string(),
            port,
            peers,
            mode: optional_parsed(get("mode"), "mode", TransportMode::Tcp)?,
            block_size: optional_parsed(get("blockSize"), "blockSize", 8192)?,
            sync_interval: Duration::from_secs(optional_parsed(
                get("syncInterval"),
                "syncInterval",
                60,
            )?),
            maximum_incoming_connections: optional_parsed(
                get("maximumIncomingConnections"),
                "maximumIncomingConnections",
                10,
            )?,
            udp_timeout: Duration::from_millis(optional_parsed(
                get("udpTimeout"),
                "udpTimeout",
                1000,
            )?),
            udp_retries: optional_parsed(get("udpRetries"), "udpRetries", 3)?,
            client_port,
            authorized_keys: get("authorized_keys").unwrap_or("").to_string(),
        })
    }
}

fn require_parsed<T: FromStr>(
    value: Option<&str>,
    key: &'static str,
) -> Result<T, ConfigError> {
    let value = value.ok_or(ConfigError::MissingKey(key))?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn optional_parsed<T: FromStr>(
    value: Option<&str>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None | Some("") => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

/// Watches the configuration file and rebroadcasts it on change.
pub struct ConfigWatcher {
    rx: watch::Receiver<Config>,
    // Dropping the watcher stops the notifications.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn start(path: PathBuf) -> Result<Self, ConfigError> {
        let initial = Config::load(&path)?;
        let (tx, rx) = watch::channel(initial);

        let reload_path = path.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(error) => {
                        warn!(%error, "configuration watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                match Config::load(&reload_path) {
                    Ok(config) => {
                        let changed = tx.send_if_modified(|current| {
                            if *current != config {
                                *current = config;
                                true
                            } else {
                                false
                            }
                        });
                        if changed {
                            info!("configuration file modified, values refreshed");
                        }
                    }
                    Err(error) => warn!(%error, "ignoring unreadable configuration update"),
                }
            })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    /// A watcher-less subscription around a fixed config, for embedding and
    /// tests.
    pub fn fixed(config: Config) -> watch::Receiver<Config> {
        let (tx, rx) = watch::channel(config);
        // Keep the channel alive for the life of the process.
        std::mem::forget(tx);
        rx
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.rx.clone()
    }
}
