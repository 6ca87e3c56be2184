//! Configuration system for tether.
//!
//! Resolution order: environment variables → config file → defaults.
//! A missing file is created with the defaults on first load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub bridge: BridgeConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Advertised display name. Empty = "tether".
    pub peer_name: String,
    /// Advertised logical id. Empty = random per run.
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name. Empty = daemon argument.
    pub interface: String,
    /// Local TCP port incoming bridges listen on. 0 = OS-assigned.
    pub server_port: u16,
    /// TCP port of the LAN peer link. 0 = OS-assigned.
    pub transport_port: u16,
    /// UDP port for multicast presence announcements.
    pub announce_port: u16,
    /// Advertise our presence and accept incoming links.
    pub advertise: bool,
}

/// Bridge timing. This is the part of the config the connection manager sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long a bridge waits for its local TCP client.
    pub accept_timeout_ms: u64,
    /// Delay between binding an outgoing bridge and reporting its port. 0 = report on bind.
    pub ready_delay_ms: u64,
    /// How long a connect may wait for the transport's outcome. 0 = forever.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub announce_interval_secs: u64,
    /// How often the full visible-peer snapshot is reconciled.
    pub snapshot_interval_secs: u64,
    /// A peer not heard from for this long drops out of the snapshot.
    pub peer_ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            server_port: 0,
            transport_port: 0,
            announce_port: 9100,
            advertise: true,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 2_000,
            ready_delay_ms: 300,
            connect_timeout_ms: 30_000,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval_secs: 2,
            snapshot_interval_secs: 5,
            peer_ttl_secs: 15,
        }
    }
}

impl BridgeConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl IdentityConfig {
    /// Display name, falling back to "tether".
    pub fn resolved_name(&self) -> String {
        if self.peer_name.is_empty() {
            "tether".to_string()
        } else {
            self.peer_name.clone()
        }
    }

    /// Logical id, falling back to 8 random bytes in hex.
    pub fn resolved_id(&self) -> String {
        if self.peer_id.is_empty() {
            hex::encode(rand::random::<[u8; 8]>())
        } else {
            self.peer_id.clone()
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("cannot render default config: {0}")]
    Render(#[from] toml::ser::Error),
}

impl TetherConfig {
    /// Where the daemon keeps its config, if the environment says anything
    /// about it: `$TETHER_CONFIG`, else `$XDG_CONFIG_HOME/tether/config.toml`,
    /// else `$HOME/.config/tether/config.toml`.
    pub fn locate() -> Option<PathBuf> {
        locate_with(|key| std::env::var_os(key).map(PathBuf::from))
    }

    /// Read `path`, or create it with the defaults when it does not exist.
    /// Environment overrides are applied on top either way and never written.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let io = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = TetherConfig::default();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(io)?;
                }
                std::fs::write(path, toml::to_string_pretty(&config)?).map_err(io)?;
                config
            }
            Err(e) => return Err(io(e)),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TETHER_<SECTION>__<KEY>` overrides. Values that do not parse
    /// are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(&format!("TETHER_{key}"));

        let identity = &mut self.identity;
        set(&mut identity.peer_name, text("IDENTITY__PEER_NAME"));
        set(&mut identity.peer_id, text("IDENTITY__PEER_ID"));

        let network = &mut self.network;
        set(&mut network.interface, text("NETWORK__INTERFACE"));
        set(&mut network.server_port, parse(text("NETWORK__SERVER_PORT")));
        set(&mut network.transport_port, parse(text("NETWORK__TRANSPORT_PORT")));
        set(&mut network.announce_port, parse(text("NETWORK__ANNOUNCE_PORT")));
        set(
            &mut network.advertise,
            text("NETWORK__ADVERTISE").map(|v| v == "true" || v == "1"),
        );

        let bridge = &mut self.bridge;
        set(&mut bridge.accept_timeout_ms, parse(text("BRIDGE__ACCEPT_TIMEOUT_MS")));
        set(&mut bridge.ready_delay_ms, parse(text("BRIDGE__READY_DELAY_MS")));
        set(&mut bridge.connect_timeout_ms, parse(text("BRIDGE__CONNECT_TIMEOUT_MS")));

        let discovery = &mut self.discovery;
        set(
            &mut discovery.announce_interval_secs,
            parse(text("DISCOVERY__ANNOUNCE_INTERVAL_SECS")),
        );
        set(
            &mut discovery.snapshot_interval_secs,
            parse(text("DISCOVERY__SNAPSHOT_INTERVAL_SECS")),
        );
        set(&mut discovery.peer_ttl_secs, parse(text("DISCOVERY__PEER_TTL_SECS")));
    }
}

fn parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *field = v;
    }
}

fn locate_with(var: impl Fn(&str) -> Option<PathBuf>) -> Option<PathBuf> {
    if let Some(explicit) = var("TETHER_CONFIG") {
        return Some(explicit);
    }
    let base = var("XDG_CONFIG_HOME").or_else(|| var("HOME").map(|h| h.join(".config")))?;
    Some(base.join("tether").join("config.toml"))
}
