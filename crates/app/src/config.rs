//! Configuration handling for a ledgermesh node.
//!
//! Configuration is loaded from a TOML file and can be overridden by
//! environment variables carrying the `LEDGERMESH_` prefix.
//!
//! # Example
//!
//! ```toml
//! [node]
//! name = "my-node"
//! node_seed = "base64 encoded 32 byte seed"
//!
//! [overlay]
//! port = 51235
//! max_peers = 21
//! ips = ["r.example.net 51235"]
//! ips_fixed = ["10.0.0.5:51235"]
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```
//!
//! # Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `LEDGERMESH_NODE_SEED` | `node.node_seed` |
//! | `LEDGERMESH_OVERLAY_PORT` | `overlay.port` |
//! | `LEDGERMESH_OVERLAY_MAX_PEERS` | `overlay.max_peers` |
//! | `LEDGERMESH_OVERLAY_PEER_PRIVATE` | `overlay.peer_private` |
//! | `LEDGERMESH_OVERLAY_IPS` | `overlay.ips` (comma separated) |
//! | `LEDGERMESH_OVERLAY_IPS_FIXED` | `overlay.ips_fixed` (comma separated) |
//! | `LEDGERMESH_LOG_LEVEL` | `logging.level` |
//! | `LEDGERMESH_LOG_FORMAT` | `logging.format` |

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use ledgermesh_overlay::{
    is_private_ip, AllocatorConfig, Ed25519Handshake, NodePublicKey, OverlayConfig, PeerAddress,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Bootstrap host used when neither `ips` nor `ips_fixed` is configured.
pub const DEFAULT_BOOTSTRAP: &str = "peers.ledgermesh.net 51235";

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "LEDGERMESH_";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node identity and TLS material.
    #[serde(default)]
    pub node: NodeConfig,

    /// Overlay network settings.
    #[serde(default)]
    pub overlay: OverlaySection,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name, used in log lines.
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Base64-encoded 32-byte Ed25519 seed.
    ///
    /// When absent, a fresh identity is generated on every start.
    #[serde(default)]
    pub node_seed: Option<String>,

    /// PEM certificate chain for the peer listener.
    ///
    /// When absent, a self-signed certificate is generated at startup.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `tls_cert`.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

fn default_node_name() -> String {
    "ledgermesh".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            node_seed: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Overlay network configuration as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlaySection {
    /// Peer listening port. `0` disables the listener.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address the listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Maximum number of active peers.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Ask peers not to reveal our address, and neither accept inbound
    /// connections nor dial automatically.
    #[serde(default)]
    pub peer_private: bool,

    /// Bootstrap peers, as `host port` or `host:port`.
    #[serde(default)]
    pub ips: Vec<String>,

    /// Peers we always stay connected to.
    #[serde(default)]
    pub ips_fixed: Vec<String>,

    /// Maximum inbound connections per IP address. `0` derives a limit from
    /// the number of inbound slots.
    #[serde(default)]
    pub ip_limit: i64,

    /// Our public IPv4 address, if known.
    #[serde(default)]
    pub public_ip: Option<String>,

    /// Attach hop counters to messages we originate.
    #[serde(default)]
    pub expire: bool,

    /// Hop bound applied when relaying.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Base64 public keys of cluster members.
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// Per-step handshake deadline in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Seconds without inbound traffic before a peer is closed.
    #[serde(default = "default_peer_idle_timeout")]
    pub peer_idle_timeout_secs: u64,
}

fn default_port() -> u16 {
    51235
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_peers() -> usize {
    21
}

fn default_max_hops() -> u32 {
    2
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_peer_idle_timeout() -> u64 {
    60
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            port: default_port(),
            listen_address: default_listen_address(),
            max_peers: default_max_peers(),
            peer_private: false,
            ips: Vec::new(),
            ips_fixed: Vec::new(),
            ip_limit: 0,
            public_ip: None,
            expire: false,
            max_hops: default_max_hops(),
            cluster_nodes: Vec::new(),
            handshake_timeout_secs: default_handshake_timeout(),
            peer_idle_timeout_secs: default_peer_idle_timeout(),
        }
    }
}

impl OverlaySection {
    /// Outbound share of `max_peers`: 15%, at least ten, never more than the total.
    pub fn out_peers(&self) -> usize {
        (self.max_peers * 15 / 100).max(10).min(self.max_peers)
    }

    /// Effective per-IP inbound limit.
    pub fn effective_ip_limit(&self) -> usize {
        if self.ip_limit > 0 {
            return self.ip_limit as usize;
        }
        let in_slots = self.max_peers.saturating_sub(self.out_peers());
        1 + (in_slots / 21).min(5)
    }

    /// Whether the listener runs.
    pub fn want_incoming(&self) -> bool {
        !self.peer_private && self.port != 0
    }

    /// Bootstrap entries, falling back to fixed peers and then the built-in host.
    pub fn bootstrap_entries(&self) -> Vec<String> {
        if !self.ips.is_empty() {
            self.ips.clone()
        } else if !self.ips_fixed.is_empty() {
            self.ips_fixed.clone()
        } else {
            vec![DEFAULT_BOOTSTRAP.to_string()]
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, apply environment overrides and validate.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `LEDGERMESH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Node overrides
        if let Some(val) = var("NODE_SEED") {
            self.node.node_seed = Some(val);
        }

        // Overlay overrides
        if let Some(val) = var("OVERLAY_PORT") {
            match val.parse() {
                Ok(port) => self.overlay.port = port,
                Err(_) => warn!("Ignoring invalid {}OVERLAY_PORT: {}", ENV_PREFIX, val),
            }
        }
        if let Some(val) = var("OVERLAY_MAX_PEERS") {
            match val.parse() {
                Ok(max) => self.overlay.max_peers = max,
                Err(_) => warn!("Ignoring invalid {}OVERLAY_MAX_PEERS: {}", ENV_PREFIX, val),
            }
        }
        if let Some(val) = var("OVERLAY_PEER_PRIVATE") {
            self.overlay.peer_private = val.parse().unwrap_or(false);
        }
        if let Some(val) = var("OVERLAY_IPS") {
            self.overlay.ips = split_list(&val);
        }
        if let Some(val) = var("OVERLAY_IPS_FIXED") {
            self.overlay.ips_fixed = split_list(&val);
        }

        // Logging overrides
        if let Some(val) = var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("LOG_FORMAT") {
            self.logging.format = val;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let overlay = &self.overlay;

        if overlay.ip_limit < 0 {
            bail!("configured IP limit is invalid: {}", overlay.ip_limit);
        }
        if overlay.max_peers == 0 {
            bail!("overlay.max_peers must be at least 1");
        }
        if overlay.max_hops == 0 {
            bail!("overlay.max_hops must be at least 1");
        }

        if let Some(ip) = &overlay.public_ip {
            self.public_ip_addr(ip)?;
        }

        if let Some(seed) = &self.node.node_seed {
            let bytes = STANDARD
                .decode(seed.trim())
                .context("node.node_seed is not valid base64")?;
            if bytes.len() != 32 {
                bail!("node.node_seed must decode to 32 bytes, got {}", bytes.len());
            }
        }

        for entry in overlay.ips.iter().chain(&overlay.ips_fixed) {
            PeerAddress::parse(entry)
                .with_context(|| format!("invalid peer address in config: {:?}", entry))?;
        }

        for key in &overlay.cluster_nodes {
            NodePublicKey::from_base64(key)
                .with_context(|| format!("invalid cluster node key: {:?}", key))?;
        }

        if overlay.listen_address.parse::<IpAddr>().is_err() {
            bail!("overlay.listen_address is not an IP address: {}", overlay.listen_address);
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => bail!("logging.format must be 'text' or 'json', got {:?}", other),
        }

        if self.node.tls_cert.is_some() != self.node.tls_key.is_some() {
            bail!("node.tls_cert and node.tls_key must be set together");
        }

        Ok(())
    }

    fn public_ip_addr(&self, ip: &str) -> anyhow::Result<Ipv4Addr> {
        let parsed: IpAddr = ip
            .parse()
            .with_context(|| format!("overlay.public_ip is not an IP address: {}", ip))?;
        let IpAddr::V4(v4) = parsed else {
            bail!("overlay.public_ip must be an IPv4 address: {}", ip);
        };
        if is_private_ip(&parsed) {
            bail!("overlay.public_ip must not be a private address: {}", ip);
        }
        Ok(v4)
    }

    /// The node identity: the configured seed, or a fresh one.
    pub fn identity(&self) -> anyhow::Result<Ed25519Handshake> {
        match &self.node.node_seed {
            Some(seed) => Ed25519Handshake::from_seed_base64(seed).context("loading node seed"),
            None => Ok(Ed25519Handshake::generate()),
        }
    }

    /// Settings for the overlay core.
    pub fn overlay_config(&self) -> anyhow::Result<OverlayConfig> {
        let overlay = &self.overlay;
        let cluster_nodes = overlay
            .cluster_nodes
            .iter()
            .map(|key| NodePublicKey::from_base64(key))
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(OverlayConfig {
            expire: overlay.expire,
            max_hops: overlay.max_hops,
            peer_private: overlay.peer_private,
            listening_port: overlay.want_incoming().then_some(overlay.port),
            handshake_timeout: std::time::Duration::from_secs(overlay.handshake_timeout_secs),
            peer_idle_timeout: std::time::Duration::from_secs(overlay.peer_idle_timeout_secs),
            cluster_nodes,
            ..OverlayConfig::default()
        })
    }

    /// Admission policy for the slot allocator.
    ///
    /// Resolves configured hostnames. Entries that fail to resolve are skipped
    /// with a warning; an entry resolving to port 0 is an error.
    pub async fn allocator_config(&self, standalone: bool) -> anyhow::Result<AllocatorConfig> {
        let overlay = &self.overlay;
        let public_ip = match &overlay.public_ip {
            Some(ip) => Some(self.public_ip_addr(ip)?),
            None => None,
        };

        let fixed = if standalone {
            Vec::new()
        } else {
            resolve_all(&overlay.ips_fixed).await?
        };
        let bootstrap = resolve_all(&overlay.bootstrap_entries()).await?;

        Ok(AllocatorConfig {
            max_peers: overlay.max_peers,
            out_peers: overlay.out_peers(),
            want_incoming: overlay.want_incoming(),
            auto_connect: !standalone && !overlay.peer_private,
            listening_port: overlay.want_incoming().then_some(overlay.port),
            ip_limit: overlay.effective_ip_limit(),
            public_ip,
            fixed,
            bootstrap,
        })
    }

    /// Generate a sample configuration file.
    pub fn sample_config() -> String {
        let mut config = Self::default();
        config.node.name = "my-node".to_string();
        config.overlay.ips = vec![DEFAULT_BOOTSTRAP.to_string()];
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn resolve_all(entries: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let mut resolved = Vec::new();
    for entry in entries {
        let address = PeerAddress::parse(entry)?;
        match address.resolve().await {
            Ok(addrs) => {
                for addr in addrs {
                    if addr.port() == 0 {
                        bail!("peer address {} resolved with port 0", address);
                    }
                    if !resolved.contains(&addr) {
                        resolved.push(addr);
                    }
                }
            }
            Err(e) => warn!("Skipping unresolvable peer address {}: {}", address, e),
        }
    }
    Ok(resolved)
}

/// Builder for test and embedded configurations.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node.name = name.into();
        self
    }

    pub fn node_seed(mut self, seed: impl Into<String>) -> Self {
        self.config.node.node_seed = Some(seed.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.overlay.port = port;
        self
    }

    pub fn max_peers(mut self, max: usize) -> Self {
        self.config.overlay.max_peers = max;
        self
    }

    pub fn add_peer(mut self, peer: impl Into<String>) -> Self {
        self.config.overlay.ips.push(peer.into());
        self
    }

    pub fn add_fixed_peer(mut self, peer: impl Into<String>) -> Self {
        self.config.overlay.ips_fixed.push(peer.into());
        self
    }

    pub fn peer_private(mut self, private: bool) -> Self {
        self.config.overlay.peer_private = private;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}
