//! TOML-backed node configuration, mirroring
//! `shared::interface_config::InterfaceConfig`'s kebab-case layout and
//! fail-fast `from_file` loading.

use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crate::error::MeshError;

/// Defaults matching `spec.md` §7's fail-fast bullet list: a secret under
/// 16 bytes or an interface name that doesn't round-trip through
/// `wireguard_control::InterfaceName` are both configuration errors, not
/// runtime-recoverable conditions.
const DEFAULT_ACTIVE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun1.l.google.com:19302"];
const DEFAULT_STATE_DIR: &str = "/var/lib/wgmesh";

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// The shared secret this mesh's entire key schedule is derived from.
    /// May also come from the `WGMESH_SECRET` environment variable so it
    /// never has to sit in a config file on disk.
    pub secret: Option<String>,

    pub interface: String,

    pub hostname: String,

    #[serde(default)]
    pub introducer: bool,

    #[serde(default)]
    pub routable_networks: Vec<String>,

    /// The WireGuard interface's own listen port, advertised on the wire as
    /// `wg_endpoint`'s port component (`spec.md` §6's `config` collaborator
    /// interface). Not to be confused with the gossip/control port, which is
    /// derived from the shared secret rather than configured.
    #[serde(default = "default_wg_listen_port")]
    pub wg_listen_port: u16,

    #[serde(default)]
    pub disable_ipv6: bool,

    #[serde(default)]
    pub disable_punching: bool,

    /// Directory DHT routing-table snapshots are persisted under, created
    /// with `0o700` permissions the same way the teacher's
    /// `shared::ensure_dirs_exist` locks down `CLIENT_DATA_DIR` (`spec.md`
    /// §4.7).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// `log`/`pretty_env_logger` filter string (e.g. `info`,
    /// `wgmesh=debug`). An already-set `RUST_LOG` environment variable
    /// still takes priority, mirroring the teacher's CLI-verbosity-over-env
    /// precedence in `client/src/util.rs`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_wg_listen_port() -> u16 {
    51820
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct DiscoveryConfig {
    #[serde(default = "default_active_timeout_secs")]
    pub active_timeout_secs: u64,

    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    #[serde(default)]
    pub dht_bootstrap_nodes: Vec<String>,

    #[serde(default = "default_true")]
    pub lan_discovery: bool,

    #[serde(default = "default_true")]
    pub dht_discovery: bool,

    #[serde(default = "default_true")]
    pub enable_gossip: bool,
}

fn default_active_timeout_secs() -> u64 {
    DEFAULT_ACTIVE_TIMEOUT_SECS
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            active_timeout_secs: DEFAULT_ACTIVE_TIMEOUT_SECS,
            stun_servers: default_stun_servers(),
            dht_bootstrap_nodes: Vec::new(),
            lan_discovery: true,
            dht_discovery: true,
            enable_gossip: true,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| MeshError::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// The effective secret, preferring the environment variable over the
    /// config file so operators can keep it out of version control.
    pub fn resolve_secret(&self) -> Result<String, MeshError> {
        std::env::var("WGMESH_SECRET")
            .ok()
            .or_else(|| self.node.secret.clone())
            .ok_or_else(|| MeshError::Config("no secret in config or WGMESH_SECRET".into()))
    }

    fn validate(&self) -> Result<(), MeshError> {
        if let Some(secret) = &self.node.secret {
            if secret.len() < crate::keys::MIN_SECRET_LEN {
                return Err(MeshError::Config(format!(
                    "secret must be at least {} bytes",
                    crate::keys::MIN_SECRET_LEN
                )));
            }
        }
        if self.node.interface.is_empty() || self.node.interface.len() > 15 {
            return Err(MeshError::Config(
                "interface name must be 1-15 characters".into(),
            ));
        }
        Ok(())
    }

    pub fn stun_socket_addrs(&self) -> Vec<SocketAddr> {
        self.discovery
            .stun_servers
            .iter()
            .filter_map(|s| crate::types::Endpoint::resolve(s))
            .collect()
    }

    /// The filter string the CLI entry point should set `RUST_LOG` to
    /// before initializing `pretty_env_logger`, deferring to an
    /// already-set `RUST_LOG` so an operator's environment always wins.
    pub fn effective_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.node.log_level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config() {
        let file = write_config(
            r#"
            [node]
            secret = "this-is-a-long-enough-secret!!!"
            interface = "wgmesh0"
            hostname = "node-a"
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.node.interface, "wgmesh0");
        assert_eq!(config.discovery.active_timeout_secs, DEFAULT_ACTIVE_TIMEOUT_SECS);
        assert!(config.discovery.lan_discovery);
        assert!(config.discovery.enable_gossip);
        assert_eq!(config.node.wg_listen_port, 51820);
        assert_eq!(config.node.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.node.log_level, "info");
    }

    #[test]
    fn overrides_state_dir_and_log_level() {
        let file = write_config(
            r#"
            [node]
            secret = "this-is-a-long-enough-secret!!!"
            interface = "wgmesh0"
            hostname = "node-a"
            state-dir = "/tmp/wgmesh-state"
            log-level = "wgmesh=debug"

            [discovery]
            enable-gossip = false
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.node.state_dir, PathBuf::from("/tmp/wgmesh-state"));
        assert_eq!(config.node.log_level, "wgmesh=debug");
        assert!(!config.discovery.enable_gossip);
    }

    #[test]
    fn rejects_short_secret() {
        let file = write_config(
            r#"
            [node]
            secret = "short"
            interface = "wgmesh0"
            hostname = "node-a"
            "#,
        );
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn env_secret_overrides_file() {
        std::env::set_var("WGMESH_SECRET", "env-provided-secret-value!!");
        let file = write_config(
            r#"
            [node]
            secret = "this-is-a-long-enough-secret!!!"
            interface = "wgmesh0"
            hostname = "node-a"
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.resolve_secret().unwrap(), "env-provided-secret-value!!");
        std::env::remove_var("WGMESH_SECRET");
    }
}
