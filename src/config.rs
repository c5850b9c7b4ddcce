//! Configuration for the pod daemon.
//!
//! A single TOML file with `[node]`, `[network]`, `[rpc]`, `[mining]` and
//! `[logging]` sections. Every field has a default so a partial file is
//! valid; a missing file is created with defaults on first run.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::network_type::NetworkType;

pub const DEFAULT_CONFIG_FILE: &str = "podd.toml";
pub const DEFAULT_KOPACH_PORT: u16 = 11049;

/// Platform-specific data directory for the daemon.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\pod
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pod")
    } else {
        // Linux/Mac: ~/.pod
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pod")
    }
}

/// Mainnet lives in the base directory, every other network in a
/// subdirectory named after it.
pub fn get_network_data_dir(network: NetworkType) -> PathBuf {
    let base = get_data_dir();
    match network {
        NetworkType::Mainnet => base,
        other => base.join(other.name()),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_network")]
    pub network: String,
    /// Empty means the platform data directory.
    #[serde(default)]
    pub data_dir: String,
    /// Don't accept or relay loose transactions.
    #[serde(default)]
    pub blocks_only: bool,
    #[serde(default)]
    pub no_cfilters: bool,
    /// Extra checkpoints as `height:hash`.
    #[serde(default)]
    pub add_checkpoints: Vec<String>,
    #[serde(default)]
    pub disable_checkpoints: bool,
}

fn default_network() -> String {
    "mainnet".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: String::new(),
            blocks_only: false,
            no_cfilters: false,
            add_checkpoints: Vec::new(),
            disable_checkpoints: false,
        }
    }
}

impl NodeConfig {
    /// Unknown network names fall back to mainnet with a warning;
    /// `Config::validate` rejects them before the node starts.
    pub fn network_type(&self) -> NetworkType {
        self.network.parse().unwrap_or_else(|e| {
            tracing::warn!("{}, using mainnet", e);
            NetworkType::Mainnet
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Addresses to accept peers on; empty means every interface on the
    /// network's default port.
    #[serde(default)]
    pub listeners: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,
    #[serde(default)]
    pub disable_banning: bool,
    #[serde(default)]
    pub disable_listen: bool,
    #[serde(default)]
    pub disable_dns_seed: bool,
    /// Connect only to these peers.
    #[serde(default)]
    pub connect_peers: Vec<String>,
    /// Peers to add as permanent connections at startup.
    #[serde(default)]
    pub add_peers: Vec<String>,
    #[serde(default)]
    pub onion: bool,
    /// IPs or CIDR networks exempt from banning.
    #[serde(default)]
    pub whitelists: Vec<String>,
    #[serde(default)]
    pub no_peer_bloom_filters: bool,
}

fn default_max_peers() -> usize {
    125
}

fn default_ban_duration_secs() -> u64 {
    24 * 60 * 60
}

fn default_ban_threshold() -> u32 {
    100
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            max_peers: default_max_peers(),
            ban_duration_secs: default_ban_duration_secs(),
            ban_threshold: default_ban_threshold(),
            disable_banning: false,
            disable_listen: false,
            disable_dns_seed: false,
            connect_peers: Vec::new(),
            add_peers: Vec::new(),
            onion: false,
            whitelists: Vec::new(),
            no_peer_bloom_filters: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub disable_rpc: bool,
    /// Empty means localhost on the network's default RPC port.
    #[serde(default)]
    pub listeners: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub limit_user: String,
    #[serde(default)]
    pub limit_pass: String,
    #[serde(default = "default_rpc_max_clients")]
    pub max_clients: usize,
    /// Concurrent authenticated `/ws` clients.
    #[serde(default = "default_rpc_max_websockets")]
    pub max_websockets: usize,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    /// Answer JSON-RPC 1.0 requests that carry no `id` field.
    #[serde(default)]
    pub quirks: bool,
}

fn default_rpc_max_clients() -> usize {
    10
}

fn default_rpc_max_websockets() -> usize {
    25
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            disable_rpc: false,
            listeners: Vec::new(),
            username: String::new(),
            password: String::new(),
            limit_user: String::new(),
            limit_pass: String::new(),
            max_clients: default_rpc_max_clients(),
            max_websockets: default_rpc_max_websockets(),
            tls: false,
            cert_path: String::new(),
            key_path: String::new(),
            quirks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Broadcast work to kopach workers.
    #[serde(default)]
    pub generate: bool,
    /// Worker processes the kopach coordinator spawns.
    #[serde(default = "default_gen_threads")]
    pub gen_threads: usize,
    #[serde(default)]
    pub mining_addrs: Vec<String>,
    /// Pre-shared pass-phrase sealing kopach broadcasts.
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_kopach_port")]
    pub port: u16,
}

fn default_gen_threads() -> usize {
    1
}

fn default_kopach_port() -> u16 {
    DEFAULT_KOPACH_PORT
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            generate: false,
            gen_threads: default_gen_threads(),
            mining_addrs: Vec::new(),
            pass: String::new(),
            port: default_kopach_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `compact` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// `stdout` or `file`.
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default)]
    pub file_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: String::new(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Loads `path`, or writes a default configuration for `network` there
    /// when it doesn't exist yet.
    pub fn load_or_create(path: impl AsRef<Path>, network: NetworkType) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            let mut config = Self::load_from_file(path)?;
            if config.node.data_dir.is_empty() {
                config.node.data_dir = get_network_data_dir(config.node.network_type())
                    .to_string_lossy()
                    .to_string();
            }
            return Ok(config);
        }

        let mut config = Config::default();
        config.node.network = network.name().to_string();
        config.node.data_dir = get_network_data_dir(network).to_string_lossy().to_string();
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default configuration to {}", path.display());
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.node.data_dir.is_empty() {
            get_network_data_dir(self.node.network_type())
        } else {
            PathBuf::from(&self.node.data_dir)
        }
    }

    /// Rejects combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        self.node
            .network
            .parse::<NetworkType>()
            .map_err(AppError::Config)?;

        if self.network.max_peers == 0 && !self.network.disable_listen {
            tracing::warn!("max_peers is 0, inbound peers will be refused");
        }

        let rpc = &self.rpc;
        if !rpc.disable_rpc {
            if !rpc.limit_user.is_empty() && rpc.limit_user == rpc.username {
                return Err(AppError::Config(
                    "limit_user and username must not specify the same username".into(),
                ));
            }
            if !rpc.limit_pass.is_empty() && rpc.limit_pass == rpc.password {
                return Err(AppError::Config(
                    "limit_pass and password must not specify the same password".into(),
                ));
            }
            if rpc.max_clients == 0 {
                return Err(AppError::Config("rpc max_clients must be at least 1".into()));
            }
        }

        match self.logging.format.as_str() {
            "compact" | "json" => {}
            other => {
                return Err(AppError::Config(format!(
                    "unknown log format '{}', expected compact or json",
                    other
                )))
            }
        }
        match self.logging.output.as_str() {
            "stdout" => {}
            "file" if !self.logging.file_path.is_empty() => {}
            "file" => {
                return Err(AppError::Config(
                    "logging output 'file' requires file_path".into(),
                ))
            }
            other => {
                return Err(AppError::Config(format!(
                    "unknown log output '{}', expected stdout or file",
                    other
                )))
            }
        }

        if self.mining.generate && self.mining.mining_addrs.is_empty() {
            return Err(AppError::Config(
                "generate requires at least one mining address".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            network = "simnet"

            [rpc]
            username = "admin"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.network_type(), NetworkType::Simnet);
        assert_eq!(config.network.max_peers, 125);
        assert_eq!(config.network.ban_threshold, 100);
        assert_eq!(config.rpc.max_clients, 10);
        assert_eq!(config.rpc.max_websockets, 25);
        assert_eq!(config.mining.port, DEFAULT_KOPACH_PORT);
        assert_eq!(config.logging.format, "compact");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join(DEFAULT_CONFIG_FILE);

        let created = Config::load_or_create(&path, NetworkType::Regtest).unwrap();
        assert!(path.exists());
        assert_eq!(created.node.network, "regtest");

        let loaded = Config::load_or_create(&path, NetworkType::Mainnet).unwrap();
        assert_eq!(loaded.node.network_type(), NetworkType::Regtest);
        assert_eq!(loaded.node.data_dir, created.node.data_dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        let mut config = Config::default();
        config.network.whitelists = vec!["10.0.0.0/8".into()];
        config.mining.gen_threads = 4;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.network.whitelists, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(loaded.mining.gen_threads, 4);
    }

    #[test]
    fn test_validate_rejects_shared_credentials() {
        let mut config = Config::default();
        config.rpc.username = "same".into();
        config.rpc.limit_user = "same".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node.network = "moonnet".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mining.generate = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_data_dirs() {
        assert_eq!(get_network_data_dir(NetworkType::Mainnet), get_data_dir());
        assert!(get_network_data_dir(NetworkType::Simnet).ends_with("simnet"));
    }
}
