//! Configuration file for the `thunder` node.

use anyhow::Context;
use bitcoin::Network;
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thunder_core::UserConfig;

/// THUNDER node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity and storage
    #[serde(default)]
    pub node: NodeConfig,
    /// Listening and peers
    #[serde(default)]
    pub network: NetworkConfig,
    /// Fee policy
    #[serde(default)]
    pub fees: FeeConfig,
    /// Background work cadence
    #[serde(default)]
    pub timers: TimerConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Channel negotiation policy, passed to the channel manager as is.
    /// Several limits default to `u64::MAX`, which TOML cannot hold, so
    /// the section is only written out once it differs from the default.
    #[serde(default, skip_serializing_if = "is_default_channel")]
    pub channel: UserConfig,
}

/// Identity and storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the seed and channel monitors
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `bitcoin`, `testnet`, `signet` or `regtest`
    #[serde(default = "default_chain")]
    pub chain: String,
}

/// Listening and peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to accept peers on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Peers to connect to at startup, as `node_id@host:port`
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Fee policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Fixed fee rate reported to the node, in sat per 1000 weight
    #[serde(default = "default_sat_per_kw")]
    pub sat_per_kw: u32,
}

/// Background work cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// How often queued messages are flushed to peers
    #[serde(default = "default_event_interval_ms")]
    pub event_interval_ms: u64,
    /// How often peers are pinged
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn is_default_channel(config: &UserConfig) -> bool {
    *config == UserConfig::default()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".thunder")
}

fn default_chain() -> String {
    "testnet".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9735".to_string()
}

fn default_sat_per_kw() -> u32 {
    thunder_core::chain::FEERATE_FLOOR_SATS_PER_KW
}

fn default_event_interval_ms() -> u64 {
    100
}

fn default_ping_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chain: default_chain(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            sat_per_kw: default_sat_per_kw(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            event_interval_ms: default_event_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A peer to dial, written `node_id@host:port`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    /// The peer's node id
    pub node_id: PublicKey,
    /// Where it listens
    pub addr: SocketAddr,
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (node_id, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("peer '{s}' missing '@' (expected node_id@host:port)"))?;
        let node_id = node_id
            .parse()
            .with_context(|| format!("peer '{s}' has an invalid node id"))?;
        let addr = addr
            .parse()
            .with_context(|| format!("peer '{s}' has an invalid address"))?;
        Ok(Self { node_id, addr })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("thunder/config.toml")
    }

    /// Load `path`, falling back to defaults when it is the default path
    /// and nothing is there yet
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or an
    /// explicitly named file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if path == Self::default_path() {
            Ok(Self::default())
        } else {
            anyhow::bail!("config file {} not found", path.display())
        }
    }

    /// The chain this node runs on
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown chain name.
    pub fn network(&self) -> anyhow::Result<Network> {
        Network::from_str(&self.node.chain).map_err(|_| {
            anyhow::anyhow!(
                "invalid chain '{}'. Must be one of: bitcoin, testnet, signet, regtest",
                self.node.chain
            )
        })
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.network.listen_addr))
    }

    /// Parse the startup peers
    ///
    /// # Errors
    ///
    /// Returns an error naming the first peer that does not parse.
    pub fn parse_peers(&self) -> anyhow::Result<Vec<PeerAddr>> {
        self.network.peers.iter().map(|p| p.parse()).collect()
    }

    /// Timer for flushing peer messages
    #[must_use]
    pub fn event_interval(&self) -> Duration {
        Duration::from_millis(self.timers.event_interval_ms)
    }

    /// Timer for pinging peers
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.timers.ping_interval_secs)
    }

    /// Where the node seed lives
    #[must_use]
    pub fn seed_path(&self) -> PathBuf {
        self.node.data_dir.join("seed")
    }

    /// Where channel monitors are persisted
    #[must_use]
    pub fn monitors_dir(&self) -> PathBuf {
        self.node.data_dir.join("monitors")
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.network()?;
        self.parse_listen_addr()?;
        self.parse_peers()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.timers.event_interval_ms == 0 || self.timers.ping_interval_secs == 0 {
            anyhow::bail!("Timer intervals must be non-zero");
        }

        if self.channel.own_channel_config.minimum_depth == 0 {
            anyhow::bail!("channel.own_channel_config.minimum_depth must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_ID: &str = "028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_addr, "0.0.0.0:9735");
        assert_eq!(config.network().unwrap(), Network::Testnet);
        assert_eq!(config.fees.sat_per_kw, 253);
        assert_eq!(config.channel, UserConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.node.chain = "dogecoin".to_string();
        assert!(config.validate().is_err());

        config.node.chain = "regtest".to_string();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.timers.ping_interval_secs = 0;
        assert!(config.validate().is_err());

        config.timers.ping_interval_secs = 30;
        config.network.peers.push("not-a-peer".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_addr() {
        let peer: PeerAddr = format!("{NODE_ID}@127.0.0.1:9735").parse().unwrap();
        assert_eq!(peer.addr, "127.0.0.1:9735".parse().unwrap());
        assert_eq!(peer.to_string(), format!("{NODE_ID}@127.0.0.1:9735"));

        assert!("127.0.0.1:9735".parse::<PeerAddr>().is_err());
        assert!(format!("{NODE_ID}@nowhere").parse::<PeerAddr>().is_err());
        assert!("02abcd@127.0.0.1:9735".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            listen_addr = "127.0.0.1:19735"

            [channel.own_channel_config]
            minimum_depth = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.network.listen_addr, "127.0.0.1:19735");
        assert_eq!(config.channel.own_channel_config.minimum_depth, 3);
        assert_eq!(config.channel.own_channel_config.our_to_self_delay, 144);
        assert_eq!(config.timers.ping_interval_secs, 60);
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thunder/config.toml");
        let mut config = Config::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded.node.data_dir, config.node.data_dir);
        assert_eq!(loaded.channel, config.channel);
        assert!(Config::load_or_default(&dir.path().join("missing.toml")).is_err());
    }
}
