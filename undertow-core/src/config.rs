//! Centralized configuration for Undertow.
//!
//! Configuration is read from a JSON document whose sections mirror the
//! structs below. Every section carries `#[serde(default)]`, so missing keys
//! fall back to defaults and unknown keys are ignored. Environment variables
//! prefixed with `UNDERTOW_` override a handful of commonly tuned values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("State directory {path} is not writable")]
    StateDirUnwritable { path: PathBuf },
}

/// Root configuration for all Undertow components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UndertowConfig {
    /// Directory holding checkpoints, engine state and mined torrents.
    pub state_dir: PathBuf,
    pub libtorrent: LibtorrentConfig,
    pub tunnel: TunnelConfig,
    pub credit_mining: CreditMiningConfig,
    pub health: HealthConfig,
    pub http_api: HttpApiConfig,
}

/// Embedded engine settings, keyed like the engine's own options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibtorrentConfig {
    pub port: u16,
    pub upnp: bool,
    pub dht: bool,
    pub lsd: bool,
    pub natpmp: bool,
    pub utp: bool,
    /// 0 none, 1 socks4, 2 socks5, 3 socks5 with auth, 4 http, 5 http with auth
    pub proxy_type: i64,
    pub proxy_server: Option<String>,
    pub proxy_auth: Option<String>,
    /// Bytes per second, 0 for unlimited.
    pub max_upload_rate: i64,
    /// Bytes per second, 0 for unlimited.
    pub max_download_rate: i64,
    /// SOCKS ports of the tunnel layer, one per hop count starting at 1.
    pub socks_listen_ports: Vec<u16>,
    /// Seconds to wait for DHT readiness before adding a torrent; 0 disables.
    pub dht_readiness_timeout: u64,
    pub download_defaults: DownloadDefaults,
}

impl Default for LibtorrentConfig {
    fn default() -> Self {
        Self {
            port: 7000,
            upnp: true,
            dht: true,
            lsd: true,
            natpmp: true,
            utp: true,
            proxy_type: 0,
            proxy_server: None,
            proxy_auth: None,
            max_upload_rate: 0,
            max_download_rate: 0,
            socks_listen_ports: vec![54_360, 54_361, 54_362, 54_363, 54_364],
            dht_readiness_timeout: 30,
            download_defaults: DownloadDefaults::default(),
        }
    }
}

/// Defaults applied to downloads started without explicit options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadDefaults {
    pub number_hops: u8,
    pub safeseeding_enabled: bool,
    pub saveas: PathBuf,
    pub anonymity_enabled: bool,
}

impl Default for DownloadDefaults {
    fn default() -> Self {
        Self {
            number_hops: 1,
            safeseeding_enabled: true,
            saveas: PathBuf::from("downloads"),
            anonymity_enabled: true,
        }
    }
}

/// Onion tunnel and admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// UDP port of the overlay endpoint.
    pub listen_port: u16,
    /// Whether this node terminates data circuits towards real swarms.
    pub exitnode_enabled: bool,
    /// Upper bound on relayed plus exit circuits joined by this node.
    pub max_joined_circuits: usize,
    pub random_slots: usize,
    pub competing_slots: usize,
    /// Seconds to wait for a balance response before assuming zero.
    pub balance_request_timeout: u64,
    /// Seconds a circuit may stay unfinished before it is dropped.
    pub circuit_build_timeout: u64,
    pub max_circuits: usize,
    /// Introduction points kept per seeded hidden torrent.
    pub num_intro_points: usize,
    /// Seconds between DHT lookups for a downloading hidden torrent.
    pub dht_lookup_interval: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 7759,
            exitnode_enabled: false,
            max_joined_circuits: 100,
            random_slots: 5,
            competing_slots: 15,
            balance_request_timeout: 5,
            circuit_build_timeout: 10,
            max_circuits: 10,
            num_intro_points: 2,
            dht_lookup_interval: 30,
        }
    }
}

impl TunnelConfig {
    pub fn balance_timeout(&self) -> Duration {
        Duration::from_secs(self.balance_request_timeout)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_build_timeout)
    }

    pub fn lookup_interval(&self) -> Duration {
        Duration::from_secs(self.dht_lookup_interval)
    }
}

/// Credit-mining controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditMiningConfig {
    pub enabled: bool,
    pub max_torrents_active: usize,
    pub max_torrents_per_source: usize,
    /// Seconds between source refreshes.
    pub source_interval: u64,
    /// Seconds between selection rounds.
    pub swarm_interval: u64,
    /// Seconds between scrape rounds.
    pub tracker_interval: u64,
    /// Upload/download ratio the engine aims for in share mode.
    pub share_mode_target: u32,
    /// One of `random`, `creation_date`, `seeder_ratio`, `scoring`.
    pub policy: String,
    pub sources: MiningSources,
    /// Channels that must be known before a channel-backed source starts.
    pub min_channels: usize,
    /// Overlay connections that must exist before any source starts.
    pub min_connections: usize,
    /// Anonymity of mined downloads.
    pub hops: u8,
}

impl Default for CreditMiningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_torrents_active: 8,
            max_torrents_per_source: 20,
            source_interval: 20,
            swarm_interval: 30,
            tracker_interval: 200,
            share_mode_target: 3,
            policy: "seeder_ratio".to_string(),
            sources: MiningSources::default(),
            min_channels: 0,
            min_connections: 0,
            hops: 1,
        }
    }
}

impl CreditMiningConfig {
    pub fn source_period(&self) -> Duration {
        Duration::from_secs(self.source_interval.max(1))
    }

    pub fn swarm_period(&self) -> Duration {
        Duration::from_secs(self.swarm_interval.max(1))
    }

    pub fn tracker_period(&self) -> Duration {
        Duration::from_secs(self.tracker_interval.max(1))
    }
}

/// Source lists; entries are directory paths, feed URLs or hex channel ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSources {
    pub boosting: Vec<String>,
    pub archive: Vec<String>,
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

/// Tracker health checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Per-session timeout in seconds.
    pub tracker_timeout: u64,
    pub max_concurrent_sessions: usize,
    pub max_retries: u32,
    /// Seconds multiplied by `2^retries` to schedule the next check.
    pub retry_interval: u64,
    /// URL regexes for trackers that only accept one infohash per scrape.
    pub hostile_tracker_patterns: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracker_timeout: 20,
            max_concurrent_sessions: 10,
            max_retries: 8,
            retry_interval: 60,
            hostile_tracker_patterns: vec![r"etree\.org".to_string()],
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout.max(1))
    }
}

/// REST API listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8085,
        }
    }
}

impl UndertowConfig {
    /// Loads configuration from a JSON file and sanitizes it.
    ///
    /// # Errors
    /// - `ConfigError::Read` - file could not be read
    /// - `ConfigError::Parse` - file is not valid JSON for this layout
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parses configuration from a JSON string and sanitizes it.
    ///
    /// # Errors
    /// - `ConfigError::Parse` - document is not valid JSON for this layout
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.sanitize();
        Ok(config)
    }

    /// Replaces out-of-range values with their defaults.
    pub fn sanitize(&mut self) {
        let defaults = LibtorrentConfig::default();
        let lt = &mut self.libtorrent;
        if !(0..=5).contains(&lt.proxy_type) {
            tracing::warn!("Ignoring invalid proxy_type {}", lt.proxy_type);
            lt.proxy_type = defaults.proxy_type;
        }
        if lt.max_upload_rate < 0 {
            lt.max_upload_rate = defaults.max_upload_rate;
        }
        if lt.max_download_rate < 0 {
            lt.max_download_rate = defaults.max_download_rate;
        }
        if self.state_dir.as_os_str().is_empty() {
            self.state_dir = PathBuf::from(".undertow");
        }
        if self.tunnel.random_slots + self.tunnel.competing_slots == 0 {
            self.tunnel.random_slots = TunnelConfig::default().random_slots;
        }
    }

    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config.sanitize();
        config
    }

    /// Applies `UNDERTOW_*` environment overrides on top of this config.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("UNDERTOW_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("UNDERTOW_LISTEN_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            self.libtorrent.port = port;
        }

        if let Ok(hops) = std::env::var("UNDERTOW_DEFAULT_HOPS")
            && let Ok(hops) = hops.parse::<u8>()
        {
            self.libtorrent.download_defaults.number_hops = hops;
        }

        if let Ok(port) = std::env::var("UNDERTOW_API_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            self.http_api.port = port;
        }

        if let Ok(enabled) = std::env::var("UNDERTOW_CREDIT_MINING") {
            self.credit_mining.enabled = enabled.parse().unwrap_or(false);
        }
    }

    /// Directory holding per-download checkpoint files.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join(crate::constants::CHECKPOINT_DIR)
    }

    /// Download and feed-store directory of credit mining.
    pub fn mining_dir(&self) -> PathBuf {
        self.state_dir.join(crate::constants::MINING_DIR)
    }

    /// Path of the persisted engine snapshot.
    pub fn engine_state_path(&self) -> PathBuf {
        self.state_dir.join(crate::constants::ENGINE_STATE_FILE)
    }

    /// Creates the state directory tree.
    ///
    /// # Errors
    /// - `ConfigError::StateDirUnwritable` - directory could not be created
    pub fn ensure_state_dir(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.checkpoint_dir()).map_err(|_| {
            ConfigError::StateDirUnwritable {
                path: self.state_dir.clone(),
            }
        })
    }

    /// Creates a configuration rooted in `state_dir` with network features off.
    pub fn for_testing(state_dir: &Path) -> Self {
        let mut config = Self {
            state_dir: state_dir.to_path_buf(),
            ..Default::default()
        };
        config.libtorrent.dht_readiness_timeout = 0;
        config.libtorrent.upnp = false;
        config.libtorrent.natpmp = false;
        config.libtorrent.download_defaults.saveas = state_dir.join("downloads");
        config.libtorrent.download_defaults.number_hops = 0;
        config.http_api.port = 0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.libtorrent.port, 7000);
        assert_eq!(config.libtorrent.download_defaults.number_hops, 1);
        assert_eq!(config.tunnel.random_slots, 5);
        assert_eq!(config.tunnel.competing_slots, 15);
        assert_eq!(config.credit_mining.policy, "seeder_ratio");
        assert_eq!(config.health.max_retries, 8);
        assert!(!config.credit_mining.enabled);
    }

    #[test]
    fn test_unknown_keys_are_ignored_and_missing_keys_default() {
        let raw = r#"{
            "libtorrent": { "port": 6881, "mystery": true },
            "whatever": { "nested": 1 }
        }"#;
        let config = UndertowConfig::from_json(raw).unwrap();

        assert_eq!(config.libtorrent.port, 6881);
        assert!(config.libtorrent.dht);
        assert_eq!(config.tunnel.max_joined_circuits, 100);
    }

    #[test]
    fn test_invalid_proxy_type_and_negative_rates_fall_back() {
        let raw = r#"{
            "libtorrent": { "proxy_type": 9, "max_upload_rate": -5, "max_download_rate": 1000 }
        }"#;
        let config = UndertowConfig::from_json(raw).unwrap();

        assert_eq!(config.libtorrent.proxy_type, 0);
        assert_eq!(config.libtorrent.max_upload_rate, 0);
        assert_eq!(config.libtorrent.max_download_rate, 1000);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = UndertowConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("undertow.json");
        std::fs::write(&path, r#"{"http_api": {"port": 9999}}"#).unwrap();

        let config = UndertowConfig::load(&path).unwrap();
        assert_eq!(config.http_api.port, 9999);

        let missing = UndertowConfig::load(&dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_LISTEN_PORT", "6999");
            std::env::set_var("UNDERTOW_DEFAULT_HOPS", "3");
            std::env::set_var("UNDERTOW_API_PORT", "18085");
        }

        let config = UndertowConfig::from_env();

        assert_eq!(config.libtorrent.port, 6999);
        assert_eq!(config.libtorrent.download_defaults.number_hops, 3);
        assert_eq!(config.http_api.port, 18085);

        unsafe {
            std::env::remove_var("UNDERTOW_LISTEN_PORT");
            std::env::remove_var("UNDERTOW_DEFAULT_HOPS");
            std::env::remove_var("UNDERTOW_API_PORT");
        }
    }
}
