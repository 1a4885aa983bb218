//! Abstraction over the embedded BitTorrent engine.
//!
//! The façade never talks to the engine directly; it drives a boxed
//! [`EngineSession`] per hop count and learns about results only through
//! alerts popped from the session. Production bindings and the simulated
//! engine implement the same trait.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::alerts::Alert;
use crate::config::LibtorrentConfig;
use crate::constants::{DHT_ROUTERS, TUNNEL_SENTINEL_IP};
use crate::torrent::InfoHash;

/// Proxy kinds understood by the engine, indexed by `proxy_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4,
    Socks5,
    Socks5Auth,
    Http,
    HttpAuth,
}

impl ProxyKind {
    pub fn from_config(proxy_type: i64) -> Option<Self> {
        match proxy_type {
            1 => Some(ProxyKind::Socks4),
            2 => Some(ProxyKind::Socks5),
            3 => Some(ProxyKind::Socks5Auth),
            4 => Some(ProxyKind::Http),
            5 => Some(ProxyKind::HttpAuth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Session-wide settings applied at creation and on performance tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub listen_interfaces: String,
    pub enable_dht: bool,
    pub enable_lsd: bool,
    pub enable_upnp: bool,
    pub enable_natpmp: bool,
    pub enable_utp: bool,
    pub enable_outgoing_tcp: bool,
    pub enable_incoming_tcp: bool,
    pub anonymous_mode: bool,
    pub force_proxy: bool,
    pub proxy: Option<ProxySettings>,
    /// Bytes per second, 0 for unlimited.
    pub upload_rate_limit: u64,
    /// Bytes per second, 0 for unlimited.
    pub download_rate_limit: u64,
    pub send_buffer_watermark: u64,
    pub max_queued_disk_bytes: u64,
    pub user_agent: String,
}

impl SessionSettings {
    /// Settings for the session serving downloads with `hops` hops.
    ///
    /// Hop 0 listens on the configured port with DHT, LSD and uTP as
    /// configured and the user's proxy. Anonymous sessions disable TCP, route
    /// everything through the tunnel's SOCKS port and run in anonymous mode.
    pub fn for_hops(hops: u8, config: &LibtorrentConfig) -> Self {
        let base = Self {
            listen_interfaces: format!("0.0.0.0:{}", config.port),
            enable_dht: config.dht,
            enable_lsd: config.lsd,
            enable_upnp: config.upnp,
            enable_natpmp: config.natpmp,
            enable_utp: config.utp,
            enable_outgoing_tcp: true,
            enable_incoming_tcp: true,
            anonymous_mode: false,
            force_proxy: false,
            proxy: user_proxy(config),
            upload_rate_limit: config.max_upload_rate.max(0) as u64,
            download_rate_limit: config.max_download_rate.max(0) as u64,
            send_buffer_watermark: 500 * 1024,
            max_queued_disk_bytes: 1024 * 1024,
            user_agent: concat!("Undertow/", env!("CARGO_PKG_VERSION")).to_string(),
        };

        if hops == 0 {
            return base;
        }

        let socks_port = config
            .socks_listen_ports
            .get(usize::from(hops) - 1)
            .copied()
            .unwrap_or(0);
        Self {
            listen_interfaces: "0.0.0.0:0".to_string(),
            enable_lsd: false,
            enable_upnp: false,
            enable_natpmp: false,
            enable_outgoing_tcp: false,
            enable_incoming_tcp: false,
            anonymous_mode: true,
            force_proxy: true,
            proxy: Some(ProxySettings {
                kind: ProxyKind::Socks5,
                host: "127.0.0.1".to_string(),
                port: socks_port,
                username: None,
                password: None,
            }),
            user_agent: String::new(),
            ..base
        }
    }
}

fn user_proxy(config: &LibtorrentConfig) -> Option<ProxySettings> {
    let kind = ProxyKind::from_config(config.proxy_type)?;
    let server = config.proxy_server.as_deref()?;
    let (host, port) = server.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let (username, password) = match config.proxy_auth.as_deref().and_then(|a| a.split_once(':')) {
        Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
        None => (None, None),
    };
    Some(ProxySettings {
        kind,
        host: host.to_string(),
        port,
        username,
        password,
    })
}

/// Peer address filter installed on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpFilter {
    #[default]
    AllowAll,
    /// Blocks every IPv4 address except this one.
    OnlyAllow(Ipv4Addr),
}

impl IpFilter {
    /// Filter of anonymous sessions: only the tunnel sentinel is reachable.
    pub fn tunnel_only() -> Self {
        IpFilter::OnlyAllow(Ipv4Addr::from(TUNNEL_SENTINEL_IP))
    }

    pub fn allows(&self, addr: &SocketAddr) -> bool {
        match (self, addr) {
            (IpFilter::AllowAll, _) => true,
            (IpFilter::OnlyAllow(allowed), SocketAddr::V4(v4)) => v4.ip() == allowed,
            (IpFilter::OnlyAllow(_), SocketAddr::V6(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddFlags {
    pub paused: bool,
    pub upload_mode: bool,
    pub share_mode: bool,
    pub seed_mode: bool,
}

/// Everything the engine needs to start a torrent.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub infohash: InfoHash,
    pub name: String,
    /// Bencoded metainfo, absent for magnet starts.
    pub metainfo: Option<Vec<u8>>,
    pub trackers: Vec<String>,
    pub save_path: PathBuf,
    pub file_priorities: Vec<u8>,
    pub resume_data: Option<Vec<u8>>,
    pub flags: AddFlags,
}

/// Engine-side torrent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Allocating,
    CheckingResumeData,
}

/// Engine-reported status of one torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub infohash: InfoHash,
    pub state: TorrentState,
    pub paused: bool,
    pub progress: f64,
    pub upload_rate: u64,
    pub download_rate: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub total_upload: u64,
    pub total_download: u64,
    pub seeding_time_secs: u64,
    pub error: Option<String>,
    /// Per-piece completion, empty until metadata is known.
    pub pieces: Vec<bool>,
}

impl TorrentStatus {
    pub fn new(infohash: InfoHash, state: TorrentState) -> Self {
        Self {
            infohash,
            state,
            paused: false,
            progress: 0.0,
            upload_rate: 0,
            download_rate: 0,
            num_peers: 0,
            num_seeds: 0,
            total_upload: 0,
            total_download: 0,
            seeding_time_secs: 0,
            error: None,
            pieces: Vec::new(),
        }
    }
}

/// One connected peer as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub client: String,
    /// Fraction of the torrent the peer has.
    pub progress: f64,
    pub remote_interested: bool,
    pub upload_rate: u64,
    pub download_rate: u64,
}

/// One embedded engine session.
///
/// All methods are non-blocking; outcomes arrive later through
/// [`EngineSession::pop_alerts`].
pub trait EngineSession: Send {
    fn hops(&self) -> u8;

    fn settings(&self) -> &SessionSettings;

    fn apply_settings(&mut self, settings: SessionSettings);

    fn set_ip_filter(&mut self, filter: IpFilter);

    fn ip_filter(&self) -> IpFilter;

    /// Starts adding a torrent; completion is an `AddTorrent` alert.
    fn add_torrent_async(&mut self, params: AddTorrentParams);

    fn find_torrent(&self, infohash: &InfoHash) -> bool;

    /// Starts removing a torrent; completion is a `TorrentRemoved` alert.
    fn remove_torrent(&mut self, infohash: &InfoHash, delete_files: bool);

    fn torrent_status(&self, infohash: &InfoHash) -> Option<TorrentStatus>;

    fn replace_trackers(&mut self, infohash: &InfoHash, trackers: &[String]);

    fn prioritize_files(&mut self, infohash: &InfoHash, priorities: &[u8]);

    fn pause(&mut self, infohash: &InfoHash);

    fn resume(&mut self, infohash: &InfoHash);

    fn force_recheck(&mut self, infohash: &InfoHash);

    fn move_storage(&mut self, infohash: &InfoHash, destination: &Path);

    fn set_sequential_download(&mut self, infohash: &InfoHash, enabled: bool);

    fn set_upload_mode(&mut self, infohash: &InfoHash, enabled: bool);

    fn peer_info(&self, infohash: &InfoHash) -> Vec<PeerInfo>;

    fn connect_peer(&mut self, infohash: &InfoHash, addr: SocketAddr);

    /// Requests resume data; completion is a `SaveResumeData` or
    /// `SaveResumeDataFailed` alert.
    fn save_resume_data(&mut self, infohash: &InfoHash);

    fn pop_alerts(&mut self) -> Vec<Alert>;

    /// Asks for a `StateUpdate` alert covering changed torrents.
    fn post_torrent_updates(&mut self);

    /// Asks for a `SessionStats` alert.
    fn post_session_stats(&mut self);

    fn dht_is_ready(&self) -> bool;

    /// Issues a DHT `get_peers`, optionally with the BEP-33 scrape flag.
    fn dht_get_peers(&mut self, infohash: &InfoHash, scrape: bool);

    fn add_dht_router(&mut self, host: &str, port: u16);

    /// Opaque engine snapshot persisted between runs.
    fn save_state(&self) -> Vec<u8>;

    fn load_state(&mut self, state: &[u8]);
}

/// Creates engine sessions on demand.
pub trait SessionFactory: Send + Sync {
    fn create(&self, hops: u8, settings: SessionSettings) -> Box<dyn EngineSession>;
}

/// Seeds a fresh hop-0 session with the well-known DHT routers.
pub fn bootstrap_dht(session: &mut dyn EngineSession) {
    for (host, port) in DHT_ROUTERS {
        session.add_dht_router(host, *port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_zero_settings_follow_config() {
        let mut config = LibtorrentConfig {
            port: 7001,
            lsd: false,
            max_upload_rate: -5,
            ..Default::default()
        };
        config.proxy_type = 2;
        config.proxy_server = Some("proxy.local:1080".to_string());

        let settings = SessionSettings::for_hops(0, &config);
        assert_eq!(settings.listen_interfaces, "0.0.0.0:7001");
        assert!(!settings.enable_lsd);
        assert!(settings.enable_outgoing_tcp);
        assert!(!settings.anonymous_mode);
        assert_eq!(settings.upload_rate_limit, 0);
        let proxy = settings.proxy.unwrap();
        assert_eq!(proxy.kind, ProxyKind::Socks5);
        assert_eq!(proxy.port, 1080);
    }

    #[test]
    fn test_anonymous_settings_force_tunnel_proxy() {
        let config = LibtorrentConfig::default();
        let settings = SessionSettings::for_hops(2, &config);

        assert!(settings.anonymous_mode);
        assert!(settings.force_proxy);
        assert!(!settings.enable_outgoing_tcp);
        assert!(!settings.enable_incoming_tcp);
        let proxy = settings.proxy.unwrap();
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, config.socks_listen_ports[1]);
    }

    #[test]
    fn test_tunnel_filter_only_allows_sentinel() {
        let filter = IpFilter::tunnel_only();
        assert!(filter.allows(&"1.1.1.1:1024".parse().unwrap()));
        assert!(!filter.allows(&"10.0.0.1:6881".parse().unwrap()));
        assert!(!filter.allows(&"[::1]:6881".parse().unwrap()));
        assert!(IpFilter::AllowAll.allows(&"10.0.0.1:6881".parse().unwrap()));
    }
}
