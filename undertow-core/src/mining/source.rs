//! Boosting sources and the tasks that poll them.
//!
//! Each registered source runs as its own task. It waits until the overlay
//! is usable, then polls its backing store every `source_interval` and hands
//! new torrents to the mining manager over a channel. Cancelling the task's
//! token stops it.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::MiningError;
use super::rss;
use crate::constants::{CHANNEL_METAINFO_TIMEOUT, SOURCE_READY_RETRY};
use crate::engine::{DownloadManagerHandle, DownloadState};
use crate::notifications::{Notification, Notifier};
use crate::torrent::{InfoHash, TorrentDef};

/// 20-byte public identifier of a channel.
pub type ChannelId = [u8; 20];

/// Identifies a boosting source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Directory(PathBuf),
    RssFeed(String),
    Channel(ChannelId),
}

impl SourceKey {
    /// Classifies a configured source string.
    ///
    /// Forty hex digits name a channel, `http(s)://` URLs are RSS feeds and
    /// anything else is a local directory.
    ///
    /// # Errors
    /// - `MiningError::InvalidSource` - empty string
    pub fn parse(raw: &str) -> Result<Self, MiningError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MiningError::InvalidSource {
                key: raw.to_string(),
                reason: "empty source".to_string(),
            });
        }
        if raw.len() == 40
            && let Ok(bytes) = hex::decode(raw)
            && let Ok(id) = ChannelId::try_from(bytes.as_slice())
        {
            return Ok(SourceKey::Channel(id));
        }
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(SourceKey::RssFeed(raw.to_string()));
        }
        Ok(SourceKey::Directory(PathBuf::from(raw)))
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Directory(path) => write!(f, "{}", path.display()),
            SourceKey::RssFeed(url) => f.write_str(url),
            SourceKey::Channel(id) => f.write_str(&hex::encode(id)),
        }
    }
}

/// Snapshot of a mined download taken from the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedingStats {
    pub progress: f64,
    pub up_bps: u64,
    pub dn_bps: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub all_time_up: u64,
    pub all_time_down: u64,
    pub seeding_time_secs: u64,
}

impl From<&DownloadState> for SeedingStats {
    fn from(state: &DownloadState) -> Self {
        Self {
            progress: state.progress,
            up_bps: state.up_bps,
            dn_bps: state.dn_bps,
            num_peers: state.num_peers,
            num_seeds: state.num_seeds,
            all_time_up: state.all_time_up,
            all_time_down: state.all_time_down,
            seeding_time_secs: state.seeding_time_secs,
        }
    }
}

/// A candidate torrent in the mining pool.
#[derive(Debug, Clone)]
pub struct MiningTorrent {
    pub def: TorrentDef,
    pub source: SourceKey,
    pub num_seeders: u64,
    pub num_leechers: u64,
    /// False while the owning source is disabled.
    pub enabled: bool,
    /// Download the full content instead of share mode.
    pub preload: bool,
    pub prio: u8,
    pub is_duplicate: bool,
    /// A download is registered with the engine.
    pub running: bool,
    pub last_seeding_stats: Option<SeedingStats>,
}

impl MiningTorrent {
    pub fn new(def: TorrentDef, source: SourceKey) -> Self {
        Self {
            def,
            source,
            num_seeders: 0,
            num_leechers: 0,
            enabled: true,
            preload: false,
            prio: 0,
            is_duplicate: false,
            running: false,
            last_seeding_stats: None,
        }
    }

    pub fn infohash(&self) -> InfoHash {
        self.def.infohash()
    }
}

/// What a source task reports to the mining manager.
#[derive(Debug)]
pub enum SourceEvent {
    Torrent { key: SourceKey, def: Box<TorrentDef> },
    /// The source cannot continue and should be disabled.
    Failed { key: SourceKey, error: MiningError },
}

/// The channel overlay consulted by channel sources and the readiness check.
#[async_trait]
pub trait ChannelOverlay: Send + Sync {
    async fn num_channels(&self) -> usize;

    async fn num_connections(&self) -> usize;

    /// Subscribes to a channel, returning its local numeric id once known.
    async fn join_channel(&self, id: ChannelId) -> Option<u64>;

    /// Up to `max` infohashes published in the channel.
    async fn channel_torrents(&self, channel_id: u64, max: usize) -> Vec<InfoHash>;
}

/// A source together with its per-variant polling state.
pub(crate) enum BoostingSource {
    Directory {
        path: PathBuf,
        seen: HashSet<PathBuf>,
    },
    RssFeed {
        url: String,
        seen: HashSet<String>,
    },
    Channel {
        id: ChannelId,
        channel_id: Option<u64>,
        loaded: HashSet<InfoHash>,
    },
}

impl BoostingSource {
    pub(crate) fn new(key: &SourceKey) -> Self {
        match key {
            SourceKey::Directory(path) => BoostingSource::Directory {
                path: path.clone(),
                seen: HashSet::new(),
            },
            SourceKey::RssFeed(url) => BoostingSource::RssFeed {
                url: url.clone(),
                seen: HashSet::new(),
            },
            SourceKey::Channel(id) => BoostingSource::Channel {
                id: *id,
                channel_id: None,
                loaded: HashSet::new(),
            },
        }
    }

    fn key(&self) -> SourceKey {
        match self {
            BoostingSource::Directory { path, .. } => SourceKey::Directory(path.clone()),
            BoostingSource::RssFeed { url, .. } => SourceKey::RssFeed(url.clone()),
            BoostingSource::Channel { id, .. } => SourceKey::Channel(*id),
        }
    }

    /// Polls once, returning the torrents found.
    async fn update(&mut self, ctx: &SourceContext, produced: usize) -> Result<Vec<TorrentDef>, MiningError> {
        let budget = ctx.max_torrents.saturating_sub(produced);
        if budget == 0 {
            return Ok(Vec::new());
        }
        match self {
            BoostingSource::Directory { path, seen } => scan_directory(path, seen, budget).await,
            BoostingSource::RssFeed { url, seen } => {
                rss::update_feed(&ctx.http, url, seen, &ctx.store_dir, budget).await
            }
            BoostingSource::Channel {
                id,
                channel_id,
                loaded,
            } => {
                let Some(overlay) = &ctx.overlay else {
                    return Ok(Vec::new());
                };
                if channel_id.is_none() {
                    *channel_id = overlay.join_channel(*id).await;
                }
                let Some(cid) = *channel_id else {
                    tracing::debug!("Channel {} has no local id yet", hex::encode(id));
                    return Ok(Vec::new());
                };
                let defs = load_channel_torrents(ctx, overlay.as_ref(), cid, loaded, budget).await;
                if !defs.is_empty() {
                    ctx.notifier.notify(Notification::ChannelEntityUpdated {
                        channel_id: hex::encode(id),
                    });
                }
                Ok(defs)
            }
        }
    }
}

/// Shared collaborators of every source task.
#[derive(Clone)]
pub(crate) struct SourceContext {
    pub max_torrents: usize,
    pub interval: Duration,
    pub min_channels: usize,
    pub min_connections: usize,
    pub hops: u8,
    pub overlay: Option<Arc<dyn ChannelOverlay>>,
    pub engine: DownloadManagerHandle,
    pub notifier: Notifier,
    pub http: reqwest::Client,
    /// Where fetched `.torrent` files are kept.
    pub store_dir: PathBuf,
    pub events: mpsc::Sender<SourceEvent>,
}

impl SourceContext {
    /// Whether the overlay is connected well enough for sources to start.
    ///
    /// Without an overlay there is nothing to wait for.
    pub(crate) async fn check_system(&self) -> bool {
        let Some(overlay) = &self.overlay else {
            return true;
        };
        overlay.num_channels().await > self.min_channels
            && overlay.num_connections().await > self.min_connections
    }
}

/// Starts polling `source`; cancel the returned token to stop it.
pub(crate) fn spawn_source(source: BoostingSource, ctx: SourceContext) -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn(run_source(source, ctx, cancel.clone()));
    cancel
}

async fn run_source(mut source: BoostingSource, ctx: SourceContext, cancel: CancellationToken) {
    let key = source.key();

    while !ctx.check_system().await {
        tracing::debug!("Source {} waiting for the overlay", key);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SOURCE_READY_RETRY) => {}
        }
    }
    tracing::info!("Boosting source {} started", key);

    let mut produced = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.update(&ctx, produced) => result,
        };
        match result {
            Ok(defs) => {
                for def in defs {
                    produced += 1;
                    let event = SourceEvent::Torrent {
                        key: key.clone(),
                        def: Box::new(def),
                    };
                    if ctx.events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(error) => {
                tracing::warn!("Source {} failed: {}", key, error);
                let _ = ctx.events.send(SourceEvent::Failed { key, error }).await;
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.interval) => {}
        }
    }
    tracing::debug!("Boosting source {} stopped", key);
}

/// Loads unseen `*.torrent` files from `dir`.
///
/// An unreadable directory is logged and retried on the next poll. Files
/// that fail to parse are remembered and not retried.
async fn scan_directory(
    dir: &Path,
    seen: &mut HashSet<PathBuf>,
    budget: usize,
) -> Result<Vec<TorrentDef>, MiningError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read boosting directory {}: {}", dir.display(), e);
            return Ok(Vec::new());
        }
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_torrent = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("torrent"));
        if is_torrent && !seen.contains(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut defs = Vec::new();
    for path in paths {
        if defs.len() >= budget {
            break;
        }
        seen.insert(path.clone());
        let loaded = match tokio::fs::read(&path).await {
            Ok(bytes) => TorrentDef::load_from_memory(&bytes).map_err(MiningError::from),
            Err(e) => Err(e.into()),
        };
        match loaded {
            Ok(def) => defs.push(def),
            Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(defs)
}

/// Fetches metainfo for channel torrents not loaded before.
///
/// Torrents whose metainfo does not arrive stay unloaded and are asked for
/// again on the next poll.
async fn load_channel_torrents(
    ctx: &SourceContext,
    overlay: &dyn ChannelOverlay,
    channel_id: u64,
    loaded: &mut HashSet<InfoHash>,
    budget: usize,
) -> Vec<TorrentDef> {
    let mut defs = Vec::new();
    for infohash in overlay.channel_torrents(channel_id, ctx.max_torrents).await {
        if defs.len() >= budget {
            break;
        }
        if loaded.contains(&infohash) {
            continue;
        }
        match ctx
            .engine
            .get_metainfo(infohash, CHANNEL_METAINFO_TIMEOUT, ctx.hops, None)
            .await
        {
            Ok(def) => {
                loaded.insert(infohash);
                defs.push(def);
            }
            Err(e) => tracing::debug!("Metainfo for channel torrent {} unavailable: {}", infohash, e),
        }
    }
    defs
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::config::UndertowConfig;
    use crate::engine::{
        FixedDiskSpace, ManagerDeps, SimulatedSessionFactory, SimulatedSwarm, spawn_download_manager,
    };
    use crate::torrent::torrent_def::test_support::single_file_metainfo;

    struct FakeOverlay {
        channels: AtomicUsize,
        connections: usize,
        torrents: Vec<InfoHash>,
    }

    #[async_trait]
    impl ChannelOverlay for FakeOverlay {
        async fn num_channels(&self) -> usize {
            self.channels.load(Ordering::SeqCst)
        }

        async fn num_connections(&self) -> usize {
            self.connections
        }

        async fn join_channel(&self, _id: ChannelId) -> Option<u64> {
            Some(7)
        }

        async fn channel_torrents(&self, channel_id: u64, max: usize) -> Vec<InfoHash> {
            assert_eq!(channel_id, 7);
            self.torrents.iter().copied().take(max).collect()
        }
    }

    fn def(name: &str) -> TorrentDef {
        TorrentDef::load_from_dict(single_file_metainfo(name, 4096, 1024)).unwrap()
    }

    fn context(
        dir: &Path,
        overlay: Option<Arc<dyn ChannelOverlay>>,
    ) -> (SourceContext, mpsc::Receiver<SourceEvent>, SimulatedSwarm) {
        let swarm = SimulatedSwarm::new();
        let deps = ManagerDeps::new(Arc::new(SimulatedSessionFactory::new(swarm.clone())))
            .with_disk(Arc::new(FixedDiskSpace(None)));
        let engine = spawn_download_manager(UndertowConfig::for_testing(dir), deps);
        let (events, rx) = mpsc::channel(16);
        let ctx = SourceContext {
            max_torrents: 2,
            interval: Duration::from_secs(20),
            min_channels: 0,
            min_connections: 0,
            hops: 0,
            overlay,
            engine,
            notifier: Notifier::new(),
            http: reqwest::Client::new(),
            store_dir: dir.join("store"),
            events,
        };
        (ctx, rx, swarm)
    }

    #[test]
    fn test_source_key_parse() {
        let channel = "ab".repeat(20);
        assert_eq!(SourceKey::parse(&channel).unwrap(), SourceKey::Channel([0xab; 20]));
        assert_eq!(
            SourceKey::parse("https://example.com/feed.xml").unwrap(),
            SourceKey::RssFeed("https://example.com/feed.xml".to_string())
        );
        assert_eq!(
            SourceKey::parse("/srv/torrents").unwrap(),
            SourceKey::Directory(PathBuf::from("/srv/torrents"))
        );
        // 40 characters but not hex.
        assert!(matches!(
            SourceKey::parse(&"z".repeat(40)).unwrap(),
            SourceKey::Directory(_)
        ));
        assert!(SourceKey::parse("  ").is_err());
        assert_eq!(SourceKey::Channel([0xab; 20]).to_string(), channel);
    }

    #[tokio::test]
    async fn test_directory_scan_skips_known_and_respects_cap() {
        let dir = TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            let bytes = def(&format!("{name}.bin")).to_bytes().unwrap();
            std::fs::write(dir.path().join(format!("{name}.torrent")), bytes).unwrap();
        }
        std::fs::write(dir.path().join("broken.torrent"), b"not bencode").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut seen = HashSet::new();
        let first = scan_directory(dir.path(), &mut seen, 2).await.unwrap();
        let names: Vec<&str> = first.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);

        let second = scan_directory(dir.path(), &mut seen, 2).await.unwrap();
        let names: Vec<&str> = second.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["c.bin"]);
        assert!(seen.contains(&dir.path().join("broken.torrent")));

        assert!(scan_directory(dir.path(), &mut seen, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut seen = HashSet::new();
        let found = scan_directory(&dir.path().join("missing"), &mut seen, 5).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_check_system_requires_channels_and_connections() {
        let dir = TempDir::new().unwrap();
        let overlay = Arc::new(FakeOverlay {
            channels: AtomicUsize::new(0),
            connections: 3,
            torrents: Vec::new(),
        });
        let (mut ctx, _rx, _swarm) = context(dir.path(), Some(overlay.clone()));
        assert!(!ctx.check_system().await);

        overlay.channels.store(1, Ordering::SeqCst);
        assert!(ctx.check_system().await);

        ctx.min_connections = 3;
        assert!(!ctx.check_system().await);

        ctx.overlay = None;
        assert!(ctx.check_system().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_source_loads_published_metainfo() {
        let dir = TempDir::new().unwrap();
        let published = def("channel-1.bin");
        let missing = InfoHash::new([9; 20]);
        let overlay = Arc::new(FakeOverlay {
            channels: AtomicUsize::new(1),
            connections: 1,
            torrents: vec![missing, published.infohash()],
        });
        let (ctx, mut rx, swarm) = context(dir.path(), Some(overlay));
        swarm.publish_metadata(&published);
        let mut updates = ctx.notifier.subscribe();

        let cancel = spawn_source(BoostingSource::new(&SourceKey::Channel([1; 20])), ctx);
        let event = rx.recv().await.unwrap();
        let SourceEvent::Torrent { key, def } = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(key, SourceKey::Channel([1; 20]));
        assert_eq!(def.infohash(), published.infohash());
        assert_eq!(
            updates.recv().await.unwrap(),
            Notification::ChannelEntityUpdated {
                channel_id: hex::encode([1u8; 20])
            }
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_waits_for_system_then_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.torrent"), def("a.bin").to_bytes().unwrap()).unwrap();
        let overlay = Arc::new(FakeOverlay {
            channels: AtomicUsize::new(0),
            connections: 1,
            torrents: Vec::new(),
        });
        let (ctx, mut rx, _swarm) = context(dir.path(), Some(overlay.clone()));

        let cancel = spawn_source(
            BoostingSource::new(&SourceKey::Directory(dir.path().to_path_buf())),
            ctx,
        );
        tokio::time::sleep(SOURCE_READY_RETRY * 2).await;
        assert!(rx.try_recv().is_err());

        overlay.channels.store(1, Ordering::SeqCst);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SourceEvent::Torrent { .. }));

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
