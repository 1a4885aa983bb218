//! Credit mining manager actor.
//!
//! Owns the mining pool. Source tasks report torrents over a channel; the
//! actor deduplicates them, and on the swarm tick lets the policy decide
//! which hidden downloads run. The tracker tick refreshes swarm counts from
//! connected peers and schedules health checks whose results come back as
//! notifications.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::MiningError;
use super::dedup::mark_duplicates;
use super::policy::MiningPolicy;
use super::source::{
    BoostingSource, ChannelOverlay, MiningTorrent, SeedingStats, SourceContext, SourceEvent,
    SourceKey, spawn_source,
};
use crate::config::CreditMiningConfig;
use crate::constants::MINING_HEALTH_TIMEOUT;
use crate::engine::{
    DownloadConfig, DownloadManagerHandle, DownloadSource, DownloadStatus, EngineError, PeerInfo,
};
use crate::health::HealthCheckerHandle;
use crate::notifications::{Notification, Notifier};
use crate::torrent::{DownloadDef, InfoHash};

/// Collaborators injected into credit mining.
#[derive(Clone)]
pub struct MiningDeps {
    pub engine: DownloadManagerHandle,
    pub health: Option<HealthCheckerHandle>,
    pub notifier: Notifier,
    pub overlay: Option<Arc<dyn ChannelOverlay>>,
    /// Download directory for mined content and fetched `.torrent` files.
    pub mining_dir: PathBuf,
}

impl MiningDeps {
    pub fn new(engine: DownloadManagerHandle, mining_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            health: None,
            notifier: Notifier::new(),
            overlay: None,
            mining_dir: mining_dir.into(),
        }
    }

    pub fn with_health(mut self, health: HealthCheckerHandle) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_overlay(mut self, overlay: Arc<dyn ChannelOverlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }
}

/// Pool entry as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiningTorrentInfo {
    pub infohash: InfoHash,
    pub name: String,
    pub source: String,
    pub num_seeders: u64,
    pub num_leechers: u64,
    pub enabled: bool,
    pub is_duplicate: bool,
    pub running: bool,
    pub preload: bool,
}

impl From<&MiningTorrent> for MiningTorrentInfo {
    fn from(t: &MiningTorrent) -> Self {
        Self {
            infohash: t.infohash(),
            name: t.def.name().to_string(),
            source: t.source.to_string(),
            num_seeders: t.num_seeders,
            num_leechers: t.num_leechers,
            enabled: t.enabled,
            is_duplicate: t.is_duplicate,
            running: t.running,
            preload: t.preload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MiningSourceInfo {
    pub key: String,
    pub enabled: bool,
    pub archive: bool,
    pub torrents: usize,
}

struct SourceState {
    enabled: bool,
    /// Archive sources download everything in full and stop once seeding.
    archive: bool,
    cancel: Option<CancellationToken>,
    torrents: HashSet<InfoHash>,
    /// Archive torrents that reached seeding.
    archived: HashSet<InfoHash>,
}

/// Seeders and leechers among connected peers.
///
/// Peers with the complete torrent count as seeders; interested peers
/// without it count as leechers.
pub fn translate_peers_into_health(peers: &[PeerInfo]) -> (u64, u64) {
    peers.iter().fold((0, 0), |(seeders, leechers), peer| {
        if peer.progress >= 1.0 {
            (seeders + 1, leechers)
        } else if peer.remote_interested {
            (seeders, leechers + 1)
        } else {
            (seeders, leechers)
        }
    })
}

/// Catalog counts win unless both are zero.
fn merge_counts(catalog: Option<(u64, u64)>, from_peers: (u64, u64)) -> (u64, u64) {
    match catalog {
        Some((seeders, leechers)) if seeders > 0 || leechers > 0 => (seeders, leechers),
        _ => from_peers,
    }
}

/// State owned by the mining actor.
pub struct CreditMiningManager {
    config: CreditMiningConfig,
    policy: MiningPolicy,
    engine: DownloadManagerHandle,
    health: Option<HealthCheckerHandle>,
    mining_dir: PathBuf,
    source_ctx: SourceContext,
    sources: HashMap<SourceKey, SourceState>,
    torrents: HashMap<InfoHash, MiningTorrent>,
    /// Pool torrents the user downloads visibly; mining never touches them.
    user_downloads: HashSet<InfoHash>,
    events_rx: Option<mpsc::Receiver<SourceEvent>>,
}

impl CreditMiningManager {
    /// # Errors
    /// - `MiningError::UnknownPolicy` - `config.policy` names no policy
    pub fn new(config: CreditMiningConfig, deps: MiningDeps) -> Result<Self, MiningError> {
        let policy = MiningPolicy::from_name(&config.policy)?;
        let (events, events_rx) = mpsc::channel(100);
        let source_ctx = SourceContext {
            max_torrents: config.max_torrents_per_source,
            interval: config.source_period(),
            min_channels: config.min_channels,
            min_connections: config.min_connections,
            hops: config.hops,
            overlay: deps.overlay,
            engine: deps.engine.clone(),
            notifier: deps.notifier,
            http: reqwest::Client::new(),
            store_dir: deps.mining_dir.join("torrents"),
            events,
        };
        Ok(Self {
            config,
            policy,
            engine: deps.engine,
            health: deps.health,
            mining_dir: deps.mining_dir,
            source_ctx,
            sources: HashMap::new(),
            torrents: HashMap::new(),
            user_downloads: HashSet::new(),
            events_rx: Some(events_rx),
        })
    }

    pub fn policy(&self) -> MiningPolicy {
        self.policy
    }

    /// Registers the sources listed in the configuration.
    ///
    /// Sources named in `sources.disabled` are registered but not polled.
    pub fn load_configured_sources(&mut self) {
        let listed = &self.config.sources;
        let mut raw: Vec<String> = Vec::new();
        for key in listed.boosting.iter().chain(&listed.enabled).chain(&listed.archive) {
            if !raw.contains(key) {
                raw.push(key.clone());
            }
        }
        let archive: HashSet<String> = listed.archive.iter().cloned().collect();
        let disabled: HashSet<String> = listed.disabled.iter().cloned().collect();

        for entry in raw {
            let key = match SourceKey::parse(&entry) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("Ignoring boosting source {:?}: {}", entry, e);
                    continue;
                }
            };
            if let Err(e) = self.add_source(key.clone(), archive.contains(&entry)) {
                tracing::warn!("Cannot add boosting source {}: {}", entry, e);
                continue;
            }
            if disabled.contains(&entry) {
                self.disable_source(&key);
            }
        }
    }

    /// Starts polling a source. Adding a known source is a no-op.
    pub fn add_source(&mut self, key: SourceKey, archive: bool) -> Result<(), MiningError> {
        if self.sources.contains_key(&key) {
            tracing::debug!("Boosting source {} already registered", key);
            return Ok(());
        }
        tracing::info!("Adding boosting source {}{}", key, if archive { " (archive)" } else { "" });
        let cancel = spawn_source(BoostingSource::new(&key), self.source_ctx.clone());
        self.sources.insert(
            key,
            SourceState {
                enabled: true,
                archive,
                cancel: Some(cancel),
                torrents: HashSet::new(),
                archived: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Stops a source and drops its torrents from the pool.
    ///
    /// # Errors
    /// - `MiningError::UnknownSource` - no such source
    pub async fn remove_source(&mut self, key: &SourceKey) -> Result<(), MiningError> {
        let state = self
            .sources
            .remove(key)
            .ok_or_else(|| MiningError::UnknownSource {
                key: key.to_string(),
            })?;
        if let Some(cancel) = state.cancel {
            cancel.cancel();
        }
        for infohash in state.torrents {
            self.stop_torrent(&infohash).await;
            self.torrents.remove(&infohash);
            if let Some(health) = &self.health {
                let _ = health.remove_torrent(infohash).await;
            }
        }
        tracing::info!("Removed boosting source {}", key);
        Ok(())
    }

    /// Stops polling a source; its torrents stay in the pool but are not run.
    fn disable_source(&mut self, key: &SourceKey) {
        let Some(state) = self.sources.get_mut(key) else {
            return;
        };
        state.enabled = false;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        for infohash in &state.torrents {
            if let Some(torrent) = self.torrents.get_mut(infohash) {
                torrent.enabled = false;
            }
        }
        tracing::info!("Disabled boosting source {}", key);
    }

    pub(crate) async fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Torrent { key, def } => {
                let mut torrent = MiningTorrent::new(*def, key);
                torrent.preload = self.is_archive(&torrent.source);
                self.on_torrent_insert(torrent).await;
            }
            SourceEvent::Failed { key, error } => {
                tracing::warn!("Boosting source {} disabled: {}", key, error);
                self.disable_source(&key);
            }
        }
    }

    /// Admits a torrent from a source into the pool.
    ///
    /// Returns false when it was refused: unknown or disabled source, the
    /// source is full, or another source already supplies it.
    pub async fn on_torrent_insert(&mut self, torrent: MiningTorrent) -> bool {
        let infohash = torrent.infohash();
        let cap = self.config.max_torrents_per_source;
        let Some(state) = self.sources.get_mut(&torrent.source) else {
            return false;
        };
        if !state.enabled {
            return false;
        }
        if let Some(existing) = self.torrents.get(&infohash) {
            tracing::debug!(
                "{} already mined from {}, ignoring copy from {}",
                infohash,
                existing.source,
                torrent.source
            );
            return false;
        }
        if state.torrents.len() >= cap {
            tracing::debug!("Source {} is full, dropping {}", torrent.source, infohash);
            return false;
        }
        state.torrents.insert(infohash);

        tracing::info!("Mining candidate {} ({}) from {}", torrent.def.name(), infohash, torrent.source);
        let trackers = torrent.def.get_trackers();
        self.torrents.insert(infohash, torrent);
        if let Some(health) = &self.health
            && let Err(e) = health.add_torrent(infohash, trackers).await
        {
            tracing::debug!("Health checker unavailable: {}", e);
        }

        for duplicate in mark_duplicates(&mut self.torrents, &infohash) {
            if self.torrents.get(&duplicate).is_some_and(|t| t.running) {
                self.stop_torrent(&duplicate).await;
            }
        }
        true
    }

    /// One pass of the selection loop.
    pub async fn select_torrents(&mut self) {
        self.refresh_download_states().await;
        self.maintain_archives().await;

        let mut pool: Vec<&MiningTorrent> = self
            .torrents
            .values()
            .filter(|t| {
                t.enabled
                    && !t.is_duplicate
                    && !self.is_archive(&t.source)
                    && !self.user_downloads.contains(&t.infohash())
            })
            .collect();
        pool.sort_by_key(|t| t.infohash());
        let (to_start, to_stop) = self.policy.apply(&pool, self.config.max_torrents_active);
        if !to_start.is_empty() || !to_stop.is_empty() {
            tracing::debug!(
                "Policy {} starts {} and stops {} torrents",
                self.policy.name(),
                to_start.len(),
                to_stop.len()
            );
        }

        for infohash in to_stop {
            self.stop_torrent(&infohash).await;
        }
        for infohash in to_start {
            self.start_torrent(&infohash).await;
        }

        // Running duplicates or torrents of disabled sources are left over
        // from before the flags changed.
        let stale: Vec<InfoHash> = self
            .torrents
            .values()
            .filter(|t| t.running && (t.is_duplicate || !t.enabled))
            .map(MiningTorrent::infohash)
            .collect();
        for infohash in stale {
            self.stop_torrent(&infohash).await;
        }
    }

    fn is_archive(&self, key: &SourceKey) -> bool {
        self.sources.get(key).is_some_and(|s| s.archive)
    }

    async fn refresh_download_states(&mut self) {
        let downloads = match self.engine.get_downloads(true).await {
            Ok(downloads) => downloads,
            Err(e) => {
                tracing::warn!("Cannot read download states: {}", e);
                return;
            }
        };
        let states: HashMap<InfoHash, SeedingStats> = downloads
            .iter()
            .filter(|d| d.hidden)
            .map(|d| (d.infohash, SeedingStats::from(d)))
            .collect();
        self.user_downloads = downloads
            .iter()
            .filter(|d| !d.hidden && self.torrents.contains_key(&d.infohash))
            .map(|d| d.infohash)
            .collect();
        for (infohash, torrent) in &mut self.torrents {
            match states.get(infohash) {
                Some(stats) => {
                    torrent.running = true;
                    torrent.last_seeding_stats = Some(stats.clone());
                }
                None => torrent.running = false,
            }
        }
    }

    /// Keeps archive torrents downloading until they seed.
    async fn maintain_archives(&mut self) {
        let mut finished = Vec::new();
        let mut pending = Vec::new();
        for state in self.sources.values().filter(|s| s.archive && s.enabled) {
            for infohash in &state.torrents {
                let Some(torrent) = self.torrents.get(infohash) else {
                    continue;
                };
                if state.archived.contains(infohash) || torrent.is_duplicate {
                    continue;
                }
                let seeding = torrent
                    .last_seeding_stats
                    .as_ref()
                    .is_some_and(|s| s.progress >= 1.0);
                if torrent.running && seeding {
                    finished.push((torrent.source.clone(), *infohash));
                } else if !torrent.running {
                    pending.push(*infohash);
                }
            }
        }

        for (key, infohash) in finished {
            if self.status_of(&infohash).await == Some(DownloadStatus::Seeding) {
                tracing::info!("Archive torrent {} complete", infohash);
                self.remove_download(&infohash, false).await;
                if let Some(state) = self.sources.get_mut(&key) {
                    state.archived.insert(infohash);
                }
            }
        }
        for infohash in pending {
            self.start_torrent(&infohash).await;
        }
    }

    async fn status_of(&self, infohash: &InfoHash) -> Option<DownloadStatus> {
        self.engine.get_download(*infohash).await.ok().map(|s| s.status)
    }

    /// Checks the engine for a visible download of `infohash` and remembers it.
    async fn is_user_download(&mut self, infohash: &InfoHash) -> bool {
        if self.user_downloads.contains(infohash) {
            return true;
        }
        match self.engine.get_download(*infohash).await {
            Ok(state) if !state.hidden => {
                tracing::debug!("{} is a user download, leaving it alone", infohash);
                self.user_downloads.insert(*infohash);
                if let Some(torrent) = self.torrents.get_mut(infohash) {
                    torrent.running = false;
                }
                true
            }
            _ => false,
        }
    }

    fn download_config(&self, torrent: &MiningTorrent) -> DownloadConfig {
        DownloadConfig {
            hops: self.config.hops,
            dest_dir: self.mining_dir.clone(),
            safe_seeding: true,
            share_mode: !torrent.preload,
            share_mode_target: Some(self.config.share_mode_target),
            hidden: true,
            checkpoint_disabled: true,
            priority: torrent.prio,
            time_added: chrono::Utc::now().timestamp(),
            ..DownloadConfig::default()
        }
    }

    async fn start_torrent(&mut self, infohash: &InfoHash) {
        if self.is_user_download(infohash).await {
            return;
        }
        let Some(torrent) = self.torrents.get(infohash) else {
            return;
        };
        let config = self.download_config(torrent);
        let source = DownloadSource::Def(DownloadDef::Full(torrent.def.clone()));
        match self.engine.start(source, config).await {
            Ok(state) if !state.hidden => {
                // The user added it between the check and the start.
                self.user_downloads.insert(*infohash);
            }
            Ok(_) => {
                tracing::info!("Started mining {}", infohash);
                if let Some(torrent) = self.torrents.get_mut(infohash) {
                    torrent.running = true;
                }
            }
            Err(e) => tracing::warn!("Cannot start mining {}: {}", infohash, e),
        }
    }

    async fn stop_torrent(&mut self, infohash: &InfoHash) {
        self.remove_download(infohash, true).await;
    }

    async fn remove_download(&mut self, infohash: &InfoHash, remove_content: bool) {
        if self.is_user_download(infohash).await {
            return;
        }
        match self.engine.remove(*infohash, remove_content, true).await {
            Ok(()) => tracing::info!("Stopped mining {}", infohash),
            Err(EngineError::DownloadNotFound { .. }) => {}
            Err(e) => {
                tracing::warn!("Cannot stop mining {}: {}", infohash, e);
                return;
            }
        }
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.running = false;
        }
    }

    /// One pass of the scrape loop.
    pub async fn scrape_trackers(&mut self) {
        let infohashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for infohash in infohashes {
            let running = self.torrents.get(&infohash).is_some_and(|t| t.running);
            let from_peers = if running {
                match self.engine.get_peers(infohash).await {
                    Ok(peers) => translate_peers_into_health(&peers),
                    Err(_) => (0, 0),
                }
            } else {
                (0, 0)
            };
            let catalog = match &self.health {
                Some(health) => health
                    .get_health(infohash)
                    .await
                    .ok()
                    .flatten()
                    .map(|h| (h.seeders, h.leechers)),
                None => None,
            };
            let (seeders, leechers) = merge_counts(catalog, from_peers);
            if let Some(torrent) = self.torrents.get_mut(&infohash) {
                torrent.num_seeders = seeders;
                torrent.num_leechers = leechers;
            }

            if let Some(health) = self.health.clone() {
                tokio::spawn(async move {
                    if let Err(e) = health.check_torrent_health(infohash, MINING_HEALTH_TIMEOUT).await {
                        tracing::debug!("Health check for {} failed: {}", infohash, e);
                    }
                });
            }
        }
    }

    /// Folds tracker results into the pool.
    pub fn on_notification(&mut self, notification: &Notification) {
        if let Notification::TorrentHealthUpdated {
            infohash,
            seeders,
            leechers,
            ..
        } = notification
            && let Some(torrent) = self.torrents.get_mut(infohash)
        {
            torrent.num_seeders = *seeders;
            torrent.num_leechers = *leechers;
        }
    }

    pub fn torrents(&self) -> Vec<MiningTorrentInfo> {
        let mut torrents: Vec<MiningTorrentInfo> =
            self.torrents.values().map(MiningTorrentInfo::from).collect();
        torrents.sort_by_key(|t| t.infohash);
        torrents
    }

    pub fn sources(&self) -> Vec<MiningSourceInfo> {
        let mut sources: Vec<MiningSourceInfo> = self
            .sources
            .iter()
            .map(|(key, state)| MiningSourceInfo {
                key: key.to_string(),
                enabled: state.enabled,
                archive: state.archive,
                torrents: state.torrents.len(),
            })
            .collect();
        sources.sort_by(|a, b| a.key.cmp(&b.key));
        sources
    }

    /// Kills every source task and removes mined downloads.
    pub async fn shutdown(&mut self) {
        for state in self.sources.values_mut() {
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
        }
        let running: Vec<InfoHash> = self
            .torrents
            .values()
            .filter(|t| t.running)
            .map(MiningTorrent::infohash)
            .collect();
        for infohash in running {
            self.stop_torrent(&infohash).await;
        }
    }

    async fn handle_command(&mut self, command: MiningCommand) -> bool {
        tracing::trace!("Mining command: {}", command.name());
        match command {
            MiningCommand::AddSource {
                key,
                archive,
                responder,
            } => {
                let _ = responder.send(self.add_source(key, archive));
            }
            MiningCommand::RemoveSource { key, responder } => {
                let _ = responder.send(self.remove_source(&key).await);
            }
            MiningCommand::GetTorrents { responder } => {
                let _ = responder.send(self.torrents());
            }
            MiningCommand::GetSources { responder } => {
                let _ = responder.send(self.sources());
            }
            MiningCommand::Shutdown { responder } => {
                self.shutdown().await;
                let _ = responder.send(());
                return false;
            }
        }
        true
    }
}

/// Commands accepted by the mining actor.
pub enum MiningCommand {
    AddSource {
        key: SourceKey,
        archive: bool,
        responder: oneshot::Sender<Result<(), MiningError>>,
    },
    RemoveSource {
        key: SourceKey,
        responder: oneshot::Sender<Result<(), MiningError>>,
    },
    GetTorrents {
        responder: oneshot::Sender<Vec<MiningTorrentInfo>>,
    },
    GetSources {
        responder: oneshot::Sender<Vec<MiningSourceInfo>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

impl MiningCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MiningCommand::AddSource { .. } => "add_source",
            MiningCommand::RemoveSource { .. } => "remove_source",
            MiningCommand::GetTorrents { .. } => "get_torrents",
            MiningCommand::GetSources { .. } => "get_sources",
            MiningCommand::Shutdown { .. } => "shutdown",
        }
    }
}

/// Handle for communicating with the mining actor.
#[derive(Clone)]
pub struct CreditMiningHandle {
    sender: mpsc::Sender<MiningCommand>,
}

impl CreditMiningHandle {
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, command: MiningCommand) -> Result<(), MiningError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| MiningError::ManagerShutdown)
    }

    /// # Errors
    /// - `MiningError::ManagerShutdown` - actor has stopped
    pub async fn add_source(&self, key: SourceKey, archive: bool) -> Result<(), MiningError> {
        let (responder, rx) = oneshot::channel();
        self.send(MiningCommand::AddSource {
            key,
            archive,
            responder,
        })
        .await?;
        rx.await.map_err(|_| MiningError::ManagerShutdown)?
    }

    /// # Errors
    /// - `MiningError::UnknownSource` - no such source
    pub async fn remove_source(&self, key: SourceKey) -> Result<(), MiningError> {
        let (responder, rx) = oneshot::channel();
        self.send(MiningCommand::RemoveSource { key, responder }).await?;
        rx.await.map_err(|_| MiningError::ManagerShutdown)?
    }

    /// # Errors
    /// - `MiningError::ManagerShutdown` - actor has stopped
    pub async fn get_torrents(&self) -> Result<Vec<MiningTorrentInfo>, MiningError> {
        let (responder, rx) = oneshot::channel();
        self.send(MiningCommand::GetTorrents { responder }).await?;
        rx.await.map_err(|_| MiningError::ManagerShutdown)
    }

    /// # Errors
    /// - `MiningError::ManagerShutdown` - actor has stopped
    pub async fn get_sources(&self) -> Result<Vec<MiningSourceInfo>, MiningError> {
        let (responder, rx) = oneshot::channel();
        self.send(MiningCommand::GetSources { responder }).await?;
        rx.await.map_err(|_| MiningError::ManagerShutdown)
    }

    /// Stops every source and removes mined downloads.
    ///
    /// # Errors
    /// - `MiningError::ManagerShutdown` - actor already stopped
    pub async fn shutdown(&self) -> Result<(), MiningError> {
        let (responder, rx) = oneshot::channel();
        self.send(MiningCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| MiningError::ManagerShutdown)
    }
}

/// Spawns the mining actor with the configured sources.
///
/// # Errors
/// - `MiningError::UnknownPolicy` - `config.policy` names no policy
pub fn spawn_credit_mining(
    config: CreditMiningConfig,
    deps: MiningDeps,
) -> Result<CreditMiningHandle, MiningError> {
    let notifications = deps.notifier.subscribe();
    let mut manager = CreditMiningManager::new(config, deps)?;
    let (sender, receiver) = mpsc::channel(100);
    tokio::spawn(async move {
        manager.load_configured_sources();
        run_actor_loop(manager, receiver, notifications).await;
    });
    Ok(CreditMiningHandle { sender })
}

async fn run_actor_loop(
    mut manager: CreditMiningManager,
    mut receiver: mpsc::Receiver<MiningCommand>,
    mut notifications: broadcast::Receiver<Notification>,
) {
    let Some(mut events) = manager.events_rx.take() else {
        return;
    };
    tracing::info!(
        "Credit mining started with policy {} and {} sources",
        manager.policy.name(),
        manager.sources.len()
    );

    let mut swarm_ticker = tokio::time::interval(manager.config.swarm_period());
    swarm_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tracker_ticker = tokio::time::interval(manager.config.tracker_period());
    tracker_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    manager.shutdown().await;
                    break;
                };
                if !manager.handle_command(command).await {
                    break;
                }
            }
            Some(event) = events.recv() => manager.handle_source_event(event).await,
            notification = notifications.recv() => match notification {
                Ok(notification) => manager.on_notification(&notification),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("Credit mining missed {} notifications", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = swarm_ticker.tick() => manager.select_torrents().await,
            _ = tracker_ticker.tick() => manager.scrape_trackers().await,
        }
    }
    tracing::debug!("Credit mining stopped");
}
