//! Core download manager running inside the actor.
//!
//! Owns one engine session per hop count, every [`Download`], pending
//! metainfo lookups and the checkpoint store. All state is touched from the
//! actor task only; operations waiting on an engine alert park a oneshot
//! responder that the alert handler completes.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use super::alerts::{Alert, OUTSTANDING_DISK_WRITES_REACHED, SEND_BUFFER_WATERMARK_TOO_LOW};
use super::checkpoint::{Checkpoint, CheckpointStore};
use super::commands::{CheckpointProgress, CircuitAvailability, Responder};
use super::disk::DiskSpace;
use super::download::{Download, DownloadConfig, DownloadState, PRIORITY_HIGHEST, TrackerStatus};
use super::session::{
    AddFlags, AddTorrentParams, EngineSession, IpFilter, PeerInfo, SessionFactory,
    SessionSettings, bootstrap_dht,
};
use super::stream::StreamTarget;
use super::EngineError;
use crate::config::UndertowConfig;
use crate::constants::{
    LOW_STORAGE_THRESHOLD, MAX_QUEUED_DISK_BYTES, MAX_SEND_BUFFER_WATERMARK, METAINFO_CACHE_SIZE,
    SHUTDOWN_DRAIN_TIMEOUT,
};
use crate::health::dht::DhtHealthManager;
use crate::notifications::{Notification, Notifier};
use crate::torrent::bencode;
use crate::torrent::magnet::parse_magnet;
use crate::torrent::{DownloadDef, InfoHash, TorrentDef};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// In-flight metadata lookup shared by every caller asking for one infohash.
struct MetainfoRequest {
    hops: u8,
    waiters: Vec<Responder<TorrentDef>>,
    deadline: Instant,
    /// False when a user download already owned the engine handle.
    owns_handle: bool,
    trackers: Vec<String>,
}

/// Torrent waiting for the DHT before being handed to the engine.
struct PendingAdd {
    hops: u8,
    deadline: Instant,
}

#[derive(Default)]
struct Waiters {
    removed: HashMap<InfoHash, Vec<Responder<()>>>,
    resume: HashMap<InfoHash, Vec<Responder<Option<Vec<u8>>>>>,
}

/// State owned by the download manager actor.
pub struct DownloadManager {
    config: UndertowConfig,
    factory: Arc<dyn SessionFactory>,
    sessions: HashMap<u8, Box<dyn EngineSession>>,
    shutdown_ready: HashMap<u8, bool>,
    downloads: HashMap<InfoHash, Download>,
    pending_adds: HashMap<InfoHash, PendingAdd>,
    waiters: Waiters,
    metainfo_requests: HashMap<InfoHash, MetainfoRequest>,
    metainfo_cache: LruCache<InfoHash, TorrentDef>,
    checkpoints: CheckpointStore,
    checkpoint_progress: CheckpointProgress,
    circuit_availability: HashMap<u8, CircuitAvailability>,
    notifier: Notifier,
    disk: Arc<dyn DiskSpace>,
    dht_health: Option<Arc<DhtHealthManager>>,
}

impl DownloadManager {
    pub fn new(
        config: UndertowConfig,
        factory: Arc<dyn SessionFactory>,
        notifier: Notifier,
        disk: Arc<dyn DiskSpace>,
        dht_health: Option<Arc<DhtHealthManager>>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(METAINFO_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            checkpoints: CheckpointStore::new(config.checkpoint_dir()),
            config,
            factory,
            sessions: HashMap::new(),
            shutdown_ready: HashMap::new(),
            downloads: HashMap::new(),
            pending_adds: HashMap::new(),
            waiters: Waiters::default(),
            metainfo_requests: HashMap::new(),
            metainfo_cache: LruCache::new(cache_size),
            checkpoint_progress: CheckpointProgress::default(),
            circuit_availability: HashMap::new(),
            notifier,
            disk,
            dht_health,
        }
    }

    fn availability(&self, hops: u8) -> CircuitAvailability {
        if hops == 0 {
            return CircuitAvailability::Ready;
        }
        self.circuit_availability
            .get(&hops)
            .copied()
            .unwrap_or(CircuitAvailability::Building)
    }

    fn download(&self, infohash: &InfoHash) -> Result<&Download, EngineError> {
        self.downloads
            .get(infohash)
            .ok_or(EngineError::DownloadNotFound {
                infohash: *infohash,
            })
    }

    fn download_mut(&mut self, infohash: &InfoHash) -> Result<&mut Download, EngineError> {
        self.downloads
            .get_mut(infohash)
            .ok_or(EngineError::DownloadNotFound {
                infohash: *infohash,
            })
    }

    fn session(&mut self, hops: u8) -> &mut dyn EngineSession {
        ensure_session(&mut self.sessions, self.factory.as_ref(), &self.config, hops)
    }

    /// Session for `hops` without creating one.
    fn existing_session(&mut self, hops: u8) -> Option<&mut Box<dyn EngineSession>> {
        self.sessions.get_mut(&hops)
    }

    /// Starts a download, or merges trackers into an existing one.
    ///
    /// Returns before the engine has created the handle.
    ///
    /// # Errors
    /// - `EngineError::InvalidRequest` - config combination is illegal
    /// - `EngineError::LowStorage` - destination disk is nearly full
    pub fn start_download(
        &mut self,
        def: DownloadDef,
        config: DownloadConfig,
        resume_data: Option<Vec<u8>>,
    ) -> Result<DownloadState, EngineError> {
        config.validate()?;
        let infohash = def.infohash();

        if self.downloads.contains_key(&infohash) {
            tracing::info!("Download {} already exists, merging trackers", infohash);
            if let DownloadDef::Full(full) = &def {
                let download = self.download_mut(&infohash)?;
                if download.def().as_full().is_none() {
                    download.upgrade_metainfo(full.clone());
                }
            }
            self.update_trackers(&infohash, &def.trackers())?;
            let download = self.download(&infohash)?;
            return Ok(download.state(self.availability(download.config().hops)));
        }

        if let Some(free_bytes) = self.disk.free_space(&config.dest_dir)
            && free_bytes < LOW_STORAGE_THRESHOLD
        {
            tracing::warn!(
                "Refusing to start {}: only {} bytes free in {}",
                infohash,
                free_bytes,
                config.dest_dir.display()
            );
            self.notifier.notify(Notification::LowStorage { free_bytes });
            return Err(EngineError::LowStorage { free_bytes });
        }

        let hops = config.hops;
        let mut download = Download::new(def, config);
        download.resume_data = resume_data;
        tracing::info!(
            "Starting download {} ({}) with {} hops",
            download.def().name(),
            infohash,
            hops
        );
        let state = download.state(self.availability(hops));
        self.downloads.insert(infohash, download);
        self.checkpoint(&infohash);
        self.add_handle(&infohash)?;
        Ok(state)
    }

    /// Hands a download to its engine session, adopting an existing handle.
    fn add_handle(&mut self, infohash: &InfoHash) -> Result<(), EngineError> {
        let hops = self.download(infohash)?.config().hops;
        let gate = Duration::from_secs(self.config.libtorrent.dht_readiness_timeout);

        if self.session(hops).find_torrent(infohash) {
            tracing::debug!("Adopting existing engine handle for {}", infohash);
            if let Some(request) = self.metainfo_requests.get_mut(infohash) {
                request.owns_handle = false;
            }
            let params = self.download(infohash)?.add_params()?;
            let session = self.session(hops);
            session.set_upload_mode(infohash, params.flags.upload_mode);
            session.prioritize_files(infohash, &params.file_priorities);
            if params.flags.paused {
                session.pause(infohash);
            } else {
                session.resume(infohash);
            }
            self.on_add_torrent(hops, infohash, None);
            return Ok(());
        }

        if !gate.is_zero() && !self.session(hops).dht_is_ready() {
            tracing::debug!("Delaying add of {} until the DHT is ready", infohash);
            self.pending_adds.insert(
                *infohash,
                PendingAdd {
                    hops,
                    deadline: Instant::now() + gate,
                },
            );
            return Ok(());
        }

        let params = self.download(infohash)?.add_params()?;
        self.session(hops).add_torrent_async(params);
        Ok(())
    }

    fn flush_pending_adds(&mut self) {
        let now = Instant::now();
        let due: Vec<InfoHash> = self
            .pending_adds
            .iter()
            .filter(|(_, pending)| {
                now >= pending.deadline
                    || self
                        .sessions
                        .get(&pending.hops)
                        .is_some_and(|s| s.dht_is_ready())
            })
            .map(|(infohash, _)| *infohash)
            .collect();

        for infohash in due {
            let Some(pending) = self.pending_adds.remove(&infohash) else {
                continue;
            };
            let params = match self.download(&infohash).and_then(Download::add_params) {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!("Dropping delayed add of {}: {}", infohash, e);
                    continue;
                }
            };
            self.session(pending.hops).add_torrent_async(params);
        }
    }

    /// Removes a download; the responder fires once the engine confirms.
    pub fn remove_download(
        &mut self,
        infohash: InfoHash,
        remove_content: bool,
        remove_checkpoint: bool,
        responder: Responder<()>,
    ) {
        let Some(download) = self.downloads.remove(&infohash) else {
            let _ = responder.send(Err(EngineError::DownloadNotFound { infohash }));
            return;
        };
        self.pending_adds.remove(&infohash);
        tracing::info!(
            "Removing download {} (content: {}, checkpoint: {})",
            infohash,
            remove_content,
            remove_checkpoint
        );

        if remove_checkpoint && let Err(e) = self.checkpoints.remove(&infohash) {
            tracing::warn!("Could not delete checkpoint of {}: {}", infohash, e);
        }

        let hops = download.config().hops;
        match self.existing_session(hops) {
            Some(session) if session.find_torrent(&infohash) => {
                session.remove_torrent(&infohash, remove_content);
                self.waiters
                    .removed
                    .entry(infohash)
                    .or_default()
                    .push(responder);
            }
            _ => {
                let _ = responder.send(Ok(()));
            }
        }
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn pause(&mut self, infohash: &InfoHash) -> Result<(), EngineError> {
        let download = self.download_mut(infohash)?;
        download.config.user_stopped = true;
        let hops = download.config.hops;
        if let Some(session) = self.existing_session(hops)
            && session.find_torrent(infohash)
        {
            session.pause(infohash);
            session.save_resume_data(infohash);
        }
        self.checkpoint(infohash);
        Ok(())
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn resume(&mut self, infohash: &InfoHash) -> Result<(), EngineError> {
        let download = self.download_mut(infohash)?;
        download.config.user_stopped = false;
        download.error = None;
        let hops = download.config.hops;
        if let Some(session) = self.existing_session(hops) {
            session.resume(infohash);
        }
        self.checkpoint(infohash);
        Ok(())
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn force_recheck(&mut self, infohash: &InfoHash) -> Result<(), EngineError> {
        let hops = self.download(infohash)?.config().hops;
        if let Some(session) = self.existing_session(hops) {
            session.force_recheck(infohash);
        }
        Ok(())
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn move_storage(&mut self, infohash: &InfoHash, destination: PathBuf) -> Result<(), EngineError> {
        let download = self.download_mut(infohash)?;
        let hops = download.config.hops;
        download.config.dest_dir = destination.clone();
        if let Some(session) = self.existing_session(hops) {
            session.move_storage(infohash, &destination);
        }
        self.checkpoint(infohash);
        Ok(())
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    /// - `EngineError::InvalidRequest` - an index is out of range
    pub fn set_selected_files(&mut self, infohash: &InfoHash, selected: &[usize]) -> Result<(), EngineError> {
        let download = self.download_mut(infohash)?;
        let file_count = download.def().files().len();
        if let Some(bad) = selected.iter().find(|&&i| i >= file_count) {
            return Err(EngineError::invalid(format!(
                "file index {bad} out of range ({file_count} files)"
            )));
        }
        download.config.selected_files = selected.iter().copied().collect::<BTreeSet<_>>();
        let hops = download.config.hops;
        let priorities = download.file_priorities();
        if let Some(session) = self.existing_session(hops) {
            session.prioritize_files(infohash, &priorities);
        }
        self.checkpoint(infohash);
        Ok(())
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn set_completed_dir(&mut self, infohash: &InfoHash, completed_dir: Option<PathBuf>) -> Result<(), EngineError> {
        self.download_mut(infohash)?.config.completed_dir = completed_dir;
        self.checkpoint(infohash);
        Ok(())
    }

    /// Adds trackers not yet known to the download and rewrites its metainfo.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn update_trackers(&mut self, infohash: &InfoHash, trackers: &[String]) -> Result<(), EngineError> {
        let download = self.download_mut(infohash)?;
        let mut all = download.def().trackers();
        let added: Vec<String> = trackers
            .iter()
            .filter(|t| !t.is_empty() && !all.contains(t))
            .cloned()
            .collect();
        if added.is_empty() {
            return Ok(());
        }
        all.extend(added.iter().cloned());
        download.def = download.def().with_trackers(&all);
        let hops = download.config.hops;
        tracing::debug!("Added {} trackers to {}", added.len(), infohash);
        if let Some(session) = self.existing_session(hops) {
            session.replace_trackers(infohash, &all);
        }
        self.checkpoint(infohash);
        Ok(())
    }

    pub fn downloads(&self, include_hidden: bool) -> Vec<DownloadState> {
        let mut states: Vec<DownloadState> = self
            .downloads
            .values()
            .filter(|d| include_hidden || !d.is_hidden())
            .map(|d| d.state(self.availability(d.config().hops)))
            .collect();
        states.sort_by(|a, b| a.time_added.cmp(&b.time_added).then(a.name.cmp(&b.name)));
        states
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn download_state(&self, infohash: &InfoHash) -> Result<DownloadState, EngineError> {
        let download = self.download(infohash)?;
        Ok(download.state(self.availability(download.config().hops)))
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn download_def(&self, infohash: &InfoHash) -> Result<(DownloadDef, DownloadConfig), EngineError> {
        let download = self.download(infohash)?;
        Ok((download.def().clone(), download.config().clone()))
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn peers(&mut self, infohash: &InfoHash) -> Result<Vec<PeerInfo>, EngineError> {
        let hops = self.download(infohash)?.config().hops;
        Ok(self
            .existing_session(hops)
            .map(|s| s.peer_info(infohash))
            .unwrap_or_default())
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub fn connect_peer(&mut self, infohash: &InfoHash, addr: SocketAddr) -> Result<(), EngineError> {
        let hops = self.download(infohash)?.config().hops;
        self.session(hops).connect_peer(infohash, addr);
        Ok(())
    }

    /// Requests fresh resume data; answers at once when there is no handle.
    pub fn save_resume_data(&mut self, infohash: InfoHash, responder: Responder<Option<Vec<u8>>>) {
        let (hops, current) = match self.download(&infohash) {
            Ok(d) => (d.config().hops, d.resume_data.clone()),
            Err(e) => {
                let _ = responder.send(Err(e));
                return;
            }
        };
        match self.existing_session(hops) {
            Some(session) if session.find_torrent(&infohash) => {
                session.save_resume_data(&infohash);
                self.waiters
                    .resume
                    .entry(infohash)
                    .or_default()
                    .push(responder);
            }
            _ => {
                let _ = responder.send(Ok(current));
            }
        }
    }

    /// Switches a file to streaming: sequential order and top priority.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    /// - `EngineError::InvalidRequest` - metainfo missing or bad file index
    pub fn prepare_stream(&mut self, infohash: &InfoHash, file_index: usize) -> Result<StreamTarget, EngineError> {
        let download = self.download(infohash)?;
        let def = download
            .def()
            .as_full()
            .ok_or_else(|| EngineError::invalid("metainfo not yet available"))?;
        let file = def
            .files()
            .get(file_index)
            .ok_or_else(|| EngineError::invalid(format!("no file with index {file_index}")))?;

        let mut path = download.config().dest_dir.clone();
        if def.is_multi_file() {
            path.push(def.name());
        }
        path.extend(&file.path);

        let target = StreamTarget {
            path,
            file_size: file.length,
            file_offset: def.file_offset(file_index).unwrap_or(0),
            piece_length: def.piece_length(),
        };

        let hops = download.config().hops;
        let mut priorities = download.file_priorities();
        if let Some(priority) = priorities.get_mut(file_index) {
            *priority = PRIORITY_HIGHEST;
        }
        let session = self.session(hops);
        session.set_sequential_download(infohash, true);
        session.prioritize_files(infohash, &priorities);
        tracing::debug!("Streaming file {} of {}", file_index, infohash);
        Ok(target)
    }

    /// Looks up metainfo, sharing one engine request between callers.
    pub fn get_metainfo(
        &mut self,
        infohash: InfoHash,
        timeout: Duration,
        hops: u8,
        url: Option<String>,
        responder: Responder<TorrentDef>,
    ) {
        if let Some(def) = self.metainfo_cache.get(&infohash) {
            let _ = responder.send(Ok(def.clone()));
            return;
        }
        if let Some(def) = self
            .downloads
            .get(&infohash)
            .and_then(|d| d.def().as_full())
        {
            let _ = responder.send(Ok(def.clone()));
            return;
        }
        if let Some(request) = self.metainfo_requests.get_mut(&infohash) {
            tracing::debug!("Joining pending metainfo request for {}", infohash);
            request.waiters.push(responder);
            return;
        }

        let trackers = url
            .as_deref()
            .filter(|u| u.starts_with("magnet:"))
            .and_then(|u| parse_magnet(u).ok())
            .map(|m| m.trackers)
            .unwrap_or_default();

        let owns_handle = !self.downloads.contains_key(&infohash);
        if owns_handle {
            let params = AddTorrentParams {
                infohash,
                name: infohash.to_hex(),
                metainfo: None,
                trackers: trackers.clone(),
                save_path: self.config.state_dir.join("metainfo"),
                file_priorities: Vec::new(),
                resume_data: None,
                flags: AddFlags {
                    upload_mode: true,
                    ..Default::default()
                },
            };
            tracing::info!("Fetching metainfo for {} over {} hops", infohash, hops);
            self.session(hops).add_torrent_async(params);
        }

        self.metainfo_requests.insert(
            infohash,
            MetainfoRequest {
                hops,
                waiters: vec![responder],
                deadline: Instant::now() + timeout,
                owns_handle,
                trackers,
            },
        );
    }

    /// Drops abandoned or expired metainfo requests.
    fn expire_metainfo_requests(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        for (infohash, request) in self.metainfo_requests.iter_mut() {
            request.waiters.retain(|w| !w.is_closed());
            if request.waiters.is_empty() || now >= request.deadline {
                finished.push(*infohash);
            }
        }

        for infohash in finished {
            let Some(request) = self.metainfo_requests.remove(&infohash) else {
                continue;
            };
            if !request.waiters.is_empty() {
                tracing::info!("Metainfo lookup for {} timed out", infohash);
            }
            for waiter in request.waiters {
                let _ = waiter.send(Err(EngineError::MetainfoTimeout { infohash }));
            }
            self.release_metainfo_handle(&infohash, request.hops, request.owns_handle);
        }
    }

    fn release_metainfo_handle(&mut self, infohash: &InfoHash, hops: u8, owns_handle: bool) {
        if !owns_handle || self.downloads.contains_key(infohash) {
            return;
        }
        if let Some(session) = self.existing_session(hops) {
            session.remove_torrent(infohash, true);
        }
    }

    /// Issues a BEP-33 scrape through the hop-0 DHT.
    pub fn dht_scrape(&mut self, infohash: &InfoHash) {
        self.session(0).dht_get_peers(infohash, true);
    }

    pub fn set_circuit_availability(&mut self, hops: u8, availability: CircuitAvailability) {
        self.circuit_availability.insert(hops, availability);
    }

    pub fn checkpoint_progress(&self) -> CheckpointProgress {
        self.checkpoint_progress
    }

    /// Restores every download found in the checkpoint directory.
    ///
    /// Broken checkpoints are skipped; ones without a destination are deleted.
    ///
    /// # Errors
    /// - `EngineError::Io` - checkpoint directory cannot be listed
    pub async fn load_checkpoints(&mut self) -> Result<CheckpointProgress, EngineError> {
        let files = self.checkpoints.list()?;
        self.checkpoint_progress = CheckpointProgress {
            total: files.len(),
            loaded: 0,
            all_loaded: files.is_empty(),
        };
        tracing::info!("Loading {} checkpoints", files.len());

        for path in files {
            self.load_checkpoint(&path);
            self.checkpoint_progress.loaded += 1;
            tokio::task::yield_now().await;
        }
        self.checkpoint_progress.all_loaded = true;
        Ok(self.checkpoint_progress)
    }

    fn load_checkpoint(&mut self, path: &Path) {
        let checkpoint = match CheckpointStore::load_file(path) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!("Skipping checkpoint {}: {}", path.display(), e);
                return;
            }
        };
        if checkpoint.config.dest_dir.as_os_str().is_empty() {
            tracing::warn!("Removing checkpoint {} without destination", path.display());
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Could not remove {}: {}", path.display(), e);
            }
            return;
        }
        if self.downloads.contains_key(&checkpoint.infohash) {
            return;
        }
        let def = match checkpoint.download_def() {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!("Skipping checkpoint {}: {}", path.display(), e);
                return;
            }
        };
        let mut config = checkpoint.config.clone();
        config.user_stopped = checkpoint.user_stopped;
        if let Err(e) = self.start_download(def, config, checkpoint.resume_data.clone()) {
            tracing::warn!("Could not restore {}: {}", checkpoint.infohash, e);
        }
    }

    /// Writes the checkpoint of one download unless disabled for it.
    fn checkpoint(&self, infohash: &InfoHash) {
        let Some(download) = self.downloads.get(infohash) else {
            return;
        };
        if download.config().checkpoint_disabled {
            return;
        }
        let status = download.status(self.availability(download.config().hops));
        if let Err(e) = self
            .checkpoints
            .save(&Checkpoint::from_download(download, status))
        {
            tracing::warn!("Failed to checkpoint {}: {}", infohash, e);
        }
    }

    /// One alert-loop iteration: requests status updates and dispatches alerts.
    pub fn tick(&mut self) {
        self.flush_pending_adds();
        self.expire_metainfo_requests();

        let mut hops: Vec<u8> = self.sessions.keys().copied().collect();
        hops.sort_unstable();
        for hop in hops {
            let alerts = match self.sessions.get_mut(&hop) {
                Some(session) => {
                    session.post_torrent_updates();
                    session.pop_alerts()
                }
                None => continue,
            };
            for alert in alerts {
                self.handle_alert(hop, alert);
            }
        }
    }

    fn handle_alert(&mut self, hops: u8, alert: Alert) {
        tracing::trace!("Alert {} on session {}", alert.name(), hops);
        match alert {
            Alert::AddTorrent { infohash, error } => self.on_add_torrent(hops, &infohash, error),
            Alert::TorrentRemoved { infohash } => {
                for waiter in self.waiters.removed.remove(&infohash).unwrap_or_default() {
                    let _ = waiter.send(Ok(()));
                }
            }
            Alert::MetadataReceived { infohash, info } => self.on_metadata(hops, &infohash, &info),
            Alert::TrackerReply {
                infohash,
                url,
                num_peers,
            } => self.set_tracker_status(&infohash, url, Some(num_peers), "Working".to_string()),
            Alert::TrackerError {
                infohash,
                url,
                message,
            } => {
                let text = if message.is_empty() {
                    "Error".to_string()
                } else {
                    message
                };
                self.set_tracker_status(&infohash, url, None, text);
            }
            Alert::TrackerWarning {
                infohash,
                url,
                message,
            } => self.set_tracker_status(&infohash, url, None, format!("Warning: {message}")),
            Alert::SaveResumeData {
                infohash,
                resume_data,
            } => {
                if let Some(download) = self.downloads.get_mut(&infohash) {
                    download.resume_data = Some(resume_data.clone());
                }
                self.checkpoint(&infohash);
                for waiter in self.waiters.resume.remove(&infohash).unwrap_or_default() {
                    let _ = waiter.send(Ok(Some(resume_data.clone())));
                }
            }
            Alert::SaveResumeDataFailed { infohash, message } => {
                tracing::debug!("Resume data for {} unavailable: {}", infohash, message);
                for waiter in self.waiters.resume.remove(&infohash).unwrap_or_default() {
                    let _ = waiter.send(Ok(None));
                }
            }
            Alert::Performance { message, .. } => self.on_performance(hops, &message),
            Alert::TorrentFinished { infohash } => self.on_finished(hops, &infohash),
            Alert::StateUpdate { statuses } => {
                for status in statuses {
                    let infohash = status.infohash;
                    let Some(download) = self.downloads.get_mut(&infohash) else {
                        continue;
                    };
                    download.last_status = Some(status);
                    if download.should_stop_seeding() {
                        tracing::info!("Seeding target reached for {}, stopping", infohash);
                        if let Some(session) = self.sessions.get_mut(&hops) {
                            session.pause(&infohash);
                        }
                        if let Some(status) = download.last_status.as_mut() {
                            status.paused = true;
                        }
                    }
                }
            }
            Alert::SessionStats { counters } => {
                self.shutdown_ready.insert(hops, counters.is_idle());
            }
            Alert::DhtPacket {
                direction,
                node,
                packet,
            } => {
                if let Some(dht) = &self.dht_health {
                    dht.observe_packet(direction, node, &packet);
                }
            }
        }
    }

    fn on_add_torrent(&mut self, hops: u8, infohash: &InfoHash, error: Option<String>) {
        let Some(download) = self.downloads.get_mut(infohash) else {
            return;
        };
        if let Some(reason) = &error {
            tracing::warn!("Engine rejected {}: {}", infohash, reason);
            download.error = error;
            download.handle_ready = false;
            return;
        }
        download.handle_ready = true;
        let user_stopped = download.config().user_stopped;
        tracing::debug!("Engine handle ready for {} on session {}", infohash, hops);
        if user_stopped && let Some(session) = self.sessions.get_mut(&hops) {
            session.pause(infohash);
        }
        self.checkpoint(infohash);
    }

    fn on_metadata(&mut self, hops: u8, infohash: &InfoHash, info: &[u8]) {
        let info = match bencode::decode(info) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Undecodable metadata for {}: {}", infohash, e);
                return;
            }
        };
        let base = match TorrentDef::load_from_dict(bencode::dict([("info", info)])) {
            Ok(def) if def.infohash() == *infohash => def,
            Ok(_) => {
                tracing::warn!("Metadata for {} hashes to a different infohash", infohash);
                return;
            }
            Err(e) => {
                tracing::warn!("Invalid metadata for {}: {}", infohash, e);
                return;
            }
        };

        if let Some(download) = self.downloads.get_mut(infohash)
            && download.def().as_full().is_none()
        {
            let trackers = download.def().trackers();
            download.upgrade_metainfo(base.with_trackers(&trackers));
            let priorities = download.file_priorities();
            let download_hops = download.config().hops;
            tracing::info!("Received metainfo for {}", infohash);
            if let Some(session) = self.sessions.get_mut(&download_hops) {
                session.prioritize_files(infohash, &priorities);
            }
            self.checkpoint(infohash);
        }

        if let Some(request) = self.metainfo_requests.remove(infohash) {
            let def = base.with_trackers(&request.trackers);
            self.metainfo_cache.put(*infohash, def.clone());
            for waiter in request.waiters {
                let _ = waiter.send(Ok(def.clone()));
            }
            self.release_metainfo_handle(infohash, hops, request.owns_handle);
        }
    }

    fn set_tracker_status(&mut self, infohash: &InfoHash, url: String, peers: Option<u32>, message: String) {
        let Some(download) = self.downloads.get_mut(infohash) else {
            return;
        };
        let entry = download
            .tracker_status
            .entry(url)
            .or_insert_with(|| TrackerStatus {
                peers: 0,
                message: String::new(),
            });
        if let Some(peers) = peers {
            entry.peers = peers;
        }
        entry.message = message;
    }

    fn on_performance(&mut self, hops: u8, message: &str) {
        let Some(session) = self.sessions.get_mut(&hops) else {
            return;
        };
        let mut settings: SessionSettings = session.settings().clone();
        if message.contains(SEND_BUFFER_WATERMARK_TOO_LOW) {
            settings.send_buffer_watermark =
                (settings.send_buffer_watermark * 2).min(MAX_SEND_BUFFER_WATERMARK);
            tracing::info!(
                "Raising send buffer watermark to {} on session {}",
                settings.send_buffer_watermark,
                hops
            );
        } else if message.contains(OUTSTANDING_DISK_WRITES_REACHED) {
            settings.max_queued_disk_bytes =
                (settings.max_queued_disk_bytes * 2).min(MAX_QUEUED_DISK_BYTES);
            tracing::info!(
                "Raising max queued disk bytes to {} on session {}",
                settings.max_queued_disk_bytes,
                hops
            );
        } else {
            return;
        }
        session.apply_settings(settings);
    }

    fn on_finished(&mut self, hops: u8, infohash: &InfoHash) {
        let Some(download) = self.downloads.get_mut(infohash) else {
            return;
        };
        tracing::info!("Download {} finished", infohash);
        self.notifier.notify(Notification::TorrentFinished {
            infohash: *infohash,
            name: download.def().name().to_string(),
            hidden: download.is_hidden(),
        });

        if let Some(completed_dir) = download.config().completed_dir.clone()
            && completed_dir != download.config().dest_dir
            && !download.is_hidden()
        {
            download.config.dest_dir = completed_dir.clone();
            if let Some(session) = self.sessions.get_mut(&hops) {
                session.move_storage(infohash, &completed_dir);
            }
        }
        self.checkpoint(infohash);
    }

    /// Flushes resume data, waits for disk I/O to drain and persists engine state.
    pub async fn shutdown(&mut self) {
        self.notifier.notify(Notification::ShutdownState {
            text: "Saving download resume data".to_string(),
        });
        let active: Vec<(InfoHash, u8)> = self
            .downloads
            .values()
            .filter(|d| d.handle_ready && !d.config().checkpoint_disabled)
            .map(|d| (d.infohash(), d.config().hops))
            .collect();
        for (infohash, hops) in active {
            if let Some(session) = self.existing_session(hops) {
                session.save_resume_data(&infohash);
            }
        }

        self.notifier.notify(Notification::ShutdownState {
            text: "Waiting for disk I/O to finish".to_string(),
        });
        self.shutdown_ready = self.sessions.keys().map(|h| (*h, false)).collect();
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            for session in self.sessions.values_mut() {
                session.post_session_stats();
            }
            let hops: Vec<u8> = self.sessions.keys().copied().collect();
            for hop in hops {
                let alerts = self
                    .sessions
                    .get_mut(&hop)
                    .map(|s| s.pop_alerts())
                    .unwrap_or_default();
                for alert in alerts {
                    self.handle_alert(hop, alert);
                }
            }
            if self.shutdown_ready.values().all(|ready| *ready) {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Disk I/O did not drain within {:?}", SHUTDOWN_DRAIN_TIMEOUT);
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        if let Some(session) = self.sessions.get(&0) {
            self.notifier.notify(Notification::ShutdownState {
                text: "Saving engine state".to_string(),
            });
            let state = session.save_state();
            let path = self.config.engine_state_path();
            if let Err(e) = std::fs::create_dir_all(&self.config.state_dir)
                .and_then(|_| std::fs::write(&path, state))
            {
                tracing::warn!("Could not write {}: {}", path.display(), e);
            }
        }

        self.metainfo_requests.clear();
        self.pending_adds.clear();
        self.notifier.notify(Notification::ShutdownState {
            text: "Download manager stopped".to_string(),
        });
        tracing::info!("Download manager shut down");
    }
}

fn ensure_session<'a>(
    sessions: &'a mut HashMap<u8, Box<dyn EngineSession>>,
    factory: &dyn SessionFactory,
    config: &UndertowConfig,
    hops: u8,
) -> &'a mut dyn EngineSession {
    sessions
        .entry(hops)
        .or_insert_with(|| create_session(factory, config, hops))
        .as_mut()
}

fn create_session(factory: &dyn SessionFactory, config: &UndertowConfig, hops: u8) -> Box<dyn EngineSession> {
    let settings = SessionSettings::for_hops(hops, &config.libtorrent);
    let mut session = factory.create(hops, settings);
    if hops == 0 {
        bootstrap_dht(session.as_mut());
        let path = config.engine_state_path();
        match std::fs::read(&path) {
            Ok(state) => session.load_state(&state),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not read {}: {}", path.display(), e),
        }
    } else {
        session.set_ip_filter(IpFilter::tunnel_only());
    }
    tracing::info!("Created engine session for {} hops", hops);
    session
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use tempfile::TempDir;
    use tokio::sync::oneshot;

    use super::*;
    use crate::engine::alerts::SessionCounters;
    use crate::engine::disk::FixedDiskSpace;
    use crate::engine::download::{DownloadStatus, SeedingMode};
    use crate::engine::simulated::{SimulatedSessionFactory, SimulatedSwarm};
    use crate::torrent::TorrentDefNoMetainfo;
    use crate::torrent::torrent_def::test_support::{multi_file_metainfo, single_file_metainfo};

    struct Fixture {
        _dir: TempDir,
        swarm: SimulatedSwarm,
        manager: DownloadManager,
        notifier: Notifier,
    }

    fn fixture_with(free: Option<u64>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = UndertowConfig::for_testing(dir.path());
        let swarm = SimulatedSwarm::new();
        let notifier = Notifier::new();
        let manager = DownloadManager::new(
            config,
            Arc::new(SimulatedSessionFactory::new(swarm.clone())),
            notifier.clone(),
            Arc::new(FixedDiskSpace(free)),
            None,
        );
        Fixture {
            _dir: dir,
            swarm,
            manager,
            notifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn sample_def(name: &str) -> TorrentDef {
        TorrentDef::load_from_dict(single_file_metainfo(name, 4096, 1024)).unwrap()
    }

    fn config_in(dir: &Path) -> DownloadConfig {
        DownloadConfig {
            dest_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_creates_hop_zero_session_lazily() {
        let mut f = fixture();
        assert!(f.swarm.sessions_created().is_empty());
        let def = sample_def("a.bin");
        let state = f
            .manager
            .start_download(DownloadDef::Full(def.clone()), config_in(f._dir.path()), None)
            .unwrap();

        assert_eq!(state.infohash, def.infohash());
        assert_eq!(state.status, DownloadStatus::WaitingForHashcheck);
        assert_eq!(f.swarm.sessions_created(), vec![0]);
        assert_eq!(f.swarm.add_calls(&def.infohash()), 1);
        assert!(f.manager.checkpoints.path_for(&def.infohash()).exists());
    }

    #[tokio::test]
    async fn test_start_existing_merges_trackers() {
        let mut f = fixture();
        let def = sample_def("b.bin");
        f.manager
            .start_download(DownloadDef::Full(def.clone()), config_in(f._dir.path()), None)
            .unwrap();
        let extra = def.with_trackers(&["udp://tracker.other:80".to_string()]);
        f.manager
            .start_download(DownloadDef::Full(extra), config_in(f._dir.path()), None)
            .unwrap();

        let (stored, _) = f.manager.download_def(&def.infohash()).unwrap();
        assert_eq!(
            stored.trackers(),
            vec![
                "http://tracker.example.com/announce".to_string(),
                "udp://tracker.other:80".to_string()
            ]
        );
        assert_eq!(f.swarm.add_calls(&def.infohash()), 1);
    }

    #[tokio::test]
    async fn test_low_storage_refuses_and_notifies() {
        let mut f = fixture_with(Some(LOW_STORAGE_THRESHOLD - 1));
        let mut rx = f.notifier.subscribe();
        let result = f.manager.start_download(
            DownloadDef::Full(sample_def("c.bin")),
            config_in(f._dir.path()),
            None,
        );
        assert!(matches!(result, Err(EngineError::LowStorage { .. })));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::LowStorage { .. }
        ));
    }

    #[tokio::test]
    async fn test_anonymous_session_gets_tunnel_filter() {
        let mut f = fixture();
        let config = DownloadConfig {
            hops: 2,
            safe_seeding: true,
            ..config_in(f._dir.path())
        };
        f.manager
            .start_download(DownloadDef::Full(sample_def("d.bin")), config, None)
            .unwrap();
        assert_eq!(f.manager.session(2).ip_filter(), IpFilter::tunnel_only());
        assert!(f.manager.session(2).settings().anonymous_mode);
    }

    #[tokio::test]
    async fn test_tick_advances_status_and_applies_seeding_policy() {
        let mut f = fixture();
        f.swarm.set_progress_step(1.0);
        let def = sample_def("e.bin");
        let config = DownloadConfig {
            seeding_mode: SeedingMode::Never,
            ..config_in(f._dir.path())
        };
        f.manager
            .start_download(DownloadDef::Full(def.clone()), config, None)
            .unwrap();

        f.manager.tick();
        let state = f.manager.download_state(&def.infohash()).unwrap();
        assert_eq!(state.progress, 1.0);
        assert_eq!(state.status, DownloadStatus::Stopped);
    }

    #[tokio::test]
    async fn test_remove_waits_for_engine_confirmation() {
        let mut f = fixture();
        let def = sample_def("f.bin");
        f.manager
            .start_download(DownloadDef::Full(def.clone()), config_in(f._dir.path()), None)
            .unwrap();
        f.manager.tick();

        let (tx, mut rx) = oneshot::channel();
        f.manager.remove_download(def.infohash(), false, true, tx);
        assert!(rx.try_recv().is_err());
        assert!(!f.manager.checkpoints.path_for(&def.infohash()).exists());

        f.manager.tick();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_remove_unknown_download() {
        let mut f = fixture();
        let (tx, rx) = oneshot::channel();
        f.manager.remove_download(InfoHash::new([7; 20]), false, false, tx);
        assert!(matches!(
            rx.await.unwrap(),
            Err(EngineError::DownloadNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_upgrades_magnet_download() {
        let mut f = fixture();
        let def = TorrentDef::load_from_dict(multi_file_metainfo(
            "album",
            &[("one.flac", 3000), ("two.flac", 5000)],
            1024,
        ))
        .unwrap();
        let magnet = TorrentDefNoMetainfo {
            infohash: def.infohash(),
            name: "album".to_string(),
            url: None,
            trackers: vec!["udp://tracker.example.com:80".to_string()],
        };
        f.manager
            .start_download(DownloadDef::NoMetainfo(magnet), config_in(f._dir.path()), None)
            .unwrap();
        f.manager.tick();
        assert_eq!(
            f.manager.download_state(&def.infohash()).unwrap().status,
            DownloadStatus::Metadata
        );

        f.swarm.publish_metadata(&def);
        f.manager.tick();
        let (stored, _) = f.manager.download_def(&def.infohash()).unwrap();
        let full = stored.as_full().unwrap();
        assert_eq!(full.files().len(), 2);
        assert_eq!(full.get_trackers(), vec!["udp://tracker.example.com:80".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_metainfo_requests_share_one_lookup() {
        let mut f = fixture();
        let def = sample_def("shared.bin");
        let ih = def.infohash();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        f.manager.get_metainfo(ih, Duration::from_secs(30), 0, None, tx1);
        f.manager.get_metainfo(ih, Duration::from_secs(30), 0, None, tx2);
        assert_eq!(f.swarm.add_calls(&ih), 1);

        f.swarm.publish_metadata(&def);
        f.manager.tick();
        assert_eq!(rx1.await.unwrap().unwrap().infohash(), ih);
        assert_eq!(rx2.await.unwrap().unwrap().infohash(), ih);

        let (tx3, rx3) = oneshot::channel();
        f.manager.get_metainfo(ih, Duration::from_secs(30), 0, None, tx3);
        assert_eq!(rx3.await.unwrap().unwrap().infohash(), ih);
        assert_eq!(f.swarm.add_calls(&ih), 1);
        assert!(f.manager.downloads(true).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metainfo_request_times_out() {
        let mut f = fixture();
        let ih = InfoHash::new([4; 20]);
        let (tx, rx) = oneshot::channel();
        f.manager.get_metainfo(ih, Duration::from_secs(5), 0, None, tx);

        tokio::time::advance(Duration::from_secs(6)).await;
        f.manager.tick();
        assert!(matches!(
            rx.await.unwrap(),
            Err(EngineError::MetainfoTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_caller_keeps_request_for_others() {
        let mut f = fixture();
        let ih = InfoHash::new([5; 20]);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        f.manager.get_metainfo(ih, Duration::from_secs(30), 0, None, tx1);
        f.manager.get_metainfo(ih, Duration::from_secs(30), 0, None, tx2);

        drop(rx1);
        f.manager.tick();
        assert!(f.manager.metainfo_requests.contains_key(&ih));
    }

    #[tokio::test]
    async fn test_performance_alert_doubles_up_to_cap() {
        let mut f = fixture();
        let before = f.manager.session(0).settings().send_buffer_watermark;
        f.swarm.inject_alert(
            0,
            Alert::Performance {
                infohash: None,
                message: SEND_BUFFER_WATERMARK_TOO_LOW.to_string(),
            },
        );
        f.manager.tick();
        assert_eq!(
            f.manager.session(0).settings().send_buffer_watermark,
            before * 2
        );

        for _ in 0..20 {
            f.swarm.inject_alert(
                0,
                Alert::Performance {
                    infohash: None,
                    message: OUTSTANDING_DISK_WRITES_REACHED.to_string(),
                },
            );
            f.manager.tick();
        }
        assert_eq!(
            f.manager.session(0).settings().max_queued_disk_bytes,
            MAX_QUEUED_DISK_BYTES
        );
    }

    #[tokio::test]
    async fn test_tracker_alerts_update_status() {
        let mut f = fixture();
        let def = sample_def("g.bin");
        let ih = def.infohash();
        f.manager
            .start_download(DownloadDef::Full(def), config_in(f._dir.path()), None)
            .unwrap();
        let url = "http://tracker.example.com/announce".to_string();
        f.swarm.inject_alert(
            0,
            Alert::TrackerReply {
                infohash: ih,
                url: url.clone(),
                num_peers: 12,
            },
        );
        f.swarm.inject_alert(
            0,
            Alert::TrackerWarning {
                infohash: ih,
                url: url.clone(),
                message: "slow down".to_string(),
            },
        );
        f.manager.tick();
        let status = &f.manager.download_state(&ih).unwrap().tracker_status[&url];
        assert_eq!(status.peers, 12);
        assert_eq!(status.message, "Warning: slow down");
    }

    #[tokio::test]
    async fn test_checkpoints_restore_downloads() {
        let dir = TempDir::new().unwrap();
        let config = UndertowConfig::for_testing(dir.path());
        let swarm = SimulatedSwarm::new();
        let def = sample_def("h.bin");
        {
            let mut manager = DownloadManager::new(
                config.clone(),
                Arc::new(SimulatedSessionFactory::new(swarm.clone())),
                Notifier::new(),
                Arc::new(FixedDiskSpace(None)),
                None,
            );
            let cfg = DownloadConfig {
                hops: 1,
                safe_seeding: true,
                selected_files: [0].into_iter().collect(),
                ..config_in(dir.path())
            };
            manager
                .start_download(DownloadDef::Full(def.clone()), cfg, None)
                .unwrap();
            manager.pause(&def.infohash()).unwrap();
        }

        let mut restored = DownloadManager::new(
            config,
            Arc::new(SimulatedSessionFactory::new(SimulatedSwarm::new())),
            Notifier::new(),
            Arc::new(FixedDiskSpace(None)),
            None,
        );
        let progress = restored.load_checkpoints().await.unwrap();
        assert_eq!(progress.total, 1);
        assert!(progress.all_loaded);

        let (stored, cfg) = restored.download_def(&def.infohash()).unwrap();
        assert_eq!(stored.infohash(), def.infohash());
        assert_eq!(cfg.hops, 1);
        assert_eq!(cfg.dest_dir, dir.path());
        assert!(cfg.user_stopped);
        assert_eq!(cfg.selected_files, [0].into_iter().collect::<BTreeSet<usize>>());
    }

    #[tokio::test]
    async fn test_checkpoint_without_destination_is_deleted() {
        let mut f = fixture();
        let def = sample_def("i.bin");
        let download = Download::new(DownloadDef::Full(def.clone()), DownloadConfig::default());
        let checkpoint = Checkpoint::from_download(&download, DownloadStatus::Stopped);
        f.manager.checkpoints.save(&checkpoint).unwrap();

        f.manager.load_checkpoints().await.unwrap();
        assert!(f.manager.downloads(true).is_empty());
        assert!(!f.manager.checkpoints.path_for(&def.infohash()).exists());
    }

    #[tokio::test]
    async fn test_prepare_stream_enables_sequential_and_priority() {
        let mut f = fixture();
        let def = TorrentDef::load_from_dict(multi_file_metainfo(
            "show",
            &[("s01e01.mkv", 3000), ("s01e02.mkv", 5000)],
            1024,
        ))
        .unwrap();
        let ih = def.infohash();
        f.manager
            .start_download(DownloadDef::Full(def), config_in(f._dir.path()), None)
            .unwrap();

        let target = f.manager.prepare_stream(&ih, 1).unwrap();
        assert_eq!(target.path, f._dir.path().join("show").join("s01e02.mkv"));
        assert_eq!(target.file_offset, 3000);
        assert_eq!(target.file_size, 5000);
        assert!(f.swarm.is_sequential(&ih));
        assert!(f.manager.prepare_stream(&ih, 2).is_err());
    }

    #[tokio::test]
    async fn test_dht_scrape_packets_reach_health_manager() {
        let dir = TempDir::new().unwrap();
        let swarm = SimulatedSwarm::new();
        let dht = Arc::new(DhtHealthManager::new());
        let mut manager = DownloadManager::new(
            UndertowConfig::for_testing(dir.path()),
            Arc::new(SimulatedSessionFactory::new(swarm.clone())),
            Notifier::new(),
            Arc::new(FixedDiskSpace(None)),
            Some(dht.clone()),
        );
        let ih = InfoHash::new([8; 20]);
        let seeders: Vec<IpAddr> = (1..=20u8).map(|i| IpAddr::from([10, 0, 0, i])).collect();
        swarm.set_dht_swarm(ih, &seeders, &[]);

        let lookup = dht.register_lookup(ih);
        manager.dht_scrape(&ih);
        manager.tick();
        let (seeds, peers) = dht.finish_lookup(lookup);
        assert!((15..=25).contains(&seeds), "estimated {seeds} seeders");
        assert_eq!(peers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_disk_and_saves_state() {
        let mut f = fixture();
        let mut rx = f.notifier.subscribe();
        f.manager
            .start_download(DownloadDef::Full(sample_def("j.bin")), config_in(f._dir.path()), None)
            .unwrap();
        f.manager.tick();
        f.swarm.set_disk_counters(SessionCounters {
            queued_write_bytes: 10,
            ..Default::default()
        });

        let swarm = f.swarm.clone();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            swarm.set_disk_counters(SessionCounters::default());
        });
        f.manager.shutdown().await;
        drain.await.unwrap();

        assert!(f.manager.config.engine_state_path().exists());
        let mut texts = Vec::new();
        while let Ok(Notification::ShutdownState { text }) = rx.try_recv() {
            texts.push(text);
        }
        assert_eq!(texts.first().map(String::as_str), Some("Saving download resume data"));
        assert_eq!(texts.last().map(String::as_str), Some("Download manager stopped"));
    }
}
