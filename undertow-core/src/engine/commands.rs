//! Command definitions for the download manager actor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use super::EngineError;
use super::download::{DownloadConfig, DownloadState};
use super::session::PeerInfo;
use super::stream::StreamTarget;
use crate::torrent::{DownloadDef, InfoHash, TorrentDef};

/// Reply channel for fallible commands.
pub type Responder<T> = oneshot::Sender<Result<T, EngineError>>;

/// Whether the tunnel layer can currently carry traffic for a hop count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitAvailability {
    #[default]
    Ready,
    /// No ready circuit yet, still building.
    Building,
    /// No exit candidates are known.
    NoExits,
}

/// How far checkpoint loading at startup has come.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointProgress {
    pub total: usize,
    pub loaded: usize,
    pub all_loaded: bool,
}

/// Commands processed by the download manager actor.
///
/// Operations that depend on an engine alert (handle creation, removal,
/// resume data, metadata) park their responder until the alert arrives.
pub enum DownloadCommand {
    Start {
        def: DownloadDef,
        config: DownloadConfig,
        resume_data: Option<Vec<u8>>,
        responder: Responder<DownloadState>,
    },
    Remove {
        infohash: InfoHash,
        remove_content: bool,
        remove_checkpoint: bool,
        responder: Responder<()>,
    },
    Pause {
        infohash: InfoHash,
        responder: Responder<()>,
    },
    Resume {
        infohash: InfoHash,
        responder: Responder<()>,
    },
    ForceRecheck {
        infohash: InfoHash,
        responder: Responder<()>,
    },
    MoveStorage {
        infohash: InfoHash,
        destination: PathBuf,
        responder: Responder<()>,
    },
    SetSelectedFiles {
        infohash: InfoHash,
        selected: Vec<usize>,
        responder: Responder<()>,
    },
    SetCompletedDir {
        infohash: InfoHash,
        completed_dir: Option<PathBuf>,
        responder: Responder<()>,
    },
    UpdateTrackers {
        infohash: InfoHash,
        trackers: Vec<String>,
        responder: Responder<()>,
    },
    GetDownloads {
        include_hidden: bool,
        responder: oneshot::Sender<Vec<DownloadState>>,
    },
    GetDownload {
        infohash: InfoHash,
        responder: Responder<DownloadState>,
    },
    GetDownloadDef {
        infohash: InfoHash,
        responder: Responder<(DownloadDef, DownloadConfig)>,
    },
    GetPeers {
        infohash: InfoHash,
        responder: Responder<Vec<PeerInfo>>,
    },
    ConnectPeer {
        infohash: InfoHash,
        addr: SocketAddr,
        responder: Responder<()>,
    },
    /// Asks the engine for fresh resume data; `None` when it failed.
    SaveResumeData {
        infohash: InfoHash,
        responder: Responder<Option<Vec<u8>>>,
    },
    PrepareStream {
        infohash: InfoHash,
        file_index: usize,
        responder: Responder<StreamTarget>,
    },
    GetMetainfo {
        infohash: InfoHash,
        timeout: Duration,
        hops: u8,
        url: Option<String>,
        responder: Responder<TorrentDef>,
    },
    /// Sends a BEP-33 scrape `get_peers` through the hop-0 DHT.
    DhtScrape {
        infohash: InfoHash,
        responder: Responder<()>,
    },
    UpdateCircuitAvailability {
        hops: u8,
        availability: CircuitAvailability,
    },
    LoadCheckpoints {
        responder: Responder<CheckpointProgress>,
    },
    GetCheckpointProgress {
        responder: oneshot::Sender<CheckpointProgress>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

impl DownloadCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DownloadCommand::Start { .. } => "start",
            DownloadCommand::Remove { .. } => "remove",
            DownloadCommand::Pause { .. } => "pause",
            DownloadCommand::Resume { .. } => "resume",
            DownloadCommand::ForceRecheck { .. } => "force_recheck",
            DownloadCommand::MoveStorage { .. } => "move_storage",
            DownloadCommand::SetSelectedFiles { .. } => "set_selected_files",
            DownloadCommand::SetCompletedDir { .. } => "set_completed_dir",
            DownloadCommand::UpdateTrackers { .. } => "update_trackers",
            DownloadCommand::GetDownloads { .. } => "get_downloads",
            DownloadCommand::GetDownload { .. } => "get_download",
            DownloadCommand::GetDownloadDef { .. } => "get_download_def",
            DownloadCommand::GetPeers { .. } => "get_peers",
            DownloadCommand::ConnectPeer { .. } => "connect_peer",
            DownloadCommand::SaveResumeData { .. } => "save_resume_data",
            DownloadCommand::PrepareStream { .. } => "prepare_stream",
            DownloadCommand::GetMetainfo { .. } => "get_metainfo",
            DownloadCommand::DhtScrape { .. } => "dht_scrape",
            DownloadCommand::UpdateCircuitAvailability { .. } => "update_circuit_availability",
            DownloadCommand::LoadCheckpoints { .. } => "load_checkpoints",
            DownloadCommand::GetCheckpointProgress { .. } => "get_checkpoint_progress",
            DownloadCommand::Shutdown { .. } => "shutdown",
        }
    }
}
