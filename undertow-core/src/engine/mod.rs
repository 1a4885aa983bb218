//! Download engine façade
//!
//! Owns one embedded engine session per anonymity level, every `Download`,
//! the 1 Hz alert loop and checkpoint persistence. The façade runs as an
//! actor; callers talk to it through [`DownloadManagerHandle`].

pub mod actor;
pub mod alerts;
pub mod checkpoint;
pub mod commands;
pub mod disk;
pub mod download;
pub mod handle;
pub mod manager;
pub mod session;
pub mod simulated;
pub mod stream;

pub use actor::{ManagerDeps, spawn_download_manager};
pub use alerts::{Alert, PacketDirection, SessionCounters};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use commands::{CheckpointProgress, CircuitAvailability};
pub use disk::{DiskSpace, FixedDiskSpace, SystemDiskSpace};
pub use download::{
    DownloadConfig, DownloadMode, DownloadState, DownloadStatus, SeedingMode, TrackerStatus,
};
pub use handle::{DownloadManagerHandle, DownloadSource};
pub use session::{
    AddTorrentParams, EngineSession, IpFilter, PeerInfo, SessionFactory, SessionSettings,
    TorrentState, TorrentStatus,
};
pub use simulated::{SimulatedSessionFactory, SimulatedSwarm};
pub use stream::StreamTarget;

use crate::ErrorKind;
use crate::torrent::{InfoHash, TorrentError};

/// Errors reported by the download façade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Download {infohash} not found")]
    DownloadNotFound { infohash: InfoHash },

    #[error("Free disk space too low: {free_bytes} bytes")]
    LowStorage { free_bytes: u64 },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Timed out fetching metainfo for {infohash}")]
    MetainfoTimeout { infohash: InfoHash },

    #[error("Failed to fetch {url}: {reason}")]
    MetainfoFetch { url: String, reason: String },

    #[error("Engine rejected torrent {infohash}: {reason}")]
    AddFailed { infohash: InfoHash, reason: String },

    #[error("Checkpoint error: {reason}")]
    Checkpoint { reason: String },

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download manager has shut down")]
    ManagerShutdown,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DownloadNotFound { .. } => ErrorKind::NotFound,
            EngineError::LowStorage { .. } => ErrorKind::ResourceLimit,
            EngineError::InvalidRequest { .. } => ErrorKind::Validation,
            EngineError::MetainfoTimeout { .. }
            | EngineError::MetainfoFetch { .. }
            | EngineError::Io(_) => ErrorKind::TransientIo,
            EngineError::AddFailed { .. } => ErrorKind::Protocol,
            EngineError::Checkpoint { .. } => ErrorKind::Integrity,
            EngineError::Torrent(e) => e.kind(),
            EngineError::ManagerShutdown => ErrorKind::Fatal,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidRequest {
            reason: reason.into(),
        }
    }
}
