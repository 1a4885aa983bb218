//! Credit mining
//!
//! Keeps a bounded set of hidden downloads running to earn bandwidth
//! credit. Boosting sources (directories, RSS feeds, channels) feed
//! candidate torrents into a pool; near-identical torrents are marked as
//! duplicates, and a policy picks which of the rest to run.

pub mod dedup;
pub mod manager;
pub mod policy;
pub mod rss;
pub mod source;

pub use dedup::{is_similar, large_files};
pub use manager::{
    CreditMiningHandle, CreditMiningManager, MiningCommand, MiningDeps, MiningSourceInfo,
    MiningTorrentInfo, spawn_credit_mining, translate_peers_into_health,
};
pub use policy::MiningPolicy;
pub use source::{ChannelId, ChannelOverlay, MiningTorrent, SeedingStats, SourceEvent, SourceKey};

use crate::ErrorKind;
use crate::engine::EngineError;
use crate::torrent::TorrentError;

/// Errors raised by credit mining.
#[derive(Debug, thiserror::Error)]
pub enum MiningError {
    #[error("Invalid source {key:?}: {reason}")]
    InvalidSource { key: String, reason: String },

    #[error("Unknown mining policy {name:?}")]
    UnknownPolicy { name: String },

    #[error("Source {key} is not registered")]
    UnknownSource { key: String },

    #[error("Fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    /// The server asked us to come back later.
    #[error("{url} is temporarily unavailable")]
    Unavailable { url: String },

    #[error("Channel overlay error: {reason}")]
    Channel { reason: String },

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credit mining has shut down")]
    ManagerShutdown,
}

impl MiningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MiningError::InvalidSource { .. } | MiningError::UnknownPolicy { .. } => {
                ErrorKind::Validation
            }
            MiningError::UnknownSource { .. } => ErrorKind::NotFound,
            MiningError::Fetch { .. }
            | MiningError::Unavailable { .. }
            | MiningError::Channel { .. }
            | MiningError::Io(_) => ErrorKind::TransientIo,
            MiningError::Torrent(e) => e.kind(),
            MiningError::Engine(e) => e.kind(),
            MiningError::ManagerShutdown => ErrorKind::Fatal,
        }
    }

    pub(crate) fn fetch(url: &str, reason: impl Into<String>) -> Self {
        MiningError::Fetch {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}
