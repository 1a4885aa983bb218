//! Undertow Core - anonymous BitTorrent distribution
//!
//! This crate provides the engineering core of Undertow: torrent metainfo and
//! Merkle trees, a download façade over an embedded engine, the onion-routed
//! tunnel layer with its admission and payout scheduler, a multi-tracker
//! health checker, and the credit-mining controller.

pub mod config;
pub mod constants;
pub mod engine;
pub mod health;
pub mod mining;
pub mod notifications;
pub mod torrent;
pub mod tracing_setup;
pub mod tunnel;

// Re-export main types for convenient access
pub use config::{ConfigError, UndertowConfig};
pub use engine::{DownloadManagerHandle, EngineError, spawn_download_manager};
pub use health::HealthError;
pub use mining::MiningError;
pub use notifications::{Notification, Notifier};
pub use torrent::{InfoHash, TorrentDef, TorrentError};
pub use tunnel::{LedgerError, TunnelError};

/// Failure classes shared by every subsystem.
///
/// Drives propagation: only `Fatal` and user-facing `Validation` errors
/// leave background loops; everything else is handled where it occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or an illegal combination of options.
    Validation,
    /// Network hiccups that are retried by the owning session.
    TransientIo,
    /// Slots, circuits or disk space exhausted.
    ResourceLimit,
    /// Peer sent something that violates the wire protocol.
    Protocol,
    /// Hash, signature or chain verification failed.
    Integrity,
    /// Requested entity does not exist.
    NotFound,
    /// Initialization cannot continue.
    Fatal,
}

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Health check error: {0}")]
    Health(#[from] HealthError),

    #[error("Credit mining error: {0}")]
    Mining(#[from] MiningError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Classifies the error for propagation and status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UndertowError::Torrent(e) => e.kind(),
            UndertowError::Engine(e) => e.kind(),
            UndertowError::Tunnel(e) => e.kind(),
            UndertowError::Ledger(_) => ErrorKind::Integrity,
            UndertowError::Health(e) => e.kind(),
            UndertowError::Mining(e) => e.kind(),
            UndertowError::Config(_) => ErrorKind::Fatal,
            UndertowError::Io(_) => ErrorKind::TransientIo,
        }
    }

    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::InvalidMagnetLink { reason } => {
                    format!("Invalid magnet link: {reason}")
                }
                _ => "Torrent error occurred".to_string(),
            },
            UndertowError::Engine(e) => match e {
                EngineError::DownloadNotFound { infohash } => {
                    format!("Download {infohash} not found")
                }
                EngineError::LowStorage { free_bytes } => {
                    format!("Not enough free disk space ({free_bytes} bytes left)")
                }
                EngineError::InvalidRequest { reason } => reason.clone(),
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Tunnel(_) | UndertowError::Ledger(_) => {
                "Anonymity layer error occurred".to_string()
            }
            UndertowError::Health(e) => format!("Tracker check failed: {e}"),
            UndertowError::Mining(_) => "Credit mining error occurred".to_string(),
            UndertowError::Config(e) => format!("Configuration problem: {e}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
