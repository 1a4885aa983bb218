//! Tracker health checking
//!
//! Obtains `(seeders, leechers)` for torrents by multi-scraping their HTTP
//! and UDP trackers and estimating swarm size from BEP-33 DHT replies. The
//! checker schedules one tracker at a time, reconciles results across
//! trackers and writes them back into the catalog.

pub mod bloom;
pub mod catalog;
pub mod checker;
pub mod dht;
pub mod http;
pub mod session;
pub mod udp;

pub use bloom::{BloomFilter, estimate_count};
pub use catalog::{HealthStatus, TorrentHealth, TrackerCatalog};
pub use checker::{HealthChecker, HealthCheckerHandle, spawn_health_checker};
pub use dht::{DhtHealthManager, DhtScraper, DhtTrackerSession};
pub use http::HttpTrackerSession;
pub use session::{
    RetryPolicy, ScrapeResult, SessionState, TrackerResponse, TrackerSession,
    create_tracker_session,
};
pub use udp::{TransactionRegistry, UdpTrackerSession};

use crate::ErrorKind;

/// Errors produced while scraping a tracker.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Tracker {url} failed: {message}")]
    TrackerFailed { url: String, message: String },

    #[error("Tracker {url} timed out")]
    Timeout { url: String },

    #[error("Protocol violation from {url}: {message}")]
    Protocol { url: String, message: String },

    #[error("Unsupported tracker URL: {url}")]
    UnsupportedTracker { url: String },

    #[error("Session for {url} cannot take more infohashes")]
    SessionFull { url: String },

    #[error("Health checker has shut down")]
    CheckerShutdown,
}

impl HealthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HealthError::TrackerFailed { .. } | HealthError::Timeout { .. } => ErrorKind::TransientIo,
            HealthError::Protocol { .. } => ErrorKind::Protocol,
            HealthError::UnsupportedTracker { .. } => ErrorKind::Validation,
            HealthError::SessionFull { .. } => ErrorKind::ResourceLimit,
            HealthError::CheckerShutdown => ErrorKind::Fatal,
        }
    }

    /// Message stored as the tracker's error text.
    pub fn message(&self) -> String {
        match self {
            HealthError::TrackerFailed { message, .. } | HealthError::Protocol { message, .. } => {
                message.clone()
            }
            HealthError::Timeout { .. } => "timeout".to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn failed(url: &str, message: impl Into<String>) -> Self {
        HealthError::TrackerFailed {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn protocol(url: &str, message: impl Into<String>) -> Self {
        HealthError::Protocol {
            url: url.to_string(),
            message: message.into(),
        }
    }
}
