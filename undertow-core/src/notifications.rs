//! Process-wide event bus.
//!
//! Components publish immutable [`Notification`] values; subscribers hold a
//! broadcast receiver and stop receiving when it is dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::torrent::InfoHash;

const BUS_CAPACITY: usize = 256;

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Notification {
    /// A tunnelled peer's ledger balance became known.
    TorrentPeerUpdate {
        peer_id: String,
        infohash: InfoHash,
        balance: i64,
    },
    PeerDisconnected { peer_id: String },
    /// A channel known to credit mining changed its contents.
    ChannelEntityUpdated { channel_id: String },
    /// Progress text emitted while shutting down.
    ShutdownState { text: String },
    /// Free space on the download disk dropped below the threshold.
    LowStorage { free_bytes: u64 },
    /// Configuration could not be used; initialization aborted.
    ConfigError { message: String },
    TorrentFinished {
        infohash: InfoHash,
        name: String,
        hidden: bool,
    },
    /// Tracker or DHT check produced new swarm counts.
    TorrentHealthUpdated {
        infohash: InfoHash,
        seeders: u64,
        leechers: u64,
        last_check: i64,
    },
    /// Tunnel circuit lifecycle, mostly useful for diagnostics.
    CircuitEvent { circuit_id: u32, event: String },
}

/// Cloneable publisher for [`Notification`]s.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn notify(&self, notification: Notification) {
        tracing::trace!("notification: {:?}", notification);
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
