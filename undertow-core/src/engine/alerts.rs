//! Typed alerts popped from engine sessions.

use std::net::SocketAddr;

use super::session::TorrentStatus;
use crate::torrent::InfoHash;

/// Performance warning text that triggers a larger send buffer.
pub const SEND_BUFFER_WATERMARK_TOO_LOW: &str = "send buffer watermark too low";

/// Performance warning text that triggers a larger disk queue.
pub const OUTSTANDING_DISK_WRITES_REACHED: &str = "max outstanding disk writes reached";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Incoming,
    Outgoing,
}

/// Disk counters reported with session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub queued_disk_jobs: u64,
    pub queued_write_bytes: u64,
    pub num_write_jobs: u64,
}

impl SessionCounters {
    /// True once no disk I/O is pending.
    pub fn is_idle(&self) -> bool {
        self.queued_disk_jobs == 0 && self.queued_write_bytes == 0 && self.num_write_jobs == 0
    }
}

/// Engine events, delivered in emission order per session.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    AddTorrent {
        infohash: InfoHash,
        error: Option<String>,
    },
    TorrentRemoved {
        infohash: InfoHash,
    },
    /// Metadata arrived from peers; `info` is the bencoded info dictionary.
    MetadataReceived {
        infohash: InfoHash,
        info: Vec<u8>,
    },
    TrackerReply {
        infohash: InfoHash,
        url: String,
        num_peers: u32,
    },
    TrackerError {
        infohash: InfoHash,
        url: String,
        message: String,
    },
    TrackerWarning {
        infohash: InfoHash,
        url: String,
        message: String,
    },
    SaveResumeData {
        infohash: InfoHash,
        resume_data: Vec<u8>,
    },
    SaveResumeDataFailed {
        infohash: InfoHash,
        message: String,
    },
    Performance {
        infohash: Option<InfoHash>,
        message: String,
    },
    TorrentFinished {
        infohash: InfoHash,
    },
    StateUpdate {
        statuses: Vec<TorrentStatus>,
    },
    SessionStats {
        counters: SessionCounters,
    },
    /// Raw KRPC packet seen by the DHT.
    DhtPacket {
        direction: PacketDirection,
        node: SocketAddr,
        packet: Vec<u8>,
    },
}

impl Alert {
    /// Torrent the alert refers to, if any.
    pub fn infohash(&self) -> Option<InfoHash> {
        match self {
            Alert::AddTorrent { infohash, .. }
            | Alert::TorrentRemoved { infohash }
            | Alert::MetadataReceived { infohash, .. }
            | Alert::TrackerReply { infohash, .. }
            | Alert::TrackerError { infohash, .. }
            | Alert::TrackerWarning { infohash, .. }
            | Alert::SaveResumeData { infohash, .. }
            | Alert::SaveResumeDataFailed { infohash, .. }
            | Alert::TorrentFinished { infohash } => Some(*infohash),
            Alert::Performance { infohash, .. } => *infohash,
            Alert::StateUpdate { .. } | Alert::SessionStats { .. } | Alert::DhtPacket { .. } => {
                None
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Alert::AddTorrent { .. } => "add_torrent_alert",
            Alert::TorrentRemoved { .. } => "torrent_removed_alert",
            Alert::MetadataReceived { .. } => "metadata_received_alert",
            Alert::TrackerReply { .. } => "tracker_reply_alert",
            Alert::TrackerError { .. } => "tracker_error_alert",
            Alert::TrackerWarning { .. } => "tracker_warning_alert",
            Alert::SaveResumeData { .. } => "save_resume_data_alert",
            Alert::SaveResumeDataFailed { .. } => "save_resume_data_failed_alert",
            Alert::Performance { .. } => "performance_alert",
            Alert::TorrentFinished { .. } => "torrent_finished_alert",
            Alert::StateUpdate { .. } => "state_update_alert",
            Alert::SessionStats { .. } => "session_stats_alert",
            Alert::DhtPacket { .. } => "dht_pkt_alert",
        }
    }
}
