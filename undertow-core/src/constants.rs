//! Protocol constants and timing defaults shared across subsystems.
//!
//! Values here are fixed at compile time. Tunables that operators may change
//! live in [`crate::config`].

use std::time::Duration;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

// Metainfo

/// SHA-1 digest length used for piece hashes and infohashes.
pub const HASH_LEN: usize = 20;

/// Piece length used for Merkle torrents when none is requested.
pub const MERKLE_DEFAULT_PIECE_LENGTH: u32 = 256 * 1024;

/// Regex every path component of a torrent file entry must match.
pub const PATH_COMPONENT_PATTERN: &str = r"^[^/\\.~][^/\\]*$";

// Download engine

/// Interval between alert polls of every engine session.
pub const ALERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling for the send buffer watermark when the engine asks for more.
pub const MAX_SEND_BUFFER_WATERMARK: u64 = 50 * MIB;

/// Ceiling for queued disk bytes when the engine reports write pressure.
pub const MAX_QUEUED_DISK_BYTES: u64 = 64 * MIB;

/// Free space below which new downloads are refused.
pub const LOW_STORAGE_THRESHOLD: u64 = 100 * MIB;

/// Upper bound on how long shutdown waits for disk I/O to drain.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory under the state dir holding per-download checkpoints.
pub const CHECKPOINT_DIR: &str = "dlcheckpoints";

/// Engine snapshot filename under the state dir.
pub const ENGINE_STATE_FILE: &str = "lt.state";

/// Magic stored in every checkpoint's `file-format` key.
pub const RESUME_FILE_FORMAT: &str = "libtorrent resume file";

/// Default number of cached metainfo dictionaries for `get_metainfo`.
pub const METAINFO_CACHE_SIZE: usize = 64;

/// DHT bootstrap routers for the hop-0 session.
pub const DHT_ROUTERS: &[(&str, u16)] = &[
    ("router.bittorrent.com", 6881),
    ("router.utorrent.com", 6881),
    ("dht.transmissionbt.com", 6881),
    ("dht.libtorrent.org", 25401),
];

// Tunnel layer

/// Sentinel address through which tunnelled peers enter a hop-N session.
pub const TUNNEL_SENTINEL_IP: [u8; 4] = [1, 1, 1, 1];

/// Lowest virtual port handed to a tunnelled peer.
pub const VIRTUAL_PORT_MIN: u16 = 1024;

/// Payouts are only made for circuits that downloaded at least this much.
pub const PAYOUT_THRESHOLD: u64 = MIB;

/// Prefix hashed together with the hex infohash to form the lookup infohash.
pub const LOOKUP_INFOHASH_PREFIX: &[u8] = b"tribler anonymous download";

/// Largest cell payload accepted from the wire.
pub const MAX_CELL_SIZE: usize = 64 * 1024;

/// Period of circuit timeouts and the hidden-download monitor.
pub const TUNNEL_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Data circuits kept per hop count in use by a download.
pub const DATA_CIRCUITS_PER_HOP_COUNT: usize = 2;

// Tracker health

/// Maximum number of infohashes carried by one multi-scrape.
pub const MAX_MULTI_SCRAPE: usize = 74;

/// BEP-15 protocol magic sent with CONNECT.
pub const UDP_PROTOCOL_ID: i64 = 0x41727101980;

/// Largest transaction id handed out for UDP tracker sessions.
///
/// Historically named for 32 bits but equal to the 16-bit maximum.
// TODO: widen to u32::MAX once peers tolerate ids above 0xFFFF.
pub const MAX_TRANSACTION_ID: u32 = (1 << 16) - 1;

/// HTTP scrape retry policy.
pub const HTTP_RETRY_MAX: u32 = 0;
pub const HTTP_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// UDP scrape retry policy; the interval doubles per retry.
pub const UDP_RETRY_MAX: u32 = 8;
pub const UDP_RETRY_BASE: Duration = Duration::from_secs(15);

/// DHT pseudo-session retry policy.
pub const DHT_RETRY_MAX: u32 = 8;
pub const DHT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Bounds of the dynamic tracker selection interval, in seconds.
pub const TRACKER_SELECTION_MIN_SECS: u64 = 10;
pub const TRACKER_SELECTION_MAX_SECS: u64 = 100;
pub const TRACKER_SELECTION_BUDGET_SECS: u64 = 7200;

/// A tracker is considered dead after this many consecutive failures.
pub const MAX_TRACKER_FAILURES: u32 = 5;

/// Seconds added per consecutive failure before a tracker is retried.
pub const TRACKER_FAILURE_BACKOFF_SECS: i64 = 60;

/// Bloom filter geometry used by BEP-33 scrape replies.
pub const BLOOM_FILTER_BYTES: usize = 256;
pub const BLOOM_FILTER_BITS: usize = BLOOM_FILTER_BYTES * 8;
pub const BLOOM_FILTER_HASHES: u32 = 2;

// Credit mining

/// Files below this size are ignored when comparing torrents for duplicates.
pub const DEDUP_MIN_FILE_SIZE: u64 = MIB;

/// Maximum edit distance between file names of similar torrents.
pub const SIMILARITY_THRESHOLD: usize = 8;

/// Delay before a source retries its system readiness check.
pub const SOURCE_READY_RETRY: Duration = Duration::from_secs(10);

/// Back-off applied once when an RSS feed answers 503.
pub const RSS_UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(10);

/// Credit-mining state below the state directory.
pub const MINING_DIR: &str = "credit_mining";

/// Metainfo lookups of channel torrents give up after this long.
pub const CHANNEL_METAINFO_TIMEOUT: Duration = Duration::from_secs(60);

/// Weights of leechers, peers and availability in the scoring policy.
pub const SCORING_WEIGHTS: (f64, f64, f64) = (5.0, 3.0, 4.0);

/// Upper bound on a health check scheduled for a mined torrent.
pub const MINING_HEALTH_TIMEOUT: Duration = Duration::from_secs(20);
