//! Tracker session abstraction shared by the HTTP, UDP and DHT transports.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use super::HealthError;
use super::http::HttpTrackerSession;
use super::udp::UdpTrackerSession;
use crate::constants::MAX_MULTI_SCRAPE;
use crate::torrent::InfoHash;

/// Lifecycle of one scrape session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initiated,
    Resolving,
    Connecting,
    Scraping,
    Finished,
    Failed,
}

impl SessionState {
    pub fn is_done(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Failed)
    }
}

/// Swarm counts for one infohash as reported by one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrapeResult {
    pub infohash: InfoHash,
    pub seeders: u64,
    pub leechers: u64,
}

impl ScrapeResult {
    pub fn new(infohash: InfoHash, seeders: u64, leechers: u64) -> Self {
        Self {
            infohash,
            seeders,
            leechers,
        }
    }
}

/// Results of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerResponse {
    pub url: String,
    pub results: Vec<ScrapeResult>,
}

/// How often a failing source is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    /// Doubles `interval` per retry when set.
    pub exponential: bool,
}

impl RetryPolicy {
    /// Delay before attempt number `retries`.
    pub fn delay(&self, retries: u32) -> Duration {
        if self.exponential {
            self.interval
                .saturating_mul(1u32.checked_shl(retries.min(16)).unwrap_or(u32::MAX))
        } else {
            self.interval
        }
    }
}

/// One scrape exchange with one tracker.
///
/// Infohashes are attached while the session is idle; once
/// `connect_to_tracker` runs the list is frozen.
#[async_trait]
pub trait TrackerSession: Send {
    fn tracker_url(&self) -> &str;

    fn infohashes(&self) -> &[InfoHash];

    fn state(&self) -> SessionState;

    fn retry_policy(&self) -> RetryPolicy;

    /// True while another infohash may be attached.
    fn can_add_request(&self) -> bool;

    /// # Errors
    /// - `HealthError::SessionFull` - session is initiated or at capacity
    fn add_infohash(&mut self, infohash: InfoHash) -> Result<(), HealthError>;

    /// Runs the exchange to completion.
    ///
    /// # Errors
    /// - `HealthError::TrackerFailed` - transport failure or tracker refusal
    /// - `HealthError::Timeout` - no answer within the session timeout
    /// - `HealthError::Protocol` - malformed or mismatched response
    async fn connect_to_tracker(&mut self) -> Result<TrackerResponse, HealthError>;
}

/// Bookkeeping common to every session kind.
#[derive(Debug, Clone)]
pub(crate) struct SessionInfo {
    pub url: String,
    pub infohashes: Vec<InfoHash>,
    pub state: SessionState,
    pub timeout: Duration,
    pub capacity: usize,
}

impl SessionInfo {
    pub fn new(url: &str, timeout: Duration, capacity: usize) -> Self {
        Self {
            url: url.to_string(),
            infohashes: Vec::new(),
            state: SessionState::Idle,
            timeout,
            capacity,
        }
    }

    pub fn can_add_request(&self) -> bool {
        self.state == SessionState::Idle && self.infohashes.len() < self.capacity
    }

    pub fn add_infohash(&mut self, infohash: InfoHash) -> Result<(), HealthError> {
        if !self.can_add_request() {
            return Err(HealthError::SessionFull {
                url: self.url.clone(),
            });
        }
        if !self.infohashes.contains(&infohash) {
            self.infohashes.push(infohash);
        }
        Ok(())
    }

    /// Records the outcome and passes it through.
    pub fn finish<T>(&mut self, result: Result<T, HealthError>) -> Result<T, HealthError> {
        self.state = if result.is_ok() {
            SessionState::Finished
        } else {
            SessionState::Failed
        };
        result
    }
}

/// Components of an HTTP or UDP tracker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Splits a tracker URL, supplying the scheme's default port.
///
/// # Errors
/// - `HealthError::UnsupportedTracker` - unparsable, no host, or no UDP port
pub fn parse_tracker_url(url: &str) -> Result<TrackerUrl, HealthError> {
    let unsupported = || HealthError::UnsupportedTracker {
        url: url.to_string(),
    };
    let parsed = url::Url::parse(url.trim()).map_err(|_| unsupported())?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed.host_str().ok_or_else(unsupported)?.to_string();
    let port = match (scheme.as_str(), parsed.port()) {
        (_, Some(port)) => port,
        ("http", None) => 80,
        ("https", None) => 443,
        _ => return Err(unsupported()),
    };
    if !matches!(scheme.as_str(), "http" | "https" | "udp") {
        return Err(unsupported());
    }
    Ok(TrackerUrl {
        scheme,
        host,
        port,
        path: parsed.path().to_string(),
    })
}

/// True for trackers that reject multi-scrapes.
pub fn is_hostile(url: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(url))
}

/// Builds the session matching the tracker URL's scheme.
///
/// Hostile trackers get sessions limited to a single infohash.
///
/// # Errors
/// - `HealthError::UnsupportedTracker` - unknown scheme or malformed URL
pub fn create_tracker_session(
    url: &str,
    timeout: Duration,
    hostile_patterns: &[Regex],
) -> Result<Box<dyn TrackerSession>, HealthError> {
    let parsed = parse_tracker_url(url)?;
    let capacity = if is_hostile(url, hostile_patterns) {
        1
    } else {
        MAX_MULTI_SCRAPE
    };
    match parsed.scheme.as_str() {
        "http" | "https" => Ok(Box::new(HttpTrackerSession::new(url, parsed, timeout, capacity)?)),
        "udp" => Ok(Box::new(UdpTrackerSession::new(url, parsed, timeout, capacity))),
        _ => Err(HealthError::UnsupportedTracker {
            url: url.to_string(),
        }),
    }
}
