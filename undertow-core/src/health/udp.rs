//! UDP multi-scrape session (BEP-15).

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::HealthError;
use super::session::{
    RetryPolicy, ScrapeResult, SessionInfo, SessionState, TrackerResponse, TrackerSession,
    TrackerUrl,
};
use crate::constants::{MAX_TRANSACTION_ID, UDP_PROTOCOL_ID, UDP_RETRY_BASE, UDP_RETRY_MAX};
use crate::torrent::InfoHash;

const ACTION_CONNECT: i32 = 0;
const ACTION_SCRAPE: i32 = 2;
const ACTION_ERROR: i32 = 3;

const RECV_BUFFER: usize = 2048;

static GLOBAL_REGISTRY: LazyLock<TransactionRegistry> = LazyLock::new(TransactionRegistry::new);

/// Set of transaction ids held by live UDP sessions.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    live: Mutex<HashSet<u32>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every session in the process.
    pub fn global() -> &'static TransactionRegistry {
        &GLOBAL_REGISTRY
    }

    /// Draws an id not held by any other live session.
    ///
    /// Returns `None` once every id is taken.
    pub fn allocate(&'static self) -> Option<TransactionId> {
        let mut live = self.live.lock();
        if live.len() > MAX_TRANSACTION_ID as usize {
            return None;
        }
        let mut rng = rand::rng();
        loop {
            let id = rng.random_range(0..=MAX_TRANSACTION_ID);
            if live.insert(id) {
                return Some(TransactionId { id, registry: self });
            }
        }
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.live.lock().contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn release(&self, id: u32) {
        self.live.lock().remove(&id);
    }
}

/// Transaction id returned to the registry on drop.
#[derive(Debug)]
pub struct TransactionId {
    id: u32,
    registry: &'static TransactionRegistry,
}

impl TransactionId {
    pub fn value(&self) -> u32 {
        self.id
    }
}

impl Drop for TransactionId {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// Scrapes a UDP tracker: resolve, CONNECT, then one SCRAPE.
pub struct UdpTrackerSession {
    info: SessionInfo,
    tracker: TrackerUrl,
    registry: &'static TransactionRegistry,
    connection_id: Option<i64>,
    action: i32,
    transaction: Option<TransactionId>,
    /// Unix timestamp of the last reply.
    last_contact: Option<i64>,
}

impl UdpTrackerSession {
    pub fn new(url: &str, tracker: TrackerUrl, timeout: Duration, capacity: usize) -> Self {
        Self {
            info: SessionInfo::new(url, timeout, capacity),
            tracker,
            registry: TransactionRegistry::global(),
            connection_id: None,
            action: ACTION_CONNECT,
            transaction: None,
            last_contact: None,
        }
    }

    pub fn with_registry(mut self, registry: &'static TransactionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn connection_id(&self) -> Option<i64> {
        self.connection_id
    }

    pub fn last_contact(&self) -> Option<i64> {
        self.last_contact
    }

    pub fn action(&self) -> i32 {
        self.action
    }

    fn next_transaction(&mut self) -> Result<u32, HealthError> {
        // Release the previous id before drawing a new one.
        self.transaction = None;
        let transaction = self
            .registry
            .allocate()
            .ok_or_else(|| HealthError::failed(&self.info.url, "no free transaction id"))?;
        let id = transaction.value();
        self.transaction = Some(transaction);
        Ok(id)
    }

    async fn run(&mut self) -> Result<Vec<ScrapeResult>, HealthError> {
        let url = self.info.url.clone();
        let deadline = Instant::now() + self.info.timeout;

        self.info.state = SessionState::Resolving;
        let target = (self.tracker.host.as_str(), self.tracker.port);
        let addr = tokio::time::timeout_at(deadline, tokio::net::lookup_host(target))
            .await
            .map_err(|_| HealthError::Timeout { url: url.clone() })?
            .map_err(|e| HealthError::failed(&url, format!("DNS lookup failed: {e}")))?
            .next()
            .ok_or_else(|| HealthError::failed(&url, "DNS lookup returned no addresses"))?;

        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| HealthError::failed(&url, e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| HealthError::failed(&url, e.to_string()))?;

        self.info.state = SessionState::Connecting;
        self.action = ACTION_CONNECT;
        let transaction = self.next_transaction()?;
        let reply = exchange(&url, &socket, &encode_connect(transaction), deadline).await?;
        let connection_id = parse_connect_reply(&url, &reply, transaction)?;
        self.connection_id = Some(connection_id);
        self.last_contact = Some(chrono::Utc::now().timestamp());

        self.info.state = SessionState::Scraping;
        self.action = ACTION_SCRAPE;
        let transaction = self.next_transaction()?;
        let request = encode_scrape(connection_id, transaction, &self.info.infohashes);
        let reply = exchange(&url, &socket, &request, deadline).await?;
        self.last_contact = Some(chrono::Utc::now().timestamp());
        parse_scrape_reply(&url, &reply, transaction, &self.info.infohashes)
    }
}

#[async_trait]
impl TrackerSession for UdpTrackerSession {
    fn tracker_url(&self) -> &str {
        &self.info.url
    }

    fn infohashes(&self) -> &[InfoHash] {
        &self.info.infohashes
    }

    fn state(&self) -> SessionState {
        self.info.state
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: UDP_RETRY_MAX,
            interval: UDP_RETRY_BASE,
            exponential: true,
        }
    }

    fn can_add_request(&self) -> bool {
        self.info.can_add_request()
    }

    fn add_infohash(&mut self, infohash: InfoHash) -> Result<(), HealthError> {
        self.info.add_infohash(infohash)
    }

    async fn connect_to_tracker(&mut self) -> Result<TrackerResponse, HealthError> {
        let result = self.run().await.map(|results| TrackerResponse {
            url: self.info.url.clone(),
            results,
        });
        self.transaction = None;
        if let Err(e) = &result {
            tracing::debug!("UDP scrape of {} failed: {}", self.info.url, e);
        }
        self.info.finish(result)
    }
}

/// Sends `packet` and waits for one reply, retransmitting with a doubling
/// wait until `deadline`.
async fn exchange(
    url: &str,
    socket: &UdpSocket,
    packet: &[u8],
    deadline: Instant,
) -> Result<Vec<u8>, HealthError> {
    let mut buf = vec![0u8; RECV_BUFFER];
    for attempt in 0..=UDP_RETRY_MAX {
        socket
            .send(packet)
            .await
            .map_err(|e| HealthError::failed(url, e.to_string()))?;
        let wait = UDP_RETRY_BASE.saturating_mul(1 << attempt);
        let until = (Instant::now() + wait).min(deadline);
        match tokio::time::timeout_at(until, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
            Ok(Err(e)) => return Err(HealthError::failed(url, e.to_string())),
            Err(_) if until >= deadline => break,
            Err(_) => tracing::debug!("Retransmitting to {} (attempt {})", url, attempt + 1),
        }
    }
    Err(HealthError::Timeout {
        url: url.to_string(),
    })
}

/// CONNECT request: protocol magic, action 0, transaction id.
pub fn encode_connect(transaction: u32) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[..8].copy_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    packet[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet[12..].copy_from_slice(&transaction.to_be_bytes());
    packet
}

/// SCRAPE request: connection id, action 2, transaction id, infohashes.
pub fn encode_scrape(connection_id: i64, transaction: u32, infohashes: &[InfoHash]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16 + 20 * infohashes.len());
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
    packet.extend_from_slice(&transaction.to_be_bytes());
    for infohash in infohashes {
        packet.extend_from_slice(infohash.as_bytes());
    }
    packet
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    i32::from_be_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

/// Checks action and transaction of a reply header.
fn check_header(url: &str, buf: &[u8], expected_action: i32, transaction: u32) -> Result<(), HealthError> {
    let action = read_i32(buf, 0);
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&buf[8..]).into_owned();
        return Err(HealthError::failed(url, message));
    }
    if action != expected_action {
        return Err(HealthError::protocol(
            url,
            format!("expected action {expected_action}, got {action}"),
        ));
    }
    if read_u32(buf, 4) != transaction {
        return Err(HealthError::protocol(url, "transaction id mismatch"));
    }
    Ok(())
}

/// Extracts the connection id from a CONNECT reply.
///
/// # Errors
/// - `HealthError::Protocol` - short packet, wrong action or transaction
/// - `HealthError::TrackerFailed` - tracker answered with an error
pub fn parse_connect_reply(url: &str, buf: &[u8], transaction: u32) -> Result<i64, HealthError> {
    if buf.len() < 16 {
        return Err(HealthError::protocol(url, "connect reply too short"));
    }
    check_header(url, buf, ACTION_CONNECT, transaction)?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[8..16]);
    Ok(i64::from_be_bytes(id))
}

/// Parses a SCRAPE reply; the length must be exactly `8 + 12 * n`.
///
/// # Errors
/// - `HealthError::Protocol` - wrong action, transaction or length
/// - `HealthError::TrackerFailed` - tracker answered with an error
pub fn parse_scrape_reply(
    url: &str,
    buf: &[u8],
    transaction: u32,
    infohashes: &[InfoHash],
) -> Result<Vec<ScrapeResult>, HealthError> {
    if buf.len() < 8 {
        return Err(HealthError::protocol(url, "scrape reply too short"));
    }
    check_header(url, buf, ACTION_SCRAPE, transaction)?;
    let expected = 8 + 12 * infohashes.len();
    if buf.len() != expected {
        return Err(HealthError::protocol(
            url,
            format!("scrape reply is {} bytes, expected {}", buf.len(), expected),
        ));
    }
    let results = buf[8..]
        .chunks_exact(12)
        .zip(infohashes)
        .map(|(chunk, infohash)| {
            let complete = read_u32(chunk, 0);
            let incomplete = read_u32(chunk, 8);
            ScrapeResult::new(*infohash, u64::from(complete), u64::from(incomplete))
        })
        .collect();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::session::parse_tracker_url;

    fn private_registry() -> &'static TransactionRegistry {
        Box::leak(Box::new(TransactionRegistry::new()))
    }

    fn header(action: i32, transaction: &[u8]) -> Vec<u8> {
        let mut reply = action.to_be_bytes().to_vec();
        reply.extend_from_slice(transaction);
        reply
    }

    /// Tracker answering CONNECT with id 7 and SCRAPE with `stats`.
    async fn spawn_tracker(stats: Vec<(u32, u32, u32)>, trailing: usize) -> (String, tokio::task::JoinHandle<i64>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", socket.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(&buf[..8], &UDP_PROTOCOL_ID.to_be_bytes());
            let mut reply = header(0, &buf[12..16]);
            reply.extend_from_slice(&7i64.to_be_bytes());
            socket.send_to(&reply, peer).await.unwrap();

            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let mut id = [0u8; 8];
            id.copy_from_slice(&buf[..8]);
            assert_eq!(read_i32(&buf, 8), ACTION_SCRAPE);
            assert_eq!((len - 16) / 20, stats.len());
            let mut reply = header(2, &buf[12..16]);
            for (complete, downloaded, incomplete) in &stats {
                reply.extend_from_slice(&complete.to_be_bytes());
                reply.extend_from_slice(&downloaded.to_be_bytes());
                reply.extend_from_slice(&incomplete.to_be_bytes());
            }
            reply.extend(std::iter::repeat_n(0u8, trailing));
            socket.send_to(&reply, peer).await.unwrap();
            i64::from_be_bytes(id)
        });
        (url, task)
    }

    fn session(url: &str, registry: &'static TransactionRegistry) -> UdpTrackerSession {
        let mut session = UdpTrackerSession::new(url, parse_tracker_url(url).unwrap(), Duration::from_secs(5), 74)
            .with_registry(registry);
        session.add_infohash(InfoHash::new([1; 20])).unwrap();
        session.add_infohash(InfoHash::new([2; 20])).unwrap();
        session
    }

    #[test]
    fn test_connect_packet_layout() {
        let packet = encode_connect(42);
        assert_eq!(&packet[..8], &[0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..], &42u32.to_be_bytes());
    }

    #[test]
    fn test_reply_validation() {
        let mut connect = header(0, &42u32.to_be_bytes());
        connect.extend_from_slice(&7i64.to_be_bytes());
        assert_eq!(parse_connect_reply("u", &connect, 42).unwrap(), 7);
        assert!(matches!(
            parse_connect_reply("u", &connect, 41),
            Err(HealthError::Protocol { .. })
        ));

        let mut error = header(3, &42u32.to_be_bytes());
        error.extend_from_slice(b"not allowed");
        let err = parse_scrape_reply("u", &error, 42, &[]).unwrap_err();
        assert_eq!(err.message(), "not allowed");
    }

    #[test]
    fn test_scrape_reply_length_must_match() {
        let ihs = [InfoHash::new([1; 20]), InfoHash::new([2; 20])];
        let mut reply = header(2, &43u32.to_be_bytes());
        reply.extend_from_slice(&[0u8; 12]);
        assert!(matches!(
            parse_scrape_reply("u", &reply, 43, &ihs),
            Err(HealthError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_scrape_against_local_tracker() {
        let registry = private_registry();
        let (url, tracker) = spawn_tracker(vec![(5, 0, 2), (0, 0, 0)], 0).await;
        let mut session = session(&url, registry);

        let response = session.connect_to_tracker().await.unwrap();
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(
            response.results,
            vec![
                ScrapeResult::new(InfoHash::new([1; 20]), 5, 2),
                ScrapeResult::new(InfoHash::new([2; 20]), 0, 0),
            ]
        );
        assert_eq!(tracker.await.unwrap(), 7);
        assert_eq!(session.connection_id(), Some(7));
        assert!(session.last_contact().is_some());
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_length_fails_without_partial_results() {
        let registry = private_registry();
        let (url, _tracker) = spawn_tracker(vec![(5, 0, 2), (0, 0, 0)], 1).await;
        let mut session = session(&url, registry);

        let err = session.connect_to_tracker().await.unwrap_err();
        assert!(matches!(err, HealthError::Protocol { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_tracker_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", silent.local_addr().unwrap());
        let mut session = UdpTrackerSession::new(
            &url,
            parse_tracker_url(&url).unwrap(),
            Duration::from_millis(200),
            74,
        )
        .with_registry(private_registry());
        session.add_infohash(InfoHash::new([1; 20])).unwrap();

        let err = session.connect_to_tracker().await.unwrap_err();
        assert!(matches!(err, HealthError::Timeout { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_registry_ids_unique_until_dropped() {
        let registry = private_registry();
        let ids: Vec<TransactionId> = (0..500).filter_map(|_| registry.allocate()).collect();
        let unique: HashSet<u32> = ids.iter().map(TransactionId::value).collect();
        assert_eq!(unique.len(), 500);
        assert!(ids.iter().all(|id| id.value() <= MAX_TRANSACTION_ID));
        let first = ids[0].value();
        assert!(registry.is_live(first));
        drop(ids);
        assert_eq!(registry.live_count(), 0);
        assert!(!registry.is_live(first));
    }
}
