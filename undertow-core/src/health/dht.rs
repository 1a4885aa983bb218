//! BEP-33 DHT scrape estimation.
//!
//! The engine's DHT sends `get_peers` queries with `scrape=1`; responders
//! answer with `BFsd` (seeders) and `BFpe` (peers) bloom filters. The
//! manager watches raw packets, pairs replies with queries by node and
//! transaction id, and ORs every responder's filters into the running
//! lookups for that infohash.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::HealthError;
use super::bloom::BloomFilter;
use super::session::{
    RetryPolicy, ScrapeResult, SessionInfo, SessionState, TrackerResponse, TrackerSession,
};
use crate::constants::{DHT_RETRY_INTERVAL, DHT_RETRY_MAX};
use crate::engine::{DownloadManagerHandle, PacketDirection};
use crate::torrent::{InfoHash, bencode};

/// Pseudo tracker URL of DHT sessions.
pub const DHT_TRACKER: &str = "DHT";

/// Queries without a reply are forgotten after this long.
const OUTSTANDING_QUERY_TTL: Duration = Duration::from_secs(60);

/// Triggers a BEP-33 scrape in the engine's DHT.
#[async_trait]
pub trait DhtScraper: Send + Sync {
    /// # Errors
    /// - `HealthError::TrackerFailed` - the engine could not send the query
    async fn dht_scrape(&self, infohash: InfoHash) -> Result<(), HealthError>;
}

#[async_trait]
impl DhtScraper for DownloadManagerHandle {
    async fn dht_scrape(&self, infohash: InfoHash) -> Result<(), HealthError> {
        DownloadManagerHandle::dht_scrape(self, infohash)
            .await
            .map_err(|e| HealthError::failed(DHT_TRACKER, e.to_string()))
    }
}

struct Lookup {
    infohash: InfoHash,
    seeds: BloomFilter,
    peers: BloomFilter,
    responses: usize,
}

#[derive(Default)]
struct DhtState {
    next_lookup: u64,
    lookups: HashMap<u64, Lookup>,
    outstanding: HashMap<(SocketAddr, Vec<u8>), (InfoHash, Instant)>,
}

/// Correlates DHT scrape queries and replies into swarm estimates.
#[derive(Default)]
pub struct DhtHealthManager {
    state: Mutex<DhtState>,
}

impl DhtHealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting replies for `infohash`; returns the lookup id.
    pub fn register_lookup(&self, infohash: InfoHash) -> u64 {
        let mut state = self.state.lock();
        state.next_lookup += 1;
        let id = state.next_lookup;
        state.lookups.insert(
            id,
            Lookup {
                infohash,
                seeds: BloomFilter::new(),
                peers: BloomFilter::new(),
                responses: 0,
            },
        );
        id
    }

    /// Ends a lookup and returns estimated `(seeders, peers)`.
    pub fn finish_lookup(&self, id: u64) -> (u64, u64) {
        match self.state.lock().lookups.remove(&id) {
            Some(lookup) => {
                tracing::debug!(
                    "DHT lookup for {} got {} responses",
                    lookup.infohash,
                    lookup.responses
                );
                (lookup.seeds.estimate(), lookup.peers.estimate())
            }
            None => (0, 0),
        }
    }

    /// Feeds one raw KRPC packet seen by the engine's DHT.
    pub fn observe_packet(&self, direction: PacketDirection, node: SocketAddr, packet: &[u8]) {
        let Ok(message) = bencode::decode(packet) else {
            tracing::trace!("Ignoring undecodable DHT packet from {}", node);
            return;
        };
        let Some(transaction) = bencode::get_bytes(&message, "t") else {
            return;
        };
        let kind = bencode::get_bytes(&message, "y");

        match (direction, kind) {
            (PacketDirection::Outgoing, Some(b"q")) => {
                if bencode::get_bytes(&message, "q") != Some(b"get_peers".as_slice()) {
                    return;
                }
                let Some(args) = bencode::get(&message, "a") else {
                    return;
                };
                if bencode::get_int(args, "scrape") != Some(1) {
                    return;
                }
                let Some(infohash) = bencode::get_bytes(args, "info_hash").and_then(InfoHash::from_slice)
                else {
                    return;
                };
                let now = Instant::now();
                let mut state = self.state.lock();
                state
                    .outstanding
                    .retain(|_, (_, sent)| now.duration_since(*sent) < OUTSTANDING_QUERY_TTL);
                state
                    .outstanding
                    .insert((node, transaction.to_vec()), (infohash, now));
            }
            (PacketDirection::Incoming, Some(b"r")) => {
                let mut state = self.state.lock();
                let Some((infohash, _)) = state.outstanding.remove(&(node, transaction.to_vec())) else {
                    return;
                };
                let Some(reply) = bencode::get(&message, "r") else {
                    return;
                };
                let seeds = bencode::get_bytes(reply, "BFsd").and_then(BloomFilter::from_bytes);
                let peers = bencode::get_bytes(reply, "BFpe").and_then(BloomFilter::from_bytes);
                for lookup in state.lookups.values_mut().filter(|l| l.infohash == infohash) {
                    if let Some(seeds) = &seeds {
                        lookup.seeds.union(seeds);
                    }
                    if let Some(peers) = &peers {
                        lookup.peers.union(peers);
                    }
                    lookup.responses += 1;
                }
            }
            _ => {}
        }
    }

    /// Scrapes `infohash` through the DHT and waits `timeout` for replies.
    ///
    /// # Errors
    /// - `HealthError::TrackerFailed` - the scrape could not be sent
    pub async fn get_health(
        &self,
        infohash: InfoHash,
        timeout: Duration,
        scraper: &dyn DhtScraper,
    ) -> Result<ScrapeResult, HealthError> {
        let id = self.register_lookup(infohash);
        if let Err(e) = scraper.dht_scrape(infohash).await {
            self.finish_lookup(id);
            return Err(e);
        }
        tokio::time::sleep(timeout).await;
        let (seeders, leechers) = self.finish_lookup(id);
        Ok(ScrapeResult::new(infohash, seeders, leechers))
    }
}

/// KRPC `get_peers` query, optionally asking for BEP-33 filters.
pub fn encode_scrape_query(transaction: &[u8], infohash: &InfoHash, scrape: bool) -> Vec<u8> {
    let node_id: [u8; 20] = rand::random();
    let mut args = bencode::dict([
        ("id", bencode::bytes(node_id)),
        ("info_hash", bencode::bytes(*infohash.as_bytes())),
    ]);
    if scrape {
        bencode::insert(&mut args, "scrape", bencode::int(1));
        bencode::insert(&mut args, "noseed", bencode::int(0));
    }
    let query = bencode::dict([
        ("a", args),
        ("q", bencode::string("get_peers")),
        ("t", bencode::bytes(transaction)),
        ("y", bencode::string("q")),
    ]);
    bencode::encode(&query).unwrap_or_default()
}

/// KRPC reply carrying BEP-33 seed and peer filters.
pub fn encode_scrape_reply(transaction: &[u8], seeds: &BloomFilter, peers: &BloomFilter) -> Vec<u8> {
    let node_id: [u8; 20] = rand::random();
    let reply = bencode::dict([
        (
            "r",
            bencode::dict([
                ("BFpe", bencode::bytes(peers.as_bytes())),
                ("BFsd", bencode::bytes(seeds.as_bytes())),
                ("id", bencode::bytes(node_id)),
            ]),
        ),
        ("t", bencode::bytes(transaction)),
        ("y", bencode::string("r")),
    ]);
    bencode::encode(&reply).unwrap_or_default()
}

/// Single-infohash pseudo tracker session backed by the DHT.
pub struct DhtTrackerSession {
    info: SessionInfo,
    dht: Arc<DhtHealthManager>,
    scraper: Arc<dyn DhtScraper>,
}

impl DhtTrackerSession {
    pub fn new(timeout: Duration, dht: Arc<DhtHealthManager>, scraper: Arc<dyn DhtScraper>) -> Self {
        Self {
            info: SessionInfo::new(DHT_TRACKER, timeout, 1),
            dht,
            scraper,
        }
    }
}

#[async_trait]
impl TrackerSession for DhtTrackerSession {
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
            max_retries: DHT_RETRY_MAX,
            interval: DHT_RETRY_INTERVAL,
            exponential: false,
        }
    }

    fn can_add_request(&self) -> bool {
        self.info.can_add_request()
    }

    fn add_infohash(&mut self, infohash: InfoHash) -> Result<(), HealthError> {
        self.info.add_infohash(infohash)
    }

    async fn connect_to_tracker(&mut self) -> Result<TrackerResponse, HealthError> {
        self.info.state = SessionState::Initiated;
        let result = match self.info.infohashes.first().copied() {
            Some(infohash) => self
                .dht
                .get_health(infohash, self.info.timeout, self.scraper.as_ref())
                .await
                .map(|result| TrackerResponse {
                    url: DHT_TRACKER.to_string(),
                    results: vec![result],
                })
                .map_err(|_| HealthError::failed(DHT_TRACKER, "DHT scrape failed")),
            None => Err(HealthError::failed(DHT_TRACKER, "no infohash attached")),
        };
        self.info.finish(result)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    fn node(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 1, 1, last], 6881))
    }

    fn filter(range: std::ops::Range<u8>) -> BloomFilter {
        let mut filter = BloomFilter::new();
        for i in range {
            filter.insert_ip(IpAddr::from([172, 16, 0, i]));
        }
        filter
    }

    #[test]
    fn test_replies_from_several_nodes_are_combined() {
        let dht = DhtHealthManager::new();
        let ih = InfoHash::new([3; 20]);
        let lookup = dht.register_lookup(ih);

        for (n, seeds) in [(1, filter(0..10)), (2, filter(5..20))] {
            let txn = [n, 0];
            dht.observe_packet(PacketDirection::Outgoing, node(n), &encode_scrape_query(&txn, &ih, true));
            dht.observe_packet(
                PacketDirection::Incoming,
                node(n),
                &encode_scrape_reply(&txn, &seeds, &filter(100..104)),
            );
        }

        let (seeds, peers) = dht.finish_lookup(lookup);
        assert!((17..=23).contains(&seeds), "estimated {seeds}");
        assert!((3..=5).contains(&peers), "estimated {peers}");
    }

    #[test]
    fn test_unmatched_replies_are_ignored() {
        let dht = DhtHealthManager::new();
        let ih = InfoHash::new([4; 20]);
        let lookup = dht.register_lookup(ih);

        // Reply without a query.
        dht.observe_packet(
            PacketDirection::Incoming,
            node(1),
            &encode_scrape_reply(b"aa", &filter(0..10), &BloomFilter::new()),
        );
        // Plain get_peers is not a scrape.
        dht.observe_packet(PacketDirection::Outgoing, node(2), &encode_scrape_query(b"bb", &ih, false));
        dht.observe_packet(
            PacketDirection::Incoming,
            node(2),
            &encode_scrape_reply(b"bb", &filter(0..10), &BloomFilter::new()),
        );
        // Right transaction, wrong node.
        dht.observe_packet(PacketDirection::Outgoing, node(3), &encode_scrape_query(b"cc", &ih, true));
        dht.observe_packet(
            PacketDirection::Incoming,
            node(4),
            &encode_scrape_reply(b"cc", &filter(0..10), &BloomFilter::new()),
        );
        dht.observe_packet(PacketDirection::Incoming, node(3), b"garbage");

        assert_eq!(dht.finish_lookup(lookup), (0, 0));
        assert_eq!(dht.finish_lookup(lookup), (0, 0));
    }

    struct LoopbackScraper {
        dht: Arc<DhtHealthManager>,
        seeds: BloomFilter,
    }

    #[async_trait]
    impl DhtScraper for LoopbackScraper {
        async fn dht_scrape(&self, infohash: InfoHash) -> Result<(), HealthError> {
            self.dht
                .observe_packet(PacketDirection::Outgoing, node(9), &encode_scrape_query(b"zz", &infohash, true));
            self.dht.observe_packet(
                PacketDirection::Incoming,
                node(9),
                &encode_scrape_reply(b"zz", &self.seeds, &BloomFilter::new()),
            );
            Ok(())
        }
    }

    struct BrokenScraper;

    #[async_trait]
    impl DhtScraper for BrokenScraper {
        async fn dht_scrape(&self, _infohash: InfoHash) -> Result<(), HealthError> {
            Err(HealthError::failed(DHT_TRACKER, "engine gone"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dht_session_reports_estimate() {
        let dht = Arc::new(DhtHealthManager::new());
        let scraper = Arc::new(LoopbackScraper {
            dht: dht.clone(),
            seeds: filter(0..12),
        });
        let mut session = DhtTrackerSession::new(Duration::from_secs(5), dht, scraper);
        let ih = InfoHash::new([5; 20]);
        session.add_infohash(ih).unwrap();
        assert!(!session.can_add_request());

        let response = session.connect_to_tracker().await.unwrap();
        assert_eq!(response.url, DHT_TRACKER);
        assert_eq!(response.results.len(), 1);
        assert!((10..=14).contains(&response.results[0].seeders));
        assert_eq!(session.state(), SessionState::Finished);
    }

    #[tokio::test]
    async fn test_dht_session_failure_is_generic() {
        let dht = Arc::new(DhtHealthManager::new());
        let mut session = DhtTrackerSession::new(Duration::from_secs(5), dht, Arc::new(BrokenScraper));
        session.add_infohash(InfoHash::new([6; 20])).unwrap();

        let err = session.connect_to_tracker().await.unwrap_err();
        assert_eq!(err.message(), "DHT scrape failed");
        assert_eq!(session.state(), SessionState::Failed);
    }
}
