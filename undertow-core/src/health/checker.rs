//! Tracker health checker actor.
//!
//! One task owns the [`TrackerCatalog`]. Every selection tick it picks the
//! least recently checked tracker that is due, multi-scrapes its stale
//! torrents in a background session and folds the result back in. Callers
//! can also request an immediate check of one torrent across all of its
//! trackers and the DHT.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::HealthError;
use super::catalog::{TorrentHealth, TrackerCatalog, reconcile};
use super::dht::{DHT_TRACKER, DhtHealthManager, DhtScraper, DhtTrackerSession};
use super::session::{TrackerResponse, TrackerSession, create_tracker_session};
use crate::config::HealthConfig;
use crate::constants::{
    MAX_MULTI_SCRAPE, TRACKER_SELECTION_BUDGET_SECS, TRACKER_SELECTION_MAX_SECS,
    TRACKER_SELECTION_MIN_SECS,
};
use crate::notifications::{Notification, Notifier};
use crate::torrent::InfoHash;

/// Commands accepted by the health checker actor.
#[derive(Debug)]
pub enum HealthCommand {
    AddTorrent {
        infohash: InfoHash,
        trackers: Vec<String>,
    },
    RemoveTorrent {
        infohash: InfoHash,
    },
    CheckTorrentHealth {
        infohash: InfoHash,
        timeout: Duration,
        responder: oneshot::Sender<Result<TorrentHealth, HealthError>>,
    },
    GetHealth {
        infohash: InfoHash,
        responder: oneshot::Sender<Option<TorrentHealth>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Completions reported back by background sessions.
enum SessionEvent {
    TrackerDone {
        url: String,
        result: Result<TrackerResponse, HealthError>,
    },
    RequestDone {
        infohash: InfoHash,
        outcomes: Vec<(String, Result<TrackerResponse, HealthError>)>,
        responder: oneshot::Sender<Result<TorrentHealth, HealthError>>,
    },
}

#[derive(Clone)]
struct DhtBackend {
    manager: Arc<DhtHealthManager>,
    scraper: Arc<dyn DhtScraper>,
}

/// Seconds between tracker selections for a catalog of `num_torrents`.
pub fn selection_interval(num_torrents: usize) -> Duration {
    let secs = match u64::try_from(num_torrents) {
        Ok(0) | Err(_) => TRACKER_SELECTION_MAX_SECS,
        Ok(n) => TRACKER_SELECTION_BUDGET_SECS / n,
    };
    Duration::from_secs(secs.clamp(TRACKER_SELECTION_MIN_SECS, TRACKER_SELECTION_MAX_SECS))
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// State owned by the checker task.
pub struct HealthChecker {
    config: HealthConfig,
    hostile: Arc<Vec<Regex>>,
    catalog: TrackerCatalog,
    notifier: Notifier,
    dht: Option<DhtBackend>,
    in_flight: HashSet<String>,
    events: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub fn new(config: HealthConfig, notifier: Notifier) -> Self {
        let hostile = config
            .hostile_tracker_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Ignoring invalid hostile tracker pattern {}: {}", pattern, e);
                    None
                }
            })
            .collect();
        let (events, events_rx) = mpsc::channel(100);
        Self {
            catalog: TrackerCatalog::new(config.max_retries, config.retry_interval),
            config,
            hostile: Arc::new(hostile),
            notifier,
            dht: None,
            in_flight: HashSet::new(),
            events,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Adds DHT estimates to on-demand checks.
    pub fn with_dht(mut self, manager: Arc<DhtHealthManager>, scraper: Arc<dyn DhtScraper>) -> Self {
        self.dht = Some(DhtBackend { manager, scraper });
        self
    }

    pub fn catalog(&self) -> &TrackerCatalog {
        &self.catalog
    }

    /// Starts one periodic multi-scrape if a tracker is due and a slot is free.
    fn tick(&mut self) {
        if !self.config.enabled {
            return;
        }
        if self.in_flight.len() >= self.config.max_concurrent_sessions {
            tracing::debug!("All {} tracker sessions busy, skipping tick", self.in_flight.len());
            return;
        }

        let now = unix_now();
        let Some(url) = self
            .catalog
            .due_trackers(now)
            .into_iter()
            .find(|url| !self.in_flight.contains(url))
        else {
            return;
        };
        let infohashes = self.catalog.stale_infohashes(&url, now, MAX_MULTI_SCRAPE);

        let mut session = match create_tracker_session(&url, self.config.timeout(), &self.hostile) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("Cannot check {}: {}", url, e);
                self.catalog.update_tracker_info(&url, false, now);
                return;
            }
        };
        for infohash in infohashes {
            if !session.can_add_request() {
                break;
            }
            if let Err(e) = session.add_infohash(infohash) {
                tracing::debug!("Session for {} refused {}: {}", url, infohash, e);
                break;
            }
        }

        tracing::debug!("Checking {} torrents on {}", session.infohashes().len(), url);
        self.in_flight.insert(url.clone());
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.timeout();
        let hostile = self.hostile.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = scrape_with_retries(session, timeout, hostile) => {
                    let _ = events.send(SessionEvent::TrackerDone { url, result }).await;
                }
            }
        });
    }

    /// Scrapes every tracker of `infohash` plus the DHT in parallel.
    fn check_torrent_health(
        &mut self,
        infohash: InfoHash,
        timeout: Duration,
        responder: oneshot::Sender<Result<TorrentHealth, HealthError>>,
    ) {
        if !self.catalog.contains(&infohash) {
            self.catalog.add_torrent(infohash, Vec::<String>::new());
        }

        let mut sessions: Vec<Box<dyn TrackerSession>> = Vec::new();
        for url in self.catalog.trackers_for(&infohash) {
            match create_tracker_session(&url, timeout, &self.hostile) {
                Ok(mut session) => {
                    if session.add_infohash(infohash).is_ok() {
                        sessions.push(session);
                    }
                }
                Err(e) => tracing::debug!("Skipping tracker {}: {}", url, e),
            }
        }
        if let Some(dht) = &self.dht {
            let mut session =
                DhtTrackerSession::new(timeout, dht.manager.clone(), dht.scraper.clone());
            if session.add_infohash(infohash).is_ok() {
                sessions.push(Box::new(session));
            }
        }

        if sessions.is_empty() {
            let _ = responder.send(Err(HealthError::TrackerFailed {
                url: infohash.to_string(),
                message: "no trackers available".to_string(),
            }));
            return;
        }

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcomes = join_all(sessions.into_iter().map(|mut session| async move {
                let result = session.connect_to_tracker().await;
                (session.tracker_url().to_string(), result)
            }));
            tokio::select! {
                _ = cancel.cancelled() => {}
                outcomes = outcomes => {
                    let _ = events
                        .send(SessionEvent::RequestDone { infohash, outcomes, responder })
                        .await;
                }
            }
        });
    }

    fn handle_event(&mut self, event: SessionEvent) {
        let now = unix_now();
        match event {
            SessionEvent::TrackerDone { url, result } => {
                self.in_flight.remove(&url);
                self.catalog.update_tracker_info(&url, result.is_ok(), now);
                match result {
                    Ok(response) => {
                        for (infohash, (seeders, leechers)) in reconcile(&response.results) {
                            self.record(&infohash, seeders, leechers, now);
                        }
                    }
                    Err(e) => tracing::debug!("Tracker {} failed: {}", url, e),
                }
            }
            SessionEvent::RequestDone {
                infohash,
                outcomes,
                responder,
            } => {
                let mut responses = Vec::new();
                let mut last_error = None;
                for (url, result) in outcomes {
                    if url != DHT_TRACKER {
                        self.catalog.update_tracker_info(&url, result.is_ok(), now);
                    }
                    match result {
                        Ok(response) => responses.push(response),
                        Err(e) => last_error = Some(e),
                    }
                }

                let result = if responses.is_empty() {
                    Err(last_error.unwrap_or(HealthError::TrackerFailed {
                        url: infohash.to_string(),
                        message: "no responses".to_string(),
                    }))
                } else {
                    let merged = reconcile(responses.iter().flat_map(|r| r.results.iter()));
                    let (seeders, leechers) = merged.get(&infohash).copied().unwrap_or((0, 0));
                    self.record(&infohash, seeders, leechers, now)
                        .ok_or(HealthError::TrackerFailed {
                            url: infohash.to_string(),
                            message: "torrent removed during check".to_string(),
                        })
                };
                let _ = responder.send(result);
            }
        }
    }

    fn record(&mut self, infohash: &InfoHash, seeders: u64, leechers: u64, now: i64) -> Option<TorrentHealth> {
        let health = self
            .catalog
            .update_torrent_result(infohash, seeders, leechers, now)?;
        tracing::debug!(
            "Health of {}: {} seeders, {} leechers ({:?})",
            infohash,
            seeders,
            leechers,
            health.status
        );
        self.notifier.notify(Notification::TorrentHealthUpdated {
            infohash: *infohash,
            seeders,
            leechers,
            last_check: now,
        });
        Some(health)
    }

    /// Returns false once the actor should stop.
    fn handle_command(&mut self, command: HealthCommand) -> bool {
        match command {
            HealthCommand::AddTorrent { infohash, trackers } => {
                self.catalog.add_torrent(infohash, trackers);
            }
            HealthCommand::RemoveTorrent { infohash } => {
                self.catalog.remove_torrent(&infohash);
            }
            HealthCommand::CheckTorrentHealth {
                infohash,
                timeout,
                responder,
            } => {
                self.check_torrent_health(infohash, timeout, responder);
            }
            HealthCommand::GetHealth {
                infohash,
                responder,
            } => {
                let _ = responder.send(self.catalog.health(&infohash).cloned());
            }
            HealthCommand::Shutdown { responder } => {
                self.cancel.cancel();
                let _ = responder.send(());
                return false;
            }
        }
        true
    }
}

/// Runs `session`, recreating it per its retry policy until it succeeds.
async fn scrape_with_retries(
    mut session: Box<dyn TrackerSession>,
    timeout: Duration,
    hostile: Arc<Vec<Regex>>,
) -> Result<TrackerResponse, HealthError> {
    let url = session.tracker_url().to_string();
    let infohashes = session.infohashes().to_vec();
    let policy = session.retry_policy();
    let mut retries = 0;
    loop {
        match session.connect_to_tracker().await {
            Ok(response) => return Ok(response),
            Err(e) if retries >= policy.max_retries => return Err(e),
            Err(e) => {
                let delay = policy.delay(retries);
                tracing::debug!("Retrying {} in {:?} after: {}", url, delay, e);
                retries += 1;
                tokio::time::sleep(delay).await;
            }
        }
        session = create_tracker_session(&url, timeout, &hostile)?;
        for infohash in &infohashes {
            session.add_infohash(*infohash)?;
        }
    }
}

async fn run_actor_loop(mut checker: HealthChecker, mut receiver: mpsc::Receiver<HealthCommand>) {
    let Some(mut events) = checker.events_rx.take() else {
        return;
    };
    let mut next_tick = Instant::now() + selection_interval(checker.catalog.num_collected_torrents());

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    checker.cancel.cancel();
                    break;
                };
                if !checker.handle_command(command) {
                    break;
                }
            }
            Some(event) = events.recv() => checker.handle_event(event),
            _ = tokio::time::sleep_until(next_tick) => {
                checker.tick();
                next_tick = Instant::now()
                    + selection_interval(checker.catalog.num_collected_torrents());
            }
        }
    }
    tracing::debug!("Health checker stopped");
}

/// Handle for communicating with the health checker actor.
#[derive(Clone)]
pub struct HealthCheckerHandle {
    sender: mpsc::Sender<HealthCommand>,
}

impl HealthCheckerHandle {
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// # Errors
    /// - `HealthError::CheckerShutdown` - actor has stopped
    pub async fn add_torrent(&self, infohash: InfoHash, trackers: Vec<String>) -> Result<(), HealthError> {
        self.sender
            .send(HealthCommand::AddTorrent { infohash, trackers })
            .await
            .map_err(|_| HealthError::CheckerShutdown)
    }

    /// # Errors
    /// - `HealthError::CheckerShutdown` - actor has stopped
    pub async fn remove_torrent(&self, infohash: InfoHash) -> Result<(), HealthError> {
        self.sender
            .send(HealthCommand::RemoveTorrent { infohash })
            .await
            .map_err(|_| HealthError::CheckerShutdown)
    }

    /// Scrapes every tracker of `infohash` and the DHT right away.
    ///
    /// # Errors
    /// - `HealthError::CheckerShutdown` - actor has stopped
    /// - `HealthError::TrackerFailed` - no source answered
    pub async fn check_torrent_health(
        &self,
        infohash: InfoHash,
        timeout: Duration,
    ) -> Result<TorrentHealth, HealthError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::CheckTorrentHealth {
                infohash,
                timeout,
                responder,
            })
            .await
            .map_err(|_| HealthError::CheckerShutdown)?;
        rx.await.map_err(|_| HealthError::CheckerShutdown)?
    }

    /// # Errors
    /// - `HealthError::CheckerShutdown` - actor has stopped
    pub async fn get_health(&self, infohash: InfoHash) -> Result<Option<TorrentHealth>, HealthError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::GetHealth { infohash, responder })
            .await
            .map_err(|_| HealthError::CheckerShutdown)?;
        rx.await.map_err(|_| HealthError::CheckerShutdown)
    }

    /// # Errors
    /// - `HealthError::CheckerShutdown` - actor already stopped
    pub async fn shutdown(&self) -> Result<(), HealthError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::Shutdown { responder })
            .await
            .map_err(|_| HealthError::CheckerShutdown)?;
        rx.await.map_err(|_| HealthError::CheckerShutdown)
    }
}

/// Spawns the checker actor and returns its handle.
pub fn spawn_health_checker(checker: HealthChecker) -> HealthCheckerHandle {
    let (sender, receiver) = mpsc::channel(100);
    tokio::spawn(run_actor_loop(checker, receiver));
    HealthCheckerHandle { sender }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::Router;
    use axum::routing::get;

    use super::*;
    use crate::engine::PacketDirection;
    use crate::health::bloom::BloomFilter;
    use crate::health::catalog::HealthStatus;
    use crate::health::dht::{encode_scrape_query, encode_scrape_reply};

    const IH: [u8; 20] = [0x42; 20];

    fn body(seeders: u64, leechers: u64) -> Vec<u8> {
        let mut body = b"d5:filesd20:".to_vec();
        body.extend_from_slice(&IH);
        body.extend_from_slice(format!("d8:completei{seeders}e10:incompletei{leechers}eeee").as_bytes());
        body
    }

    async fn tracker(seeders: u64, leechers: u64) -> String {
        let router = Router::new().route("/scrape", get(move || async move { body(seeders, leechers) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/announce")
    }

    #[test]
    fn test_selection_interval_bounds() {
        assert_eq!(selection_interval(0), Duration::from_secs(100));
        assert_eq!(selection_interval(10), Duration::from_secs(100));
        assert_eq!(selection_interval(144), Duration::from_secs(50));
        assert_eq!(selection_interval(100_000), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_on_demand_check_reconciles_trackers() {
        let notifier = Notifier::new();
        let mut updates = notifier.subscribe();
        let handle = spawn_health_checker(HealthChecker::new(HealthConfig::default(), notifier));

        let trackers = vec![tracker(7, 3).await, tracker(7, 1).await, tracker(2, 9).await];
        handle.add_torrent(InfoHash::new(IH), trackers).await.unwrap();

        let health = handle
            .check_torrent_health(InfoHash::new(IH), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!((health.seeders, health.leechers), (7, 1));
        assert_eq!(health.status, HealthStatus::Good);

        match updates.recv().await.unwrap() {
            Notification::TorrentHealthUpdated { seeders, leechers, .. } => {
                assert_eq!((seeders, leechers), (7, 1));
            }
            other => panic!("unexpected notification {other:?}"),
        }
        assert_eq!(handle.get_health(InfoHash::new(IH)).await.unwrap(), Some(health));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_on_demand_check_without_sources_fails() {
        let handle = spawn_health_checker(HealthChecker::new(HealthConfig::default(), Notifier::new()));
        let result = handle
            .check_torrent_health(InfoHash::new([1; 20]), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(HealthError::TrackerFailed { .. })));
        handle.shutdown().await.unwrap();
        assert!(handle.get_health(InfoHash::new([1; 20])).await.is_err());
    }

    struct LoopbackScraper {
        dht: Arc<DhtHealthManager>,
    }

    #[async_trait]
    impl DhtScraper for LoopbackScraper {
        async fn dht_scrape(&self, infohash: InfoHash) -> Result<(), HealthError> {
            let mut seeds = BloomFilter::new();
            for i in 0..20u8 {
                seeds.insert_ip([192, 168, 7, i].into());
            }
            let node = "10.0.0.1:6881".parse().unwrap();
            self.dht.observe_packet(
                PacketDirection::Outgoing,
                node,
                &encode_scrape_query(b"t1", &infohash, true),
            );
            self.dht.observe_packet(
                PacketDirection::Incoming,
                node,
                &encode_scrape_reply(b"t1", &seeds, &BloomFilter::new()),
            );
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_check_uses_dht() {
        let dht = Arc::new(DhtHealthManager::new());
        let scraper = Arc::new(LoopbackScraper { dht: dht.clone() });
        let checker = HealthChecker::new(HealthConfig::default(), Notifier::new()).with_dht(dht, scraper);
        let handle = spawn_health_checker(checker);

        let health = handle
            .check_torrent_health(InfoHash::new(IH), Duration::from_secs(3))
            .await
            .unwrap();
        assert!((15..=25).contains(&health.seeders), "estimated {}", health.seeders);
        assert_eq!(health.leechers, 0);
    }

    #[tokio::test]
    async fn test_tick_scrapes_due_tracker() {
        let url = tracker(4, 2).await;
        let mut checker = HealthChecker::new(HealthConfig::default(), Notifier::new());
        let mut events = checker.events_rx.take().unwrap();
        checker.catalog.add_torrent(InfoHash::new(IH), [url.clone()]);

        checker.tick();
        assert!(checker.in_flight.contains(&url));
        // Same tracker is not picked twice while its session runs.
        checker.tick();
        assert_eq!(checker.in_flight.len(), 1);

        let event = events.recv().await.unwrap();
        checker.handle_event(event);
        assert!(checker.in_flight.is_empty());

        let health = checker.catalog().health(&InfoHash::new(IH)).unwrap();
        assert_eq!((health.seeders, health.leechers), (4, 2));
        assert_eq!(checker.catalog().tracker_info(&url).unwrap().failures, 0);
        assert!(checker.catalog().due_trackers(unix_now()).is_empty());
    }

    #[tokio::test]
    async fn test_tick_skips_when_sessions_full() {
        let url = tracker(1, 1).await;
        let config = HealthConfig {
            max_concurrent_sessions: 0,
            ..HealthConfig::default()
        };
        let mut checker = HealthChecker::new(config, Notifier::new());
        checker.catalog.add_torrent(InfoHash::new(IH), [url]);
        checker.tick();
        assert!(checker.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_tracker_counts_as_failure() {
        let mut checker = HealthChecker::new(HealthConfig::default(), Notifier::new());
        checker
            .catalog
            .add_torrent(InfoHash::new(IH), ["wss://tracker.example.org/announce"]);
        checker.tick();
        assert!(checker.in_flight.is_empty());
        let info = checker
            .catalog()
            .tracker_info("wss://tracker.example.org/announce")
            .unwrap();
        assert_eq!(info.failures, 1);
    }
}
