//! In-memory torrent and tracker catalog consulted by the health checker.
//!
//! Timestamps are unix seconds.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use super::session::ScrapeResult;
use crate::constants::{MAX_TRACKER_FAILURES, TRACKER_FAILURE_BACKOFF_SECS};
use crate::torrent::InfoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Good,
    Dead,
}

/// Latest reconciled swarm counts of one torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentHealth {
    pub infohash: InfoHash,
    pub seeders: u64,
    pub leechers: u64,
    pub last_check: i64,
    pub retries: u32,
    pub status: HealthStatus,
    pub next_check: i64,
}

impl TorrentHealth {
    fn new(infohash: InfoHash) -> Self {
        Self {
            infohash,
            seeders: 0,
            leechers: 0,
            last_check: 0,
            retries: 0,
            status: HealthStatus::Unknown,
            next_check: 0,
        }
    }
}

/// Liveness bookkeeping of one tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerInfo {
    pub url: String,
    pub last_check: i64,
    pub failures: u32,
    pub alive: bool,
}

struct TorrentEntry {
    trackers: BTreeSet<String>,
    health: TorrentHealth,
}

/// Infohash to tracker mapping plus per-torrent health.
pub struct TrackerCatalog {
    torrents: HashMap<InfoHash, TorrentEntry>,
    trackers: BTreeMap<String, TrackerInfo>,
    max_retries: u32,
    retry_interval: i64,
}

impl TrackerCatalog {
    /// `retry_interval` is in seconds.
    pub fn new(max_retries: u32, retry_interval: u64) -> Self {
        Self {
            torrents: HashMap::new(),
            trackers: BTreeMap::new(),
            max_retries,
            retry_interval: i64::try_from(retry_interval).unwrap_or(i64::MAX),
        }
    }

    /// Registers a torrent and its trackers. Known torrents gain the new trackers.
    pub fn add_torrent<I, S>(&mut self, infohash: InfoHash, trackers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.torrents.entry(infohash).or_insert_with(|| TorrentEntry {
            trackers: BTreeSet::new(),
            health: TorrentHealth::new(infohash),
        });
        for url in trackers {
            let url = url.into();
            self.trackers
                .entry(url.clone())
                .or_insert_with(|| TrackerInfo {
                    url: url.clone(),
                    last_check: 0,
                    failures: 0,
                    alive: true,
                });
            entry.trackers.insert(url);
        }
    }

    pub fn remove_torrent(&mut self, infohash: &InfoHash) -> bool {
        self.torrents.remove(infohash).is_some()
    }

    pub fn contains(&self, infohash: &InfoHash) -> bool {
        self.torrents.contains_key(infohash)
    }

    pub fn num_collected_torrents(&self) -> usize {
        self.torrents.len()
    }

    pub fn trackers_for(&self, infohash: &InfoHash) -> Vec<String> {
        self.torrents
            .get(infohash)
            .map(|entry| entry.trackers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn health(&self, infohash: &InfoHash) -> Option<&TorrentHealth> {
        self.torrents.get(infohash).map(|entry| &entry.health)
    }

    pub fn tracker_info(&self, url: &str) -> Option<&TrackerInfo> {
        self.trackers.get(url)
    }

    /// Alive trackers are rechecked after a back-off growing with failures.
    pub fn should_check_tracker(&self, url: &str, now: i64) -> bool {
        self.trackers.get(url).is_some_and(|tracker| {
            tracker.alive
                && now >= tracker.last_check + i64::from(tracker.failures) * TRACKER_FAILURE_BACKOFF_SECS
        })
    }

    /// Up to `limit` infohashes on `url` whose next check is due, oldest first.
    pub fn stale_infohashes(&self, url: &str, now: i64, limit: usize) -> Vec<InfoHash> {
        let mut stale: Vec<&TorrentHealth> = self
            .torrents
            .values()
            .filter(|entry| entry.trackers.contains(url) && entry.health.next_check <= now)
            .map(|entry| &entry.health)
            .collect();
        stale.sort_by_key(|health| (health.last_check, health.infohash));
        stale.into_iter().take(limit).map(|h| h.infohash).collect()
    }

    /// Trackers that may be checked and have stale torrents, least recently
    /// checked first.
    pub fn due_trackers(&self, now: i64) -> Vec<String> {
        let mut due: Vec<&TrackerInfo> = self
            .trackers
            .values()
            .filter(|tracker| self.should_check_tracker(&tracker.url, now))
            .filter(|tracker| !self.stale_infohashes(&tracker.url, now, 1).is_empty())
            .collect();
        due.sort_by_key(|tracker| tracker.last_check);
        due.into_iter().map(|tracker| tracker.url.clone()).collect()
    }

    /// Records the outcome of a session against `url`.
    pub fn update_tracker_info(&mut self, url: &str, success: bool, now: i64) {
        let Some(tracker) = self.trackers.get_mut(url) else {
            return;
        };
        tracker.last_check = now;
        if success {
            tracker.failures = 0;
            tracker.alive = true;
        } else {
            tracker.failures += 1;
            if tracker.failures >= MAX_TRACKER_FAILURES {
                tracing::info!("Tracker {} marked dead after {} failures", url, tracker.failures);
                tracker.alive = false;
            }
        }
    }

    /// Writes reconciled counts back and advances the retry schedule.
    pub fn update_torrent_result(
        &mut self,
        infohash: &InfoHash,
        seeders: u64,
        leechers: u64,
        now: i64,
    ) -> Option<TorrentHealth> {
        let max_retries = self.max_retries;
        let retry_interval = self.retry_interval;
        let health = &mut self.torrents.get_mut(infohash)?.health;

        health.seeders = seeders;
        health.leechers = leechers;
        health.last_check = now;
        if seeders > 0 {
            health.status = HealthStatus::Good;
            health.retries = 0;
        } else {
            health.retries = health.retries.saturating_add(1);
            if health.retries < max_retries {
                health.status = HealthStatus::Unknown;
            } else {
                health.status = HealthStatus::Dead;
                health.retries = max_retries;
            }
        }
        let backoff = 1i64.checked_shl(health.retries.min(32)).unwrap_or(i64::MAX);
        health.next_check = now.saturating_add(retry_interval.saturating_mul(backoff));
        Some(health.clone())
    }
}

/// Best `(seeders, leechers)` per infohash across tracker responses.
///
/// Highest seeders wins; ties go to the fewest leechers.
pub fn reconcile<'a, I>(results: I) -> HashMap<InfoHash, (u64, u64)>
where
    I: IntoIterator<Item = &'a ScrapeResult>,
{
    let mut best: HashMap<InfoHash, (u64, u64)> = HashMap::new();
    for result in results {
        best.entry(result.infohash)
            .and_modify(|(seeders, leechers)| {
                if result.seeders > *seeders
                    || (result.seeders == *seeders && result.leechers < *leechers)
                {
                    *seeders = result.seeders;
                    *leechers = result.leechers;
                }
            })
            .or_insert((result.seeders, result.leechers));
    }
    best
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const TRACKER_A: &str = "udp://a.example.org:6969/announce";
    const TRACKER_B: &str = "http://b.example.org/announce";

    fn ih(n: u8) -> InfoHash {
        InfoHash::new([n; 20])
    }

    #[test]
    fn test_reconcile_prefers_seeders_then_fewer_leechers() {
        let results = [
            ScrapeResult::new(ih(1), 5, 10),
            ScrapeResult::new(ih(1), 9, 40),
            ScrapeResult::new(ih(1), 9, 20),
            ScrapeResult::new(ih(2), 0, 3),
        ];
        let merged = reconcile(&results);
        assert_eq!(merged[&ih(1)], (9, 20));
        assert_eq!(merged[&ih(2)], (0, 3));
    }

    #[test]
    fn test_status_transitions() {
        let mut catalog = TrackerCatalog::new(3, 60);
        catalog.add_torrent(ih(1), [TRACKER_A]);

        let health = catalog.update_torrent_result(&ih(1), 0, 4, 1000).unwrap();
        assert_eq!((health.status, health.retries), (HealthStatus::Unknown, 1));
        assert_eq!(health.next_check, 1000 + 60 * 2);

        catalog.update_torrent_result(&ih(1), 0, 0, 2000);
        let health = catalog.update_torrent_result(&ih(1), 0, 0, 3000).unwrap();
        assert_eq!((health.status, health.retries), (HealthStatus::Dead, 3));

        let health = catalog.update_torrent_result(&ih(1), 2, 0, 4000).unwrap();
        assert_eq!((health.status, health.retries), (HealthStatus::Good, 0));
        assert_eq!(health.next_check, 4060);

        assert!(catalog.update_torrent_result(&ih(9), 1, 1, 0).is_none());
    }

    #[test]
    fn test_stale_selection_respects_next_check_and_limit() {
        let mut catalog = TrackerCatalog::new(8, 60);
        for n in 0..5 {
            catalog.add_torrent(ih(n), [TRACKER_A, TRACKER_B]);
        }
        catalog.update_torrent_result(&ih(0), 3, 0, 100);

        let stale = catalog.stale_infohashes(TRACKER_A, 120, 74);
        assert_eq!(stale.len(), 4);
        assert!(!stale.contains(&ih(0)));
        assert_eq!(catalog.stale_infohashes(TRACKER_A, 120, 2).len(), 2);
        assert_eq!(catalog.stale_infohashes(TRACKER_A, 160, 74).len(), 5);
        assert!(catalog.stale_infohashes("udp://unknown:1", 120, 74).is_empty());
    }

    #[test]
    fn test_tracker_failures_back_off_then_kill() {
        let mut catalog = TrackerCatalog::new(8, 60);
        catalog.add_torrent(ih(1), [TRACKER_A, TRACKER_B]);

        catalog.update_tracker_info(TRACKER_A, false, 1000);
        assert!(!catalog.should_check_tracker(TRACKER_A, 1030));
        assert!(catalog.should_check_tracker(TRACKER_A, 1060));
        // The untouched tracker goes first.
        assert_eq!(catalog.due_trackers(1030), vec![TRACKER_B.to_string()]);
        assert_eq!(catalog.due_trackers(1060).first().map(String::as_str), Some(TRACKER_B));

        for _ in 1..MAX_TRACKER_FAILURES {
            catalog.update_tracker_info(TRACKER_A, false, 1000);
        }
        assert!(!catalog.tracker_info(TRACKER_A).unwrap().alive);
        assert!(!catalog.should_check_tracker(TRACKER_A, i64::MAX / 2));

        catalog.update_tracker_info(TRACKER_B, true, 1100);
        assert_eq!(catalog.tracker_info(TRACKER_B).unwrap().failures, 0);
    }

    #[test]
    fn test_add_torrent_merges_trackers() {
        let mut catalog = TrackerCatalog::new(8, 60);
        catalog.add_torrent(ih(1), [TRACKER_A]);
        catalog.add_torrent(ih(1), [TRACKER_B, TRACKER_A]);
        assert_eq!(catalog.num_collected_torrents(), 1);
        assert_eq!(catalog.trackers_for(&ih(1)).len(), 2);
        assert!(catalog.remove_torrent(&ih(1)));
        assert!(catalog.trackers_for(&ih(1)).is_empty());
    }

    proptest! {
        #[test]
        fn prop_retries_never_exceed_max(
            max_retries in 1u32..12,
            seeders in proptest::collection::vec(0u64..3, 1..40),
        ) {
            let mut catalog = TrackerCatalog::new(max_retries, 60);
            catalog.add_torrent(ih(7), [TRACKER_A]);
            for (step, seeders) in seeders.into_iter().enumerate() {
                let health = catalog
                    .update_torrent_result(&ih(7), seeders, 0, step as i64 * 10)
                    .unwrap();
                prop_assert!(health.retries <= max_retries);
                prop_assert!(health.next_check > health.last_check);
            }
        }
    }
}
