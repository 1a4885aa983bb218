//! Ranking policies for choosing which mining torrents run.

use std::cmp::Ordering;

use rand::Rng;

use super::MiningError;
use super::source::MiningTorrent;
use crate::constants::SCORING_WEIGHTS;
use crate::torrent::InfoHash;

/// How candidates are ranked for the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiningPolicy {
    Random,
    /// Newest torrents first.
    CreationDate,
    /// Most under-seeded swarms first.
    #[default]
    SeederRatio,
    /// Weighted mix of leechers, peers and availability with a speed bonus.
    Scoring,
}

impl MiningPolicy {
    /// Looks a policy up by its configuration name.
    ///
    /// # Errors
    /// - `MiningError::UnknownPolicy` - no policy with that name
    pub fn from_name(name: &str) -> Result<Self, MiningError> {
        match name.to_ascii_lowercase().as_str() {
            "random" => Ok(MiningPolicy::Random),
            "creation_date" | "creationdate" => Ok(MiningPolicy::CreationDate),
            "seeder_ratio" | "seederratio" => Ok(MiningPolicy::SeederRatio),
            "scoring" => Ok(MiningPolicy::Scoring),
            _ => Err(MiningError::UnknownPolicy {
                name: name.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MiningPolicy::Random => "random",
            MiningPolicy::CreationDate => "creation_date",
            MiningPolicy::SeederRatio => "seeder_ratio",
            MiningPolicy::Scoring => "scoring",
        }
    }

    fn reverse(&self) -> bool {
        matches!(self, MiningPolicy::CreationDate | MiningPolicy::Scoring)
    }

    fn key_check(&self, torrent: &MiningTorrent) -> bool {
        match self {
            MiningPolicy::Random | MiningPolicy::Scoring => true,
            MiningPolicy::CreationDate => torrent.def.creation_date().is_some_and(|d| d > 0),
            MiningPolicy::SeederRatio => torrent.num_seeders + torrent.num_leechers > 0,
        }
    }

    /// Splits `pool` into torrents to start and torrents to stop.
    ///
    /// The best `max_active` candidates that are not running are started;
    /// every running torrent outside that set is stopped. Ties keep the
    /// order of `pool`.
    pub fn apply(&self, pool: &[&MiningTorrent], max_active: usize) -> (Vec<InfoHash>, Vec<InfoHash>) {
        let candidates: Vec<&MiningTorrent> = pool
            .iter()
            .copied()
            .filter(|t| self.key_check(t))
            .collect();
        let keys = self.keys(&candidates);

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| {
            let ordering = keys[a].total_cmp(&keys[b]);
            if self.reverse() { ordering.reverse() } else { ordering }
        });

        let selected: Vec<InfoHash> = order
            .iter()
            .take(max_active)
            .map(|&i| candidates[i].infohash())
            .collect();
        let to_start = order
            .iter()
            .take(max_active)
            .map(|&i| candidates[i])
            .filter(|t| !t.running)
            .map(MiningTorrent::infohash)
            .collect();
        let to_stop = pool
            .iter()
            .filter(|t| t.running && !selected.contains(&t.infohash()))
            .map(|t| t.infohash())
            .collect();
        (to_start, to_stop)
    }

    fn keys(&self, candidates: &[&MiningTorrent]) -> Vec<f64> {
        match self {
            MiningPolicy::Random => {
                let mut rng = rand::rng();
                candidates.iter().map(|_| rng.random::<f64>()).collect()
            }
            MiningPolicy::CreationDate => candidates
                .iter()
                .map(|t| t.def.creation_date().unwrap_or_default() as f64)
                .collect(),
            MiningPolicy::SeederRatio => candidates
                .iter()
                .map(|t| t.num_seeders as f64 / (t.num_seeders + t.num_leechers) as f64)
                .collect(),
            MiningPolicy::Scoring => scores(candidates),
        }
    }
}

/// Composite scores; each component is normalised by the pool maximum.
fn scores(candidates: &[&MiningTorrent]) -> Vec<f64> {
    let (leech_weight, peer_weight, avail_weight) = SCORING_WEIGHTS;
    let max_leechers = candidates.iter().map(|t| t.num_leechers).max().unwrap_or(0);
    let max_peers = candidates.iter().map(|t| peers(t)).max().unwrap_or(0);
    let median = median_speed(candidates);

    candidates
        .iter()
        .map(|t| {
            let leech = ratio(t.num_leechers, max_leechers);
            let peer = ratio(peers(t), max_peers);
            // Scarce seeds mean our copy matters more.
            let avail = 1.0 / (1.0 + t.num_seeders as f64);
            let bonus = match (average_speed(t), median) {
                (Some(speed), Some(median)) if speed >= median => 1.0,
                _ => 0.0,
            };
            leech_weight * leech + peer_weight * peer + avail_weight * avail + bonus
        })
        .collect()
}

fn peers(torrent: &MiningTorrent) -> u64 {
    torrent
        .last_seeding_stats
        .as_ref()
        .map_or(torrent.num_seeders + torrent.num_leechers, |s| s.num_peers as u64)
}

fn ratio(value: u64, max: u64) -> f64 {
    if max == 0 { 0.0 } else { value as f64 / max as f64 }
}

/// Bytes per second per connected peer, for torrents with active peers.
fn average_speed(torrent: &MiningTorrent) -> Option<f64> {
    let stats = torrent.last_seeding_stats.as_ref()?;
    (stats.num_peers > 0).then(|| (stats.up_bps + stats.dn_bps) as f64 / stats.num_peers as f64)
}

fn median_speed(candidates: &[&MiningTorrent]) -> Option<f64> {
    let mut speeds: Vec<f64> = candidates.iter().filter_map(|t| average_speed(t)).collect();
    if speeds.is_empty() {
        return None;
    }
    speeds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Some(speeds[speeds.len() / 2])
}
