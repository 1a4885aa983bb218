//! Detection of near-identical torrents across boosting sources.
//!
//! Two torrents count as the same content when every file of at least
//! [`DEDUP_MIN_FILE_SIZE`] has a partner of equal size whose name is within
//! [`SIMILARITY_THRESHOLD`] edits. Small files (readmes, nfo, samples) are
//! ignored.

use std::collections::HashMap;

use crate::constants::{DEDUP_MIN_FILE_SIZE, SIMILARITY_THRESHOLD};
use crate::torrent::{InfoHash, TorrentDef};

use super::source::MiningTorrent;

/// Files of at least [`DEDUP_MIN_FILE_SIZE`] bytes, ordered by size then name.
pub fn large_files(def: &TorrentDef) -> Vec<(String, u64)> {
    let mut files: Vec<(String, u64)> = def
        .files()
        .iter()
        .filter(|f| f.length >= DEDUP_MIN_FILE_SIZE)
        .map(|f| (f.file_name().to_string(), f.length))
        .collect();
    files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    files
}

/// Whether `a` and `b` carry the same large files under similar names.
pub fn is_similar(a: &TorrentDef, b: &TorrentDef) -> bool {
    similar_files(&large_files(a), &large_files(b), SIMILARITY_THRESHOLD)
}

fn similar_files(a: &[(String, u64)], b: &[(String, u64)], threshold: usize) -> bool {
    if a.is_empty() || a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b)
        .all(|((name_a, size_a), (name_b, size_b))| {
            size_a == size_b && edit_distance(name_a, name_b) <= threshold
        })
}

/// Levenshtein distance, keeping one row sized by the shorter string.
fn edit_distance(a: &str, b: &str) -> usize {
    if a.chars().count() < b.chars().count() {
        strsim::levenshtein(b, a)
    } else {
        strsim::levenshtein(a, b)
    }
}

/// Marks every torrent similar to `infohash` except the best seeded one.
///
/// Returns the infohashes that were newly marked as duplicates; callers
/// stop their downloads. The winner has its duplicate flag cleared.
pub(crate) fn mark_duplicates(
    torrents: &mut HashMap<InfoHash, MiningTorrent>,
    infohash: &InfoHash,
) -> Vec<InfoHash> {
    let Some(inserted) = torrents.get(infohash) else {
        return Vec::new();
    };
    let files = large_files(&inserted.def);
    if files.is_empty() {
        return Vec::new();
    }

    let mut group: Vec<InfoHash> = torrents
        .iter()
        .filter(|(ih, t)| {
            *ih == infohash || similar_files(&files, &large_files(&t.def), SIMILARITY_THRESHOLD)
        })
        .map(|(ih, _)| *ih)
        .collect();
    if group.len() < 2 {
        return Vec::new();
    }

    // Ties go to the lowest infohash so the outcome does not depend on map order.
    group.sort();
    let Some(winner) = group
        .iter()
        .copied()
        .max_by(|a, b| {
            let seeders_a = torrents.get(a).map_or(0, |t| t.num_seeders);
            let seeders_b = torrents.get(b).map_or(0, |t| t.num_seeders);
            seeders_a.cmp(&seeders_b).then_with(|| b.cmp(a))
        })
    else {
        return Vec::new();
    };

    let mut marked = Vec::new();
    for ih in group {
        let Some(torrent) = torrents.get_mut(&ih) else {
            continue;
        };
        if ih == winner {
            torrent.is_duplicate = false;
        } else if !torrent.is_duplicate {
            tracing::debug!("{} duplicates {}", torrent.def.name(), winner);
            torrent.is_duplicate = true;
            marked.push(ih);
        }
    }
    marked
}
