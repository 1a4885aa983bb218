//! Immutable, validated torrent definitions.

use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha1::{Digest, Sha1};

use super::bencode::{self, Value};
use super::{InfoHash, TorrentError};
use crate::constants::{HASH_LEN, PATH_COMPONENT_PATTERN};

static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(PATH_COMPONENT_PATTERN).unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Returns true when `component` is acceptable as a file path element.
pub fn is_valid_path_component(component: &str) -> bool {
    PATH_COMPONENT.is_match(component)
}

/// One file inside a torrent. Single-file torrents have one entry whose path
/// is the torrent name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

impl FileEntry {
    /// Path relative to the download directory, `/`-separated.
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }

    pub fn file_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }
}

/// A parsed and validated metainfo dictionary.
///
/// Constructed only through the `load*` functions or the creator, so every
/// instance satisfies the BEP-3 invariants checked in `load_from_dict`.
#[derive(Debug, Clone)]
pub struct TorrentDef {
    metainfo: Value,
    infohash: InfoHash,
    name: String,
    piece_length: u64,
    files: Vec<FileEntry>,
    multi_file: bool,
    piece_hashes: Vec<[u8; 20]>,
    root_hash: Option<[u8; 20]>,
}

impl PartialEq for TorrentDef {
    fn eq(&self, other: &Self) -> bool {
        self.infohash == other.infohash
    }
}

impl TorrentDef {
    /// Loads a `.torrent` file from disk.
    ///
    /// # Errors
    /// - `TorrentError::Io` - file could not be read
    /// - `TorrentError::Bencode` / `InvalidTorrentFile` - see `load_from_dict`
    pub fn load(path: &Path) -> Result<Self, TorrentError> {
        let data = std::fs::read(path)?;
        Self::load_from_memory(&data)
    }

    /// Parses bencoded metainfo bytes.
    ///
    /// # Errors
    /// - `TorrentError::Bencode` - bytes are not bencode
    /// - `TorrentError::InvalidTorrentFile` - see `load_from_dict`
    pub fn load_from_memory(data: &[u8]) -> Result<Self, TorrentError> {
        Self::load_from_dict(bencode::decode(data)?)
    }

    /// Validates a decoded metainfo dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - missing or malformed required keys,
    ///   piece data not matching the total length
    /// - `TorrentError::InvalidPath` - a path component fails the name rules
    /// - `TorrentError::DuplicatePath` - two files share a path
    pub fn load_from_dict(metainfo: Value) -> Result<Self, TorrentError> {
        if bencode::as_dict(&metainfo).is_none() {
            return Err(TorrentError::invalid("metainfo is not a dictionary"));
        }
        let info = bencode::get(&metainfo, "info")
            .filter(|v| bencode::as_dict(v).is_some())
            .ok_or_else(|| TorrentError::invalid("missing info dictionary"))?;

        let piece_length = bencode::get_int(info, "piece length")
            .filter(|&p| p > 0)
            .ok_or_else(|| TorrentError::invalid("piece length must be a positive integer"))?
            as u64;

        let name = bencode::get_bytes(info, "name")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| TorrentError::invalid("missing name"))?;
        if !is_valid_path_component(&name) {
            return Err(TorrentError::InvalidPath { component: name });
        }

        let has_length = bencode::get(info, "length").is_some();
        let has_files = bencode::get(info, "files").is_some();
        let (files, multi_file) = match (has_length, has_files) {
            (true, false) => {
                let length = bencode::get_int(info, "length")
                    .filter(|&l| l >= 0)
                    .ok_or_else(|| TorrentError::invalid("length must be a non-negative integer"))?;
                (
                    vec![FileEntry {
                        path: vec![name.clone()],
                        length: length as u64,
                    }],
                    false,
                )
            }
            (false, true) => (parse_file_list(info)?, true),
            _ => {
                return Err(TorrentError::invalid(
                    "exactly one of length and files is required",
                ));
            }
        };

        let total: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total.div_ceil(piece_length);

        let (piece_hashes, root_hash) = match (
            bencode::get_bytes(info, "pieces"),
            bencode::get_bytes(info, "root hash"),
        ) {
            (Some(pieces), None) => {
                if pieces.len() % HASH_LEN != 0 {
                    return Err(TorrentError::invalid("pieces length is not a multiple of 20"));
                }
                let hashes: Vec<[u8; 20]> = pieces
                    .chunks_exact(HASH_LEN)
                    .filter_map(|c| <[u8; 20]>::try_from(c).ok())
                    .collect();
                if hashes.len() as u64 != expected_pieces {
                    return Err(TorrentError::invalid(format!(
                        "expected {expected_pieces} piece hashes, found {}",
                        hashes.len()
                    )));
                }
                (hashes, None)
            }
            (None, Some(root)) => {
                let root = <[u8; 20]>::try_from(root)
                    .map_err(|_| TorrentError::invalid("root hash must be 20 bytes"))?;
                (Vec::new(), Some(root))
            }
            _ => {
                return Err(TorrentError::invalid(
                    "exactly one of pieces and root hash is required",
                ));
            }
        };

        let infohash = compute_infohash(info)?;

        Ok(Self {
            metainfo,
            infohash,
            name,
            piece_length,
            files,
            multi_file,
            piece_hashes,
            root_hash,
        })
    }

    /// Canonical bencoding of the whole metainfo.
    ///
    /// # Errors
    /// - `TorrentError::Bencode` - serialization failed
    pub fn to_bytes(&self) -> Result<Vec<u8>, TorrentError> {
        bencode::encode(&self.metainfo)
    }

    pub fn metainfo(&self) -> &Value {
        &self.metainfo
    }

    pub fn info(&self) -> &Value {
        bencode::get(&self.metainfo, "info").unwrap_or(&self.metainfo)
    }

    pub fn infohash(&self) -> InfoHash {
        self.infohash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn is_merkle(&self) -> bool {
        self.root_hash.is_some()
    }

    pub fn root_hash(&self) -> Option<[u8; 20]> {
        self.root_hash
    }

    pub fn piece_hashes(&self) -> &[[u8; 20]] {
        &self.piece_hashes
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn number_of_pieces(&self) -> u64 {
        self.total_size().div_ceil(self.piece_length)
    }

    /// `(path, length)` for every file, in metainfo order.
    pub fn get_files_with_length(&self) -> Vec<(String, u64)> {
        self.files
            .iter()
            .map(|f| (f.path_string(), f.length))
            .collect()
    }

    pub fn get_index_of_file_in_files(&self, path: &str) -> Option<usize> {
        self.files.iter().position(|f| f.path_string() == path)
    }

    /// Byte offset of file `index` within the concatenated torrent data.
    pub fn file_offset(&self, index: usize) -> Option<u64> {
        if index >= self.files.len() {
            return None;
        }
        Some(self.files[..index].iter().map(|f| f.length).sum())
    }

    /// Pieces overlapping file `index`.
    pub fn piece_range_for_file(&self, index: usize) -> Option<Range<u64>> {
        let offset = self.file_offset(index)?;
        let length = self.files[index].length;
        if length == 0 {
            let piece = offset / self.piece_length;
            return Some(piece..piece);
        }
        let first = offset / self.piece_length;
        let last = (offset + length - 1) / self.piece_length;
        Some(first..last + 1)
    }

    /// Flattened tracker list: `announce` first, then every tier, deduplicated.
    pub fn get_trackers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut trackers = Vec::new();
        let announce = bencode::get_str(&self.metainfo, "announce");
        let tiers = self.tracker_tiers();
        for url in announce.into_iter().chain(tiers.into_iter().flatten()) {
            if !url.is_empty() && seen.insert(url.clone()) {
                trackers.push(url);
            }
        }
        trackers
    }

    /// `announce-list` tiers as stored.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        bencode::get_list(&self.metainfo, "announce-list")
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| match tier {
                        Value::List(urls) => Some(bencode::string_list(urls)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a copy whose trackers are replaced by `trackers`.
    ///
    /// A single tracker is stored as `announce` only; more than one are also
    /// written as an `announce-list` with one tracker per tier.
    pub fn with_trackers(&self, trackers: &[String]) -> Self {
        let mut copy = self.clone();
        bencode::remove(&mut copy.metainfo, "announce");
        bencode::remove(&mut copy.metainfo, "announce-list");
        if let Some(first) = trackers.first() {
            bencode::insert(&mut copy.metainfo, "announce", bencode::string(first));
        }
        if trackers.len() > 1 {
            let tiers = trackers
                .iter()
                .map(|t| Value::List(vec![bencode::string(t)]))
                .collect();
            bencode::insert(&mut copy.metainfo, "announce-list", Value::List(tiers));
        }
        copy
    }

    pub fn creation_date(&self) -> Option<i64> {
        bencode::get_int(&self.metainfo, "creation date")
    }

    pub fn comment(&self) -> Option<String> {
        bencode::get_str(&self.metainfo, "comment")
    }

    /// Opaque `[h:]mm:ss` duration for media torrents.
    pub fn playtime(&self) -> Option<String> {
        bencode::get_str(self.info(), "playtime")
            .or_else(|| bencode::get_str(&self.metainfo, "playtime"))
    }

    pub fn videodim(&self) -> Option<String> {
        bencode::get_str(&self.metainfo, "videodim")
    }

    pub fn httpseeds(&self) -> Vec<String> {
        bencode::get_list(&self.metainfo, "httpseeds")
            .map(bencode::string_list)
            .unwrap_or_default()
    }
}

fn parse_file_list(info: &Value) -> Result<Vec<FileEntry>, TorrentError> {
    let entries = bencode::get_list(info, "files")
        .ok_or_else(|| TorrentError::invalid("files must be a list"))?;
    if entries.is_empty() {
        return Err(TorrentError::invalid("files list is empty"));
    }

    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let length = bencode::get_int(entry, "length")
            .filter(|&l| l >= 0)
            .ok_or_else(|| TorrentError::invalid("file entry without valid length"))?;
        let components = bencode::get_list(entry, "path")
            .ok_or_else(|| TorrentError::invalid("file entry without path"))?;
        let path = bencode::string_list(components);
        if path.is_empty() || path.len() != components.len() {
            return Err(TorrentError::invalid("file path must be a list of strings"));
        }
        if let Some(bad) = path.iter().find(|c| !is_valid_path_component(c)) {
            return Err(TorrentError::InvalidPath {
                component: bad.clone(),
            });
        }
        let joined = path.join("/");
        if !seen.insert(joined.clone()) {
            return Err(TorrentError::DuplicatePath { path: joined });
        }
        files.push(FileEntry {
            path,
            length: length as u64,
        });
    }
    Ok(files)
}

fn compute_infohash(info: &Value) -> Result<InfoHash, TorrentError> {
    let encoded = bencode::encode(info)?;
    let digest = Sha1::digest(&encoded);
    InfoHash::from_slice(&digest).ok_or_else(|| TorrentError::invalid("bad digest length"))
}

/// Placeholder for a torrent whose metainfo is not known yet (magnet starts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDefNoMetainfo {
    pub infohash: InfoHash,
    pub name: String,
    pub url: Option<String>,
    pub trackers: Vec<String>,
}

/// What a download is started from.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadDef {
    Full(TorrentDef),
    NoMetainfo(TorrentDefNoMetainfo),
}

impl DownloadDef {
    pub fn infohash(&self) -> InfoHash {
        match self {
            DownloadDef::Full(def) => def.infohash(),
            DownloadDef::NoMetainfo(def) => def.infohash,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DownloadDef::Full(def) => def.name(),
            DownloadDef::NoMetainfo(def) => &def.name,
        }
    }

    pub fn trackers(&self) -> Vec<String> {
        match self {
            DownloadDef::Full(def) => def.get_trackers(),
            DownloadDef::NoMetainfo(def) => def.trackers.clone(),
        }
    }

    pub fn with_trackers(&self, trackers: &[String]) -> Self {
        match self {
            DownloadDef::Full(def) => DownloadDef::Full(def.with_trackers(trackers)),
            DownloadDef::NoMetainfo(def) => DownloadDef::NoMetainfo(TorrentDefNoMetainfo {
                trackers: trackers.to_vec(),
                ..def.clone()
            }),
        }
    }

    pub fn as_full(&self) -> Option<&TorrentDef> {
        match self {
            DownloadDef::Full(def) => Some(def),
            DownloadDef::NoMetainfo(_) => None,
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        match self {
            DownloadDef::Full(def) => def.files(),
            DownloadDef::NoMetainfo(_) => &[],
        }
    }

    pub fn total_size(&self) -> u64 {
        self.as_full().map(TorrentDef::total_size).unwrap_or(0)
    }
}

impl From<TorrentDef> for DownloadDef {
    fn from(def: TorrentDef) -> Self {
        DownloadDef::Full(def)
    }
}

impl From<TorrentDefNoMetainfo> for DownloadDef {
    fn from(def: TorrentDefNoMetainfo) -> Self {
        DownloadDef::NoMetainfo(def)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a valid single-file metainfo with zeroed piece hashes.
    pub fn single_file_metainfo(name: &str, length: u64, piece_length: u64) -> Value {
        let pieces = length.div_ceil(piece_length) as usize;
        bencode::dict([
            ("announce", bencode::string("http://tracker.example.com/announce")),
            (
                "info",
                bencode::dict([
                    ("length", bencode::int(length as i64)),
                    ("name", bencode::string(name)),
                    ("piece length", bencode::int(piece_length as i64)),
                    ("pieces", bencode::bytes(vec![0u8; pieces * HASH_LEN])),
                ]),
            ),
        ])
    }

    pub fn multi_file_metainfo(name: &str, files: &[(&str, u64)], piece_length: u64) -> Value {
        let total: u64 = files.iter().map(|(_, l)| l).sum();
        let pieces = total.div_ceil(piece_length) as usize;
        let entries = files
            .iter()
            .map(|(path, length)| {
                bencode::dict([
                    ("length", bencode::int(*length as i64)),
                    (
                        "path",
                        Value::List(path.split('/').map(bencode::string).collect()),
                    ),
                ])
            })
            .collect();
        bencode::dict([(
            "info",
            bencode::dict([
                ("files", Value::List(entries)),
                ("name", bencode::string(name)),
                ("piece length", bencode::int(piece_length as i64)),
                ("pieces", bencode::bytes(vec![0u8; pieces * HASH_LEN])),
            ]),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_load_single_file() {
        let def = TorrentDef::load_from_dict(single_file_metainfo("movie.mkv", 100_000, 32768))
            .unwrap();

        assert_eq!(def.name(), "movie.mkv");
        assert_eq!(def.total_size(), 100_000);
        assert_eq!(def.number_of_pieces(), 4);
        assert_eq!(def.piece_hashes().len(), 4);
        assert!(!def.is_multi_file());
        assert_eq!(
            def.get_trackers(),
            vec!["http://tracker.example.com/announce".to_string()]
        );
    }

    #[test]
    fn test_infohash_stable_across_reparse() {
        let def = TorrentDef::load_from_dict(single_file_metainfo("a.bin", 5000, 1024)).unwrap();
        let bytes = def.to_bytes().unwrap();
        let reparsed = TorrentDef::load_from_memory(&bytes).unwrap();
        assert_eq!(reparsed.infohash(), def.infohash());
    }

    #[test]
    fn test_multi_file_offsets_and_piece_ranges() {
        let meta = multi_file_metainfo("album", &[("cd1/a.flac", 1500), ("b.flac", 600)], 1024);
        let def = TorrentDef::load_from_dict(meta).unwrap();

        assert!(def.is_multi_file());
        assert_eq!(def.get_index_of_file_in_files("b.flac"), Some(1));
        assert_eq!(def.file_offset(1), Some(1500));
        assert_eq!(def.piece_range_for_file(0), Some(0..2));
        assert_eq!(def.piece_range_for_file(1), Some(1..3));
        assert_eq!(def.piece_range_for_file(2), None);
    }

    #[test]
    fn test_rejects_both_length_and_files() {
        let mut meta = multi_file_metainfo("album", &[("a", 10)], 16);
        if let Some(info) = bencode::as_dict_mut(&mut meta).and_then(|d| d.get_mut(b"info".as_slice())) {
            bencode::insert(info, "length", bencode::int(10));
        }
        assert!(matches!(
            TorrentDef::load_from_dict(meta),
            Err(TorrentError::InvalidTorrentFile { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_path_components() {
        for bad in ["../escape", ".hidden", "~backup", "dir\\file"] {
            let meta = multi_file_metainfo("album", &[(bad, 10)], 16);
            assert!(
                TorrentDef::load_from_dict(meta).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_duplicate_paths() {
        let meta = multi_file_metainfo("album", &[("a.txt", 10), ("a.txt", 20)], 16);
        assert!(matches!(
            TorrentDef::load_from_dict(meta),
            Err(TorrentError::DuplicatePath { .. })
        ));
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let mut meta = single_file_metainfo("x", 100, 10);
        if let Some(info) = bencode::as_dict_mut(&mut meta).and_then(|d| d.get_mut(b"info".as_slice())) {
            bencode::insert(info, "pieces", bencode::bytes(vec![0u8; 20 * 3]));
        }
        assert!(TorrentDef::load_from_dict(meta).is_err());
    }

    fn merkle_metainfo(root: Vec<u8>) -> Value {
        let mut meta = single_file_metainfo("x", 100, 10);
        if let Some(info) = bencode::as_dict_mut(&mut meta).and_then(|d| d.get_mut(b"info".as_slice())) {
            if let Some(fields) = bencode::as_dict_mut(info) {
                fields.remove(b"pieces".as_slice());
            }
            bencode::insert(info, "root hash", bencode::bytes(root));
        }
        meta
    }

    #[test]
    fn test_root_hash_is_sha1_sized() {
        let def = TorrentDef::load_from_dict(merkle_metainfo(vec![7u8; 20])).unwrap();
        assert!(def.is_merkle());
        assert_eq!(def.root_hash(), Some([7u8; 20]));
        assert!(TorrentDef::load_from_dict(merkle_metainfo(vec![7u8; 32])).is_err());
    }

    #[test]
    fn test_rejects_non_positive_piece_length() {
        let mut meta = single_file_metainfo("x", 100, 10);
        if let Some(info) = bencode::as_dict_mut(&mut meta).and_then(|d| d.get_mut(b"info".as_slice())) {
            bencode::insert(info, "piece length", bencode::int(0));
        }
        assert!(TorrentDef::load_from_dict(meta).is_err());
    }

    #[test]
    fn test_with_trackers_rebuilds_announce_fields() {
        let def = TorrentDef::load_from_dict(single_file_metainfo("a", 10, 16)).unwrap();

        let single = def.with_trackers(&["udp://one:80/announce".to_string()]);
        assert_eq!(single.get_trackers(), vec!["udp://one:80/announce".to_string()]);
        assert!(single.tracker_tiers().is_empty());

        let many = def.with_trackers(&[
            "udp://one:80/announce".to_string(),
            "http://two/announce".to_string(),
        ]);
        assert_eq!(many.get_trackers().len(), 2);
        assert_eq!(many.tracker_tiers().len(), 2);
        assert_eq!(many.infohash(), def.infohash());
    }
}
