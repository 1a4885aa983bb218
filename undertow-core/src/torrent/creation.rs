//! Torrent creation from local files with piece splitting and hashing
//!
//! Reads the input files as one continuous byte stream, emits a SHA-1 digest
//! every `piece length` bytes and optionally accumulates per-file MD5, CRC32
//! and SHA-1 digests in the same pass. Merkle mode replaces `pieces` with the
//! tree root over the piece hashes.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::Md5;
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;

use super::bencode::{self, Value};
use super::merkle::merkle_root;
use super::torrent_def::is_valid_path_component;
use super::{InfoHash, TorrentDef, TorrentError};
use crate::constants::{MERKLE_DEFAULT_PIECE_LENGTH, MIB};

const READ_CHUNK: u64 = 64 * 1024;

/// Picks a piece length from the total payload size.
pub fn piece_length_for(total_size: u64, merkle: bool) -> u64 {
    if merkle {
        return u64::from(MERKLE_DEFAULT_PIECE_LENGTH);
    }
    match total_size {
        s if s <= 4 * MIB => 32 * 1024,
        s if s <= 16 * MIB => 128 * 1024,
        s if s <= 64 * MIB => 256 * 1024,
        s if s <= 512 * MIB => 512 * 1024,
        s if s <= 2048 * MIB => MIB,
        _ => 2 * MIB,
    }
}

/// Receives progress while a torrent is being hashed.
pub trait CreationProgress: Send + Sync {
    /// Fraction of payload bytes hashed so far, in `[0, 1]`.
    fn on_progress(&self, fraction: f64);

    /// Called once a source file has been fully read. `destination` is the
    /// file's path inside the torrent.
    fn on_file_complete(&self, _source: &Path, _destination: &Path) {}
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl CreationProgress for NoProgress {
    fn on_progress(&self, _fraction: f64) {}
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct CreatedTorrent {
    pub infohash: InfoHash,
    pub metainfo: Value,
    pub torrent_def: TorrentDef,
}

impl CreatedTorrent {
    /// Writes the bencoded metainfo to `path`.
    ///
    /// # Errors
    /// - `TorrentError::Io` - write failed
    pub async fn save(&self, path: &Path) -> Result<(), TorrentError> {
        let bytes = self.torrent_def.to_bytes()?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

/// Per-file digests requested in the build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumFlags {
    pub md5: bool,
    pub crc32: bool,
    pub sha1: bool,
}

impl ChecksumFlags {
    fn any(&self) -> bool {
        self.md5 || self.crc32 || self.sha1
    }
}

#[derive(Debug, Clone)]
struct InputFile {
    source: PathBuf,
    path: Vec<String>,
    length: u64,
}

#[derive(Default)]
struct FileDigests {
    md5: Option<String>,
    crc32: Option<String>,
    sha1: Option<[u8; 20]>,
}

struct FileHashers {
    md5: Option<Md5>,
    crc32: Option<crc32fast::Hasher>,
    sha1: Option<Sha1>,
}

impl FileHashers {
    fn new(flags: ChecksumFlags) -> Self {
        Self {
            md5: flags.md5.then(Md5::new),
            crc32: flags.crc32.then(crc32fast::Hasher::new),
            sha1: flags.sha1.then(Sha1::new),
        }
    }

    fn update(&mut self, data: &[u8]) {
        if let Some(h) = self.md5.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.crc32.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha1.as_mut() {
            h.update(data);
        }
    }

    fn finish(self) -> FileDigests {
        FileDigests {
            md5: self.md5.map(|h| hex::encode(h.finalize())),
            crc32: self.crc32.map(|h| format!("{:08X}", h.finalize())),
            sha1: self.sha1.map(|h| h.finalize().into()),
        }
    }
}

struct HashOutput {
    pieces: Vec<[u8; 20]>,
    file_digests: Vec<FileDigests>,
}

/// Builder for new torrents.
#[derive(Debug, Clone, Default)]
pub struct TorrentCreator {
    paths: Vec<PathBuf>,
    name: Option<String>,
    piece_length: Option<u64>,
    trackers: Vec<String>,
    comment: Option<String>,
    httpseeds: Vec<String>,
    playtime: Option<String>,
    merkle: bool,
    checksums: ChecksumFlags,
}

impl TorrentCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file or a directory (walked recursively, hidden entries skipped).
    pub fn add_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Overrides the torrent name. Required to be a valid path component.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Fixed piece length; zero selects one from the total size.
    pub fn piece_length(mut self, piece_length: u64) -> Self {
        self.piece_length = (piece_length > 0).then_some(piece_length);
        self
    }

    pub fn trackers(mut self, trackers: Vec<String>) -> Self {
        self.trackers = trackers;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn httpseeds(mut self, seeds: Vec<String>) -> Self {
        self.httpseeds = seeds;
        self
    }

    /// Media duration in `[h:]mm:ss`, stored verbatim.
    pub fn playtime(mut self, playtime: impl Into<String>) -> Self {
        self.playtime = Some(playtime.into());
        self
    }

    pub fn merkle(mut self, enabled: bool) -> Self {
        self.merkle = enabled;
        self
    }

    pub fn checksums(mut self, flags: ChecksumFlags) -> Self {
        self.checksums = flags;
        self
    }

    /// Hashes the inputs and assembles the metainfo.
    ///
    /// Hashing runs on the blocking pool. `cancel` is checked between every
    /// read and every hash update.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - no inputs, empty payload, bad name
    /// - `TorrentError::InvalidPath` / `DuplicatePath` - file naming rules
    /// - `TorrentError::Cancelled` - `cancel` fired mid-build
    /// - `TorrentError::Io` - input could not be read
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        progress: Arc<dyn CreationProgress>,
    ) -> Result<CreatedTorrent, TorrentError> {
        let (name, inputs, multi_file) = self.collect_inputs().await?;

        let total: u64 = inputs.iter().map(|f| f.length).sum();
        if total == 0 {
            return Err(TorrentError::invalid("cannot create a torrent with no data"));
        }
        let piece_length = self
            .piece_length
            .unwrap_or_else(|| piece_length_for(total, self.merkle));

        tracing::debug!(
            "Hashing {} file(s), {} bytes, piece length {}",
            inputs.len(),
            total,
            piece_length
        );

        let output = {
            let inputs = inputs.clone();
            let cancel = cancel.clone();
            let flags = self.checksums;
            tokio::task::spawn_blocking(move || {
                hash_inputs(&inputs, total, piece_length, flags, &cancel, progress.as_ref())
            })
            .await
            .map_err(|e| TorrentError::Io(std::io::Error::other(e)))??
        };

        let metainfo = self.assemble(&name, &inputs, multi_file, piece_length, output);
        let torrent_def = TorrentDef::load_from_dict(metainfo.clone())?;

        tracing::info!("Created torrent {} ({})", torrent_def.name(), torrent_def.infohash());

        Ok(CreatedTorrent {
            infohash: torrent_def.infohash(),
            metainfo,
            torrent_def,
        })
    }

    async fn collect_inputs(&self) -> Result<(String, Vec<InputFile>, bool), TorrentError> {
        let Some(first) = self.paths.first() else {
            return Err(TorrentError::invalid("no input files given"));
        };

        let single_file = self.paths.len() == 1 && tokio::fs::metadata(first).await?.is_file();

        let mut inputs = Vec::new();
        for path in &self.paths {
            let metadata = tokio::fs::metadata(path).await?;
            if metadata.is_file() {
                inputs.push(InputFile {
                    source: path.clone(),
                    path: vec![file_name_of(path)?],
                    length: metadata.len(),
                });
            } else if metadata.is_dir() {
                let prefix = if self.paths.len() > 1 {
                    vec![file_name_of(path)?]
                } else {
                    Vec::new()
                };
                inputs.extend(collect_files_recursively(path, &prefix).await?);
            }
        }

        if inputs.is_empty() {
            return Err(TorrentError::invalid("inputs contain no files"));
        }

        let mut seen = HashSet::new();
        for input in &inputs {
            if let Some(bad) = input.path.iter().find(|c| !is_valid_path_component(c)) {
                return Err(TorrentError::InvalidPath {
                    component: bad.clone(),
                });
            }
            let joined = input.path.join("/");
            if !seen.insert(joined.clone()) {
                return Err(TorrentError::DuplicatePath { path: joined });
            }
        }

        let name = match &self.name {
            Some(name) => name.clone(),
            None if single_file || self.paths.len() == 1 => file_name_of(first)?,
            None => first
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "torrent".to_string()),
        };
        if !is_valid_path_component(&name) {
            return Err(TorrentError::InvalidPath { component: name });
        }

        Ok((name, inputs, !single_file))
    }

    fn assemble(
        &self,
        name: &str,
        inputs: &[InputFile],
        multi_file: bool,
        piece_length: u64,
        output: HashOutput,
    ) -> Value {
        let mut info = bencode::dict([
            ("name", bencode::string(name)),
            ("piece length", bencode::int(piece_length as i64)),
        ]);

        if self.merkle {
            bencode::insert(
                &mut info,
                "root hash",
                bencode::bytes(merkle_root(&output.pieces).to_vec()),
            );
        } else {
            bencode::insert(&mut info, "pieces", bencode::bytes(output.pieces.concat()));
        }

        if multi_file {
            let entries = inputs
                .iter()
                .zip(&output.file_digests)
                .map(|(input, digests)| {
                    let mut entry = bencode::dict([
                        ("length", bencode::int(input.length as i64)),
                        (
                            "path",
                            Value::List(input.path.iter().map(|c| bencode::string(c)).collect()),
                        ),
                    ]);
                    insert_digests(&mut entry, digests);
                    entry
                })
                .collect();
            bencode::insert(&mut info, "files", Value::List(entries));
        } else {
            bencode::insert(&mut info, "length", bencode::int(inputs[0].length as i64));
            if let Some(digests) = output.file_digests.first() {
                insert_digests(&mut info, digests);
            }
        }

        if let Some(playtime) = &self.playtime {
            bencode::insert(&mut info, "playtime", bencode::string(playtime));
        }

        let mut metainfo = bencode::dict([
            ("info", info),
            ("creation date", bencode::int(chrono::Utc::now().timestamp())),
            (
                "created by",
                bencode::string(concat!("undertow/", env!("CARGO_PKG_VERSION"))),
            ),
        ]);
        if let Some(first) = self.trackers.first() {
            bencode::insert(&mut metainfo, "announce", bencode::string(first));
        }
        if self.trackers.len() > 1 {
            let tiers = self
                .trackers
                .iter()
                .map(|t| Value::List(vec![bencode::string(t)]))
                .collect();
            bencode::insert(&mut metainfo, "announce-list", Value::List(tiers));
        }
        if let Some(comment) = &self.comment {
            bencode::insert(&mut metainfo, "comment", bencode::string(comment));
        }
        if !self.httpseeds.is_empty() {
            let seeds = self.httpseeds.iter().map(|s| bencode::string(s)).collect();
            bencode::insert(&mut metainfo, "httpseeds", Value::List(seeds));
        }
        metainfo
    }
}

fn insert_digests(target: &mut Value, digests: &FileDigests) {
    if let Some(md5) = &digests.md5 {
        bencode::insert(target, "md5sum", bencode::string(md5));
    }
    if let Some(crc) = &digests.crc32 {
        bencode::insert(target, "crc32", bencode::string(crc));
    }
    if let Some(sha1) = digests.sha1 {
        bencode::insert(target, "sha1", bencode::bytes(sha1.to_vec()));
    }
}

fn file_name_of(path: &Path) -> Result<String, TorrentError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TorrentError::invalid(format!("no file name in {}", path.display())))
}

/// Collects all files under `root` using iterative depth-first traversal.
async fn collect_files_recursively(
    root: &Path,
    prefix: &[String],
) -> Result<Vec<InputFile>, TorrentError> {
    let mut files = Vec::new();
    let mut dirs_to_process = vec![root.to_path_buf()];

    while let Some(current_dir) = dirs_to_process.pop() {
        let mut entries = tokio::fs::read_dir(&current_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n.starts_with('.') || n.starts_with('~'));
            if hidden {
                continue;
            }

            if metadata.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|_| TorrentError::invalid("failed to create relative path"))?;
                let mut components = prefix.to_vec();
                components.extend(
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned()),
                );
                files.push(InputFile {
                    source: path,
                    path: components,
                    length: metadata.len(),
                });
            } else if metadata.is_dir() {
                dirs_to_process.push(path);
            }
        }
    }

    // Sort files for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn hash_inputs(
    inputs: &[InputFile],
    total: u64,
    piece_length: u64,
    flags: ChecksumFlags,
    cancel: &CancellationToken,
    progress: &dyn CreationProgress,
) -> Result<HashOutput, TorrentError> {
    let mut pieces = Vec::with_capacity(total.div_ceil(piece_length) as usize);
    let mut piece_hasher = Sha1::new();
    let mut in_piece = 0u64;
    let mut hashed = 0u64;
    let mut buffer = vec![0u8; READ_CHUNK.min(piece_length) as usize];
    let mut file_digests = Vec::with_capacity(inputs.len());

    for input in inputs {
        let mut file = std::fs::File::open(&input.source)?;
        let mut hashers = FileHashers::new(flags);
        let mut remaining = input.length;

        while remaining > 0 {
            if cancel.is_cancelled() {
                return Err(TorrentError::Cancelled);
            }
            let want = (buffer.len() as u64)
                .min(piece_length - in_piece)
                .min(remaining) as usize;
            file.read_exact(&mut buffer[..want])?;

            if cancel.is_cancelled() {
                return Err(TorrentError::Cancelled);
            }
            piece_hasher.update(&buffer[..want]);
            if flags.any() {
                hashers.update(&buffer[..want]);
            }

            in_piece += want as u64;
            remaining -= want as u64;
            hashed += want as u64;

            if in_piece == piece_length {
                pieces.push(piece_hasher.finalize_reset().into());
                in_piece = 0;
                progress.on_progress(hashed as f64 / total as f64);
            }
        }

        file_digests.push(hashers.finish());
        progress.on_file_complete(&input.source, &PathBuf::from_iter(&input.path));
    }

    if in_piece > 0 {
        pieces.push(piece_hasher.finalize().into());
    }
    progress.on_progress(1.0);

    Ok(HashOutput {
        pieces,
        file_digests,
    })
}
