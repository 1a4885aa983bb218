//! Download checkpoints persisted under `<state>/dlcheckpoints/`.
//!
//! One bencoded `<hex(infohash)>.conf` per download. Writes go to a
//! temporary file first and are renamed into place.

use std::path::{Path, PathBuf};

use super::EngineError;
use super::download::{Download, DownloadConfig, DownloadStatus};
use crate::constants::RESUME_FILE_FORMAT;
use crate::torrent::bencode::{self, Value};
use crate::torrent::magnet::parse_magnet;
use crate::torrent::{DownloadDef, InfoHash, TorrentDef, TorrentDefNoMetainfo};

const FILE_VERSION: i64 = 1;
const EXTENSION: &str = "conf";

/// Metainfo section of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointMetainfo {
    Full(Value),
    Partial {
        name: String,
        url: Option<String>,
    },
}

/// Everything needed to restart a download after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub infohash: InfoHash,
    pub metainfo: CheckpointMetainfo,
    pub config: DownloadConfig,
    pub status: DownloadStatus,
    pub progress: f64,
    pub user_stopped: bool,
    /// Engine resume data, opaque to the façade.
    pub resume_data: Option<Vec<u8>>,
}

impl Checkpoint {
    pub fn from_download(download: &Download, status: DownloadStatus) -> Self {
        let metainfo = match download.def() {
            DownloadDef::Full(def) => CheckpointMetainfo::Full(def.metainfo().clone()),
            DownloadDef::NoMetainfo(def) => CheckpointMetainfo::Partial {
                name: def.name.clone(),
                url: def.url.clone(),
            },
        };
        Self {
            infohash: download.infohash(),
            metainfo,
            config: download.config().clone(),
            status,
            progress: download
                .last_status
                .as_ref()
                .map(|s| s.progress)
                .unwrap_or(0.0),
            user_stopped: download.config().user_stopped,
            resume_data: download.resume_data.clone(),
        }
    }

    /// Rebuilds the download definition stored in the checkpoint.
    ///
    /// # Errors
    /// - `EngineError::Torrent` - stored metainfo no longer validates
    pub fn download_def(&self) -> Result<DownloadDef, EngineError> {
        Ok(match &self.metainfo {
            CheckpointMetainfo::Full(value) => {
                DownloadDef::Full(TorrentDef::load_from_dict(value.clone())?)
            }
            CheckpointMetainfo::Partial { name, url } => {
                let trackers = url
                    .as_deref()
                    .filter(|u| u.starts_with("magnet:"))
                    .and_then(|u| parse_magnet(u).ok())
                    .map(|m| m.trackers)
                    .unwrap_or_default();
                DownloadDef::NoMetainfo(TorrentDefNoMetainfo {
                    infohash: self.infohash,
                    name: name.clone(),
                    url: url.clone(),
                    trackers,
                })
            }
        })
    }

    /// # Errors
    /// - `EngineError::Checkpoint` - config could not be serialized
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let meta_info = match &self.metainfo {
            CheckpointMetainfo::Full(value) => value.clone(),
            CheckpointMetainfo::Partial { name, url } => {
                let mut partial = bencode::dict([
                    ("infohash", bencode::bytes(self.infohash.as_bytes().to_vec())),
                    ("name", bencode::string(name)),
                ]);
                if let Some(url) = url {
                    bencode::insert(&mut partial, "url", bencode::string(url));
                }
                partial
            }
        };

        let config = serde_json::to_string(&self.config).map_err(|e| EngineError::Checkpoint {
            reason: e.to_string(),
        })?;

        let mut root = bencode::dict([
            ("file-format", bencode::string(RESUME_FILE_FORMAT)),
            ("file-version", bencode::int(FILE_VERSION)),
            ("info-hash", bencode::bytes(self.infohash.as_bytes().to_vec())),
            (
                "state",
                bencode::dict([
                    ("meta_info", meta_info),
                    (
                        "download",
                        bencode::dict([
                            ("status", bencode::string(self.status.as_str())),
                            ("progress", bencode::string(&self.progress.to_string())),
                        ]),
                    ),
                    ("user_stopped", bencode::int(i64::from(self.user_stopped))),
                ]),
            ),
            ("download_config", bencode::string(&config)),
        ]);
        if let CheckpointMetainfo::Partial { url: Some(url), .. } = &self.metainfo {
            bencode::insert(&mut root, "url", bencode::string(url));
        }
        if let Some(resume) = &self.resume_data {
            bencode::insert(&mut root, "resume_data", bencode::bytes(resume.clone()));
        }
        Ok(bencode::encode(&root)?)
    }

    /// # Errors
    /// - `EngineError::Checkpoint` - wrong format, missing or non-dict metainfo
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let broken = |reason: &str| EngineError::Checkpoint {
            reason: reason.to_string(),
        };

        let root = bencode::decode(bytes)?;
        if bencode::get_str(&root, "file-format").as_deref() != Some(RESUME_FILE_FORMAT) {
            return Err(broken("unknown file format"));
        }
        let infohash = bencode::get_bytes(&root, "info-hash")
            .and_then(InfoHash::from_slice)
            .ok_or_else(|| broken("missing info-hash"))?;

        let state = bencode::get(&root, "state").ok_or_else(|| broken("missing state"))?;
        let meta_info = bencode::get(state, "meta_info").ok_or_else(|| broken("missing metainfo"))?;
        if bencode::as_dict(meta_info).is_none() {
            return Err(broken("metainfo is not a dictionary"));
        }
        let metainfo = if bencode::get(meta_info, "info").is_some() {
            CheckpointMetainfo::Full(meta_info.clone())
        } else {
            CheckpointMetainfo::Partial {
                name: bencode::get_str(meta_info, "name").unwrap_or_else(|| infohash.to_hex()),
                url: bencode::get_str(meta_info, "url"),
            }
        };

        let download = bencode::get(state, "download");
        let status = download
            .and_then(|d| bencode::get_str(d, "status"))
            .and_then(|s| DownloadStatus::parse(&s))
            .unwrap_or(DownloadStatus::Stopped);
        let progress = download
            .and_then(|d| bencode::get_str(d, "progress"))
            .and_then(|p| p.parse().ok())
            .unwrap_or(0.0);
        let user_stopped = bencode::get_int(state, "user_stopped").unwrap_or(0) != 0;

        let config = match bencode::get_str(&root, "download_config") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| EngineError::Checkpoint {
                reason: e.to_string(),
            })?,
            None => DownloadConfig::default(),
        };

        Ok(Self {
            infohash,
            metainfo,
            config,
            status,
            progress,
            user_stopped,
            resume_data: bencode::get_bytes(&root, "resume_data").map(<[u8]>::to_vec),
        })
    }
}

/// Directory of checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, infohash: &InfoHash) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", infohash.to_hex()))
    }

    /// Writes a checkpoint atomically.
    ///
    /// # Errors
    /// - `EngineError::Io` - directory or file could not be written
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&checkpoint.infohash);
        let tmp = path.with_extension("conf.tmp");
        std::fs::write(&tmp, checkpoint.to_bytes()?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!("Checkpointed {} to {}", checkpoint.infohash, path.display());
        Ok(())
    }

    /// # Errors
    /// - `EngineError::Io` / `Checkpoint` - unreadable or malformed file
    pub fn load(&self, infohash: &InfoHash) -> Result<Option<Checkpoint>, EngineError> {
        let path = self.path_for(infohash);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_file(&path).map(Some)
    }

    /// # Errors
    /// - `EngineError::Io` / `Checkpoint` - unreadable or malformed file
    pub fn load_file(path: &Path) -> Result<Checkpoint, EngineError> {
        let bytes = std::fs::read(path)?;
        Checkpoint::from_bytes(&bytes)
    }

    /// Deletes the checkpoint if present.
    ///
    /// # Errors
    /// - `EngineError::Io` - file exists but could not be removed
    pub fn remove(&self, infohash: &InfoHash) -> Result<(), EngineError> {
        match std::fs::remove_file(self.path_for(infohash)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// All checkpoint files, sorted by name.
    ///
    /// # Errors
    /// - `EngineError::Io` - directory exists but cannot be listed
    pub fn list(&self) -> Result<Vec<PathBuf>, EngineError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == EXTENSION))
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::torrent::torrent_def::test_support::single_file_metainfo;

    fn sample_download() -> Download {
        let def = TorrentDef::load_from_dict(single_file_metainfo("movie.mkv", 5000, 1024)).unwrap();
        let mut download = Download::new(
            DownloadDef::Full(def),
            DownloadConfig {
                hops: 2,
                safe_seeding: true,
                dest_dir: PathBuf::from("/data/movies"),
                selected_files: [0].into_iter().collect(),
                ..Default::default()
            },
        );
        download.resume_data = Some(b"d4:testi1ee".to_vec());
        download
    }

    #[test]
    fn test_save_then_load_preserves_download_identity() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("dlcheckpoints"));
        let download = sample_download();

        store
            .save(&Checkpoint::from_download(&download, DownloadStatus::Downloading))
            .unwrap();
        let loaded = store.load(&download.infohash()).unwrap().unwrap();

        assert_eq!(loaded.infohash, download.infohash());
        assert_eq!(loaded.config.dest_dir, PathBuf::from("/data/movies"));
        assert_eq!(loaded.config.hops, 2);
        assert_eq!(loaded.config.selected_files, download.config().selected_files);
        assert_eq!(loaded.status, DownloadStatus::Downloading);
        assert_eq!(loaded.resume_data, download.resume_data);
        assert_eq!(loaded.download_def().unwrap().infohash(), download.infohash());
    }

    #[test]
    fn test_partial_metainfo_round_trip() {
        let infohash = InfoHash::new([9; 20]);
        let checkpoint = Checkpoint {
            infohash,
            metainfo: CheckpointMetainfo::Partial {
                name: "pending".to_string(),
                url: Some("magnet:?xt=urn:btih:0909".to_string()),
            },
            config: DownloadConfig::default(),
            status: DownloadStatus::Metadata,
            progress: 0.0,
            user_stopped: true,
            resume_data: None,
        };
        let parsed = Checkpoint::from_bytes(&checkpoint.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[test]
    fn test_rejects_missing_or_non_dict_metainfo() {
        let no_meta = bencode::dict([
            ("file-format", bencode::string(RESUME_FILE_FORMAT)),
            ("info-hash", bencode::bytes(vec![1u8; 20])),
            ("state", bencode::dict([("user_stopped", bencode::int(0))])),
        ]);
        let bytes = bencode::encode(&no_meta).unwrap();
        assert!(matches!(
            Checkpoint::from_bytes(&bytes),
            Err(EngineError::Checkpoint { .. })
        ));

        let non_dict = bencode::dict([
            ("file-format", bencode::string(RESUME_FILE_FORMAT)),
            ("info-hash", bencode::bytes(vec![1u8; 20])),
            ("state", bencode::dict([("meta_info", bencode::int(3))])),
        ]);
        let bytes = bencode::encode(&non_dict).unwrap();
        assert!(Checkpoint::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_list_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let download = sample_download();
        store
            .save(&Checkpoint::from_download(&download, DownloadStatus::Stopped))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(store.list().unwrap(), vec![store.path_for(&download.infohash())]);
        store.remove(&download.infohash()).unwrap();
        store.remove(&download.infohash()).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
