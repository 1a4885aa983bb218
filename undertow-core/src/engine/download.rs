//! Per-torrent download state owned by the façade.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::EngineError;
use super::commands::CircuitAvailability;
use super::session::{AddFlags, AddTorrentParams, TorrentState, TorrentStatus};
use crate::config::DownloadDefaults;
use crate::torrent::{DownloadDef, InfoHash, TorrentDef};

/// Engine file priority for selected files.
const PRIORITY_NORMAL: u8 = 4;
/// Engine file priority for files being streamed.
pub const PRIORITY_HIGHEST: u8 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    #[default]
    Normal,
    /// Video-on-demand: sequential with priority on the streamed file.
    Vod,
}

/// When to stop seeding after a download completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedingMode {
    Never,
    Ratio,
    Time,
    #[default]
    Forever,
}

/// User-controlled settings of one download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub hops: u8,
    pub dest_dir: PathBuf,
    /// Files move here once the download completes.
    pub completed_dir: Option<PathBuf>,
    /// Indices of wanted files; empty selects everything.
    pub selected_files: BTreeSet<usize>,
    pub safe_seeding: bool,
    pub share_mode: bool,
    /// Only upload; used for metainfo fetches.
    pub upload_mode: bool,
    pub mode: DownloadMode,
    pub seeding_mode: SeedingMode,
    /// Ratio for `Ratio`, seconds for `Time`.
    pub seeding_target: f64,
    /// Unix timestamp.
    pub time_added: i64,
    /// Hidden downloads are omitted from listings and notifications.
    pub hidden: bool,
    pub checkpoint_disabled: bool,
    pub user_stopped: bool,
    /// Credit-mining priority hint.
    pub priority: u8,
    /// Share-mode target ratio passed to the engine.
    pub share_mode_target: Option<u32>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            hops: 0,
            dest_dir: PathBuf::new(),
            completed_dir: None,
            selected_files: BTreeSet::new(),
            safe_seeding: false,
            share_mode: false,
            upload_mode: false,
            mode: DownloadMode::Normal,
            seeding_mode: SeedingMode::Forever,
            seeding_target: 0.0,
            time_added: 0,
            hidden: false,
            checkpoint_disabled: false,
            user_stopped: false,
            priority: 0,
            share_mode_target: None,
        }
    }
}

impl DownloadConfig {
    /// Config built from the user's download defaults.
    pub fn from_defaults(defaults: &DownloadDefaults) -> Self {
        Self {
            hops: if defaults.anonymity_enabled {
                defaults.number_hops
            } else {
                0
            },
            safe_seeding: defaults.safeseeding_enabled,
            dest_dir: defaults.saveas.clone(),
            time_added: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Rejects configurations the engine cannot honour.
    ///
    /// # Errors
    /// - `EngineError::InvalidRequest` - empty destination
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.dest_dir.as_os_str().is_empty() {
            return Err(EngineError::invalid("destination directory is empty"));
        }
        Ok(())
    }
}

/// User-facing download status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    AllocatingDiskspace,
    WaitingForHashcheck,
    HashChecking,
    Downloading,
    Seeding,
    Stopped,
    StoppedOnError,
    Metadata,
    /// Anonymous download waiting for circuits.
    Circuits,
    /// Anonymous download with no exit nodes known.
    ExitNodes,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::AllocatingDiskspace => "ALLOCATING_DISKSPACE",
            DownloadStatus::WaitingForHashcheck => "WAITING_FOR_HASHCHECK",
            DownloadStatus::HashChecking => "HASH_CHECKING",
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Seeding => "SEEDING",
            DownloadStatus::Stopped => "STOPPED",
            DownloadStatus::StoppedOnError => "STOPPED_ON_ERROR",
            DownloadStatus::Metadata => "METADATA",
            DownloadStatus::Circuits => "CIRCUITS",
            DownloadStatus::ExitNodes => "EXIT_NODES",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            DownloadStatus::AllocatingDiskspace,
            DownloadStatus::WaitingForHashcheck,
            DownloadStatus::HashChecking,
            DownloadStatus::Downloading,
            DownloadStatus::Seeding,
            DownloadStatus::Stopped,
            DownloadStatus::StoppedOnError,
            DownloadStatus::Metadata,
            DownloadStatus::Circuits,
            DownloadStatus::ExitNodes,
        ]
        .into_iter()
        .find(|s| s.as_str() == value)
    }
}

/// Latest tracker response for one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStatus {
    pub peers: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub included: bool,
}

/// Immutable snapshot of a download, replaced on every update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadState {
    pub infohash: InfoHash,
    pub name: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub up_bps: u64,
    pub dn_bps: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub all_time_up: u64,
    pub all_time_down: u64,
    pub error: Option<String>,
    pub tracker_status: BTreeMap<String, TrackerStatus>,
    pub hops: u8,
    pub safe_seeding: bool,
    pub hidden: bool,
    pub total_size: u64,
    pub dest_dir: PathBuf,
    pub time_added: i64,
    pub files: Vec<FileSummary>,
    #[serde(skip)]
    pub pieces: Vec<bool>,
    #[serde(skip)]
    pub seeding_time_secs: u64,
}

/// Returns true when the seeding policy says to stop.
pub fn seeding_should_stop(
    mode: SeedingMode,
    target: f64,
    total_up: u64,
    total_down: u64,
    seeding_secs: u64,
) -> bool {
    match mode {
        SeedingMode::Never => true,
        SeedingMode::Ratio => {
            if total_down == 0 {
                return target <= 0.0;
            }
            total_up as f64 / total_down as f64 >= target
        }
        SeedingMode::Time => seeding_secs as f64 >= target,
        SeedingMode::Forever => false,
    }
}

/// One torrent tracked by the façade.
#[derive(Debug)]
pub struct Download {
    pub(crate) def: DownloadDef,
    pub(crate) config: DownloadConfig,
    pub(crate) handle_ready: bool,
    pub(crate) piece_ranges: Vec<Range<u64>>,
    pub(crate) tracker_status: BTreeMap<String, TrackerStatus>,
    pub(crate) last_status: Option<TorrentStatus>,
    pub(crate) resume_data: Option<Vec<u8>>,
    pub(crate) error: Option<String>,
}

impl Download {
    pub fn new(def: DownloadDef, config: DownloadConfig) -> Self {
        let mut download = Self {
            def,
            config,
            handle_ready: false,
            piece_ranges: Vec::new(),
            tracker_status: BTreeMap::new(),
            last_status: None,
            resume_data: None,
            error: None,
        };
        download.refresh_piece_ranges();
        download
    }

    pub fn infohash(&self) -> InfoHash {
        self.def.infohash()
    }

    pub fn def(&self) -> &DownloadDef {
        &self.def
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn is_hidden(&self) -> bool {
        self.config.hidden
    }

    /// Pieces overlapping file `index`, empty without metainfo.
    pub fn piece_range(&self, index: usize) -> Option<Range<u64>> {
        self.piece_ranges.get(index).cloned()
    }

    fn refresh_piece_ranges(&mut self) {
        self.piece_ranges = match &self.def {
            DownloadDef::Full(def) => (0..def.files().len())
                .filter_map(|i| def.piece_range_for_file(i))
                .collect(),
            DownloadDef::NoMetainfo(_) => Vec::new(),
        };
    }

    /// Replaces a metainfo-less definition with the full one.
    pub fn upgrade_metainfo(&mut self, def: TorrentDef) {
        self.def = DownloadDef::Full(def);
        self.refresh_piece_ranges();
        let file_count = self.def.files().len();
        self.config.selected_files.retain(|&i| i < file_count);
    }

    /// Engine priorities for every file honouring the selection.
    pub fn file_priorities(&self) -> Vec<u8> {
        let count = self.def.files().len();
        if self.config.selected_files.is_empty() {
            return vec![PRIORITY_NORMAL; count];
        }
        (0..count)
            .map(|i| {
                if self.config.selected_files.contains(&i) {
                    PRIORITY_NORMAL
                } else {
                    0
                }
            })
            .collect()
    }

    /// Parameters for adding this download to an engine session.
    pub fn add_params(&self) -> Result<AddTorrentParams, EngineError> {
        let metainfo = match &self.def {
            DownloadDef::Full(def) => Some(def.to_bytes()?),
            DownloadDef::NoMetainfo(_) => None,
        };
        Ok(AddTorrentParams {
            infohash: self.infohash(),
            name: self.def.name().to_string(),
            metainfo,
            trackers: self.def.trackers(),
            save_path: self.config.dest_dir.clone(),
            file_priorities: self.file_priorities(),
            resume_data: self.resume_data.clone(),
            flags: AddFlags {
                paused: self.config.user_stopped,
                upload_mode: self.config.upload_mode,
                share_mode: self.config.share_mode,
                seed_mode: false,
            },
        })
    }

    pub fn status(&self, availability: CircuitAvailability) -> DownloadStatus {
        if self.error.is_some() {
            return DownloadStatus::StoppedOnError;
        }
        let Some(status) = &self.last_status else {
            return match self.def {
                DownloadDef::NoMetainfo(_) => DownloadStatus::Metadata,
                DownloadDef::Full(_) if self.config.user_stopped => DownloadStatus::Stopped,
                DownloadDef::Full(_) => DownloadStatus::WaitingForHashcheck,
            };
        };
        if status.error.is_some() {
            return DownloadStatus::StoppedOnError;
        }
        if status.paused || self.config.user_stopped {
            return DownloadStatus::Stopped;
        }

        let base = match status.state {
            TorrentState::CheckingFiles | TorrentState::CheckingResumeData => {
                DownloadStatus::HashChecking
            }
            TorrentState::DownloadingMetadata => DownloadStatus::Metadata,
            TorrentState::Downloading => DownloadStatus::Downloading,
            TorrentState::Finished | TorrentState::Seeding => DownloadStatus::Seeding,
            TorrentState::Allocating => DownloadStatus::AllocatingDiskspace,
        };

        let active = matches!(
            base,
            DownloadStatus::Downloading | DownloadStatus::Metadata
        );
        if self.config.hops > 0 && active {
            match availability {
                CircuitAvailability::Building => return DownloadStatus::Circuits,
                CircuitAvailability::NoExits => return DownloadStatus::ExitNodes,
                CircuitAvailability::Ready => {}
            }
        }
        base
    }

    /// Snapshot for listings and monitors.
    pub fn state(&self, availability: CircuitAvailability) -> DownloadState {
        let status = self.last_status.as_ref();
        let files = self
            .def
            .files()
            .iter()
            .enumerate()
            .map(|(index, f)| FileSummary {
                index,
                name: f.path_string(),
                size: f.length,
                included: self.config.selected_files.is_empty()
                    || self.config.selected_files.contains(&index),
            })
            .collect();

        DownloadState {
            infohash: self.infohash(),
            name: self.def.name().to_string(),
            status: self.status(availability),
            progress: status.map(|s| s.progress).unwrap_or(0.0),
            up_bps: status.map(|s| s.upload_rate).unwrap_or(0),
            dn_bps: status.map(|s| s.download_rate).unwrap_or(0),
            num_peers: status.map(|s| s.num_peers).unwrap_or(0),
            num_seeds: status.map(|s| s.num_seeds).unwrap_or(0),
            all_time_up: status.map(|s| s.total_upload).unwrap_or(0),
            all_time_down: status.map(|s| s.total_download).unwrap_or(0),
            error: self
                .error
                .clone()
                .or_else(|| status.and_then(|s| s.error.clone())),
            tracker_status: self.tracker_status.clone(),
            hops: self.config.hops,
            safe_seeding: self.config.safe_seeding,
            hidden: self.config.hidden,
            total_size: self.def.total_size(),
            dest_dir: self.config.dest_dir.clone(),
            time_added: self.config.time_added,
            files,
            pieces: status.map(|s| s.pieces.clone()).unwrap_or_default(),
            seeding_time_secs: status.map(|s| s.seeding_time_secs).unwrap_or(0),
        }
    }

    /// True when the finished download should stop seeding now.
    pub fn should_stop_seeding(&self) -> bool {
        let Some(status) = &self.last_status else {
            return false;
        };
        if status.paused || self.config.user_stopped {
            return false;
        }
        if !matches!(status.state, TorrentState::Seeding | TorrentState::Finished) {
            return false;
        }
        seeding_should_stop(
            self.config.seeding_mode,
            self.config.seeding_target,
            status.total_upload,
            status.total_download,
            status.seeding_time_secs,
        )
    }
}
