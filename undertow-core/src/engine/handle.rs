//! Handle for communicating with the download manager actor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::EngineError;
use super::commands::{CheckpointProgress, CircuitAvailability, DownloadCommand};
use super::download::{DownloadConfig, DownloadState};
use super::session::PeerInfo;
use super::stream::StreamTarget;
use crate::torrent::{DownloadDef, InfoHash, TorrentDef, parse_magnet};

/// Where a new download's metainfo comes from.
#[derive(Debug, Clone)]
pub enum DownloadSource {
    Def(DownloadDef),
    /// Path of a `.torrent` file.
    File(PathBuf),
    /// `magnet:`, `file:`, `http:` or `https:` URI.
    Uri(String),
    /// Raw bencoded metainfo.
    Bytes(Vec<u8>),
}

impl DownloadSource {
    /// Turns the source into a download definition, fetching remote metainfo.
    ///
    /// # Errors
    /// - `EngineError::Torrent` - metainfo or magnet link is invalid
    /// - `EngineError::MetainfoFetch` - HTTP download failed
    /// - `EngineError::InvalidRequest` - unsupported URI scheme
    pub async fn resolve(self) -> Result<DownloadDef, EngineError> {
        match self {
            DownloadSource::Def(def) => Ok(def),
            DownloadSource::File(path) => {
                let bytes = tokio::fs::read(&path).await?;
                Ok(DownloadDef::Full(TorrentDef::load_from_memory(&bytes)?))
            }
            DownloadSource::Bytes(bytes) => {
                Ok(DownloadDef::Full(TorrentDef::load_from_memory(&bytes)?))
            }
            DownloadSource::Uri(uri) => resolve_uri(&uri).await,
        }
    }
}

async fn resolve_uri(uri: &str) -> Result<DownloadDef, EngineError> {
    let scheme = uri.split_once(':').map(|(s, _)| s.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("magnet") => Ok(DownloadDef::NoMetainfo(parse_magnet(uri)?)),
        Some("file") => {
            let path = url::Url::parse(uri)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| EngineError::invalid(format!("bad file URI: {uri}")))?;
            Box::pin(DownloadSource::File(path).resolve()).await
        }
        Some("http") | Some("https") => {
            let fetch_error = |reason: String| EngineError::MetainfoFetch {
                url: uri.to_string(),
                reason,
            };
            let response = reqwest::get(uri)
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| fetch_error(e.to_string()))?;
            let body = response
                .bytes()
                .await
                .map_err(|e| fetch_error(e.to_string()))?;
            Ok(DownloadDef::Full(TorrentDef::load_from_memory(&body)?))
        }
        _ => Err(EngineError::invalid(format!("unsupported URI: {uri}"))),
    }
}

/// Handle for communicating with the download manager actor.
///
/// Cloneable and cheap; every method is one round trip to the actor.
#[derive(Clone)]
pub struct DownloadManagerHandle {
    sender: mpsc::Sender<DownloadCommand>,
}

impl DownloadManagerHandle {
    pub fn new(sender: mpsc::Sender<DownloadCommand>) -> Self {
        Self { sender }
    }

    /// True while the actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, command: DownloadCommand) -> Result<(), EngineError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| EngineError::ManagerShutdown)
    }

    /// Starts a download from any supported source.
    ///
    /// Returns as soon as the download is registered; the engine handle is
    /// created in the background. Starting a known infohash merges trackers.
    ///
    /// # Errors
    /// - `EngineError::InvalidRequest` - illegal config or unsupported source
    /// - `EngineError::LowStorage` - destination disk is nearly full
    /// - `EngineError::MetainfoFetch` - remote metainfo could not be fetched
    pub async fn start(
        &self,
        source: DownloadSource,
        config: DownloadConfig,
    ) -> Result<DownloadState, EngineError> {
        let def = source.resolve().await?;
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::Start {
            def,
            config,
            resume_data: None,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Removes a download once the engine has dropped its handle.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn remove(
        &self,
        infohash: InfoHash,
        remove_content: bool,
        remove_checkpoint: bool,
    ) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::Remove {
            infohash,
            remove_content,
            remove_checkpoint,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Stops a download on the user's request.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn pause(&self, infohash: InfoHash) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::Pause {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn resume(&self, infohash: InfoHash) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::Resume {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn force_recheck(&self, infohash: InfoHash) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::ForceRecheck {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn move_storage(
        &self,
        infohash: InfoHash,
        destination: PathBuf,
    ) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::MoveStorage {
            infohash,
            destination,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Restricts downloading to the given file indices; empty means all.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    /// - `EngineError::InvalidRequest` - index out of range
    pub async fn set_selected_files(
        &self,
        infohash: InfoHash,
        selected: Vec<usize>,
    ) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::SetSelectedFiles {
            infohash,
            selected,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn set_completed_dir(
        &self,
        infohash: InfoHash,
        completed_dir: Option<PathBuf>,
    ) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::SetCompletedDir {
            infohash,
            completed_dir,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Adds the trackers not yet known to the download.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn update_trackers(
        &self,
        infohash: InfoHash,
        trackers: Vec<String>,
    ) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::UpdateTrackers {
            infohash,
            trackers,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Moves a download to another anonymity level.
    ///
    /// Saves resume data, removes the download while keeping content and
    /// checkpoint, then starts it again with `hops`. Safe seeding follows
    /// the anonymity level.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn update_hops(&self, infohash: InfoHash, hops: u8) -> Result<DownloadState, EngineError> {
        let (def, mut config) = self.get_download_def(infohash).await?;
        if config.hops == hops {
            return self.get_download(infohash).await;
        }
        let resume_data = self.save_resume_data(infohash).await?;
        self.remove(infohash, false, false).await?;

        tracing::info!("Moving {} from {} to {} hops", infohash, config.hops, hops);
        config.hops = hops;
        if hops == 0 {
            config.safe_seeding = false;
        }
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::Start {
            def,
            config,
            resume_data,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Snapshots of all downloads, hidden ones only on request.
    pub async fn get_downloads(&self, include_hidden: bool) -> Result<Vec<DownloadState>, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::GetDownloads {
            include_hidden,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn get_download(&self, infohash: InfoHash) -> Result<DownloadState, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::GetDownload {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn get_download_def(
        &self,
        infohash: InfoHash,
    ) -> Result<(DownloadDef, DownloadConfig), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::GetDownloadDef {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn get_peers(&self, infohash: InfoHash) -> Result<Vec<PeerInfo>, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::GetPeers {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn connect_peer(&self, infohash: InfoHash, addr: SocketAddr) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::ConnectPeer {
            infohash,
            addr,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Fresh engine resume data, `None` if the engine could not produce it.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    pub async fn save_resume_data(&self, infohash: InfoHash) -> Result<Option<Vec<u8>>, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::SaveResumeData {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Prepares `file_index` for streaming and returns where to read it.
    ///
    /// # Errors
    /// - `EngineError::DownloadNotFound` - unknown infohash
    /// - `EngineError::InvalidRequest` - no metainfo yet or bad index
    pub async fn prepare_stream(
        &self,
        infohash: InfoHash,
        file_index: usize,
    ) -> Result<StreamTarget, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::PrepareStream {
            infohash,
            file_index,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Fetches metainfo for `infohash` from the swarm.
    ///
    /// Concurrent calls for one infohash share a single engine request.
    /// Dropping the future cancels only this caller's interest.
    ///
    /// # Errors
    /// - `EngineError::MetainfoTimeout` - nothing arrived within `timeout`
    pub async fn get_metainfo(
        &self,
        infohash: InfoHash,
        timeout: Duration,
        hops: u8,
        url: Option<String>,
    ) -> Result<TorrentDef, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::GetMetainfo {
            infohash,
            timeout,
            hops,
            url,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Sends a BEP-33 scrape for `infohash` into the DHT.
    pub async fn dht_scrape(&self, infohash: InfoHash) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::DhtScrape {
            infohash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    /// Reports tunnel readiness for downloads using `hops`.
    pub async fn update_circuit_availability(
        &self,
        hops: u8,
        availability: CircuitAvailability,
    ) -> Result<(), EngineError> {
        self.send(DownloadCommand::UpdateCircuitAvailability { hops, availability })
            .await
    }

    /// Restores downloads from the checkpoint directory.
    ///
    /// # Errors
    /// - `EngineError::Io` - checkpoint directory unreadable
    pub async fn load_checkpoints(&self) -> Result<CheckpointProgress, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::LoadCheckpoints { responder }).await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)?
    }

    pub async fn checkpoint_progress(&self) -> Result<CheckpointProgress, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::GetCheckpointProgress { responder })
            .await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)
    }

    /// Flushes state and stops the actor.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (responder, rx) = oneshot::channel();
        self.send(DownloadCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| EngineError::ManagerShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::torrent_def::test_support::single_file_metainfo;
    use crate::torrent::bencode;

    #[tokio::test]
    async fn test_resolve_magnet_uri() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=clip";
        let def = DownloadSource::Uri(uri.to_string()).resolve().await.unwrap();
        assert_eq!(def.name(), "clip");
        assert!(def.as_full().is_none());
    }

    #[tokio::test]
    async fn test_resolve_file_uri_and_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let bytes = bencode::encode(&single_file_metainfo("x.bin", 100, 64)).unwrap();
        let path = dir.path().join("x.torrent");
        std::fs::write(&path, &bytes).unwrap();

        let uri = url::Url::from_file_path(&path).unwrap().to_string();
        let from_uri = DownloadSource::Uri(uri).resolve().await.unwrap();
        let from_bytes = DownloadSource::Bytes(bytes).resolve().await.unwrap();
        assert_eq!(from_uri.infohash(), from_bytes.infohash());
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_scheme() {
        let result = DownloadSource::Uri("ftp://example.com/a.torrent".to_string())
            .resolve()
            .await;
        assert!(matches!(result, Err(EngineError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_closed_channel_reports_shutdown() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let handle = DownloadManagerHandle::new(sender);
        assert!(!handle.is_running());
        assert!(matches!(
            handle.get_downloads(false).await,
            Err(EngineError::ManagerShutdown)
        ));
    }
}
