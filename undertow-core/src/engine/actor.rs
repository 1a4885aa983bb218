//! Actor implementation for the download manager.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::commands::DownloadCommand;
use super::disk::{DiskSpace, SystemDiskSpace};
use super::handle::DownloadManagerHandle;
use super::manager::DownloadManager;
use super::session::SessionFactory;
use crate::config::UndertowConfig;
use crate::constants::ALERT_POLL_INTERVAL;
use crate::health::dht::DhtHealthManager;
use crate::notifications::Notifier;

/// Collaborators injected into the download manager.
#[derive(Clone)]
pub struct ManagerDeps {
    pub factory: Arc<dyn SessionFactory>,
    pub notifier: Notifier,
    pub disk: Arc<dyn DiskSpace>,
    /// Receives DHT packets for BEP-33 health estimates.
    pub dht_health: Option<Arc<DhtHealthManager>>,
}

impl ManagerDeps {
    /// Dependencies with a fresh notifier and the system disk probe.
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            notifier: Notifier::new(),
            disk: Arc::new(SystemDiskSpace),
            dht_health: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_disk(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_dht_health(mut self, dht_health: Arc<DhtHealthManager>) -> Self {
        self.dht_health = Some(dht_health);
        self
    }
}

/// Spawns the download manager actor and returns its handle.
///
/// The actor serializes every command with the once-per-second alert poll,
/// so download state is only ever touched from one task.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use undertow_core::config::UndertowConfig;
/// use undertow_core::engine::{
///     ManagerDeps, SimulatedSessionFactory, SimulatedSwarm, spawn_download_manager,
/// };
///
/// let factory = Arc::new(SimulatedSessionFactory::new(SimulatedSwarm::new()));
/// let handle = spawn_download_manager(UndertowConfig::default(), ManagerDeps::new(factory));
/// # }
/// ```
pub fn spawn_download_manager(config: UndertowConfig, deps: ManagerDeps) -> DownloadManagerHandle {
    let (sender, receiver) = mpsc::channel(100);
    let manager = DownloadManager::new(
        config,
        deps.factory,
        deps.notifier,
        deps.disk,
        deps.dht_health,
    );

    tokio::spawn(async move {
        run_actor_loop(manager, receiver).await;
    });

    DownloadManagerHandle::new(sender)
}

/// Processes commands and alert ticks until shutdown.
///
/// Dropping every handle shuts the manager down as if `Shutdown` was sent.
async fn run_actor_loop(mut manager: DownloadManager, mut receiver: mpsc::Receiver<DownloadCommand>) {
    tracing::debug!("Download manager actor started");

    let mut ticker = tokio::time::interval(ALERT_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(command) => {
                    if !handle_command(&mut manager, command).await {
                        break;
                    }
                }
                None => {
                    manager.shutdown().await;
                    break;
                }
            },
            _ = ticker.tick() => manager.tick(),
        }
    }

    tracing::debug!("Download manager actor stopped");
}

/// Handles a single command. Returns false once the actor should stop.
async fn handle_command(manager: &mut DownloadManager, command: DownloadCommand) -> bool {
    tracing::trace!("Download manager command: {}", command.name());
    match command {
        DownloadCommand::Start {
            def,
            config,
            resume_data,
            responder,
        } => {
            let result = manager.start_download(def, config, resume_data);
            let _ = responder.send(result);
        }

        DownloadCommand::Remove {
            infohash,
            remove_content,
            remove_checkpoint,
            responder,
        } => {
            manager.remove_download(infohash, remove_content, remove_checkpoint, responder);
        }

        DownloadCommand::Pause {
            infohash,
            responder,
        } => {
            let _ = responder.send(manager.pause(&infohash));
        }

        DownloadCommand::Resume {
            infohash,
            responder,
        } => {
            let _ = responder.send(manager.resume(&infohash));
        }

        DownloadCommand::ForceRecheck {
            infohash,
            responder,
        } => {
            let _ = responder.send(manager.force_recheck(&infohash));
        }

        DownloadCommand::MoveStorage {
            infohash,
            destination,
            responder,
        } => {
            let _ = responder.send(manager.move_storage(&infohash, destination));
        }

        DownloadCommand::SetSelectedFiles {
            infohash,
            selected,
            responder,
        } => {
            let _ = responder.send(manager.set_selected_files(&infohash, &selected));
        }

        DownloadCommand::SetCompletedDir {
            infohash,
            completed_dir,
            responder,
        } => {
            let _ = responder.send(manager.set_completed_dir(&infohash, completed_dir));
        }

        DownloadCommand::UpdateTrackers {
            infohash,
            trackers,
            responder,
        } => {
            let _ = responder.send(manager.update_trackers(&infohash, &trackers));
        }

        DownloadCommand::GetDownloads {
            include_hidden,
            responder,
        } => {
            let _ = responder.send(manager.downloads(include_hidden));
        }

        DownloadCommand::GetDownload {
            infohash,
            responder,
        } => {
            let _ = responder.send(manager.download_state(&infohash));
        }

        DownloadCommand::GetDownloadDef {
            infohash,
            responder,
        } => {
            let _ = responder.send(manager.download_def(&infohash));
        }

        DownloadCommand::GetPeers {
            infohash,
            responder,
        } => {
            let _ = responder.send(manager.peers(&infohash));
        }

        DownloadCommand::ConnectPeer {
            infohash,
            addr,
            responder,
        } => {
            let _ = responder.send(manager.connect_peer(&infohash, addr));
        }

        DownloadCommand::SaveResumeData {
            infohash,
            responder,
        } => {
            manager.save_resume_data(infohash, responder);
        }

        DownloadCommand::PrepareStream {
            infohash,
            file_index,
            responder,
        } => {
            let _ = responder.send(manager.prepare_stream(&infohash, file_index));
        }

        DownloadCommand::GetMetainfo {
            infohash,
            timeout,
            hops,
            url,
            responder,
        } => {
            manager.get_metainfo(infohash, timeout, hops, url, responder);
        }

        DownloadCommand::DhtScrape {
            infohash,
            responder,
        } => {
            manager.dht_scrape(&infohash);
            let _ = responder.send(Ok(()));
        }

        DownloadCommand::UpdateCircuitAvailability { hops, availability } => {
            manager.set_circuit_availability(hops, availability);
        }

        DownloadCommand::LoadCheckpoints { responder } => {
            let result = manager.load_checkpoints().await;
            let _ = responder.send(result);
        }

        DownloadCommand::GetCheckpointProgress { responder } => {
            let _ = responder.send(manager.checkpoint_progress());
        }

        DownloadCommand::Shutdown { responder } => {
            manager.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }
    true
}
