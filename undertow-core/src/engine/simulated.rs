//! In-process engine binding.
//!
//! `SimulatedSession` fulfils the [`EngineSession`] contract without touching
//! the network: torrents progress a fixed step per status poll and alerts are
//! queued in emission order. A shared [`SimulatedSwarm`] lets callers decide
//! what the outside world knows (metadata, peers, DHT scrape replies) and
//! observe how often the façade talked to the engine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::alerts::{Alert, PacketDirection, SessionCounters};
use super::session::{
    AddTorrentParams, EngineSession, IpFilter, PeerInfo, SessionFactory, SessionSettings,
    TorrentState, TorrentStatus,
};
use crate::health::bloom::BloomFilter;
use crate::health::dht::{encode_scrape_query, encode_scrape_reply};
use crate::torrent::bencode;
use crate::torrent::{InfoHash, TorrentDef};

const DEFAULT_PROGRESS_STEP: f64 = 0.25;

#[derive(Debug, Default)]
struct SwarmState {
    /// Bencoded info dictionaries peers can hand out.
    metadata: HashMap<InfoHash, Vec<u8>>,
    peers: HashMap<InfoHash, Vec<PeerInfo>>,
    dht_scrapes: HashMap<InfoHash, (BloomFilter, BloomFilter)>,
    rejected: HashSet<InfoHash>,
    add_calls: HashMap<InfoHash, usize>,
    sequential: HashSet<InfoHash>,
    sessions_created: Vec<u8>,
    progress_step: Option<f64>,
    upload_per_tick: u64,
    dht_ready: bool,
    counters: SessionCounters,
    pending_alerts: HashMap<u8, Vec<Alert>>,
}

/// Shared view of the simulated outside world.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSwarm {
    inner: Arc<Mutex<SwarmState>>,
}

impl SimulatedSwarm {
    pub fn new() -> Self {
        let swarm = Self::default();
        swarm.inner.lock().dht_ready = true;
        swarm
    }

    /// Makes metadata for `def` available to metainfo-less downloads.
    pub fn publish_metadata(&self, def: &TorrentDef) {
        if let Ok(info) = bencode::encode(def.info()) {
            self.inner.lock().metadata.insert(def.infohash(), info);
        }
    }

    pub fn set_peers(&self, infohash: InfoHash, peers: Vec<PeerInfo>) {
        self.inner.lock().peers.insert(infohash, peers);
    }

    /// Answers BEP-33 scrapes for `infohash` with filters built from the addresses.
    pub fn set_dht_swarm(&self, infohash: InfoHash, seeders: &[IpAddr], peers: &[IpAddr]) {
        let mut seeds = BloomFilter::new();
        let mut downloaders = BloomFilter::new();
        for ip in seeders {
            seeds.insert_ip(*ip);
        }
        for ip in peers {
            downloaders.insert_ip(*ip);
        }
        self.inner
            .lock()
            .dht_scrapes
            .insert(infohash, (seeds, downloaders));
    }

    /// Adds of `infohash` fail with an engine error.
    pub fn reject(&self, infohash: InfoHash) {
        self.inner.lock().rejected.insert(infohash);
    }

    pub fn set_progress_step(&self, step: f64) {
        self.inner.lock().progress_step = Some(step);
    }

    pub fn set_upload_per_tick(&self, bytes: u64) {
        self.inner.lock().upload_per_tick = bytes;
    }

    pub fn set_dht_ready(&self, ready: bool) {
        self.inner.lock().dht_ready = ready;
    }

    pub fn set_disk_counters(&self, counters: SessionCounters) {
        self.inner.lock().counters = counters;
    }

    /// Queues an alert for the next poll of the session with `hops`.
    pub fn inject_alert(&self, hops: u8, alert: Alert) {
        self.inner
            .lock()
            .pending_alerts
            .entry(hops)
            .or_default()
            .push(alert);
    }

    /// Number of engine-side adds issued for `infohash`.
    pub fn add_calls(&self, infohash: &InfoHash) -> usize {
        self.inner.lock().add_calls.get(infohash).copied().unwrap_or(0)
    }

    /// True once the façade switched `infohash` to sequential download.
    pub fn is_sequential(&self, infohash: &InfoHash) -> bool {
        self.inner.lock().sequential.contains(infohash)
    }

    /// Hop counts of every session created so far, in creation order.
    pub fn sessions_created(&self) -> Vec<u8> {
        self.inner.lock().sessions_created.clone()
    }
}

#[derive(Debug)]
struct SimulatedTorrent {
    params: AddTorrentParams,
    status: TorrentStatus,
    piece_count: usize,
    finished_reported: bool,
}

impl SimulatedTorrent {
    fn has_metadata(&self) -> bool {
        self.params.metainfo.is_some()
    }

    fn sync_pieces(&mut self) {
        let have = (self.status.progress * self.piece_count as f64).floor() as usize;
        self.status.pieces = (0..self.piece_count).map(|i| i < have).collect();
    }
}

/// Engine session backed by [`SimulatedSwarm`].
pub struct SimulatedSession {
    hops: u8,
    settings: SessionSettings,
    filter: IpFilter,
    swarm: SimulatedSwarm,
    torrents: HashMap<InfoHash, SimulatedTorrent>,
    alerts: VecDeque<Alert>,
    routers: Vec<(String, u16)>,
    next_transaction: u16,
}

impl SimulatedSession {
    pub fn new(hops: u8, settings: SessionSettings, swarm: SimulatedSwarm) -> Self {
        Self {
            hops,
            settings,
            filter: IpFilter::AllowAll,
            swarm,
            torrents: HashMap::new(),
            alerts: VecDeque::new(),
            routers: Vec::new(),
            next_transaction: 0,
        }
    }

    fn progress_step(&self) -> f64 {
        self.swarm
            .inner
            .lock()
            .progress_step
            .unwrap_or(DEFAULT_PROGRESS_STEP)
    }

    /// Pulls metadata from the swarm for torrents still missing it.
    fn fetch_metadata(&mut self) {
        let available = self.swarm.inner.lock().metadata.clone();
        for (infohash, torrent) in self.torrents.iter_mut() {
            if torrent.has_metadata() {
                continue;
            }
            let Some(info) = available.get(infohash) else {
                continue;
            };
            let Ok(info_value) = bencode::decode(info) else {
                continue;
            };
            let metainfo = bencode::dict([("info", info_value)]);
            if let Ok(def) = TorrentDef::load_from_dict(metainfo) {
                torrent.piece_count = def.number_of_pieces() as usize;
                torrent.params.metainfo = def.to_bytes().ok();
                torrent.status.state = TorrentState::Downloading;
                torrent.sync_pieces();
                self.alerts.push_back(Alert::MetadataReceived {
                    infohash: *infohash,
                    info: info.clone(),
                });
            }
        }
    }
}

impl EngineSession for SimulatedSession {
    fn hops(&self) -> u8 {
        self.hops
    }

    fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn apply_settings(&mut self, settings: SessionSettings) {
        self.settings = settings;
    }

    fn set_ip_filter(&mut self, filter: IpFilter) {
        self.filter = filter;
    }

    fn ip_filter(&self) -> IpFilter {
        self.filter
    }

    fn add_torrent_async(&mut self, params: AddTorrentParams) {
        let infohash = params.infohash;
        let rejected = {
            let mut swarm = self.swarm.inner.lock();
            *swarm.add_calls.entry(infohash).or_default() += 1;
            swarm.rejected.contains(&infohash)
        };
        if rejected {
            self.alerts.push_back(Alert::AddTorrent {
                infohash,
                error: Some("simulated add failure".to_string()),
            });
            return;
        }

        let def = params
            .metainfo
            .as_deref()
            .and_then(|m| TorrentDef::load_from_memory(m).ok());
        let state = if def.is_some() {
            TorrentState::Downloading
        } else {
            TorrentState::DownloadingMetadata
        };
        let mut status = TorrentStatus::new(infohash, state);
        status.paused = params.flags.paused;
        let mut torrent = SimulatedTorrent {
            piece_count: def.map(|d| d.number_of_pieces() as usize).unwrap_or(0),
            params,
            status,
            finished_reported: false,
        };
        torrent.sync_pieces();
        self.torrents.insert(infohash, torrent);
        self.alerts.push_back(Alert::AddTorrent {
            infohash,
            error: None,
        });
    }

    fn find_torrent(&self, infohash: &InfoHash) -> bool {
        self.torrents.contains_key(infohash)
    }

    fn remove_torrent(&mut self, infohash: &InfoHash, delete_files: bool) {
        if let Some(torrent) = self.torrents.remove(infohash) {
            if delete_files {
                tracing::debug!(
                    "Simulated removal of files for {} under {}",
                    infohash,
                    torrent.params.save_path.display()
                );
            }
            self.alerts.push_back(Alert::TorrentRemoved {
                infohash: *infohash,
            });
        }
    }

    fn torrent_status(&self, infohash: &InfoHash) -> Option<TorrentStatus> {
        self.torrents.get(infohash).map(|t| t.status.clone())
    }

    fn replace_trackers(&mut self, infohash: &InfoHash, trackers: &[String]) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.params.trackers = trackers.to_vec();
        }
    }

    fn prioritize_files(&mut self, infohash: &InfoHash, priorities: &[u8]) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.params.file_priorities = priorities.to_vec();
        }
    }

    fn pause(&mut self, infohash: &InfoHash) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.status.paused = true;
        }
    }

    fn resume(&mut self, infohash: &InfoHash) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.status.paused = false;
        }
    }

    fn force_recheck(&mut self, infohash: &InfoHash) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.status.state = TorrentState::CheckingFiles;
        }
    }

    fn move_storage(&mut self, infohash: &InfoHash, destination: &Path) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.params.save_path = destination.to_path_buf();
        }
    }

    fn set_sequential_download(&mut self, infohash: &InfoHash, enabled: bool) {
        if !self.torrents.contains_key(infohash) {
            return;
        }
        let mut swarm = self.swarm.inner.lock();
        if enabled {
            swarm.sequential.insert(*infohash);
        } else {
            swarm.sequential.remove(infohash);
        }
    }

    fn set_upload_mode(&mut self, infohash: &InfoHash, enabled: bool) {
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.params.flags.upload_mode = enabled;
        }
    }

    fn peer_info(&self, infohash: &InfoHash) -> Vec<PeerInfo> {
        if !self.torrents.contains_key(infohash) {
            return Vec::new();
        }
        self.swarm
            .inner
            .lock()
            .peers
            .get(infohash)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| self.filter.allows(&p.addr))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn connect_peer(&mut self, infohash: &InfoHash, addr: SocketAddr) {
        if !self.filter.allows(&addr) {
            tracing::debug!("IP filter blocked {} for {}", addr, infohash);
            return;
        }
        if let Some(torrent) = self.torrents.get_mut(infohash) {
            torrent.status.num_peers += 1;
        }
    }

    fn save_resume_data(&mut self, infohash: &InfoHash) {
        let alert = match self.torrents.get(infohash) {
            Some(torrent) => {
                let resume = bencode::dict([
                    ("info-hash", bencode::bytes(infohash.as_bytes().to_vec())),
                    ("save_path", bencode::string(&torrent.params.save_path.to_string_lossy())),
                    (
                        "progress",
                        bencode::int((torrent.status.progress * 1000.0) as i64),
                    ),
                ]);
                match bencode::encode(&resume) {
                    Ok(resume_data) => Alert::SaveResumeData {
                        infohash: *infohash,
                        resume_data,
                    },
                    Err(e) => Alert::SaveResumeDataFailed {
                        infohash: *infohash,
                        message: e.to_string(),
                    },
                }
            }
            None => Alert::SaveResumeDataFailed {
                infohash: *infohash,
                message: "invalid torrent handle".to_string(),
            },
        };
        self.alerts.push_back(alert);
    }

    fn pop_alerts(&mut self) -> Vec<Alert> {
        let injected = self
            .swarm
            .inner
            .lock()
            .pending_alerts
            .remove(&self.hops)
            .unwrap_or_default();
        self.alerts.extend(injected);
        self.alerts.drain(..).collect()
    }

    fn post_torrent_updates(&mut self) {
        self.fetch_metadata();
        let step = self.progress_step();
        let upload = self.swarm.inner.lock().upload_per_tick;

        let mut statuses = Vec::with_capacity(self.torrents.len());
        for torrent in self.torrents.values_mut() {
            let status = &mut torrent.status;
            if status.state == TorrentState::CheckingFiles {
                status.state = if status.progress >= 1.0 {
                    TorrentState::Seeding
                } else {
                    TorrentState::Downloading
                };
            } else if !status.paused && !torrent.params.flags.upload_mode {
                match status.state {
                    TorrentState::Downloading => {
                        status.progress = (status.progress + step).min(1.0);
                        status.download_rate = 1024;
                        status.total_download += 1024;
                        if status.progress >= 1.0 {
                            status.state = TorrentState::Seeding;
                            status.download_rate = 0;
                        }
                    }
                    TorrentState::Seeding | TorrentState::Finished => {
                        status.seeding_time_secs += 1;
                        status.upload_rate = upload;
                        status.total_upload += upload;
                    }
                    _ => {}
                }
            }
            torrent.sync_pieces();
            if torrent.status.state == TorrentState::Seeding && !torrent.finished_reported {
                torrent.finished_reported = true;
                self.alerts.push_back(Alert::TorrentFinished {
                    infohash: torrent.status.infohash,
                });
            }
            statuses.push(torrent.status.clone());
        }
        self.alerts.push_back(Alert::StateUpdate { statuses });
    }

    fn post_session_stats(&mut self) {
        let counters = self.swarm.inner.lock().counters;
        self.alerts.push_back(Alert::SessionStats { counters });
    }

    fn dht_is_ready(&self) -> bool {
        self.swarm.inner.lock().dht_ready
    }

    fn dht_get_peers(&mut self, infohash: &InfoHash, scrape: bool) {
        self.next_transaction = self.next_transaction.wrapping_add(1);
        let transaction = self.next_transaction.to_be_bytes();
        let node = SocketAddr::from(([127, 0, 0, 1], 6881));
        self.alerts.push_back(Alert::DhtPacket {
            direction: PacketDirection::Outgoing,
            node,
            packet: encode_scrape_query(&transaction, infohash, scrape),
        });
        if !scrape {
            return;
        }
        let reply = self.swarm.inner.lock().dht_scrapes.get(infohash).cloned();
        if let Some((seeds, peers)) = reply {
            self.alerts.push_back(Alert::DhtPacket {
                direction: PacketDirection::Incoming,
                node,
                packet: encode_scrape_reply(&transaction, &seeds, &peers),
            });
        }
    }

    fn add_dht_router(&mut self, host: &str, port: u16) {
        self.routers.push((host.to_string(), port));
    }

    fn save_state(&self) -> Vec<u8> {
        let routers = self
            .routers
            .iter()
            .map(|(host, port)| bencode::string(&format!("{host}:{port}")))
            .collect();
        let state = bencode::dict([
            ("hops", bencode::int(i64::from(self.hops))),
            ("dht routers", bencode::Value::List(routers)),
            ("listen_interfaces", bencode::string(&self.settings.listen_interfaces)),
        ]);
        bencode::encode(&state).unwrap_or_default()
    }

    fn load_state(&mut self, state: &[u8]) {
        let Ok(value) = bencode::decode(state) else {
            tracing::warn!("Ignoring unreadable engine state");
            return;
        };
        let routers = bencode::get_list(&value, "dht routers").unwrap_or_default();
        for entry in bencode::string_list(routers) {
            let Some((host, port)) = entry.rsplit_once(':') else {
                continue;
            };
            let Ok(port) = port.parse() else {
                continue;
            };
            if !self.routers.iter().any(|(h, p)| h == host && *p == port) {
                self.routers.push((host.to_string(), port));
            }
        }
    }
}

/// Creates [`SimulatedSession`]s sharing one swarm.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSessionFactory {
    swarm: SimulatedSwarm,
}

impl SimulatedSessionFactory {
    pub fn new(swarm: SimulatedSwarm) -> Self {
        Self { swarm }
    }

    pub fn swarm(&self) -> &SimulatedSwarm {
        &self.swarm
    }
}

impl SessionFactory for SimulatedSessionFactory {
    fn create(&self, hops: u8, settings: SessionSettings) -> Box<dyn EngineSession> {
        self.swarm.inner.lock().sessions_created.push(hops);
        Box::new(SimulatedSession::new(hops, settings, self.swarm.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LibtorrentConfig;
    use crate::engine::session::AddFlags;
    use crate::torrent::torrent_def::test_support::single_file_metainfo;

    fn session(swarm: &SimulatedSwarm) -> SimulatedSession {
        SimulatedSession::new(
            0,
            SessionSettings::for_hops(0, &LibtorrentConfig::default()),
            swarm.clone(),
        )
    }

    fn params(def: Option<&TorrentDef>, infohash: InfoHash) -> AddTorrentParams {
        AddTorrentParams {
            infohash,
            name: "sim".to_string(),
            metainfo: def.map(|d| d.to_bytes().unwrap()),
            trackers: Vec::new(),
            save_path: "/tmp".into(),
            file_priorities: Vec::new(),
            resume_data: None,
            flags: AddFlags::default(),
        }
    }

    #[test]
    fn test_download_progresses_to_finished() {
        let swarm = SimulatedSwarm::new();
        swarm.set_progress_step(0.5);
        let mut session = session(&swarm);
        let def = TorrentDef::load_from_dict(single_file_metainfo("a.bin", 4096, 1024)).unwrap();

        session.add_torrent_async(params(Some(&def), def.infohash()));
        session.post_torrent_updates();
        session.post_torrent_updates();
        let alerts = session.pop_alerts();

        assert!(matches!(alerts[0], Alert::AddTorrent { error: None, .. }));
        assert!(
            alerts
                .iter()
                .any(|a| matches!(a, Alert::TorrentFinished { infohash } if *infohash == def.infohash()))
        );
        let status = session.torrent_status(&def.infohash()).unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(status.pieces, vec![true; 4]);
        assert_eq!(swarm.add_calls(&def.infohash()), 1);
    }

    #[test]
    fn test_metadata_arrives_from_swarm() {
        let swarm = SimulatedSwarm::new();
        let mut session = session(&swarm);
        let def = TorrentDef::load_from_dict(single_file_metainfo("b.bin", 2048, 1024)).unwrap();

        session.add_torrent_async(params(None, def.infohash()));
        session.post_torrent_updates();
        assert!(
            !session
                .pop_alerts()
                .iter()
                .any(|a| matches!(a, Alert::MetadataReceived { .. }))
        );

        swarm.publish_metadata(&def);
        session.post_torrent_updates();
        let alerts = session.pop_alerts();
        let info = alerts
            .iter()
            .find_map(|a| match a {
                Alert::MetadataReceived { info, .. } => Some(info.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(bencode::decode(&info).unwrap(), *def.info());
    }

    #[test]
    fn test_resume_data_for_unknown_torrent_fails() {
        let swarm = SimulatedSwarm::new();
        let mut session = session(&swarm);
        session.save_resume_data(&InfoHash::new([1; 20]));
        assert!(matches!(
            session.pop_alerts().as_slice(),
            [Alert::SaveResumeDataFailed { .. }]
        ));
    }

    #[test]
    fn test_rejected_add_reports_error() {
        let swarm = SimulatedSwarm::new();
        let infohash = InfoHash::new([2; 20]);
        swarm.reject(infohash);
        let mut session = session(&swarm);
        session.add_torrent_async(params(None, infohash));
        assert!(!session.find_torrent(&infohash));
        assert!(matches!(
            session.pop_alerts().as_slice(),
            [Alert::AddTorrent { error: Some(_), .. }]
        ));
    }
}
