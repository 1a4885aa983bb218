//! Tunnel community: circuits this node initiates, circuits it relays or
//! exits for, and the hidden-service roles it plays.
//!
//! All state lives in [`TunnelCommunity`] and is only touched by the
//! community actor. Protocol violations from peers are counted in
//! [`TunnelStats::dropped_cells`] and never propagate further.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::admission::{Competition, SlotAllocator};
use super::cells::{Cell, Cookie, Datagram, LAYER_CELL, LAYER_RELAY, cell_layer, relay_layer};
use super::circuit::{Circuit, CircuitInfo, CircuitState, CircuitType, RelayRoute, RouteDirection};
use super::crypto::{DhKeyPair, NodeIdentity, SessionKeys};
use super::endpoint::Endpoint;
use super::exit::{ExitPacket, ExitSocket};
use super::hidden::{IntroPointInfo, ServiceDirectory, VirtualPeers, lookup_info_hash};
use super::ledger::{Ledger, LedgerBlock, LedgerError};
use super::payout::{forward_amount, initial_payout};
use super::{PeerRef, TunnelError, TunnelStats};
use crate::config::TunnelConfig;
use crate::constants::DATA_CIRCUITS_PER_HOP_COUNT;
use crate::engine::{CircuitAvailability, DownloadState, DownloadStatus};
use crate::notifications::{Notification, Notifier};
use crate::torrent::InfoHash;

const REASON_SHUTDOWN: u16 = 0;
const REASON_NO_SLOTS: u16 = 1;
const REASON_EVICTED: u16 = 2;
const REASON_TIMEOUT: u16 = 3;
const REASON_REMOVED: u16 = 4;
const REASON_INTEGRITY: u16 = 5;

const UNSPECIFIED: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Events published to local consumers of the tunnel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    CircuitReady { circuit_id: u32, ctype: CircuitType },
    CircuitRemoved { circuit_id: u32 },
    /// Payload that came back on a local circuit.
    Data {
        circuit_id: u32,
        origin: SocketAddr,
        payload: Bytes,
    },
    /// An introduction point for a seeded torrent was announced.
    ServiceAnnounced { infohash: InfoHash, intro: IntroPointInfo },
    /// A hidden-service link is up; `addr` is its virtual peer address.
    PeerConnected {
        infohash: InfoHash,
        circuit_id: u32,
        addr: SocketAddr,
    },
}

/// The parts of a download snapshot the monitor looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredDownload {
    pub infohash: InfoHash,
    pub hops: u8,
    pub status: DownloadStatus,
}

impl From<&DownloadState> for MonitoredDownload {
    fn from(state: &DownloadState) -> Self {
        Self {
            infohash: state.infohash,
            hops: state.hops,
            status: state.status,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NextHop {
    circuit_id: u32,
    addr: SocketAddr,
    public_key: [u8; 32],
}

/// A circuit this node relays or terminates.
#[derive(Debug)]
struct JoinedCircuit {
    prev: SocketAddr,
    keys: SessionKeys,
    next: Option<NextHop>,
}

#[derive(Debug)]
struct PendingAdmission {
    prev: SocketAddr,
    keys: SessionKeys,
    dh_public: [u8; 32],
    deadline: Instant,
}

/// `create` sent to the next hop on behalf of an initiator.
#[derive(Debug)]
struct PendingExtend {
    circuit_id: u32,
    next: NextHop,
    deadline: Instant,
}

/// Downloader-side progress of one hidden-swarm join.
#[derive(Debug)]
struct PendingJoin {
    infohash: InfoHash,
    hops: u8,
    intros: Vec<IntroPointInfo>,
    rendezvous: Option<PeerRef>,
}

pub struct TunnelCommunity {
    config: TunnelConfig,
    endpoint: Arc<dyn Endpoint>,
    ledger: Ledger,
    notifier: Notifier,
    events: broadcast::Sender<TunnelEvent>,
    directory: Option<Arc<dyn ServiceDirectory>>,
    peers: HashMap<SocketAddr, PeerRef>,
    stats: TunnelStats,

    circuits: HashMap<u32, Circuit>,

    joined: HashMap<u32, JoinedCircuit>,
    routes: HashMap<u32, RelayRoute>,
    pending_admissions: HashMap<u32, PendingAdmission>,
    pending_extends: HashMap<u32, PendingExtend>,
    slots: SlotAllocator,
    exits: HashMap<u32, ExitSocket>,
    exit_tx: mpsc::Sender<ExitPacket>,
    exit_rx: Option<mpsc::Receiver<ExitPacket>>,

    // Roles played for other nodes' hidden services.
    intro_points: HashMap<InfoHash, Vec<u32>>,
    rendezvous_points: HashMap<Cookie, u32>,
    e2e_links: HashMap<u32, u32>,

    // Hidden services of our own downloads.
    services: HashMap<InfoHash, InfoHash>,
    announced: HashMap<u32, (InfoHash, IntroPointInfo)>,
    joins: HashMap<Cookie, PendingJoin>,
    introductions: HashMap<u32, Cookie>,
    virtual_peers: VirtualPeers,
    last_lookup: HashMap<InfoHash, Instant>,
    availability: HashMap<u8, CircuitAvailability>,
}

impl TunnelCommunity {
    pub fn new(
        config: TunnelConfig,
        endpoint: Arc<dyn Endpoint>,
        identity: NodeIdentity,
        notifier: Notifier,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(1024);
        Self {
            slots: SlotAllocator::new(config.random_slots, config.competing_slots),
            config,
            endpoint,
            ledger: Ledger::new(identity),
            notifier,
            events,
            directory: None,
            peers: HashMap::new(),
            stats: TunnelStats::default(),
            circuits: HashMap::new(),
            joined: HashMap::new(),
            routes: HashMap::new(),
            pending_admissions: HashMap::new(),
            pending_extends: HashMap::new(),
            exits: HashMap::new(),
            exit_tx,
            exit_rx: Some(exit_rx),
            intro_points: HashMap::new(),
            rendezvous_points: HashMap::new(),
            e2e_links: HashMap::new(),
            services: HashMap::new(),
            announced: HashMap::new(),
            joins: HashMap::new(),
            introductions: HashMap::new(),
            virtual_peers: VirtualPeers::new(),
            last_lookup: HashMap::new(),
            availability: HashMap::new(),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn ServiceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Receiver for exit-socket traffic; the actor takes it once.
    pub fn take_exit_receiver(&mut self) -> Option<mpsc::Receiver<ExitPacket>> {
        self.exit_rx.take()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.ledger.public_key()
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    pub fn circuits(&self) -> Vec<CircuitInfo> {
        let mut circuits: Vec<CircuitInfo> = self.circuits.values().map(CircuitInfo::from).collect();
        circuits.sort_by_key(|c| c.circuit_id);
        circuits
    }

    pub fn joined_count(&self) -> usize {
        self.joined.len()
    }

    pub fn add_peer(&mut self, peer: PeerRef) {
        if peer.addr != self.local_addr() {
            self.peers.insert(peer.addr, peer);
        }
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn circuit_event(&self, circuit_id: u32, event: &str) {
        self.notifier.notify(Notification::CircuitEvent {
            circuit_id,
            event: event.to_string(),
        });
    }

    async fn send(&self, addr: SocketAddr, datagram: Datagram) -> Result<(), TunnelError> {
        self.endpoint.send_to(addr, &datagram.encode()).await
    }

    async fn send_plain(&self, addr: SocketAddr, circuit_id: u32, cell: Cell) -> Result<(), TunnelError> {
        self.send(addr, Datagram::Plain { circuit_id, cell }).await
    }

    /// Sends `cell` from this hop back towards the initiator of a joined circuit.
    async fn send_backward(&self, circuit_id: u32, cell: &Cell) -> Result<(), TunnelError> {
        let joined = self
            .joined
            .get(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        let body = joined.keys.seal_backward(&cell_layer(cell))?;
        self.send(
            joined.prev,
            Datagram::Onion {
                circuit_id,
                body: body.into(),
            },
        )
        .await
    }

    /// Sends `cell` to hop `target` of a local circuit.
    async fn send_forward(&self, circuit_id: u32, target: usize, cell: &Cell) -> Result<(), TunnelError> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        let first = circuit
            .hops
            .first()
            .map(|hop| hop.peer.addr)
            .ok_or(TunnelError::CircuitNotReady { circuit_id })?;
        let body = circuit.wrap_forward(target, cell)?;
        self.send(
            first,
            Datagram::Onion {
                circuit_id,
                body: body.into(),
            },
        )
        .await
    }

    /// Sends `cell` to the last hop of a local circuit.
    async fn send_to_end(&self, circuit_id: u32, cell: &Cell) -> Result<(), TunnelError> {
        let target = self
            .circuits
            .get(&circuit_id)
            .and_then(|c| c.hops.len().checked_sub(1))
            .ok_or(TunnelError::CircuitNotReady { circuit_id })?;
        self.send_forward(circuit_id, target, cell).await
    }

    fn fresh_circuit_id(&self) -> u32 {
        loop {
            let circuit_id: u32 = rand::random();
            if circuit_id != 0
                && !self.circuits.contains_key(&circuit_id)
                && !self.joined.contains_key(&circuit_id)
                && !self.routes.contains_key(&circuit_id)
                && !self.pending_admissions.contains_key(&circuit_id)
                && !self.pending_extends.contains_key(&circuit_id)
            {
                return circuit_id;
            }
        }
    }

    /// Picks the peers of a new circuit, last hop first.
    ///
    /// Data circuits end at an exit-capable peer; intermediates never repeat
    /// a peer already on the path.
    fn plan_path(
        &self,
        goal_hops: u8,
        ctype: CircuitType,
        required_end: Option<PeerRef>,
    ) -> Result<Vec<PeerRef>, TunnelError> {
        let no_candidates = TunnelError::NoCandidates { hops: goal_hops };
        if goal_hops == 0 {
            return Err(no_candidates);
        }
        let mut rng = rand::rng();
        let last = match required_end {
            Some(peer) => peer,
            None => {
                let candidates: Vec<PeerRef> = self
                    .peers
                    .values()
                    .filter(|peer| ctype != CircuitType::Data || peer.exit_capable)
                    .copied()
                    .collect();
                *candidates.choose(&mut rng).ok_or(no_candidates)?
            }
        };

        let mut intermediates: Vec<PeerRef> = self
            .peers
            .values()
            .filter(|peer| peer.addr != last.addr)
            .copied()
            .collect();
        let needed = usize::from(goal_hops) - 1;
        if intermediates.len() < needed {
            return Err(TunnelError::NoCandidates { hops: goal_hops });
        }
        intermediates.shuffle(&mut rng);
        intermediates.truncate(needed);
        intermediates.push(last);
        Ok(intermediates)
    }

    /// Starts a data circuit of `goal_hops` hops.
    ///
    /// # Errors
    /// - `TunnelError::TooManyCircuits` - `max_circuits` data circuits exist
    /// - `TunnelError::NoCandidates` - not enough peers or no exit known
    pub async fn build_circuit(&mut self, goal_hops: u8) -> Result<u32, TunnelError> {
        let data_circuits = self
            .circuits
            .values()
            .filter(|c| c.ctype == CircuitType::Data)
            .count();
        if data_circuits >= self.config.max_circuits {
            return Err(TunnelError::TooManyCircuits {
                limit: self.config.max_circuits,
            });
        }
        self.start_circuit(goal_hops, CircuitType::Data, None, None, None)
            .await
    }

    async fn start_circuit(
        &mut self,
        goal_hops: u8,
        ctype: CircuitType,
        required_end: Option<PeerRef>,
        info_hash: Option<InfoHash>,
        cookie: Option<Cookie>,
    ) -> Result<u32, TunnelError> {
        let path = self.plan_path(goal_hops, ctype, required_end)?;
        let circuit_id = self.fresh_circuit_id();
        let mut circuit = Circuit::new(circuit_id, ctype, path, Instant::now());
        circuit.info_hash = info_hash;
        circuit.cookie = cookie;
        let dh_key = circuit.offer_key();
        let first = circuit
            .first_hop()
            .map(|peer| peer.addr)
            .ok_or(TunnelError::NoCandidates { hops: goal_hops })?;
        self.circuits.insert(circuit_id, circuit);

        tracing::debug!(
            "Creating {:?} circuit {} with {} hops via {}",
            ctype,
            circuit_id,
            goal_hops,
            first
        );
        self.circuit_event(circuit_id, "created");
        self.send_plain(first, circuit_id, Cell::Create { dh_key, relayed: false })
            .await?;
        Ok(circuit_id)
    }

    /// Closes a local circuit, paying for it when it carried enough data.
    ///
    /// `destroy` is false when the first hop already tore the circuit down.
    ///
    /// # Errors
    /// - `TunnelError::UnknownCircuit` - no such local circuit
    pub async fn remove_circuit(&mut self, circuit_id: u32, destroy: bool) -> Result<(), TunnelError> {
        let mut circuit = self
            .circuits
            .remove(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        circuit.state = CircuitState::Closing;

        if destroy && let Some(first) = circuit.first_hop().copied() {
            if let Some(hop) = circuit.hops.first()
                && let Some((amount, base_amount)) =
                    initial_payout(circuit.ctype, circuit.bytes_down, circuit.goal_hops)
            {
                let block = self.ledger.create_block(hop.peer.public_key, 0, 0, amount);
                tracing::info!(
                    "Paying {} bytes of credit for circuit {} ({} bytes down)",
                    amount,
                    circuit_id,
                    circuit.bytes_down
                );
                let payout = Cell::Payout {
                    block,
                    circuit_id,
                    base_amount,
                };
                match self.send_plain(hop.peer.addr, circuit_id, payout).await {
                    Ok(()) => self.stats.payouts_sent += 1,
                    Err(e) => tracing::warn!("Payout for circuit {} not sent: {}", circuit_id, e),
                }
            }
            let destroy = Cell::Destroy {
                reason: REASON_REMOVED,
            };
            if let Err(e) = self.send_plain(first.addr, circuit_id, destroy).await {
                tracing::debug!("Destroy for circuit {} not sent: {}", circuit_id, e);
            }
        }

        self.virtual_peers.release(circuit_id);
        self.introductions.remove(&circuit_id);
        if let Some((service, intro)) = self.announced.remove(&circuit_id)
            && let Some(directory) = &self.directory
        {
            directory.withdraw(service, intro).await;
        }

        tracing::debug!("Removed circuit {}", circuit_id);
        self.circuit_event(circuit_id, "removed");
        self.emit(TunnelEvent::CircuitRemoved { circuit_id });
        Ok(())
    }

    /// Sends a payload out of a ready circuit.
    ///
    /// # Errors
    /// - `TunnelError::UnknownCircuit` - no such local circuit
    /// - `TunnelError::CircuitNotReady` - the circuit is still being built
    pub async fn send_data(
        &mut self,
        circuit_id: u32,
        destination: SocketAddr,
        payload: Bytes,
    ) -> Result<(), TunnelError> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        if !circuit.is_ready() {
            return Err(TunnelError::CircuitNotReady { circuit_id });
        }
        let len = payload.len() as u64;
        let cell = Cell::Data {
            destination,
            origin: UNSPECIFIED,
            payload,
        };
        self.send_to_end(circuit_id, &cell).await?;
        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.bytes_up += len;
        }
        Ok(())
    }

    /// Sends a payload to a hidden-service peer by its virtual address.
    ///
    /// # Errors
    /// - `TunnelError::Protocol` - the address is not a linked virtual peer
    /// - `TunnelError::CircuitNotReady` - the link's circuit is not usable
    pub async fn send_to_virtual_peer(&mut self, addr: SocketAddr, payload: Bytes) -> Result<(), TunnelError> {
        let circuit_id = self
            .virtual_peers
            .circuit(&addr)
            .ok_or_else(|| TunnelError::protocol(format!("{addr} is not a virtual peer")))?;
        self.send_data(circuit_id, addr, payload).await
    }

    /// Processes one datagram from the overlay.
    pub async fn handle_datagram(&mut self, from: SocketAddr, data: &[u8]) {
        let result = match Datagram::decode(data) {
            Ok(datagram) => self.dispatch(from, datagram).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.stats.dropped_cells += 1;
            tracing::debug!("Dropped datagram from {}: {}", from, e);
        }
    }

    async fn dispatch(&mut self, from: SocketAddr, datagram: Datagram) -> Result<(), TunnelError> {
        match datagram {
            Datagram::Plain { circuit_id, cell } => {
                tracing::trace!("{} cell on {} from {}", cell.name(), circuit_id, from);
                self.on_plain(from, circuit_id, cell).await
            }
            Datagram::Onion { circuit_id, body } => self.on_onion(from, circuit_id, &body).await,
            Datagram::Handshake {
                circuit_id,
                dh_key,
                body,
            } => self.on_handshake(from, circuit_id, dh_key, &body).await,
        }
    }

    async fn on_plain(&mut self, from: SocketAddr, circuit_id: u32, cell: Cell) -> Result<(), TunnelError> {
        match cell {
            Cell::Create { dh_key, relayed } => self.on_create(from, circuit_id, dh_key, relayed).await,
            Cell::Created { dh_key } => self.on_created(from, circuit_id, dh_key).await,
            Cell::Destroy { reason } => self.on_destroy(from, circuit_id, reason).await,
            Cell::RelayBalanceRequest { circuit_id } => {
                self.on_relay_balance_request(from, circuit_id).await
            }
            Cell::RelayBalanceResponse { circuit_id, block } => {
                let known_prev = self
                    .pending_admissions
                    .get(&circuit_id)
                    .is_some_and(|pending| pending.prev == from);
                if !known_prev {
                    return Err(TunnelError::protocol("unsolicited balance response"));
                }
                self.settle_admission(circuit_id, Some(block)).await
            }
            Cell::Payout {
                block,
                circuit_id,
                base_amount,
            } => self.on_payout(from, circuit_id, block, base_amount).await,
            other => Err(TunnelError::protocol(format!(
                "{} cell outside a circuit",
                other.name()
            ))),
        }
    }

    async fn on_create(
        &mut self,
        from: SocketAddr,
        circuit_id: u32,
        dh_key: [u8; 32],
        relayed: bool,
    ) -> Result<(), TunnelError> {
        if self.joined.contains_key(&circuit_id)
            || self.pending_admissions.contains_key(&circuit_id)
            || self.routes.contains_key(&circuit_id)
            || self.circuits.contains_key(&circuit_id)
        {
            return Err(TunnelError::protocol(format!("duplicate create for {circuit_id}")));
        }
        if self.joined.len() + self.pending_admissions.len() >= self.config.max_joined_circuits {
            self.stats.admissions_denied += 1;
            tracing::debug!("Refusing circuit {} from {}: joined limit reached", circuit_id, from);
            return self
                .send_plain(from, circuit_id, Cell::Destroy { reason: REASON_NO_SLOTS })
                .await;
        }

        let dh = DhKeyPair::generate();
        let keys = dh.agree(&dh_key);
        let dh_public = dh.public_bytes();

        if self.slots.try_random(circuit_id) {
            return self.join(circuit_id, from, keys, dh_public).await;
        }

        tracing::debug!("Random slots full, probing balance for circuit {}", circuit_id);
        let request = Cell::BalanceRequest { circuit_id };
        let probe = if relayed {
            Datagram::Plain {
                circuit_id,
                cell: Cell::RelayBalanceRequest { circuit_id },
            }
        } else {
            Datagram::Handshake {
                circuit_id,
                dh_key: dh_public,
                body: keys.seal_backward(&cell_layer(&request))?.into(),
            }
        };
        self.pending_admissions.insert(
            circuit_id,
            PendingAdmission {
                prev: from,
                keys,
                dh_public,
                deadline: Instant::now() + self.config.balance_timeout(),
            },
        );
        self.send(from, probe).await
    }

    async fn join(
        &mut self,
        circuit_id: u32,
        prev: SocketAddr,
        keys: SessionKeys,
        dh_public: [u8; 32],
    ) -> Result<(), TunnelError> {
        self.joined.insert(
            circuit_id,
            JoinedCircuit {
                prev,
                keys,
                next: None,
            },
        );
        self.stats.circuits_joined += 1;
        tracing::debug!("Joined circuit {} from {}", circuit_id, prev);
        self.send_plain(prev, circuit_id, Cell::Created { dh_key: dh_public })
            .await
    }

    /// Runs the competing-slot auction for a probed circuit.
    ///
    /// A missing or unverifiable statement counts as balance zero.
    async fn settle_admission(&mut self, circuit_id: u32, block: Option<LedgerBlock>) -> Result<(), TunnelError> {
        let Some(pending) = self.pending_admissions.remove(&circuit_id) else {
            return Ok(());
        };
        let balance = match block {
            Some(block) if self.ledger.validate(&block).is_ok() => block.balance(),
            _ => 0,
        };

        match self.slots.compete(circuit_id, balance) {
            Competition::Accepted { evicted } => {
                if let Some(evicted) = evicted {
                    tracing::debug!("Circuit {} evicted by richer circuit {}", evicted, circuit_id);
                    self.remove_joined(evicted, true, true, REASON_EVICTED).await;
                }
                self.join(circuit_id, pending.prev, pending.keys, pending.dh_public)
                    .await
            }
            Competition::Rejected => {
                self.stats.admissions_denied += 1;
                tracing::debug!("Circuit {} lost the auction with balance {}", circuit_id, balance);
                self.send_plain(pending.prev, circuit_id, Cell::Destroy { reason: REASON_NO_SLOTS })
                    .await
            }
        }
    }

    async fn on_created(&mut self, from: SocketAddr, circuit_id: u32, dh_key: [u8; 32]) -> Result<(), TunnelError> {
        if let Some(extend) = self.pending_extends.remove(&circuit_id) {
            if extend.next.addr != from {
                self.pending_extends.insert(circuit_id, extend);
                return Err(TunnelError::protocol("created from unexpected peer"));
            }
            let joined = self
                .joined
                .get_mut(&extend.circuit_id)
                .ok_or(TunnelError::UnknownCircuit {
                    circuit_id: extend.circuit_id,
                })?;
            joined.next = Some(extend.next);
            let prev = joined.prev;
            self.routes.insert(
                extend.circuit_id,
                RelayRoute {
                    circuit_id: extend.circuit_id,
                    to_cid: circuit_id,
                    to_peer: from,
                    direction: RouteDirection::Forward,
                },
            );
            self.routes.insert(
                circuit_id,
                RelayRoute {
                    circuit_id: extend.circuit_id,
                    to_cid: extend.circuit_id,
                    to_peer: prev,
                    direction: RouteDirection::Backward,
                },
            );
            tracing::debug!("Extended circuit {} to {} as {}", extend.circuit_id, from, circuit_id);
            return self
                .send_backward(extend.circuit_id, &Cell::Extended { dh_key })
                .await;
        }

        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        if circuit.state != CircuitState::Tentative || circuit.first_hop().map(|p| p.addr) != Some(from) {
            return Err(TunnelError::protocol(format!("out of order created on {circuit_id}")));
        }
        let ready = circuit.complete_hop(&dh_key)?;
        self.circuit_event(circuit_id, "extended");
        self.on_hop_added(circuit_id, ready).await
    }

    async fn on_hop_added(&mut self, circuit_id: u32, ready: bool) -> Result<(), TunnelError> {
        if ready {
            return self.on_circuit_ready(circuit_id).await;
        }
        let circuit = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        let next = *circuit
            .next_peer()
            .ok_or_else(|| TunnelError::protocol("nothing to extend to"))?;
        let dh_key = circuit.offer_key();
        let cell = Cell::Extend {
            node: next.addr,
            node_key: next.public_key,
            dh_key,
        };
        self.send_to_end(circuit_id, &cell).await
    }

    async fn on_circuit_ready(&mut self, circuit_id: u32) -> Result<(), TunnelError> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        let (ctype, info_hash, cookie) = (circuit.ctype, circuit.info_hash, circuit.cookie);
        self.stats.circuits_built += 1;
        tracing::info!("Circuit {} ({:?}, {} hops) is ready", circuit_id, ctype, circuit.goal_hops);
        self.circuit_event(circuit_id, "ready");
        self.emit(TunnelEvent::CircuitReady { circuit_id, ctype });

        let cell = match (ctype, info_hash, cookie) {
            (CircuitType::IntroductionPoint, Some(infohash), _) => Cell::EstablishIntro {
                service: lookup_info_hash(&infohash),
            },
            (CircuitType::RendezvousPoint, _, Some(cookie)) => Cell::EstablishRendezvous { cookie },
            (CircuitType::Rendezvous, _, Some(cookie)) => Cell::LinkE2e { cookie },
            (CircuitType::Lookup, Some(infohash), Some(cookie)) => {
                let rendezvous = self
                    .joins
                    .get(&cookie)
                    .and_then(|join| join.rendezvous)
                    .ok_or_else(|| TunnelError::protocol("introduction without rendezvous point"))?;
                Cell::Introduce {
                    service: lookup_info_hash(&infohash),
                    cookie,
                    rendezvous: rendezvous.addr,
                    rendezvous_key: rendezvous.public_key,
                }
            }
            _ => return Ok(()),
        };
        self.send_to_end(circuit_id, &cell).await
    }

    async fn on_handshake(
        &mut self,
        from: SocketAddr,
        circuit_id: u32,
        dh_key: [u8; 32],
        body: &[u8],
    ) -> Result<(), TunnelError> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
        if circuit.state != CircuitState::Tentative || circuit.first_hop().map(|p| p.addr) != Some(from) {
            return Err(TunnelError::protocol("unexpected handshake"));
        }
        let keys = circuit
            .pending_keys(&dh_key)
            .ok_or_else(|| TunnelError::protocol("no key offered"))?;
        let plain = keys.open_backward(body)?;
        let cell = match plain.split_first() {
            Some((&LAYER_CELL, rest)) => Cell::decode(rest)?,
            _ => return Err(TunnelError::protocol("bad handshake layer")),
        };
        let Cell::BalanceRequest { circuit_id: probed } = cell else {
            return Err(TunnelError::protocol(format!("{} cell in handshake", cell.name())));
        };
        let response = Cell::BalanceResponse {
            circuit_id: probed,
            block: self.ledger.balance_statement(),
        };
        let body = keys.seal_forward(&cell_layer(&response))?;
        self.send(
            from,
            Datagram::Onion {
                circuit_id,
                body: body.into(),
            },
        )
        .await
    }

    async fn on_relay_balance_request(&mut self, from: SocketAddr, circuit_id: u32) -> Result<(), TunnelError> {
        let extend = self
            .pending_extends
            .get(&circuit_id)
            .filter(|extend| extend.next.addr == from)
            .ok_or_else(|| TunnelError::protocol("balance request without extend"))?;
        let joined_id = extend.circuit_id;
        self.send_backward(joined_id, &Cell::BalanceRequest { circuit_id: joined_id })
            .await
    }

    async fn on_onion(&mut self, from: SocketAddr, circuit_id: u32, body: &[u8]) -> Result<(), TunnelError> {
        if let Some(route) = self.routes.get(&circuit_id).copied() {
            return self.relay(from, route, body).await;
        }
        if let Some(joined) = self.joined.get(&circuit_id) {
            if joined.prev != from {
                return Err(TunnelError::protocol("onion from unexpected peer"));
            }
            let plain = joined.keys.open_forward(body)?;
            return match plain.split_first() {
                Some((&LAYER_CELL, rest)) => {
                    let cell = Cell::decode(rest)?;
                    self.on_joined_cell(circuit_id, cell).await
                }
                _ => Err(TunnelError::protocol("relay layer at the end of a circuit")),
            };
        }
        if let Some(pending) = self.pending_admissions.get(&circuit_id) {
            if pending.prev != from {
                return Err(TunnelError::protocol("onion from unexpected peer"));
            }
            let plain = pending.keys.open_forward(body)?;
            let cell = match plain.split_first() {
                Some((&LAYER_CELL, rest)) => Cell::decode(rest)?,
                _ => return Err(TunnelError::protocol("bad layer before admission")),
            };
            return match cell {
                Cell::BalanceResponse { block, .. } => self.settle_admission(circuit_id, Some(block)).await,
                other => Err(TunnelError::protocol(format!("{} cell before admission", other.name()))),
            };
        }
        if let Some(circuit) = self.circuits.get(&circuit_id) {
            if circuit.first_hop().map(|p| p.addr) != Some(from) {
                return Err(TunnelError::protocol("onion from unexpected peer"));
            }
            let (hop, cell) = circuit.unwrap_backward(body)?;
            return self.on_circuit_cell(circuit_id, hop, cell).await;
        }
        Err(TunnelError::UnknownCircuit { circuit_id })
    }

    /// Moves one onion across this relay, peeling or adding a layer.
    async fn relay(&mut self, from: SocketAddr, route: RelayRoute, body: &[u8]) -> Result<(), TunnelError> {
        let joined = self
            .joined
            .get(&route.circuit_id)
            .ok_or(TunnelError::UnknownCircuit {
                circuit_id: route.circuit_id,
            })?;
        let outgoing = match route.direction {
            RouteDirection::Forward => {
                if joined.prev != from {
                    return Err(TunnelError::protocol("forward onion from unexpected peer"));
                }
                let plain = joined.keys.open_forward(body)?;
                match plain.split_first() {
                    Some((&LAYER_RELAY, rest)) => rest.to_vec(),
                    Some((&LAYER_CELL, rest)) => {
                        let cell = Cell::decode(rest)?;
                        return self.on_joined_cell(route.circuit_id, cell).await;
                    }
                    _ => return Err(TunnelError::protocol("bad layer marker")),
                }
            }
            RouteDirection::Backward => {
                if joined.next.map(|next| next.addr) != Some(from) {
                    return Err(TunnelError::protocol("backward onion from unexpected peer"));
                }
                joined.keys.seal_backward(&relay_layer(body))?
            }
        };
        self.stats.bytes_relayed += outgoing.len() as u64;
        self.send(
            route.to_peer,
            Datagram::Onion {
                circuit_id: route.to_cid,
                body: outgoing.into(),
            },
        )
        .await
    }

    /// Cells addressed to this node as a hop of someone else's circuit.
    async fn on_joined_cell(&mut self, circuit_id: u32, cell: Cell) -> Result<(), TunnelError> {
        match cell {
            Cell::Extend {
                node,
                node_key,
                dh_key,
            } => {
                let extending = self.pending_extends.values().any(|e| e.circuit_id == circuit_id);
                let has_next = self.joined.get(&circuit_id).is_some_and(|j| j.next.is_some());
                if extending || has_next || node == self.local_addr() {
                    return Err(TunnelError::protocol(format!("illegal extend on {circuit_id}")));
                }
                let next_cid = self.fresh_circuit_id();
                self.pending_extends.insert(
                    next_cid,
                    PendingExtend {
                        circuit_id,
                        next: NextHop {
                            circuit_id: next_cid,
                            addr: node,
                            public_key: node_key,
                        },
                        deadline: Instant::now() + self.config.build_timeout(),
                    },
                );
                self.send_plain(node, next_cid, Cell::Create { dh_key, relayed: true })
                    .await
            }
            Cell::BalanceResponse { block, .. } => {
                let (next_cid, next_addr) = self
                    .pending_extends
                    .iter()
                    .find(|(_, extend)| extend.circuit_id == circuit_id)
                    .map(|(cid, extend)| (*cid, extend.next.addr))
                    .ok_or_else(|| TunnelError::protocol("balance response without extend"))?;
                let cell = Cell::RelayBalanceResponse {
                    circuit_id: next_cid,
                    block,
                };
                self.send_plain(next_addr, next_cid, cell).await
            }
            Cell::Data {
                destination,
                origin,
                payload,
            } => {
                if let Some(linked) = self.e2e_links.get(&circuit_id).copied() {
                    self.stats.bytes_relayed += payload.len() as u64;
                    let cell = Cell::Data {
                        destination,
                        origin,
                        payload,
                    };
                    return self.send_backward(linked, &cell).await;
                }
                self.exit_data(circuit_id, destination, &payload).await
            }
            Cell::EstablishIntro { service } => {
                let circuits = self.intro_points.entry(service).or_default();
                if !circuits.contains(&circuit_id) {
                    circuits.push(circuit_id);
                }
                tracing::debug!("Acting as introduction point for {} on {}", service, circuit_id);
                self.send_backward(circuit_id, &Cell::IntroEstablished { service })
                    .await
            }
            Cell::EstablishRendezvous { cookie } => {
                self.rendezvous_points.insert(cookie, circuit_id);
                self.send_backward(circuit_id, &Cell::RendezvousEstablished { cookie })
                    .await
            }
            Cell::Introduce {
                service,
                cookie,
                rendezvous,
                rendezvous_key,
            } => {
                let intro_circuit = self
                    .intro_points
                    .get(&service)
                    .and_then(|circuits| circuits.first().copied())
                    .ok_or_else(|| TunnelError::protocol(format!("not an introduction point for {service}")))?;
                let cell = Cell::Introduce {
                    service,
                    cookie,
                    rendezvous,
                    rendezvous_key,
                };
                self.send_backward(intro_circuit, &cell).await
            }
            Cell::LinkE2e { cookie } => {
                let waiting = self
                    .rendezvous_points
                    .remove(&cookie)
                    .ok_or_else(|| TunnelError::protocol("unknown rendezvous cookie"))?;
                self.e2e_links.insert(circuit_id, waiting);
                self.e2e_links.insert(waiting, circuit_id);
                tracing::debug!("Linked circuits {} and {}", circuit_id, waiting);
                self.send_backward(circuit_id, &Cell::LinkedE2e { cookie }).await?;
                self.send_backward(waiting, &Cell::LinkedE2e { cookie }).await
            }
            other => Err(TunnelError::protocol(format!(
                "unexpected {} cell at hop of {}",
                other.name(),
                circuit_id
            ))),
        }
    }

    async fn exit_data(&mut self, circuit_id: u32, destination: SocketAddr, payload: &[u8]) -> Result<(), TunnelError> {
        if !self.config.exitnode_enabled {
            return Err(TunnelError::protocol("exit traffic on a non-exit node"));
        }
        if !self.exits.contains_key(&circuit_id) {
            let exit = ExitSocket::bind(circuit_id, self.exit_tx.clone()).await?;
            self.exits.insert(circuit_id, exit);
        }
        match self.exits.get_mut(&circuit_id) {
            Some(exit) => exit.send_to(destination, payload).await,
            None => Ok(()),
        }
    }

    /// Carries swarm traffic from an exit socket back along its circuit.
    pub async fn on_exit_packet(&mut self, packet: ExitPacket) {
        let Some(exit) = self.exits.get_mut(&packet.circuit_id) else {
            return;
        };
        exit.bytes_down += packet.payload.len() as u64;
        let cell = Cell::Data {
            destination: UNSPECIFIED,
            origin: packet.origin,
            payload: packet.payload.into(),
        };
        if let Err(e) = self.send_backward(packet.circuit_id, &cell).await {
            tracing::debug!("Exit traffic for {} dropped: {}", packet.circuit_id, e);
        }
    }

    /// Cells that came back on a circuit this node initiated.
    async fn on_circuit_cell(&mut self, circuit_id: u32, hop: usize, cell: Cell) -> Result<(), TunnelError> {
        match cell {
            Cell::Extended { dh_key } => {
                let circuit = self
                    .circuits
                    .get_mut(&circuit_id)
                    .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
                if circuit.state != CircuitState::Extending || hop + 1 != circuit.hops.len() {
                    return Err(TunnelError::protocol(format!("out of order extended on {circuit_id}")));
                }
                let ready = circuit.complete_hop(&dh_key)?;
                self.circuit_event(circuit_id, "extended");
                self.on_hop_added(circuit_id, ready).await
            }
            Cell::BalanceRequest { circuit_id: probed } => {
                let response = Cell::BalanceResponse {
                    circuit_id: probed,
                    block: self.ledger.balance_statement(),
                };
                self.send_forward(circuit_id, hop, &response).await
            }
            Cell::Data { origin, payload, .. } => {
                let circuit = self
                    .circuits
                    .get_mut(&circuit_id)
                    .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
                circuit.bytes_down += payload.len() as u64;
                let origin = if circuit.e2e_linked {
                    self.virtual_peers.address(circuit_id).unwrap_or(origin)
                } else {
                    origin
                };
                self.emit(TunnelEvent::Data {
                    circuit_id,
                    origin,
                    payload,
                });
                Ok(())
            }
            Cell::IntroEstablished { service } => {
                let circuit = self
                    .circuits
                    .get(&circuit_id)
                    .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
                let (Some(infohash), Some(last)) = (circuit.info_hash, circuit.last_hop().copied()) else {
                    return Err(TunnelError::protocol("introduction point without service"));
                };
                let intro = IntroPointInfo {
                    addr: last.addr,
                    public_key: last.public_key,
                };
                if let Some(directory) = &self.directory {
                    directory.announce(service, intro).await?;
                }
                self.announced.insert(circuit_id, (service, intro));
                tracing::info!("Announced introduction point {} for {}", intro.addr, infohash);
                self.emit(TunnelEvent::ServiceAnnounced { infohash, intro });
                Ok(())
            }
            Cell::RendezvousEstablished { cookie } => {
                let rendezvous = self
                    .circuits
                    .get(&circuit_id)
                    .and_then(|c| c.last_hop().copied())
                    .ok_or(TunnelError::CircuitNotReady { circuit_id })?;
                let join = self
                    .joins
                    .get_mut(&cookie)
                    .ok_or_else(|| TunnelError::protocol("rendezvous for unknown join"))?;
                join.rendezvous = Some(rendezvous);
                let (infohash, hops) = (join.infohash, join.hops);
                let Some(intro) = join.intros.first().copied() else {
                    return Ok(());
                };
                let lookup = self
                    .start_circuit(
                        hops,
                        CircuitType::Lookup,
                        Some(intro.peer()),
                        Some(infohash),
                        Some(cookie),
                    )
                    .await?;
                self.introductions.insert(lookup, cookie);
                Ok(())
            }
            Cell::Introduce {
                service,
                cookie,
                rendezvous,
                rendezvous_key,
            } => {
                let infohash = *self
                    .services
                    .get(&service)
                    .ok_or_else(|| TunnelError::protocol("introduction for unknown service"))?;
                let hops = self
                    .circuits
                    .get(&circuit_id)
                    .map(|c| c.goal_hops)
                    .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
                let duplicate = self
                    .circuits
                    .values()
                    .any(|c| c.ctype == CircuitType::Rendezvous && c.cookie == Some(cookie));
                if duplicate {
                    return Ok(());
                }
                tracing::debug!("Introduced to rendezvous point {} for {}", rendezvous, infohash);
                let peer = PeerRef::new(rendezvous, rendezvous_key, false);
                self.start_circuit(
                    hops,
                    CircuitType::Rendezvous,
                    Some(peer),
                    Some(infohash),
                    Some(cookie),
                )
                .await
                .map(|_| ())
            }
            Cell::LinkedE2e { cookie } => {
                let circuit = self
                    .circuits
                    .get_mut(&circuit_id)
                    .ok_or(TunnelError::UnknownCircuit { circuit_id })?;
                if circuit.cookie != Some(cookie) {
                    return Err(TunnelError::protocol("linked with a foreign cookie"));
                }
                circuit.e2e_linked = true;
                let (ctype, info_hash) = (circuit.ctype, circuit.info_hash);
                let addr = self
                    .virtual_peers
                    .assign(circuit_id)
                    .ok_or(TunnelError::TooManyCircuits {
                        limit: usize::from(u16::MAX),
                    })?;

                if ctype == CircuitType::RendezvousPoint {
                    self.joins.remove(&cookie);
                    let lookups: Vec<u32> = self
                        .introductions
                        .iter()
                        .filter(|(_, c)| **c == cookie)
                        .map(|(cid, _)| *cid)
                        .collect();
                    for lookup in lookups {
                        let _ = self.remove_circuit(lookup, true).await;
                    }
                }
                if let Some(infohash) = info_hash {
                    tracing::info!("Hidden peer {} connected for {}", addr, infohash);
                    self.emit(TunnelEvent::PeerConnected {
                        infohash,
                        circuit_id,
                        addr,
                    });
                }
                Ok(())
            }
            other => Err(TunnelError::protocol(format!(
                "unexpected {} cell on own circuit {}",
                other.name(),
                circuit_id
            ))),
        }
    }

    async fn on_payout(
        &mut self,
        from: SocketAddr,
        circuit_id: u32,
        block: LedgerBlock,
        base_amount: u32,
    ) -> Result<(), TunnelError> {
        let next = match self.joined.get(&circuit_id) {
            Some(joined) if joined.prev == from => joined.next,
            _ => return Err(TunnelError::protocol("payout on unknown circuit")),
        };

        let stored = if block.link_public_key == self.ledger.public_key() {
            self.ledger.add_block(block.clone())
        } else {
            Err(LedgerError::WrongCounterparty)
        };
        if let Err(e) = stored {
            tracing::warn!("Rejected payout on circuit {}: {}", circuit_id, e);
            self.remove_joined(circuit_id, true, true, REASON_INTEGRITY).await;
            return Err(e.into());
        }

        let received = block.transaction.down;
        self.ledger
            .create_block(block.public_key, block.seq, received, 0);
        tracing::debug!("Received payout of {} bytes on circuit {}", received, circuit_id);

        if let Some(next) = next
            && let Some(amount) = forward_amount(received, base_amount)
        {
            let forwarded = self.ledger.create_block(next.public_key, 0, 0, amount);
            let cell = Cell::Payout {
                block: forwarded,
                circuit_id: next.circuit_id,
                base_amount,
            };
            self.send_plain(next.addr, next.circuit_id, cell).await?;
            self.stats.payouts_sent += 1;
        }
        Ok(())
    }

    async fn on_destroy(&mut self, from: SocketAddr, circuit_id: u32, reason: u16) -> Result<(), TunnelError> {
        if let Some(circuit) = self.circuits.get(&circuit_id) {
            if circuit.first_hop().map(|p| p.addr) != Some(from) {
                return Err(TunnelError::protocol("destroy from a stranger"));
            }
            tracing::debug!("Circuit {} destroyed by first hop (reason {})", circuit_id, reason);
            return self.remove_circuit(circuit_id, false).await;
        }

        if let Some(route) = self.routes.get(&circuit_id).copied()
            && route.direction == RouteDirection::Backward
        {
            let from_next = self
                .joined
                .get(&route.circuit_id)
                .and_then(|joined| joined.next)
                .is_some_and(|next| next.addr == from);
            if !from_next {
                return Err(TunnelError::protocol("destroy from a stranger"));
            }
            self.remove_joined(route.circuit_id, true, false, reason).await;
            return Ok(());
        }

        if let Some(joined) = self.joined.get(&circuit_id) {
            if joined.prev != from {
                return Err(TunnelError::protocol("destroy from a stranger"));
            }
            self.remove_joined(circuit_id, false, true, reason).await;
            return Ok(());
        }

        if self
            .pending_admissions
            .get(&circuit_id)
            .is_some_and(|pending| pending.prev == from)
        {
            self.pending_admissions.remove(&circuit_id);
            return Ok(());
        }

        if let Some(extend) = self.pending_extends.get(&circuit_id)
            && extend.next.addr == from
        {
            let joined_id = extend.circuit_id;
            self.pending_extends.remove(&circuit_id);
            tracing::debug!("Extension of circuit {} refused by {}", joined_id, from);
            self.remove_joined(joined_id, true, false, reason).await;
            return Ok(());
        }

        Err(TunnelError::UnknownCircuit { circuit_id })
    }

    /// Forgets a joined circuit and everything hanging off it.
    async fn remove_joined(&mut self, circuit_id: u32, notify_prev: bool, notify_next: bool, reason: u16) {
        let Some(joined) = self.joined.remove(&circuit_id) else {
            return;
        };
        self.slots.release(circuit_id);
        self.routes.remove(&circuit_id);
        self.exits.remove(&circuit_id);

        let mut downstream = Vec::new();
        if let Some(next) = joined.next {
            self.routes.remove(&next.circuit_id);
            downstream.push((next.addr, next.circuit_id));
        }
        let extends: Vec<u32> = self
            .pending_extends
            .iter()
            .filter(|(_, extend)| extend.circuit_id == circuit_id)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in extends {
            if let Some(extend) = self.pending_extends.remove(&cid) {
                downstream.push((extend.next.addr, cid));
            }
        }

        for circuits in self.intro_points.values_mut() {
            circuits.retain(|cid| *cid != circuit_id);
        }
        self.intro_points.retain(|_, circuits| !circuits.is_empty());
        self.rendezvous_points.retain(|_, cid| *cid != circuit_id);
        if let Some(other) = self.e2e_links.remove(&circuit_id) {
            self.e2e_links.remove(&other);
        }

        tracing::debug!("Left circuit {} (reason {})", circuit_id, reason);
        let destroy = Cell::Destroy { reason };
        if notify_prev && let Err(e) = self.send_plain(joined.prev, circuit_id, destroy.clone()).await {
            tracing::debug!("Destroy towards {} not sent: {}", joined.prev, e);
        }
        if notify_next {
            for (addr, cid) in downstream {
                if let Err(e) = self.send_plain(addr, cid, destroy.clone()).await {
                    tracing::debug!("Destroy towards {} not sent: {}", addr, e);
                }
            }
        }
    }

    /// Expires unfinished circuits, balance probes and extensions.
    pub async fn tick(&mut self, now: Instant) {
        let build_timeout = self.config.build_timeout();
        let stalled: Vec<u32> = self
            .circuits
            .values()
            .filter(|c| !c.is_ready() && now.duration_since(c.created_at) >= build_timeout)
            .map(|c| c.circuit_id)
            .collect();
        for circuit_id in stalled {
            tracing::debug!("Circuit {} timed out while building", circuit_id);
            let _ = self.remove_circuit(circuit_id, true).await;
        }

        let probes: Vec<u32> = self
            .pending_admissions
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(cid, _)| *cid)
            .collect();
        for circuit_id in probes {
            tracing::debug!("Balance probe for circuit {} timed out", circuit_id);
            if let Err(e) = self.settle_admission(circuit_id, None).await {
                tracing::debug!("Admission of {} failed: {}", circuit_id, e);
            }
        }

        let extends: Vec<(u32, u32)> = self
            .pending_extends
            .iter()
            .filter(|(_, extend)| extend.deadline <= now)
            .map(|(cid, extend)| (*cid, extend.circuit_id))
            .collect();
        for (next_cid, circuit_id) in extends {
            self.pending_extends.remove(&next_cid);
            self.remove_joined(circuit_id, true, false, REASON_TIMEOUT).await;
        }
    }

    /// Whether data circuits of `hops` hops can carry traffic right now.
    pub fn availability(&self, hops: u8) -> CircuitAvailability {
        let ready = self
            .circuits
            .values()
            .any(|c| c.ctype == CircuitType::Data && c.goal_hops == hops && c.is_ready());
        if ready {
            CircuitAvailability::Ready
        } else if !self.peers.values().any(|peer| peer.exit_capable) {
            CircuitAvailability::NoExits
        } else {
            CircuitAvailability::Building
        }
    }

    /// Starts an introduction point circuit for a seeded hidden torrent.
    ///
    /// # Errors
    /// - `TunnelError::NoCandidates` - not enough peers
    pub async fn create_introduction_point(&mut self, infohash: InfoHash, hops: u8) -> Result<u32, TunnelError> {
        self.services.insert(lookup_info_hash(&infohash), infohash);
        self.start_circuit(hops, CircuitType::IntroductionPoint, None, Some(infohash), None)
            .await
    }

    /// Looks up a hidden torrent and starts meeting its seeders.
    ///
    /// Returns the number of introduction points found; zero when none are
    /// announced or a join for `infohash` is already under way.
    ///
    /// # Errors
    /// - `TunnelError::Io` - the directory could not be queried
    /// - `TunnelError::NoCandidates` - not enough peers for a rendezvous circuit
    pub async fn join_hidden_swarm(&mut self, infohash: InfoHash, hops: u8) -> Result<usize, TunnelError> {
        self.last_lookup.insert(infohash, Instant::now());
        let Some(directory) = self.directory.clone() else {
            return Ok(0);
        };
        if self.joins.values().any(|join| join.infohash == infohash) {
            return Ok(0);
        }
        let own = self.local_addr();
        let intros: Vec<IntroPointInfo> = directory
            .lookup(lookup_info_hash(&infohash))
            .await?
            .into_iter()
            .filter(|intro| intro.addr != own)
            .collect();
        if intros.is_empty() {
            tracing::debug!("No introduction points known for {}", infohash);
            return Ok(0);
        }

        let found = intros.len();
        let cookie: Cookie = rand::random();
        self.joins.insert(
            cookie,
            PendingJoin {
                infohash,
                hops,
                intros,
                rendezvous: None,
            },
        );
        if let Err(e) = self
            .start_circuit(hops, CircuitType::RendezvousPoint, None, Some(infohash), Some(cookie))
            .await
        {
            self.joins.remove(&cookie);
            return Err(e);
        }
        Ok(found)
    }

    /// One pass of the hidden-download monitor.
    ///
    /// Keeps introduction points for seeded torrents, looks up downloading
    /// ones, tears down hidden circuits of stopped or removed torrents and
    /// keeps data circuits for every hop count in use. Returns the hop
    /// counts whose availability changed.
    pub async fn monitor_downloads(
        &mut self,
        downloads: &[MonitoredDownload],
        now: Instant,
    ) -> Vec<(u8, CircuitAvailability)> {
        let mut live = HashSet::new();
        let mut hop_counts = BTreeSet::new();

        for download in downloads.iter().filter(|d| d.hops > 0) {
            if matches!(download.status, DownloadStatus::Stopped | DownloadStatus::StoppedOnError) {
                continue;
            }
            live.insert(download.infohash);
            hop_counts.insert(download.hops);

            match download.status {
                DownloadStatus::Seeding => self.ensure_intro_points(download.infohash, download.hops).await,
                DownloadStatus::Downloading
                | DownloadStatus::Metadata
                | DownloadStatus::Circuits
                | DownloadStatus::ExitNodes => {
                    let due = self
                        .last_lookup
                        .get(&download.infohash)
                        .is_none_or(|last| now.duration_since(*last) >= self.config.lookup_interval());
                    if due && let Err(e) = self.join_hidden_swarm(download.infohash, download.hops).await {
                        tracing::debug!("Hidden lookup for {} failed: {}", download.infohash, e);
                    }
                }
                _ => {}
            }
        }

        self.teardown_hidden(&live).await;
        for hops in &hop_counts {
            self.ensure_data_circuits(*hops).await;
        }

        let mut changes = Vec::new();
        for hops in hop_counts {
            let availability = self.availability(hops);
            if self.availability.insert(hops, availability) != Some(availability) {
                changes.push((hops, availability));
            }
        }
        changes
    }

    async fn ensure_intro_points(&mut self, infohash: InfoHash, hops: u8) {
        let existing = self
            .circuits
            .values()
            .filter(|c| c.ctype == CircuitType::IntroductionPoint && c.info_hash == Some(infohash))
            .count();
        for _ in existing..self.config.num_intro_points {
            if let Err(e) = self.create_introduction_point(infohash, hops).await {
                tracing::debug!("Cannot create introduction point for {}: {}", infohash, e);
                break;
            }
        }
    }

    async fn ensure_data_circuits(&mut self, hops: u8) {
        loop {
            let for_hops = self
                .circuits
                .values()
                .filter(|c| c.ctype == CircuitType::Data && c.goal_hops == hops)
                .count();
            if for_hops >= DATA_CIRCUITS_PER_HOP_COUNT {
                return;
            }
            if let Err(e) = self.build_circuit(hops).await {
                tracing::debug!("Cannot build {}-hop data circuit: {}", hops, e);
                return;
            }
        }
    }

    async fn teardown_hidden(&mut self, live: &HashSet<InfoHash>) {
        let stale: Vec<u32> = self
            .circuits
            .values()
            .filter(|c| c.ctype != CircuitType::Data)
            .filter(|c| c.info_hash.is_some_and(|infohash| !live.contains(&infohash)))
            .map(|c| c.circuit_id)
            .collect();
        for circuit_id in stale {
            tracing::debug!("Tearing down hidden circuit {} of an inactive torrent", circuit_id);
            let _ = self.remove_circuit(circuit_id, true).await;
        }
        self.services.retain(|_, infohash| live.contains(infohash));
        self.joins.retain(|_, join| live.contains(&join.infohash));
        self.last_lookup.retain(|infohash, _| live.contains(infohash));
    }

    /// Tears down every circuit, paying for local ones.
    pub async fn shutdown(&mut self) {
        let local: Vec<u32> = self.circuits.keys().copied().collect();
        for circuit_id in local {
            let _ = self.remove_circuit(circuit_id, true).await;
        }
        let joined: Vec<u32> = self.joined.keys().copied().collect();
        for circuit_id in joined {
            self.remove_joined(circuit_id, true, true, REASON_SHUTDOWN).await;
        }
        tracing::info!("Tunnel community stopped: {:?}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::endpoint::{Inbox, MemoryNetwork};

    struct Node {
        community: TunnelCommunity,
        inbox: Inbox,
        events: broadcast::Receiver<TunnelEvent>,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn node(network: &MemoryNetwork, port: u16, config: TunnelConfig) -> Node {
        let (endpoint, inbox) = network.endpoint(addr(port));
        let (events, events_rx) = broadcast::channel(64);
        let community = TunnelCommunity::new(
            config,
            Arc::new(endpoint),
            NodeIdentity::from_secret([port as u8; 32]),
            Notifier::new(),
            events,
        );
        Node {
            community,
            inbox,
            events: events_rx,
        }
    }

    fn peer_of(node: &Node, exit_capable: bool) -> PeerRef {
        PeerRef::new(node.community.local_addr(), node.community.public_key(), exit_capable)
    }

    /// Delivers queued datagrams until every inbox is empty.
    async fn pump(nodes: &mut [&mut Node]) {
        loop {
            let mut delivered = false;
            for node in nodes.iter_mut() {
                while let Ok((from, data)) = node.inbox.try_recv() {
                    node.community.handle_datagram(from, &data).await;
                    delivered = true;
                }
            }
            if !delivered {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_two_hop_circuit_becomes_ready() {
        let network = MemoryNetwork::new();
        let mut alice = node(&network, 1, TunnelConfig::default());
        let mut relay = node(&network, 2, TunnelConfig::default());
        let mut exit = node(&network, 3, TunnelConfig::default());
        alice.community.add_peer(peer_of(&relay, false));
        alice.community.add_peer(peer_of(&exit, true));

        let circuit_id = alice.community.build_circuit(2).await.unwrap();
        pump(&mut [&mut alice, &mut relay, &mut exit]).await;

        let circuits = alice.community.circuits();
        assert_eq!(circuits[0].circuit_id, circuit_id);
        assert_eq!(circuits[0].state, CircuitState::Ready);
        assert_eq!(circuits[0].hops, 2);
        assert_eq!(relay.community.joined_count(), 1);
        assert_eq!(exit.community.joined_count(), 1);
        assert_eq!(alice.community.availability(2), CircuitAvailability::Ready);
        assert_eq!(
            alice.events.try_recv().unwrap(),
            TunnelEvent::CircuitReady {
                circuit_id,
                ctype: CircuitType::Data
            }
        );
    }

    #[tokio::test]
    async fn test_data_circuit_requires_an_exit() {
        let network = MemoryNetwork::new();
        let mut alice = node(&network, 1, TunnelConfig::default());
        let relay = node(&network, 2, TunnelConfig::default());
        alice.community.add_peer(peer_of(&relay, false));

        let err = alice.community.build_circuit(1).await.unwrap_err();
        assert!(matches!(err, TunnelError::NoCandidates { hops: 1 }));
        assert_eq!(alice.community.availability(1), CircuitAvailability::NoExits);
    }

    #[tokio::test]
    async fn test_balance_probe_after_random_slots() {
        let network = MemoryNetwork::new();
        let config = TunnelConfig {
            random_slots: 1,
            competing_slots: 1,
            ..TunnelConfig::default()
        };
        let mut exit = node(&network, 9, config);
        let mut clients: Vec<Node> = (1..=3).map(|p| node(&network, p, TunnelConfig::default())).collect();
        for client in &mut clients {
            client.community.add_peer(peer_of(&exit, true));
        }

        // First create takes the random slot without a probe.
        clients[0].community.build_circuit(1).await.unwrap();
        let (from, data) = exit.inbox.try_recv().unwrap();
        exit.community.handle_datagram(from, &data).await;
        assert_eq!(exit.community.joined_count(), 1);
        assert!(exit.community.pending_admissions.is_empty());

        // The second is probed and wins the empty competing slot.
        clients[1].community.build_circuit(1).await.unwrap();
        {
            let [c0, c1, c2] = &mut clients[..] else { unreachable!() };
            pump(&mut [c0, c1, c2, &mut exit]).await;
        }
        assert_eq!(exit.community.joined_count(), 2);
        assert!(clients[1].community.circuits()[0].state == CircuitState::Ready);

        // The third has the same zero balance and loses.
        clients[2].community.build_circuit(1).await.unwrap();
        {
            let [c0, c1, c2] = &mut clients[..] else { unreachable!() };
            pump(&mut [c0, c1, c2, &mut exit]).await;
        }
        assert_eq!(exit.community.joined_count(), 2);
        assert!(clients[2].community.circuits().is_empty());
        assert_eq!(exit.community.stats().admissions_denied, 1);
        assert_eq!(exit.community.slots().competing_slots()[0].0, 0);
    }

    #[tokio::test]
    async fn test_unknown_and_garbage_cells_are_counted() {
        let network = MemoryNetwork::new();
        let mut node = node(&network, 1, TunnelConfig::default());
        node.community.handle_datagram(addr(7), b"garbage").await;
        let stray = Datagram::Plain {
            circuit_id: 5,
            cell: Cell::Created { dh_key: [0; 32] },
        };
        node.community.handle_datagram(addr(7), &stray.encode()).await;
        assert_eq!(node.community.stats().dropped_cells, 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_dropped() {
        let network = MemoryNetwork::new();
        let mut relay = node(&network, 2, TunnelConfig::default());
        let create = Datagram::Plain {
            circuit_id: 77,
            cell: Cell::Create {
                dh_key: DhKeyPair::generate().public_bytes(),
                relayed: false,
            },
        };
        relay.community.handle_datagram(addr(1), &create.encode()).await;
        relay.community.handle_datagram(addr(1), &create.encode()).await;
        assert_eq!(relay.community.joined_count(), 1);
        assert_eq!(relay.community.stats().dropped_cells, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_circuit_times_out() {
        let network = MemoryNetwork::new();
        let mut alice = node(&network, 1, TunnelConfig::default());
        let exit = node(&network, 2, TunnelConfig::default());
        alice.community.add_peer(peer_of(&exit, true));
        network.block(addr(2));

        let circuit_id = alice.community.build_circuit(1).await.unwrap();
        alice.community.tick(Instant::now()).await;
        assert_eq!(alice.community.circuits().len(), 1);

        tokio::time::advance(TunnelConfig::default().build_timeout()).await;
        alice.community.tick(Instant::now()).await;
        assert!(alice.community.circuits().is_empty());
        assert_eq!(
            alice.events.try_recv().unwrap(),
            TunnelEvent::CircuitRemoved { circuit_id }
        );
    }

    #[tokio::test]
    async fn test_monitor_builds_data_circuits_and_reports_availability() {
        let network = MemoryNetwork::new();
        let mut alice = node(&network, 1, TunnelConfig::default());
        let mut exit = node(&network, 2, TunnelConfig::default());
        alice.community.add_peer(peer_of(&exit, true));
        let download = MonitoredDownload {
            infohash: InfoHash::new([4; 20]),
            hops: 1,
            status: DownloadStatus::Downloading,
        };

        let changes = alice.community.monitor_downloads(&[download], Instant::now()).await;
        assert_eq!(changes, vec![(1, CircuitAvailability::Building)]);
        assert_eq!(alice.community.circuits().len(), DATA_CIRCUITS_PER_HOP_COUNT);

        pump(&mut [&mut alice, &mut exit]).await;
        let changes = alice.community.monitor_downloads(&[download], Instant::now()).await;
        assert_eq!(changes, vec![(1, CircuitAvailability::Ready)]);
        assert!(alice.community.monitor_downloads(&[download], Instant::now()).await.is_empty());
    }
}
