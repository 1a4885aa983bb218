//! Datagram transports for the overlay.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::TunnelError;
use crate::constants::MAX_CELL_SIZE;

const INBOX_CAPACITY: usize = 1024;

/// Datagrams received by an endpoint, tagged with their sender.
pub type Inbox = mpsc::Receiver<(SocketAddr, Vec<u8>)>;

/// Unreliable datagram transport.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Sends one datagram. Delivery is best effort.
    ///
    /// # Errors
    /// - `TunnelError::Io` - the socket refused the datagram
    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), TunnelError>;
}

/// Overlay endpoint on a real UDP socket.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    reader: JoinHandle<()>,
}

impl UdpEndpoint {
    /// Binds the socket and starts the reader task feeding the returned inbox.
    ///
    /// # Errors
    /// - `TunnelError::Io` - the address could not be bound
    pub async fn bind(addr: SocketAddr) -> Result<(Self, Inbox), TunnelError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);

        let reader_socket = Arc::clone(&socket);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_CELL_SIZE + 1];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if sender.try_send((from, buf[..len].to_vec())).is_err() && sender.is_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Overlay socket read failed: {}", e);
                    }
                }
            }
        });

        tracing::info!("Overlay endpoint listening on {}", local_addr);
        Ok((
            Self {
                socket,
                local_addr,
                reader,
            },
            inbox,
        ))
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), TunnelError> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<SocketAddr, mpsc::Sender<(SocketAddr, Vec<u8>)>>,
    blocked: HashSet<SocketAddr>,
}

/// In-process datagram network for wiring several communities together.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node at `addr`.
    pub fn endpoint(&self, addr: SocketAddr) -> (MemoryEndpoint, Inbox) {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        self.state.lock().nodes.insert(addr, sender);
        (
            MemoryEndpoint {
                network: self.clone(),
                addr,
            },
            inbox,
        )
    }

    /// Silently drops everything sent to or from `addr`.
    pub fn block(&self, addr: SocketAddr) {
        self.state.lock().blocked.insert(addr);
    }

    pub fn unblock(&self, addr: SocketAddr) {
        self.state.lock().blocked.remove(&addr);
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let sender = {
            let state = self.state.lock();
            if state.blocked.contains(&from) || state.blocked.contains(&to) {
                return;
            }
            state.nodes.get(&to).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.try_send((from, data.to_vec()));
        }
    }
}

/// A node's view of a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    network: MemoryNetwork,
    addr: SocketAddr,
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), TunnelError> {
        self.network.deliver(self.addr, addr, data);
        Ok(())
    }
}
