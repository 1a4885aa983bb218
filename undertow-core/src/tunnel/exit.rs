//! Exit sockets bridging data circuits to the real swarm.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::TunnelError;
use crate::constants::MAX_CELL_SIZE;

/// Traffic from the swarm that has to travel back on a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPacket {
    pub circuit_id: u32,
    pub origin: SocketAddr,
    pub payload: Vec<u8>,
}

/// UDP socket owned by one exit circuit.
///
/// Every datagram the socket receives is handed to the community as an
/// [`ExitPacket`]; the reader stops when the socket is dropped.
pub struct ExitSocket {
    circuit_id: u32,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ExitSocket {
    /// Binds a fresh socket on an ephemeral port.
    ///
    /// # Errors
    /// - `TunnelError::Io` - no port could be bound
    pub async fn bind(circuit_id: u32, incoming: mpsc::Sender<ExitPacket>) -> Result<Self, TunnelError> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        tracing::debug!(
            "Exit socket for circuit {} bound on {}",
            circuit_id,
            socket.local_addr()?
        );

        let reader_socket = Arc::clone(&socket);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_CELL_SIZE];
            while let Ok((len, origin)) = reader_socket.recv_from(&mut buf).await {
                let packet = ExitPacket {
                    circuit_id,
                    origin,
                    payload: buf[..len].to_vec(),
                };
                if incoming.send(packet).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            circuit_id,
            socket,
            reader,
            bytes_up: 0,
            bytes_down: 0,
        })
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    /// # Errors
    /// - `TunnelError::Io` - the socket is unusable
    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends a circuit payload to a swarm peer.
    ///
    /// # Errors
    /// - `TunnelError::Io` - the datagram could not be sent
    pub async fn send_to(&mut self, destination: SocketAddr, payload: &[u8]) -> Result<(), TunnelError> {
        self.socket.send_to(payload, destination).await?;
        self.bytes_up += payload.len() as u64;
        Ok(())
    }
}

impl Drop for ExitSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
