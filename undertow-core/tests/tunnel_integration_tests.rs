//! Integration tests for the tunnel community.
//!
//! Several communities are wired together over an in-process datagram
//! network and driven only through their public handles. Exit nodes talk
//! to a real UDP echo server on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;
use undertow_core::config::TunnelConfig;
use undertow_core::constants::MIB;
use undertow_core::torrent::InfoHash;
use undertow_core::tunnel::{
    CircuitType, MemoryDirectory, MemoryNetwork, NodeIdentity, PeerRef, TunnelDeps, TunnelEvent,
    TunnelHandle, spawn_tunnel_community,
};

const WAIT: Duration = Duration::from_secs(10);

struct TestNode {
    handle: TunnelHandle,
    peer: PeerRef,
}

fn node_addr(octet: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, octet], 7759))
}

fn spawn_node(
    network: &MemoryNetwork,
    octet: u8,
    config: TunnelConfig,
    directory: Option<&MemoryDirectory>,
) -> TestNode {
    let exit_capable = config.exitnode_enabled;
    let identity = NodeIdentity::from_secret([octet; 32]);
    let public_key = identity.public_key();
    let (endpoint, inbox) = network.endpoint(node_addr(octet));
    let mut deps = TunnelDeps::new(Arc::new(endpoint), inbox).with_identity(identity);
    if let Some(directory) = directory {
        deps = deps.with_directory(Arc::new(directory.clone()));
    }
    TestNode {
        handle: spawn_tunnel_community(config, deps),
        peer: PeerRef::new(node_addr(octet), public_key, exit_capable),
    }
}

fn exit_config() -> TunnelConfig {
    TunnelConfig {
        exitnode_enabled: true,
        ..TunnelConfig::default()
    }
}

async fn spawn_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });
    addr
}

async fn wait_for<F>(events: &mut broadcast::Receiver<TunnelEvent>, mut matches: F) -> TunnelEvent
where
    F: FnMut(&TunnelEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for tunnel event")
}

async fn wait_for_balance(handle: &TunnelHandle, expected: i64) {
    let reached = timeout(WAIT, async {
        while handle.get_balance().await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "balance stuck at {}, expected {}",
        handle.get_balance().await.unwrap(),
        expected
    );
}

/// Builds a three-hop data circuit and waits until it is ready.
async fn three_hop_circuit(network: &MemoryNetwork) -> (TestNode, Vec<TestNode>, u32) {
    let initiator = spawn_node(network, 1, TunnelConfig::default(), None);
    let relays = vec![
        spawn_node(network, 2, TunnelConfig::default(), None),
        spawn_node(network, 3, TunnelConfig::default(), None),
        spawn_node(network, 4, exit_config(), None),
    ];
    for relay in &relays {
        initiator.handle.add_peer(relay.peer).await.unwrap();
    }

    let mut events = initiator.handle.subscribe();
    let circuit_id = initiator.handle.build_circuit(3).await.unwrap();
    wait_for(&mut events, |event| {
        *event
            == TunnelEvent::CircuitReady {
                circuit_id,
                ctype: CircuitType::Data,
            }
    })
    .await;
    (initiator, relays, circuit_id)
}

#[tokio::test]
async fn test_data_travels_through_three_hops_and_back() {
    let network = MemoryNetwork::new();
    let echo = spawn_echo_server().await;
    let (initiator, relays, circuit_id) = three_hop_circuit(&network).await;

    let mut events = initiator.handle.subscribe();
    initiator
        .handle
        .send_data(circuit_id, echo, Bytes::from_static(b"ping through the onion"))
        .await
        .unwrap();

    let event = wait_for(&mut events, |event| matches!(event, TunnelEvent::Data { .. })).await;
    let TunnelEvent::Data {
        circuit_id: cid,
        origin,
        payload,
    } = event
    else {
        unreachable!();
    };
    assert_eq!(cid, circuit_id);
    assert_eq!(origin, echo);
    assert_eq!(&payload[..], b"ping through the onion");

    let circuits = initiator.handle.get_circuits().await.unwrap();
    assert_eq!(circuits[0].bytes_up, 22);
    assert_eq!(circuits[0].bytes_down, 22);
    // Only the middle relays move onions along.
    assert!(relays[0].handle.get_stats().await.unwrap().bytes_relayed > 0);
    assert_eq!(relays[2].handle.get_stats().await.unwrap().circuits_joined, 1);
}

#[tokio::test]
async fn test_full_relay_rejects_circuit() {
    let network = MemoryNetwork::new();
    let initiator = spawn_node(&network, 1, TunnelConfig::default(), None);
    let exit = spawn_node(
        &network,
        2,
        TunnelConfig {
            random_slots: 0,
            competing_slots: 0,
            ..exit_config()
        },
        None,
    );
    initiator.handle.add_peer(exit.peer).await.unwrap();

    let mut events = initiator.handle.subscribe();
    let circuit_id = initiator.handle.build_circuit(1).await.unwrap();
    wait_for(&mut events, |event| {
        *event == TunnelEvent::CircuitRemoved { circuit_id }
    })
    .await;

    assert!(initiator.handle.get_circuits().await.unwrap().is_empty());
    let stats = exit.handle.get_stats().await.unwrap();
    assert_eq!(stats.admissions_denied, 1);
    assert_eq!(stats.circuits_joined, 0);
}

#[tokio::test]
async fn test_closing_a_busy_circuit_pays_every_hop() {
    let network = MemoryNetwork::new();
    let echo = spawn_echo_server().await;
    let (initiator, relays, circuit_id) = three_hop_circuit(&network).await;

    let chunk = Bytes::from(vec![0x5a; 50_000]);
    let expected_down = 30 * chunk.len() as u64;
    for _ in 0..30 {
        initiator
            .handle
            .send_data(circuit_id, echo, chunk.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let delivered = timeout(WAIT, async {
        loop {
            let circuits = initiator.handle.get_circuits().await.unwrap();
            if circuits[0].bytes_down >= expected_down {
                return circuits[0].bytes_down;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("echoed data did not come back");
    assert!(delivered >= MIB);

    initiator.handle.remove_circuit(circuit_id).await.unwrap();

    let base = delivered as i64;
    wait_for_balance(&initiator.handle, -5 * base).await;
    wait_for_balance(&relays[0].handle, 2 * base).await;
    wait_for_balance(&relays[1].handle, 2 * base).await;
    wait_for_balance(&relays[2].handle, base).await;
    assert_eq!(initiator.handle.get_stats().await.unwrap().payouts_sent, 1);
}

#[tokio::test]
async fn test_hidden_seeder_and_downloader_meet_at_rendezvous() {
    let network = MemoryNetwork::new();
    let directory = MemoryDirectory::new();
    let seeder = spawn_node(&network, 1, TunnelConfig::default(), Some(&directory));
    let downloader = spawn_node(&network, 2, TunnelConfig::default(), Some(&directory));
    let relays = [
        spawn_node(&network, 3, TunnelConfig::default(), None),
        spawn_node(&network, 4, TunnelConfig::default(), None),
    ];
    for relay in &relays {
        seeder.handle.add_peer(relay.peer).await.unwrap();
        downloader.handle.add_peer(relay.peer).await.unwrap();
    }
    let infohash = InfoHash::new([0x42; 20]);

    let mut seeder_events = seeder.handle.subscribe();
    seeder.handle.create_introduction_point(infohash, 1).await.unwrap();
    wait_for(&mut seeder_events, |event| {
        matches!(event, TunnelEvent::ServiceAnnounced { infohash: ih, .. } if *ih == infohash)
    })
    .await;

    let mut downloader_events = downloader.handle.subscribe();
    assert_eq!(downloader.handle.join_hidden_swarm(infohash, 1).await.unwrap(), 1);

    let TunnelEvent::PeerConnected { addr: seeder_addr, .. } =
        wait_for(&mut downloader_events, |event| {
            matches!(event, TunnelEvent::PeerConnected { .. })
        })
        .await
    else {
        unreachable!();
    };
    let TunnelEvent::PeerConnected {
        infohash: seen,
        circuit_id: seeder_circuit,
        ..
    } = wait_for(&mut seeder_events, |event| {
        matches!(event, TunnelEvent::PeerConnected { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(seen, infohash);
    assert_eq!(seeder_addr.ip().to_string(), "1.1.1.1");

    downloader
        .handle
        .send_to_peer(seeder_addr, Bytes::from_static(b"bitfield"))
        .await
        .unwrap();
    let TunnelEvent::Data {
        circuit_id, payload, ..
    } = wait_for(&mut seeder_events, |event| matches!(event, TunnelEvent::Data { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(circuit_id, seeder_circuit);
    assert_eq!(&payload[..], b"bitfield");

    // Lookup circuits are gone once the link is up.
    let circuits = downloader.handle.get_circuits().await.unwrap();
    assert!(circuits.iter().all(|c| c.ctype != CircuitType::Lookup));
}

#[tokio::test]
async fn test_handle_reports_shutdown() {
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, 1, TunnelConfig::default(), None);
    node.handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!node.handle.is_running());
    assert!(node.handle.get_stats().await.is_err());
}
