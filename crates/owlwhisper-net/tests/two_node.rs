//! End-to-end tests against real libp2p swarms over TCP loopback. mDNS is
//! disabled throughout since CI sandboxes rarely route multicast; nodes find
//! each other instead through `custom_bootstrap_nodes`, the same path a real
//! deployment uses to rejoin after every address on a machine changes.

use std::path::Path;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use owlwhisper_net::{cid_for, CoreController, Multiaddr, NodeConfig};
use tokio::time::{sleep, timeout};

fn loopback_only_config(data_dir: &Path) -> NodeConfig {
    NodeConfig {
        data_dir: Some(data_dir.to_path_buf()),
        listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        enable_quic: false,
        enable_websocket: false,
        enable_webrtc: false,
        enable_mdns: false,
        enable_relay: false,
        enable_auto_relay: false,
        enable_nat_portmap: false,
        enable_hole_punching: false,
        enable_autonat_v2: false,
        ..NodeConfig::default()
    }
}

async fn first_listen_address(controller: &CoreController) -> Multiaddr {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Some(addr) = controller.listen_addresses().unwrap().into_iter().next() {
                return addr;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node never reported a listen address")
}

async fn wait_until_connected(controller: &CoreController, peer: libp2p::PeerId) {
    timeout(Duration::from_secs(15), async {
        loop {
            if controller.connected_peers().unwrap().contains(&peer) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("nodes never connected to each other");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_starts_stops_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CoreController::new(loopback_only_config(dir.path()));

    controller.start().await.unwrap();
    let peer_id = controller.my_peer_id().unwrap();
    let _ = first_listen_address(&controller).await;

    let limits = controller.connection_limits().unwrap();
    assert_eq!(limits.total, 0);

    controller.stop().await.unwrap();
    assert!(matches!(controller.my_peer_id(), Err(owlwhisper_net::CoreError::NotRunning)));

    // Restarting after a clean stop must reuse the same persisted identity.
    controller.start().await.unwrap();
    assert_eq!(controller.my_peer_id().unwrap(), peer_id);
    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_bootstrap_connect_and_broadcast() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let node_a = CoreController::new(loopback_only_config(dir_a.path()));
    node_a.start().await.unwrap();
    let addr_a = first_listen_address(&node_a).await;
    let peer_a = node_a.my_peer_id().unwrap();

    let mut config_b = loopback_only_config(dir_b.path());
    config_b.custom_bootstrap_nodes = vec![addr_a.with(Protocol::P2p(peer_a))];
    let node_b = CoreController::new(config_b);
    node_b.start().await.unwrap();

    wait_until_connected(&node_b, peer_a).await;
    let peer_b = node_b.my_peer_id().unwrap();
    wait_until_connected(&node_a, peer_b).await;

    node_b.broadcast(b"hello from b".to_vec().into()).await.unwrap();
    let message = timeout(Duration::from_secs(10), node_a.recv_message())
        .await
        .expect("node_a never received the broadcast")
        .unwrap();
    assert_eq!(message.sender, peer_b);
    assert_eq!(&message.bytes[..], b"hello from b");

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protected_peer_is_redialed_after_restart() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut config_a = loopback_only_config(dir_a.path());
    config_a.reconnect_interval = Duration::from_millis(200);
    let node_a = CoreController::new(config_a);
    node_a.start().await.unwrap();
    let addr_a = first_listen_address(&node_a).await;
    let peer_a = node_a.my_peer_id().unwrap();

    let b_listen: Multiaddr = "/ip4/127.0.0.1/tcp/38123".parse().unwrap();
    let mut config_b = loopback_only_config(dir_b.path());
    config_b.listen_addresses = vec![b_listen];
    config_b.custom_bootstrap_nodes = vec![addr_a.with(Protocol::P2p(peer_a))];
    let node_b = CoreController::new(config_b.clone());
    node_b.start().await.unwrap();
    let peer_b = node_b.my_peer_id().unwrap();

    wait_until_connected(&node_a, peer_b).await;
    node_a.protect(peer_b).unwrap();
    assert!(node_a.is_protected(peer_b).unwrap());

    node_b.stop().await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if !node_a.connected_peers().unwrap().contains(&peer_b) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node_a never noticed node_b's disconnect");

    // Same identity, same listen address as before the restart.
    let node_b = CoreController::new(config_b);
    node_b.start().await.unwrap();
    assert_eq!(node_b.my_peer_id().unwrap(), peer_b);

    wait_until_connected(&node_a, peer_b).await;
    assert!(node_a.reconnect_attempts(peer_b).unwrap().attempts >= 1);
    assert!(node_a.connection_limits().unwrap().protected <= 1);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_channel_overflow_drops_without_blocking() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let node_a = CoreController::new(loopback_only_config(dir_a.path()));
    node_a.start().await.unwrap();
    let addr_a = first_listen_address(&node_a).await;
    let peer_a = node_a.my_peer_id().unwrap();

    let mut config_b = loopback_only_config(dir_b.path());
    config_b.custom_bootstrap_nodes = vec![addr_a.with(Protocol::P2p(peer_a))];
    let node_b = CoreController::new(config_b);
    node_b.start().await.unwrap();

    wait_until_connected(&node_b, peer_a).await;

    // node_a never calls recv_message(); the bounded channel (capacity 100)
    // must fill and drop the rest without broadcast ever blocking.
    for i in 0..200 {
        node_b.broadcast(format!("msg-{i}").into_bytes().into()).await.unwrap();
    }

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn provide_then_find_providers_round_trip() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let node_a = CoreController::new(loopback_only_config(dir_a.path()));
    node_a.start().await.unwrap();
    let addr_a = first_listen_address(&node_a).await;
    let peer_a = node_a.my_peer_id().unwrap();

    let mut config_b = loopback_only_config(dir_b.path());
    config_b.custom_bootstrap_nodes = vec![addr_a.with(Protocol::P2p(peer_a))];
    let node_b = CoreController::new(config_b);
    node_b.start().await.unwrap();

    wait_until_connected(&node_b, peer_a).await;

    let cid = cid_for("owlwhisper-integration-test");
    node_a.provide(cid).await.unwrap();

    let providers = timeout(Duration::from_secs(15), async {
        loop {
            if let Ok(found) = node_b.find_providers(cid).await {
                if found.contains(&peer_a) {
                    return found;
                }
            }
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("node_b never found node_a as a provider");
    assert!(providers.contains(&peer_a));

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}
