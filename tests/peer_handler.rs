mod common;

use common::{eventually, test_node, test_settings, wait_for_peers, MockPeer};
use podd::error::NodeError;
use podd::network::message::Message;
use podd::network::peer_handler::{
    connected_count, handle_add_peer, handle_ban_peer, handle_done_peer,
};
use podd::network::peer_state::PeerState;
use podd::network::{NodePeer, Peer, PeerMatch};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_added_peers_are_counted_and_listed() {
    let t = test_node(test_settings());
    t.node.start();

    let a = MockPeer::new("10.1.0.1:18444", true);
    let b = MockPeer::new("10.1.0.2:18444", false);
    t.node.add_peer(NodePeer::new(t.node.clone(), a.clone(), false, None)).await;
    t.node.add_peer(NodePeer::new(t.node.clone(), b.clone(), true, Some(7))).await;

    assert!(wait_for_peers(&t.node, 2).await);
    assert_eq!(t.node.peers().await.len(), 2);

    let added = t.node.added_nodes().await;
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].peer.addr(), "10.1.0.2:18444");

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_banned_host_is_refused_on_reconnect() {
    let t = test_node(test_settings());
    t.node.start();

    let first = MockPeer::new("10.2.0.1:18444", true);
    let sp = NodePeer::new(t.node.clone(), first.clone(), false, None);
    t.node.add_peer(sp.clone()).await;
    assert!(wait_for_peers(&t.node, 1).await);

    sp.add_ban_score(101, 0, "test misbehaviour").await;
    assert!(!first.connected());

    // same host, different port
    let again = MockPeer::new("10.2.0.1:20000", true);
    let node = t.node.clone();
    let again_peer = again.clone();
    assert!(
        eventually(|| {
            let node = node.clone();
            let again = again_peer.clone();
            async move {
                node.add_peer(NodePeer::new(node.clone(), again.clone(), false, None)).await;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                !again.connected()
            }
        })
        .await
    );

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_disconnect_and_remove_node() {
    let t = test_node(test_settings());
    t.node.start();

    let inbound = MockPeer::new("10.3.0.1:18444", true);
    let persistent = MockPeer::new("10.3.0.2:18444", false);
    t.node.add_peer(NodePeer::new(t.node.clone(), inbound.clone(), false, None)).await;
    t.node.add_peer(NodePeer::new(t.node.clone(), persistent.clone(), true, None)).await;
    assert!(wait_for_peers(&t.node, 2).await);

    t.node
        .disconnect_node(PeerMatch::Addr("10.3.0.1:18444".into()))
        .await
        .unwrap();
    assert!(!inbound.connected());

    assert_eq!(
        t.node.disconnect_node(PeerMatch::Id(-1)).await,
        Err(NodeError::PeerNotFound)
    );
    // persistent peers are only removed with remove_node
    assert_eq!(
        t.node
            .disconnect_node(PeerMatch::Addr("10.3.0.2:18444".into()))
            .await,
        Err(NodeError::PeerNotFound)
    );
    t.node
        .remove_node(PeerMatch::Id(persistent.id()))
        .await
        .unwrap();
    assert!(!persistent.connected());
    assert!(t.node.added_nodes().await.is_empty());

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_broadcast_skips_excluded_peers() {
    let t = test_node(test_settings());
    t.node.start();

    let a = MockPeer::new("10.4.0.1:18444", true);
    let b = MockPeer::new("10.4.0.2:18444", true);
    t.node.add_peer(NodePeer::new(t.node.clone(), a.clone(), false, None)).await;
    t.node.add_peer(NodePeer::new(t.node.clone(), b.clone(), false, None)).await;
    assert!(wait_for_peers(&t.node, 2).await);

    t.node
        .broadcast_message(Message::Ping(9), vec![a.id()])
        .await;
    let b_seen = b.clone();
    assert!(
        eventually(|| {
            let b = b_seen.clone();
            async move { b.commands().contains(&"ping") }
        })
        .await
    );
    assert!(!a.commands().contains(&"ping"));

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_connect_node_goes_through_conn_manager() {
    let t = test_node(test_settings());
    t.node.start();

    t.node.connect_node("127.0.0.1:18444", false).await.unwrap();
    let cm = t.conn_manager.clone();
    assert!(
        eventually(|| {
            let cm = cm.clone();
            async move { cm.requests.lock().len() == 1 }
        })
        .await
    );
    let (addr, permanent) = t.conn_manager.requests.lock()[0];
    assert_eq!(addr.port(), 18444);
    assert!(!permanent);

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_done_after_blocked_add_leaves_no_peer_behind() {
    let mut settings = test_settings();
    settings.max_peers = 2;
    let t = test_node(settings);

    let a = MockPeer::new("10.6.0.1:18444", true);
    let b = MockPeer::new("10.6.0.2:18444", true);
    let c = MockPeer::new("10.6.0.3:18444", false);
    let sp_a = NodePeer::new(t.node.clone(), a.clone(), false, None);
    let sp_b = NodePeer::new(t.node.clone(), b.clone(), false, None);
    let sp_c = NodePeer::new(t.node.clone(), c.clone(), true, None);

    // The handler is not running yet, so the third add waits for room in
    // the queue and the dones queue up behind it.
    let node = t.node.clone();
    let lifecycle = tokio::spawn(async move {
        node.add_peer(sp_a.clone()).await;
        node.add_peer(sp_b).await;
        node.add_peer(sp_c.clone()).await;
        sp_a.peer.disconnect();
        node.peer_done(sp_a).await;
        sp_c.peer.disconnect();
        node.peer_done(sp_c).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!lifecycle.is_finished());

    t.node.start();
    tokio::time::timeout(Duration::from_secs(5), lifecycle)
        .await
        .expect("lifecycle finished")
        .unwrap();

    assert!(wait_for_peers(&t.node, 1).await);
    assert!(t.node.added_nodes().await.is_empty());
    let peers = t.node.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer.addr(), "10.6.0.2:18444");

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_max_peers_rejects_extra_inbound() {
    let mut settings = test_settings();
    settings.max_peers = 1;
    let t = test_node(settings);
    t.node.start();

    let first = MockPeer::new("10.7.0.1:18444", true);
    let second = MockPeer::new("10.7.0.2:18444", true);
    t.node
        .add_peer(NodePeer::new(t.node.clone(), first.clone(), false, None))
        .await;
    assert!(wait_for_peers(&t.node, 1).await);
    t.node
        .add_peer(NodePeer::new(t.node.clone(), second.clone(), false, None))
        .await;

    let second_seen = second.clone();
    assert!(
        eventually(|| {
            let second = second_seen.clone();
            async move { !second.connected() }
        })
        .await
    );
    assert!(first.connected());
    assert_eq!(t.node.connected_count().await, 1);
    assert_eq!(t.node.peers().await.len(), 1);

    t.node.stop().unwrap();
}

#[tokio::test]
async fn test_connected_count_dedupes_same_nonce() {
    let t = test_node(test_settings());
    t.node.start();

    let ua = "/pod:0.1/nonce:0badc0de/";
    let inbound = MockPeer::with_user_agent("10.8.0.1:18444", true, ua);
    let outbound = MockPeer::with_user_agent("10.8.0.1:50123", false, ua);
    t.node
        .add_peer(NodePeer::new(t.node.clone(), inbound, false, None))
        .await;
    t.node
        .add_peer(NodePeer::new(t.node.clone(), outbound, false, None))
        .await;

    let node = t.node.clone();
    assert!(
        eventually(|| {
            let node = node.clone();
            async move { node.peers().await.len() == 2 }
        })
        .await
    );
    assert_eq!(t.node.connected_count().await, 1);

    t.node.stop().unwrap();
}

fn membership(state: &PeerState, id: i32) -> usize {
    [&state.inbound, &state.outbound, &state.persistent]
        .iter()
        .filter(|map| map.contains_key(&id))
        .count()
}

#[tokio::test]
async fn test_peer_lives_in_exactly_one_map() {
    let t = test_node(test_settings());
    let mut state = PeerState::new();

    let peers: Vec<Arc<NodePeer>> = vec![
        NodePeer::new(t.node.clone(), MockPeer::new("10.9.0.1:18444", true), false, None),
        NodePeer::new(t.node.clone(), MockPeer::new("10.9.0.2:18444", false), false, Some(1)),
        NodePeer::new(t.node.clone(), MockPeer::new("10.9.0.3:18444", false), true, Some(2)),
    ];
    for sp in &peers {
        assert!(handle_add_peer(&t.node, &mut state, sp.clone()));
        assert_eq!(membership(&state, sp.id()), 1);
    }
    assert_eq!(state.inbound.len(), 1);
    assert_eq!(state.outbound.len(), 1);
    assert_eq!(state.persistent.len(), 1);
    assert_eq!(state.count(), 3);

    handle_done_peer(&t.node, &mut state, &peers[1]);
    assert_eq!(membership(&state, peers[1].id()), 0);
    // A second done for the same peer is a no-op.
    handle_done_peer(&t.node, &mut state, &peers[1]);
    for sp in [&peers[0], &peers[2]] {
        assert_eq!(membership(&state, sp.id()), 1);
    }
    assert_eq!(connected_count(&state), 2);

    for sp in &peers {
        handle_done_peer(&t.node, &mut state, sp);
        assert_eq!(membership(&state, sp.id()), 0);
    }
    assert_eq!(state.count(), 0);
    assert!(state.outbound_groups.is_empty());
}

#[tokio::test]
async fn test_repeat_ban_replaces_expiry() {
    let t = test_node(test_settings());
    let mut state = PeerState::new();
    let peer = MockPeer::new("10.10.0.1:18444", true);

    handle_ban_peer(&t.node, &mut state, peer.as_ref());
    let first = state.banned["10.10.0.1"];
    // Pretend the first ban was recorded long ago.
    state
        .banned
        .insert("10.10.0.1".to_string(), first - chrono::Duration::hours(12));

    handle_ban_peer(&t.node, &mut state, peer.as_ref());
    let second = state.banned["10.10.0.1"];
    assert_eq!(state.banned.len(), 1);
    assert!(second >= first);
    assert!(second - chrono::Utc::now() > chrono::Duration::hours(23));
}
