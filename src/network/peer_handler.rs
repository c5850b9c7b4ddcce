//! The node's peer event loop. A single task owns `PeerState`; everything
//! else reaches it through the channels in `PeerHandlerChannels`.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::addr::{addr_string_to_net_addr, group_key};
use super::message::Message;
use super::node_peer::NodePeer;
use super::peer::Peer;
use super::peer_state::{decrement_group, PeerState};
use super::server::Node;
use crate::chain::{BlockHeader, Hash, InvType, InvVect, NetAddress, TxDesc, SF_NODE_NETWORK};
use crate::error::NodeError;

/// Selects peers for the remove/disconnect commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMatch {
    Id(i32),
    Addr(String),
}

impl PeerMatch {
    pub fn matches(&self, sp: &NodePeer) -> bool {
        match self {
            PeerMatch::Id(id) => sp.id() == *id,
            PeerMatch::Addr(addr) => sp.peer.addr() == *addr,
        }
    }
}

/// Data carried alongside relayed inventory so per-peer relay policy can
/// be applied without a lookup.
#[derive(Debug, Clone)]
pub enum RelayData {
    None,
    Header(BlockHeader),
    TxDesc(TxDesc),
}

#[derive(Debug, Clone)]
pub struct RelayMsg {
    pub inv: InvVect,
    pub data: RelayData,
}

pub struct BroadcastMsg {
    pub message: Message,
    pub exclude: Vec<i32>,
}

pub struct UpdatePeerHeightsMsg {
    pub new_hash: Hash,
    pub new_height: i32,
    pub origin_peer: Option<i32>,
}

type Reply<T> = oneshot::Sender<T>;

/// Queries and commands answered by the peer handler.
pub enum NodeCommand {
    ConnectedCount(Reply<i32>),
    OutboundGroupCount { key: String, reply: Reply<usize> },
    Peers(Reply<Vec<Arc<NodePeer>>>),
    ConnectNode {
        addr: String,
        permanent: bool,
        reply: Reply<Result<(), NodeError>>,
    },
    RemoveNode {
        target: PeerMatch,
        reply: Reply<Result<(), NodeError>>,
    },
    DisconnectNode {
        target: PeerMatch,
        reply: Reply<Result<(), NodeError>>,
    },
    AddedNodes(Reply<Vec<Arc<NodePeer>>>),
}

pub struct PeerHandlerChannels {
    pub new_peers: mpsc::Receiver<Arc<NodePeer>>,
    pub done_peers: mpsc::Receiver<Arc<NodePeer>>,
    pub ban_peers: mpsc::Receiver<Arc<dyn Peer>>,
    pub relay_inv: mpsc::Receiver<RelayMsg>,
    pub broadcast: mpsc::Receiver<BroadcastMsg>,
    pub query: mpsc::Receiver<NodeCommand>,
    pub peer_heights: mpsc::Receiver<UpdatePeerHeightsMsg>,
}

/// Sending halves, held by the node.
#[derive(Clone)]
pub struct PeerHandlerSenders {
    pub new_peers: mpsc::Sender<Arc<NodePeer>>,
    pub done_peers: mpsc::Sender<Arc<NodePeer>>,
    pub ban_peers: mpsc::Sender<Arc<dyn Peer>>,
    pub relay_inv: mpsc::Sender<RelayMsg>,
    pub broadcast: mpsc::Sender<BroadcastMsg>,
    pub query: mpsc::Sender<NodeCommand>,
    pub peer_heights: mpsc::Sender<UpdatePeerHeightsMsg>,
}

/// Channel pairs sized by the peer limit.
pub fn peer_handler_channels(max_peers: usize) -> (PeerHandlerSenders, PeerHandlerChannels) {
    let cap = max_peers.max(1);
    let (new_tx, new_rx) = mpsc::channel(cap);
    let (done_tx, done_rx) = mpsc::channel(cap);
    let (ban_tx, ban_rx) = mpsc::channel(cap);
    let (relay_tx, relay_rx) = mpsc::channel(cap);
    let (bcast_tx, bcast_rx) = mpsc::channel(cap);
    let (query_tx, query_rx) = mpsc::channel(cap);
    let (heights_tx, heights_rx) = mpsc::channel(cap);
    (
        PeerHandlerSenders {
            new_peers: new_tx,
            done_peers: done_tx,
            ban_peers: ban_tx,
            relay_inv: relay_tx,
            broadcast: bcast_tx,
            query: query_tx,
            peer_heights: heights_tx,
        },
        PeerHandlerChannels {
            new_peers: new_rx,
            done_peers: done_rx,
            ban_peers: ban_rx,
            relay_inv: relay_rx,
            broadcast: bcast_rx,
            query: query_rx,
            peer_heights: heights_rx,
        },
    )
}

/// Runs until the node's quit token fires.
pub async fn peer_handler(node: Arc<Node>, mut ch: PeerHandlerChannels) {
    node.addr_manager.start();
    node.sync_manager.start();
    tracing::trace!("starting peer handler");

    let mut state = PeerState::new();

    if !node.settings.disable_dns_seed && node.settings.connect_peers.is_empty() {
        let seeder = node.clone();
        tokio::spawn(async move { seed_from_dns(seeder).await });
    }
    node.conn_manager.start();

    let quit = node.quit_token();
    loop {
        // Adds are drained ahead of dones so a peer is never removed before
        // it was inserted.
        tokio::select! {
            biased;
            _ = quit.cancelled() => {
                state.for_all_peers(|sp| {
                    tracing::trace!("shutdown peer {}", sp);
                    sp.peer.disconnect();
                });
                break;
            }
            Some(sp) = ch.new_peers.recv() => {
                handle_add_peer(&node, &mut state, sp);
            }
            Some(sp) = ch.done_peers.recv() => {
                handle_done_peer(&node, &mut state, &sp);
            }
            Some(umsg) = ch.peer_heights.recv() => {
                handle_update_peer_heights(&state, &umsg);
            }
            Some(peer) = ch.ban_peers.recv() => {
                handle_ban_peer(&node, &mut state, peer.as_ref());
            }
            Some(msg) = ch.relay_inv.recv() => {
                handle_relay_inv(&state, &msg);
            }
            Some(msg) = ch.broadcast.recv() => {
                handle_broadcast(&state, msg);
            }
            Some(cmd) = ch.query.recv() => {
                handle_query(&node, &mut state, cmd).await;
            }
        }
    }

    node.conn_manager.stop();
    if let Err(e) = node.sync_manager.stop() {
        tracing::error!("{}", e);
    }
    if let Err(e) = node.addr_manager.stop() {
        tracing::error!("{}", e);
    }

    // Drain so nothing is left blocked on a send.
    while ch.new_peers.try_recv().is_ok() {}
    while ch.done_peers.try_recv().is_ok() {}
    while ch.peer_heights.try_recv().is_ok() {}
    while ch.ban_peers.try_recv().is_ok() {}
    while ch.relay_inv.try_recv().is_ok() {}
    while ch.broadcast.try_recv().is_ok() {}
    while ch.query.try_recv().is_ok() {}
    tracing::trace!("peer handler done");
}

async fn seed_from_dns(node: Arc<Node>) {
    let network = node.settings.network;
    let port = network.default_p2p_port();
    for seed in network.dns_seeds() {
        let resolved = match tokio::net::lookup_host((*seed, port)).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::info!("DNS discovery failed on seed {}: {}", seed, e);
                continue;
            }
        };
        let addrs: Vec<NetAddress> = resolved
            .map(|sa: SocketAddr| NetAddress::new(sa.ip(), sa.port(), SF_NODE_NETWORK))
            .collect();
        let Some(src) = addrs.first().cloned() else {
            continue;
        };
        tracing::debug!("{} addresses found from DNS seed {}", addrs.len(), seed);
        node.addr_manager.add_addresses(&addrs, &src);
    }
}

/// Admits a peer that completed the handshake. Returns whether it was
/// added.
pub fn handle_add_peer(node: &Node, state: &mut PeerState, sp: Arc<NodePeer>) -> bool {
    if node.is_shutting_down() {
        tracing::info!("new peer {} ignored - server is shutting down", sp);
        sp.peer.disconnect();
        return false;
    }
    if !sp.peer.connected() {
        tracing::debug!("new peer {} already disconnected - ignoring", sp);
        return false;
    }
    let addr = sp.peer.addr();
    let Some(host) = super::addr::host_of(&addr).map(str::to_string) else {
        tracing::error!("can't split host/port for peer {}", addr);
        sp.peer.disconnect();
        return false;
    };
    if let Some(ban_end) = state.banned.get(&host).copied() {
        let now = chrono::Utc::now();
        if now < ban_end {
            tracing::debug!(
                "peer {} is banned for another {} - disconnecting",
                host,
                humanize(ban_end - now)
            );
            sp.peer.disconnect();
            return false;
        }
        tracing::info!("peer {} is no longer banned", host);
        state.banned.remove(&host);
    }
    if state.count() >= node.settings.max_peers {
        tracing::info!(
            "max peers reached [{}] - disconnecting peer {}",
            node.settings.max_peers,
            sp
        );
        sp.peer.disconnect();
        return false;
    }

    tracing::debug!("new peer {}", sp);
    if sp.peer.inbound() {
        state.inbound.insert(sp.id(), sp);
    } else {
        *state
            .outbound_groups
            .entry(group_key(sp.peer.na().as_ref()))
            .or_insert(0) += 1;
        if sp.extras.persistent {
            state.persistent.insert(sp.id(), sp);
        } else {
            state.outbound.insert(sp.id(), sp);
        }
    }
    true
}

pub fn handle_done_peer(node: &Node, state: &mut PeerState, sp: &NodePeer) {
    let inbound = sp.peer.inbound();
    let list = if sp.extras.persistent {
        &mut state.persistent
    } else if inbound {
        &mut state.inbound
    } else {
        &mut state.outbound
    };
    if list.remove(&sp.id()).is_some() {
        if !inbound && sp.peer.version_known() {
            decrement_group(&mut state.outbound_groups, &group_key(sp.peer.na().as_ref()));
        }
        if !inbound {
            if let Some(id) = sp.extras.conn_req {
                node.conn_manager.disconnect(id);
            }
        }
        tracing::debug!("removed peer {}", sp);
        return;
    }
    if let Some(id) = sp.extras.conn_req {
        node.conn_manager.disconnect(id);
    }
    // Unknown or already removed. Still record that the address was good.
    if sp.peer.ver_ack_received() && sp.peer.version_known() {
        if let Some(na) = sp.peer.na() {
            node.addr_manager.connected(&na);
        }
    }
}

/// A repeat ban replaces the previous expiry, restarting the window.
pub fn handle_ban_peer(node: &Node, state: &mut PeerState, peer: &dyn Peer) {
    let addr = peer.addr();
    let Some(host) = super::addr::host_of(&addr) else {
        tracing::debug!("can't split ban peer {}", addr);
        return;
    };
    let direction = if peer.inbound() { "inbound" } else { "outbound" };
    let duration = node.settings.ban_duration;
    tracing::info!(
        "banned peer {} ({}) for {}",
        host,
        direction,
        humanize(duration)
    );
    state
        .banned
        .insert(host.to_string(), chrono::Utc::now() + duration);
}

pub fn handle_relay_inv(state: &PeerState, msg: &RelayMsg) {
    state.for_all_peers(|sp| {
        if !sp.peer.connected() {
            return;
        }
        if msg.inv.inv_type == InvType::Block && sp.peer.wants_headers() {
            match &msg.data {
                RelayData::Header(header) => {
                    sp.peer.queue_message(Message::Headers(vec![*header]), None);
                }
                _ => tracing::warn!("underlying data for headers inv relay is not a block header"),
            }
            return;
        }
        if msg.inv.inv_type == InvType::Tx {
            if sp.relay_tx_disabled() {
                return;
            }
            let RelayData::TxDesc(desc) = &msg.data else {
                tracing::warn!("underlying data for tx inv relay is not a transaction descriptor");
                return;
            };
            let fee_filter = sp.fee_filter();
            if fee_filter > 0 && desc.fee_per_kb < fee_filter {
                return;
            }
            let mut filter = sp.extras.filter.lock();
            if filter.is_loaded() && !filter.match_tx_and_update(&desc.tx) {
                return;
            }
        }
        // Inventory the peer already knows is dropped by queue_inventory.
        sp.peer.queue_inventory(msg.inv);
    });
}

pub fn handle_broadcast(state: &PeerState, msg: BroadcastMsg) {
    state.for_all_peers(|sp| {
        if !sp.peer.connected() || msg.exclude.contains(&sp.id()) {
            return;
        }
        sp.peer.queue_message(msg.message.clone(), None);
    });
}

pub fn handle_update_peer_heights(state: &PeerState, umsg: &UpdatePeerHeightsMsg) {
    state.for_all_peers(|sp| {
        // The origin peer already has the new height.
        if Some(sp.id()) == umsg.origin_peer {
            return;
        }
        if sp.peer.last_announced_block() == Some(umsg.new_hash) {
            sp.peer.update_last_block_height(umsg.new_height);
            sp.peer.update_last_announced_block(None);
        }
    });
}

/// Removes the first peer in `list` that matches `target`, running
/// `when_found` on it beforehand, and disconnects it.
pub fn disconnect_peer(
    list: &mut BTreeMap<i32, Arc<NodePeer>>,
    target: &PeerMatch,
    mut when_found: impl FnMut(&Arc<NodePeer>),
) -> bool {
    let Some(id) = list
        .iter()
        .find(|(_, sp)| target.matches(sp))
        .map(|(id, _)| *id)
    else {
        return false;
    };
    if let Some(sp) = list.remove(&id) {
        when_found(&sp);
        sp.peer.disconnect();
    }
    true
}

/// Number of distinct remote instances. Peers reporting a nonce in their
/// user agent are keyed by that nonce and our local IP, so an inbound and
/// an outbound link to the same remote node count once. This differs from
/// a plain connection count on purpose.
pub fn connected_count(state: &PeerState) -> i32 {
    let mut dedupe = HashSet::new();
    state.for_all_peers(|sp| {
        if !sp.peer.connected() {
            return;
        }
        let local = sp
            .peer
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let ua = sp.peer.user_agent();
        let parts: Vec<&str> = ua.split("nonce").collect();
        if parts.len() < 2 {
            dedupe.insert(format!("{}/{}", local, sp.peer.addr()));
        } else {
            let nonce = parts[1].get(..8).unwrap_or(parts[1]);
            let local_ip = local.split(':').next().unwrap_or_default();
            dedupe.insert(format!("{}/{}", nonce, local_ip));
        }
    });
    dedupe.len() as i32
}

pub async fn handle_query(node: &Node, state: &mut PeerState, cmd: NodeCommand) {
    match cmd {
        NodeCommand::ConnectedCount(reply) => {
            let _ = reply.send(connected_count(state));
        }
        NodeCommand::OutboundGroupCount { key, reply } => {
            let _ = reply.send(state.outbound_groups.get(&key).copied().unwrap_or(0));
        }
        NodeCommand::Peers(reply) => {
            let mut peers = Vec::with_capacity(state.count());
            state.for_all_peers(|sp| {
                if sp.peer.connected() {
                    peers.push(sp.clone());
                }
            });
            let _ = reply.send(peers);
        }
        NodeCommand::ConnectNode {
            addr,
            permanent,
            reply,
        } => {
            let _ = reply.send(connect_node(node, state, &addr, permanent).await);
        }
        NodeCommand::RemoveNode { target, reply } => {
            let groups = &mut state.outbound_groups;
            let found = disconnect_peer(&mut state.persistent, &target, |sp| {
                decrement_group(groups, &group_key(sp.peer.na().as_ref()));
            });
            let _ = reply.send(if found { Ok(()) } else { Err(NodeError::PeerNotFound) });
        }
        NodeCommand::DisconnectNode { target, reply } => {
            if disconnect_peer(&mut state.inbound, &target, |_| {}) {
                let _ = reply.send(Ok(()));
                return;
            }
            let groups = &mut state.outbound_groups;
            let mut decrement = |sp: &Arc<NodePeer>| {
                decrement_group(groups, &group_key(sp.peer.na().as_ref()));
            };
            let mut found = disconnect_peer(&mut state.outbound, &target, &mut decrement);
            if !found {
                let _ = reply.send(Err(NodeError::PeerNotFound));
                return;
            }
            // Several outbound links may share the address; drop them all.
            while found {
                found = disconnect_peer(&mut state.outbound, &target, &mut decrement);
            }
            let _ = reply.send(Ok(()));
        }
        NodeCommand::AddedNodes(reply) => {
            let _ = reply.send(state.persistent.values().cloned().collect());
        }
    }
}

async fn connect_node(
    node: &Node,
    state: &PeerState,
    addr: &str,
    permanent: bool,
) -> Result<(), NodeError> {
    if state.count() >= node.settings.max_peers {
        return Err(NodeError::MaxPeers);
    }
    if state.persistent.values().any(|sp| sp.peer.addr() == addr) {
        return Err(if permanent {
            NodeError::AlreadyConnected
        } else {
            NodeError::ExistsAsPermanent
        });
    }
    let net_addr = addr_string_to_net_addr(addr, node.settings.onion_enabled).await?;
    let conn_manager = node.conn_manager.clone();
    tokio::spawn(async move { conn_manager.connect(net_addr, permanent).await });
    Ok(())
}

/// Formats a duration the way operators read it in logs, e.g. `23h59m5s`.
pub fn humanize(d: chrono::Duration) -> String {
    let total = d.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m{}s", m, s),
        _ => format!("{}h{}m{}s", h, m, s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(chrono::Duration::seconds(5)), "5s");
        assert_eq!(humanize(chrono::Duration::seconds(125)), "2m5s");
        assert_eq!(humanize(chrono::Duration::hours(24)), "24h0m0s");
        assert_eq!(humanize(chrono::Duration::seconds(-3)), "0s");
    }

    #[test]
    fn test_peer_handler_channels_minimum_capacity() {
        let (tx, _rx) = peer_handler_channels(0);
        assert_eq!(tx.new_peers.capacity(), 1);
    }
}
