use std::net::SocketAddr;
use tokio::sync::oneshot;

use super::message::Message;
use crate::chain::{Hash, InvVect, NetAddress};

/// Snapshot of per-connection counters reported by `getpeerinfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerStats {
    pub id: i32,
    pub addr: String,
    pub services: u64,
    pub last_send: i64,
    pub last_recv: i64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub conn_time: i64,
    pub time_offset: i64,
    pub version: u32,
    pub user_agent: String,
    pub inbound: bool,
    pub starting_height: i32,
    pub last_block: i32,
    pub last_ping_time: i64,
    pub last_ping_micros: i64,
}

/// Capabilities of a wire-level peer connection: handshake, framing and
/// the outbound queue live behind this.
pub trait Peer: Send + Sync {
    fn id(&self) -> i32;
    /// Remote `host:port`.
    fn addr(&self) -> String;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn inbound(&self) -> bool;
    fn connected(&self) -> bool;
    fn disconnect(&self);

    fn user_agent(&self) -> String;
    fn protocol_version(&self) -> u32;
    fn services(&self) -> u64;
    fn na(&self) -> Option<NetAddress>;
    fn version_known(&self) -> bool;
    fn ver_ack_received(&self) -> bool;
    fn wants_headers(&self) -> bool;

    fn last_announced_block(&self) -> Option<Hash>;
    fn update_last_announced_block(&self, hash: Option<Hash>);
    fn update_last_block_height(&self, height: i32);

    /// Queue a message; `done` fires once it has been written.
    fn queue_message(&self, msg: Message, done: Option<oneshot::Sender<()>>);
    /// Queue an inventory announcement, skipping inventory the peer already
    /// knows about.
    fn queue_inventory(&self, inv: InvVect);
    fn add_known_inventory(&self, inv: InvVect);
    /// Send an addr message and return the addresses actually sent.
    fn push_addr_msg(&self, addrs: Vec<NetAddress>) -> Result<Vec<NetAddress>, String>;

    fn stats(&self) -> PeerStats;
}
