//! Bookkeeping for connected peers. Owned exclusively by the peer handler
//! loop; every mutation arrives there through a channel.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::node_peer::NodePeer;

#[derive(Default)]
pub struct PeerState {
    pub inbound: BTreeMap<i32, Arc<NodePeer>>,
    pub outbound: BTreeMap<i32, Arc<NodePeer>>,
    pub persistent: BTreeMap<i32, Arc<NodePeer>>,
    /// Host → ban expiry.
    pub banned: HashMap<String, DateTime<Utc>>,
    /// Network group → number of outbound connections into it.
    pub outbound_groups: HashMap<String, usize>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers across all three maps.
    pub fn count(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.persistent.len()
    }

    pub fn for_all_outbound_peers(&self, mut f: impl FnMut(&Arc<NodePeer>)) {
        self.outbound.values().for_each(&mut f);
        self.persistent.values().for_each(&mut f);
    }

    pub fn for_all_peers(&self, mut f: impl FnMut(&Arc<NodePeer>)) {
        self.inbound.values().for_each(&mut f);
        self.for_all_outbound_peers(f);
    }

    /// Collects every peer into one list, inbound first.
    pub fn all_peers(&self) -> Vec<Arc<NodePeer>> {
        let mut peers = Vec::with_capacity(self.count());
        self.for_all_peers(|p| peers.push(p.clone()));
        peers
    }
}

/// Drop one outbound connection from a network group's count.
pub fn decrement_group(groups: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = groups.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            groups.remove(key);
        }
    }
}
