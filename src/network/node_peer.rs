//! Server-side state and message handlers for one connected peer.
//!
//! `NodePeer` pairs the wire-level `Peer` with the node and the extra
//! bookkeeping the node keeps per connection: ban score, fee filter, bloom
//! filter, known addresses and the `getblocks` continuation hash.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::addr::{is_routable, is_whitelisted};
use super::ban_score::DynamicBanScore;
use super::bloom::{new_merkle_block, BloomFilter};
use super::message::*;
use super::peer::Peer;
use super::server::Node;
use crate::chain::{
    Block, BlockHeader, ChainError, FilterType, Hash, InvType, InvVect, NetAddress, Tx,
    MAX_SATOSHI, SF_NODE_BLOOM, SF_NODE_NETWORK, SF_NODE_WITNESS,
};

/// Addresses stamped further than this into the future are treated as old.
const MAX_ADDR_FUTURE_SECS: i64 = 10 * 60;
const ADDR_PENALTY_SECS: i64 = 5 * 24 * 60 * 60;

/// Per-connection state kept alongside the wire-level peer.
pub struct PeerExtras {
    pub persistent: bool,
    /// Connection-manager request that produced this peer, for outbound
    /// connections.
    pub conn_req: Option<u64>,
    pub fee_filter: AtomicI64,
    pub relay_tx_disabled: AtomicBool,
    pub sent_addrs: AtomicBool,
    pub is_whitelisted: bool,
    pub continue_hash: Mutex<Option<Hash>>,
    pub filter: Mutex<BloomFilter>,
    pub known_addresses: Mutex<HashSet<String>>,
    pub ban_score: Mutex<DynamicBanScore>,
}

pub struct NodePeer {
    pub peer: Arc<dyn Peer>,
    pub extras: PeerExtras,
    node: Arc<Node>,
}

impl fmt::Display for NodePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.peer.inbound() { "inbound" } else { "outbound" };
        write!(f, "{} ({})", self.peer.addr(), direction)
    }
}

impl NodePeer {
    pub fn new(node: Arc<Node>, peer: Arc<dyn Peer>, persistent: bool, conn_req: Option<u64>) -> Arc<Self> {
        let is_whitelisted = is_whitelisted(&node.settings.whitelists, &peer.addr());
        Arc::new(Self {
            extras: PeerExtras {
                persistent,
                conn_req,
                fee_filter: AtomicI64::new(0),
                relay_tx_disabled: AtomicBool::new(false),
                sent_addrs: AtomicBool::new(false),
                is_whitelisted,
                continue_hash: Mutex::new(None),
                filter: Mutex::new(BloomFilter::default()),
                known_addresses: Mutex::new(HashSet::new()),
                ban_score: Mutex::new(DynamicBanScore::new()),
            },
            peer,
            node,
        })
    }

    pub fn id(&self) -> i32 {
        self.peer.id()
    }

    pub fn relay_tx_disabled(&self) -> bool {
        self.extras.relay_tx_disabled.load(Ordering::SeqCst)
    }

    fn set_relay_tx_disabled(&self, disabled: bool) {
        self.extras.relay_tx_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn fee_filter(&self) -> i64 {
        self.extras.fee_filter.load(Ordering::SeqCst)
    }

    pub fn ban_score(&self) -> u32 {
        self.extras.ban_score.lock().int()
    }

    fn address_known(&self, na: &NetAddress) -> bool {
        self.extras.known_addresses.lock().contains(&na.key())
    }

    fn add_known_addresses(&self, addrs: &[NetAddress]) {
        let mut known = self.extras.known_addresses.lock();
        for na in addrs {
            known.insert(na.key());
        }
    }

    fn is_simnet(&self) -> bool {
        self.node.settings.network.is_simnet()
    }

    /// Sends the addresses the peer does not already know about.
    pub fn prepare_push_addr_msg(&self, addresses: &[NetAddress]) {
        let addrs: Vec<NetAddress> = addresses
            .iter()
            .filter(|na| !self.address_known(na))
            .cloned()
            .collect();
        match self.peer.push_addr_msg(addrs) {
            Ok(known) => self.add_known_addresses(&known),
            Err(e) => {
                tracing::error!("can't push address message to {}: {}", self, e);
                self.peer.disconnect();
            }
        }
    }

    /// Raise the ban score, banning and disconnecting the peer once it
    /// crosses the configured threshold.
    pub async fn add_ban_score(&self, persistent: u32, transient: u32, reason: &str) {
        let settings = &self.node.settings;
        if settings.disable_banning {
            return;
        }
        if self.extras.is_whitelisted {
            tracing::debug!("misbehaving whitelisted peer {}: {}", self, reason);
            return;
        }
        let warn_threshold = settings.ban_threshold >> 1;
        if persistent == 0 && transient == 0 {
            let score = self.ban_score();
            if score > warn_threshold {
                tracing::warn!(
                    "misbehaving peer {}: {} -- ban score is {}, it was not increased this time",
                    self,
                    reason,
                    score
                );
            }
            return;
        }
        let score = self.extras.ban_score.lock().increase(persistent, transient);
        if score > warn_threshold {
            tracing::warn!(
                "misbehaving peer {}: {} -- ban score increased to {}",
                self,
                reason,
                score
            );
            if score > settings.ban_threshold {
                tracing::warn!("misbehaving peer {} -- banning and disconnecting", self);
                self.node.ban_peer(self.peer.clone()).await;
                self.peer.disconnect();
            }
        }
    }

    /// Disconnects (and possibly bans) a peer that sends bloom filter
    /// commands to a node that does not advertise bloom support.
    pub async fn enforce_node_bloom_flag(&self, cmd: &str) -> bool {
        if self.node.services & SF_NODE_BLOOM == SF_NODE_BLOOM {
            return true;
        }
        if self.peer.protocol_version() >= BIP0111_VERSION && !self.node.settings.disable_banning {
            self.add_ban_score(100, 0, cmd).await;
            self.peer.disconnect();
            return false;
        }
        tracing::debug!("{} sent an unsupported {} request -- disconnecting", self, cmd);
        self.peer.disconnect();
        false
    }

    /// Handles the remote version message. A returned reject is sent to the
    /// peer before the connection is dropped.
    pub async fn on_version(self: &Arc<Self>, msg: &MsgVersion) -> Option<MsgReject> {
        let is_inbound = self.peer.inbound();
        let remote = self.peer.na();
        let addr_manager = &self.node.addr_manager;

        // Refresh advertised services even for peers about to be rejected for
        // an old protocol version.
        if !self.is_simnet() && !is_inbound {
            if let Some(na) = &remote {
                addr_manager.set_services(na, msg.services);
            }
        }
        if msg.protocol_version < MIN_ACCEPTABLE_PROTOCOL_VERSION {
            return None;
        }
        if !is_inbound && msg.services & SF_NODE_NETWORK != SF_NODE_NETWORK {
            let missing = SF_NODE_NETWORK & !msg.services;
            tracing::debug!(
                "rejecting peer {} with services {:#x} due to not providing desired services {:#x}",
                self,
                msg.services,
                missing
            );
            return Some(MsgReject {
                cmd: "version".to_string(),
                code: RejectCode::Nonstandard,
                reason: format!("required services {:#x} not offered", missing),
            });
        }

        if !self.is_simnet() && !is_inbound {
            let segwit_active = match self.node.chain.is_segwit_active() {
                Ok(active) => active,
                Err(e) => {
                    tracing::error!("unable to query for segwit soft-fork state: {}", e);
                    return None;
                }
            };
            if segwit_active && msg.services & SF_NODE_WITNESS == 0 {
                tracing::info!(
                    "disconnecting non-segwit peer {} as it isn't segwit enabled and we need more segwit enabled peers",
                    self
                );
                self.peer.disconnect();
                return None;
            }
            if let Some(na) = &remote {
                if !self.node.settings.disable_listen && self.node.sync_manager.is_current() {
                    if let Some(lna) = addr_manager.get_best_local_address(na) {
                        if is_routable(&lna) {
                            self.prepare_push_addr_msg(&[lna]);
                        }
                    }
                }
                let has_timestamp = self.peer.protocol_version() >= NET_ADDRESS_TIME_VERSION;
                if addr_manager.need_more_addresses() && has_timestamp {
                    self.peer.queue_message(Message::GetAddr, None);
                }
                addr_manager.good(na);
            }
        }

        self.node
            .time_source
            .add_time_sample(&self.peer.addr(), msg.timestamp);
        self.node.sync_manager.new_peer(self.peer.clone());
        self.set_relay_tx_disabled(msg.disable_relay_tx);
        self.node.update_highest_known_height(msg.last_block);
        self.node.add_peer(self.clone()).await;
        None
    }

    pub async fn on_mem_pool(&self) {
        if self.node.services & SF_NODE_BLOOM != SF_NODE_BLOOM {
            tracing::debug!(
                "peer {} sent mempool request with bloom filtering disabled -- disconnecting",
                self
            );
            self.peer.disconnect();
            return;
        }
        // Decays to half each minute, so only a burst crosses the threshold.
        self.add_ban_score(0, 33, "mempool").await;

        let mut inv = Vec::new();
        let mut filter = self.extras.filter.lock();
        for desc in self.node.mempool.tx_descs() {
            if !filter.is_loaded() || filter.match_tx_and_update(&desc.tx) {
                inv.push(InvVect::new(InvType::Tx, desc.tx.tx_hash()));
                if inv.len() + 1 > MAX_INV_PER_MSG {
                    break;
                }
            }
        }
        drop(filter);
        if !inv.is_empty() {
            self.peer.queue_message(Message::Inv(inv), None);
        }
    }

    /// Blocks until the sync manager has fully processed the transaction.
    pub async fn on_tx(&self, tx: Tx) {
        if self.node.settings.blocks_only {
            tracing::trace!(
                "ignoring tx {} from {} - blocksonly enabled",
                tx.tx_hash(),
                self
            );
            return;
        }
        self.peer
            .add_known_inventory(InvVect::new(InvType::Tx, tx.tx_hash()));
        self.node.sync_manager.queue_tx(tx, self.peer.clone()).await;
    }

    /// Blocks until the sync manager has fully processed the block.
    pub async fn on_block(&self, block: Block) {
        self.peer
            .add_known_inventory(InvVect::new(InvType::Block, block.block_hash()));
        self.node
            .sync_manager
            .queue_block(block, self.peer.clone())
            .await;
    }

    pub fn on_inv(&self, inv: Vec<InvVect>) {
        if !self.node.settings.blocks_only {
            if !inv.is_empty() {
                self.node.sync_manager.queue_inv(inv, self.peer.clone());
            }
            return;
        }
        let mut filtered = Vec::with_capacity(inv.len());
        for iv in inv {
            if iv.inv_type == InvType::Tx {
                tracing::trace!("ignoring tx {} in inv from {} -- blocksonly enabled", iv.hash, self);
                if self.peer.protocol_version() >= BIP0037_VERSION {
                    tracing::info!("peer {} is announcing transactions -- disconnecting", self);
                    self.peer.disconnect();
                    return;
                }
                continue;
            }
            filtered.push(iv);
        }
        if !filtered.is_empty() {
            self.node.sync_manager.queue_inv(filtered, self.peer.clone());
        }
    }

    pub fn on_headers(&self, headers: Vec<BlockHeader>) {
        self.node
            .sync_manager
            .queue_headers(headers, self.peer.clone());
    }

    /// Serves requested inventory. Every third item waits for the previous
    /// batch to be written, so a huge request cannot pile up queued data.
    pub async fn on_get_data(&self, inv_list: &[InvVect]) {
        let length = inv_list.len();
        self.add_ban_score(0, (length * 99 / MAX_INV_PER_MSG) as u32, "getdata").await;

        let (tx, mut done_rx) = oneshot::channel();
        let mut done_tx = Some(tx);
        let mut wait: Option<oneshot::Receiver<()>> = None;
        let mut not_found = Vec::new();
        let mut num_added = 0usize;

        for (i, iv) in inv_list.iter().enumerate() {
            let is_last = i == length - 1;
            let uses_done = is_last && not_found.is_empty();
            let (c, mut next_wait) = if uses_done {
                (done_tx.take(), None)
            } else if (i + 1) % 3 == 0 {
                let (t, r) = oneshot::channel();
                (Some(t), Some(r))
            } else {
                (None, None)
            };

            let result = match iv.inv_type {
                InvType::Tx | InvType::WitnessTx => self.push_tx(&iv.hash, c, wait.take()).await,
                InvType::Block | InvType::WitnessBlock => {
                    self.push_block(&iv.hash, c, wait.take()).await
                }
                InvType::FilteredBlock | InvType::FilteredWitnessBlock => {
                    self.push_merkle_block(&iv.hash, c, wait.take()).await
                }
                InvType::Error => {
                    tracing::warn!("unknown type in inventory request {}", iv.inv_type);
                    continue;
                }
            };
            if let Err(e) = result {
                tracing::debug!("unable to serve {} {} to {}: {}", iv.inv_type, iv.hash, self, e);
                not_found.push(*iv);
                // The failed push already signalled its channel. Consume it
                // here; the notfound message needs a fresh done channel.
                if is_last {
                    if uses_done {
                        let _ = (&mut done_rx).await;
                        let (t, r) = oneshot::channel();
                        done_tx = Some(t);
                        done_rx = r;
                    } else if let Some(rx) = next_wait.take() {
                        let _ = rx.await;
                    }
                }
            }
            num_added += 1;
            wait = next_wait;
        }

        if !not_found.is_empty() {
            self.peer
                .queue_message(Message::NotFound(not_found), done_tx.take());
        }
        drop(done_tx);
        if num_added > 0 {
            let _ = done_rx.await;
        }
    }

    pub async fn push_tx(
        &self,
        hash: &Hash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<(), ChainError> {
        let Some(tx) = self.node.mempool.fetch_transaction(hash) else {
            signal(done);
            return Err(ChainError::other(format!(
                "unable to fetch tx {} from transaction pool",
                hash
            )));
        };
        if let Some(wait) = wait {
            let _ = wait.await;
        }
        self.peer.queue_message(Message::Tx(tx), done);
        Ok(())
    }

    pub async fn push_block(
        &self,
        hash: &Hash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<(), ChainError> {
        let block = match self.node.chain.block_by_hash(hash) {
            Ok(block) => block,
            Err(e) => {
                tracing::trace!("unable to fetch requested block hash {}: {}", hash, e);
                signal(done);
                return Err(e);
            }
        };
        if let Some(wait) = wait {
            let _ = wait.await;
        }
        // When the peer reached the end of a getblocks batch, follow the
        // block with an inv of the tip so it asks for the next batch.
        let send_inv = {
            let mut continue_hash = self.extras.continue_hash.lock();
            let hit = continue_hash.as_ref() == Some(hash);
            if hit {
                *continue_hash = None;
            }
            hit
        };
        if send_inv {
            self.peer.queue_message(Message::Block(block), None);
            let best = self.node.chain.best_snapshot();
            self.peer
                .queue_message(Message::Inv(vec![InvVect::new(InvType::Block, best.hash)]), done);
        } else {
            self.peer.queue_message(Message::Block(block), done);
        }
        Ok(())
    }

    pub async fn push_merkle_block(
        &self,
        hash: &Hash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<(), ChainError> {
        // Without a filter there is nothing to match against.
        if !self.extras.filter.lock().is_loaded() {
            signal(done);
            return Ok(());
        }
        let block = match self.node.chain.block_by_hash(hash) {
            Ok(block) => block,
            Err(e) => {
                tracing::trace!("unable to fetch requested block hash {}: {}", hash, e);
                signal(done);
                return Err(e);
            }
        };
        let (merkle, matched) = new_merkle_block(&block, &mut self.extras.filter.lock());
        if let Some(wait) = wait {
            let _ = wait.await;
        }
        if matched.is_empty() {
            self.peer.queue_message(Message::MerkleBlock(merkle), done);
            return Ok(());
        }
        self.peer.queue_message(Message::MerkleBlock(merkle), None);
        let mut done = done;
        let last = matched.len() - 1;
        for (i, tx_index) in matched.into_iter().enumerate() {
            let dc = if i == last { done.take() } else { None };
            if let Some(tx) = block.transactions.get(tx_index) {
                self.peer.queue_message(Message::Tx(tx.clone()), dc);
            }
        }
        Ok(())
    }

    pub fn on_get_blocks(&self, msg: &MsgGetBlocks) {
        // Unknown locators restart from the block after genesis.
        let hashes = self.node.chain.locate_blocks(
            &msg.block_locator_hashes,
            &msg.hash_stop,
            MAX_BLOCKS_PER_MSG,
        );
        if hashes.is_empty() {
            return;
        }
        if hashes.len() == MAX_BLOCKS_PER_MSG as usize {
            *self.extras.continue_hash.lock() = hashes.last().copied();
        }
        let inv = hashes
            .into_iter()
            .map(|h| InvVect::new(InvType::Block, h))
            .collect();
        self.peer.queue_message(Message::Inv(inv), None);
    }

    pub fn on_get_headers(&self, msg: &MsgGetHeaders) {
        if !self.node.sync_manager.is_current() {
            return;
        }
        let headers = self
            .node
            .chain
            .locate_headers(&msg.block_locator_hashes, &msg.hash_stop);
        self.peer.queue_message(Message::Headers(headers), None);
    }

    fn cf_request_filter(&self, filter_type: u8) -> Option<FilterType> {
        if !self.node.sync_manager.is_current() {
            return None;
        }
        let ft = FilterType::from_u8(filter_type);
        if ft.is_none() {
            tracing::debug!("filter request for unknown filter: {}", filter_type);
        }
        ft
    }

    pub fn on_get_cfilters(&self, msg: &MsgGetCFilters) {
        let Some(ft) = self.cf_request_filter(msg.filter_type) else {
            return;
        };
        let Some(cf_index) = &self.node.cf_index else {
            return;
        };
        let hashes = match self.node.chain.height_to_hash_range(
            msg.start_height as i32,
            &msg.stop_hash,
            MAX_GET_CFILTERS_REQ_RANGE,
        ) {
            Ok(hashes) => hashes,
            Err(e) => {
                tracing::debug!("invalid getcfilters request: {}", e);
                return;
            }
        };
        let filters = match cf_index.filters_by_block_hashes(&hashes, ft) {
            Ok(filters) => filters,
            Err(e) => {
                tracing::error!("error retrieving cfilters: {}", e);
                return;
            }
        };
        for (hash, filter) in hashes.iter().zip(filters) {
            let Some(data) = filter.filter(|f| !f.is_empty()) else {
                tracing::warn!("could not obtain cfilter for {}", hash);
                return;
            };
            self.peer.queue_message(
                Message::CFilter(MsgCFilter {
                    filter_type: msg.filter_type,
                    block_hash: *hash,
                    data,
                }),
                None,
            );
        }
    }

    pub fn on_get_cfheaders(&self, msg: &MsgGetCFHeaders) {
        let Some(ft) = self.cf_request_filter(msg.filter_type) else {
            return;
        };
        let Some(cf_index) = &self.node.cf_index else {
            return;
        };
        let mut start_height = msg.start_height as i32;
        let mut max_results = MAX_CF_HEADERS_PER_MSG;
        // Include the predecessor so its filter header can seed the reply.
        if msg.start_height > 0 {
            start_height -= 1;
            max_results += 1;
        }
        let mut hashes = match self
            .node
            .chain
            .height_to_hash_range(start_height, &msg.stop_hash, max_results)
        {
            Ok(hashes) => hashes,
            Err(e) => {
                tracing::debug!("invalid getcfheaders request: {}", e);
                return;
            }
        };
        if hashes.is_empty() || (msg.start_height > 0 && hashes.len() == 1) {
            tracing::debug!("no results for getcfheaders request");
            return;
        }
        let mut filter_hashes = match cf_index.filter_hashes_by_block_hashes(&hashes, ft) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!("error retrieving cfilter hashes: {}", e);
                return;
            }
        };
        let mut reply = MsgCFHeaders::default();
        if msg.start_height > 0 {
            let prev = hashes[0];
            match cf_index.filter_header_by_block_hash(&prev, ft) {
                Ok(Some(header)) => reply.prev_filter_header = header,
                Ok(None) => {
                    tracing::warn!("could not obtain CF header for {}", prev);
                    return;
                }
                Err(e) => {
                    tracing::error!("error retrieving block filter header: {}", e);
                    return;
                }
            }
            hashes.remove(0);
            filter_hashes.remove(0);
        }
        for (hash, filter_hash) in hashes.iter().zip(filter_hashes) {
            let Some(filter_hash) = filter_hash else {
                tracing::warn!("could not obtain CF hash for {}", hash);
                return;
            };
            reply.filter_hashes.push(filter_hash);
        }
        reply.filter_type = msg.filter_type;
        reply.stop_hash = msg.stop_hash;
        self.peer.queue_message(Message::CFHeaders(reply), None);
    }

    pub fn on_get_cfcheckpt(&self, msg: &MsgGetCFCheckpt) {
        let Some(ft) = self.cf_request_filter(msg.filter_type) else {
            return;
        };
        let Some(cf_index) = &self.node.cf_index else {
            return;
        };
        let block_hashes = match self
            .node
            .chain
            .interval_block_hashes(&msg.stop_hash, CF_CHECKPT_INTERVAL)
        {
            Ok(hashes) => hashes,
            Err(e) => {
                tracing::debug!("invalid getcfilters request: {}", e);
                return;
            }
        };
        let Some(filter_headers) =
            self.node
                .cf_checkpt_cache
                .checkpoints(ft, &block_hashes, cf_index.as_ref())
        else {
            return;
        };
        self.peer.queue_message(
            Message::CFCheckpt(MsgCFCheckpt {
                filter_type: msg.filter_type,
                stop_hash: msg.stop_hash,
                filter_headers,
            }),
            None,
        );
    }

    pub fn on_fee_filter(&self, min_fee: i64) {
        if !(0..=MAX_SATOSHI).contains(&min_fee) {
            tracing::debug!(
                "peer {} sent an invalid feefilter '{}' -- disconnecting",
                self,
                min_fee
            );
            self.peer.disconnect();
            return;
        }
        self.extras.fee_filter.store(min_fee, Ordering::SeqCst);
    }

    pub async fn on_filter_add(&self, data: &[u8]) {
        if !self.enforce_node_bloom_flag("filteradd").await {
            return;
        }
        let mut filter = self.extras.filter.lock();
        if !filter.is_loaded() {
            tracing::debug!("{} sent a filteradd request with no filter loaded -- disconnecting", self);
            self.peer.disconnect();
            return;
        }
        filter.add(data);
    }

    pub async fn on_filter_clear(&self) {
        if !self.enforce_node_bloom_flag("filterclear").await {
            return;
        }
        let mut filter = self.extras.filter.lock();
        if !filter.is_loaded() {
            tracing::debug!("{} sent a filterclear request with no filter loaded -- disconnecting", self);
            self.peer.disconnect();
            return;
        }
        filter.unload();
    }

    pub async fn on_filter_load(&self, msg: &MsgFilterLoad) {
        if !self.enforce_node_bloom_flag("filterload").await {
            return;
        }
        self.set_relay_tx_disabled(false);
        self.extras.filter.lock().reload(msg);
    }

    pub fn on_get_addr(&self) {
        if self.is_simnet() {
            return;
        }
        // Outbound peers never get our address list; limits fingerprinting.
        if !self.peer.inbound() {
            tracing::debug!("ignoring getaddr request from outbound peer {}", self);
            return;
        }
        if self.extras.sent_addrs.swap(true, Ordering::SeqCst) {
            tracing::debug!("ignoring repeated getaddr request from peer {}", self);
            return;
        }
        let cache = self.node.addr_manager.address_cache();
        self.prepare_push_addr_msg(&cache);
    }

    pub fn on_addr(&self, mut addrs: Vec<NetAddress>) {
        if self.is_simnet() {
            return;
        }
        // Old-style addresses carry no timestamp.
        if self.peer.protocol_version() < NET_ADDRESS_TIME_VERSION {
            return;
        }
        if addrs.is_empty() {
            tracing::error!("command [addr] from {} does not contain any addresses", self);
            self.peer.disconnect();
            return;
        }
        for na in addrs.iter_mut() {
            if !self.peer.connected() {
                return;
            }
            let now = chrono::Utc::now().timestamp();
            if na.timestamp > now + MAX_ADDR_FUTURE_SECS {
                na.timestamp = now - ADDR_PENALTY_SECS;
            }
            self.add_known_addresses(std::slice::from_ref(na));
        }
        match self.peer.na() {
            Some(src) => self.node.addr_manager.add_addresses(&addrs, &src),
            None => tracing::debug!("dropping addresses from {} with unknown source", self),
        }
    }

    pub fn on_read(&self, bytes: usize) {
        self.node.add_bytes_received(bytes as u64);
    }

    pub fn on_write(&self, bytes: usize) {
        self.node.add_bytes_sent(bytes as u64);
    }
}

fn signal(done: Option<oneshot::Sender<()>>) {
    if let Some(done) = done {
        let _ = done.send(());
    }
}
