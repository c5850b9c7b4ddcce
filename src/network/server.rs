//! The node server: owns the collaborators, the peer handler channels and
//! the lifecycle tokens, and exposes the operations RPC and peers use.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::addr::IpNet;
use super::cf_checkpoint::CfCheckptCache;
use super::checkpoints::{merge_checkpoints, parse_checkpoints};
use super::message::Message;
use super::node_peer::NodePeer;
use super::peer::Peer;
use super::peer_handler::{
    peer_handler, peer_handler_channels, BroadcastMsg, NodeCommand, PeerHandlerChannels,
    PeerHandlerSenders, PeerMatch, RelayData, RelayMsg, UpdatePeerHeightsMsg,
};
use super::rebroadcast::{rebroadcast_handler, RebroadcastMsg};
use crate::address::Address;
use crate::chain::{
    AddrManager, CfIndex, Chain, ChainNotification, Checkpoint, ConnManager, FeeEstimator, Hash,
    InvType, InvVect, MetadataStore, SyncManager, TemplateGenerator, TimeSource, Tx, TxDesc,
    TxMemPool, SF_NODE_BLOOM, SF_NODE_CF, SF_NODE_NETWORK, SF_NODE_WITNESS,
};
use crate::config::Config;
use crate::error::{AppError, NodeError};
use crate::network_type::NetworkType;

/// Metadata key the fee estimator snapshot is stored under.
pub const ESTIMATE_FEE_DB_KEY: &[u8] = b"estimatefee";

/// Receives notice that the mempool changed so cached block templates can
/// be refreshed.
pub trait MempoolListener: Send + Sync {
    fn notify_mempool_tx(&self, last_updated: i64);
    /// Transactions just accepted into the pool.
    fn notify_new_transactions(&self, _txns: &[TxDesc]) {}
}

/// Runtime settings derived from the configuration file.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub network: NetworkType,
    pub max_peers: usize,
    pub ban_duration: chrono::Duration,
    pub ban_threshold: u32,
    pub disable_banning: bool,
    pub blocks_only: bool,
    pub disable_listen: bool,
    pub disable_dns_seed: bool,
    pub connect_peers: Vec<String>,
    pub onion_enabled: bool,
    pub whitelists: Vec<IpNet>,
    pub no_peer_bloom_filters: bool,
    pub no_cfilters: bool,
    pub rpc_enabled: bool,
    pub generate: bool,
    pub mining_addrs: Vec<Address>,
    pub checkpoints: Vec<Checkpoint>,
}

impl NodeSettings {
    pub fn new(network: NetworkType) -> Self {
        Self {
            network,
            max_peers: 125,
            ban_duration: chrono::Duration::hours(24),
            ban_threshold: 100,
            disable_banning: false,
            blocks_only: false,
            disable_listen: false,
            disable_dns_seed: false,
            connect_peers: Vec::new(),
            onion_enabled: false,
            whitelists: Vec::new(),
            no_peer_bloom_filters: false,
            no_cfilters: false,
            rpc_enabled: true,
            generate: false,
            mining_addrs: Vec::new(),
            checkpoints: network.checkpoints(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let network = config.node.network_type();
        let whitelists = config
            .network
            .whitelists
            .iter()
            .map(|w| w.parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()?;
        let mining_addrs = config
            .mining
            .mining_addrs
            .iter()
            .map(|a| {
                Address::decode(a, network)
                    .map_err(|e| AppError::Config(format!("mining address '{}' failed to decode: {}", a, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let additional = parse_checkpoints(&config.node.add_checkpoints).map_err(AppError::Config)?;
        let checkpoints = if config.node.disable_checkpoints {
            Vec::new()
        } else {
            merge_checkpoints(&network.checkpoints(), &additional)
        };
        Ok(Self {
            network,
            max_peers: config.network.max_peers,
            ban_duration: chrono::Duration::seconds(config.network.ban_duration_secs as i64),
            ban_threshold: config.network.ban_threshold,
            disable_banning: config.network.disable_banning,
            blocks_only: config.node.blocks_only,
            disable_listen: config.network.disable_listen,
            disable_dns_seed: config.network.disable_dns_seed,
            connect_peers: config.network.connect_peers.clone(),
            onion_enabled: config.network.onion,
            whitelists,
            no_peer_bloom_filters: config.network.no_peer_bloom_filters,
            no_cfilters: config.node.no_cfilters,
            rpc_enabled: !config.rpc.disable_rpc,
            generate: config.mining.generate,
            mining_addrs,
            checkpoints,
        })
    }

    /// Service bits advertised to peers.
    pub fn services(&self) -> u64 {
        let mut services = SF_NODE_NETWORK | SF_NODE_WITNESS;
        if !self.no_peer_bloom_filters {
            services |= SF_NODE_BLOOM;
        }
        if !self.no_cfilters {
            services |= SF_NODE_CF;
        }
        services
    }
}

/// External components the node drives.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn Chain>,
    pub mempool: Arc<dyn TxMemPool>,
    pub sync_manager: Arc<dyn SyncManager>,
    pub addr_manager: Arc<dyn AddrManager>,
    pub conn_manager: Arc<dyn ConnManager>,
    pub cf_index: Option<Arc<dyn CfIndex>>,
    pub time_source: Arc<dyn TimeSource>,
    pub fee_estimator: Option<Arc<dyn FeeEstimator>>,
    pub metadata: Arc<dyn MetadataStore>,
    pub template_generator: Arc<dyn TemplateGenerator>,
}

pub struct Node {
    pub settings: NodeSettings,
    pub services: u64,
    pub chain: Arc<dyn Chain>,
    pub mempool: Arc<dyn TxMemPool>,
    pub sync_manager: Arc<dyn SyncManager>,
    pub addr_manager: Arc<dyn AddrManager>,
    pub conn_manager: Arc<dyn ConnManager>,
    pub cf_index: Option<Arc<dyn CfIndex>>,
    pub time_source: Arc<dyn TimeSource>,
    pub fee_estimator: Option<Arc<dyn FeeEstimator>>,
    pub metadata: Arc<dyn MetadataStore>,
    pub template_generator: Arc<dyn TemplateGenerator>,
    pub cf_checkpt_cache: CfCheckptCache,

    senders: PeerHandlerSenders,
    handler_channels: Mutex<Option<PeerHandlerChannels>>,
    rebroadcast_tx: mpsc::Sender<RebroadcastMsg>,
    rebroadcast_rx: Mutex<Option<mpsc::Receiver<RebroadcastMsg>>>,
    mempool_listener: RwLock<Option<Arc<dyn MempoolListener>>>,

    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    highest_known_height: AtomicI32,
    generate: AtomicBool,
    start_time: AtomicI64,
    started: AtomicBool,
    shutdown: AtomicBool,
    shutdown_sched: AtomicBool,

    quit: CancellationToken,
    rpc_shutdown: CancellationToken,
    shutdown_requested: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(settings: NodeSettings, deps: Collaborators) -> Arc<Self> {
        let (senders, channels) = peer_handler_channels(settings.max_peers);
        let (rebroadcast_tx, rebroadcast_rx) = mpsc::channel(settings.max_peers.max(1));
        let services = settings.services();
        let cf_index = if settings.no_cfilters { None } else { deps.cf_index };
        let generate = settings.generate;
        Arc::new(Self {
            settings,
            services,
            chain: deps.chain,
            mempool: deps.mempool,
            sync_manager: deps.sync_manager,
            addr_manager: deps.addr_manager,
            conn_manager: deps.conn_manager,
            cf_index,
            time_source: deps.time_source,
            fee_estimator: deps.fee_estimator,
            metadata: deps.metadata,
            template_generator: deps.template_generator,
            cf_checkpt_cache: CfCheckptCache::new(),
            senders,
            handler_channels: Mutex::new(Some(channels)),
            rebroadcast_tx,
            rebroadcast_rx: Mutex::new(Some(rebroadcast_rx)),
            mempool_listener: RwLock::new(None),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            highest_known_height: AtomicI32::new(0),
            generate: AtomicBool::new(generate),
            start_time: AtomicI64::new(0),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_sched: AtomicBool::new(false),
            quit: CancellationToken::new(),
            rpc_shutdown: CancellationToken::new(),
            shutdown_requested: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the peer handler and, with RPC enabled, the rebroadcast
    /// handler. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::trace!("starting server");
        self.start_time
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        if let Some(channels) = self.handler_channels.lock().take() {
            tasks.push(tokio::spawn(peer_handler(self.clone(), channels)));
        }
        tasks.push(tokio::spawn(chain_notification_handler(self.clone())));
        if self.settings.rpc_enabled {
            if let Some(rx) = self.rebroadcast_rx.lock().take() {
                tasks.push(tokio::spawn(rebroadcast_handler(self.clone(), rx)));
            }
        }
    }

    /// Stops RPC, saves the fee estimator state and signals every handler to
    /// quit. Only the first call has any effect.
    pub fn stop(&self) -> Result<(), AppError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::debug!("server is already in the process of shutting down");
            return Ok(());
        }
        tracing::warn!("server shutting down");
        self.rpc_shutdown.cancel();
        let saved = match &self.fee_estimator {
            Some(estimator) => self.metadata.put(ESTIMATE_FEE_DB_KEY, &estimator.save()),
            None => Ok(()),
        };
        self.quit.cancel();
        saved.map_err(AppError::from)
    }

    /// Waits for the handler tasks to finish after `stop`.
    pub async fn wait_for_shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("server task failed: {}", e);
            }
        }
    }

    /// Stops the node after `duration`, logging a countdown whose interval
    /// shrinks as the deadline approaches.
    pub fn schedule_shutdown(self: &Arc<Self>, duration: Duration) {
        if self.shutdown_sched.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("server shutdown in {:?}", duration);
        let node = self.clone();
        tokio::spawn(async move {
            let mut remaining = duration;
            let mut tick = dynamic_tick_duration(remaining);
            let done = tokio::time::sleep(duration);
            tokio::pin!(done);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            loop {
                tokio::select! {
                    _ = &mut done => {
                        if let Err(e) = node.stop() {
                            tracing::error!("{}", e);
                        }
                        node.request_shutdown();
                        break;
                    }
                    _ = ticker.tick() => {
                        remaining = remaining.saturating_sub(tick);
                        if remaining < Duration::from_secs(1) {
                            continue;
                        }
                        let next = dynamic_tick_duration(remaining);
                        if next != tick {
                            tick = next;
                            ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
                        }
                        tracing::warn!("server shutdown in {:?}", remaining);
                    }
                }
            }
        });
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn rpc_shutdown_token(&self) -> CancellationToken {
        self.rpc_shutdown.clone()
    }

    /// Cancelled when something inside the node (the RPC `stop` command or
    /// a scheduled shutdown) asks the process to exit.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown_requested.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::SeqCst)
    }

    /// Whether the mining controller should hand out work.
    pub fn is_generating(&self) -> bool {
        self.generate.load(Ordering::SeqCst)
    }

    pub fn set_generate(&self, generate: bool) {
        if self.generate.swap(generate, Ordering::SeqCst) != generate {
            tracing::info!("block generation {}", if generate { "enabled" } else { "disabled" });
        }
    }

    pub fn set_mempool_listener(&self, listener: Arc<dyn MempoolListener>) {
        *self.mempool_listener.write() = Some(listener);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::SeqCst);
    }

    /// Total bytes received and sent across all peers.
    pub fn net_totals(&self) -> (u64, u64) {
        (
            self.bytes_received.load(Ordering::SeqCst),
            self.bytes_sent.load(Ordering::SeqCst),
        )
    }

    pub fn update_highest_known_height(&self, height: i32) {
        self.highest_known_height.fetch_max(height, Ordering::SeqCst);
    }

    pub fn highest_known_height(&self) -> i32 {
        self.highest_known_height.load(Ordering::SeqCst)
    }

    /// Hands a peer that finished its handshake to the peer handler. Waits
    /// for room in the queue so the add is ordered before the peer's done.
    pub async fn add_peer(&self, sp: Arc<NodePeer>) {
        let _ = self.senders.new_peers.send(sp).await;
    }

    /// Queue the peer's host for banning.
    pub async fn ban_peer(&self, peer: Arc<dyn Peer>) {
        let _ = self.senders.ban_peers.send(peer).await;
    }

    /// Called by the wire layer once a peer's connection has closed.
    pub async fn peer_done(&self, sp: Arc<NodePeer>) {
        let ver_ack = sp.peer.ver_ack_received();
        let peer = sp.peer.clone();
        let _ = self.senders.done_peers.send(sp).await;
        if ver_ack {
            self.sync_manager.done_peer(peer);
        }
    }

    pub async fn relay_inventory(&self, inv: InvVect, data: RelayData) {
        let _ = self.senders.relay_inv.send(RelayMsg { inv, data }).await;
    }

    pub async fn broadcast_message(&self, message: Message, exclude: Vec<i32>) {
        let _ = self
            .senders
            .broadcast
            .send(BroadcastMsg { message, exclude })
            .await;
    }

    pub async fn update_peer_heights(&self, new_hash: Hash, new_height: i32, origin_peer: Option<i32>) {
        let _ = self
            .senders
            .peer_heights
            .send(UpdatePeerHeightsMsg {
                new_hash,
                new_height,
                origin_peer,
            })
            .await;
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.senders
            .query
            .send(make(tx))
            .await
            .map_err(|_| NodeError::ShuttingDown)?;
        rx.await.map_err(|_| NodeError::ShuttingDown)
    }

    pub async fn connected_count(&self) -> i32 {
        self.query(NodeCommand::ConnectedCount).await.unwrap_or(0)
    }

    pub async fn outbound_group_count(&self, key: &str) -> usize {
        let key = key.to_string();
        self.query(|reply| NodeCommand::OutboundGroupCount { key, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn peers(&self) -> Vec<Arc<NodePeer>> {
        self.query(NodeCommand::Peers).await.unwrap_or_default()
    }

    pub async fn added_nodes(&self) -> Vec<Arc<NodePeer>> {
        self.query(NodeCommand::AddedNodes).await.unwrap_or_default()
    }

    pub async fn connect_node(&self, addr: &str, permanent: bool) -> Result<(), NodeError> {
        let addr = addr.to_string();
        self.query(|reply| NodeCommand::ConnectNode {
            addr,
            permanent,
            reply,
        })
        .await?
    }

    pub async fn remove_node(&self, target: PeerMatch) -> Result<(), NodeError> {
        self.query(|reply| NodeCommand::RemoveNode { target, reply })
            .await?
    }

    pub async fn disconnect_node(&self, target: PeerMatch) -> Result<(), NodeError> {
        self.query(|reply| NodeCommand::DisconnectNode { target, reply })
            .await?
    }

    pub async fn relay_transactions(&self, txns: &[TxDesc]) {
        for desc in txns {
            let inv = InvVect::new(InvType::Tx, desc.tx.tx_hash());
            self.relay_inventory(inv, RelayData::TxDesc(desc.clone()))
                .await;
        }
    }

    /// Relays newly accepted transactions and tells the template cache the
    /// mempool changed.
    pub async fn announce_new_transactions(&self, txns: &[TxDesc]) {
        self.relay_transactions(txns).await;
        let listener = self.mempool_listener.read().clone();
        if let Some(listener) = listener {
            listener.notify_mempool_tx(self.mempool.last_updated());
            listener.notify_new_transactions(txns);
        }
    }

    pub async fn add_rebroadcast_inventory(&self, inv: InvVect, data: RelayData) {
        if self.is_shutting_down() {
            return;
        }
        let _ = self
            .rebroadcast_tx
            .send(RebroadcastMsg::Add(inv, data))
            .await;
    }

    pub async fn remove_rebroadcast_inventory(&self, inv: InvVect) {
        if self.is_shutting_down() {
            return;
        }
        let _ = self.rebroadcast_tx.send(RebroadcastMsg::Del(inv)).await;
    }

    /// A transaction made it into a block; stop rebroadcasting it.
    pub async fn transaction_confirmed(&self, tx: &Tx) {
        self.remove_rebroadcast_inventory(InvVect::new(InvType::Tx, tx.tx_hash()))
            .await;
    }
}

/// Relays newly connected blocks and retires their transactions from the
/// rebroadcast set.
async fn chain_notification_handler(node: Arc<Node>) {
    let mut rx = node.chain.subscribe();
    let quit = node.quit_token();
    loop {
        let notification = tokio::select! {
            n = rx.recv() => n,
            _ = quit.cancelled() => break,
        };
        match notification {
            Ok(ChainNotification::BlockConnected { hash, height }) => {
                let block = match node.chain.block_by_hash(&hash) {
                    Ok(block) => block,
                    Err(e) => {
                        tracing::warn!("connected block {} not available: {}", hash, e);
                        continue;
                    }
                };
                if node.sync_manager.is_current() {
                    node.relay_inventory(
                        InvVect::new(InvType::Block, hash),
                        RelayData::Header(block.header),
                    )
                    .await;
                }
                for tx in block.transactions.iter().skip(1) {
                    node.transaction_confirmed(tx).await;
                }
                node.update_peer_heights(hash, height, None).await;
            }
            Ok(ChainNotification::BlockDisconnected { .. }) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("chain notification handler lagged by {} messages", n);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Countdown interval for a scheduled shutdown with `remaining` left.
pub fn dynamic_tick_duration(remaining: Duration) -> Duration {
    const SEC: u64 = 1;
    const MIN: u64 = 60;
    let secs = remaining.as_secs();
    let tick = match secs {
        s if s <= 5 * SEC => SEC,
        s if s <= 15 * SEC => 5 * SEC,
        s if s <= MIN => 15 * SEC,
        s if s <= 5 * MIN => MIN,
        s if s <= 15 * MIN => 5 * MIN,
        s if s <= 60 * MIN => 15 * MIN,
        _ => 60 * MIN,
    };
    Duration::from_secs(tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_tick_duration() {
        let d = |s| dynamic_tick_duration(Duration::from_secs(s));
        assert_eq!(d(3), Duration::from_secs(1));
        assert_eq!(d(5), Duration::from_secs(1));
        assert_eq!(d(10), Duration::from_secs(5));
        assert_eq!(d(60), Duration::from_secs(15));
        assert_eq!(d(299), Duration::from_secs(60));
        assert_eq!(d(900), Duration::from_secs(300));
        assert_eq!(d(3600), Duration::from_secs(900));
        assert_eq!(d(7200), Duration::from_secs(3600));
    }

    #[test]
    fn test_services_follow_settings() {
        let mut settings = NodeSettings::new(NetworkType::Regtest);
        assert_ne!(settings.services() & SF_NODE_BLOOM, 0);
        settings.no_peer_bloom_filters = true;
        settings.no_cfilters = true;
        let services = settings.services();
        assert_eq!(services & (SF_NODE_BLOOM | SF_NODE_CF), 0);
        assert_ne!(services & SF_NODE_NETWORK, 0);
    }
}
