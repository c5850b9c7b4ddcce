#![allow(dead_code)]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use podd::chain::memory::{
    MedianTimeSource, MemoryAddrManager, MemoryCfIndex, MemoryChain, MemoryMempool, MemoryMetadata,
    MemorySyncManager, MemoryTemplateGenerator, RecordingConnManager, StaticFeeEstimator,
};
use podd::chain::{Hash, InvVect, NetAddress, TimeSource};
use podd::network::message::Message;
use podd::network::peer::PeerStats;
use podd::network::{Collaborators, Node, NodeSettings, Peer};
use podd::network_type::NetworkType;

static NEXT_PEER_ID: AtomicI32 = AtomicI32::new(1);

/// Wire-level peer that records what the node queues for it.
pub struct MockPeer {
    id: i32,
    addr: String,
    inbound: bool,
    user_agent: String,
    connected: AtomicBool,
    pub messages: Mutex<Vec<Message>>,
    pub inventory: Mutex<Vec<InvVect>>,
    last_announced: Mutex<Option<Hash>>,
    last_block: AtomicI32,
}

impl MockPeer {
    pub fn new(addr: &str, inbound: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::SeqCst),
            addr: addr.to_string(),
            inbound,
            user_agent: "/pod-test:0.1/".to_string(),
            connected: AtomicBool::new(true),
            messages: Mutex::new(Vec::new()),
            inventory: Mutex::new(Vec::new()),
            last_announced: Mutex::new(None),
            last_block: AtomicI32::new(0),
        })
    }

    pub fn with_user_agent(addr: &str, inbound: bool, user_agent: &str) -> Arc<Self> {
        let mut peer = Self::new(addr, inbound);
        if let Some(p) = Arc::get_mut(&mut peer) {
            p.user_agent = user_agent.to_string();
        }
        peer
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(|m| m.command()).collect()
    }
}

impl Peer for MockPeer {
    fn id(&self) -> i32 {
        self.id
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        "127.0.0.1:18444".parse().ok()
    }

    fn inbound(&self) -> bool {
        self.inbound
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn protocol_version(&self) -> u32 {
        70013
    }

    fn services(&self) -> u64 {
        podd::chain::SF_NODE_NETWORK
    }

    fn na(&self) -> Option<NetAddress> {
        let sa: SocketAddr = self.addr.parse().ok()?;
        Some(NetAddress::new(sa.ip(), sa.port(), self.services()))
    }

    fn version_known(&self) -> bool {
        true
    }

    fn ver_ack_received(&self) -> bool {
        true
    }

    fn wants_headers(&self) -> bool {
        false
    }

    fn last_announced_block(&self) -> Option<Hash> {
        *self.last_announced.lock()
    }

    fn update_last_announced_block(&self, hash: Option<Hash>) {
        *self.last_announced.lock() = hash;
    }

    fn update_last_block_height(&self, height: i32) {
        self.last_block.store(height, Ordering::SeqCst);
    }

    fn queue_message(&self, msg: Message, done: Option<oneshot::Sender<()>>) {
        self.messages.lock().push(msg);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn queue_inventory(&self, inv: InvVect) {
        self.inventory.lock().push(inv);
    }

    fn add_known_inventory(&self, _inv: InvVect) {}

    fn push_addr_msg(&self, addrs: Vec<NetAddress>) -> Result<Vec<NetAddress>, String> {
        self.messages.lock().push(Message::Addr(addrs.clone()));
        Ok(addrs)
    }

    fn stats(&self) -> PeerStats {
        PeerStats {
            id: self.id,
            addr: self.addr.clone(),
            inbound: self.inbound,
            user_agent: self.user_agent.clone(),
            last_block: self.last_block.load(Ordering::SeqCst),
            ..Default::default()
        }
    }
}

/// A node over in-memory collaborators, with handles to the pieces tests
/// poke at directly.
pub struct TestNode {
    pub node: Arc<Node>,
    pub chain: Arc<MemoryChain>,
    pub mempool: Arc<MemoryMempool>,
    pub sync: Arc<MemorySyncManager>,
    pub conn_manager: Arc<RecordingConnManager>,
    pub time_source: Arc<dyn TimeSource>,
}

pub fn test_settings() -> NodeSettings {
    let mut settings = NodeSettings::new(NetworkType::Regtest);
    settings.disable_dns_seed = true;
    settings.max_peers = 8;
    settings
}

/// Clock that only moves when a test says so.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(chrono::Utc::now().timestamp()),
        })
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn adjusted_time(&self) -> i64 {
        self.now()
    }

    fn add_time_sample(&self, _source: &str, _timestamp: i64) {}

    fn offset_seconds(&self) -> i64 {
        0
    }
}

pub fn test_node(settings: NodeSettings) -> TestNode {
    test_node_with_clock(settings, Arc::new(MedianTimeSource::default()))
}

pub fn test_node_with_clock(settings: NodeSettings, time_source: Arc<dyn TimeSource>) -> TestNode {
    let chain = Arc::new(MemoryChain::new(settings.network, time_source.clone()));
    let mempool = Arc::new(MemoryMempool::new(chain.clone()));
    let sync = Arc::new(MemorySyncManager::new(chain.clone(), mempool.clone()));
    let conn_manager = Arc::new(RecordingConnManager::default());
    let deps = Collaborators {
        chain: chain.clone(),
        mempool: mempool.clone(),
        sync_manager: sync.clone(),
        addr_manager: Arc::new(MemoryAddrManager::default()),
        conn_manager: conn_manager.clone(),
        cf_index: Some(Arc::new(MemoryCfIndex::new(chain.clone()))),
        time_source: time_source.clone(),
        fee_estimator: Some(Arc::new(StaticFeeEstimator::new(0.0002))),
        metadata: Arc::new(MemoryMetadata::default()),
        template_generator: Arc::new(MemoryTemplateGenerator::new(
            chain.clone(),
            mempool.clone(),
            time_source.clone(),
        )),
    };
    TestNode {
        node: Node::new(settings, deps),
        chain,
        mempool,
        sync,
        conn_manager,
        time_source,
    }
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn wait_for_peers(node: &Arc<Node>, count: i32) -> bool {
    for _ in 0..100 {
        if node.connected_count().await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
