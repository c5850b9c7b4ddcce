//! In-process collaborators: a single-branch block store, a policy-light
//! mempool, and minimal address/connection bookkeeping. They give the
//! binary a working RPC and mining surface on regtest/simnet and back the
//! integration tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::*;
use crate::network_type::NetworkType;

const GENESIS_TIMESTAMP: i64 = 1_231_006_505;
const MEDIAN_TIME_BLOCKS: usize = 11;
const SUBSIDY_HALVING_INTERVAL: i32 = 210_000;
const MAX_HEADERS_PER_LOCATE: u32 = 2000;
const MAX_TIME_SAMPLES: usize = 200;
const MIN_TIME_SAMPLES: usize = 5;
const MAX_ALLOWED_OFFSET_SECS: i64 = 70 * 60;
const OP_TRUE: u8 = 0x51;

pub fn block_subsidy(height: i32) -> i64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    (50 * SATOSHI_PER_COIN) >> halvings
}

fn coinbase_tx(height: i32, extra_nonce: u64, value: i64, pk_script: Vec<u8>) -> Tx {
    let mut script = Vec::with_capacity(14);
    script.push(4);
    script.extend_from_slice(&height.to_le_bytes());
    script.push(8);
    script.extend_from_slice(&extra_nonce.to_le_bytes());
    Tx {
        version: 1,
        tx_in: vec![TxIn {
            previous_out_point: OutPoint {
                hash: Hash::ZERO,
                index: u32::MAX,
            },
            signature_script: script,
            sequence: u32::MAX,
        }],
        tx_out: vec![TxOut { value, pk_script }],
        lock_time: 0,
    }
}

pub fn genesis_block(network: NetworkType) -> Block {
    let coinbase = coinbase_tx(0, 0, block_subsidy(0), vec![OP_TRUE]);
    let merkle_root = merkle_root(std::slice::from_ref(&coinbase));
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: Hash::ZERO,
            merkle_root,
            timestamp: GENESIS_TIMESTAMP,
            bits: network.pow_limit_bits(),
            nonce: 0,
        },
        transactions: vec![coinbase],
    }
}

struct ChainState {
    blocks: Vec<Block>,
    hashes: Vec<Hash>,
    index: HashMap<Hash, i32>,
    total_txns: u64,
}

impl ChainState {
    fn tip_height(&self) -> i32 {
        self.blocks.len() as i32 - 1
    }

    fn median_time(&self) -> i64 {
        let start = self.blocks.len().saturating_sub(MEDIAN_TIME_BLOCKS);
        let mut times: Vec<i64> = self.blocks[start..]
            .iter()
            .map(|b| b.header.timestamp)
            .collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    fn locate_start(&self, locator: &[Hash]) -> usize {
        locator
            .iter()
            .find_map(|h| self.index.get(h))
            .map(|h| *h as usize + 1)
            .unwrap_or(1)
    }
}

/// Single-branch chain kept entirely in memory.
pub struct MemoryChain {
    network: NetworkType,
    state: RwLock<ChainState>,
    time_source: Arc<dyn TimeSource>,
    notifier: broadcast::Sender<ChainNotification>,
}

impl MemoryChain {
    pub fn new(network: NetworkType, time_source: Arc<dyn TimeSource>) -> Self {
        let genesis = genesis_block(network);
        let hash = genesis.block_hash();
        let (notifier, _) = broadcast::channel(64);
        let mut index = HashMap::new();
        index.insert(hash, 0);
        Self {
            network,
            state: RwLock::new(ChainState {
                total_txns: genesis.transactions.len() as u64,
                blocks: vec![genesis],
                hashes: vec![hash],
                index,
            }),
            time_source,
            notifier,
        }
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    fn check_block(&self, state: &ChainState, block: &Block) -> Result<(), ChainError> {
        let tip = state.tip_height() as usize;
        if block.header.prev_block != state.hashes[tip] {
            return Err(RuleError::new(
                RuleErrorKind::PrevBlockNotBest,
                format!(
                    "previous block must be the current chain tip {}, instead got {}",
                    state.hashes[tip], block.header.prev_block
                ),
            )
            .into());
        }
        if block.transactions.is_empty() {
            return Err(RuleError::new(
                RuleErrorKind::NoTransactions,
                "block does not contain any transactions",
            )
            .into());
        }
        if !block.transactions[0].is_coinbase() {
            return Err(RuleError::new(
                RuleErrorKind::FirstTxNotCoinbase,
                "first transaction in block is not a coinbase",
            )
            .into());
        }
        if block.transactions[1..].iter().any(Tx::is_coinbase) {
            return Err(RuleError::new(
                RuleErrorKind::MultipleCoinbases,
                "block contains more than one coinbase",
            )
            .into());
        }
        let expected_bits = state.blocks[tip].header.bits;
        if block.header.bits != expected_bits {
            return Err(RuleError::new(
                RuleErrorKind::UnexpectedDifficulty,
                format!(
                    "block difficulty of {:08x} is not the expected value of {:08x}",
                    block.header.bits, expected_bits
                ),
            )
            .into());
        }
        let hash = block.block_hash();
        if !hash_meets_target(&hash, block.header.bits) {
            return Err(RuleError::new(
                RuleErrorKind::HighHash,
                format!("block hash of {} is higher than expected max", hash),
            )
            .into());
        }
        let calculated = merkle_root(&block.transactions);
        if calculated != block.header.merkle_root {
            return Err(RuleError::new(
                RuleErrorKind::BadMerkleRoot,
                format!(
                    "block merkle root is invalid - block header indicates {}, but calculated value is {}",
                    block.header.merkle_root, calculated
                ),
            )
            .into());
        }
        if block.header.timestamp <= state.median_time() {
            return Err(RuleError::new(
                RuleErrorKind::TimeTooOld,
                "block timestamp is not after expected median time",
            )
            .into());
        }
        if block.header.timestamp > self.time_source.adjusted_time() + MAX_TIME_OFFSET_SECONDS {
            return Err(RuleError::new(
                RuleErrorKind::TimeTooNew,
                "block timestamp is too far in the future",
            )
            .into());
        }
        Ok(())
    }

    /// Validates and appends a block to the tip.
    pub fn connect_block(&self, block: Block) -> Result<(), ChainError> {
        let hash = block.block_hash();
        let height = {
            let mut state = self.state.write();
            if state.index.contains_key(&hash) {
                return Err(RuleError::new(
                    RuleErrorKind::DuplicateBlock,
                    format!("already have block {}", hash),
                )
                .into());
            }
            if !state.index.contains_key(&block.header.prev_block) {
                return Err(RuleError::new(
                    RuleErrorKind::PreviousBlockUnknown,
                    format!("previous block {} is unknown", block.header.prev_block),
                )
                .into());
            }
            self.check_block(&state, &block)?;
            let height = state.blocks.len() as i32;
            state.total_txns += block.transactions.len() as u64;
            state.index.insert(hash, height);
            state.hashes.push(hash);
            state.blocks.push(block);
            height
        };
        tracing::info!("⛓️  Connected block {} at height {}", hash, height);
        let _ = self
            .notifier
            .send(ChainNotification::BlockConnected { hash, height });
        Ok(())
    }

    pub fn median_time(&self) -> i64 {
        self.state.read().median_time()
    }
}

impl Chain for MemoryChain {
    fn best_snapshot(&self) -> BestState {
        let state = self.state.read();
        let tip = state.tip_height();
        let block = &state.blocks[tip as usize];
        let size = block.serialize().len() as u64;
        BestState {
            hash: state.hashes[tip as usize],
            height: tip,
            bits: block.header.bits,
            block_size: size,
            block_weight: size * 4,
            num_txns: block.transactions.len() as u64,
            total_txns: state.total_txns,
            median_time: state.median_time(),
        }
    }

    fn block_hash_by_height(&self, height: i32) -> Result<Hash, ChainError> {
        let state = self.state.read();
        if height < 0 || height > state.tip_height() {
            return Err(ChainError::other(format!(
                "no block at height {} exists",
                height
            )));
        }
        Ok(state.hashes[height as usize])
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError> {
        let state = self.state.read();
        state
            .index
            .get(hash)
            .map(|h| state.blocks[*h as usize].clone())
            .ok_or_else(|| ChainError::other(format!("block {} is not known", hash)))
    }

    fn header_by_hash(&self, hash: &Hash) -> Result<BlockHeader, ChainError> {
        self.block_by_hash(hash).map(|b| b.header)
    }

    fn height_by_hash(&self, hash: &Hash) -> Result<i32, ChainError> {
        self.state
            .read()
            .index
            .get(hash)
            .copied()
            .ok_or_else(|| ChainError::other(format!("block {} is not in the main chain", hash)))
    }

    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max: u32) -> Vec<Hash> {
        let state = self.state.read();
        let start = state.locate_start(locator);
        let mut out = Vec::new();
        for hash in state.hashes.iter().skip(start).take(max as usize) {
            out.push(*hash);
            if hash == hash_stop {
                break;
            }
        }
        out
    }

    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader> {
        let state = self.state.read();
        let start = state.locate_start(locator);
        let mut out = Vec::new();
        for (hash, block) in state
            .hashes
            .iter()
            .zip(state.blocks.iter())
            .skip(start)
            .take(MAX_HEADERS_PER_LOCATE as usize)
        {
            out.push(block.header);
            if hash == hash_stop {
                break;
            }
        }
        out
    }

    fn height_to_hash_range(
        &self,
        start_height: i32,
        end_hash: &Hash,
        max_results: usize,
    ) -> Result<Vec<Hash>, ChainError> {
        let state = self.state.read();
        let end_height = *state
            .index
            .get(end_hash)
            .ok_or_else(|| ChainError::other(format!("no known block header with hash {}", end_hash)))?;
        if start_height < 0 {
            return Err(ChainError::other(format!(
                "start height ({}) is below 0",
                start_height
            )));
        }
        if start_height > end_height + 1 {
            return Err(ChainError::other(format!(
                "start height ({}) is past end height ({})",
                start_height, end_height
            )));
        }
        let len = (end_height - start_height + 1) as usize;
        if len > max_results {
            return Err(ChainError::other(format!(
                "number of results ({}) would exceed max ({})",
                len, max_results
            )));
        }
        Ok(state.hashes[start_height as usize..=end_height as usize].to_vec())
    }

    fn interval_block_hashes(
        &self,
        end_hash: &Hash,
        interval: i32,
    ) -> Result<Vec<Hash>, ChainError> {
        let state = self.state.read();
        let end_height = *state
            .index
            .get(end_hash)
            .ok_or_else(|| ChainError::other(format!("no known block header with hash {}", end_hash)))?;
        let count = end_height / interval;
        Ok((1..=count)
            .map(|i| state.hashes[(i * interval) as usize])
            .collect())
    }

    fn check_connect_block_template(&self, block: &Block) -> Result<(), ChainError> {
        let state = self.state.read();
        self.check_block(&state, block)
    }

    fn is_segwit_active(&self) -> Result<bool, ChainError> {
        Ok(false)
    }

    fn fetch_utxo_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
        let state = self.state.read();
        let mut found = None;
        for (height, block) in state.blocks.iter().enumerate() {
            for tx in &block.transactions {
                if found.is_some() && tx.tx_in.iter().any(|i| i.previous_out_point == *outpoint) {
                    return Ok(None);
                }
                if found.is_none() && tx.tx_hash() == outpoint.hash {
                    let Some(out) = tx.tx_out.get(outpoint.index as usize) else {
                        return Ok(None);
                    };
                    found = Some(UtxoEntry {
                        amount: out.value,
                        pk_script: out.pk_script.clone(),
                        block_height: height as i32,
                        is_coinbase: tx.is_coinbase(),
                    });
                }
            }
        }
        Ok(found)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChainNotification> {
        self.notifier.subscribe()
    }
}

/// Mempool without script or input validation.
pub struct MemoryMempool {
    pool: RwLock<HashMap<Hash, TxDesc>>,
    last_updated: AtomicI64,
    chain: Arc<MemoryChain>,
}

impl MemoryMempool {
    pub fn new(chain: Arc<MemoryChain>) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            last_updated: AtomicI64::new(0),
            chain,
        }
    }

    fn touch(&self) {
        self.last_updated
            .store(self.chain.time_source.now(), Ordering::SeqCst);
    }
}

impl TxMemPool for MemoryMempool {
    fn fetch_transaction(&self, hash: &Hash) -> Option<Tx> {
        self.pool.read().get(hash).map(|d| d.tx.clone())
    }

    fn tx_descs(&self) -> Vec<TxDesc> {
        self.pool.read().values().cloned().collect()
    }

    fn tx_hashes(&self) -> Vec<Hash> {
        self.pool.read().keys().copied().collect()
    }

    fn count(&self) -> usize {
        self.pool.read().len()
    }

    fn last_updated(&self) -> i64 {
        self.last_updated.load(Ordering::SeqCst)
    }

    fn process_transaction(
        &self,
        tx: Tx,
        _allow_orphan: bool,
        _rate_limit: bool,
    ) -> Result<Vec<TxDesc>, ChainError> {
        let hash = tx.tx_hash();
        if tx.is_coinbase() {
            return Err(RuleError::new(
                RuleErrorKind::Policy,
                format!("transaction {} is an individual coinbase", hash),
            )
            .into());
        }
        if tx.tx_in.is_empty() {
            return Err(RuleError::new(RuleErrorKind::NoTxInputs, "transaction has no inputs").into());
        }
        if tx.tx_out.is_empty() {
            return Err(RuleError::new(RuleErrorKind::NoTxOutputs, "transaction has no outputs").into());
        }
        if let Some(out) = tx.tx_out.iter().find(|o| o.value < 0 || o.value > MAX_SATOSHI) {
            return Err(RuleError::new(
                RuleErrorKind::BadTxOutValue,
                format!("transaction output has invalid value {}", out.value),
            )
            .into());
        }
        let mut pool = self.pool.write();
        if pool.contains_key(&hash) {
            return Err(RuleError::new(
                RuleErrorKind::DuplicateTx,
                format!("already have transaction {}", hash),
            )
            .into());
        }
        let desc = TxDesc {
            tx,
            added: self.chain.time_source.now(),
            height: self.chain.best_snapshot().height,
            fee: 0,
            fee_per_kb: 0,
            starting_priority: 0.0,
        };
        pool.insert(hash, desc.clone());
        drop(pool);
        self.touch();
        Ok(vec![desc])
    }

    fn remove_transaction(&self, tx: &Tx, _remove_redeemers: bool) {
        if self.pool.write().remove(&tx.tx_hash()).is_some() {
            self.touch();
        }
    }
}

/// Builds templates from the in-memory chain and mempool.
pub struct MemoryTemplateGenerator {
    chain: Arc<MemoryChain>,
    mempool: Arc<MemoryMempool>,
    time_source: Arc<dyn TimeSource>,
    extra_nonce: AtomicI64,
}

impl MemoryTemplateGenerator {
    pub fn new(
        chain: Arc<MemoryChain>,
        mempool: Arc<MemoryMempool>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            chain,
            mempool,
            time_source,
            extra_nonce: AtomicI64::new(0),
        }
    }

    fn block_time(&self) -> i64 {
        self.time_source
            .adjusted_time()
            .max(self.chain.median_time() + 1)
    }
}

impl TemplateGenerator for MemoryTemplateGenerator {
    fn new_block_template(&self, pay_to: Option<&Address>) -> Result<BlockTemplate, ChainError> {
        let best = self.chain.best_snapshot();
        let height = best.height + 1;
        let descs = self.mempool.tx_descs();
        let total_fees: i64 = descs.iter().map(|d| d.fee).sum();
        let pk_script = pay_to.map(Address::pay_to_script).unwrap_or_else(|| vec![OP_TRUE]);
        let extra_nonce = self.extra_nonce.fetch_add(1, Ordering::SeqCst) as u64;
        let coinbase = coinbase_tx(height, extra_nonce, block_subsidy(height) + total_fees, pk_script);

        let mut transactions = Vec::with_capacity(descs.len() + 1);
        let mut fees = Vec::with_capacity(descs.len() + 1);
        transactions.push(coinbase);
        fees.push(-total_fees);
        for desc in descs {
            fees.push(desc.fee);
            transactions.push(desc.tx);
        }
        let sig_op_costs = vec![0; transactions.len()];
        let header = BlockHeader {
            version: 4,
            prev_block: best.hash,
            merkle_root: merkle_root(&transactions),
            timestamp: self.block_time(),
            bits: best.bits,
            nonce: 0,
        };
        Ok(BlockTemplate {
            block: Block {
                header,
                transactions,
            },
            fees,
            sig_op_costs,
            height,
            valid_pay_address: pay_to.is_some(),
            witness_commitment: None,
        })
    }

    fn update_block_time(&self, block: &mut Block) -> Result<(), ChainError> {
        block.header.timestamp = self.block_time();
        Ok(())
    }
}

/// Sync manager that applies blocks and transactions directly.
pub struct MemorySyncManager {
    chain: Arc<MemoryChain>,
    mempool: Arc<MemoryMempool>,
    current: AtomicBool,
}

impl MemorySyncManager {
    pub fn new(chain: Arc<MemoryChain>, mempool: Arc<MemoryMempool>) -> Self {
        Self {
            chain,
            mempool,
            current: AtomicBool::new(true),
        }
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncManager for MemorySyncManager {
    fn start(&self) {
        tracing::debug!("sync manager started");
    }

    fn stop(&self) -> Result<(), ChainError> {
        tracing::debug!("sync manager stopped");
        Ok(())
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    fn new_peer(&self, peer: Arc<dyn Peer>) {
        tracing::debug!("new sync candidate {}", peer.addr());
    }

    fn done_peer(&self, peer: Arc<dyn Peer>) {
        tracing::debug!("lost sync candidate {}", peer.addr());
    }

    async fn queue_block(&self, block: Block, peer: Arc<dyn Peer>) {
        if let Err(e) = self.submit_block(block) {
            tracing::debug!("rejected block from {}: {}", peer.addr(), e);
        }
    }

    async fn queue_tx(&self, tx: Tx, peer: Arc<dyn Peer>) {
        if let Err(e) = self.mempool.process_transaction(tx, true, true) {
            tracing::debug!("rejected transaction from {}: {}", peer.addr(), e);
        }
    }

    fn queue_inv(&self, inv: Vec<InvVect>, peer: Arc<dyn Peer>) {
        tracing::trace!("{} inventory vectors from {}", inv.len(), peer.addr());
    }

    fn queue_headers(&self, headers: Vec<BlockHeader>, peer: Arc<dyn Peer>) {
        tracing::trace!("{} headers from {}", headers.len(), peer.addr());
    }

    fn submit_block(&self, block: Block) -> Result<bool, ChainError> {
        let included: Vec<Tx> = block.transactions[1.min(block.transactions.len())..].to_vec();
        self.chain.connect_block(block)?;
        for tx in &included {
            self.mempool.remove_transaction(tx, false);
        }
        Ok(false)
    }
}

#[derive(Default)]
pub struct MemoryAddrManager {
    addrs: Mutex<HashMap<String, NetAddress>>,
}

/// Above this many known addresses no more are requested from peers.
const NEED_ADDRESS_THRESHOLD: usize = 1000;
const MAX_ADDRESS_CACHE: usize = 2500;

impl AddrManager for MemoryAddrManager {
    fn start(&self) {}

    fn stop(&self) -> Result<(), ChainError> {
        Ok(())
    }

    fn add_addresses(&self, addrs: &[NetAddress], _src: &NetAddress) {
        let mut known = self.addrs.lock();
        for na in addrs {
            known.insert(na.key(), na.clone());
        }
    }

    fn address_cache(&self) -> Vec<NetAddress> {
        self.addrs
            .lock()
            .values()
            .take(MAX_ADDRESS_CACHE)
            .cloned()
            .collect()
    }

    fn good(&self, addr: &NetAddress) {
        self.connected(addr);
    }

    fn connected(&self, addr: &NetAddress) {
        let mut known = self.addrs.lock();
        let entry = known.entry(addr.key()).or_insert_with(|| addr.clone());
        entry.timestamp = chrono::Utc::now().timestamp();
    }

    fn set_services(&self, addr: &NetAddress, services: u64) {
        if let Some(known) = self.addrs.lock().get_mut(&addr.key()) {
            known.services = services;
        }
    }

    fn need_more_addresses(&self) -> bool {
        self.addrs.lock().len() < NEED_ADDRESS_THRESHOLD
    }

    fn get_best_local_address(&self, _remote: &NetAddress) -> Option<NetAddress> {
        None
    }
}

/// Records connection requests; dialing is left to the wire layer.
#[derive(Default)]
pub struct RecordingConnManager {
    pub requests: Mutex<Vec<(SocketAddr, bool)>>,
    pub disconnects: Mutex<Vec<u64>>,
}

#[async_trait]
impl ConnManager for RecordingConnManager {
    fn start(&self) {
        tracing::debug!("connection manager started");
    }

    fn stop(&self) {
        tracing::debug!("connection manager stopped");
    }

    async fn connect(&self, addr: SocketAddr, permanent: bool) {
        tracing::info!("🔌 Connection to {} requested (permanent: {})", addr, permanent);
        self.requests.lock().push((addr, permanent));
    }

    fn disconnect(&self, conn_req_id: u64) {
        self.disconnects.lock().push(conn_req_id);
    }
}

/// Median-of-samples clock offset.
#[derive(Default)]
pub struct MedianTimeSource {
    samples: Mutex<HashMap<String, i64>>,
    offset: AtomicI64,
}

impl TimeSource for MedianTimeSource {
    fn adjusted_time(&self) -> i64 {
        self.now() + self.offset.load(Ordering::SeqCst)
    }

    fn add_time_sample(&self, source: &str, timestamp: i64) {
        let mut samples = self.samples.lock();
        if samples.contains_key(source) || samples.len() >= MAX_TIME_SAMPLES {
            return;
        }
        samples.insert(source.to_string(), timestamp - self.now());
        if samples.len() < MIN_TIME_SAMPLES {
            return;
        }
        let mut offsets: Vec<i64> = samples.values().copied().collect();
        offsets.sort_unstable();
        let median = offsets[offsets.len() / 2];
        if median.abs() <= MAX_ALLOWED_OFFSET_SECS {
            self.offset.store(median, Ordering::SeqCst);
        } else {
            self.offset.store(0, Ordering::SeqCst);
            tracing::warn!("⚠️  Please check your date and time are correct!");
        }
    }

    fn offset_seconds(&self) -> i64 {
        self.offset.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MemoryMetadata {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MetadataStore for MemoryMetadata {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.entries.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.entries.lock().get(key).cloned())
    }
}

/// Filter index derived on demand from the in-memory chain. The filter
/// body is the concatenation of the block's transaction hashes.
pub struct MemoryCfIndex {
    chain: Arc<MemoryChain>,
}

impl MemoryCfIndex {
    pub fn new(chain: Arc<MemoryChain>) -> Self {
        Self { chain }
    }

    fn filter_for(block: &Block) -> Vec<u8> {
        block
            .transactions
            .iter()
            .flat_map(|tx| tx.tx_hash().0)
            .collect()
    }

    /// Filter header chain up to and including `height`.
    fn header_at(&self, height: i32) -> Hash {
        let state = self.chain.state.read();
        let mut header = Hash::ZERO;
        for block in state.blocks.iter().take(height as usize + 1) {
            let filter_hash = Hash::double_sha256(&Self::filter_for(block));
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(&filter_hash.0);
            buf.extend_from_slice(&header.0);
            header = Hash::double_sha256(&buf);
        }
        header
    }
}

impl CfIndex for MemoryCfIndex {
    fn filter_by_block_hash(&self, hash: &Hash, _ft: FilterType) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.chain.block_by_hash(hash).ok().map(|b| Self::filter_for(&b)))
    }

    fn filters_by_block_hashes(
        &self,
        hashes: &[Hash],
        ft: FilterType,
    ) -> Result<Vec<Option<Vec<u8>>>, ChainError> {
        hashes.iter().map(|h| self.filter_by_block_hash(h, ft)).collect()
    }

    fn filter_header_by_block_hash(&self, hash: &Hash, _ft: FilterType) -> Result<Option<Hash>, ChainError> {
        Ok(self.chain.height_by_hash(hash).ok().map(|h| self.header_at(h)))
    }

    fn filter_headers_by_block_hashes(
        &self,
        hashes: &[Hash],
        ft: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError> {
        hashes
            .iter()
            .map(|h| self.filter_header_by_block_hash(h, ft))
            .collect()
    }

    fn filter_hashes_by_block_hashes(
        &self,
        hashes: &[Hash],
        ft: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError> {
        Ok(self
            .filters_by_block_hashes(hashes, ft)?
            .into_iter()
            .map(|f| f.map(|f| Hash::double_sha256(&f)))
            .collect())
    }
}

/// Fee estimator that reports a fixed relay fee until enough blocks have
/// been observed to say anything better.
pub struct StaticFeeEstimator {
    fee_per_kb: f64,
}

impl StaticFeeEstimator {
    pub fn new(fee_per_kb: f64) -> Self {
        Self { fee_per_kb }
    }
}

impl FeeEstimator for StaticFeeEstimator {
    fn estimate_fee(&self, num_blocks: u32) -> Result<f64, ChainError> {
        if num_blocks == 0 {
            return Err(ChainError::other("cannot confirm transaction in zero blocks"));
        }
        Ok(self.fee_per_kb)
    }

    fn save(&self) -> Vec<u8> {
        self.fee_per_kb.to_le_bytes().to_vec()
    }
}

/// Grinds the nonce until the header meets its own target. Only practical
/// for the easy test-network targets.
pub fn solve_block(block: &mut Block) -> bool {
    for nonce in 0..=u32::MAX {
        block.header.nonce = nonce;
        if hash_meets_target(&block.block_hash(), block.header.bits) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<MemoryChain>, Arc<MemoryMempool>, MemoryTemplateGenerator) {
        let ts: Arc<dyn TimeSource> = Arc::new(MedianTimeSource::default());
        let chain = Arc::new(MemoryChain::new(NetworkType::Regtest, ts.clone()));
        let mempool = Arc::new(MemoryMempool::new(chain.clone()));
        let gen = MemoryTemplateGenerator::new(chain.clone(), mempool.clone(), ts);
        (chain, mempool, gen)
    }

    #[test]
    fn test_template_solves_and_connects() {
        let (chain, mempool, gen) = setup();
        let sync = MemorySyncManager::new(chain.clone(), mempool);
        let mut rx = chain.subscribe();

        let mut template = gen.new_block_template(None).unwrap();
        assert_eq!(template.height, 1);
        assert!(solve_block(&mut template.block));
        let hash = template.block.block_hash();
        sync.submit_block(template.block.clone()).unwrap();

        assert_eq!(chain.best_snapshot().hash, hash);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChainNotification::BlockConnected { hash, height: 1 }
        );

        let err = sync.submit_block(template.block).unwrap_err();
        assert_eq!(err.as_rule().unwrap().kind, RuleErrorKind::DuplicateBlock);
    }

    #[test]
    fn test_stale_template_rejected() {
        let (chain, _mempool, gen) = setup();
        let mut first = gen.new_block_template(None).unwrap();
        let mut second = gen.new_block_template(None).unwrap();
        assert!(solve_block(&mut first.block));
        chain.connect_block(first.block).unwrap();

        assert!(solve_block(&mut second.block));
        let err = chain.check_connect_block_template(&second.block).unwrap_err();
        assert_eq!(err.as_rule().unwrap().kind, RuleErrorKind::PrevBlockNotBest);
    }

    #[test]
    fn test_height_to_hash_range_bounds() {
        let (chain, _mempool, gen) = setup();
        for _ in 0..3 {
            let mut t = gen.new_block_template(None).unwrap();
            assert!(solve_block(&mut t.block));
            chain.connect_block(t.block).unwrap();
        }
        let tip = chain.best_snapshot().hash;
        assert_eq!(chain.height_to_hash_range(1, &tip, 10).unwrap().len(), 3);
        assert!(chain.height_to_hash_range(0, &tip, 2).is_err());
        assert!(chain.height_to_hash_range(4, &tip, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mempool_rejects_duplicates() {
        let (_chain, mempool, _gen) = setup();
        let tx = Tx {
            version: 1,
            tx_in: vec![TxIn {
                previous_out_point: OutPoint {
                    hash: Hash([1u8; 32]),
                    index: 0,
                },
                signature_script: vec![],
                sequence: u32::MAX,
            }],
            tx_out: vec![TxOut {
                value: 10,
                pk_script: vec![OP_TRUE],
            }],
            lock_time: 0,
        };
        mempool.process_transaction(tx.clone(), false, false).unwrap();
        let err = mempool.process_transaction(tx, false, false).unwrap_err();
        assert_eq!(err.as_rule().unwrap().kind, RuleErrorKind::DuplicateTx);
        assert!(mempool.last_updated() > 0);
    }
}
