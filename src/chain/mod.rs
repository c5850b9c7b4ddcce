//! Interfaces to the collaborators the node drives but does not implement:
//! block chain, mempool, sync/address/connection managers, filter index,
//! template generator, time source and fee estimator.
//!
//! `memory` provides in-process implementations used by the binary on the
//! test networks and by the integration tests.

pub mod error;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::address::Address;
use crate::network::peer::Peer;

pub use error::{ChainError, DecodeError, RuleError, RuleErrorKind};
pub use types::*;

/// Maximum seconds a block timestamp may run ahead of adjusted time.
pub const MAX_TIME_OFFSET_SECONDS: i64 = 2 * 60 * 60;
pub const MAX_BLOCK_WEIGHT: i64 = 4_000_000;
pub const MAX_BLOCK_BASE_SIZE: i64 = 1_000_000;
pub const MAX_BLOCK_SIGOPS_COST: i64 = 80_000;
pub const SATOSHI_PER_COIN: i64 = 100_000_000;
pub const MAX_SATOSHI: i64 = 21_000_000 * SATOSHI_PER_COIN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainNotification {
    BlockConnected { hash: Hash, height: i32 },
    BlockDisconnected { hash: Hash, height: i32 },
}

pub trait Chain: Send + Sync {
    fn best_snapshot(&self) -> BestState;
    fn block_hash_by_height(&self, height: i32) -> Result<Hash, ChainError>;
    fn block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError>;
    fn header_by_hash(&self, hash: &Hash) -> Result<BlockHeader, ChainError>;
    fn height_by_hash(&self, hash: &Hash) -> Result<i32, ChainError>;
    /// Hashes after the first locator hash found in the main chain, up to
    /// `hash_stop` or `max` entries.
    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max: u32) -> Vec<Hash>;
    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader>;
    fn height_to_hash_range(
        &self,
        start_height: i32,
        end_hash: &Hash,
        max_results: usize,
    ) -> Result<Vec<Hash>, ChainError>;
    /// Hashes at every `interval` heights up to and including `end_hash`'s
    /// height (excluding genesis).
    fn interval_block_hashes(&self, end_hash: &Hash, interval: i32)
        -> Result<Vec<Hash>, ChainError>;
    /// Full validation of a block built on the current tip, without
    /// connecting it.
    fn check_connect_block_template(&self, block: &Block) -> Result<(), ChainError>;
    fn is_segwit_active(&self) -> Result<bool, ChainError>;
    /// The output if it exists in the main chain and is unspent there.
    fn fetch_utxo_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError>;
    fn subscribe(&self) -> broadcast::Receiver<ChainNotification>;
}

pub trait TxMemPool: Send + Sync {
    fn fetch_transaction(&self, hash: &Hash) -> Option<Tx>;
    fn tx_descs(&self) -> Vec<TxDesc>;
    fn tx_hashes(&self) -> Vec<Hash>;
    fn count(&self) -> usize;
    /// Unix seconds of the last add/remove.
    fn last_updated(&self) -> i64;
    /// Returns every transaction accepted as a result, the submitted one
    /// first.
    fn process_transaction(
        &self,
        tx: Tx,
        allow_orphan: bool,
        rate_limit: bool,
    ) -> Result<Vec<TxDesc>, ChainError>;
    fn remove_transaction(&self, tx: &Tx, remove_redeemers: bool);
}

#[async_trait]
pub trait SyncManager: Send + Sync {
    fn start(&self);
    fn stop(&self) -> Result<(), ChainError>;
    fn is_current(&self) -> bool;
    fn new_peer(&self, peer: Arc<dyn Peer>);
    fn done_peer(&self, peer: Arc<dyn Peer>);
    /// Resolves once the block has been fully processed.
    async fn queue_block(&self, block: Block, peer: Arc<dyn Peer>);
    /// Resolves once the transaction has been fully processed.
    async fn queue_tx(&self, tx: Tx, peer: Arc<dyn Peer>);
    fn queue_inv(&self, inv: Vec<InvVect>, peer: Arc<dyn Peer>);
    fn queue_headers(&self, headers: Vec<BlockHeader>, peer: Arc<dyn Peer>);
    /// Returns whether the block was an orphan.
    fn submit_block(&self, block: Block) -> Result<bool, ChainError>;
}

pub trait AddrManager: Send + Sync {
    fn start(&self);
    fn stop(&self) -> Result<(), ChainError>;
    fn add_addresses(&self, addrs: &[NetAddress], src: &NetAddress);
    fn address_cache(&self) -> Vec<NetAddress>;
    fn good(&self, addr: &NetAddress);
    fn connected(&self, addr: &NetAddress);
    fn set_services(&self, addr: &NetAddress, services: u64);
    fn need_more_addresses(&self) -> bool;
    fn get_best_local_address(&self, remote: &NetAddress) -> Option<NetAddress>;
}

#[async_trait]
pub trait ConnManager: Send + Sync {
    fn start(&self);
    fn stop(&self);
    async fn connect(&self, addr: SocketAddr, permanent: bool);
    fn disconnect(&self, conn_req_id: u64);
}

/// Committed-filter index.
pub trait CfIndex: Send + Sync {
    fn filter_by_block_hash(&self, hash: &Hash, ft: FilterType) -> Result<Option<Vec<u8>>, ChainError>;
    fn filters_by_block_hashes(
        &self,
        hashes: &[Hash],
        ft: FilterType,
    ) -> Result<Vec<Option<Vec<u8>>>, ChainError>;
    fn filter_header_by_block_hash(&self, hash: &Hash, ft: FilterType) -> Result<Option<Hash>, ChainError>;
    fn filter_headers_by_block_hashes(
        &self,
        hashes: &[Hash],
        ft: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError>;
    fn filter_hashes_by_block_hashes(
        &self,
        hashes: &[Hash],
        ft: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError>;
}

pub trait TemplateGenerator: Send + Sync {
    fn new_block_template(&self, pay_to: Option<&Address>) -> Result<BlockTemplate, ChainError>;
    /// Moves the header timestamp forward to the later of adjusted time and
    /// the minimum median time.
    fn update_block_time(&self, block: &mut Block) -> Result<(), ChainError>;
}

pub trait TimeSource: Send + Sync {
    /// Local clock in unix seconds, without the network offset.
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
    fn adjusted_time(&self) -> i64;
    fn add_time_sample(&self, source: &str, timestamp: i64);
    fn offset_seconds(&self) -> i64;
}

pub trait FeeEstimator: Send + Sync {
    /// Estimated fee in coins per kilobyte.
    fn estimate_fee(&self, num_blocks: u32) -> Result<f64, ChainError>;
    fn save(&self) -> Vec<u8>;
}

pub trait MetadataStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;
}
