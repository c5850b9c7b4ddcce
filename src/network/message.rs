//! P2P messages the node handlers consume and produce. Framing and
//! encoding belong to the wire layer; these are the decoded forms.

use serde::{Deserialize, Serialize};

use crate::chain::{Block, BlockHeader, Hash, InvVect, NetAddress, Tx};

pub const PROTOCOL_VERSION: u32 = 70013;
pub const MIN_ACCEPTABLE_PROTOCOL_VERSION: u32 = 209;
pub const NET_ADDRESS_TIME_VERSION: u32 = 31402;
pub const BIP0037_VERSION: u32 = 70001;
pub const BIP0111_VERSION: u32 = 70011;
pub const FEE_FILTER_VERSION: u32 = 70013;

pub const MAX_INV_PER_MSG: usize = 50_000;
pub const MAX_BLOCKS_PER_MSG: u32 = 500;
pub const MAX_ADDR_PER_MSG: usize = 1000;
pub const MAX_CF_HEADERS_PER_MSG: usize = 2000;
pub const MAX_GET_CFILTERS_REQ_RANGE: usize = 1000;
pub const CF_CHECKPT_INTERVAL: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgReject {
    pub cmd: String,
    pub code: RejectCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgVersion {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub last_block: i32,
    pub disable_relay_tx: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgGetBlocks {
    pub block_locator_hashes: Vec<Hash>,
    pub hash_stop: Hash,
}

pub type MsgGetHeaders = MsgGetBlocks;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgGetCFilters {
    pub filter_type: u8,
    pub start_height: u32,
    pub stop_hash: Hash,
}

pub type MsgGetCFHeaders = MsgGetCFilters;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgGetCFCheckpt {
    pub filter_type: u8,
    pub stop_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgFilterLoad {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCFilter {
    pub filter_type: u8,
    pub block_hash: Hash,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgCFHeaders {
    pub filter_type: u8,
    pub stop_hash: Hash,
    pub prev_filter_header: Hash,
    pub filter_hashes: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCFCheckpt {
    pub filter_type: u8,
    pub stop_hash: Hash,
    pub filter_headers: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgMerkleBlock {
    pub header: BlockHeader,
    pub transactions: u32,
    pub hashes: Vec<Hash>,
    pub flags: Vec<u8>,
}

/// Outbound message queued on a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Inv(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Tx),
    MerkleBlock(MsgMerkleBlock),
    Addr(Vec<NetAddress>),
    GetAddr,
    Ping(u64),
    CFilter(MsgCFilter),
    CFHeaders(MsgCFHeaders),
    CFCheckpt(MsgCFCheckpt),
    Reject(MsgReject),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Inv(_) => "inv",
            Message::NotFound(_) => "notfound",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Ping(_) => "ping",
            Message::CFilter(_) => "cfilter",
            Message::CFHeaders(_) => "cfheaders",
            Message::CFCheckpt(_) => "cfcheckpt",
            Message::Reject(_) => "reject",
        }
    }
}
