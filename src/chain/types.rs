//! Block, transaction and addressing types shared by the node, the RPC
//! server and the miners.
//!
//! Serialization follows the Bitcoin wire layout (little-endian integers,
//! compact-size counts) so hashes computed here agree with any peer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::error::DecodeError;

pub const HASH_SIZE: usize = 32;
pub const BLOCK_HEADER_LEN: usize = 80;

/// Upper bound on any decoded element count, well above a full block.
const MAX_DECODE_COUNT: u64 = 1_000_000;

/// Double-SHA256 digest. Stored in internal byte order, displayed reversed.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&second);
        Hash(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Big-endian view, used for numeric comparison against a target.
    pub fn to_be_bytes(&self) -> [u8; HASH_SIZE] {
        let mut be = self.0;
        be.reverse();
        be
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_be_bytes()))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > HASH_SIZE * 2 {
            return Err(DecodeError::InvalidHash(s.to_string()));
        }
        // Short strings are left-padded like a big number would be.
        let padded = format!("{:0>64}", s);
        let mut be = [0u8; HASH_SIZE];
        hex::decode_to_slice(&padded, &mut be)
            .map_err(|_| DecodeError::InvalidHash(s.to_string()))?;
        be.reverse();
        Ok(Hash(be))
    }
}

/// Cursor over a byte slice used by every `deserialize` here.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash, DecodeError> {
        Ok(Hash(self.read_array()?))
    }

    pub fn read_var_int(&mut self) -> Result<u64, DecodeError> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16()? as u64),
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    fn read_count(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let count = self.read_var_int()?;
        if count > MAX_DECODE_COUNT {
            return Err(DecodeError::TooMany {
                what,
                count,
                max: MAX_DECODE_COUNT,
            });
        }
        Ok(count as usize)
    }

    pub fn read_var_bytes(&mut self, what: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_count(what)?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

pub fn write_var_int(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    /// Unix seconds; encoded as u32 on the wire.
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut out = [0u8; BLOCK_HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_block.0);
        out[36..68].copy_from_slice(&self.merkle_root.0);
        out[68..72].copy_from_slice(&(self.timestamp as u32).to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: r.read_i32()?,
            prev_block: r.read_hash()?,
            merkle_root: r.read_hash()?,
            timestamp: r.read_u32()? as i64,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }

    pub fn block_hash(&self) -> Hash {
        Hash::double_sha256(&self.serialize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_out_point: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub pk_script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tx {
    pub version: i32,
    pub tx_in: Vec<TxIn>,
    pub tx_out: Vec<TxOut>,
    pub lock_time: u32,
}

impl Tx {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_var_int(buf, self.tx_in.len() as u64);
        for input in &self.tx_in {
            buf.extend_from_slice(&input.previous_out_point.hash.0);
            buf.extend_from_slice(&input.previous_out_point.index.to_le_bytes());
            write_var_bytes(buf, &input.signature_script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_var_int(buf, self.tx_out.len() as u64);
        for output in &self.tx_out {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_var_bytes(buf, &output.pk_script);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialize_size());
        self.write_to(&mut buf);
        buf
    }

    pub fn serialize_size(&self) -> usize {
        fn var_int_len(n: usize) -> usize {
            match n {
                0..=0xfc => 1,
                0xfd..=0xffff => 3,
                0x10000..=0xffff_ffff => 5,
                _ => 9,
            }
        }
        let mut n = 8 + var_int_len(self.tx_in.len()) + var_int_len(self.tx_out.len());
        for input in &self.tx_in {
            n += 40 + var_int_len(input.signature_script.len()) + input.signature_script.len();
        }
        for output in &self.tx_out {
            n += 8 + var_int_len(output.pk_script.len()) + output.pk_script.len();
        }
        n
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.read_i32()?;
        let in_count = r.read_count("tx input")?;
        let mut tx_in = Vec::with_capacity(in_count.min(1024));
        for _ in 0..in_count {
            let hash = r.read_hash()?;
            let index = r.read_u32()?;
            let signature_script = r.read_var_bytes("signature script")?;
            let sequence = r.read_u32()?;
            tx_in.push(TxIn {
                previous_out_point: OutPoint { hash, index },
                signature_script,
                sequence,
            });
        }
        let out_count = r.read_count("tx output")?;
        let mut tx_out = Vec::with_capacity(out_count.min(1024));
        for _ in 0..out_count {
            let value = r.read_i64()?;
            let pk_script = r.read_var_bytes("pk script")?;
            tx_out.push(TxOut { value, pk_script });
        }
        let lock_time = r.read_u32()?;
        Ok(Self {
            version,
            tx_in,
            tx_out,
            lock_time,
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let tx = Self::read_from(&mut r)?;
        r.finish()?;
        Ok(tx)
    }

    pub fn tx_hash(&self) -> Hash {
        Hash::double_sha256(&self.serialize())
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_in.len() == 1
            && self.tx_in[0].previous_out_point.hash.is_zero()
            && self.tx_in[0].previous_out_point.index == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Tx>,
}

impl Block {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_LEN + 1 + self.transactions.len() * 256);
        buf.extend_from_slice(&self.header.serialize());
        write_var_int(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write_to(&mut buf);
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let header = BlockHeader::read_from(&mut r)?;
        let count = r.read_count("transaction")?;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Tx::read_from(&mut r)?);
        }
        r.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }
}

/// Merkle root over transaction hashes; an odd level repeats its last node.
pub fn merkle_root(txs: &[Tx]) -> Hash {
    let mut level: Vec<Hash> = txs.iter().map(Tx::tx_hash).collect();
    if level.is_empty() {
        return Hash::ZERO;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; HASH_SIZE * 2];
                buf[..HASH_SIZE].copy_from_slice(&pair[0].0);
                buf[HASH_SIZE..].copy_from_slice(&pair[1].0);
                Hash::double_sha256(&buf)
            })
            .collect();
    }
    level[0]
}

/// Expands compact difficulty bits into a big-endian 256-bit target.
pub fn compact_to_target(bits: u32) -> [u8; HASH_SIZE] {
    let mut target = [0u8; HASH_SIZE];
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return target;
    }
    let mant = mantissa.to_be_bytes(); // [0, m2, m1, m0]
    for (i, byte) in mant[1..].iter().enumerate() {
        // byte i sits at 256-bit position exponent - 1 - i (counting from the
        // least significant byte).
        let pos = exponent as isize - 1 - i as isize;
        if (0..HASH_SIZE as isize).contains(&pos) {
            target[HASH_SIZE - 1 - pos as usize] = *byte;
        }
    }
    target
}

/// Target rendered as 64 lower-case hex digits.
pub fn target_hex(bits: u32) -> String {
    hex::encode(compact_to_target(bits))
}

pub fn hash_meets_target(hash: &Hash, bits: u32) -> bool {
    let target = compact_to_target(bits);
    hash.to_be_bytes() <= target
}

/// Difficulty relative to the minimum-difficulty bits `0x1d00ffff`.
pub fn difficulty_from_bits(bits: u32) -> f64 {
    let mantissa = (bits & 0x00ff_ffff) as f64;
    if mantissa == 0.0 {
        return 0.0;
    }
    let mut shift = (bits >> 24) as i32;
    let mut diff = 0x0000_ffff as f64 / mantissa;
    while shift < 29 {
        diff *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        diff /= 256.0;
        shift -= 1;
    }
    diff
}

/// Expected number of hashes to find a block at `bits`.
pub fn block_work(bits: u32) -> f64 {
    difficulty_from_bits(bits) * 4_294_967_296.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessBlock,
    WitnessTx,
    FilteredWitnessBlock,
}

impl fmt::Display for InvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvType::Error => "ERROR",
            InvType::Tx => "MSG_TX",
            InvType::Block => "MSG_BLOCK",
            InvType::FilteredBlock => "MSG_FILTERED_BLOCK",
            InvType::WitnessBlock => "MSG_WITNESS_BLOCK",
            InvType::WitnessTx => "MSG_WITNESS_TX",
            InvType::FilteredWitnessBlock => "MSG_FILTERED_WITNESS_BLOCK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }
}

pub const SF_NODE_NETWORK: u64 = 1 << 0;
pub const SF_NODE_GETUTXO: u64 = 1 << 1;
pub const SF_NODE_BLOOM: u64 = 1 << 2;
pub const SF_NODE_WITNESS: u64 = 1 << 3;
pub const SF_NODE_CF: u64 = 1 << 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    /// Last-seen time in unix seconds.
    pub timestamp: i64,
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            services,
            ip,
            port,
        }
    }

    pub fn key(&self) -> String {
        std::net::SocketAddr::new(self.ip, self.port).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash,
}

/// Snapshot of the chain tip.
#[derive(Debug, Clone, PartialEq)]
pub struct BestState {
    pub hash: Hash,
    pub height: i32,
    pub bits: u32,
    pub block_size: u64,
    pub block_weight: u64,
    pub num_txns: u64,
    pub total_txns: u64,
    pub median_time: i64,
}

/// Unspent output in the main chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub amount: i64,
    pub pk_script: Vec<u8>,
    pub block_height: i32,
    pub is_coinbase: bool,
}

/// Candidate block handed out to miners.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub block: Block,
    pub fees: Vec<i64>,
    pub sig_op_costs: Vec<i64>,
    pub height: i32,
    pub valid_pay_address: bool,
    pub witness_commitment: Option<Vec<u8>>,
}

/// Mempool entry descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct TxDesc {
    pub tx: Tx,
    pub added: i64,
    pub height: i32,
    pub fee: i64,
    pub fee_per_kb: i64,
    pub starting_priority: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    Regular,
}

impl FilterType {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(FilterType::Regular),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(value: i64) -> Tx {
        Tx {
            version: 1,
            tx_in: vec![TxIn {
                previous_out_point: OutPoint {
                    hash: Hash::ZERO,
                    index: u32::MAX,
                },
                signature_script: vec![0x51, 0x02, 0x01, 0x00],
                sequence: u32::MAX,
            }],
            tx_out: vec![TxOut {
                value,
                pk_script: vec![0x76, 0xa9],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_hash_display_is_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let hash = Hash(bytes);
        let s = hash.to_string();
        assert!(s.ends_with("ab"));
        assert_eq!(s.parse::<Hash>().unwrap(), hash);
    }

    #[test]
    fn test_hash_rejects_garbage() {
        assert!("zz".parse::<Hash>().is_err());
        assert!("0".repeat(65).parse::<Hash>().is_err());
    }

    #[test]
    fn test_block_decode_rejects_truncated_data() {
        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![sample_tx(50)],
        };
        let bytes = block.serialize();
        assert_eq!(Block::deserialize(&bytes).unwrap(), block);
        assert_eq!(
            Block::deserialize(&bytes[..bytes.len() - 1]),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_serialize_size_matches() {
        let tx = sample_tx(5_000_000_000);
        assert_eq!(tx.serialize().len(), tx.serialize_size());
        assert!(tx.is_coinbase());
    }

    #[test]
    fn test_merkle_root_single_tx_is_tx_hash() {
        let tx = sample_tx(1);
        assert_eq!(merkle_root(std::slice::from_ref(&tx)), tx.tx_hash());
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let txs = vec![sample_tx(1), sample_tx(2), sample_tx(3)];
        let mut padded = txs.clone();
        padded.push(sample_tx(3));
        assert_eq!(merkle_root(&txs), merkle_root(&padded));
    }

    #[test]
    fn test_compact_target() {
        assert_eq!(
            target_hex(0x1d00ffff),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(0x207fffff),
            "7fffff0000000000000000000000000000000000000000000000000000000000"
        );
        assert!((difficulty_from_bits(0x1d00ffff) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_easy_target_accepts_small_hash() {
        let mut bytes = [0u8; 32];
        bytes[31] = 0x01; // most significant byte after reversal
        assert!(hash_meets_target(&Hash(bytes), 0x207fffff));
        bytes[31] = 0x80;
        assert!(!hash_meets_target(&Hash(bytes), 0x207fffff));
    }
}
