//! BIP 37 transaction filters loaded by SPV peers, and the partial merkle
//! trees sent back to them.

use crate::chain::{Block, Hash, OutPoint, Tx, HASH_SIZE};

use super::message::{MsgFilterLoad, MsgMerkleBlock};

pub const MAX_FILTER_LOAD_HASH_FUNCS: u32 = 50;
pub const MAX_FILTER_LOAD_FILTER_SIZE: usize = 36_000;
pub const MAX_FILTER_ADD_DATA_SIZE: usize = 520;

const SEED_MULTIPLIER: u32 = 0xfba4_c795;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomUpdate {
    None,
    All,
    P2PubkeyOnly,
}

impl BloomUpdate {
    fn from_flags(flags: u8) -> Self {
        match flags & 0x03 {
            1 => BloomUpdate::All,
            2 => BloomUpdate::P2PubkeyOnly,
            _ => BloomUpdate::None,
        }
    }
}

#[derive(Debug, Clone)]
struct Loaded {
    bits: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    update: BloomUpdate,
}

/// Filter state for one peer. Starts unloaded.
#[derive(Debug, Clone, Default)]
pub struct BloomFilter {
    loaded: Option<Loaded>,
}

fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, b) in tail.iter().enumerate() {
            k |= (*b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }
    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Data pushes in a script; parsing stops at the first malformed push.
fn script_pushes(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = Vec::new();
    let mut i = 0;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            0x4c => {
                let Some(n) = script.get(i) else { break };
                i += 1;
                *n as usize
            }
            0x4d => {
                let Some(n) = script.get(i..i + 2) else { break };
                i += 2;
                u16::from_le_bytes([n[0], n[1]]) as usize
            }
            0x4e => {
                let Some(n) = script.get(i..i + 4) else { break };
                i += 4;
                u32::from_le_bytes([n[0], n[1], n[2], n[3]]) as usize
            }
            _ => continue,
        };
        let Some(data) = script.get(i..i + len) else { break };
        pushes.push(data);
        i += len;
    }
    pushes
}

fn is_pay_to_pubkey(script: &[u8]) -> bool {
    (script.len() == 35 && script[0] == 0x21 && script[34] == 0xac)
        || (script.len() == 67 && script[0] == 0x41 && script[66] == 0xac)
}

fn is_multisig(script: &[u8]) -> bool {
    script.last() == Some(&0xae)
}

fn outpoint_bytes(op: &OutPoint) -> [u8; HASH_SIZE + 4] {
    let mut buf = [0u8; HASH_SIZE + 4];
    buf[..HASH_SIZE].copy_from_slice(&op.hash.0);
    buf[HASH_SIZE..].copy_from_slice(&op.index.to_le_bytes());
    buf
}

impl BloomFilter {
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Replace the filter with the one carried by a filterload message.
    /// Oversized filters are clamped to the protocol maxima.
    pub fn reload(&mut self, msg: &MsgFilterLoad) {
        let mut bits = msg.filter.clone();
        bits.truncate(MAX_FILTER_LOAD_FILTER_SIZE);
        if bits.is_empty() {
            bits.push(0);
        }
        self.loaded = Some(Loaded {
            bits,
            hash_funcs: msg.hash_funcs.min(MAX_FILTER_LOAD_HASH_FUNCS),
            tweak: msg.tweak,
            update: BloomUpdate::from_flags(msg.flags),
        });
    }

    pub fn unload(&mut self) {
        self.loaded = None;
    }

    pub fn add(&mut self, data: &[u8]) {
        let Some(f) = self.loaded.as_mut() else {
            return;
        };
        let nbits = (f.bits.len() * 8) as u32;
        for n in 0..f.hash_funcs {
            let idx = murmur3(n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(f.tweak), data) % nbits;
            f.bits[(idx >> 3) as usize] |= 1 << (idx & 7);
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        let Some(f) = self.loaded.as_ref() else {
            return false;
        };
        let nbits = (f.bits.len() * 8) as u32;
        (0..f.hash_funcs).all(|n| {
            let idx = murmur3(n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(f.tweak), data) % nbits;
            f.bits[(idx >> 3) as usize] & (1 << (idx & 7)) != 0
        })
    }

    /// Whether the transaction is relevant to the filter. Matching outputs
    /// add their outpoint to the filter according to the update flags so
    /// spends of them also match.
    pub fn match_tx_and_update(&mut self, tx: &Tx) -> bool {
        let Some(update) = self.loaded.as_ref().map(|f| f.update) else {
            return false;
        };
        let hash = tx.tx_hash();
        let mut matched = self.matches(&hash.0);

        for (i, out) in tx.tx_out.iter().enumerate() {
            for data in script_pushes(&out.pk_script) {
                if !self.matches(data) {
                    continue;
                }
                matched = true;
                let add = match update {
                    BloomUpdate::All => true,
                    BloomUpdate::P2PubkeyOnly => {
                        is_pay_to_pubkey(&out.pk_script) || is_multisig(&out.pk_script)
                    }
                    BloomUpdate::None => false,
                };
                if add {
                    let op = OutPoint {
                        hash,
                        index: i as u32,
                    };
                    self.add(&outpoint_bytes(&op));
                }
                break;
            }
        }
        if matched {
            return true;
        }

        tx.tx_in.iter().any(|input| {
            self.matches(&outpoint_bytes(&input.previous_out_point))
                || script_pushes(&input.signature_script)
                    .into_iter()
                    .any(|data| self.matches(data))
        })
    }
}

/// Build a merkleblock for the block against the filter, returning the
/// message and the indices of the matched transactions.
pub fn new_merkle_block(block: &Block, filter: &mut BloomFilter) -> (MsgMerkleBlock, Vec<usize>) {
    let n = block.transactions.len();
    let mut matched = Vec::new();
    let mut flags_per_leaf = Vec::with_capacity(n);
    let leaves: Vec<Hash> = block
        .transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| {
            let hit = filter.match_tx_and_update(tx);
            if hit {
                matched.push(i);
            }
            flags_per_leaf.push(hit);
            tx.tx_hash()
        })
        .collect();

    let mut builder = PartialMerkle {
        leaves: &leaves,
        matches: &flags_per_leaf,
        hashes: Vec::new(),
        bits: Vec::new(),
    };
    let mut height = 0;
    while builder.width(height) > 1 {
        height += 1;
    }
    builder.traverse(height, 0);

    let mut flags = vec![0u8; builder.bits.len().div_ceil(8)];
    for (i, bit) in builder.bits.iter().enumerate() {
        if *bit {
            flags[i / 8] |= 1 << (i % 8);
        }
    }
    (
        MsgMerkleBlock {
            header: block.header,
            transactions: n as u32,
            hashes: builder.hashes,
            flags,
        },
        matched,
    )
}

struct PartialMerkle<'a> {
    leaves: &'a [Hash],
    matches: &'a [bool],
    hashes: Vec<Hash>,
    bits: Vec<bool>,
}

impl PartialMerkle<'_> {
    fn width(&self, height: u32) -> usize {
        (self.leaves.len() + (1 << height) - 1) >> height
    }

    fn hash_at(&self, height: u32, pos: usize) -> Hash {
        if height == 0 {
            return self.leaves[pos];
        }
        let left = self.hash_at(height - 1, pos * 2);
        let right = if pos * 2 + 1 < self.width(height - 1) {
            self.hash_at(height - 1, pos * 2 + 1)
        } else {
            left
        };
        let mut buf = [0u8; HASH_SIZE * 2];
        buf[..HASH_SIZE].copy_from_slice(&left.0);
        buf[HASH_SIZE..].copy_from_slice(&right.0);
        Hash::double_sha256(&buf)
    }

    fn traverse(&mut self, height: u32, pos: usize) {
        let start = pos << height;
        let end = ((pos + 1) << height).min(self.leaves.len());
        let parent_of_match = self.matches[start..end].iter().any(|m| *m);
        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            let h = self.hash_at(height, pos);
            self.hashes.push(h);
            return;
        }
        self.traverse(height - 1, pos * 2);
        if pos * 2 + 1 < self.width(height - 1) {
            self.traverse(height - 1, pos * 2 + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{merkle_root, BlockHeader, TxIn, TxOut};

    fn tx_paying(script: Vec<u8>, seq: u32) -> Tx {
        Tx {
            version: 1,
            tx_in: vec![TxIn {
                previous_out_point: OutPoint {
                    hash: Hash([seq as u8; 32]),
                    index: 0,
                },
                signature_script: vec![],
                sequence: seq,
            }],
            tx_out: vec![TxOut {
                value: 1,
                pk_script: script,
            }],
            lock_time: 0,
        }
    }

    fn loaded(flags: u8) -> BloomFilter {
        let mut f = BloomFilter::default();
        f.reload(&MsgFilterLoad {
            filter: vec![0u8; 64],
            hash_funcs: 5,
            tweak: 7,
            flags,
        });
        f
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3(0, b""), 0);
        assert_eq!(murmur3(0xfba4c795, b""), 0x6a396f08);
        assert_eq!(murmur3(0, &[0x00]), 0x514e28b7);
    }

    #[test]
    fn test_unloaded_filter_matches_nothing() {
        let mut f = BloomFilter::default();
        f.add(b"data");
        assert!(!f.is_loaded());
        assert!(!f.matches(b"data"));
    }

    #[test]
    fn test_added_data_matches() {
        let mut f = loaded(0);
        f.add(b"hello");
        assert!(f.matches(b"hello"));
        f.unload();
        assert!(!f.matches(b"hello"));
    }

    #[test]
    fn test_matching_output_adds_outpoint() {
        let pubkey_hash = [3u8; 20];
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&pubkey_hash);
        script.extend_from_slice(&[0x88, 0xac]);
        let funding = tx_paying(script, 1);

        let mut f = loaded(1);
        f.add(&pubkey_hash);
        assert!(f.match_tx_and_update(&funding));

        let spend = Tx {
            version: 1,
            tx_in: vec![TxIn {
                previous_out_point: OutPoint {
                    hash: funding.tx_hash(),
                    index: 0,
                },
                signature_script: vec![],
                sequence: 0,
            }],
            tx_out: vec![TxOut {
                value: 1,
                pk_script: vec![0x51],
            }],
            lock_time: 0,
        };
        assert!(f.match_tx_and_update(&spend));
    }

    #[test]
    fn test_merkle_block_lists_matched_tx() {
        let txs: Vec<Tx> = (0..5).map(|i| tx_paying(vec![0x51], i)).collect();
        let block = Block {
            header: BlockHeader {
                merkle_root: merkle_root(&txs),
                ..Default::default()
            },
            transactions: txs.clone(),
        };
        let mut f = loaded(0);
        f.add(&txs[3].tx_hash().0);
        let (msg, matched) = new_merkle_block(&block, &mut f);
        assert_eq!(matched, vec![3]);
        assert_eq!(msg.transactions, 5);
        assert!(msg.hashes.contains(&txs[3].tx_hash()));
    }
}
