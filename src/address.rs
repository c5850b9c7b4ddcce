//! Base58Check payment addresses used for mining payouts.
//!
//! Format: base58(version || hash160 || checksum[..4]) where the version
//! byte selects the network and the script kind.

use crate::network_type::NetworkType;
use sha2::{Digest, Sha256};
use std::fmt;

const PAYLOAD_LEN: usize = 20;
const CHECKSUM_LEN: usize = 4;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_DATA_20: u8 = 0x14;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    PubKeyHash,
    ScriptHash,
}

impl AddressKind {
    /// Script class name used in RPC replies.
    pub fn script_class(&self) -> &'static str {
        match self {
            AddressKind::PubKeyHash => "pubkeyhash",
            AddressKind::ScriptHash => "scripthash",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    network: NetworkType,
    kind: AddressKind,
    payload: [u8; PAYLOAD_LEN],
}

impl Address {
    pub fn new(network: NetworkType, kind: AddressKind, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            network,
            kind,
            payload,
        }
    }

    /// Decode an address string and check that it belongs to `network`.
    pub fn decode(s: &str, network: NetworkType) -> Result<Self, AddressError> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|_| AddressError::InvalidBase58)?;

        if decoded.len() != 1 + PAYLOAD_LEN + CHECKSUM_LEN {
            return Err(AddressError::InvalidLength);
        }

        let (body, checksum) = decoded.split_at(1 + PAYLOAD_LEN);
        if checksum != &Self::compute_checksum(body)[..] {
            return Err(AddressError::InvalidChecksum);
        }

        let kind = match body[0] {
            v if v == network.pubkey_hash_addr_id() => AddressKind::PubKeyHash,
            v if v == network.script_hash_addr_id() => AddressKind::ScriptHash,
            _ => return Err(AddressError::InvalidNetwork),
        };

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&body[1..]);

        Ok(Self {
            network,
            kind,
            payload,
        })
    }

    pub fn encode(&self) -> String {
        let version = match self.kind {
            AddressKind::PubKeyHash => self.network.pubkey_hash_addr_id(),
            AddressKind::ScriptHash => self.network.script_hash_addr_id(),
        };
        let mut data = Vec::with_capacity(1 + PAYLOAD_LEN + CHECKSUM_LEN);
        data.push(version);
        data.extend_from_slice(&self.payload);
        let checksum = Self::compute_checksum(&data);
        data.extend_from_slice(&checksum);
        bs58::encode(data).into_string()
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    /// Output script paying to this address.
    pub fn pay_to_script(&self) -> Vec<u8> {
        match self.kind {
            AddressKind::PubKeyHash => {
                let mut script = Vec::with_capacity(25);
                script.extend_from_slice(&[OP_DUP, OP_HASH160, OP_DATA_20]);
                script.extend_from_slice(&self.payload);
                script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
                script
            }
            AddressKind::ScriptHash => {
                let mut script = Vec::with_capacity(23);
                script.extend_from_slice(&[OP_HASH160, OP_DATA_20]);
                script.extend_from_slice(&self.payload);
                script.push(OP_EQUAL);
                script
            }
        }
    }

    /// Address paid by a standard pay-to-pubkey-hash or pay-to-script-hash
    /// output script.
    pub fn from_script(script: &[u8], network: NetworkType) -> Option<Self> {
        let (kind, hash) = match script {
            [OP_DUP, OP_HASH160, OP_DATA_20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG]
                if hash.len() == PAYLOAD_LEN =>
            {
                (AddressKind::PubKeyHash, hash)
            }
            [OP_HASH160, OP_DATA_20, hash @ .., OP_EQUAL] if hash.len() == PAYLOAD_LEN => {
                (AddressKind::ScriptHash, hash)
            }
            _ => return None,
        };
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(hash);
        Some(Self::new(network, kind, payload))
    }

    fn compute_checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
        let hash1 = Sha256::digest(data);
        let hash2 = Sha256::digest(hash1);
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&hash2[..CHECKSUM_LEN]);
        checksum
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address length")]
    InvalidLength,
    #[error("Address is not for this network")]
    InvalidNetwork,
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid base58 character")]
    InvalidBase58,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let addr = Address::new(NetworkType::Regtest, AddressKind::PubKeyHash, [7u8; 20]);
        let parsed = Address::decode(&addr.encode(), NetworkType::Regtest).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn test_script_recovers_address() {
        for kind in [AddressKind::PubKeyHash, AddressKind::ScriptHash] {
            let addr = Address::new(NetworkType::Regtest, kind, [3u8; 20]);
            let script = addr.pay_to_script();
            assert_eq!(Address::from_script(&script, NetworkType::Regtest), Some(addr));
        }
        assert_eq!(Address::from_script(&[0x51], NetworkType::Regtest), None);
        assert_eq!(Address::from_script(&[OP_HASH160, OP_DATA_20, OP_EQUAL], NetworkType::Regtest), None);
    }

    #[test]
    fn test_wrong_network_rejected() {
        let addr = Address::new(NetworkType::Mainnet, AddressKind::ScriptHash, [1u8; 20]);
        assert_eq!(
            Address::decode(&addr.encode(), NetworkType::Simnet),
            Err(AddressError::InvalidNetwork)
        );
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(Address::decode("0OIl", NetworkType::Mainnet).is_err());
        assert!(Address::decode("1111", NetworkType::Mainnet).is_err());

        let mut s = Address::new(NetworkType::Testnet, AddressKind::PubKeyHash, [9u8; 20]).encode();
        let last = s.pop().unwrap();
        s.push(if last == '2' { '3' } else { '2' });
        assert!(Address::decode(&s, NetworkType::Testnet).is_err());
    }

    #[test]
    fn test_pay_to_script_shape() {
        let p2pkh = Address::new(NetworkType::Mainnet, AddressKind::PubKeyHash, [0u8; 20]);
        let script = p2pkh.pay_to_script();
        assert_eq!(script.len(), 25);
        assert_eq!(script[0], OP_DUP);
        assert_eq!(*script.last().unwrap(), OP_CHECKSIG);
    }
}
