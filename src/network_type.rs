use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::chain::Checkpoint;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
    Simnet,
}

impl NetworkType {
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            NetworkType::Mainnet => [0xd9, 0xb4, 0xbe, 0xf9],
            NetworkType::Testnet => [0x07, 0x11, 0x09, 0x0b],
            NetworkType::Regtest => [0xda, 0xb5, 0xbf, 0xfa],
            NetworkType::Simnet => [0x12, 0x14, 0x1c, 0x16],
        }
    }

    pub fn default_p2p_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 11047,
            NetworkType::Testnet => 21047,
            NetworkType::Regtest => 31047,
            NetworkType::Simnet => 41047,
        }
    }

    pub fn default_rpc_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 11048,
            NetworkType::Testnet => 21048,
            NetworkType::Regtest => 31048,
            NetworkType::Simnet => 41048,
        }
    }

    /// Version byte of pay-to-pubkey-hash addresses.
    pub fn pubkey_hash_addr_id(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 83,
            NetworkType::Testnet => 18,
            NetworkType::Regtest => 0x6f,
            NetworkType::Simnet => 0x3f,
        }
    }

    /// Version byte of pay-to-script-hash addresses.
    pub fn script_hash_addr_id(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 9,
            NetworkType::Testnet => 188,
            NetworkType::Regtest => 0xc4,
            NetworkType::Simnet => 0x7b,
        }
    }

    /// Compact bits of the easiest allowed target.
    pub fn pow_limit_bits(&self) -> u32 {
        match self {
            NetworkType::Mainnet | NetworkType::Testnet => 0x1e0fffff,
            NetworkType::Regtest | NetworkType::Simnet => 0x207fffff,
        }
    }

    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => &["seed1.parallelcoin.io", "seed2.parallelcoin.io"],
            NetworkType::Testnet => &["testseed.parallelcoin.io"],
            NetworkType::Regtest | NetworkType::Simnet => &[],
        }
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        // Networks ship without hard-coded checkpoints; operators add them
        // through `[node] checkpoints`.
        Vec::new()
    }

    /// Regression and simulation networks don't require peers to serve
    /// templates.
    pub fn is_test_harness(&self) -> bool {
        matches!(self, NetworkType::Regtest | NetworkType::Simnet)
    }

    pub fn is_simnet(&self) -> bool {
        matches!(self, NetworkType::Simnet)
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
            NetworkType::Simnet => "simnet",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(NetworkType::Mainnet),
            "testnet" => Ok(NetworkType::Testnet),
            "regtest" | "regressiontest" => Ok(NetworkType::Regtest),
            "simnet" => Ok(NetworkType::Simnet),
            other => Err(format!("unknown network {}", other)),
        }
    }
}
