//! JSON-RPC error values and the BIP 22 rejection vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chain::{ChainError, RuleErrorKind};

pub const ERR_RPC_MISC: i32 = -1;
pub const ERR_RPC_TYPE: i32 = -3;
pub const ERR_RPC_NO_WALLET: i32 = -4;
pub const ERR_RPC_BLOCK_NOT_FOUND: i32 = -5;
pub const ERR_RPC_INVALID_PARAMETER: i32 = -8;
pub const ERR_RPC_CLIENT_NOT_CONNECTED: i32 = -9;
pub const ERR_RPC_CLIENT_IN_INITIAL_DOWNLOAD: i32 = -10;
pub const ERR_RPC_OUT_OF_RANGE: i32 = -20;
pub const ERR_RPC_DESERIALIZATION: i32 = -22;
pub const ERR_RPC_CLIENT_NODE_NOT_ADDED: i32 = -24;
pub const ERR_RPC_VERIFY: i32 = -25;
pub const ERR_RPC_NO_CF_INDEX: i32 = -33;
pub const ERR_RPC_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_RPC_INVALID_PARAMS: i32 = -32602;
pub const ERR_RPC_INTERNAL: i32 = -32603;
pub const ERR_RPC_PARSE: i32 = -32700;

/// Unimplemented commands share `ERR_RPC_MISC`.
pub const ERR_RPC_UNIMPLEMENTED: i32 = ERR_RPC_MISC;
pub const ERR_RPC_DECODE_HEX_STRING: i32 = ERR_RPC_DESERIALIZATION;
pub const ERR_RPC_NO_TX_INFO: i32 = ERR_RPC_BLOCK_NOT_FOUND;
pub const ERR_RPC_INVALID_TX_VOUT: i32 = ERR_RPC_BLOCK_NOT_FOUND;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse(detail: impl fmt::Display) -> Self {
        Self::new(ERR_RPC_PARSE, format!("Failed to parse request: {}", detail))
    }

    pub fn method_not_found() -> Self {
        Self::new(ERR_RPC_METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_RPC_INVALID_PARAMS, message)
    }

    pub fn limited_user() -> Self {
        Self::invalid_params("limited user not authorized for this method")
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ERR_RPC_INVALID_PARAMETER, message)
    }

    pub fn no_wallet() -> Self {
        Self::new(
            ERR_RPC_NO_WALLET,
            "This implementation does not implement wallet commands",
        )
    }

    pub fn unimplemented() -> Self {
        Self::new(ERR_RPC_UNIMPLEMENTED, "Command unimplemented")
    }

    /// Logs `err` with its context and reports it with the internal error
    /// code. Operators see the underlying text.
    pub fn internal(err: impl fmt::Display, context: &str) -> Self {
        if context.is_empty() {
            tracing::error!("{}", err);
        } else {
            tracing::error!("{}: {}", context, err);
        }
        Self::new(ERR_RPC_INTERNAL, err.to_string())
    }

    pub fn decode_hex(got: &str) -> Self {
        Self::new(
            ERR_RPC_DECODE_HEX_STRING,
            format!("Argument must be hexadecimal string (not {:?})", got),
        )
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(ERR_RPC_DESERIALIZATION, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ERR_RPC_OUT_OF_RANGE, message)
    }

    pub fn block_not_found() -> Self {
        Self::new(ERR_RPC_BLOCK_NOT_FOUND, "Block not found")
    }

    pub fn no_cf_index() -> Self {
        Self::new(
            ERR_RPC_NO_CF_INDEX,
            "The CF index must be enabled for this command",
        )
    }

    /// Lookups outside the mempool need a transaction index, which this
    /// node does not keep.
    pub fn no_tx_info() -> Self {
        Self::new(
            ERR_RPC_NO_TX_INFO,
            "The transaction index must be enabled to query the blockchain",
        )
    }

    pub fn misc(message: impl Into<String>) -> Self {
        Self::new(ERR_RPC_MISC, message)
    }
}

/// Why a handler produced no reply.
#[derive(Debug)]
pub enum HandlerError {
    Rpc(RpcError),
    /// The client hung up during a long poll; nothing is written back.
    ClientQuit,
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        HandlerError::Rpc(err)
    }
}

/// Maps a block rejection to its BIP 22 reason string.
pub fn chain_err_to_gbt_err_string(err: &ChainError) -> String {
    let Some(rule) = err.as_rule() else {
        return format!("rejected: {}", err);
    };
    let reason = match rule.kind {
        RuleErrorKind::DuplicateBlock => "duplicate",
        RuleErrorKind::BlockTooBig => "bad-blk-length",
        RuleErrorKind::BlockWeightTooHigh => "bad-blk-weight",
        RuleErrorKind::BlockVersionTooOld => "bad-version",
        RuleErrorKind::InvalidTime => "bad-time",
        RuleErrorKind::TimeTooOld => "time-too-old",
        RuleErrorKind::TimeTooNew => "time-too-new",
        RuleErrorKind::DifficultyTooLow | RuleErrorKind::UnexpectedDifficulty => "bad-diffbits",
        RuleErrorKind::HighHash => "high-hash",
        RuleErrorKind::BadMerkleRoot => "bad-txnmrklroot",
        RuleErrorKind::BadCheckpoint => "bad-checkpoint",
        RuleErrorKind::ForkTooOld => "fork-too-old",
        RuleErrorKind::CheckpointTimeTooOld => "checkpoint-time-too-old",
        RuleErrorKind::NoTransactions => "bad-txns-none",
        RuleErrorKind::NoTxInputs => "bad-txns-noinputs",
        RuleErrorKind::NoTxOutputs => "bad-txns-nooutputs",
        RuleErrorKind::TxTooBig => "bad-txns-size",
        RuleErrorKind::BadTxOutValue => "bad-txns-outputvalue",
        RuleErrorKind::DuplicateTxInputs => "bad-txns-dupinputs",
        RuleErrorKind::BadTxInput => "bad-txns-badinput",
        RuleErrorKind::MissingTxOut => "bad-txns-missinginput",
        RuleErrorKind::UnfinalizedTx => "bad-txns-unfinalizedtx",
        RuleErrorKind::DuplicateTx => "bad-txns-duplicate",
        RuleErrorKind::OverwriteTx => "bad-txns-overwrite",
        RuleErrorKind::ImmatureSpend => "bad-txns-maturity",
        RuleErrorKind::SpendTooHigh => "bad-txns-highspend",
        RuleErrorKind::BadFees => "bad-txns-fees",
        RuleErrorKind::TooManySigOps => "high-sigops",
        RuleErrorKind::FirstTxNotCoinbase => "bad-txns-nocoinbase",
        RuleErrorKind::MultipleCoinbases => "bad-txns-multicoinbase",
        RuleErrorKind::BadCoinbaseScriptLen => "bad-cb-length",
        RuleErrorKind::BadCoinbaseValue => "bad-cb-value",
        RuleErrorKind::MissingCoinbaseHeight | RuleErrorKind::BadCoinbaseHeight => "bad-cb-height",
        RuleErrorKind::ScriptMalformed => "bad-script-malformed",
        RuleErrorKind::ScriptValidation => "bad-script-validate",
        RuleErrorKind::UnexpectedWitness => "unexpected-witness",
        RuleErrorKind::InvalidWitnessCommitment => "bad-witness-nonce-size",
        RuleErrorKind::WitnessCommitmentMismatch => "bad-witness-merkle-match",
        RuleErrorKind::PreviousBlockUnknown => "prev-blk-not-found",
        RuleErrorKind::InvalidAncestorBlock => "bad-prevblk",
        RuleErrorKind::PrevBlockNotBest => "inconclusive-not-best-prvblk",
        RuleErrorKind::Policy => return format!("rejected: {}", err),
    };
    reason.to_string()
}
