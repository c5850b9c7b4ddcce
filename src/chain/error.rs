use thiserror::Error;

/// Reason codes a validating chain attaches to a rejected block or
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleErrorKind {
    DuplicateBlock,
    BlockTooBig,
    BlockWeightTooHigh,
    BlockVersionTooOld,
    InvalidTime,
    TimeTooOld,
    TimeTooNew,
    DifficultyTooLow,
    UnexpectedDifficulty,
    HighHash,
    BadMerkleRoot,
    BadCheckpoint,
    ForkTooOld,
    CheckpointTimeTooOld,
    NoTransactions,
    NoTxInputs,
    NoTxOutputs,
    TxTooBig,
    BadTxOutValue,
    DuplicateTxInputs,
    BadTxInput,
    MissingTxOut,
    UnfinalizedTx,
    DuplicateTx,
    OverwriteTx,
    ImmatureSpend,
    SpendTooHigh,
    BadFees,
    TooManySigOps,
    FirstTxNotCoinbase,
    MultipleCoinbases,
    BadCoinbaseScriptLen,
    BadCoinbaseValue,
    MissingCoinbaseHeight,
    BadCoinbaseHeight,
    ScriptMalformed,
    ScriptValidation,
    UnexpectedWitness,
    InvalidWitnessCommitment,
    WitnessCommitmentMismatch,
    PreviousBlockUnknown,
    InvalidAncestorBlock,
    PrevBlockNotBest,
    /// Mempool policy rejection (dust, non-standard, low fee).
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct RuleError {
    pub kind: RuleErrorKind,
    pub description: String,
}

impl RuleError {
    pub fn new(kind: RuleErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

/// Failure reported by a chain collaborator. Rule violations are kept apart
/// from everything else so callers can report them as rejection data.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("{0}")]
    Other(String),
}

impl ChainError {
    pub fn other(msg: impl Into<String>) -> Self {
        ChainError::Other(msg.into())
    }

    pub fn as_rule(&self) -> Option<&RuleError> {
        match self {
            ChainError::Rule(r) => Some(r),
            ChainError::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    #[error("{what} count {count} exceeds maximum {max}")]
    TooMany {
        what: &'static str,
        count: u64,
        max: u64,
    },

    #[error("invalid hash string: {0}")]
    InvalidHash(String),
}
