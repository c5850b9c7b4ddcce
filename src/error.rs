use thiserror::Error;

use crate::chain::ChainError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Kopach error: {0}")]
    Kopach(#[from] KopachError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// Errors surfaced by the node's query and control paths.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("max peers reached")]
    MaxPeers,

    #[error("peer already connected")]
    AlreadyConnected,

    #[error("peer exists as a permanent peer")]
    ExistsAsPermanent,

    #[error("peer not found")]
    PeerNotFound,

    #[error("{0}")]
    InvalidAddress(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum KopachError {
    #[error("new job command not acknowledged")]
    NewJobNotAcknowledged,

    #[error("pause command not acknowledged")]
    PauseNotAcknowledged,

    #[error("stop command not acknowledged")]
    StopNotAcknowledged,

    #[error("send pass command not acknowledged")]
    SendPassNotAcknowledged,

    #[error("unknown packet magic {0:?}")]
    UnknownMagic([u8; 4]),

    #[error("packet too short: {0} bytes")]
    ShortPacket(usize),

    #[error("message authentication failed")]
    Decrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("worker channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
