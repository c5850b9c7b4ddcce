pub mod error;
pub mod gbt;
pub mod handler;
pub mod help;
pub mod server;
pub mod tls;
pub mod types;
pub mod websocket;

pub use error::{HandlerError, RpcError};
pub use gbt::GbtWorkState;
pub use handler::{RpcHandler, RPC_HANDLERS};
pub use server::RpcServer;
