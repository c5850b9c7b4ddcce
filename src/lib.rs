// Library half of podd: everything the binary wires together, exposed so
// the integration tests and benches can drive it.

pub mod address;
pub mod chain;
pub mod config;
pub mod error;
pub mod kopach;
pub mod network;
pub mod network_type;
pub mod rpc;
pub mod shutdown;
