//! LAN mining. The node runs a [`Controller`] that broadcasts block
//! templates over sealed UDP; the `kopach` command runs a [`Coordinator`]
//! that feeds them to worker processes and relays their solutions back.

pub mod client;
pub mod container;
pub mod controller;
pub mod coordinator;
pub mod stdconn;
pub mod transport;
pub mod worker;

pub use container::{JobContainer, Packet, PauseContainer, SolContainer};
pub use controller::{Controller, HashrateMeter};
pub use coordinator::{Coordinator, CoordinatorSettings, Election};
pub use worker::Worker;
