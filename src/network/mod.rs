pub mod addr;
pub mod ban_score;
pub mod bloom;
pub mod cf_checkpoint;
pub mod checkpoints;
pub mod message;
pub mod node_peer;
pub mod peer;
pub mod peer_handler;
pub mod peer_state;
pub mod rebroadcast;
pub mod server;

pub use node_peer::NodePeer;
pub use peer::Peer;
pub use peer_handler::{PeerMatch, RelayData};
pub use server::{Collaborators, MempoolListener, Node, NodeSettings};
