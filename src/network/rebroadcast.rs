//! Periodic re-relay of transactions submitted over RPC until they are
//! mined.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::peer_handler::RelayData;
use super::server::Node;
use crate::chain::InvVect;

/// Delay before the first rebroadcast after startup.
pub const FIRST_REBROADCAST: Duration = Duration::from_secs(5 * 60);
/// Upper bound, in seconds, of the random delay between later rounds.
pub const MAX_REBROADCAST_SECS: u16 = 1800;

pub enum RebroadcastMsg {
    Add(InvVect, RelayData),
    Del(InvVect),
}

/// Uniform random number in `0..max`; zero when `max` is zero.
pub fn random_u16(max: u16) -> u16 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max)
}

pub async fn rebroadcast_handler(node: Arc<Node>, mut rx: mpsc::Receiver<RebroadcastMsg>) {
    let quit = node.quit_token();
    let timer = tokio::time::sleep(FIRST_REBROADCAST);
    tokio::pin!(timer);
    let mut pending: HashMap<InvVect, RelayData> = HashMap::new();

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => match msg {
                RebroadcastMsg::Add(iv, data) => {
                    pending.insert(iv, data);
                }
                RebroadcastMsg::Del(iv) => {
                    pending.remove(&iv);
                }
            },
            _ = &mut timer => {
                // Anything still pending has not made it into a block yet.
                for (iv, data) in &pending {
                    node.relay_inventory(*iv, data.clone()).await;
                }
                let next = Duration::from_secs(u64::from(random_u16(MAX_REBROADCAST_SECS)));
                timer.as_mut().reset(tokio::time::Instant::now() + next);
            }
            _ = quit.cancelled() => break,
        }
    }

    while rx.try_recv().is_ok() {}
    tracing::trace!("transaction rebroadcast handler done");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_u16_bounds() {
        assert_eq!(random_u16(0), 0);
        assert_eq!(random_u16(1), 0);
        for _ in 0..1000 {
            assert!(random_u16(MAX_REBROADCAST_SECS) < MAX_REBROADCAST_SECS);
        }
    }
}
