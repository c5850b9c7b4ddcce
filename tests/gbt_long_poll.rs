mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{test_node, test_node_with_clock, test_settings, ManualClock, TestNode};
use podd::chain::memory::solve_block;
use podd::chain::{
    Chain, Hash, OutPoint, SyncManager, TemplateGenerator, Tx, TxIn, TxMemPool, TxOut,
};
use podd::rpc::{GbtWorkState, HandlerError};

fn mine_one(t: &TestNode) -> podd::chain::Hash {
    let generator = podd::chain::memory::MemoryTemplateGenerator::new(
        t.chain.clone(),
        t.mempool.clone(),
        t.time_source.clone(),
    );
    let mut template = generator.new_block_template(None).unwrap();
    assert!(solve_block(&mut template.block));
    let hash = template.block.block_hash();
    t.sync.submit_block(template.block).unwrap();
    hash
}

#[tokio::test]
async fn test_long_poll_released_by_new_block() {
    let t = test_node(test_settings());
    let gbt = Arc::new(GbtWorkState::new(t.time_source.clone()));

    let first = gbt.current_template(&t.node, true).unwrap();
    assert_eq!(first.height, 1);
    assert!(first.coinbase_value.is_some());

    let close = CancellationToken::new();
    let waiter = {
        let gbt = gbt.clone();
        let node = t.node.clone();
        let id = first.long_poll_id.clone();
        let close = close.clone();
        tokio::spawn(async move { gbt.long_poll(&node, &id, true, &close).await })
    };

    // the poller must be parked before the block lands
    for _ in 0..100 {
        if gbt.lock().pending_long_polls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gbt.lock().pending_long_polls(), 1);

    let hash = mine_one(&t);
    assert_eq!(t.chain.best_snapshot().hash, hash);
    gbt.notify_block_connected(&hash);

    let reply = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.height, 2);
    assert_eq!(reply.previous_hash, hash.to_string());
    assert_eq!(reply.submit_old, Some(false));
    assert_eq!(gbt.lock().pending_long_polls(), 0);
}

#[tokio::test]
async fn test_stale_long_poll_id_answers_immediately() {
    let t = test_node(test_settings());
    let gbt = GbtWorkState::new(t.time_source.clone());

    let first = gbt.current_template(&t.node, true).unwrap();
    mine_one(&t);

    let close = CancellationToken::new();
    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        gbt.long_poll(&t.node, &first.long_poll_id, true, &close),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.height, 2);
    assert_eq!(reply.submit_old, Some(false));
}

#[tokio::test]
async fn test_garbage_long_poll_id_gets_current_template() {
    let t = test_node(test_settings());
    let gbt = GbtWorkState::new(t.time_source.clone());

    let close = CancellationToken::new();
    let reply = gbt
        .long_poll(&t.node, "not-a-template-id", true, &close)
        .await
        .unwrap();
    assert_eq!(reply.height, 1);
    assert_eq!(reply.submit_old, None);
}

#[tokio::test]
async fn test_client_hangup_ends_long_poll() {
    let t = test_node(test_settings());
    let gbt = Arc::new(GbtWorkState::new(t.time_source.clone()));
    let first = gbt.current_template(&t.node, true).unwrap();

    let close = CancellationToken::new();
    let waiter = {
        let gbt = gbt.clone();
        let node = t.node.clone();
        let close = close.clone();
        tokio::spawn(async move { gbt.long_poll(&node, &first.long_poll_id, true, &close).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    close.cancel();

    let res = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(HandlerError::ClientQuit)));
}

fn spend_tx() -> Tx {
    Tx {
        version: 1,
        tx_in: vec![TxIn {
            previous_out_point: OutPoint {
                hash: Hash([7u8; 32]),
                index: 0,
            },
            signature_script: vec![],
            sequence: u32::MAX,
        }],
        tx_out: vec![TxOut {
            value: 5_000,
            pk_script: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[tokio::test]
async fn test_long_poll_released_by_mempool_after_regenerate_interval() {
    let clock = ManualClock::new();
    let t = test_node_with_clock(test_settings(), clock.clone());
    let gbt = Arc::new(GbtWorkState::new(t.time_source.clone()));
    t.node.set_mempool_listener(gbt.clone());

    let first = gbt.current_template(&t.node, true).unwrap();
    let close = CancellationToken::new();
    let waiter = {
        let gbt = gbt.clone();
        let node = t.node.clone();
        let id = first.long_poll_id.clone();
        let close = close.clone();
        tokio::spawn(async move { gbt.long_poll(&node, &id, true, &close).await })
    };
    for _ in 0..100 {
        if gbt.lock().pending_long_polls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gbt.lock().pending_long_polls(), 1);

    // Inside the regenerate interval a mempool change leaves the poller parked.
    clock.advance(30);
    let accepted = t.mempool.process_transaction(spend_tx(), false, false).unwrap();
    t.node.announce_new_transactions(&accepted).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gbt.lock().pending_long_polls(), 1);
    assert!(!waiter.is_finished());

    clock.advance(31);
    let mut second = spend_tx();
    second.lock_time = 1;
    let accepted = t.mempool.process_transaction(second, false, false).unwrap();
    t.node.announce_new_transactions(&accepted).await;

    let reply = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.height, 1);
    assert_eq!(reply.previous_hash, first.previous_hash);
    assert_eq!(reply.submit_old, Some(true));
    assert_ne!(reply.long_poll_id, first.long_poll_id);
    assert_eq!(gbt.lock().pending_long_polls(), 0);
}
