use std::time::Duration;

use podd::chain::Hash;
use podd::error::KopachError;
use podd::kopach::client::WorkerClient;
use podd::kopach::{JobContainer, Worker};

fn job(height: i32) -> JobContainer {
    JobContainer {
        ips: vec!["127.0.0.1".parse().unwrap()],
        port: 18444,
        height,
        version: 4,
        prev_block: Hash([3; 32]),
        merkle_root: Hash([4; 32]),
        // unreachable, keeps the miner busy
        bits: 0x03000001,
        timestamp: 1_700_000_000,
    }
}

#[tokio::test]
async fn test_worker_command_lifecycle() {
    let (client_w, worker_r) = tokio::io::duplex(4096);
    let (worker_w, client_r) = tokio::io::duplex(4096);
    let worker = Worker::new(0);
    let serving = tokio::spawn(async move { worker.serve(worker_r, worker_w).await });
    let client = WorkerClient::new(client_w, client_r);

    // no pass yet, so nowhere to send solutions
    assert!(matches!(
        client.new_job(&job(1)).await,
        Err(KopachError::NewJobNotAcknowledged)
    ));

    client.send_pass("hunter2").await.unwrap();
    client.new_job(&job(1)).await.unwrap();
    client.new_job(&job(2)).await.unwrap();
    client.pause().await.unwrap();
    client.stop().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_worker_exits_when_coordinator_goes_away() {
    let (client_w, worker_r) = tokio::io::duplex(4096);
    let (worker_w, client_r) = tokio::io::duplex(4096);
    let worker = Worker::new(0);
    let serving = tokio::spawn(async move { worker.serve(worker_r, worker_w).await });

    let client = WorkerClient::new(client_w, client_r);
    client.send_pass("hunter2").await.unwrap();
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn test_stopping_busy_worker_leaves_runtime_free() {
    let (client_w, worker_r) = tokio::io::duplex(4096);
    let (worker_w, client_r) = tokio::io::duplex(4096);
    let worker = Worker::new(0);
    let serving = tokio::spawn(async move { worker.serve(worker_r, worker_w).await });

    let client = WorkerClient::new(client_w, client_r);
    client.send_pass("hunter2").await.unwrap();
    client.new_job(&job(1)).await.unwrap();

    // Ticks on the same single thread while the worker joins its miner.
    let ticker = tokio::spawn(async {
        let mut ticks = 0u32;
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        loop {
            interval.tick().await;
            ticks += 1;
            if ticks == 3 {
                return ticks;
            }
        }
    });

    client.stop().await.unwrap();
    let (served, ticked) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(5), serving),
        tokio::time::timeout(Duration::from_secs(5), ticker),
    );
    served.unwrap().unwrap().unwrap();
    assert_eq!(ticked.unwrap().unwrap(), 3);
}
