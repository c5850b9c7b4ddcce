//! Mining worker run as a child of the kopach coordinator. Commands arrive
//! on stdin, acknowledgements go out on stdout and solutions are broadcast
//! straight to the controller.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use super::container::{JobContainer, Packet, SolContainer};
use super::stdconn::{read_frame, write_frame, WorkerRequest};
use super::transport::BroadcastChannel;
use crate::chain::hash_meets_target;
use crate::error::KopachError;

/// Nonces tried between checks for a replaced job.
const HASH_BATCH: u32 = 1 << 14;
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct MiningState {
    generation: AtomicU64,
    job: Mutex<Option<JobContainer>>,
    stopped: AtomicBool,
    hashes: AtomicU64,
}

impl MiningState {
    fn set_job(&self, job: Option<JobContainer>) {
        *self.job.lock() = job;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> (u64, Option<JobContainer>) {
        let job = self.job.lock();
        (self.generation.load(Ordering::SeqCst), job.clone())
    }

    /// Drops the job only if nothing replaced it in the meantime.
    fn finish(&self, generation: u64) {
        let mut job = self.job.lock();
        if self.generation.load(Ordering::SeqCst) == generation {
            *job = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Searches nonces for `job` until it is solved or replaced.
fn mine(state: &MiningState, generation: u64, job: &JobContainer) -> Option<SolContainer> {
    let mut header = job.header(rand::random());
    let first_nonce = header.nonce;
    loop {
        for _ in 0..HASH_BATCH {
            if hash_meets_target(&header.block_hash(), header.bits) {
                state.hashes.fetch_add(1, Ordering::Relaxed);
                return Some(SolContainer {
                    ips: job.ips.clone(),
                    port: job.port,
                    header,
                });
            }
            header.nonce = header.nonce.wrapping_add(1);
            if header.nonce == first_nonce {
                // nonce space exhausted; roll the time forward
                header.timestamp += 1;
            }
        }
        state.hashes.fetch_add(HASH_BATCH as u64, Ordering::Relaxed);
        if state.stopped.load(Ordering::Relaxed)
            || state.generation.load(Ordering::SeqCst) != generation
        {
            return None;
        }
    }
}

fn miner_loop(state: Arc<MiningState>, solutions: mpsc::Sender<SolContainer>) {
    while !state.stopped.load(Ordering::Relaxed) {
        let (generation, job) = state.snapshot();
        let Some(job) = job else {
            std::thread::sleep(IDLE_POLL);
            continue;
        };
        if let Some(sol) = mine(&state, generation, &job) {
            state.finish(generation);
            if solutions.blocking_send(sol).is_err() {
                return;
            }
        }
    }
}

async fn forward_solutions(
    mut solutions: mpsc::Receiver<SolContainer>,
    channel: watch::Receiver<Option<Arc<BroadcastChannel>>>,
) {
    while let Some(sol) = solutions.recv().await {
        let current = channel.borrow().clone();
        let Some(current) = current else {
            tracing::warn!("solution found before a pass was set; dropped");
            continue;
        };
        tracing::info!("solution found for block on {}", sol.header.prev_block);
        if let Err(e) = current.send(&Packet::Sol(sol)).await {
            tracing::error!("failed to broadcast solution: {}", e);
        }
    }
}

pub struct Worker {
    broadcast_port: u16,
    state: Arc<MiningState>,
}

impl Worker {
    pub fn new(broadcast_port: u16) -> Self {
        Self {
            broadcast_port,
            state: Arc::new(MiningState::default()),
        }
    }

    pub fn hashes(&self) -> u64 {
        self.state.hashes.load(Ordering::Relaxed)
    }

    /// Serves commands until `Stop` or until the coordinator closes the
    /// pipe.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), KopachError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (sol_tx, sol_rx) = mpsc::channel(4);
        let (channel_tx, channel_rx) = watch::channel(None);
        let forwarder = tokio::spawn(forward_solutions(sol_rx, channel_rx));
        let state = self.state.clone();
        let miner = std::thread::Builder::new()
            .name("kopach-miner".into())
            .spawn(move || miner_loop(state, sol_tx))?;

        let result = self.command_loop(&mut reader, &mut writer, &channel_tx).await;

        self.state.stopped.store(true, Ordering::SeqCst);
        self.state.set_job(None);
        match tokio::task::spawn_blocking(move || miner.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("miner thread panicked"),
            Err(e) => tracing::error!("joining miner thread: {}", e),
        }
        forwarder.abort();
        tracing::debug!("worker exiting after {} hashes", self.hashes());
        result
    }

    async fn command_loop<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        channel: &watch::Sender<Option<Arc<BroadcastChannel>>>,
    ) -> Result<(), KopachError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some(request) = read_frame::<_, WorkerRequest>(reader).await? {
            let ack = match request {
                WorkerRequest::SendPass(pass) => {
                    match BroadcastChannel::sender(self.broadcast_port, &pass) {
                        Ok(c) => {
                            channel.send_replace(Some(Arc::new(c)));
                            true
                        }
                        Err(e) => {
                            tracing::error!("cannot open broadcast channel: {}", e);
                            false
                        }
                    }
                }
                WorkerRequest::NewJob(job) => {
                    // nowhere to send a solution yet
                    if channel.borrow().is_none() {
                        false
                    } else {
                        tracing::debug!("new job at height {}", job.height);
                        self.state.set_job(Some(job));
                        true
                    }
                }
                WorkerRequest::Pause => {
                    self.state.set_job(None);
                    true
                }
                WorkerRequest::Stop => {
                    self.state.set_job(None);
                    write_frame(writer, &true).await?;
                    return Ok(());
                }
            };
            write_frame(writer, &ack).await?;
        }
        Ok(())
    }
}
