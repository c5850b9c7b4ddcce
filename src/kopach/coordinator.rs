//! The `kopach` miner: spawns worker processes and feeds them jobs from
//! whichever controller spoke first.

use futures_util::future::join_all;
use std::fmt::Display;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::client::WorkerClient;
use super::container::{JobContainer, Packet};
use super::transport::BroadcastChannel;
use crate::error::KopachError;
use crate::network_type::NetworkType;

/// A controller silent for this long loses the miners.
pub const SENDER_TIMEOUT: Duration = Duration::from_secs(3);
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest a single job or pause hand-off may take before the worker is
/// skipped for this round.
const WORKER_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Awaits one call per worker, abandoning any that outlast `limit`.
/// Returns how many failed or timed out.
async fn call_workers<I, F, E>(calls: I, limit: Duration, what: &str) -> usize
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    let results = join_all(calls.into_iter().map(|call| tokio::time::timeout(limit, call))).await;
    let mut failed = 0;
    for (i, res) in results.into_iter().enumerate() {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("worker {}: {}", i, e);
                failed += 1;
            }
            Err(_) => {
                tracing::warn!("worker {} did not take {} within {:?}", i, what, limit);
                failed += 1;
            }
        }
    }
    failed
}

/// Tracks which controller the miners currently work for. The first
/// controller heard wins and keeps the miners until it goes quiet, pauses
/// or a solution is found.
#[derive(Debug)]
pub struct Election {
    first_sender: Option<String>,
    last_sent: Instant,
}

impl Election {
    pub fn new(now: Instant) -> Self {
        Self {
            first_sender: None,
            last_sent: now,
        }
    }

    pub fn first_sender(&self) -> Option<&str> {
        self.first_sender.as_deref()
    }

    /// Whether a job from `addr` should go to the workers.
    pub fn on_job(&mut self, addr: &str, now: Instant) -> bool {
        match self.first_sender.as_deref() {
            Some(current) if current != addr => {
                tracing::trace!("ignoring job from other controller {}", addr);
                return false;
            }
            Some(_) => {}
            None => tracing::warn!("new sender {}", addr),
        }
        self.first_sender = Some(addr.to_string());
        self.last_sent = now;
        true
    }

    /// Pauses only count from the controller we work for.
    pub fn on_pause(&self, addr: &str) -> bool {
        self.first_sender.as_deref() == Some(addr)
    }

    /// A solution ends the round; the next job from anyone is accepted.
    pub fn on_solution(&mut self) {
        self.first_sender = None;
    }

    /// Returns true when the sender went quiet and the workers should
    /// pause.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        if self.first_sender.is_some() && now.saturating_duration_since(self.last_sent) > SENDER_TIMEOUT
        {
            self.first_sender = None;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub network: NetworkType,
    pub log_level: String,
    pub gen_threads: usize,
    pub pass: String,
    pub broadcast_port: u16,
}

pub struct Coordinator {
    channel: BroadcastChannel,
    election: parking_lot::Mutex<Election>,
    workers: Vec<WorkerClient>,
    children: tokio::sync::Mutex<Vec<Child>>,
    active: AtomicBool,
}

impl Coordinator {
    /// Starts `gen_threads` worker processes from our own executable and
    /// hands each the pass-phrase.
    pub async fn spawn(settings: &CoordinatorSettings) -> Result<Self, KopachError> {
        let channel = BroadcastChannel::bind(settings.broadcast_port, &settings.pass)?;
        let exe = std::env::current_exe()?;

        let mut children = Vec::with_capacity(settings.gen_threads);
        let mut workers = Vec::with_capacity(settings.gen_threads);
        for i in 0..settings.gen_threads {
            let mut child = Command::new(&exe)
                .arg("worker")
                .arg(settings.network.name())
                .arg(&settings.log_level)
                .arg("--port")
                .arg(settings.broadcast_port.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()?;
            tracing::debug!("started worker {} (pid {:?})", i, child.id());
            workers.push(WorkerClient::from_child(&mut child)?);
            children.push(child);
        }

        for worker in &workers {
            worker.send_pass(&settings.pass).await?;
        }

        tracing::info!("⛏️  kopach started with {} workers", workers.len());
        Ok(Self {
            channel,
            election: parking_lot::Mutex::new(Election::new(Instant::now())),
            workers,
            children: tokio::sync::Mutex::new(children),
            active: AtomicBool::new(true),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = watchdog.tick() => {
                    let silent = self.election.lock().on_tick(Instant::now());
                    if silent {
                        tracing::info!("controller went quiet, pausing workers");
                        self.pause_workers().await;
                    }
                }
                res = self.channel.recv() => match res {
                    Ok((packet, _)) => self.handle(packet).await,
                    Err(e) => {
                        tracing::warn!("kopach receive failed: {}", e);
                        tokio::time::sleep(WATCHDOG_INTERVAL).await;
                    }
                },
            }
        }
        self.stop().await;
    }

    async fn handle(&self, packet: Packet) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        match packet {
            Packet::Job(job) => {
                let Some(addr) = job.controller_addr() else {
                    return;
                };
                let accepted = self.election.lock().on_job(&addr, Instant::now());
                if accepted {
                    self.send_job(&job).await;
                }
            }
            Packet::Pause(pause) => {
                let Some(addr) = pause.controller_addr() else {
                    return;
                };
                let ours = self.election.lock().on_pause(&addr);
                if ours {
                    self.pause_workers().await;
                }
            }
            Packet::Sol(_) => self.election.lock().on_solution(),
        }
    }

    async fn send_job(&self, job: &JobContainer) {
        let calls = self.workers.iter().map(|w| w.new_job(job));
        call_workers(calls, WORKER_CALL_TIMEOUT, "the job").await;
    }

    async fn pause_workers(&self) {
        let calls = self.workers.iter().map(|w| w.pause());
        call_workers(calls, WORKER_CALL_TIMEOUT, "the pause").await;
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let stopping = join_all(self.workers.iter().map(|w| w.stop()));
        if tokio::time::timeout(WORKER_STOP_TIMEOUT, stopping).await.is_err() {
            tracing::warn!("workers did not acknowledge stop");
        }
        for child in self.children.lock().await.iter_mut() {
            if let Err(e) = child.kill().await {
                tracing::debug!("kill worker: {}", e);
            }
        }
        tracing::info!("kopach stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "10.0.0.1:11047";
    const B: &str = "10.0.0.2:11047";

    #[test]
    fn test_first_sender_wins() {
        let t0 = Instant::now();
        let mut election = Election::new(t0);
        assert!(election.on_job(A, t0));
        assert!(!election.on_job(B, t0 + Duration::from_millis(500)));
        assert!(election.on_job(A, t0 + Duration::from_secs(1)));
        assert_eq!(election.first_sender(), Some(A));
    }

    #[test]
    fn test_pause_only_from_current_sender() {
        let t0 = Instant::now();
        let mut election = Election::new(t0);
        assert!(!election.on_pause(A));
        election.on_job(A, t0);
        assert!(!election.on_pause(B));
        assert!(election.on_pause(A));
    }

    #[test]
    fn test_silence_hands_over_to_next_sender() {
        let t0 = Instant::now();
        let mut election = Election::new(t0);
        election.on_job(A, t0);

        assert!(!election.on_tick(t0 + Duration::from_secs(2)));
        assert!(!election.on_job(B, t0 + Duration::from_secs(2)));
        assert!(!election.on_tick(t0 + SENDER_TIMEOUT));
        assert!(election.on_tick(t0 + Duration::from_secs(4)));
        assert!(election.first_sender().is_none());
        // nothing left to time out
        assert!(!election.on_tick(t0 + Duration::from_secs(10)));

        assert!(election.on_job(B, t0 + Duration::from_secs(5)));
        assert_eq!(election.first_sender(), Some(B));
    }

    #[tokio::test]
    async fn test_hung_worker_does_not_block_the_rest() {
        let answered = Arc::new(AtomicBool::new(false));
        let calls: Vec<futures_util::future::BoxFuture<'static, Result<(), KopachError>>> = vec![
            Box::pin(std::future::pending()),
            Box::pin({
                let answered = answered.clone();
                async move {
                    answered.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
            Box::pin(async { Err(KopachError::PauseNotAcknowledged) }),
        ];

        let started = Instant::now();
        let failed = call_workers(calls, Duration::from_millis(50), "the job").await;
        assert_eq!(failed, 2);
        assert!(answered.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_solution_reopens_election() {
        let t0 = Instant::now();
        let mut election = Election::new(t0);
        election.on_job(A, t0);
        election.on_solution();
        assert!(election.on_job(B, t0));
    }
}
