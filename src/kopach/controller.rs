//! Node side of kopach: hands block templates to the miners on the LAN and
//! submits whatever they solve.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::container::{JobContainer, Packet, PauseContainer, SolContainer};
use super::transport::BroadcastChannel;
use crate::chain::{block_work, hash_meets_target, BlockTemplate, ChainError, Hash};
use crate::error::KopachError;
use crate::network::Node;

pub const JOB_INTERVAL: Duration = Duration::from_secs(1);
/// Templates are rebuilt at least this often even when nothing changed.
const TEMPLATE_MAX_AGE: Duration = Duration::from_secs(60);
/// Recent templates kept so late solutions can still be matched.
const TEMPLATE_CACHE_SIZE: usize = 8;
const HASHRATE_WINDOW: Duration = Duration::from_secs(600);

/// Estimates the miners' combined hash rate from the solutions they
/// return. A solution at difficulty `d` stands for about `d * 2^32`
/// hashes.
pub struct HashrateMeter {
    started: Instant,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl HashrateMeter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_solution(&self, bits: u32) {
        self.record_work_at(Instant::now(), block_work(bits));
    }

    pub fn record_work_at(&self, at: Instant, hashes: f64) {
        self.samples.lock().push_back((at, hashes));
    }

    pub fn hashes_per_sec(&self) -> u64 {
        self.hashes_per_sec_at(Instant::now())
    }

    pub fn hashes_per_sec_at(&self, now: Instant) -> u64 {
        let mut samples = self.samples.lock();
        while let Some((at, _)) = samples.front() {
            if now.saturating_duration_since(*at) > HASHRATE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
        let total: f64 = samples.iter().map(|(_, h)| h).sum();
        let span = now
            .saturating_duration_since(self.started)
            .min(HASHRATE_WINDOW)
            .as_secs_f64()
            .max(1.0);
        (total / span) as u64
    }
}

impl Default for HashrateMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses miners use to tell controllers apart. The unspecified
/// connect never sends anything; it only asks the OS for a route.
fn local_ips() -> Vec<IpAddr> {
    let routed = StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .and_then(|s| {
            s.connect(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80)))?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified());
    match routed {
        Some(ip) => vec![ip],
        None => vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
    }
}

struct CurrentWork {
    tip: Hash,
    mempool_updated: i64,
    built: Instant,
    job: JobContainer,
}

pub struct Controller {
    node: Arc<Node>,
    channel: BroadcastChannel,
    hashrate: Arc<HashrateMeter>,
    ips: Vec<IpAddr>,
    port: u16,
    current: Mutex<Option<CurrentWork>>,
    templates: Mutex<VecDeque<BlockTemplate>>,
}

impl Controller {
    /// `listen_port` identifies this controller to the miners; it is the
    /// node's P2P port.
    pub fn new(
        node: Arc<Node>,
        broadcast_port: u16,
        pass: &str,
        listen_port: u16,
        hashrate: Arc<HashrateMeter>,
    ) -> Result<Self, KopachError> {
        Ok(Self {
            node,
            channel: BroadcastChannel::bind(broadcast_port, pass)?,
            hashrate,
            ips: local_ips(),
            port: listen_port,
            current: Mutex::new(None),
            templates: Mutex::new(VecDeque::with_capacity(TEMPLATE_CACHE_SIZE)),
        })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("⛏️  kopach controller broadcasting as {}:{}", self.ips[0], self.port);
        let mut ticker = tokio::time::interval(JOB_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
                res = self.channel.recv() => match res {
                    Ok((Packet::Sol(sol), src)) => self.handle_solution(sol, src),
                    // our own job and pause broadcasts loop back
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("kopach controller receive failed: {}", e);
                        tokio::time::sleep(JOB_INTERVAL).await;
                    }
                },
            }
        }
        self.pause().await;
        tracing::info!("kopach controller stopped");
    }

    async fn ready(&self) -> bool {
        if !self.node.is_generating() {
            return false;
        }
        let connected =
            self.node.settings.network.is_test_harness() || self.node.connected_count().await > 0;
        connected && self.node.sync_manager.is_current()
    }

    async fn tick(&self) {
        if !self.ready().await {
            self.pause().await;
            return;
        }
        let job = match self.current_job() {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("failed to create block template: {}", e);
                return;
            }
        };
        if let Err(e) = self.channel.send(&Packet::Job(job)).await {
            tracing::debug!("job broadcast failed: {}", e);
        }
    }

    async fn pause(&self) {
        let pause = PauseContainer {
            ips: self.ips.clone(),
            port: self.port,
        };
        if let Err(e) = self.channel.send(&Packet::Pause(pause)).await {
            tracing::debug!("pause broadcast failed: {}", e);
        }
    }

    /// Job for the current tip, rebuilt when the tip or mempool moved or
    /// the template went stale.
    fn current_job(&self) -> Result<JobContainer, ChainError> {
        let tip = self.node.chain.best_snapshot().hash;
        let mempool_updated = self.node.mempool.last_updated();
        let mut current = self.current.lock();
        if let Some(work) = current.as_ref() {
            if work.tip == tip
                && work.mempool_updated == mempool_updated
                && work.built.elapsed() < TEMPLATE_MAX_AGE
            {
                return Ok(work.job.clone());
            }
        }

        let addrs = &self.node.settings.mining_addrs;
        let pay_to = if addrs.is_empty() {
            None
        } else {
            addrs.get(rand::random::<usize>() % addrs.len())
        };
        let template = self.node.template_generator.new_block_template(pay_to)?;
        let header = template.block.header;
        let job = JobContainer {
            ips: self.ips.clone(),
            port: self.port,
            height: template.height,
            version: header.version,
            prev_block: header.prev_block,
            merkle_root: header.merkle_root,
            bits: header.bits,
            timestamp: header.timestamp,
        };
        tracing::debug!("new job for height {} on {}", job.height, job.prev_block);

        let mut templates = self.templates.lock();
        if templates.len() == TEMPLATE_CACHE_SIZE {
            templates.pop_front();
        }
        templates.push_back(template);
        *current = Some(CurrentWork {
            tip,
            mempool_updated,
            built: Instant::now(),
            job: job.clone(),
        });
        Ok(job)
    }

    fn handle_solution(&self, sol: SolContainer, src: SocketAddr) {
        if sol.port != self.port || !sol.ips.iter().any(|ip| self.ips.contains(ip)) {
            tracing::trace!("solution from {} is for another controller", src);
            return;
        }
        let header = sol.header;
        let template = self
            .templates
            .lock()
            .iter()
            .rev()
            .find(|t| {
                t.block.header.merkle_root == header.merkle_root
                    && t.block.header.prev_block == header.prev_block
            })
            .cloned();
        let Some(template) = template else {
            tracing::debug!("solution from {} matches no recent template", src);
            return;
        };
        if !hash_meets_target(&header.block_hash(), header.bits) {
            tracing::warn!("solution from {} does not meet its target", src);
            return;
        }

        let mut block = template.block;
        block.header = header;
        let hash = block.block_hash();
        self.hashrate.record_solution(header.bits);
        match self.node.sync_manager.submit_block(block) {
            Ok(false) => tracing::info!("🎉 block {} at height {} accepted", hash, template.height),
            Ok(true) => tracing::info!("block {} accepted as an orphan", hash),
            Err(e) => tracing::warn!("block {} rejected: {}", hash, e),
        }
        // force a new template on the next tick
        self.current.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_averages_over_elapsed_time() {
        let meter = HashrateMeter::new();
        let start = meter.started;
        meter.record_work_at(start, 1000.0);
        meter.record_work_at(start + Duration::from_secs(5), 1000.0);
        assert_eq!(meter.hashes_per_sec_at(start + Duration::from_secs(10)), 200);
    }

    #[test]
    fn test_hashrate_forgets_old_solutions() {
        let meter = HashrateMeter::new();
        let start = meter.started;
        meter.record_work_at(start, 6000.0);
        let later = start + HASHRATE_WINDOW + Duration::from_secs(1);
        assert_eq!(meter.hashes_per_sec_at(later), 0);
        assert_eq!(meter.hashes_per_sec(), 0);
    }

    #[test]
    fn test_expected_hashes_at_minimum_difficulty() {
        assert!((block_work(0x1d00ffff) - 4_294_967_296.0).abs() < 1.0);
    }
}
