//! Benchmarks for block template generation and the kopach hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use podd::chain::memory::{MedianTimeSource, MemoryChain, MemoryMempool, MemoryTemplateGenerator};
use podd::chain::{hash_meets_target, Hash, TemplateGenerator, TimeSource};
use podd::kopach::container::{JobContainer, Packet};
use podd::kopach::transport::Sealer;
use podd::network_type::NetworkType;

fn bench_new_block_template(c: &mut Criterion) {
    let ts: Arc<dyn TimeSource> = Arc::new(MedianTimeSource::default());
    let chain = Arc::new(MemoryChain::new(NetworkType::Regtest, ts.clone()));
    let mempool = Arc::new(MemoryMempool::new(chain.clone()));
    let generator = MemoryTemplateGenerator::new(chain, mempool, ts);

    c.bench_function("new_block_template_empty_mempool", |b| {
        b.iter(|| generator.new_block_template(black_box(None)).unwrap())
    });
}

fn sample_job() -> JobContainer {
    JobContainer {
        ips: vec!["192.168.1.20".parse().unwrap()],
        port: 11047,
        height: 1000,
        version: 4,
        prev_block: Hash([0x11; 32]),
        merkle_root: Hash([0x22; 32]),
        bits: 0x1d00ffff,
        timestamp: 1_700_000_000,
    }
}

fn bench_header_hash(c: &mut Criterion) {
    let job = sample_job();
    let mut nonce = 0u32;
    c.bench_function("header_hash_and_target_check", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            let header = job.header(nonce);
            hash_meets_target(black_box(&header.block_hash()), header.bits)
        })
    });
}

fn bench_seal_open(c: &mut Criterion) {
    let sealer = Sealer::new("bench pass").unwrap();
    let packet = Packet::Job(sample_job());

    c.bench_function("seal_job_packet", |b| {
        b.iter(|| sealer.seal_packet(black_box(&packet)).unwrap())
    });

    let sealed = sealer.seal_packet(&packet).unwrap();
    c.bench_function("open_job_packet", |b| {
        b.iter(|| sealer.open_packet(black_box(&sealed)).unwrap())
    });
}

criterion_group!(benches, bench_new_block_template, bench_header_hash, bench_seal_open);
criterion_main!(benches);
