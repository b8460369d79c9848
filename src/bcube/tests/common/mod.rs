#![allow(dead_code)]

use std::thread;

use bcube::config::Config;
use bcube::topology::AddressPlan;
use bcube::transport::BindMode;

pub const GRAD_LEN: usize = 300;

/// Deterministic per-rank contribution.
pub fn input(rank: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (rank.wrapping_mul(31).wrapping_add(i * 7) % 256) as u8)
        .collect()
}

pub fn expected_sum(node_count: usize, len: usize) -> Vec<u8> {
    let mut sum = vec![0u8; len];
    for rank in 0..node_count {
        for (dst, src) in sum.iter_mut().zip(input(rank, len)) {
            *dst = dst.wrapping_add(src);
        }
    }
    sum
}

/// Config for `node_count` ranks sharing one host: every per-level address
/// lives in 127/8 and each rank listens on its own addresses only.
pub fn local_config(group_size: usize, level_count: usize, port: u16) -> Config {
    let mut config = Config::default();
    config.topology.group_size = group_size;
    config.topology.level_count = level_count;
    config.topology.addresses = AddressPlan {
        prefix: [127, 0],
        level_base: 10,
        host_base: 11,
    };
    config.listen_port = port;
    config.tcp.bind = BindMode::PerLevel;
    config.tcp.connect_retry_interval_ms = 20;
    config.tcp.establish_timeout_ms = 30_000;
    config.fabric.bind = BindMode::PerLevel;
    config.fabric.buffer_size = 1 << 16;
    config.fabric.reject_backoff_ms = 20;
    config.fabric.poll_timeout_ms = 50;
    config.fabric.ready_timeout_ms = 10_000;
    config.fabric.establish_timeout_ms = 30_000;
    config.collective.step_timeout_ms = 10_000;
    config.collective.recv_timeout_ms = 30_000;
    config
}

/// Runs `f` once per rank on its own thread and returns the results by rank.
pub fn run_ranks<F, R>(node_count: usize, f: F) -> Vec<R>
where
    F: Fn(usize) -> R + Sync,
    R: Send,
{
    thread::scope(|s| {
        let handles: Vec<_> = (0..node_count)
            .map(|rank| {
                let f = &f;
                s.spawn(move || f(rank))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
