//! Multi-threaded load and read workloads

use anyhow::{Context, Result};
use hybridkv_storage::{Status, Store, sum_functions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one workload run
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub name: &'static str,
    pub operations: u64,
    pub found: u64,
    pub not_found: u64,
    pub pending: u64,
    pub elapsed_ms: u128,
    pub ops_per_sec: f64,
}

impl Report {
    fn finish(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis();
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ops_per_sec = self.operations as f64 / secs;
        }
        self
    }

    fn absorb(&mut self, other: &Self) {
        self.operations += other.operations;
        self.found += other.found;
        self.not_found += other.not_found;
        self.pending += other.pending;
    }

    fn count(&mut self, status: &Status<u64>) {
        match status {
            Status::Found(_) => self.found += 1,
            Status::NotFound => self.not_found += 1,
            Status::Pending(_) => self.pending += 1,
        }
    }
}

/// Upsert `key -> key` for every key in `0..keys`, split across `threads`
pub async fn populate(store: &Store<u64, u64>, keys: u64, threads: usize) -> Result<Report> {
    let threads = threads.max(1) as u64;
    let started = Instant::now();
    let mut handles = Vec::new();
    for t in 0..threads {
        let store = store.clone();
        handles.push(tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut session = store.new_session(sum_functions::<u64>())?;
            let mut written = 0;
            let mut key = t;
            while key < keys {
                session.upsert(&key, &key)?;
                written += 1;
                key += threads;
            }
            session.complete_pending(true)?;
            debug!("Loader {} wrote {} keys", t, written);
            Ok(written)
        }));
    }

    let mut report = Report {
        name: "populate",
        ..Default::default()
    };
    for handle in handles {
        report.operations += handle.await.context("loader thread panicked")??;
    }
    let report = report.finish(started.elapsed());
    info!(
        "Loaded {} keys in {} ms ({:.0} ops/s)",
        report.operations, report.elapsed_ms, report.ops_per_sec
    );
    Ok(report)
}

/// Parameters of the random read/increment mix
#[derive(Debug, Clone, Copy)]
pub struct Mix {
    pub keys: u64,
    pub operations: u64,
    pub threads: usize,
    /// Fraction of operations that are `+1` increments instead of reads
    pub rmw_ratio: f64,
    pub seed: u64,
}

/// Uniform random reads and increments over `0..keys`
pub async fn run_mix(store: &Store<u64, u64>, mix: Mix) -> Result<Report> {
    let threads = mix.threads.max(1) as u64;
    let per_thread = mix.operations / threads;
    let started = Instant::now();
    let mut handles = Vec::new();
    for t in 0..threads {
        let store = store.clone();
        handles.push(tokio::task::spawn_blocking(move || -> Result<Report> {
            let mut rng = StdRng::seed_from_u64(mix.seed.wrapping_add(t));
            let mut session = store.new_session(sum_functions::<u64>())?;
            let mut report = Report::default();
            for i in 0..per_thread {
                let key = rng.gen_range(0..mix.keys.max(1));
                let status = if rng.gen_bool(mix.rmw_ratio) {
                    session.rmw(&key, 1)?
                } else {
                    session.read(&key)?
                };
                report.count(&status);
                report.operations += 1;
                if i % 1024 == 1023 {
                    session.complete_pending(false)?;
                }
            }
            for op in session.complete_pending(true)? {
                op.result?;
            }
            Ok(report)
        }));
    }

    let mut report = Report {
        name: "mix",
        ..Default::default()
    };
    for handle in handles {
        let part = handle.await.context("worker thread panicked")??;
        report.absorb(&part);
    }
    let report = report.finish(started.elapsed());
    info!(
        "Ran {} operations in {} ms ({:.0} ops/s, {} pending)",
        report.operations, report.elapsed_ms, report.ops_per_sec, report.pending
    );
    Ok(report)
}
