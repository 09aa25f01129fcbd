//! Background I/O worker pool
//!
//! Page flushes and disk reads are handed to a fixed set of worker threads
//! over a crossbeam channel. Completions are delivered by the job itself
//! (flush bookkeeping, session completion channels).

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// I/O pool statistics
#[derive(Debug, Default)]
pub struct IoStats {
    /// Jobs submitted
    pub submitted: AtomicU64,
    /// Jobs finished
    pub completed: AtomicU64,
}

/// Fixed-size pool of I/O worker threads
pub struct IoPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<IoStats>,
}

impl IoPool {
    /// Start `threads` workers
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let stats = Arc::new(IoStats::default());

        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver: Receiver<Job> = receiver.clone();
                let stats = Arc::clone(&stats);
                thread::Builder::new()
                    .name(format!("hybridkv-io-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                            stats.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        debug!("I/O worker {} stopped", i);
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to spawn I/O worker: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Started {} I/O workers", workers.len());

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stats,
        }
    }

    /// Queue a job; runs inline if the pool has been shut down
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let job: Job = Box::new(job);
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        if let Some(job) = rejected {
            job();
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Jobs submitted but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.stats
            .submitted
            .load(Ordering::Relaxed)
            .saturating_sub(self.stats.completed.load(Ordering::Relaxed))
    }

    /// Get statistics
    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Drain the queue and join all workers
    pub fn shutdown(&self) {
        // Dropping the sender lets workers exit once the queue is empty
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // A job may drop the last store handle from inside a worker
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
