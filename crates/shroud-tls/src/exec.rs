//! Callback executors.
//!
//! The adapter never invokes user callbacks while holding its session lock,
//! and never resumes a suspended operation by re-entering the method that
//! suspended it. Both rules are enforced by routing resumption through an
//! [`Executor`].
//!
//! [`WorkerExecutor`] dispatches on a small pool of worker threads fed by a
//! bounded crossbeam channel (send blocks when the queue is full, which
//! back-pressures callback storms). [`DeferredExecutor`] queues jobs for
//! manual pumping, for tests and embedders that own their event loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::warn;

/// A job submitted for asynchronous execution.
pub type Job = Box<dyn FnOnce() + Send>;

/// Dispatches jobs off the caller's stack.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Worker-thread executor over a bounded channel.
pub struct WorkerExecutor {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerExecutor {
    /// Spawns `threads` workers sharing a queue of `queue_depth` jobs.
    pub fn new(threads: usize, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = bounded::<Job>(queue_depth.max(1));
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("shroud-exec-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn executor thread")
            })
            .collect();
        Arc::new(Self {
            tx: Some(tx),
            workers,
        })
    }
}

impl Executor for WorkerExecutor {
    fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                warn!("executor shut down; dropping job");
            }
        }
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Queueing executor pumped by the owner.
///
/// Jobs run only inside [`run_pending`](DeferredExecutor::run_pending),
/// making suspension and resumption fully deterministic.
#[derive(Default)]
pub struct DeferredExecutor {
    queue: Mutex<VecDeque<Job>>,
}

impl DeferredExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs queued jobs, including any they enqueue, until the queue is
    /// empty. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Jobs currently waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, job: Job) {
        self.queue.lock().push_back(job);
    }
}
