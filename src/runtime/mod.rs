//! Worker pool and periodic tickers.
//!
//! Decode-heavy work runs on a fixed pool of threads fed by a bounded job
//! channel; submission never blocks, a full queue drops the job. Tickers
//! drive the mixer tick and the garbage-collection sweeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, warn};

/// A unit of work for the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default bound on queued jobs.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Fixed-size worker pool over a bounded MPMC queue.
///
/// Each worker runs one job to completion before taking the next.
/// Dropping the pool closes the queue, lets the workers drain what is
/// already queued and joins them.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (0 = one per online CPU) behind a queue of
    /// `queue_capacity` jobs.
    pub fn new(threads: usize, queue_capacity: usize) -> std::io::Result<Self> {
        let threads = if threads == 0 {
            num_cpus::get().max(1)
        } else {
            threads
        };
        let capacity = queue_capacity.max(1);

        let (tx, rx) = bounded::<Job>(capacity);

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    // Recv fails once all senders are gone and the queue is drained
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Hand a job to the pool without blocking. A full queue rejects the
    /// job; the caller decides whether that loss matters.
    pub fn submit(&self, job: Job) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("worker queue full, dropping job");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends the workers after the queue drains
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Periodic callback on a dedicated thread.
///
/// The callback runs every `interval`, measured against a fixed schedule
/// so one slow invocation does not shift subsequent ticks. Dropping the
/// ticker stops the thread and joins it.
pub struct Ticker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let thread = thread::Builder::new()
            .name(format!("tick-{name}"))
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while thread_running.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now < next {
                        // Short sleeps keep shutdown latency bounded
                        thread::sleep((next - now).min(Duration::from_millis(50)));
                        continue;
                    }

                    tick();

                    next += interval;
                    if next < Instant::now() {
                        // Fell behind; restart the schedule instead of bursting
                        debug!("ticker missed its schedule, resetting");
                        next = Instant::now() + interval;
                    }
                }
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Stop the ticker and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
