//! Fixed-size worker pool draining a bounded FIFO task queue.
//!
//! The dispatch thread submits tasks; it never blocks on a full queue but
//! gets `PoolError::QueueFull` back instead. Each submitted task adds one
//! permit to the `pending` semaphore, and each shutdown adds one permit per
//! worker, so every worker wakes exactly as often as it has something to do.

use crate::runtime::sync::Semaphore;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};

/// Largest accepted pool size.
pub const MAX_THREADS: usize = 1024;
/// Largest accepted queue capacity.
pub const MAX_QUEUE: usize = 65535;

/// A unit of work executed by exactly one worker.
pub trait Job: Send + 'static {
    fn execute(self);
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("task queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("invalid pool size: {threads} threads, {capacity} queue slots")]
    InvalidSize { threads: usize, capacity: usize },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// How `shutdown` treats tasks still in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Workers finish every queued task before exiting.
    Graceful,
    /// Workers exit after their current task; queued tasks are dropped.
    Immediate,
}

struct Queue<T> {
    tasks: VecDeque<T>,
    shutdown: Option<ShutdownMode>,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    pending: Semaphore,
    capacity: usize,
}

impl<T> Shared<T> {
    // Tasks run outside the lock, so a poisoned queue is still consistent.
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of worker threads sharing one bounded queue.
pub struct WorkerPool<T: Job> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Job> WorkerPool<T> {
    /// Spawn `threads` workers over a queue holding at most `capacity` tasks.
    pub fn new(threads: usize, capacity: usize) -> Result<Self, PoolError> {
        if threads == 0 || threads > MAX_THREADS || capacity == 0 || capacity > MAX_QUEUE {
            return Err(PoolError::InvalidSize { threads, capacity });
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::with_capacity(capacity),
                shutdown: None,
            }),
            pending: Semaphore::new(0),
            capacity,
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };

        for worker_id in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &shared))?;
            pool.workers.push(handle);
        }

        info!(threads, capacity, "Worker pool started");
        Ok(pool)
    }

    /// Enqueue a task, failing immediately if the queue is at capacity.
    pub fn submit(&self, task: T) -> Result<(), PoolError> {
        {
            let mut queue = self.shared.lock();
            if queue.shutdown.is_some() {
                return Err(PoolError::ShutDown);
            }
            if queue.tasks.len() >= self.shared.capacity {
                return Err(PoolError::QueueFull {
                    capacity: self.shared.capacity,
                });
            }
            queue.tasks.push_back(task);
        }
        self.shared.pending.release();
        Ok(())
    }

    /// Tasks waiting in the queue.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting tasks, wake every worker and join them all.
    pub fn shutdown(&mut self, mode: ShutdownMode) -> Result<(), PoolError> {
        {
            let mut queue = self.shared.lock();
            if queue.shutdown.is_some() {
                return Err(PoolError::ShutDown);
            }
            queue.shutdown = Some(mode);
        }
        self.shared.pending.release_many(self.workers.len());

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked outside a task");
            }
        }

        let dropped = {
            let mut queue = self.shared.lock();
            let dropped = queue.tasks.len();
            queue.tasks = VecDeque::new();
            dropped
        };
        info!(?mode, dropped, "Worker pool shut down");
        Ok(())
    }
}

impl<T: Job> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.shutdown(ShutdownMode::Immediate);
        }
    }
}

fn worker_loop<T: Job>(worker_id: usize, shared: &Shared<T>) {
    debug!(worker = worker_id, "Worker started");

    loop {
        shared.pending.acquire();

        let task = {
            let mut queue = shared.lock();
            match queue.shutdown {
                Some(ShutdownMode::Immediate) => break,
                Some(ShutdownMode::Graceful) if queue.tasks.is_empty() => break,
                _ => {}
            }
            match queue.tasks.pop_front() {
                Some(task) => task,
                None => continue,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.execute())).is_err() {
            error!(worker = worker_id, "Task panicked");
        }
    }

    debug!(worker = worker_id, "Worker exiting");
}
