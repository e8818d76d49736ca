// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Bounded worker pool: a FIFO task queue drained by `min..max` OS
//! threads.
//!
//! The RPC receiver and the event consumer each own one (or more) of
//! these. The queue is bounded and submission never blocks: a full
//! queue rejects the task with [`PoolError::QueueFull`] and the caller
//! decides what that means (the receiver answers the client with
//! `IPC_RESOURCE_EXHAUSTED`, the consumer drops the event and counts
//! it).
//!
//! `min_threads` workers are spawned up front; the pool grows one
//! worker at a time, up to `max_threads`, whenever a task is queued
//! and nobody is idle. Workers above the minimum retire after sitting
//! idle for [`IDLE_TIMEOUT`].
//!
//! A panicking task is caught at the worker boundary; the worker
//! survives and moves on to the next task.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Idle time after which a worker above the minimum retires.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Task submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The bounded queue already holds `max_queue` tasks.
    QueueFull,
    /// The pool has been shut down.
    ShutDown,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "worker pool queue is full"),
            Self::ShutDown => write!(f, "worker pool is shut down"),
        }
    }
}

impl std::error::Error for PoolError {}

struct PoolState {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
    next_worker_id: usize,
}

struct PoolInner {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue: usize,
    state: Mutex<PoolState>,
    work_available: Condvar,
}

/// Bounded FIFO worker pool. Clone-free; share it behind an `Arc`.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool named `name` (thread names derive from it) with
    /// `min_threads..=max_threads` workers and a queue bounded at
    /// `max_queue`. Zero values are clamped to sane minimums.
    pub fn new(name: &str, min_threads: usize, max_threads: usize, max_queue: usize) -> Self {
        let min_threads = min_threads.max(1);
        let max_threads = max_threads.max(min_threads);
        let max_queue = max_queue.max(1);

        let inner = Arc::new(PoolInner {
            name: name.to_string(),
            min_threads,
            max_threads,
            max_queue,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                shutdown: false,
                handles: Vec::new(),
                next_worker_id: 0,
            }),
            work_available: Condvar::new(),
        });

        {
            let mut state = inner.state.lock();
            for _ in 0..min_threads {
                spawn_worker(&inner, &mut state);
            }
        }

        log::debug!(
            "[POOL] '{}' started: {}..{} threads, queue {}",
            name,
            min_threads,
            max_threads,
            max_queue
        );

        Self { inner }
    }

    /// Queue a task. Never blocks: a full queue or a shut-down pool
    /// rejects immediately.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }
        if state.queue.len() >= self.inner.max_queue {
            return Err(PoolError::QueueFull);
        }
        state.queue.push_back(Box::new(task));
        if state.idle == 0 && state.workers < self.inner.max_threads {
            spawn_worker(&self.inner, &mut state);
        }
        drop(state);
        self.inner.work_available.notify_one();
        Ok(())
    }

    /// Whether a submission right now would be rejected.
    pub fn is_full(&self) -> bool {
        let state = self.inner.state.lock();
        state.shutdown || state.queue.len() >= self.inner.max_queue
    }

    /// Tasks waiting in the queue (excludes tasks being run).
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Currently spawned worker threads.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers
    }

    /// Drain the queue and join every worker. Already-accepted tasks
    /// still run; new submissions are rejected. Idempotent.
    ///
    /// Must not be called from inside one of this pool's own tasks
    /// (the join would deadlock on the calling worker).
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.handles)
        };
        self.inner.work_available.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
        log::debug!("[POOL] '{}' shut down", self.inner.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn one worker; caller holds the state lock.
fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) {
    let worker_id = state.next_worker_id;
    state.next_worker_id += 1;
    state.workers += 1;

    let inner_cloned = Arc::clone(inner);
    let thread_name = format!("{}-w{}", inner.name, worker_id);
    let spawn_result = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker_loop(&inner_cloned));

    match spawn_result {
        Ok(handle) => state.handles.push(handle),
        Err(e) => {
            state.workers -= 1;
            log::error!("[POOL] '{}' failed to spawn worker: {}", inner.name, e);
        }
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Some(task);
                }
                if state.shutdown {
                    break None;
                }
                state.idle += 1;
                let timed_out = inner
                    .work_available
                    .wait_for(&mut state, IDLE_TIMEOUT)
                    .timed_out();
                state.idle -= 1;
                // Extra workers retire after an idle stretch; the
                // minimum crew stays parked on the condvar.
                if timed_out && state.workers > inner.min_threads && state.queue.is_empty() {
                    break None;
                }
            }
        };

        let Some(task) = task else {
            inner.state.lock().workers -= 1;
            return;
        };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            log::warn!("[POOL] '{}' task panicked; worker continues", inner.name);
        }
    }
}
