//! Per-stage task executor.
//!
//! Every stage owns one [`WorkerPool`]. Work posted to it runs on the pool's
//! own threads (one per stage in practice), strictly in admission order, so
//! a stage's hooks never race each other while different stages still run
//! in parallel.
//!
//! # Cancellation
//!
//! Every task receives a `cancel` flag. Tasks that never got to run because
//! of [`WorkerPool::flush`] or [`WorkerPool::stop`] are still invoked, with
//! `cancel = true`, so their bookkeeping (and any [`TaskFuture`]) always
//! resolves.
//!
//! # Sessions
//!
//! In session mode each task is tagged with the pool's *next* session when it
//! is admitted, and workers only pick tasks tagged with the *current*
//! session. This lets a caller queue work for an upcoming configuration while
//! the old one drains; the two counters are advanced separately.

mod future;

pub use future::{TaskFuture, WaitError};

use crate::error::{FilterError, Result};
use crate::sync::lock;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of work. The argument is the cancel flag.
pub type Task = Box<dyn FnOnce(bool) + Send + 'static>;

struct QueuedTask {
    session: u64,
    task: Task,
}

struct PoolState {
    tasks: VecDeque<QueuedTask>,
    terminate: bool,
    session_mode: bool,
    next_session: u64,
    current_session: u64,
    running: usize,
}

impl PoolState {
    fn take_runnable(&mut self) -> Option<QueuedTask> {
        if self.session_mode {
            let current = self.current_session;
            let pos = self.tasks.iter().position(|t| t.session == current)?;
            self.tasks.remove(pos)
        } else {
            self.tasks.pop_front()
        }
    }
}

struct PoolShared {
    name: String,
    state: Mutex<PoolState>,
    wake: Condvar,
}

/// Thread pool with blocking `post`, fire-and-forget `toss`, atomic flush
/// and session partitioning.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one) named after the pool.
    pub fn new(name: impl Into<String>, workers: usize) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            name: name.into(),
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                terminate: false,
                session_mode: false,
                next_session: 0,
                current_session: 0,
                running: 0,
            }),
            wake: Condvar::new(),
        });

        let pool = Self {
            shared,
            threads: Mutex::new(Vec::new()),
        };

        for index in 0..workers.max(1) {
            let shared = pool.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", pool.shared.name, index))
                .spawn(move || worker_loop(shared))
                .map_err(|e| {
                    FilterError::Construction(format!(
                        "Failed to spawn worker for {}: {}",
                        pool.shared.name, e
                    ))
                })?;
            lock(&pool.threads).push(handle);
        }

        tracing::debug!(pool = %pool.shared.name, workers = workers.max(1), "Worker pool started");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedule `f` and return a future for its result.
    pub fn post<R, F>(&self, f: F) -> TaskFuture<R>
    where
        R: Send + 'static,
        F: FnOnce(bool) -> R + Send + 'static,
    {
        let (promise, future) = future::task_channel();
        self.toss(move |cancel| promise.fulfil(f(cancel)));
        future
    }

    /// Like [`WorkerPool::post`], but tagged with the current session so it
    /// runs even while later-session work is queued.
    pub fn post_current<R, F>(&self, f: F) -> TaskFuture<R>
    where
        R: Send + 'static,
        F: FnOnce(bool) -> R + Send + 'static,
    {
        let (promise, future) = future::task_channel();
        self.admit(Box::new(move |cancel| promise.fulfil(f(cancel))), true);
        future
    }

    /// Schedule `f` without a way to wait for it.
    ///
    /// On a stopped pool the task is invoked immediately with `cancel = true`.
    pub fn toss<F>(&self, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.admit(Box::new(f), false);
    }

    fn admit(&self, task: Task, current: bool) {
        let rejected = {
            let mut state = lock(&self.shared.state);
            if state.terminate {
                Some(task)
            } else {
                let session = if current {
                    state.current_session
                } else {
                    state.next_session
                };
                state.tasks.push_back(QueuedTask { session, task });
                None
            }
        };

        match rejected {
            Some(task) => {
                tracing::debug!(pool = %self.shared.name, "Task admitted after stop; cancelling");
                run_guarded(&self.shared.name, task, true);
            }
            None => self.shared.wake.notify_one(),
        }
    }

    /// Remove every task that has not started yet and invoke each with
    /// `cancel = true`. Returns how many were cancelled.
    pub fn flush(&self) -> usize {
        let cancelled: Vec<QueuedTask> = lock(&self.shared.state).tasks.drain(..).collect();
        let count = cancelled.len();
        for queued in cancelled {
            run_guarded(&self.shared.name, queued.task, true);
        }
        if count > 0 {
            tracing::debug!(pool = %self.shared.name, count, "Flushed pending tasks");
        }
        count
    }

    /// Terminate the workers, join them, then cancel whatever is left.
    ///
    /// Safe to call from one of the pool's own tasks: the calling thread is
    /// never joined. Idempotent.
    pub fn stop(&self) {
        lock(&self.shared.state).terminate = true;
        self.shared.wake.notify_all();

        let handles: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        let me = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                // Detached; it exits once the current task returns.
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = %self.shared.name, "Worker thread panicked");
            }
        }

        self.flush();
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.shared.state).terminate
    }

    /// Tasks admitted but not started.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).tasks.len()
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        lock(&self.shared.state).running
    }

    // ── Sessions ──

    pub fn set_session_mode(&self, enabled: bool) {
        lock(&self.shared.state).session_mode = enabled;
        self.shared.wake.notify_all();
    }

    pub fn session_mode(&self) -> bool {
        lock(&self.shared.state).session_mode
    }

    /// Session that newly admitted tasks are tagged with.
    pub fn next_session(&self) -> u64 {
        lock(&self.shared.state).next_session
    }

    /// Session whose tasks workers may pick.
    pub fn current_session(&self) -> u64 {
        lock(&self.shared.state).current_session
    }

    /// Start tagging admissions with a new session. Returns it.
    pub fn advance_next_session(&self) -> u64 {
        let mut state = lock(&self.shared.state);
        state.next_session += 1;
        state.next_session
    }

    /// Let workers move on to the following session. Returns it.
    pub fn advance_current_session(&self) -> u64 {
        let current = {
            let mut state = lock(&self.shared.state);
            state.current_session += 1;
            if state.next_session < state.current_session {
                state.next_session = state.current_session;
            }
            state.current_session
        };
        self.shared.wake.notify_all();
        current
    }

    /// Admitted tasks tagged with `session`.
    pub fn pending_in_session(&self, session: u64) -> usize {
        lock(&self.shared.state)
            .tasks
            .iter()
            .filter(|t| t.session == session)
            .count()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_guarded(pool: &str, task: Task, cancel: bool) {
    if catch_unwind(AssertUnwindSafe(move || task(cancel))).is_err() {
        tracing::error!(pool = %pool, cancel, "Task panicked");
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let queued = {
            let mut state = lock(&shared.state);
            loop {
                if state.terminate {
                    return;
                }
                if let Some(task) = state.take_runnable() {
                    state.running += 1;
                    break task;
                }
                state = shared.wake.wait(state).unwrap_or_else(|e| e.into_inner());
            }
        };

        run_guarded(&shared.name, queued.task, false);
        lock(&shared.state).running -= 1;
    }
}
