//! Filter capability and the engine that implements it.
//!
//! A [`Filter`] is one stage of a chain. The chain talks to stages only
//! through this trait; the concrete behaviour lives in a [`Stage`]
//! implementation driven by a [`FilterEngine`].
//!
//! # Completion flow
//!
//! ```text
//! owner ──queue_work──▶ stage 1 ──queue_work──▶ stage 2 ──on_work_done──▶ owner
//!                          │                        │
//!                          └─── failure completions ┴──on_work_done──▶ owner
//! ```
//!
//! `queue_work` never blocks on processing. Completed works travel on the
//! thread that finished them; the owner observes them through its
//! [`FilterListener`].

mod context;
mod engine;
pub mod id;
mod work_info;

pub use context::{FilterStats, FilterStatsSnapshot, StageContext};
pub use engine::{FilterEngine, Stage};
pub use id::{FilterId, FIRST_FILTER_ID, OWNER_ID};

use crate::chain::BufferAllocator;
use crate::error::{ErrorKind, FilterError, Result};
use crate::types::{AllocMode, Work};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FilterState {
    Created,
    Started,
    Flushing,
    Resetting,
    Idle,
    Stopped,
    /// Terminal.
    Released,
}

impl FilterState {
    /// States from which `start` is accepted.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            FilterState::Created | FilterState::Idle | FilterState::Stopped
        )
    }
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives works leaving the chain.
#[cfg_attr(test, mockall::automock)]
pub trait FilterListener: Send + Sync {
    /// A work finished (or failed) at stage `from`.
    fn on_work_done(&self, from: FilterId, work: Work);

    /// A work was rejected by stage `from`. Called before the failed work
    /// itself is returned through [`on_work_done`](Self::on_work_done).
    fn on_error(&self, _from: FilterId, _kind: ErrorKind) {}

    /// Works still in flight when stage `from` was flushed, stopped or reset.
    fn on_works_flushed(&self, _from: FilterId, _works: Vec<Work>) {}
}

/// Capability interface of a stage.
pub trait Filter: Send + Sync {
    fn id(&self) -> FilterId;
    fn set_id(&self, id: FilterId) -> Result<()>;
    fn name(&self) -> &str;
    fn state(&self) -> FilterState;

    fn set_next(&self, next: Option<Weak<dyn Filter>>) -> Result<()>;
    fn set_callback(&self, listener: Option<Arc<dyn FilterListener>>) -> Result<()>;
    fn set_allocator(&self, allocator: Option<Arc<dyn BufferAllocator>>) -> Result<()>;
    fn has_allocator(&self) -> bool;
    fn set_alloc_mode(&self, mode: AllocMode) -> Result<()>;

    /// Admit `work` for asynchronous processing.
    ///
    /// A rejected work is still handed back through a failure completion;
    /// the returned error only tells the caller why.
    fn queue_work(&self, work: Work) -> Result<()>;

    /// Whether the stage's hardware can currently meet real-time deadlines.
    fn check_real_time_resource(&self) -> bool;

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn release(&self) -> Result<()>;

    /// Tag admissions from now on with a new session. Session mode only.
    fn advance_next_session(&self) -> Result<u64>;

    /// Let the worker move on to the following session, stranding older
    /// tasks until the next flush. Session mode only.
    fn advance_current_session(&self) -> Result<u64>;

    fn stats(&self) -> FilterStatsSnapshot;
}

// ==================== Mailbox listener ====================

/// Messages delivered through a [`ChannelListener`].
#[derive(Debug)]
pub enum Completion {
    Done { from: FilterId, work: Work },
    Error { from: FilterId, kind: ErrorKind },
    Flushed { from: FilterId, works: Vec<Work> },
}

impl Completion {
    pub fn sender(&self) -> FilterId {
        match self {
            Completion::Done { from, .. }
            | Completion::Error { from, .. }
            | Completion::Flushed { from, .. } => *from,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Completion::Done { .. } => "done",
            Completion::Error { .. } => "error",
            Completion::Flushed { .. } => "flushed",
        }
    }
}

/// How long an error or flushed-works message waits for mailbox space.
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Listener forwarding completions into a bounded mailbox.
///
/// A full mailbox blocks the thread delivering a completed work until the
/// owner drains it. Errors and flushed works come from control calls the
/// owner may be making itself, so they wait at most [`CONTROL_SEND_TIMEOUT`]
/// and are counted in [`ChannelListener::dropped`] when the mailbox stays full.
pub struct ChannelListener {
    tx: Sender<Completion>,
    dropped: AtomicU64,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> (Arc<Self>, Receiver<Completion>) {
        let (tx, rx) = bounded(capacity.max(1));
        let listener = Self {
            tx,
            dropped: AtomicU64::new(0),
        };
        (Arc::new(listener), rx)
    }

    /// Control-plane messages dropped on a full mailbox.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, msg: Completion) {
        if self.tx.send(msg).is_err() {
            let err = FilterError::Channel("Mailbox closed; completion dropped".to_string());
            tracing::warn!("{}", err);
        }
    }

    fn send_control(&self, msg: Completion) {
        match self.tx.send_timeout(msg, CONTROL_SEND_TIMEOUT) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = msg.label(),
                    from = %msg.sender(),
                    timeout = ?CONTROL_SEND_TIMEOUT,
                    "Mailbox full; control message dropped"
                );
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                let err = FilterError::Channel("Mailbox closed; completion dropped".to_string());
                tracing::warn!("{}", err);
            }
        }
    }
}

impl FilterListener for ChannelListener {
    fn on_work_done(&self, from: FilterId, work: Work) {
        self.send(Completion::Done { from, work });
    }

    fn on_error(&self, from: FilterId, kind: ErrorKind) {
        self.send_control(Completion::Error { from, kind });
    }

    fn on_works_flushed(&self, from: FilterId, works: Vec<Work>) {
        self.send_control(Completion::Flushed { from, works });
    }
}
