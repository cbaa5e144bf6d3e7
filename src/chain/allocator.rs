//! Buffer allocators and the platform block pools they are carved from.

use crate::buffer::{Buffer, BufferMemory};
use crate::config::{BlockPoolConfig, PoolSpec};
use crate::error::{FilterError, Result};
use crate::types::{AllocArg, AllocError, AllocMode, AllocResult, AllocShape, BufferUsage};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a pool request waits for a freed slot before answering `TryAgain`.
pub const SLOT_WAIT: Duration = Duration::from_millis(5);

/// Source of output buffers for a stage. Hot-swappable while running.
#[cfg_attr(test, mockall::automock)]
pub trait BufferAllocator: Send + Sync {
    /// Answer one request. `TryAgain` means "ask again later".
    fn allocate(&self, arg: &AllocArg) -> AllocResult;

    fn set_mode(&self, _mode: AllocMode) {}
}

impl<F> BufferAllocator for F
where
    F: Fn(&AllocArg) -> AllocResult + Send + Sync,
{
    fn allocate(&self, arg: &AllocArg) -> AllocResult {
        self(arg)
    }
}

/// How a platform pool hands out memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Plain linear memory
    Linear,
    /// 2-D graphic buffers allocated on demand
    Graphic,
    /// Buffers borrowed from a consumer-owned queue (display, encoder)
    BufferQueue,
}

impl PoolKind {
    /// Queue-backed pools are shared with a consumer, so stages bound to
    /// them hold as few buffers as possible.
    pub fn alloc_mode(self) -> AllocMode {
        match self {
            PoolKind::BufferQueue => AllocMode::PreferResources,
            PoolKind::Linear | PoolKind::Graphic => AllocMode::PreferPerformance,
        }
    }
}

/// Creates allocators bound to platform pools.
pub trait BlockPoolProvider: Send + Sync {
    fn create_allocator(&self, pool_id: u64, usage: BufferUsage)
        -> Result<Arc<dyn BufferAllocator>>;

    fn pool_kind(&self, pool_id: u64) -> Option<PoolKind>;
}

/// In-process pools described by a [`BlockPoolConfig`].
#[derive(Debug, Clone, Default)]
pub struct PlatformPools {
    specs: HashMap<u64, PoolSpec>,
}

impl PlatformPools {
    pub fn new(config: &BlockPoolConfig) -> Self {
        Self {
            specs: config.pools.iter().map(|p| (p.id, p.clone())).collect(),
        }
    }
}

impl BlockPoolProvider for PlatformPools {
    fn create_allocator(
        &self,
        pool_id: u64,
        usage: BufferUsage,
    ) -> Result<Arc<dyn BufferAllocator>> {
        let spec = self
            .specs
            .get(&pool_id)
            .ok_or_else(|| FilterError::Construction(format!("Unknown block pool {}", pool_id)))?;
        tracing::debug!(pool = pool_id, kind = ?spec.kind, %usage, "Creating pool allocator");
        Ok(Arc::new(PoolAllocator::new(spec, usage)))
    }

    fn pool_kind(&self, pool_id: u64) -> Option<PoolKind> {
        self.specs.get(&pool_id).map(|p| p.kind)
    }
}

/// Allocator bounded by the number of buffers outstanding at once.
///
/// A slot is freed when the last handle to a buffer goes away, through the
/// buffer's destroy notification. An exhausted pool parks the caller for up
/// to [`SLOT_WAIT`] on that notification before answering `TryAgain`.
pub struct PoolAllocator {
    pool_id: u64,
    kind: PoolKind,
    usage: BufferUsage,
    max_count: usize,
    outstanding: Arc<AtomicUsize>,
    freed_tx: Sender<()>,
    freed_rx: Receiver<()>,
    prefer_resources: AtomicBool,
}

impl PoolAllocator {
    pub fn new(spec: &PoolSpec, usage: BufferUsage) -> Self {
        let max_count = spec.max_count.max(1);
        let (freed_tx, freed_rx) = bounded(max_count);
        Self {
            pool_id: spec.id,
            kind: spec.kind,
            usage,
            max_count,
            outstanding: Arc::new(AtomicUsize::new(0)),
            freed_tx,
            freed_rx,
            prefer_resources: AtomicBool::new(spec.kind.alloc_mode() == AllocMode::PreferResources),
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Buffers handed out and still alive.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Effective limit for `arg`. Resource-saving mode halves the pool.
    fn limit_for(&self, arg: &AllocArg) -> usize {
        let mut limit = self.max_count;
        if self.prefer_resources.load(Ordering::Relaxed) {
            limit = (limit / 2).max(1);
        }
        match arg.max_count {
            Some(max) => limit.min(max.max(1)),
            None => limit,
        }
    }

    fn reserve(&self, limit: usize) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Reserve a slot, waiting up to [`SLOT_WAIT`] for one to be freed.
    fn reserve_within(&self, arg: &AllocArg, limit: usize) -> bool {
        let deadline = Instant::now() + SLOT_WAIT;
        loop {
            if !arg.limit_reached() && self.reserve(limit) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Stale tokens from earlier frees only cost one extra attempt each
            let _ = self.freed_rx.recv_timeout(remaining);
        }
    }
}

impl BufferAllocator for PoolAllocator {
    fn allocate(&self, arg: &AllocArg) -> AllocResult {
        if arg.usage.contains(BufferUsage::PROTECTED) && !self.usage.contains(BufferUsage::PROTECTED)
        {
            return Err(AllocError::Refused);
        }

        let memory = match arg.shape {
            AllocShape::Linear { capacity } if capacity > 0 => BufferMemory::Linear { capacity },
            AllocShape::Graphic {
                width,
                height,
                format,
            } if width > 0 && height > 0 => BufferMemory::Graphic {
                width,
                height,
                format,
            },
            _ => return Err(AllocError::BadValue),
        };

        if !self.reserve_within(arg, self.limit_for(arg)) {
            return Err(AllocError::TryAgain);
        }

        let buffer = Buffer::new(memory);
        let outstanding = self.outstanding.clone();
        let freed = self.freed_tx.clone();
        buffer.add_destroy_notify(move |_| {
            outstanding.fetch_sub(1, Ordering::AcqRel);
            let _ = freed.try_send(());
        });
        Ok(buffer)
    }

    fn set_mode(&self, mode: AllocMode) {
        self.prefer_resources
            .store(mode == AllocMode::PreferResources, Ordering::Relaxed);
    }
}
