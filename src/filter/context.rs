//! State shared between a stage's engine, its worker tasks and any helper
//! threads the stage spawns.

use super::id::FilterId;
use super::work_info::WorkInfo;
use super::{Filter, FilterListener, FilterState};
use crate::buffer::{Buffer, BufferId};
use crate::chain::BufferAllocator;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, FilterError, Result};
use crate::logging::Logger;
use crate::sync::{lock, read, KeyedStore, Updated, WorkQueue};
use crate::types::{AllocArg, AllocError, AllocMode, OutputKind, ParamBag, Work};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

// ==================== Stats ====================

/// Per-stage counters.
#[derive(Debug, Default)]
pub struct FilterStats {
    admitted: AtomicU64,
    processed: AtomicU64,
    bypassed: AtomicU64,
    dropped: AtomicU64,
    cancelled: AtomicU64,
    failed_admissions: AtomicU64,
    retired: AtomicU64,
    alloc_retries: AtomicU64,
}

/// Point-in-time copy of [`FilterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStatsSnapshot {
    /// Works accepted by `queue_work`.
    pub admitted: u64,
    /// Buffers handed to the stage's process hook.
    pub processed: u64,
    pub bypassed: u64,
    pub dropped: u64,
    /// Process tasks invoked with the cancel flag.
    pub cancelled: u64,
    /// Works handed back through a failure completion.
    pub failed_admissions: u64,
    /// Works handed onward after all their inputs completed.
    pub retired: u64,
    pub alloc_retries: u64,
}

impl FilterStats {
    pub fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed_admissions: self.failed_admissions.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            alloc_retries: self.alloc_retries.load(Ordering::Relaxed),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ==================== Engine core ====================

/// Links installed during wiring.
#[derive(Default)]
pub(crate) struct Links {
    pub(crate) next: Option<Weak<dyn Filter>>,
    pub(crate) listener: Option<Arc<dyn FilterListener>>,
    pub(crate) allocator: Option<Arc<dyn BufferAllocator>>,
    pub(crate) alloc_mode: AllocMode,
}

/// Everything a stage's tasks need after the engine handed them off.
pub(crate) struct EngineCore {
    id: AtomicU32,
    pub(crate) name: String,
    pub(crate) logger: Logger,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<FilterState>,
    pub(crate) links: RwLock<Links>,
    pub(crate) work_infos: WorkQueue<WorkInfo>,
    pub(crate) pending_params: KeyedStore<BufferId, ParamBag>,
    pub(crate) force_exit: AtomicBool,
    pub(crate) stats: FilterStats,
}

impl EngineCore {
    pub(crate) fn new(name: String, config: EngineConfig) -> Self {
        let logger = Logger::new(name.clone(), config.log_level);
        Self {
            id: AtomicU32::new(FilterId::INVALID.0),
            name,
            logger,
            config,
            state: Mutex::new(FilterState::Created),
            links: RwLock::new(Links::default()),
            work_infos: WorkQueue::new(),
            pending_params: KeyedStore::new(),
            force_exit: AtomicBool::new(false),
            stats: FilterStats::default(),
        }
    }

    pub(crate) fn id(&self) -> FilterId {
        FilterId(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: FilterId) {
        self.id.store(id.0, Ordering::Release);
    }

    pub(crate) fn state(&self) -> FilterState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: FilterState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::trace!(filter = %self.name, from = ?*current, to = ?state, "State change");
            *current = state;
        }
    }

    pub(crate) fn bad_state(&self) -> FilterError {
        FilterError::BadState {
            filter: self.id(),
            state: self.state(),
        }
    }

    /// Hand a finished work onward: to the next stage if one is wired,
    /// otherwise to the owner's listener.
    pub(crate) fn deliver(&self, work: Work) {
        let (next, listener) = {
            let links = read(&self.links);
            (
                links.next.as_ref().and_then(Weak::upgrade),
                links.listener.clone(),
            )
        };

        match (next, listener) {
            (Some(next), _) => {
                if let Err(e) = next.queue_work(work) {
                    // The next stage already reported the failure completion.
                    self.logger
                        .debug(format_args!("{} rejected frame: {}", next.name(), e));
                }
            }
            (None, Some(listener)) => listener.on_work_done(self.id(), work),
            (None, None) => self.logger.warn(format_args!(
                "No listener wired; dropping frame {}",
                work.frame_index
            )),
        }
    }

    /// Mark `work` failed and return it straight to the owner.
    pub(crate) fn fail_work(&self, mut work: Work, kind: ErrorKind) {
        bump(&self.stats.failed_admissions);
        work.fail(kind);
        let listener = read(&self.links).listener.clone();
        match listener {
            Some(listener) => {
                listener.on_error(self.id(), kind);
                listener.on_work_done(self.id(), work);
            }
            None => self.logger.error(format_args!(
                "Failed frame {} ({}) has nowhere to go",
                work.frame_index, kind
            )),
        }
    }

    fn settle(&self, input: BufferId, update: Updated<WorkInfo>) -> Result<()> {
        match update {
            Updated::NotFound => {
                self.logger
                    .debug(format_args!("No pending work holds {}", input));
                Err(FilterError::InvalidParameter(format!(
                    "{} is not pending in {}",
                    input, self.name
                )))
            }
            Updated::Kept => Ok(()),
            Updated::Removed(info) => {
                bump(&self.stats.retired);
                self.logger.trace(format_args!(
                    "Retiring frame {} ({} in, {} out)",
                    info.frame_index(),
                    info.in_data_num(),
                    info.out_data_num()
                ));
                self.deliver(info.into_work());
                Ok(())
            }
        }
    }

    pub(crate) fn process_done(
        &self,
        input: &Buffer,
        output: Option<Buffer>,
        kind: OutputKind,
    ) -> Result<()> {
        let input_id = input.id();
        match &output {
            Some(out) => {
                let bag = match kind {
                    OutputKind::Multi => self.pending_params.get(&input_id),
                    OutputKind::Single => self.pending_params.take(&input_id),
                };
                if let Some(bag) = bag {
                    out.merge_params(&bag);
                }
            }
            None => {
                self.pending_params.take(&input_id);
            }
        }

        let dropped = output.is_none();
        let update = self.work_infos.update_first(
            |info| info.claims(input_id),
            |info| info.complete(input_id, output, kind),
        );
        if dropped && !matches!(update, Updated::NotFound) {
            bump(&self.stats.dropped);
        }
        self.settle(input_id, update)
    }

    pub(crate) fn bypass(&self, input: &Buffer) -> Result<()> {
        let input_id = input.id();
        if let Some(bag) = self.pending_params.take(&input_id) {
            input.merge_params(&bag);
        }
        let update = self
            .work_infos
            .update_first(|info| info.claims(input_id), |info| info.bypass(input_id));
        if !matches!(update, Updated::NotFound) {
            bump(&self.stats.bypassed);
        }
        self.settle(input_id, update)
    }

    pub(crate) fn note_processed(&self) {
        bump(&self.stats.processed);
    }

    pub(crate) fn note_cancelled(&self) {
        bump(&self.stats.cancelled);
    }

    pub(crate) fn note_admitted(&self) {
        bump(&self.stats.admitted);
    }

    pub(crate) fn is_force_exit(&self) -> bool {
        self.force_exit.load(Ordering::Acquire)
    }

    pub(crate) fn set_force_exit(&self, value: bool) {
        self.force_exit.store(value, Ordering::Release);
    }

    fn alloc_buffer(&self, arg: &AllocArg) -> Option<Buffer> {
        let Some(allocator) = read(&self.links).allocator.clone() else {
            self.logger.warn(format_args!("No allocator installed"));
            return None;
        };
        let backoff = Duration::from_micros(self.config.alloc_backoff_us);

        loop {
            match allocator.allocate(arg) {
                Ok(buffer) => return Some(buffer),
                Err(AllocError::TryAgain) => {
                    if self.is_force_exit() {
                        self.logger
                            .debug(format_args!("Allocation abandoned on force exit"));
                        return None;
                    }
                    bump(&self.stats.alloc_retries);
                    if backoff.is_zero() {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(backoff);
                    }
                }
                Err(e) => {
                    self.logger.warn(format_args!("Allocation failed: {}", e));
                    return None;
                }
            }
        }
    }

    /// Empty the correlation pool and pending parameters. Returns the works
    /// that were still in flight.
    pub(crate) fn clear_in_flight(&self) -> Vec<Work> {
        self.pending_params.clear();
        self.work_infos
            .drain()
            .into_iter()
            .map(WorkInfo::into_work)
            .collect()
    }
}

// ==================== Stage context ====================

/// Handle through which a stage reports completions and reaches its
/// engine's services. Cheap to clone; safe to move to helper threads.
#[derive(Clone)]
pub struct StageContext {
    pub(crate) core: Arc<EngineCore>,
}

impl StageContext {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> FilterId {
        self.core.id()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn logger(&self) -> &Logger {
        &self.core.logger
    }

    pub fn alloc_mode(&self) -> AllocMode {
        read(&self.core.links).alloc_mode
    }

    /// Report an output (or a drop, when `output` is `None`) for `input`.
    ///
    /// Retirement hands the work onward on the calling thread.
    pub fn process_done(
        &self,
        input: &Buffer,
        output: Option<Buffer>,
        kind: OutputKind,
    ) -> Result<()> {
        self.core.process_done(input, output, kind)
    }

    /// Complete `input` without producing anything.
    pub fn drop_buffer(&self, input: &Buffer) -> Result<()> {
        self.core.process_done(input, None, OutputKind::Single)
    }

    /// Pass `input` to the next stage untouched.
    pub fn bypass_buffer(&self, input: &Buffer) -> Result<()> {
        self.core.bypass(input)
    }

    /// Blocking allocation. Retries while the allocator answers TryAgain;
    /// gives up with `None` on a terminal error or once force exit is raised.
    pub fn alloc_buffer(&self, arg: &AllocArg) -> Option<Buffer> {
        self.core.alloc_buffer(arg)
    }

    /// Queue parameters to merge into the output produced from `input`.
    pub fn set_pending_params(&self, input: &Buffer, bag: ParamBag) {
        self.core
            .pending_params
            .upsert_with(input.id(), bag, |old, new| old.extend(new));
    }

    /// Raised for the duration of a flush/stop/reset/release.
    pub fn is_force_exit(&self) -> bool {
        self.core.is_force_exit()
    }

    /// Whether `input` still waits for a final completion.
    pub fn is_pending(&self, input: &Buffer) -> bool {
        let id = input.id();
        self.core.work_infos.contains(|info| info.claims(id))
    }
}
