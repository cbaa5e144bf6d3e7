//! The engine behind every concrete stage.
//!
//! [`FilterEngine`] owns the correlation pool, the worker and the lifecycle
//! state machine; the stage-specific part is a [`Stage`] implementation that
//! only ever sees one buffer at a time.
//!
//! # Control plane
//!
//! `flush`, `stop`, `reset` and `release` share one sequence:
//!
//! 1. close admissions and cancel every task that has not started
//! 2. raise force exit so blocked allocations give up
//! 3. run the stage hook on the worker, waiting at most `control_timeout_ms`
//! 4. lower force exit and collect the works still in flight
//! 5. release the gate and hand those works back to the owner
//! 6. propagate to the next stage per [`PropagationPolicy`]

use super::context::{EngineCore, FilterStatsSnapshot, StageContext};
use super::work_info::WorkInfo;
use super::{Filter, FilterId, FilterListener, FilterState};
use crate::buffer::{Buffer, BufferId};
use crate::chain::BufferAllocator;
use crate::config::{EngineConfig, PropagationPolicy};
use crate::error::{FilterError, Result};
use crate::sync::{lock, read, write};
use crate::types::{AllocMode, Work};
use crate::worker::{WaitError, WorkerPool};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

/// Stage-specific behaviour plugged into a [`FilterEngine`].
///
/// Every hook runs on the stage's own worker, so implementations are never
/// called concurrently with themselves.
pub trait Stage: Send + 'static {
    fn do_start(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    fn do_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    fn do_flush(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    fn do_reset(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    fn do_release(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Handle one input. Must eventually report it through
    /// [`StageContext::process_done`] or [`StageContext::bypass_buffer`],
    /// possibly from another thread. An error bypasses the input.
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()>;

    fn check_real_time_resource(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlOp {
    Start,
    Stop,
    Flush,
    Reset,
    Release,
}

impl ControlOp {
    fn hook_name(self) -> &'static str {
        match self {
            ControlOp::Start => "do_start",
            ControlOp::Stop => "do_stop",
            ControlOp::Flush => "do_flush",
            ControlOp::Reset => "do_reset",
            ControlOp::Release => "do_release",
        }
    }

    fn cancels_work(self) -> bool {
        !matches!(self, ControlOp::Start)
    }

    fn accepts(self, state: FilterState) -> bool {
        match self {
            ControlOp::Start => state.can_start(),
            ControlOp::Flush => state == FilterState::Started,
            ControlOp::Stop | ControlOp::Reset | ControlOp::Release => {
                state != FilterState::Released
            }
        }
    }

    fn transient(self) -> Option<FilterState> {
        match self {
            ControlOp::Flush => Some(FilterState::Flushing),
            ControlOp::Reset => Some(FilterState::Resetting),
            _ => None,
        }
    }

    fn target(self) -> FilterState {
        match self {
            ControlOp::Start | ControlOp::Flush => FilterState::Started,
            ControlOp::Stop => FilterState::Stopped,
            ControlOp::Reset => FilterState::Idle,
            ControlOp::Release => FilterState::Released,
        }
    }

    fn apply(self, filter: &dyn Filter) -> Result<()> {
        match self {
            ControlOp::Start => filter.start(),
            ControlOp::Stop => filter.stop(),
            ControlOp::Flush => filter.flush(),
            ControlOp::Reset => filter.reset(),
            ControlOp::Release => filter.release(),
        }
    }
}

/// Concrete [`Filter`] driving a [`Stage`].
pub struct FilterEngine<S: Stage> {
    core: Arc<EngineCore>,
    stage: Arc<Mutex<S>>,
    pool: WorkerPool,
    /// Admissions read, control calls write.
    gate: RwLock<()>,
}

impl<S: Stage> FilterEngine<S> {
    pub fn new(name: impl Into<String>, stage: S, config: &EngineConfig) -> Result<Self> {
        let name = name.into();
        let pool = WorkerPool::new(format!("{}-worker", name), config.workers_per_stage)?;
        pool.set_session_mode(config.session_mode);
        let core = Arc::new(EngineCore::new(name, config.clone()));
        core.logger.debug(format_args!("Created"));

        Ok(Self {
            core,
            stage: Arc::new(Mutex::new(stage)),
            pool,
            gate: RwLock::new(()),
        })
    }

    pub fn context(&self) -> StageContext {
        StageContext::new(self.core.clone())
    }

    /// Works admitted but not yet retired.
    pub fn pending_works(&self) -> usize {
        self.core.work_infos.len()
    }

    /// Process tasks admitted but not yet started.
    pub fn pending_tasks(&self) -> usize {
        self.pool.pending()
    }

    pub fn pending_params(&self) -> usize {
        self.core.pending_params.len()
    }

    /// Inspect the stage. Blocks while a hook is running.
    pub fn with_stage<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&lock(&self.stage))
    }

    fn wire(&self, f: impl FnOnce(&mut super::context::Links)) -> Result<()> {
        if self.core.state() == FilterState::Released {
            return Err(self.core.bad_state());
        }
        f(&mut write(&self.core.links));
        Ok(())
    }

    fn require_sessions(&self) -> Result<()> {
        if self.core.state() == FilterState::Released {
            return Err(self.core.bad_state());
        }
        if !self.pool.session_mode() {
            return Err(FilterError::InvalidParameter(format!(
                "{} does not run in session mode",
                self.core.name
            )));
        }
        Ok(())
    }

    fn reject(&self, work: Work, err: FilterError) -> Result<()> {
        self.core.logger.warn(format_args!(
            "Rejecting frame {}: {}",
            work.frame_index, err
        ));
        self.core.fail_work(work, err.kind());
        Err(err)
    }

    fn control(&self, op: ControlOp) -> Result<()> {
        let (own, flushed) = self.run_control(op);
        self.return_flushed(flushed);
        if let Err(e) = &own {
            self.core
                .logger
                .error(format_args!("{} failed: {}", op.hook_name(), e));
            if self.core.config.propagation == PropagationPolicy::StopOnFailure {
                return own;
            }
        }

        let next = read(&self.core.links).next.as_ref().and_then(Weak::upgrade);
        let downstream = match next {
            Some(next) => op.apply(next.as_ref()),
            None => Ok(()),
        };
        own.and(downstream)
    }

    /// Hand works cleared by a control call back to the owner. Runs outside
    /// the gate so a slow owner never holds up admissions or control calls.
    fn return_flushed(&self, flushed: Vec<Work>) {
        if flushed.is_empty() {
            return;
        }
        self.core
            .logger
            .debug(format_args!("Returning {} in-flight works", flushed.len()));
        let listener = read(&self.core.links).listener.clone();
        if let Some(listener) = listener {
            listener.on_works_flushed(self.core.id(), flushed);
        }
    }

    /// Runs `op` on this stage only, under the write gate. Returns the hook
    /// result and the works that were still in flight.
    fn run_control(&self, op: ControlOp) -> (Result<()>, Vec<Work>) {
        let _gate = write(&self.gate);
        let prior = self.core.state();
        if !op.accepts(prior) {
            return (Err(self.core.bad_state()), Vec::new());
        }
        self.core
            .logger
            .essential(format_args!("{} from {}", op.hook_name(), prior));

        if let Some(state) = op.transient() {
            self.core.set_state(state);
        }
        if op.cancels_work() {
            let cancelled = self.pool.flush();
            if cancelled > 0 {
                self.core
                    .logger
                    .debug(format_args!("Cancelled {} queued tasks", cancelled));
            }
            self.core.set_force_exit(true);
            if self.pool.session_mode() {
                self.pool.advance_current_session();
            }
        }

        let result = self.call_hook(op);

        let mut flushed = Vec::new();
        if op.cancels_work() {
            self.core.set_force_exit(false);
            flushed = self.core.clear_in_flight();
        }

        match (op, &result) {
            (ControlOp::Release, _) => {
                self.core.set_state(FilterState::Released);
                self.pool.stop();
            }
            (_, Ok(())) => self.core.set_state(op.target()),
            (_, Err(_)) => self.core.set_state(prior),
        }
        (result, flushed)
    }

    fn call_hook(&self, op: ControlOp) -> Result<()> {
        let stage = self.stage.clone();
        let ctx = self.context();
        let future = self.pool.post_current(move |cancel| {
            if cancel {
                return Ok(());
            }
            let mut stage = lock(&stage);
            match op {
                ControlOp::Start => stage.do_start(&ctx),
                ControlOp::Stop => stage.do_stop(&ctx),
                ControlOp::Flush => stage.do_flush(&ctx),
                ControlOp::Reset => stage.do_reset(&ctx),
                ControlOp::Release => stage.do_release(&ctx),
            }
        });

        let timeout = Duration::from_millis(self.core.config.control_timeout_ms);
        match future.wait_timeout(timeout) {
            Ok(result) => result,
            Err(WaitError::Timeout) => {
                self.core.logger.warn(format_args!(
                    "{} did not finish within {:?}; continuing",
                    op.hook_name(),
                    timeout
                ));
                Ok(())
            }
            Err(WaitError::Abandoned) => Err(FilterError::Hardware(format!(
                "{} panicked in {}",
                op.hook_name(),
                self.core.name
            ))),
        }
    }
}

fn process_task<S: Stage>(ctx: &StageContext, stage: &Mutex<S>, input: Buffer, cancel: bool) {
    let core = &ctx.core;
    if cancel || core.state() != FilterState::Started {
        core.note_cancelled();
        return;
    }
    core.note_processed();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        lock(stage).do_process(ctx, input.clone())
    }));
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "process hook panicked".to_string(),
    };

    if ctx.is_pending(&input) {
        core.logger
            .warn(format_args!("Bypassing {}: {}", input.id(), failure));
        let _ = ctx.bypass_buffer(&input);
    }
}

impl<S: Stage> Filter for FilterEngine<S> {
    fn id(&self) -> FilterId {
        self.core.id()
    }

    fn set_id(&self, id: FilterId) -> Result<()> {
        self.wire(|_| ())?;
        self.core.set_id(id);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> FilterState {
        self.core.state()
    }

    fn set_next(&self, next: Option<Weak<dyn Filter>>) -> Result<()> {
        self.wire(|links| links.next = next)
    }

    fn set_callback(&self, listener: Option<Arc<dyn FilterListener>>) -> Result<()> {
        self.wire(|links| links.listener = listener)
    }

    fn set_allocator(&self, allocator: Option<Arc<dyn BufferAllocator>>) -> Result<()> {
        self.wire(|links| {
            if let Some(allocator) = &allocator {
                allocator.set_mode(links.alloc_mode);
            }
            links.allocator = allocator;
        })
    }

    fn has_allocator(&self) -> bool {
        read(&self.core.links).allocator.is_some()
    }

    fn set_alloc_mode(&self, mode: AllocMode) -> Result<()> {
        self.wire(|links| {
            links.alloc_mode = mode;
            if let Some(allocator) = &links.allocator {
                allocator.set_mode(mode);
            }
        })
    }

    fn queue_work(&self, work: Work) -> Result<()> {
        if work.is_failed() {
            self.core.deliver(work);
            return Ok(());
        }

        let _gate = read(&self.gate);
        if self.core.state() != FilterState::Started {
            let err = self.core.bad_state();
            return self.reject(work, err);
        }

        let inputs: Vec<Buffer> = work.unconsumed().to_vec();
        if inputs.is_empty() {
            let err = FilterError::InvalidParameter(format!(
                "frame {} has no unconsumed buffers",
                work.frame_index
            ));
            return self.reject(work, err);
        }

        let ids: Vec<BufferId> = inputs.iter().map(Buffer::id).collect();
        if ids.iter().collect::<HashSet<_>>().len() != ids.len() {
            let err = FilterError::InvalidParameter(format!(
                "frame {} lists a buffer twice",
                work.frame_index
            ));
            return self.reject(work, err);
        }

        let info = WorkInfo::admit(work);
        if let Some(rejected) = self
            .core
            .work_infos
            .try_enqueue(info, |live| ids.iter().any(|id| live.claims(*id)))
        {
            let err = FilterError::InvalidParameter(format!(
                "frame {} holds a buffer that is already pending",
                rejected.frame_index()
            ));
            return self.reject(rejected.rewind(), err);
        }

        self.core.note_admitted();
        self.core
            .logger
            .trace(format_args!("Admitted {} inputs", inputs.len()));
        for input in inputs {
            let ctx = self.context();
            let stage = self.stage.clone();
            self.pool
                .toss(move |cancel| process_task(&ctx, &stage, input, cancel));
        }
        Ok(())
    }

    fn check_real_time_resource(&self) -> bool {
        lock(&self.stage).check_real_time_resource()
    }

    fn start(&self) -> Result<()> {
        self.control(ControlOp::Start)
    }

    fn stop(&self) -> Result<()> {
        self.control(ControlOp::Stop)
    }

    fn flush(&self) -> Result<()> {
        self.control(ControlOp::Flush)
    }

    fn reset(&self) -> Result<()> {
        self.control(ControlOp::Reset)
    }

    fn release(&self) -> Result<()> {
        self.control(ControlOp::Release)
    }

    fn advance_next_session(&self) -> Result<u64> {
        let _gate = write(&self.gate);
        self.require_sessions()?;
        let session = self.pool.advance_next_session();
        self.core
            .logger
            .debug(format_args!("Admitting into session {}", session));
        Ok(session)
    }

    fn advance_current_session(&self) -> Result<u64> {
        let _gate = write(&self.gate);
        self.require_sessions()?;
        let session = self.pool.advance_current_session();
        self.core
            .logger
            .debug(format_args!("Running session {}", session));
        Ok(session)
    }

    fn stats(&self) -> FilterStatsSnapshot {
        self.core.stats.snapshot()
    }
}
