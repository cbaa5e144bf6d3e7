//! Geometric distortion correction stage.
//!
//! Each input is submitted to a [`GdcDevice`] under a fresh tag together
//! with a newly allocated output. A dequeue thread owned by the stage
//! collects finished tags, matches them to the submitted job and reports
//! the output.
//!
//! When the engine has no memory-to-memory path the process hook waits for
//! its own tag before returning, so the stage handles one job at a time.
//! Force exit breaks that wait.

use crate::buffer::{Buffer, BufferMemory, HwHandoff};
use crate::error::{FilterError, Result};
use crate::filter::{Stage, StageContext};
use crate::hw::GdcDevice;
use crate::sync::WorkQueue;
use crate::types::{AllocArg, BufferUsage, OutputKind, ParamBag, ParamValue};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll interval for both the dequeue thread and the tight-mode wait.
pub const DEFAULT_POLL_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct GdcOptions {
    /// Correction on; when off every buffer bypasses
    pub enabled: bool,
    /// Override the device's memory-to-memory capability
    pub m2m: Option<bool>,
    pub poll_interval: Duration,
}

impl Default for GdcOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            m2m: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

impl GdcOptions {
    pub fn from_options(options: &ParamBag) -> Self {
        let defaults = Self::default();
        Self {
            enabled: options
                .get("enabled")
                .and_then(ParamValue::as_bool)
                .unwrap_or(defaults.enabled),
            m2m: options.get("m2m").and_then(ParamValue::as_bool),
            poll_interval: options
                .get("poll_ms")
                .and_then(ParamValue::as_int)
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(defaults.poll_interval),
        }
    }
}

/// A job the hardware holds.
struct InFlight {
    tag: u32,
    input: Buffer,
    output: Buffer,
    /// Wakes a process hook waiting for this tag.
    done: Option<Sender<()>>,
}

struct DequeueThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct GdcStage {
    device: Arc<dyn GdcDevice>,
    options: GdcOptions,
    usage: BufferUsage,
    in_flight: Arc<WorkQueue<InFlight>>,
    next_tag: u32,
    dequeue: Option<DequeueThread>,
}

impl GdcStage {
    pub fn new(device: Arc<dyn GdcDevice>, options: GdcOptions, usage: BufferUsage) -> Self {
        Self {
            device,
            options,
            usage: usage.union(BufferUsage::HW_GDC),
            in_flight: Arc::new(WorkQueue::new()),
            next_tag: 0,
            dequeue: None,
        }
    }

    /// Jobs submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn m2m(&self) -> bool {
        self.options.m2m.unwrap_or_else(|| self.device.has_m2m_path())
    }

    fn take_tag(&mut self) -> u32 {
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        self.next_tag
    }

    fn start_dequeue(&mut self, ctx: &StageContext) -> Result<()> {
        if self.dequeue.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let worker = DequeueWorker {
            ctx: ctx.clone(),
            device: self.device.clone(),
            in_flight: self.in_flight.clone(),
            running: running.clone(),
            poll: self.options.poll_interval,
        };
        let handle = std::thread::Builder::new()
            .name(format!("{}-dequeue", ctx.name()))
            .spawn(move || worker.run())
            .map_err(|e| FilterError::Hardware(format!("Failed to spawn dequeue thread: {}", e)))?;
        self.dequeue = Some(DequeueThread { running, handle });
        Ok(())
    }

    fn stop_dequeue(&mut self, ctx: &StageContext) {
        if let Some(thread) = self.dequeue.take() {
            thread.running.store(false, Ordering::Release);
            if thread.handle.join().is_err() {
                ctx.logger().error(format_args!("Dequeue thread panicked"));
            }
        }
    }

    /// Forget every submitted job; late tags are ignored.
    fn abandon_in_flight(&self, ctx: &StageContext) {
        let abandoned = self.in_flight.drain();
        if !abandoned.is_empty() {
            ctx.logger()
                .debug(format_args!("Abandoning {} GDC jobs", abandoned.len()));
        }
        for job in abandoned {
            job.input.set_handoff(None);
        }
    }

    fn request_for(&self, input: &Buffer) -> Option<AllocArg> {
        match input.memory() {
            BufferMemory::Graphic {
                width,
                height,
                format,
            } => Some(AllocArg::graphic(width, height, format, self.usage)),
            BufferMemory::Linear { .. } => None,
        }
    }
}

struct DequeueWorker {
    ctx: StageContext,
    device: Arc<dyn GdcDevice>,
    in_flight: Arc<WorkQueue<InFlight>>,
    running: Arc<AtomicBool>,
    poll: Duration,
}

impl DequeueWorker {
    fn run(self) {
        let log = self.ctx.logger().child("dequeue");
        log.debug(format_args!("Dequeue thread started"));
        while self.running.load(Ordering::Acquire) {
            match self.device.dequeue(self.poll) {
                Ok(Some(tag)) => self.complete(tag),
                Ok(None) => {}
                Err(e) => {
                    log.warn(format_args!("Dequeue failed: {}", e));
                    std::thread::sleep(self.poll);
                }
            }
        }
        log.debug(format_args!("Dequeue thread exiting"));
    }

    fn complete(&self, tag: u32) {
        let Some(job) = self.in_flight.dequeue_if(|job| job.tag == tag) else {
            self.ctx
                .logger()
                .debug(format_args!("Ignoring stale tag {}", tag));
            return;
        };

        job.input.set_handoff(None);
        if let Err(e) = self
            .ctx
            .process_done(&job.input, Some(job.output), OutputKind::Single)
        {
            self.ctx
                .logger()
                .debug(format_args!("Completion for tag {} dropped: {}", tag, e));
        }
        if let Some(done) = job.done {
            let _ = done.send(());
        }
    }
}

impl Stage for GdcStage {
    fn do_start(&mut self, ctx: &StageContext) -> Result<()> {
        self.device.stream_on()?;
        self.start_dequeue(ctx)?;
        ctx.logger().info(format_args!(
            "GDC started (enabled={}, m2m={})",
            self.options.enabled,
            self.m2m()
        ));
        Ok(())
    }

    fn do_stop(&mut self, ctx: &StageContext) -> Result<()> {
        self.stop_dequeue(ctx);
        self.abandon_in_flight(ctx);
        self.device.stream_off()
    }

    fn do_flush(&mut self, ctx: &StageContext) -> Result<()> {
        self.abandon_in_flight(ctx);
        Ok(())
    }

    fn do_reset(&mut self, ctx: &StageContext) -> Result<()> {
        self.do_stop(ctx)
    }

    fn do_release(&mut self, ctx: &StageContext) -> Result<()> {
        self.stop_dequeue(ctx);
        self.abandon_in_flight(ctx);
        Ok(())
    }

    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        if input.is_config_only() || !self.options.enabled {
            return ctx.bypass_buffer(&input);
        }
        let Some(arg) = self.request_for(&input) else {
            return ctx.bypass_buffer(&input);
        };
        let Some(output) = ctx.alloc_buffer(&arg) else {
            ctx.logger()
                .debug(format_args!("No GDC output for {}; bypassing", input.id()));
            return ctx.bypass_buffer(&input);
        };

        let tag = self.take_tag();
        let wait = !self.m2m();
        let (done_tx, done_rx) = bounded(1);

        self.in_flight.enqueue(InFlight {
            tag,
            input: input.clone(),
            output: output.clone(),
            done: wait.then_some(done_tx),
        });
        input.set_handoff(Some(HwHandoff {
            handle: tag as i64,
            planes: 2,
            tag: Some(tag),
        }));

        if let Err(e) = self.device.queue(tag, &input, &output) {
            self.in_flight.dequeue_if(|job| job.tag == tag);
            input.set_handoff(None);
            ctx.logger()
                .warn(format_args!("GDC queue failed ({}); bypassing", e));
            return ctx.bypass_buffer(&input);
        }

        if wait {
            loop {
                match done_rx.recv_timeout(self.options.poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) if ctx.is_force_exit() => {
                        ctx.logger()
                            .debug(format_args!("Wait for tag {} cut by force exit", tag));
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
        Ok(())
    }

    fn check_real_time_resource(&self) -> bool {
        self.device.is_real_time_capable()
    }
}

impl Drop for GdcStage {
    fn drop(&mut self) {
        if let Some(thread) = self.dequeue.take() {
            thread.running.store(false, Ordering::Release);
            let _ = thread.handle.join();
        }
    }
}
