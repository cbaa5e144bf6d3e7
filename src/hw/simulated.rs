//! In-process GDC engine for tests and the demo binary.
//!
//! Each job finishes after `base_latency * (1 + tag % 3)`, so consecutive
//! jobs complete out of submission order.

use super::GdcDevice;
use crate::buffer::Buffer;
use crate::error::{FilterError, Result};
use crate::sync::lock;
use crate::types::ParamValue;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Job {
    tag: u32,
    ready_at: Instant,
}

/// Simulated engine with its own completion thread.
pub struct SimulatedGdc {
    jobs_tx: Mutex<Option<Sender<Job>>>,
    done_rx: Receiver<u32>,
    m2m: bool,
    base_latency: Duration,
    fail_queue: AtomicBool,
    queued: AtomicU64,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedGdc {
    pub fn new(m2m: bool, base_latency: Duration) -> Result<Self> {
        let (jobs_tx, jobs_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();
        let engine = std::thread::Builder::new()
            .name("sim-gdc".to_string())
            .spawn(move || engine_loop(jobs_rx, done_tx))
            .map_err(|e| FilterError::Hardware(format!("Failed to start simulated GDC: {}", e)))?;

        Ok(Self {
            jobs_tx: Mutex::new(Some(jobs_tx)),
            done_rx,
            m2m,
            base_latency,
            fail_queue: AtomicBool::new(false),
            queued: AtomicU64::new(0),
            engine: Mutex::new(Some(engine)),
        })
    }

    /// Make every following `queue` call fail.
    pub fn set_fail_queue(&self, fail: bool) {
        self.fail_queue.store(fail, Ordering::Relaxed);
    }

    /// Jobs accepted so far.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
}

impl GdcDevice for SimulatedGdc {
    fn queue(&self, tag: u32, input: &Buffer, output: &Buffer) -> Result<()> {
        if self.fail_queue.load(Ordering::Relaxed) {
            return Err(FilterError::Hardware(format!("queue of tag {} rejected", tag)));
        }

        output.set_info(input.info());
        output.merge_params(&input.params());
        output.set_param("gdc.tag", ParamValue::Int(tag as i64));

        let latency = self.base_latency * (1 + tag % 3);
        let jobs = lock(&self.jobs_tx);
        let tx = jobs
            .as_ref()
            .ok_or_else(|| FilterError::Hardware("Simulated GDC shut down".to_string()))?;
        tx.send(Job {
            tag,
            ready_at: Instant::now() + latency,
        })
        .map_err(|_| FilterError::Hardware("Simulated GDC engine stopped".to_string()))?;
        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<u32>> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(tag) => Ok(Some(tag)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FilterError::Hardware("Simulated GDC engine stopped".to_string()))
            }
        }
    }

    fn has_m2m_path(&self) -> bool {
        self.m2m
    }
}

impl Drop for SimulatedGdc {
    fn drop(&mut self) {
        lock(&self.jobs_tx).take();
        if let Some(handle) = lock(&self.engine).take() {
            let _ = handle.join();
        }
    }
}

fn engine_loop(jobs_rx: Receiver<Job>, done_tx: Sender<u32>) {
    let mut pending: BinaryHeap<Reverse<(Instant, u32)>> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while let Some(Reverse((ready_at, tag))) = pending.peek().copied() {
            if ready_at > now {
                break;
            }
            pending.pop();
            if done_tx.send(tag).is_err() {
                return;
            }
        }

        let wait = pending
            .peek()
            .map(|Reverse((ready_at, _))| ready_at.saturating_duration_since(now))
            .unwrap_or(Duration::from_millis(50));
        match jobs_rx.recv_timeout(wait) {
            Ok(job) => pending.push(Reverse((job.ready_at, job.tag))),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
