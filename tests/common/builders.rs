//! Test data builders for works, stages and chains

use crossbeam_channel::{Receiver, Sender};
use filterchain_rs::buffer::{Buffer, PixelFormat};
use filterchain_rs::chain::{FilterDescriptor, PlatformPools};
use filterchain_rs::config::{BlockPoolConfig, EngineConfig};
use filterchain_rs::error::Result;
use filterchain_rs::filter::{Filter, FilterEngine, Stage, StageContext};
use filterchain_rs::types::{OutputKind, Work};
use filterchain_rs::ChainBuilder;
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating test Works
pub struct WorkBuilder {
    frame_index: u64,
    buffers: Vec<Buffer>,
    input_index: usize,
    drain: bool,
}

impl WorkBuilder {
    pub fn new(frame_index: u64) -> Self {
        Self {
            frame_index,
            buffers: Vec::new(),
            input_index: 0,
            drain: false,
        }
    }

    pub fn buffer(mut self, buffer: Buffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn linear(self, capacity: usize) -> Self {
        self.buffer(Buffer::linear(capacity))
    }

    pub fn graphic(self, width: u32, height: u32) -> Self {
        self.buffer(Buffer::graphic(width, height, PixelFormat::Nv12))
    }

    pub fn consumed(mut self, input_index: usize) -> Self {
        self.input_index = input_index;
        self
    }

    pub fn drain(mut self) -> Self {
        self.drain = true;
        self
    }

    pub fn build(self) -> Work {
        let mut work = Work::new(self.frame_index, self.buffers).with_drain(self.drain);
        work.input_index = self.input_index;
        work
    }
}

// ==================== Test stages ====================

/// Bypasses every buffer and reports what it saw.
pub struct Recorder {
    pub seen: Sender<Buffer>,
}

impl Stage for Recorder {
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        let _ = self.seen.send(input.clone());
        ctx.bypass_buffer(&input)
    }
}

/// Reports the given outputs for each input, all but the last as `Multi`.
pub struct Emitter {
    pub outputs: Receiver<Vec<Buffer>>,
}

impl Stage for Emitter {
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        let outputs = self.outputs.recv_timeout(Duration::from_secs(5)).unwrap_or_default();
        let last = outputs.len().saturating_sub(1);
        for (i, out) in outputs.into_iter().enumerate() {
            let kind = if i == last {
                OutputKind::Single
            } else {
                OutputKind::Multi
            };
            ctx.process_done(&input, Some(out), kind)?;
        }
        Ok(())
    }
}

/// Signals when processing begins, then holds the worker until released.
pub struct Blocker {
    pub entered: Sender<()>,
    pub release: Receiver<()>,
}

impl Stage for Blocker {
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        ctx.bypass_buffer(&input)
    }
}

/// Completes each input with one freshly allocated output, or drops it.
pub struct Transformer;

impl Stage for Transformer {
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        let arg = filterchain_rs::types::AllocArg::linear(16, Default::default());
        match ctx.alloc_buffer(&arg) {
            Some(out) => ctx.process_done(&input, Some(out), OutputKind::Single),
            None => ctx.drop_buffer(&input),
        }
    }
}

/// Refuses to start.
pub struct FailingStart;

impl Stage for FailingStart {
    fn do_start(&mut self, _ctx: &StageContext) -> Result<()> {
        Err(filterchain_rs::FilterError::Hardware("engine offline".into()))
    }

    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        ctx.bypass_buffer(&input)
    }
}

/// Descriptor wrapping `stage` in an engine with the given configuration.
pub fn stage_descriptor<S: Stage>(name: &str, stage: S, config: EngineConfig) -> FilterDescriptor {
    FilterDescriptor::new(name, move |n: &str| {
        let engine = FilterEngine::new(n, stage, &config)?;
        Ok(Arc::new(engine) as Arc<dyn Filter>)
    })
}

/// Builder backed by the default block pools
pub fn chain_builder() -> ChainBuilder {
    ChainBuilder::new(Arc::new(PlatformPools::new(&BlockPoolConfig::default())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_builder() {
        let work = WorkBuilder::new(7).linear(4).linear(8).consumed(1).drain().build();
        assert_eq!(work.frame_index, 7);
        assert_eq!(work.buffers.len(), 2);
        assert_eq!(work.unconsumed_count(), 1);
        assert!(work.drain);
    }
}
