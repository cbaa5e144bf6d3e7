//! Stage producing several outputs per input.
//!
//! Every output but the last is reported as [`OutputKind::Multi`], so the
//! work stays pending until the final one arrives. When the first
//! allocation fails the input is bypassed; when a later one fails the input
//! is closed with a drop so the outputs already produced still travel.

use crate::buffer::{Buffer, BufferMemory};
use crate::error::Result;
use crate::filter::{Stage, StageContext};
use crate::types::{AllocArg, BufferUsage, OutputKind, ParamBag, ParamValue};

pub const DEFAULT_OUTPUTS: usize = 2;

#[derive(Debug, Clone)]
pub struct SplitterStage {
    outputs: usize,
    usage: BufferUsage,
}

impl SplitterStage {
    pub fn new(outputs: usize, usage: BufferUsage) -> Self {
        Self {
            outputs: outputs.max(1),
            usage,
        }
    }

    /// Reads `outputs` from the stage options.
    pub fn from_options(options: &ParamBag, usage: BufferUsage) -> Self {
        let outputs = options
            .get("outputs")
            .and_then(ParamValue::as_int)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_OUTPUTS);
        Self::new(outputs, usage)
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    fn request_for(&self, input: &Buffer) -> AllocArg {
        match input.memory() {
            BufferMemory::Linear { capacity } => AllocArg::linear(capacity, self.usage),
            BufferMemory::Graphic {
                width,
                height,
                format,
            } => AllocArg::graphic(width, height, format, self.usage),
        }
    }
}

impl Stage for SplitterStage {
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        let arg = self.request_for(&input);

        for index in 0..self.outputs {
            let Some(output) = ctx.alloc_buffer(&arg) else {
                if index == 0 {
                    ctx.logger()
                        .debug(format_args!("No output for {}; bypassing", input.id()));
                    return ctx.bypass_buffer(&input);
                }
                ctx.logger().warn(format_args!(
                    "Allocation stopped after {} of {} outputs",
                    index, self.outputs
                ));
                return ctx.drop_buffer(&input);
            };

            output.set_info(input.info());
            output.merge_params(&input.params());
            output.set_param("split.index", ParamValue::Int(index as i64));

            let kind = if index + 1 == self.outputs {
                OutputKind::Single
            } else {
                OutputKind::Multi
            };
            ctx.process_done(&input, Some(output), kind)?;
        }
        Ok(())
    }
}
