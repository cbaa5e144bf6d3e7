//! Stage that hands every buffer onward untouched.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::filter::{Stage, StageContext};

#[derive(Debug, Default)]
pub struct PassthroughStage;

impl Stage for PassthroughStage {
    fn do_process(&mut self, ctx: &StageContext, input: Buffer) -> Result<()> {
        ctx.logger()
            .trace(format_args!("Bypassing {}", input.id()));
        ctx.bypass_buffer(&input)
    }
}
