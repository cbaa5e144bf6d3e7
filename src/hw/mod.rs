//! Hardware engine interfaces
//!
//! Stages reach their hardware only through the traits in this module, so
//! the same stage runs against a real driver or against [`SimulatedGdc`].

pub mod simulated;

pub use simulated::SimulatedGdc;

use crate::buffer::Buffer;
use crate::error::Result;
use std::time::Duration;

/// A geometric-distortion-correction engine.
///
/// Jobs are identified by a caller-chosen tag. The engine may finish them in
/// any order; finished tags are collected with [`dequeue`](Self::dequeue).
#[cfg_attr(test, mockall::automock)]
pub trait GdcDevice: Send + Sync {
    /// Prepare the engine for a new stream.
    fn stream_on(&self) -> Result<()> {
        Ok(())
    }

    /// Abort outstanding jobs; their tags are never reported.
    fn stream_off(&self) -> Result<()> {
        Ok(())
    }

    /// Submit `input` to be corrected into `output`.
    fn queue(&self, tag: u32, input: &Buffer, output: &Buffer) -> Result<()>;

    /// Wait up to `timeout` for a finished job. `None` means nothing finished.
    fn dequeue(&self, timeout: Duration) -> Result<Option<u32>>;

    /// Whether the engine hands results straight to the next hardware block.
    /// Without that path a stage must wait for each job before moving on.
    fn has_m2m_path(&self) -> bool;

    fn is_real_time_capable(&self) -> bool {
        true
    }
}
