//! Stage kinds and the descriptors a chain is built from.

use crate::error::Result;
use crate::filter::Filter;
use crate::types::BufferUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Types of stages that can be instantiated from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StageKind {
    /// Hands every buffer to the next stage untouched.
    #[default]
    Passthrough,
    /// Produces several outputs per input.
    Splitter,
    /// Geometric distortion correction on dedicated hardware.
    Gdc,
}

impl StageKind {
    /// Get the display name for this stage kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::Passthrough => "Passthrough",
            StageKind::Splitter => "Splitter",
            StageKind::Gdc => "GDC",
        }
    }

    /// Get all available stage kinds.
    pub fn all() -> &'static [StageKind] {
        &[StageKind::Passthrough, StageKind::Splitter, StageKind::Gdc]
    }

    /// Whether the stage allocates output buffers.
    pub fn needs_allocator(&self) -> bool {
        matches!(self, StageKind::Splitter | StageKind::Gdc)
    }

    /// Get a detailed description of what this stage does.
    pub fn description(&self) -> &'static str {
        match self {
            StageKind::Passthrough => {
                "Bypasses every buffer.\n\
                 Useful as a chain head or a placeholder."
            }

            StageKind::Splitter => {
                "Allocates `outputs` buffers per input.\n\
                 All but the last are reported as multi-output.\n\
                 Falls back to bypass when allocation fails."
            }

            StageKind::Gdc => {
                "Offloads each buffer to the GDC engine.\n\
                 Completions arrive out of order, matched by tag.\n\
                 Config-only buffers and disabled correction bypass."
            }
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Builds one stage given its name.
pub type FilterFactory = Box<dyn FnOnce(&str) -> Result<Arc<dyn Filter>> + Send>;

/// Everything the chain needs to construct and provision one stage.
pub struct FilterDescriptor {
    pub name: String,
    pub factory: FilterFactory,
    /// Block pool the stage's allocator comes from; the chain default if unset
    pub allocator_store_id: Option<u64>,
    pub usage: BufferUsage,
}

impl FilterDescriptor {
    pub fn new(
        name: impl Into<String>,
        factory: impl FnOnce(&str) -> Result<Arc<dyn Filter>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            allocator_store_id: None,
            usage: BufferUsage::CPU_READ,
        }
    }

    pub fn with_store(mut self, store_id: Option<u64>) -> Self {
        self.allocator_store_id = store_id;
        self
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }
}

impl fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("name", &self.name)
            .field("allocator_store_id", &self.allocator_store_id)
            .field("usage", &self.usage)
            .finish()
    }
}
