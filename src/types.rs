//! Core data types shared by every stage
//!
//! - [`Work`]: the unit of buffers in flight between stages
//! - [`ParamValue`] / [`ParamBag`]: opaque per-buffer parameters
//! - [`AllocArg`] / [`AllocError`]: the allocator request/response contract
//! - [`OutputKind`] / [`AllocMode`]: small policy enums

use crate::buffer::{Buffer, BufferId, PixelFormat};
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ==================== Parameters ====================

/// A single per-buffer parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Opaque parameter bag carried by buffers and queued per input.
pub type ParamBag = BTreeMap<String, ParamValue>;

// ==================== Work ====================

/// Completion status of a work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkStatus {
    #[default]
    Ok,
    Failed(ErrorKind),
}

/// Ordered buffers in flight, owned by exactly one stage at a time.
///
/// `buffers[..input_index]` has been consumed by some stage;
/// `buffers[input_index..]` is what the next stage will process.
#[derive(Debug, Default)]
pub struct Work {
    pub buffers: Vec<Buffer>,
    pub input_index: usize,
    /// End-of-stream marker travelling with the last work.
    pub drain: bool,
    pub frame_index: u64,
    pub status: WorkStatus,
}

impl Work {
    pub fn new(frame_index: u64, buffers: Vec<Buffer>) -> Self {
        Self {
            buffers,
            frame_index,
            ..Default::default()
        }
    }

    pub fn with_drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }

    /// Buffers the next stage still has to process.
    pub fn unconsumed(&self) -> &[Buffer] {
        let start = self.input_index.min(self.buffers.len());
        &self.buffers[start..]
    }

    pub fn unconsumed_count(&self) -> usize {
        self.buffers.len().saturating_sub(self.input_index)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.iter().any(|b| b.id() == id)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, WorkStatus::Failed(_))
    }

    pub fn fail(&mut self, kind: ErrorKind) {
        self.status = WorkStatus::Failed(kind);
    }
}

// ==================== Output policy ====================

/// How a completion relates to the input that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// Last (or only) output for the input.
    #[default]
    Single,
    /// More outputs for the same input will follow.
    Multi,
}

// ==================== Allocation ====================

/// Buffer usage bits passed through to the platform allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferUsage(pub u64);

impl BufferUsage {
    pub const CPU_READ: BufferUsage = BufferUsage(1 << 0);
    pub const CPU_WRITE: BufferUsage = BufferUsage(1 << 1);
    pub const HW_CODEC: BufferUsage = BufferUsage(1 << 2);
    pub const HW_GDC: BufferUsage = BufferUsage(1 << 3);
    pub const PROTECTED: BufferUsage = BufferUsage(1 << 4);

    pub fn contains(self, other: BufferUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: BufferUsage) -> BufferUsage {
        BufferUsage(self.0 | other.0)
    }
}

impl fmt::Display for BufferUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Shape of a requested buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocShape {
    Linear { capacity: usize },
    Graphic { width: u32, height: u32, format: PixelFormat },
}

/// Predicate reporting whether the caller's own allocation limit is reached.
pub type LimitPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A buffer request.
#[derive(Clone)]
pub struct AllocArg {
    pub shape: AllocShape,
    pub usage: BufferUsage,
    /// Upper bound on buffers outstanding from this request's pool.
    pub max_count: Option<usize>,
    /// When it returns true the allocator must answer TryAgain.
    pub limit: Option<LimitPredicate>,
}

impl AllocArg {
    pub fn linear(capacity: usize, usage: BufferUsage) -> Self {
        Self {
            shape: AllocShape::Linear { capacity },
            usage,
            max_count: None,
            limit: None,
        }
    }

    pub fn graphic(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            shape: AllocShape::Graphic {
                width,
                height,
                format,
            },
            usage,
            max_count: None,
            limit: None,
        }
    }

    pub fn with_max_count(mut self, max: usize) -> Self {
        self.max_count = Some(max);
        self
    }

    pub fn with_limit(mut self, limit: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.limit = Some(Arc::new(limit));
        self
    }

    pub fn limit_reached(&self) -> bool {
        self.limit.as_ref().map(|f| f()).unwrap_or(false)
    }
}

impl fmt::Debug for AllocArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocArg")
            .field("shape", &self.shape)
            .field("usage", &self.usage)
            .field("max_count", &self.max_count)
            .field("limit", &self.limit.is_some())
            .finish()
    }
}

/// Allocator failures. Only `TryAgain` is retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocation should be retried")]
    TryAgain,
    #[error("out of memory")]
    NoMemory,
    #[error("bad allocation arguments")]
    BadValue,
    #[error("allocation refused")]
    Refused,
}

pub type AllocResult = std::result::Result<Buffer, AllocError>;

/// Whether a stage's pool should favour throughput or footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocMode {
    #[default]
    PreferPerformance,
    PreferResources,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconsumed_tracks_cursor() {
        let mut work = Work::new(0, vec![Buffer::linear(1), Buffer::linear(2)]);
        assert_eq!(work.unconsumed_count(), 2);
        work.input_index = 1;
        assert_eq!(work.unconsumed().len(), 1);
        work.input_index = 5;
        assert_eq!(work.unconsumed_count(), 0);
        assert!(work.unconsumed().is_empty());
    }

    #[test]
    fn test_fail_marks_status() {
        let mut work = Work::new(7, Vec::new());
        assert!(!work.is_failed());
        work.fail(ErrorKind::BadState);
        assert_eq!(work.status, WorkStatus::Failed(ErrorKind::BadState));
    }

    #[test]
    fn test_usage_bits() {
        let usage = BufferUsage::HW_CODEC.union(BufferUsage::CPU_READ);
        assert!(usage.contains(BufferUsage::HW_CODEC));
        assert!(!usage.contains(BufferUsage::PROTECTED));
        assert_eq!(usage.to_string(), "0x5");
    }

    #[test]
    fn test_alloc_limit_predicate() {
        let arg = AllocArg::linear(64, BufferUsage::CPU_READ);
        assert!(!arg.limit_reached());
        let arg = arg.with_limit(|| true);
        assert!(arg.limit_reached());
    }

    #[test]
    fn test_param_value_untagged() {
        let bag: ParamBag = serde_json::from_str(r#"{"outputs": 2, "enabled": true}"#).unwrap();
        assert_eq!(bag["outputs"].as_int(), Some(2));
        assert_eq!(bag["enabled"].as_bool(), Some(true));
    }
}
