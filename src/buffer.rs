//! Hardware-backed buffer handles.
//!
//! A [`Buffer`] is a cheap, cloneable handle. Clones share one allocation and
//! one identity; the allocation is returned to its owner through destroy
//! notifications once the last handle (including any held on behalf of the
//! hardware) goes away.

use crate::sync::lock;
use crate::types::{ParamBag, ParamValue};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique buffer identity. The only key used to correlate
/// completions across threads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pixel layouts the stages care about. Size arithmetic lives elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    P010,
    Rgba8888,
    /// Compressed (SBWC-style) layout; opaque to the core.
    Compressed,
}

/// Backing memory description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMemory {
    Linear { capacity: usize },
    Graphic { width: u32, height: u32, format: PixelFormat },
}

/// Image metadata attached to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub crop: Option<(u32, u32, u32, u32)>,
    pub timestamp_us: u64,
}

/// Buffer flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags {
    /// Shares memory with another buffer but has its own identity.
    pub replica: bool,
    /// Carries codec configuration only, no picture.
    pub config_only: bool,
    /// Currently mapped into CPU address space.
    pub mapped: bool,
}

/// Descriptor handed to the hardware when it takes the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwHandoff {
    /// Platform handle (dmabuf fd, ion handle...).
    pub handle: i64,
    pub planes: u8,
    /// Tag assigned by the hardware queue, if any.
    pub tag: Option<u32>,
}

type DestroyNotify = Box<dyn FnOnce(BufferId) + Send>;

struct BufferInner {
    id: BufferId,
    memory: BufferMemory,
    info: Mutex<ImageInfo>,
    flags: Mutex<BufferFlags>,
    params: Mutex<ParamBag>,
    handoff: Mutex<Option<HwHandoff>>,
    on_destroy: Mutex<Vec<DestroyNotify>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let notifies = match self.on_destroy.get_mut() {
            Ok(list) => std::mem::take(list),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for notify in notifies {
            notify(self.id);
        }
    }
}

/// Shared handle to hardware-backed memory.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

impl Buffer {
    pub fn new(memory: BufferMemory) -> Self {
        let info = match memory {
            BufferMemory::Graphic { width, height, .. } => ImageInfo {
                width,
                height,
                ..Default::default()
            },
            BufferMemory::Linear { .. } => ImageInfo::default(),
        };
        Self(Arc::new(BufferInner {
            id: BufferId::next(),
            memory,
            info: Mutex::new(info),
            flags: Mutex::new(BufferFlags::default()),
            params: Mutex::new(ParamBag::new()),
            handoff: Mutex::new(None),
            on_destroy: Mutex::new(Vec::new()),
        }))
    }

    pub fn linear(capacity: usize) -> Self {
        Self::new(BufferMemory::Linear { capacity })
    }

    pub fn graphic(width: u32, height: u32, format: PixelFormat) -> Self {
        Self::new(BufferMemory::Graphic {
            width,
            height,
            format,
        })
    }

    /// A new identity over the same memory description and metadata.
    pub fn replica(&self) -> Self {
        let copy = Self::new(self.0.memory);
        *lock(&copy.0.info) = self.info();
        *lock(&copy.0.params) = self.params();
        let mut flags = self.flags();
        flags.replica = true;
        *lock(&copy.0.flags) = flags;
        copy
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn memory(&self) -> BufferMemory {
        self.0.memory
    }

    pub fn info(&self) -> ImageInfo {
        *lock(&self.0.info)
    }

    pub fn set_info(&self, info: ImageInfo) {
        *lock(&self.0.info) = info;
    }

    pub fn flags(&self) -> BufferFlags {
        *lock(&self.0.flags)
    }

    pub fn set_flags(&self, flags: BufferFlags) {
        *lock(&self.0.flags) = flags;
    }

    pub fn is_config_only(&self) -> bool {
        self.flags().config_only
    }

    /// Snapshot of the parameter bag.
    pub fn params(&self) -> ParamBag {
        lock(&self.0.params).clone()
    }

    pub fn param(&self, key: &str) -> Option<ParamValue> {
        lock(&self.0.params).get(key).cloned()
    }

    pub fn set_param(&self, key: impl Into<String>, value: ParamValue) {
        lock(&self.0.params).insert(key.into(), value);
    }

    /// Merge `bag` into this buffer's parameters; entries in `bag` win.
    pub fn merge_params(&self, bag: &ParamBag) {
        let mut params = lock(&self.0.params);
        for (k, v) in bag {
            params.insert(k.clone(), v.clone());
        }
    }

    pub fn handoff(&self) -> Option<HwHandoff> {
        *lock(&self.0.handoff)
    }

    pub fn set_handoff(&self, handoff: Option<HwHandoff>) {
        *lock(&self.0.handoff) = handoff;
    }

    /// Register a callback run exactly once when the memory is finally released.
    pub fn add_destroy_notify(&self, notify: impl FnOnce(BufferId) + Send + 'static) {
        lock(&self.0.on_destroy).push(Box::new(notify));
    }

    /// Number of live handles, hardware-held ones included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn same_as(&self, other: &Buffer) -> bool {
        self.0.id == other.0.id
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.0.id)
            .field("memory", &self.0.memory)
            .field("flags", &self.flags())
            .finish()
    }
}
