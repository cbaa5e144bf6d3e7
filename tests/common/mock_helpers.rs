//! Mock construction helpers

use crossbeam_channel::Receiver;
use filterchain_rs::buffer::Buffer;
use filterchain_rs::chain::BufferAllocator;
use filterchain_rs::error::{ErrorKind, Result};
use filterchain_rs::filter::{ChannelListener, Completion, FilterId, FilterListener};
use filterchain_rs::hw::GdcDevice;
use filterchain_rs::types::{AllocArg, AllocMode, AllocResult, Work};
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Listener {}

    impl FilterListener for Listener {
        fn on_work_done(&self, from: FilterId, work: Work);
        fn on_error(&self, from: FilterId, kind: ErrorKind);
        fn on_works_flushed(&self, from: FilterId, works: Vec<Work>);
    }
}

mock! {
    pub Allocator {}

    impl BufferAllocator for Allocator {
        fn allocate(&self, arg: &AllocArg) -> AllocResult;
        fn set_mode(&self, mode: AllocMode);
    }
}

mock! {
    pub Gdc {}

    impl GdcDevice for Gdc {
        fn stream_on(&self) -> Result<()>;
        fn stream_off(&self) -> Result<()>;
        fn queue(&self, tag: u32, input: &Buffer, output: &Buffer) -> Result<()>;
        fn dequeue(&self, timeout: Duration) -> Result<Option<u32>>;
        fn has_m2m_path(&self) -> bool;
        fn is_real_time_capable(&self) -> bool;
    }
}

/// Mailbox listener with room for every message a test produces
pub fn create_test_listener() -> (Arc<ChannelListener>, Receiver<Completion>) {
    ChannelListener::new(64)
}

/// Allocator handing out linear buffers without limit
pub fn unlimited_allocator() -> Arc<dyn BufferAllocator> {
    let mut alloc = MockAllocator::new();
    alloc
        .expect_allocate()
        .returning(|_| Ok(Buffer::linear(16)));
    alloc.expect_set_mode().return_const(());
    Arc::new(alloc)
}

/// GDC device whose dequeue never reports a finished job
pub fn idle_gdc() -> MockGdc {
    let mut gdc = MockGdc::new();
    gdc.expect_stream_on().returning(|| Ok(()));
    gdc.expect_stream_off().returning(|| Ok(()));
    gdc.expect_has_m2m_path().return_const(true);
    gdc.expect_is_real_time_capable().return_const(true);
    gdc.expect_dequeue().returning(|timeout| {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    });
    gdc
}
