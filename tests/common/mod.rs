//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use crossbeam_channel::Receiver;
use filterchain_rs::filter::Completion;
use filterchain_rs::types::Work;
use std::time::{Duration, Instant};

/// Upper bound for any single wait in a test
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Next work delivered to the owner, skipping error and flush messages
pub fn recv_done(rx: &Receiver<Completion>) -> Work {
    let deadline = Instant::now() + test_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Completion::Done { work, .. }) => return work,
            Ok(_) => continue,
            Err(e) => panic!("No completed work within {:?}: {}", test_timeout(), e),
        }
    }
}

/// Every message that arrives within `window`
pub fn drain_for(rx: &Receiver<Completion>, window: Duration) -> Vec<Completion> {
    let deadline = Instant::now() + window;
    let mut messages = Vec::new();
    while let Ok(msg) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        messages.push(msg);
    }
    messages
}

/// Poll `cond` until it holds or the test timeout elapses
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
