//! At-most-once terminal delivery.

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot latch: only the first caller of [`TerminalLatch::try_acquire`] wins.
///
/// Every path that could end a session (normal exhaustion, fault, cancellation,
/// dropping an unrun session) must acquire the latch before notifying the sink.
#[derive(Debug, Default)]
pub struct TerminalLatch {
    fired: AtomicBool,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once.
    pub fn try_acquire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
