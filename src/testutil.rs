//! Process-wide test-mode flag, mirroring `yamc.config.TEST_MODE`.
//!
//! Set by the CLI's `--test` flag or directly by integration tests. While
//! set: the governor re-raises `ProviderError::Operational` instead of
//! swallowing it, and writers skip `do_write`/backlog persistence.

use std::sync::atomic::{AtomicBool, Ordering};

static TEST_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_test_mode(on: bool) {
    TEST_MODE.store(on, Ordering::SeqCst);
}

pub fn is_test_mode() -> bool {
    TEST_MODE.load(Ordering::SeqCst)
}

/// Sets test mode for the duration of the guard, restoring the previous
/// value on drop. Handy in tests that must not leak state to others.
pub struct TestModeGuard {
    previous: bool,
}

impl TestModeGuard {
    pub fn enable() -> Self {
        let previous = is_test_mode();
        set_test_mode(true);
        TestModeGuard { previous }
    }
}

impl Drop for TestModeGuard {
    fn drop(&mut self) {
        set_test_mode(self.previous);
    }
}
