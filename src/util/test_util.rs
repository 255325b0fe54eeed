use std::panic;
use std::sync::Mutex;

lazy_static! {
    // A global lock to force tests that touch process-wide allocator state
    // to run one at a time.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Runs `f` while holding the serial-test lock.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // A poisoned lock just means an earlier test failed; keep going.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Always runs the cleanup closure, whether or not the test panics.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}
