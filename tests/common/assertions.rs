// Polling assertions for integration tests

use std::thread;
use std::time::{Duration, Instant};

/// Default patience of [`assert_eventually`].
pub const EVENTUALLY: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, panicking with `what` after `timeout`.
pub fn assert_eventually<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out after {:?} waiting for {}", timeout, what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}
