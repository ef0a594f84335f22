//! The one wait primitive: spin on a condition until it yields or a deadline
//! passes.

use std::time::{Duration, Instant};
use thiserror::Error;

/// Spins before starting to yield the thread between polls.
const SPIN_ITERATIONS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {elapsed:?} (limit {timeout:?})")]
pub struct PollTimeout {
    pub timeout: Duration,
    pub elapsed: Duration,
}

/// Calls `op` until it returns `Ok(Some(_))`, an error, or `timeout` elapses.
///
/// `op` always runs at least once, and once more after the deadline is seen, so
/// a condition that became true while the thread was descheduled is not
/// reported as a timeout.
pub fn poll_until<T, E>(
    timeout: Duration,
    mut op: impl FnMut() -> Result<Option<T>, E>,
) -> Result<T, E>
where
    E: From<PollTimeout>,
{
    let start = Instant::now();
    let mut spins = 0u32;
    loop {
        if let Some(v) = op()? {
            return Ok(v);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            if let Some(v) = op()? {
                return Ok(v);
            }
            return Err(PollTimeout { timeout, elapsed }.into());
        }
        if spins < SPIN_ITERATIONS {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}
