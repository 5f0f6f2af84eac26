use crate::task::CancellationToken;
use std::{
    thread,
    time::{Duration, Instant},
};

/// How long a wait on the hardware may last.
#[derive(Clone, Copy, Debug)]
pub enum WaitLimit<'a> {
    /// Give up once the duration has elapsed. Used on the control endpoint, where the host is
    /// synchronously waiting for us.
    Deadline(Duration),
    /// Block until the condition holds or the token is cancelled.
    Cancellable(&'a CancellationToken),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitError {
    TimedOut,
    Cancelled,
}

/// Poll `condition` until it holds, or until `limit` is reached. The condition is always checked
/// at least once, and is checked before the limit on every iteration, so a condition that becomes
/// true at the same time as the limit is reached still succeeds.
pub fn wait_for<F>(limit: WaitLimit<'_>, mut condition: F) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
{
    let deadline = match limit {
        WaitLimit::Deadline(timeout) => Some(Instant::now() + timeout),
        WaitLimit::Cancellable(_) => None,
    };

    loop {
        if condition() {
            return Ok(());
        }

        match limit {
            WaitLimit::Deadline(_) => {
                if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                    return Err(WaitError::TimedOut);
                }
            }
            WaitLimit::Cancellable(token) => {
                if token.is_cancelled() {
                    return Err(WaitError::Cancelled);
                }
            }
        }

        thread::yield_now();
    }
}

/// Spin until `condition` holds. Only for hardware handshakes that complete within a few cycles
/// of being requested (e.g. the controller acknowledging a reset).
pub fn spin_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    while !condition() {
        core::hint::spin_loop();
    }
}
