//! Deadline-bounded wait on a blocking event.
//!
//! The underlying event wait cannot be interrupted, so it runs on a helper
//! thread and the caller waits for its result until an absolute deadline.
//! A result arriving after the deadline is discarded together with the
//! helper.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{CoprocError, Result};
use crate::hal::ReadyEvent;

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event fired before the deadline.
    Ready,
    /// The deadline passed first.
    TimedOut,
}

type Slot = Arc<(Mutex<Option<Result<()>>>, Condvar)>;

/// Wait for `event` for at most `timeout`.
pub fn wait_bounded<E: ReadyEvent>(event: &E, timeout: Duration) -> Result<WaitOutcome> {
    let deadline = Instant::now() + timeout;
    let slot: Slot = Arc::new((Mutex::new(None), Condvar::new()));

    let helper_slot = Arc::clone(&slot);
    let helper_event = event.clone();
    thread::Builder::new()
        .name("coproc-event-wait".into())
        .spawn(move || {
            let result = helper_event.wait();
            let (lock, cvar) = &*helper_slot;
            *lock.lock() = Some(result);
            cvar.notify_one();
        })?;

    let (lock, cvar) = &*slot;
    let mut result = lock.lock();
    while result.is_none() {
        if cvar.wait_until(&mut result, deadline).timed_out() {
            break;
        }
    }

    match result.take() {
        Some(Ok(())) => Ok(WaitOutcome::Ready),
        Some(Err(err)) => Err(err),
        None => {
            debug!(?timeout, "Event wait deadline passed");
            Ok(WaitOutcome::TimedOut)
        }
    }
}

/// Like [`wait_bounded`], but a timeout is an error.
pub fn wait_or_timeout<E: ReadyEvent>(event: &E, timeout: Duration) -> Result<()> {
    match wait_bounded(event, timeout)? {
        WaitOutcome::Ready => Ok(()),
        WaitOutcome::TimedOut => Err(CoprocError::HandshakeTimeout { timeout }),
    }
}
