#![allow(unsafe_code)]
//! Consumer wake-up for the web preview segment.
//!
//! After each buffer the publisher reads how many consumers are blocked and
//! releases exactly that many. This is best effort: a consumer that starts
//! waiting between the count and the release misses that cycle and is woken
//! by the next one. The notifier only wakes consumers; it does not guard the
//! ring buffer contents.

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Wakes preview consumers once per published buffer.
pub trait ConsumerNotifier: Send {
    /// Release every consumer currently waiting. Returns how many were released.
    fn notify_waiting(&self) -> Result<u32>;

    /// Consumer side: wait for the next release, or until `timeout` passes.
    ///
    /// Returns `false` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Destroy the underlying resource at session end.
    fn remove(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<N: ConsumerNotifier + ?Sized> ConsumerNotifier for Box<N> {
    fn notify_waiting(&self) -> Result<u32> {
        (**self).notify_waiting()
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        (**self).wait(timeout)
    }

    fn remove(&mut self) -> Result<()> {
        (**self).remove()
    }
}

/// Semaphore index reserved for consumers locking a consistent read.
pub const DATA_SEM: u16 = 0;
/// Semaphore index consumers block on.
pub const WAIT_SEM: u16 = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// SysV semaphore set shared with consumers in other processes.
pub struct SemaphoreNotifier {
    key: i32,
    id: i32,
    owner: bool,
}

impl SemaphoreNotifier {
    /// Create (or reuse) the semaphore set for `key` and reset it.
    pub fn create(key: i32) -> Result<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let id = unsafe { libc::semget(key, 2, libc::IPC_CREAT | 0o666) };
        if id < 0 {
            bail!("semget({:#x}) failed: {}", key, io::Error::last_os_error());
        }
        let notifier = Self { key, id, owner: true };
        notifier.set(DATA_SEM, 1)?;
        notifier.set(WAIT_SEM, 0)?;
        debug!(key, id, "Created preview semaphore set");
        Ok(notifier)
    }

    /// Attach to an existing semaphore set without creating it.
    pub fn open(key: i32) -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let id = unsafe { libc::semget(key, 2, 0) };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            key,
            id,
            owner: false,
        })
    }

    /// IPC key of the set.
    pub fn key(&self) -> i32 {
        self.key
    }

    fn set(&self, sem: u16, value: i32) -> Result<()> {
        // SAFETY: SETVAL takes the value as the variadic semun argument.
        let rc = unsafe { libc::semctl(self.id, i32::from(sem), libc::SETVAL, value) };
        if rc < 0 {
            bail!("semctl(SETVAL) failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    fn waiting(&self) -> Result<u32> {
        // SAFETY: GETNCNT takes no extra argument.
        let count = unsafe { libc::semctl(self.id, i32::from(WAIT_SEM), libc::GETNCNT) };
        if count < 0 {
            bail!("semctl(GETNCNT) failed: {}", io::Error::last_os_error());
        }
        Ok(count as u32)
    }

    fn decrement(&self, flags: i16) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: WAIT_SEM,
            sem_op: -1,
            sem_flg: flags,
        };
        // SAFETY: `op` is a valid sembuf for the duration of the call.
        let rc = unsafe { libc::semop(self.id, &mut op, 1) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ConsumerNotifier for SemaphoreNotifier {
    fn notify_waiting(&self) -> Result<u32> {
        let waiting = self.waiting()?;
        self.set(WAIT_SEM, waiting as i32)?;
        Ok(waiting)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let Some(timeout) = timeout else {
            self.decrement(0)?;
            return Ok(true);
        };

        // Polling consumers are not counted as waiting, so a release is only
        // observed if it happens to be pending.
        let deadline = Instant::now() + timeout;
        loop {
            match self.decrement(libc::IPC_NOWAIT as i16) {
                Ok(()) => return Ok(true),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn remove(&mut self) -> Result<()> {
        if !self.owner {
            return Ok(());
        }
        // SAFETY: IPC_RMID takes no extra argument.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc < 0 {
            bail!("semctl(IPC_RMID) failed: {}", io::Error::last_os_error());
        }
        self.owner = false;
        debug!(key = self.key, "Removed preview semaphore set");
        Ok(())
    }
}

#[derive(Default)]
struct WaitState {
    waiting: u32,
    permits: u32,
}

/// Process-local notifier with the same counting semantics as the semaphore.
#[derive(Clone, Default)]
pub struct InProcessNotifier {
    inner: Arc<(Mutex<WaitState>, Condvar)>,
}

impl InProcessNotifier {
    /// Create a notifier with no waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumers currently blocked in [`wait`](ConsumerNotifier::wait).
    pub fn waiting(&self) -> u32 {
        self.inner.0.lock().waiting
    }
}

impl ConsumerNotifier for InProcessNotifier {
    fn notify_waiting(&self) -> Result<u32> {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.permits = state.waiting;
        let released = state.permits;
        cvar.notify_all();
        Ok(released)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.waiting += 1;
        let deadline = timeout.map(|t| Instant::now() + t);

        while state.permits == 0 {
            match deadline {
                Some(deadline) => {
                    if cvar.wait_until(&mut state, deadline).timed_out() && state.permits == 0 {
                        state.waiting -= 1;
                        return Ok(false);
                    }
                }
                None => cvar.wait(&mut state),
            }
        }

        state.permits -= 1;
        state.waiting -= 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::thread;

    #[test]
    fn test_in_process_release() {
        let notifier = InProcessNotifier::new();
        assert_eq!(notifier.notify_waiting().unwrap(), 0);

        let consumer = notifier.clone();
        let handle = thread::spawn(move || consumer.wait(Some(Duration::from_secs(5))).unwrap());

        while notifier.waiting() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(notifier.notify_waiting().unwrap(), 1);
        assert!(handle.join().unwrap());
        assert_eq!(notifier.waiting(), 0);
    }

    #[test]
    fn test_in_process_timeout() {
        let notifier = InProcessNotifier::new();
        assert!(!notifier.wait(Some(Duration::from_millis(20))).unwrap());
        assert_eq!(notifier.waiting(), 0);
    }

    #[test]
    #[serial]
    fn test_semaphore_release() {
        let key = 0x0D1A_0000 | (std::process::id() as i32 & 0xFFFF);
        let Ok(mut publisher) = SemaphoreNotifier::create(key) else {
            // SysV IPC unavailable in this environment
            return;
        };
        assert_eq!(publisher.notify_waiting().unwrap(), 0);

        let consumer = SemaphoreNotifier::open(key).unwrap();
        let handle = thread::spawn(move || consumer.wait(None).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut released = 0;
        while released == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
            released = publisher.notify_waiting().unwrap();
        }
        assert_eq!(released, 1);
        assert!(handle.join().unwrap());

        publisher.remove().unwrap();
        assert!(SemaphoreNotifier::open(key).is_err());
    }
}
