// The single process-wide write lock. At most one writer transaction holds
// it at a time; waiters queue FIFO and can time out or be cancelled while
// waiting.

use crate::error::{DbError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cheaply cloneable flag a caller can use to abandon a wait in progress.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct State {
    held: bool,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

pub struct WriteLock {
    state: Mutex<State>,
    cv: Condvar,
}

impl WriteLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { held: false, waiters: VecDeque::new(), next_ticket: 0 }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until the lock is free and this caller is next in line, or
    /// `timeout` elapses, or `cancel` is signalled.
    pub fn acquire(self: &Arc<Self>, timeout: Duration, cancel: &CancellationToken) -> Result<WriteLockGuard> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }

        let mut st = self.state.lock();
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.waiters.push_back(ticket);

        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if cancel.is_cancelled() {
                st.waiters.retain(|t| *t != ticket);
                return Err(DbError::Cancelled);
            }
            if !st.held && st.waiters.front() == Some(&ticket) {
                st.held = true;
                st.waiters.pop_front();
                return Ok(WriteLockGuard { lock: Arc::clone(self) });
            }
            let now = Instant::now();
            if now >= deadline {
                st.waiters.retain(|t| *t != ticket);
                return Err(DbError::WriteLockTimeout { waited_ms: started.elapsed().as_millis() as u64 });
            }
            self.cv.wait_for(&mut st, deadline - now);
        }
    }

    fn release(&self) {
        let mut st = self.state.lock();
        st.held = false;
        self.cv.notify_all();
    }
}

impl Default for WriteLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WriteLockGuard {
    lock: Arc<WriteLock>,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn second_acquire_waits_for_release() {
        let lock = StdArc::new(WriteLock::new());
        let token = CancellationToken::new();
        let guard = lock.acquire(Duration::from_secs(1), &token).unwrap();

        let lock2 = StdArc::clone(&lock);
        let handle = thread::spawn(move || {
            let token = CancellationToken::new();
            lock2.acquire(Duration::from_secs(1), &token).is_ok()
        });

        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn times_out_when_held_too_long() {
        let lock = StdArc::new(WriteLock::new());
        let token = CancellationToken::new();
        let _guard = lock.acquire(Duration::from_millis(100), &token).unwrap();
        let err = lock.acquire(Duration::from_millis(20), &token).unwrap_err();
        assert!(matches!(err, DbError::WriteLockTimeout { .. }));
    }

    #[test]
    fn cancelled_token_fails_fast() {
        let lock = StdArc::new(WriteLock::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = lock.acquire(Duration::from_secs(5), &token).unwrap_err();
        assert!(matches!(err, DbError::Cancelled));
    }
}
