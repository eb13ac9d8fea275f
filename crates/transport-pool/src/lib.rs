//! Buffer Pool (§4.3): a FIFO queue of buffer ids guarded by a single lock
//! and condition variable, with an external flushing flag used as a
//! cooperative cancellation signal for blocked `acquire` callers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use transport_error::TransportError;

struct PoolState {
    queue: VecDeque<u32>,
    flushing: bool,
}

pub struct BufferPool {
    state: Mutex<PoolState>,
    cv: Condvar,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState { queue: VecDeque::new(), flushing: false }),
            cv: Condvar::new(),
        }
    }

    /// Appends `buffer` to the tail of the available queue and wakes one
    /// waiter.
    pub fn add(&self, buffer: u32) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(buffer);
        drop(state);
        self.cv.notify_one();
    }

    /// Removes `buffer` from the available queue by identity if present.
    /// Never waits.
    pub fn remove(&self, buffer: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.queue.iter().position(|&b| b == buffer) {
            state.queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Waits for a buffer, an elapsed `timeout`, or a flush. `Err(Flushing)`
    /// beats a pending buffer: once flushing is observed, `acquire` returns
    /// it even if the queue is non-empty, per §4.3's "if flushing is set at
    /// any point, return FLUSHING". `Ok(None)` means `timeout` elapsed with
    /// nothing available; `timeout = None` waits indefinitely.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Option<u32>, TransportError> {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            if state.flushing {
                return Err(TransportError::Flushing);
            }
            if let Some(buffer) = state.queue.pop_front() {
                return Ok(Some(buffer));
            }
            state = match deadline {
                None => self.cv.wait(state).unwrap(),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Ok(None);
                    }
                    let (guard, result) = self.cv.wait_timeout(state, dl - now).unwrap();
                    if result.timed_out() && guard.queue.is_empty() && !guard.flushing {
                        return Ok(None);
                    }
                    guard
                }
            };
        }
    }

    /// Returns `buffer` to the tail of the available queue. Must not block
    /// (§4.3); the lock is only ever held for the duration of a queue push.
    pub fn release(&self, buffer: u32) {
        self.add(buffer);
    }

    /// Sets the flushing flag and wakes every waiter so each observes it on
    /// its next wakeup.
    pub fn start_flush(&self) {
        let mut state = self.state.lock().unwrap();
        state.flushing = true;
        let waiting_on = state.queue.len();
        drop(state);
        tracing::debug!(waiting_on, "buffer pool flush started");
        self.cv.notify_all();
    }

    pub fn stop_flush(&self) {
        self.state.lock().unwrap().flushing = false;
        tracing::debug!("buffer pool flush stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_then_acquire_returns_fifo_order() {
        let pool = BufferPool::new();
        pool.add(1);
        pool.add(2);
        assert_eq!(pool.acquire(None).unwrap(), Some(1));
        assert_eq!(pool.acquire(None).unwrap(), Some(2));
    }

    #[test]
    fn remove_by_identity_drops_only_that_buffer() {
        let pool = BufferPool::new();
        pool.add(1);
        pool.add(2);
        assert!(pool.remove(1));
        assert!(!pool.remove(1));
        assert_eq!(pool.acquire(None).unwrap(), Some(2));
    }

    #[test]
    fn acquire_with_timeout_on_empty_pool_returns_none() {
        let pool = BufferPool::new();
        let got = pool.acquire(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(got, None);
    }

    /// Scenario D (§8): blocked acquire returns FLUSHING, then a fresh
    /// buffer is available once flushing stops.
    #[test]
    fn scenario_d_pool_flush_unblocks_waiter_with_flushing() {
        let pool = Arc::new(BufferPool::new());
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(None))
        };

        // Give the waiter a moment to block on the condvar before flushing.
        thread::sleep(Duration::from_millis(20));
        pool.start_flush();
        assert!(matches!(waiter.join().unwrap(), Err(TransportError::Flushing)));

        pool.stop_flush();
        pool.add(7);
        assert_eq!(pool.acquire(None).unwrap(), Some(7));
    }

    #[test]
    fn double_add_without_release_is_visible_twice() {
        // The pool itself has no way to detect a double-release (§4.3: "a
        // caller bug"); this documents that it is not silently deduplicated.
        let pool = BufferPool::new();
        pool.add(1);
        pool.add(1);
        assert_eq!(pool.acquire(None).unwrap(), Some(1));
        assert_eq!(pool.acquire(None).unwrap(), Some(1));
    }
}
