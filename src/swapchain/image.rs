//! Swapchain image bookkeeping.
//!
//! The pool tracks each image's lifecycle status and, on the SHM path, its
//! in-flight completion count. It is shared between the application thread,
//! the present worker and the event pump, and doubles as the wait primitive
//! behind `get_free_buffer`: every state change that can unblock a waiter
//! signals the same condition variable the pump's run flag does.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle state of a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// Available to the application.
    Free,
    /// Handed out by acquire, being rendered to.
    Acquired,
    /// Submitted to the display server.
    Presented,
    /// Not usable; being created or torn down.
    Invalid,
}

/// Result of waiting for a free image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// An image is free.
    Ready,
    /// Poll found no free image.
    NotReady,
    /// The deadline elapsed without a free image.
    Timeout,
    /// The event pump stopped while waiting.
    OutOfDate,
}

/// Largest number of in-flight SHM completions per image.
pub const MAX_PENDING_COMPLETIONS: usize = 128;

#[derive(Debug, Clone, Copy)]
struct ImageSlot {
    status: ImageStatus,
    pending_completions: usize,
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<ImageSlot>,
    pump_running: bool,
}

/// Shared image status array plus the pump run flag.
#[derive(Debug)]
pub(crate) struct ImagePool {
    inner: Mutex<PoolInner>,
    cond: Condvar,
}

impl ImagePool {
    pub fn new(count: usize) -> ImagePool {
        ImagePool {
            inner: Mutex::new(PoolInner {
                slots: vec![
                    ImageSlot {
                        status: ImageStatus::Invalid,
                        pending_completions: 0,
                    };
                    count
                ],
                pump_running: true,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn status(&self, index: usize) -> ImageStatus {
        self.inner.lock().unwrap().slots[index].status
    }

    pub fn set_status(&self, index: usize, status: ImageStatus) {
        self.inner.lock().unwrap().slots[index].status = status;
        self.cond.notify_all();
    }

    /// Mark the first free image acquired and return its index.
    pub fn acquire_next_free(&self) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .slots
            .iter()
            .position(|slot| slot.status == ImageStatus::Free)?;
        inner.slots[index].status = ImageStatus::Acquired;

        Some(index)
    }

    /// Return a presented image to the free pool and wake waiters.
    pub fn release(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.slots[index].status != ImageStatus::Invalid {
            inner.slots[index].status = ImageStatus::Free;
        }
        drop(inner);
        self.cond.notify_all();
    }

    pub fn invalidate(&self, index: usize) {
        self.set_status(index, ImageStatus::Invalid);
    }

    pub fn free_image_found(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .any(|slot| slot.status == ImageStatus::Free)
    }

    /// Clear the pump run flag and wake everything blocked on the pool.
    pub fn stop(&self) {
        self.inner.lock().unwrap().pump_running = false;
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().pump_running
    }

    /// Wait for a free image. `0` polls, `u64::MAX` blocks, anything else is
    /// a deadline in nanoseconds.
    pub fn wait_free(&self, timeout_ns: u64) -> WaitResult {
        let mut inner = self.inner.lock().unwrap();

        let free = |inner: &PoolInner| {
            inner
                .slots
                .iter()
                .any(|slot| slot.status == ImageStatus::Free)
        };

        if timeout_ns == 0 {
            return if free(&inner) {
                WaitResult::Ready
            } else {
                WaitResult::NotReady
            };
        }

        if timeout_ns == u64::MAX {
            while !free(&inner) {
                if !inner.pump_running {
                    return WaitResult::OutOfDate;
                }
                inner = self.cond.wait(inner).unwrap();
            }
            return WaitResult::Ready;
        }

        let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
        while !free(&inner) {
            if !inner.pump_running {
                return WaitResult::OutOfDate;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return WaitResult::Timeout;
            };
            let (guard, timed_out) = self.cond.wait_timeout(inner, remaining).unwrap();
            inner = guard;
            if timed_out.timed_out() && !free(&inner) {
                return WaitResult::Timeout;
            }
        }

        WaitResult::Ready
    }

    /// Block until image `index` has a free completion slot.
    ///
    /// Returns `false` when the pump stopped while waiting.
    pub fn wait_completion_capacity(&self, index: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.slots[index].pending_completions == MAX_PENDING_COMPLETIONS {
            if !inner.pump_running {
                return false;
            }
            inner = self.cond.wait(inner).unwrap();
        }

        true
    }

    pub fn add_pending_completion(&self, index: usize) {
        self.inner.lock().unwrap().slots[index].pending_completions += 1;
        self.cond.notify_all();
    }

    pub fn complete_one(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let pending = &mut inner.slots[index].pending_completions;
        *pending = pending.saturating_sub(1);
        drop(inner);
        self.cond.notify_all();
    }

    pub fn any_pending_completions(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .any(|slot| slot.status != ImageStatus::Invalid && slot.pending_completions > 0)
    }

    /// Park the pump until there is something to drain or it is stopped.
    pub fn wait_any_pending(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.pump_running
            && !inner
                .slots
                .iter()
                .any(|slot| slot.status != ImageStatus::Invalid && slot.pending_completions > 0)
        {
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Sleep for the pump's tick interval, waking early on any pool signal.
    pub fn wait_tick(&self, tick: Duration) {
        let inner = self.inner.lock().unwrap();
        if inner.pump_running {
            let _ = self.cond.wait_timeout(inner, tick).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn pool_with_statuses(statuses: &[ImageStatus]) -> ImagePool {
        let pool = ImagePool::new(statuses.len());
        for (index, status) in statuses.iter().enumerate() {
            pool.set_status(index, *status);
        }
        pool
    }

    #[test]
    fn poll_does_not_block() {
        let pool = pool_with_statuses(&[ImageStatus::Presented, ImageStatus::Acquired]);
        assert_eq!(pool.wait_free(0), WaitResult::NotReady);
        pool.release(0);
        assert_eq!(pool.wait_free(0), WaitResult::Ready);
    }

    #[test]
    fn deadline_wait_times_out() {
        let pool = pool_with_statuses(&[ImageStatus::Presented]);
        assert_eq!(
            pool.wait_free(Duration::from_millis(10).as_nanos() as u64),
            WaitResult::Timeout
        );
    }

    #[test]
    fn release_wakes_a_blocking_waiter() {
        let pool = Arc::new(pool_with_statuses(&[ImageStatus::Presented]));
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.wait_free(u64::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(0);
        assert_eq!(waiter.join().unwrap(), WaitResult::Ready);
    }

    #[test]
    fn stopping_the_pump_fails_a_blocking_wait() {
        let pool = Arc::new(pool_with_statuses(&[ImageStatus::Presented]));
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.wait_free(u64::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        pool.stop();
        assert_eq!(waiter.join().unwrap(), WaitResult::OutOfDate);
    }

    #[test]
    fn acquire_takes_the_first_free_image() {
        let pool = pool_with_statuses(&[
            ImageStatus::Presented,
            ImageStatus::Free,
            ImageStatus::Free,
        ]);
        assert_eq!(pool.acquire_next_free(), Some(1));
        assert_eq!(pool.status(1), ImageStatus::Acquired);
        assert_eq!(pool.acquire_next_free(), Some(2));
        assert_eq!(pool.acquire_next_free(), None);
    }

    #[test]
    fn completion_cap_blocks_until_one_completes() {
        let pool = Arc::new(pool_with_statuses(&[ImageStatus::Free]));
        for _ in 0..MAX_PENDING_COMPLETIONS {
            pool.add_pending_completion(0);
        }

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.wait_completion_capacity(0))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        pool.complete_one(0);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn stopped_pump_aborts_a_capacity_wait() {
        let pool = Arc::new(pool_with_statuses(&[ImageStatus::Free]));
        for _ in 0..MAX_PENDING_COMPLETIONS {
            pool.add_pending_completion(0);
        }

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.wait_completion_capacity(0))
        };
        thread::sleep(Duration::from_millis(20));
        pool.stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn released_invalid_images_stay_invalid() {
        let pool = pool_with_statuses(&[ImageStatus::Invalid]);
        pool.release(0);
        assert_eq!(pool.status(0), ImageStatus::Invalid);
    }
}
