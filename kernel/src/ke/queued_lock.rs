//! Queued Lock Implementation
//!
//! A queued (ticket) lock hands the lock out in strict arrival order.
//! Each acquirer draws a ticket and spins until the lock serves it, so
//! no waiter can be overtaken and starve.
//!
//! Unlike `SpinLock<T>` the queued lock protects no data of its own.
//! Owners of the lock wrap their state in an `UnsafeCell` and only touch
//! it while they hold the lock.
//!
//! # Lock hand-off
//!
//! `switch_from` releases one lock and acquires another in a single step
//! as seen by everyone else: the caller's ticket on the new lock is drawn
//! before the old lock is released. Any thread that acquires the old lock
//! afterwards already finds the caller queued on the new one.
//!
//! # Usage
//! ```ignore
//! let lock = KQueuedLock::new();
//! lock.acquire();
//! // ... critical section ...
//! lock.release();
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

/// A queued spinning lock without protected data
#[repr(C, align(8))]
pub struct KQueuedLock {
    /// Next ticket to hand out
    next_ticket: AtomicU32,
    /// Ticket currently owning the lock
    now_serving: AtomicU32,
}

impl KQueuedLock {
    /// Create a new unlocked queued lock
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, spinning until our ticket is served
    #[inline]
    pub fn acquire(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.wait_for_turn(ticket);
    }

    /// Try to acquire the lock without waiting
    ///
    /// Returns true if the lock was acquired. Never queues.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Acquire);
        self.next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Release the lock
    ///
    /// Must only be called by the current owner.
    #[inline]
    pub fn release(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    /// Queue on this lock, release `held`, then wait for our turn
    ///
    /// `held` must be owned by the caller and must not be this lock.
    pub fn switch_from(&self, held: &KQueuedLock) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        held.release();
        self.wait_for_turn(ticket);
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Number of threads queued behind the current owner
    pub fn waiter_count(&self) -> u32 {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.now_serving.load(Ordering::Relaxed);
        next.wrapping_sub(serving).saturating_sub(1)
    }

    #[inline]
    fn wait_for_turn(&self, ticket: u32) {
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
    }
}

impl Default for KQueuedLock {
    fn default() -> Self {
        Self::new()
    }
}
