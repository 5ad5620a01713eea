//! Thread Wait Blocks
//!
//! A wait block is the rendezvous between one blocked thread and the
//! thread that will wake it. The waiter:
//!
//! 1. creates a wait block (the thread is now "about to block"),
//! 2. publishes it somewhere a waker will find it, under some lock,
//! 3. drops that lock,
//! 4. blocks on the wait block.
//!
//! A waker that finds the block unblocks it exactly once. An unblock that
//! lands between steps 3 and 4 is not lost: the block stays signaled and
//! the waiter returns from `block` immediately.
//!
//! # NT Compatibility
//! Plays the role of a KWAIT_BLOCK on a private synchronization event.

use core::sync::atomic::{AtomicBool, Ordering};

/// Single-use wait block
pub struct KWaitBlock {
    /// Set once the waiter may continue
    signaled: AtomicBool,
}

impl KWaitBlock {
    /// Create an unsignaled wait block
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    /// Block the calling thread until the wait block is signaled
    pub fn block(&self) {
        while !self.signaled.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    /// Signal the wait block, releasing the blocked thread
    pub fn unblock(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    /// Check if the wait block has been signaled
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

impl Default for KWaitBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unblock_before_block_is_not_lost() {
        let wait_block = KWaitBlock::new();
        wait_block.unblock();
        wait_block.block();
        assert!(wait_block.is_signaled());
    }

    #[test]
    fn test_block_until_unblocked() {
        let wait_block = Arc::new(KWaitBlock::new());

        let handle = {
            let wait_block = Arc::clone(&wait_block);
            thread::spawn(move || {
                wait_block.block();
                wait_block.is_signaled()
            })
        };

        assert!(!wait_block.is_signaled());
        wait_block.unblock();
        assert!(handle.join().unwrap());
    }
}
