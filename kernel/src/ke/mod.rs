//! Kernel Executive (ke)
//!
//! Low-level primitives the memory manager is built on:
//!
//! - **Queued Locks**: FIFO spinning locks with lock hand-off
//! - **Wait Blocks**: block/unblock rendezvous for sleeping threads
//! - **Bug Check**: fatal invariant reporting (STOP codes)

pub mod bugcheck;
pub mod queued_lock;
pub mod wait;

pub use bugcheck::{ke_bugcheck, ke_bugcheck_ex, BugCheckData};
pub use queued_lock::KQueuedLock;
pub use wait::KWaitBlock;
