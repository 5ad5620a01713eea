//! VM Cache Subsystem
//!
//! The virtual memory cache layer of the kernel: the objects that own the
//! physical pages backing a range of address space, chained into
//! copy-on-write hierarchies of consumers and sources.
//!
//! # Layers
//!
//! - `ke`: kernel executive primitives (queued locks, wait blocks, bug checks)
//! - `mm`: the memory manager (page frame database, areas, caches, writeback)
//!
//! The crate is `no_std` + `alloc`. It never installs a logger; all
//! diagnostics go through the `log` facade.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ke;
pub mod mm;
