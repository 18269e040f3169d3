//! A worker pool for pipelined batch processing.
//!
//! Stagepool runs a fixed pipeline of processing stages (for example
//! "transform, then demosaic, then color-convert") on one shared pool of OS
//! threads. Instead of putting a full barrier between stages, each stage, or
//! *level*, keeps a completion *watermark*: the highest unit index that is
//! certified finished. A downstream level may claim unit `i` as soon as the
//! watermark of the level above has moved far enough past `i`, so stages
//! overlap while every unit still sees finished input.
//!
//! The pool is driven by a small control protocol. The owner resets the work
//! counts for a batch, broadcasts [`Message::Start`], and waits for every
//! worker to report that it ran out of work. Workers stay alive between
//! batches and are retired with [`Message::Stop`].
//!
//! ```
//! use std::sync::Mutex;
//! use std::sync::Arc;
//!
//! use stagepool::{Claim, Message, ThreadPool};
//!
//! let rows = Arc::new(Mutex::new(Vec::new()));
//! let seen = rows.clone();
//!
//! let pool = ThreadPool::new(2, move |worker| {
//!     worker.serve(|worker| {
//!         while let Claim::Unit(row) = worker.claim_next()? {
//!             seen.lock().unwrap().push(row);
//!         }
//!         Ok(())
//!     })
//! })?;
//!
//! pool.reset_work_counts(&[4])?;
//! pool.send_message_to_all(Message::Start)?;
//! pool.wait_all_done()?;
//! pool.shutdown()?;
//!
//! let mut rows = rows.lock().unwrap().clone();
//! rows.sort();
//! assert_eq!(rows, [0, 1, 2, 3]);
//! # Ok::<(), stagepool::Error>(())
//! ```

#![no_std]

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

mod error;
mod event;
mod progress;
mod thread_pool;
mod tracker;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::Error;
pub use event::Event;
pub use progress::Backoff;
pub use thread_pool::Message;
pub use thread_pool::ThreadLimit;
pub use thread_pool::ThreadPool;
pub use thread_pool::ThreadPoolBuilder;
pub use thread_pool::Unit;
pub use thread_pool::Worker;
pub use tracker::Claim;
pub use tracker::LevelStatus;

/// The largest number of worker threads a pool may own.
pub const MAX_THREADS: usize = 32;

/// The number of pipeline levels tracked by every pool.
pub const LEVELS: usize = 8;

// -----------------------------------------------------------------------------
// Platform Support

// This crate uses `shuttle` for testing, which requires mocking all of the core
// threading primitives (`Mutex` and the like).
//
// To make things a bit simpler, we re-export all the important types in the
// `platform` module.

#[cfg(not(feature = "shuttle"))]
mod platform {

    // Core exports

    pub use alloc::sync::Arc;
    pub use core::sync::atomic::AtomicU32;
    pub use core::sync::atomic::Ordering;
    pub use std::sync::Condvar;
    pub use std::sync::Mutex;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread::available_parallelism;
    pub use std::thread::yield_now;

    // Spinning and sleeping

    pub fn spin_loop() {
        core::hint::spin_loop();
    }

    pub fn futex_wait(atomic: &AtomicU32, value: u32) {
        atomic_wait::wait(atomic, value);
    }

    pub fn futex_wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic);
    }

    // Core pinning

    pub fn pin_to_core(index: usize) -> bool {
        let Some(core_ids) = core_affinity::get_core_ids() else {
            return false;
        };
        if core_ids.is_empty() {
            return false;
        }
        core_affinity::set_for_current(core_ids[index % core_ids.len()])
    }
}

#[cfg(feature = "shuttle")]
mod platform {

    // Core exports

    pub use shuttle::sync::Arc;
    pub use shuttle::sync::Condvar;
    pub use shuttle::sync::Mutex;
    pub use shuttle::sync::atomic::AtomicU32;
    pub use shuttle::sync::atomic::Ordering;
    pub use shuttle::thread::Builder as ThreadBuilder;
    pub use shuttle::thread::JoinHandle;
    pub use shuttle::thread::yield_now;

    // Available parallelism

    pub fn available_parallelism() -> std::io::Result<core::num::NonZero<usize>> {
        panic!("available_parallelism does not work on shuttle");
    }

    // Spinning and sleeping
    //
    // Shuttle runs every thread on one OS thread, so nothing here may block
    // outside of shuttle's own primitives.

    pub fn spin_loop() {
        yield_now();
    }

    pub fn futex_wait(_atomic: &AtomicU32, _value: u32) {
        yield_now();
    }

    pub fn futex_wake_all(_atomic: &AtomicU32) {}

    // Core pinning

    pub fn pin_to_core(_index: usize) -> bool {
        false
    }
}
