//! Errors reported by the pool and its primitives.

use alloc::string::String;
use std::io;

use thiserror::Error;

/// Failures reported by pool operations.
///
/// Running out of work is not an error; see [`Claim`](crate::Claim) for the
/// `NoWork` and `NoWorkYet` outcomes. Every variant here except
/// `InvalidArgument` and `BadState` means the pool must be shut down rather
/// than reused.
#[derive(Debug, Error)]
pub enum Error {
    /// The operating system refused to spawn a worker thread.
    #[error("failed to create worker thread: {0}")]
    CreateFailed(#[source] io::Error),

    /// A worker thread could not be joined, usually because it panicked.
    #[error("failed to join worker thread {index}")]
    JoinFailed {
        /// The identity of the worker that ran on the thread.
        index: usize,
    },

    /// A thread index, level, or count was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Waiting on an event failed because its lock was poisoned.
    #[error("event wait failed")]
    WaitFailed,

    /// The operation is not valid in the pool's current state.
    #[error("bad state: {0}")]
    BadState(&'static str),

    /// The pool lock was poisoned by a panicking thread.
    #[error("pool state lock poisoned")]
    Poisoned,

    /// A worker proc returned an error or panicked.
    #[error("worker {index} failed")]
    WorkerFailed {
        /// The identity of the failed worker.
        index: usize,
    },
}
