//! Retry policy for claims that are not admitted yet.

use crate::platform::*;

// -----------------------------------------------------------------------------
// Backoff

/// What a worker does after every level it scanned answered
/// [`Claim::NoWorkYet`](crate::Claim::NoWorkYet).
///
/// Claims never block, so waiting on an upstream level is up to the caller.
/// [`Worker::next_unit`](crate::Worker::next_unit) applies one of these
/// policies between scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Rescan immediately, with a processor spin hint. Lowest latency, but
    /// burns a core while the upstream level catches up.
    Spin,
    /// Yield the rest of the time slice to the OS scheduler before rescanning.
    Yield,
    /// Sleep until the pool records progress: a watermark advancing, a level
    /// running out of unclaimed work, or the work counts changing.
    #[default]
    Park,
}

impl Backoff {
    /// Waits according to the policy. `seen` must be a generation read from
    /// `progress` before the scan that came up empty.
    pub(crate) fn wait(self, progress: &Progress, seen: u32) {
        match self {
            Backoff::Spin => spin_loop(),
            Backoff::Yield => yield_now(),
            Backoff::Park => progress.wait(seen),
        }
    }
}

// -----------------------------------------------------------------------------
// Progress

/// A generation counter bumped every time waiting claimers might be admitted.
///
/// Parked threads sleep on the counter with a futex, so a bump between a
/// thread's scan and its sleep makes the sleep return immediately instead of
/// being lost.
pub(crate) struct Progress {
    generation: AtomicU32,
}

impl Progress {
    pub fn new() -> Progress {
        Progress {
            generation: AtomicU32::new(0),
        }
    }

    /// Reads the current generation.
    #[inline]
    pub fn current(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new generation and wakes every parked thread.
    pub fn advance(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.generation);
    }

    /// Sleeps while the generation still equals `seen`. May return spuriously.
    pub fn wait(&self, seen: u32) {
        if self.current() == seen {
            futex_wait(&self.generation, seen);
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
