//! Per-level work accounting and completion watermarks.
//!
//! Every pool owns one [`Tracker`]. It is only ever touched while the pool
//! lock is held, so nothing in here synchronizes on its own.
//!
//! For each level the tracker hands out unit indices in increasing order and
//! remembers, per thread, the last index the thread claimed (`started`) and
//! the last index it is known to have finished (`completed`). A thread works
//! on one unit at a time, so a thread asking for more work has finished the
//! unit it held. From that bookkeeping the tracker derives a *watermark* per
//! level: every unit at or below it has been finished by whichever thread
//! claimed it. Downstream levels are admitted against the watermark of the
//! level above instead of waiting for that level to finish entirely.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec;

use tracing::trace;

use crate::Error;
use crate::LEVELS;

// -----------------------------------------------------------------------------
// Public types

/// The outcome of asking for the next unit of work at a level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the unit with this index.
    Unit(usize),
    /// The level still has unclaimed units, but the level above has not
    /// finished enough of its own work to admit the next one. Try another
    /// level or retry later.
    NoWorkYet,
    /// Every unit at this level has been handed out for the current batch.
    NoWork,
}

/// A snapshot of one level's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelStatus {
    /// Units not yet claimed.
    pub remaining: usize,
    /// The index the next successful claim will receive.
    pub next_index: usize,
    /// The highest index certified finished, or `None` if no unit is.
    pub watermark: Option<usize>,
}

// -----------------------------------------------------------------------------
// Levels

struct Level {
    remaining: usize,
    next_index: usize,
    watermark: Option<usize>,
    /// Last index claimed by each thread.
    started: Box<[Option<usize>]>,
    /// Last index retired by each thread. Never ahead of `started`.
    completed: Box<[Option<usize>]>,
}

impl Level {
    fn new(thread_count: usize) -> Level {
        Level {
            remaining: 0,
            next_index: 0,
            watermark: None,
            started: vec![None; thread_count].into_boxed_slice(),
            completed: vec![None; thread_count].into_boxed_slice(),
        }
    }

    fn reset(&mut self, count: usize) {
        self.remaining = count;
        self.next_index = 0;
        self.watermark = None;
        self.started.fill(None);
        self.completed.fill(None);
    }

    /// The number of units this level holds in the current batch.
    fn total(&self) -> usize {
        self.next_index + self.remaining
    }

    fn status(&self) -> LevelStatus {
        LevelStatus {
            remaining: self.remaining,
            next_index: self.next_index,
            watermark: self.watermark,
        }
    }

    /// Returns true if a level directly below this one may claim `index`.
    ///
    /// The claim is admitted once this level's watermark has moved past
    /// `index + lookahead`, or once every unit of this level is finished.
    fn admits(&self, index: usize, lookahead: usize) -> bool {
        let total = self.total();
        if total == 0 {
            return true;
        }
        match self.watermark {
            Some(watermark) => watermark + 1 >= total || watermark > index.saturating_add(lookahead),
            None => false,
        }
    }

    /// Marks the thread's outstanding claim as finished and recomputes the
    /// watermark. Returns true if the watermark advanced.
    fn retire(&mut self, thread: usize) -> bool {
        if self.started[thread] <= self.completed[thread] {
            return false;
        }
        self.completed[thread] = self.started[thread];

        // Every unit below the oldest unit still in progress is finished. If
        // nothing is in progress, everything handed out so far is finished.
        let mut oldest_busy: Option<usize> = None;
        let mut newest_idle: Option<usize> = None;
        for (started, completed) in self.started.iter().zip(self.completed.iter()) {
            match *started {
                Some(index) if started > completed => {
                    oldest_busy = Some(oldest_busy.map_or(index, |oldest| oldest.min(index)));
                }
                _ => newest_idle = newest_idle.max(*completed),
            }
        }

        let candidate = match oldest_busy {
            Some(index) => index.checked_sub(1),
            None => newest_idle,
        };

        // `None` orders below every index, so an undefined candidate never
        // moves the watermark.
        if candidate > self.watermark {
            self.watermark = candidate;
            true
        } else {
            false
        }
    }
}

// -----------------------------------------------------------------------------
// Tracker

/// Tracks the work of every level for one pool.
pub(crate) struct Tracker {
    levels: [Level; LEVELS],
    /// Set by the first reset. Claims before that are a caller bug.
    armed: bool,
    /// Set whenever something happened that could admit a waiting claim.
    progressed: bool,
}

impl Tracker {
    /// Creates a tracker for a pool of `thread_count` threads.
    pub fn new(thread_count: usize) -> Tracker {
        Tracker {
            levels: core::array::from_fn(|_| Level::new(thread_count)),
            armed: false,
            progressed: false,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.levels[0].started.len()
    }

    /// Starts a new batch with `counts[level]` units at each level. Levels
    /// past the end of `counts` get no work.
    pub fn reset(&mut self, counts: &[usize]) -> Result<(), Error> {
        if counts.len() > LEVELS {
            return Err(Error::InvalidArgument(format!(
                "{} work counts given, but pools track {LEVELS} levels",
                counts.len()
            )));
        }

        for (level, slot) in self.levels.iter_mut().enumerate() {
            slot.reset(counts.get(level).copied().unwrap_or(0));
        }

        self.armed = true;
        self.progressed = true;
        Ok(())
    }

    /// Adds `delta` units to every level of the current batch, keeping the
    /// indices and watermarks already handed out.
    pub fn add(&mut self, delta: usize) -> Result<(), Error> {
        if !self.armed {
            return Err(Error::BadState("work added before the first batch was reset"));
        }
        if self.levels.iter().any(|level| level.total().checked_add(delta).is_none()) {
            return Err(Error::InvalidArgument(format!("adding {delta} units overflows a level")));
        }

        for level in &mut self.levels {
            level.remaining += delta;
        }

        self.progressed = true;
        Ok(())
    }

    /// Hands the next unit of `level` to `thread`, if the level has one and
    /// the level above admits it.
    ///
    /// The caller is taken to have finished whatever it held at `level` and
    /// at the level above, and those claims are retired first.
    pub fn claim(&mut self, thread: usize, level: usize, lookahead: usize) -> Result<Claim, Error> {
        self.check_thread(thread)?;
        self.check_level(level)?;
        if !self.armed {
            return Err(Error::BadState("claim before the first batch was reset"));
        }

        if level > 0 {
            self.retire(thread, level - 1);
        }
        self.retire(thread, level);

        let next_index = self.levels[level].next_index;
        if self.levels[level].remaining == 0 {
            return Ok(Claim::NoWork);
        }
        if level > 0 && !self.levels[level - 1].admits(next_index, lookahead) {
            return Ok(Claim::NoWorkYet);
        }

        let slot = &mut self.levels[level];
        slot.remaining -= 1;
        slot.next_index += 1;
        slot.started[thread] = Some(next_index);
        if slot.remaining == 0 {
            self.progressed = true;
        }

        trace!("thread {thread} claimed unit {next_index} at level {level}");
        Ok(Claim::Unit(next_index))
    }

    /// Retires every outstanding claim held by `thread`.
    pub fn retire_all(&mut self, thread: usize) -> Result<(), Error> {
        self.check_thread(thread)?;
        for level in 0..LEVELS {
            self.retire(thread, level);
        }
        Ok(())
    }

    pub fn status(&self, level: usize) -> Result<LevelStatus, Error> {
        self.check_level(level)?;
        Ok(self.levels[level].status())
    }

    /// Returns true, once, if anything happened since the last call that could
    /// let a `NoWorkYet` claim through.
    pub fn take_progress(&mut self) -> bool {
        core::mem::take(&mut self.progressed)
    }

    fn retire(&mut self, thread: usize, level: usize) {
        let slot = &mut self.levels[level];
        if slot.retire(thread) {
            trace!("level {level} watermark advanced to {:?}", slot.watermark);
            self.progressed = true;
        }
    }

    fn check_thread(&self, thread: usize) -> Result<(), Error> {
        if thread >= self.thread_count() {
            return Err(Error::InvalidArgument(format!(
                "thread index {thread} out of range for a pool of {} threads",
                self.thread_count()
            )));
        }
        Ok(())
    }

    fn check_level(&self, level: usize) -> Result<(), Error> {
        if level >= LEVELS {
            return Err(Error::InvalidArgument(format!(
                "level {level} out of range, pools track {LEVELS} levels"
            )));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests
