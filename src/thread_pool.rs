//! This module contains the api and worker logic for the thread pool.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::num::NonZero;
use core::ops::Range;
use core::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::panic::resume_unwind;

use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::trace_span;
use tracing::warn;

use crate::Error;
use crate::Event;
use crate::LEVELS;
use crate::MAX_THREADS;
use crate::platform::*;
use crate::progress::Backoff;
use crate::progress::Progress;
use crate::tracker::Claim;
use crate::tracker::LevelStatus;
use crate::tracker::Tracker;

// -----------------------------------------------------------------------------
// Control messages

/// A control message delivered to a worker's mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    /// Begin working on the batch that was just reset.
    Start,
    /// Exit the worker loop. Sent once, when the pool shuts down.
    Stop,
    /// Resume claiming, because work was added to the current batch.
    MoreWork,
}

/// A unit of work claimed by [`Worker::next_unit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unit {
    /// The pipeline level the unit belongs to.
    pub level: usize,
    /// The index of the unit within its level.
    pub index: usize,
}

// -----------------------------------------------------------------------------
// Thread pool types

/// The `ThreadPool` owns a fixed set of worker threads and the shared state
/// they coordinate through, and is the main entry point to this crate.
///
/// Every thread runs the same *proc*, a closure handed a [`Worker`]. Workers
/// block on their mailbox between batches, so the threads are spawned once and
/// reused for every batch until the pool shuts down.
///
/// # Running a batch
///
/// 1. Describe the batch with [`ThreadPool::reset_work_counts`], giving the
///    number of units at each pipeline level.
/// 2. Wake the workers with [`Message::Start`].
/// 3. Wait for every worker to report that it ran out of work with
///    [`ThreadPool::wait_all_done`].
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// use stagepool::{Backoff, Message, ThreadPool};
///
/// const ROWS: usize = 64;
///
/// // Stage one fills rows, stage two checks them. With a lookahead of zero a
/// // row is only checked after it was filled.
/// let filled: Arc<Vec<AtomicBool>> = Arc::new((0..ROWS).map(|_| AtomicBool::new(false)).collect());
/// let rows = filled.clone();
///
/// let pool = ThreadPool::new(4, move |worker| {
///     worker.serve(|worker| {
///         while let Some(unit) = worker.next_unit(2, 0, Backoff::Park)? {
///             match unit.level {
///                 0 => rows[unit.index].store(true, Ordering::Release),
///                 _ => assert!(rows[unit.index].load(Ordering::Acquire)),
///             }
///         }
///         Ok(())
///     })
/// })?;
///
/// pool.reset_work_counts(&[ROWS, ROWS])?;
/// pool.send_message_to_all(Message::Start)?;
/// pool.wait_all_done()?;
/// pool.shutdown()?;
/// # Ok::<(), stagepool::Error>(())
/// ```
///
/// Dropping a pool shuts it down the same way [`ThreadPool::shutdown`] does,
/// but can only log a failure.
pub struct ThreadPool {
    shared: Arc<Shared>,
    /// Handles for the spawned threads, in spawn order.
    handles: Vec<JoinHandle<()>>,
}

/// State shared between the pool and its workers.
struct Shared {
    state: Mutex<PoolState>,
    /// One mailbox per worker identity.
    mailboxes: Box<[Mailbox]>,
    /// Bumped whenever a `NoWorkYet` claim may have become admissible.
    progress: Progress,
}

/// Everything guarded by the pool lock.
struct PoolState {
    /// The pending control message of each worker.
    messages: Box<[Option<Message>]>,
    /// The identity handed to the next worker that registers.
    next_thread_index: usize,
    /// The identity registered by the thread in each spawn slot.
    identities: Box<[Option<usize>]>,
    /// Set for workers whose proc returned an error or panicked.
    failed: Box<[bool]>,
    tracker: Tracker,
}

/// The events used to wake one worker, and to learn that it finished.
struct Mailbox {
    start: Event,
    done: Event,
}

/// What to do when asked for more threads than [`MAX_THREADS`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadLimit {
    /// Silently build a pool of `MAX_THREADS` threads (a warning is logged).
    #[default]
    Clamp,
    /// Fail with [`Error::InvalidArgument`].
    Reject,
}

// -----------------------------------------------------------------------------
// Thread pool configuration

/// Configures and builds a [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct ThreadPoolBuilder {
    threads: Option<usize>,
    thread_limit: ThreadLimit,
    thread_name: String,
    pin_threads: bool,
    stack_size: Option<usize>,
}

impl Default for ThreadPoolBuilder {
    fn default() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            threads: None,
            thread_limit: ThreadLimit::Clamp,
            thread_name: String::from("worker"),
            pin_threads: false,
            stack_size: None,
        }
    }
}

impl ThreadPoolBuilder {
    /// Creates a builder with the default configuration: one thread per
    /// available core, clamped to [`MAX_THREADS`].
    pub fn new() -> ThreadPoolBuilder {
        ThreadPoolBuilder::default()
    }

    /// Sets the number of worker threads.
    pub fn threads(mut self, threads: usize) -> ThreadPoolBuilder {
        self.threads = Some(threads);
        self
    }

    /// Sets the policy for thread counts above [`MAX_THREADS`].
    pub fn thread_limit(mut self, thread_limit: ThreadLimit) -> ThreadPoolBuilder {
        self.thread_limit = thread_limit;
        self
    }

    /// Sets the prefix of worker thread names. Threads are named
    /// `"{prefix} {slot}"`, where `slot` is the spawn order. A thread's slot
    /// need not match the [`Worker::index`] it registers.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> ThreadPoolBuilder {
        self.thread_name = prefix.into();
        self
    }

    /// Pins each worker to a core. Pinning is best-effort; on platforms that
    /// don't support it this does nothing.
    pub fn pin_threads(mut self, pin_threads: bool) -> ThreadPoolBuilder {
        self.pin_threads = pin_threads;
        self
    }

    /// Sets the stack size of worker threads, in bytes.
    pub fn stack_size(mut self, stack_size: usize) -> ThreadPoolBuilder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Spawns the worker threads, each running `proc`.
    ///
    /// If a thread fails to spawn, the threads already running are stopped and
    /// joined before the error is returned.
    pub fn build<F>(self, proc: F) -> Result<ThreadPool, Error>
    where
        F: Fn(&Worker) -> Result<(), Error> + Send + Sync + 'static,
    {
        let requested = match self.threads {
            Some(threads) => threads,
            None => available_parallelism().map(NonZero::get).unwrap_or(1),
        };

        let thread_count = match (requested, self.thread_limit) {
            (0, _) => {
                return Err(Error::InvalidArgument(String::from(
                    "a pool needs at least one thread",
                )));
            }
            (requested, ThreadLimit::Clamp) if requested > MAX_THREADS => {
                warn!("clamping thread pool from {requested} to {MAX_THREADS} threads");
                MAX_THREADS
            }
            (requested, ThreadLimit::Reject) if requested > MAX_THREADS => {
                return Err(Error::InvalidArgument(format!(
                    "{requested} threads requested, but pools hold at most {MAX_THREADS}"
                )));
            }
            (requested, _) => requested,
        };

        debug!("building thread pool with {thread_count} thread(s)");

        let mut pool = ThreadPool {
            shared: Arc::new(Shared::new(thread_count)),
            handles: Vec::with_capacity(thread_count),
        };
        let proc = Arc::new(proc);

        for slot in 0..thread_count {
            let mut builder = ThreadBuilder::new().name(format!("{} {slot}", self.thread_name));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let shared = pool.shared.clone();
            let proc = proc.clone();
            let pin_threads = self.pin_threads;
            match builder.spawn(move || managed_worker(shared, proc, slot, pin_threads)) {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    error!("failed to spawn worker thread {slot}: {err}");
                    if let Err(teardown) = pool.destroy() {
                        warn!("failed to tear down partially built pool: {teardown}");
                    }
                    return Err(Error::CreateFailed(err));
                }
            }
        }

        debug!("completed thread pool build");
        Ok(pool)
    }
}

// -----------------------------------------------------------------------------
// Thread pool api

impl ThreadPool {
    /// Creates a pool of `threads` workers, each running `proc`. Counts above
    /// [`MAX_THREADS`] are clamped. Use [`ThreadPool::builder`] for more
    /// control.
    pub fn new<F>(threads: usize, proc: F) -> Result<ThreadPool, Error>
    where
        F: Fn(&Worker) -> Result<(), Error> + Send + Sync + 'static,
    {
        ThreadPoolBuilder::new().threads(threads).build(proc)
    }

    /// Returns a builder for configuring a new pool.
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    /// The number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.shared.thread_count()
    }

    /// Starts a new batch with `counts[level]` units at each level. Levels past
    /// the end of `counts` get no work. Every index, watermark, and per-thread
    /// record is cleared.
    ///
    /// Call this while the workers are idle, before broadcasting
    /// [`Message::Start`].
    pub fn reset_work_counts(&self, counts: &[usize]) -> Result<(), Error> {
        debug!("resetting work counts to {counts:?}");
        self.shared.with_state(|state| state.tracker.reset(counts))
    }

    /// Adds `delta` units to every level of the current batch without
    /// resetting indices or watermarks. Follow with [`Message::MoreWork`] to
    /// wake workers that already finished.
    pub fn add_work_count(&self, delta: usize) -> Result<(), Error> {
        debug!("adding {delta} units to every level");
        self.shared.with_state(|state| state.tracker.add(delta))
    }

    /// Delivers `message` to every worker.
    pub fn send_message_to_all(&self, message: Message) -> Result<(), Error> {
        self.shared.send(0..self.thread_count(), message)
    }

    /// Delivers `message` to the worker with identity `index`.
    pub fn send_message_to_one(&self, index: usize, message: Message) -> Result<(), Error> {
        self.shared.check_thread(index)?;
        self.shared.send(index..index + 1, message)
    }

    /// Blocks until every worker has signaled done since it was last sent
    /// [`Message::Start`]. A worker that exited on [`Message::Stop`] never
    /// signals done.
    pub fn wait_all_done(&self) -> Result<(), Error> {
        self.shared.wait_done(0..self.thread_count())
    }

    /// Blocks until the worker with identity `index` has signaled done.
    pub fn wait_one_done(&self, index: usize) -> Result<(), Error> {
        self.shared.check_thread(index)?;
        self.shared.wait_done(index..index + 1)
    }

    /// Claims the next unit of `level` on behalf of worker `thread`. See
    /// [`Worker::claim`].
    ///
    /// This is meant for callers that drive the tracker themselves; claiming
    /// under the identity of a running worker confuses its bookkeeping.
    pub fn claim(&self, thread: usize, level: usize, lookahead: usize) -> Result<Claim, Error> {
        self.shared.claim(thread, level, lookahead)
    }

    /// Returns a snapshot of the counters of `level`.
    pub fn level_status(&self, level: usize) -> Result<LevelStatus, Error> {
        self.shared.level_status(level)
    }

    /// Stops every worker and joins its thread.
    ///
    /// Workers receive [`Message::Stop`] at their next mailbox wait, so a
    /// worker in the middle of a batch finishes its pass first.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.destroy()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        if self.handles.is_empty() {
            return Ok(());
        }

        debug!("shutting down thread pool");

        // If this fails the workers can't be told to stop, and joining them
        // would block forever. Dropping the handles detaches them instead.
        self.shared.send(0..self.thread_count(), Message::Stop)?;

        let mut outcome = Ok(());
        for (slot, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() && outcome.is_ok() {
                let index = self.shared.identity(slot);
                outcome = Err(Error::JoinFailed { index });
            }
        }

        debug!("completed thread pool shutdown");
        outcome
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!("thread pool shutdown failed: {err}");
        }
    }
}

// -----------------------------------------------------------------------------
// Shared state

impl Shared {
    fn new(thread_count: usize) -> Shared {
        Shared {
            state: Mutex::new(PoolState {
                messages: vec![None; thread_count].into_boxed_slice(),
                next_thread_index: 0,
                identities: vec![None; thread_count].into_boxed_slice(),
                failed: vec![false; thread_count].into_boxed_slice(),
                tracker: Tracker::new(thread_count),
            }),
            mailboxes: (0..thread_count)
                .map(|_| Mailbox {
                    start: Event::new(),
                    done: Event::new(),
                })
                .collect(),
            progress: Progress::new(),
        }
    }

    fn thread_count(&self) -> usize {
        self.mailboxes.len()
    }

    fn check_thread(&self, index: usize) -> Result<(), Error> {
        if index >= self.thread_count() {
            return Err(Error::InvalidArgument(format!(
                "thread index {index} out of range for a pool of {} threads",
                self.thread_count()
            )));
        }
        Ok(())
    }

    /// Runs `f` under the pool lock, then wakes parked claimers if `f` made
    /// progress.
    fn with_state<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut PoolState) -> Result<R, Error>,
    {
        let mut state = self.state.lock().map_err(|_| Error::Poisoned)?;
        let result = f(&mut state);
        let progressed = state.tracker.take_progress();
        drop(state);

        if progressed {
            self.progress.advance();
        }
        result
    }

    /// Hands out the next worker identity to the thread in `slot`.
    fn register(&self, slot: usize) -> Result<usize, Error> {
        self.with_state(|state| {
            let index = state.next_thread_index;
            if index >= self.thread_count() {
                return Err(Error::BadState("more workers registered than the pool holds"));
            }
            state.next_thread_index += 1;
            state.identities[slot] = Some(index);
            Ok(index)
        })
    }

    /// The identity registered by the thread in `slot`, or the slot itself if
    /// that thread never registered.
    fn identity(&self, slot: usize) -> usize {
        match self.state.lock() {
            Ok(state) => state.identities[slot].unwrap_or(slot),
            Err(_) => slot,
        }
    }

    fn send(&self, targets: Range<usize>, message: Message) -> Result<(), Error> {
        trace!("sending {message:?} to workers {targets:?}");
        self.with_state(|state| {
            for index in targets {
                state.messages[index] = Some(message);
                let mailbox = &self.mailboxes[index];
                // A failed worker will never signal again, so its done event
                // stays set for the waiters to find the failure.
                if message != Message::Stop && !state.failed[index] {
                    mailbox.done.clear()?;
                }
                mailbox.start.set()?;
            }
            Ok(())
        })
    }

    fn wait_for_message(&self, index: usize) -> Result<Message, Error> {
        let mailbox = &self.mailboxes[index];
        loop {
            mailbox.start.wait()?;
            let message = self.with_state(|state| {
                let message = state.messages[index].take();
                mailbox.start.clear()?;
                Ok(message)
            })?;
            if let Some(message) = message {
                trace!("worker {index} received {message:?}");
                return Ok(message);
            }
        }
    }

    fn signal_done(&self, index: usize) -> Result<(), Error> {
        trace!("worker {index} signaling done");
        self.with_state(|state| {
            state.tracker.retire_all(index)?;
            // A message that arrived mid-pass is left in the mailbox, with its
            // start event still set, so the worker sees it on its next wait.
            self.mailboxes[index].done.set()
        })
    }

    fn wait_done(&self, targets: Range<usize>) -> Result<(), Error> {
        for index in targets.clone() {
            self.mailboxes[index].done.wait()?;
        }
        self.with_state(|state| match targets.into_iter().find(|&index| state.failed[index]) {
            Some(index) => Err(Error::WorkerFailed { index }),
            None => Ok(()),
        })
    }

    /// Records that a worker's proc returned, releasing its claims. A failed
    /// worker also has its done event set, so nobody waits on it forever; a
    /// worker that stopped normally never signals done.
    fn abandon(&self, index: usize, failed: bool) -> Result<(), Error> {
        self.with_state(|state| {
            state.tracker.retire_all(index)?;
            if failed {
                state.failed[index] = true;
                self.mailboxes[index].done.set()?;
            }
            Ok(())
        })
    }

    fn claim(&self, thread: usize, level: usize, lookahead: usize) -> Result<Claim, Error> {
        self.with_state(|state| state.tracker.claim(thread, level, lookahead))
    }

    /// Retires everything `thread` holds, then claims from the lowest of the
    /// first `levels` levels that admits a unit, all under one lock.
    fn scan(&self, thread: usize, levels: usize, lookahead: usize) -> Result<Scan, Error> {
        self.with_state(|state| {
            state.tracker.retire_all(thread)?;
            let mut scan = Scan::Exhausted;
            for level in 0..levels {
                match state.tracker.claim(thread, level, lookahead)? {
                    Claim::Unit(index) => return Ok(Scan::Found(Unit { level, index })),
                    Claim::NoWorkYet => scan = Scan::Pending,
                    Claim::NoWork => {}
                }
            }
            Ok(scan)
        })
    }

    fn level_status(&self, level: usize) -> Result<LevelStatus, Error> {
        self.with_state(|state| state.tracker.status(level))
    }
}

/// The result of one pass over the levels in [`Worker::next_unit`].
enum Scan {
    Found(Unit),
    /// Some level has unclaimed units that are not admitted yet.
    Pending,
    Exhausted,
}

// -----------------------------------------------------------------------------
// Worker

/// The handle a worker thread's proc uses to talk to its pool.
///
/// Every worker has a stable identity in `0..thread_count`, assigned once when
/// its thread starts. The identity selects the worker's mailbox and its
/// per-level records in the tracker.
pub struct Worker {
    shared: Arc<Shared>,
    index: usize,
}

impl Worker {
    /// The worker's identity.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The number of workers in the pool.
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.shared.thread_count()
    }

    /// Blocks until a control message arrives, then takes it from the mailbox.
    pub fn wait_for_message(&self) -> Result<Message, Error> {
        self.shared.wait_for_message(self.index)
    }

    /// Reports that this worker ran out of claimable work, retiring every unit
    /// it still holds.
    pub fn signal_done(&self) -> Result<(), Error> {
        self.shared.signal_done(self.index)
    }

    /// Claims the next unit of `level`.
    ///
    /// A worker processes one unit at a time: calling this declares that the
    /// unit this worker last claimed at `level`, and at the level above, is
    /// finished. For `level > 0`, unit `i` is admitted once the watermark of
    /// `level - 1` is past `i + lookahead`, or once all of `level - 1` is
    /// finished.
    ///
    /// Never blocks. [`Claim::NoWorkYet`] and [`Claim::NoWork`] are ordinary
    /// outcomes, not failures.
    #[inline]
    pub fn claim(&self, level: usize, lookahead: usize) -> Result<Claim, Error> {
        self.shared.claim(self.index, level, lookahead)
    }

    /// Claims the next unit of a single-level batch.
    #[inline]
    pub fn claim_next(&self) -> Result<Claim, Error> {
        self.claim(0, 0)
    }

    /// Claims the next unit from the first `levels` levels, preferring lower
    /// levels. Returns `None` once every level is out of work.
    ///
    /// Calling this declares every unit this worker holds, at any level,
    /// finished.
    ///
    /// When no level has an admissible unit but some still have unclaimed
    /// ones, this waits according to `backoff` and scans again.
    pub fn next_unit(
        &self,
        levels: usize,
        lookahead: usize,
        backoff: Backoff,
    ) -> Result<Option<Unit>, Error> {
        if levels > LEVELS {
            return Err(Error::InvalidArgument(format!(
                "{levels} levels requested, but pools track {LEVELS}"
            )));
        }

        loop {
            // Read before scanning so that progress made during the scan cuts
            // the wait short.
            let seen = self.shared.progress.current();

            match self.shared.scan(self.index, levels, lookahead)? {
                Scan::Found(unit) => return Ok(Some(unit)),
                Scan::Exhausted => return Ok(None),
                Scan::Pending => backoff.wait(&self.shared.progress, seen),
            }
        }
    }

    /// Returns a snapshot of the counters of `level`.
    pub fn level_status(&self, level: usize) -> Result<LevelStatus, Error> {
        self.shared.level_status(level)
    }

    /// Runs the standard worker loop: wait for a message, run `handler` for
    /// [`Message::Start`] and [`Message::MoreWork`] and then signal done,
    /// return on [`Message::Stop`].
    pub fn serve<F>(&self, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(&Worker) -> Result<(), Error>,
    {
        loop {
            match self.wait_for_message()? {
                Message::Stop => return Ok(()),
                Message::Start | Message::MoreWork => {
                    handler(self)?;
                    self.signal_done()?;
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the body of every pool thread. It takes an identity, runs the proc,
/// and makes sure the pool hears about it if the proc fails.
fn managed_worker<F>(shared: Arc<Shared>, proc: Arc<F>, slot: usize, pin_threads: bool)
where
    F: Fn(&Worker) -> Result<(), Error> + Send + Sync + 'static,
{
    trace!("starting managed worker");

    let index = match shared.register(slot) {
        Ok(index) => index,
        Err(err) => {
            error!("worker thread failed to register: {err}");
            return;
        }
    };

    let span = trace_span!("worker", index);
    let _enter = span.enter();

    if pin_threads && !pin_to_core(index) {
        debug!("could not pin worker {index} to a core");
    }

    let worker = Worker { shared, index };
    let outcome = catch_unwind(AssertUnwindSafe(|| (*proc)(&worker)));

    let failed = !matches!(outcome, Ok(Ok(())));
    if let Ok(Err(err)) = &outcome {
        error!("worker {index} failed: {err}");
    }
    if let Err(err) = worker.shared.abandon(index, failed) {
        error!("worker {index} could not report its exit: {err}");
    }

    if let Err(payload) = outcome {
        error!("worker {index} panicked");
        resume_unwind(payload);
    }

    trace!("exiting managed worker");
}
