//! Integration tests for the pool, its control protocol, and pipelined claims.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use stagepool::Backoff;
use stagepool::Claim;
use stagepool::Error;
use stagepool::LEVELS;
use stagepool::MAX_THREADS;
use stagepool::Message;
use stagepool::ThreadLimit;
use stagepool::ThreadPool;
use stagepool::Unit;
use stagepool::Worker;
use tracing::Level;
use tracing::info;

// -----------------------------------------------------------------------------
// Infrastructure

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .without_time()
        .try_init();
}

/// A pool whose workers only ever wait for `Stop`, for tests that drive the
/// tracker from the test thread.
fn idle_pool(threads: usize) -> ThreadPool {
    ThreadPool::new(threads, |worker| worker.serve(|_| Ok(()))).unwrap()
}

/// Claims single-level units until the level is out of work.
fn drain_level(worker: &Worker, claimed: &Mutex<Vec<usize>>) -> Result<(), Error> {
    while let Claim::Unit(index) = worker.claim_next()? {
        claimed.lock().unwrap().push(index);
    }
    Ok(())
}

fn sorted(claimed: &Mutex<Vec<usize>>) -> Vec<usize> {
    let mut claimed = core::mem::take(&mut *claimed.lock().unwrap());
    claimed.sort_unstable();
    claimed
}

fn run_batch(pool: &ThreadPool, counts: &[usize]) {
    pool.reset_work_counts(counts).unwrap();
    pool.send_message_to_all(Message::Start).unwrap();
    pool.wait_all_done().unwrap();
}

// -----------------------------------------------------------------------------
// Single-level batches

#[test]
fn two_threads_cover_one_level() {
    setup();

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let record = claimed.clone();
    let pool = ThreadPool::new(2, move |worker| {
        worker.serve(|worker| drain_level(worker, &record))
    })
    .unwrap();

    run_batch(&pool, &[10]);
    assert_eq!(sorted(&claimed), (0..10).collect::<Vec<_>>());

    pool.shutdown().unwrap();
}

#[test]
fn batches_reuse_the_pool() {
    setup();

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let record = claimed.clone();
    let pool = ThreadPool::new(3, move |worker| {
        worker.serve(|worker| drain_level(worker, &record))
    })
    .unwrap();

    for count in [10, 0, 25, 1] {
        info!("running batch of {count}");
        run_batch(&pool, &[count]);
        assert_eq!(sorted(&claimed), (0..count).collect::<Vec<_>>());

        let status = pool.level_status(0).unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.next_index, count);
        // Every worker retired its claims when it signaled done.
        assert_eq!(status.watermark, count.checked_sub(1));
    }

    pool.shutdown().unwrap();
}

#[test]
fn more_work_extends_the_batch() {
    setup();

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let record = claimed.clone();
    let pool = ThreadPool::new(2, move |worker| {
        worker.serve(|worker| drain_level(worker, &record))
    })
    .unwrap();

    run_batch(&pool, &[5]);

    pool.add_work_count(5).unwrap();
    pool.send_message_to_all(Message::MoreWork).unwrap();
    pool.wait_all_done().unwrap();

    assert_eq!(sorted(&claimed), (0..10).collect::<Vec<_>>());
    pool.shutdown().unwrap();
}

// -----------------------------------------------------------------------------
// Pipelined batches

/// Runs a pipeline where every unit marks itself finished, and every
/// downstream unit checks that the upstream units it was admitted against are
/// finished. Returns the number of violations.
fn run_pipeline(threads: usize, counts: &[usize], lookahead: usize, backoff: Backoff) -> usize {
    let levels = counts.len();
    let finished: Arc<Vec<Vec<AtomicBool>>> = Arc::new(
        counts
            .iter()
            .map(|&count| (0..count).map(|_| AtomicBool::new(false)).collect())
            .collect(),
    );
    let claimed = Arc::new(Mutex::new(Vec::new()));
    let violations = Arc::new(AtomicUsize::new(0));

    let pool = {
        let finished = finished.clone();
        let claimed = claimed.clone();
        let violations = violations.clone();
        ThreadPool::new(threads, move |worker| {
            worker.serve(|worker| {
                while let Some(Unit { level, index }) = worker.next_unit(levels, lookahead, backoff)? {
                    if level > 0 {
                        let upstream = &finished[level - 1];
                        let needed = (index + lookahead + 1).min(upstream.len().saturating_sub(1));
                        let ready = upstream
                            .iter()
                            .take(needed + 1)
                            .all(|unit| unit.load(Ordering::Acquire));
                        let watermark = worker.level_status(level - 1)?.watermark;
                        if !upstream.is_empty() && (!ready || watermark < Some(index)) {
                            violations.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    claimed.lock().unwrap().push((level, index));
                    finished[level][index].store(true, Ordering::Release);
                }
                Ok(())
            })
        })
        .unwrap()
    };

    run_batch(&pool, counts);
    pool.shutdown().unwrap();

    let mut claimed = claimed.lock().unwrap().clone();
    claimed.sort_unstable();
    let expected: Vec<_> = counts
        .iter()
        .enumerate()
        .flat_map(|(level, &count)| (0..count).map(move |index| (level, index)))
        .collect();
    assert_eq!(claimed, expected);

    violations.load(Ordering::Relaxed)
}

#[test]
fn downstream_never_passes_upstream_watermark() {
    setup();
    assert_eq!(run_pipeline(4, &[100, 100], 0, Backoff::Park), 0);
}

#[test]
fn lookahead_holds_downstream_further_back() {
    setup();
    assert_eq!(run_pipeline(4, &[60, 50, 40], 2, Backoff::Park), 0);
}

#[test]
fn every_backoff_policy_completes() {
    setup();
    for backoff in [Backoff::Spin, Backoff::Yield, Backoff::Park] {
        info!("running pipeline with {backoff:?}");
        assert_eq!(run_pipeline(3, &[40, 40, 40, 40], 1, backoff), 0);
    }
}

#[test]
fn levels_may_be_empty() {
    setup();
    assert_eq!(run_pipeline(2, &[0, 20, 0, 5], 0, Backoff::Park), 0);
}

#[test]
fn admission_is_gated_by_upstream() {
    setup();

    let pool = idle_pool(2);
    assert!(matches!(pool.claim(0, 1, 0), Err(Error::BadState(_))));

    pool.reset_work_counts(&[3, 3]).unwrap();
    assert_eq!(pool.claim(0, 1, 0).unwrap(), Claim::NoWorkYet);

    assert_eq!(pool.claim(1, 0, 0).unwrap(), Claim::Unit(0));
    assert_eq!(pool.claim(0, 0, 0).unwrap(), Claim::Unit(1));

    // Thread 1 is done with unit 0, but a watermark of 0 is not past index 0.
    assert_eq!(pool.claim(1, 1, 0).unwrap(), Claim::NoWorkYet);
    assert_eq!(pool.level_status(0).unwrap().watermark, Some(0));

    // Thread 0 finishing unit 1 moves the watermark past index 0.
    assert_eq!(pool.claim(0, 1, 0).unwrap(), Claim::Unit(0));
    assert_eq!(pool.level_status(0).unwrap().watermark, Some(1));

    pool.shutdown().unwrap();
}

// -----------------------------------------------------------------------------
// Control protocol

#[test]
fn workers_get_unique_identities() {
    setup();

    let identities = Arc::new(Mutex::new(Vec::new()));
    let record = identities.clone();
    let pool = ThreadPool::new(8, move |worker| {
        assert_eq!(worker.thread_count(), 8);
        worker.serve(|worker| {
            record.lock().unwrap().push(worker.index());
            Ok(())
        })
    })
    .unwrap();

    run_batch(&pool, &[]);
    assert_eq!(sorted(&identities), (0..8).collect::<Vec<_>>());

    pool.shutdown().unwrap();
}

#[test]
fn messages_reach_one_worker() {
    setup();

    let started = Arc::new(Mutex::new(Vec::new()));
    let record = started.clone();
    let pool = ThreadPool::new(3, move |worker| {
        worker.serve(|worker| {
            record.lock().unwrap().push(worker.index());
            Ok(())
        })
    })
    .unwrap();

    pool.reset_work_counts(&[]).unwrap();
    pool.send_message_to_one(1, Message::Start).unwrap();
    pool.wait_one_done(1).unwrap();
    assert_eq!(sorted(&started), [1]);

    pool.send_message_to_one(0, Message::Start).unwrap();
    pool.send_message_to_one(2, Message::Start).unwrap();
    pool.wait_one_done(0).unwrap();
    pool.wait_one_done(2).unwrap();
    pool.wait_all_done().unwrap();
    assert_eq!(sorted(&started), [0, 2]);

    pool.shutdown().unwrap();
}

#[test]
fn wait_all_done_waits_for_every_worker() {
    setup();

    let gate = Arc::new(AtomicBool::new(false));
    let held = gate.clone();
    let pool = ThreadPool::new(2, move |worker| {
        worker.serve(|worker| {
            if worker.index() == 0 {
                while !held.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            }
            Ok(())
        })
    })
    .unwrap();

    pool.reset_work_counts(&[]).unwrap();
    pool.send_message_to_all(Message::Start).unwrap();

    let returned = AtomicBool::new(false);
    let returned_early = thread::scope(|scope| {
        scope.spawn(|| {
            pool.wait_all_done().unwrap();
            returned.store(true, Ordering::Release);
        });

        pool.wait_one_done(1).unwrap();
        thread::sleep(Duration::from_millis(50));
        let early = returned.load(Ordering::Acquire);

        // Release worker 0 before asserting, so a failure can't hang the scope.
        gate.store(true, Ordering::Release);
        early
    });
    assert!(!returned_early);
    assert!(returned.load(Ordering::Acquire));

    pool.shutdown().unwrap();
}

#[test]
fn stop_does_not_signal_done() {
    setup();

    let pool = Arc::new(idle_pool(2));
    pool.reset_work_counts(&[1]).unwrap();
    pool.send_message_to_all(Message::Stop).unwrap();

    // The workers exit without signaling, so this wait never returns. The
    // waiter is detached and outlives the test.
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.wait_one_done(0))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
}

#[test]
fn stop_while_workers_are_claiming() {
    setup();

    const UNITS: usize = 10_000;

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let passes = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicUsize::new(0));

    let pool = {
        let claimed = claimed.clone();
        let passes = passes.clone();
        let exited = exited.clone();
        ThreadPool::new(4, move |worker| {
            loop {
                match worker.wait_for_message()? {
                    Message::Stop => break,
                    Message::Start | Message::MoreWork => {
                        while let Claim::Unit(index) = worker.claim_next()? {
                            std::hint::black_box((0..100).sum::<usize>());
                            claimed.lock().unwrap().push(index);
                        }
                        passes.fetch_add(1, Ordering::Relaxed);
                        worker.signal_done()?;
                    }
                }
            }
            exited.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap()
    };

    pool.reset_work_counts(&[UNITS]).unwrap();
    pool.send_message_to_all(Message::Start).unwrap();
    pool.shutdown().unwrap();

    // A worker that had not picked up `Start` yet sees `Stop` instead, so some
    // passes may never run, but no unit is handed out twice.
    assert_eq!(exited.load(Ordering::Relaxed), 4);
    assert!(passes.load(Ordering::Relaxed) <= 4);
    let claimed = sorted(&claimed);
    assert!(claimed.len() <= UNITS);
    assert!(claimed.windows(2).all(|pair| pair[0] < pair[1]));
}

// -----------------------------------------------------------------------------
// Configuration

#[test]
fn thread_counts_are_bounded() {
    setup();

    let pool = ThreadPool::builder()
        .threads(MAX_THREADS + 8)
        .build(|worker| worker.serve(|_| Ok(())))
        .unwrap();
    assert_eq!(pool.thread_count(), MAX_THREADS);
    pool.shutdown().unwrap();

    let rejected = ThreadPool::builder()
        .threads(MAX_THREADS + 1)
        .thread_limit(ThreadLimit::Reject)
        .build(|worker| worker.serve(|_| Ok(())));
    assert!(matches!(rejected, Err(Error::InvalidArgument(_))));

    let empty = ThreadPool::new(0, |worker| worker.serve(|_| Ok(())));
    assert!(matches!(empty, Err(Error::InvalidArgument(_))));
}

#[test]
fn builder_names_and_pins_threads() {
    setup();

    let names = Arc::new(Mutex::new(Vec::new()));
    let record = names.clone();
    let pool = ThreadPool::builder()
        .threads(2)
        .thread_name("scaler")
        .pin_threads(true)
        .stack_size(256 * 1024)
        .build(move |worker| {
            worker.serve(|_| {
                let name = thread::current().name().map(String::from);
                record.lock().unwrap().push(name);
                Ok(())
            })
        })
        .unwrap();

    run_batch(&pool, &[]);
    let mut names = names.lock().unwrap().clone();
    names.sort();
    assert_eq!(
        names,
        [Some(String::from("scaler 0")), Some(String::from("scaler 1"))]
    );

    pool.shutdown().unwrap();
}

// -----------------------------------------------------------------------------
// Errors

#[test]
fn rejects_out_of_range_arguments() {
    setup();

    let pool = idle_pool(2);
    pool.reset_work_counts(&[1]).unwrap();

    assert!(matches!(
        pool.send_message_to_one(2, Message::Start),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(pool.wait_one_done(2), Err(Error::InvalidArgument(_))));
    assert!(matches!(pool.claim(2, 0, 0), Err(Error::InvalidArgument(_))));
    assert!(matches!(pool.claim(0, LEVELS, 0), Err(Error::InvalidArgument(_))));
    assert!(matches!(pool.level_status(LEVELS), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        pool.reset_work_counts(&[1; LEVELS + 1]),
        Err(Error::InvalidArgument(_))
    ));

    pool.shutdown().unwrap();
}

#[test]
fn next_unit_rejects_too_many_levels() {
    setup();

    let outcome = Arc::new(Mutex::new(None));
    let record = outcome.clone();
    let pool = ThreadPool::new(1, move |worker| {
        worker.serve(|worker| {
            let result = worker.next_unit(LEVELS + 1, 0, Backoff::Park);
            *record.lock().unwrap() = Some(matches!(result, Err(Error::InvalidArgument(_))));
            Ok(())
        })
    })
    .unwrap();

    run_batch(&pool, &[1]);
    assert_eq!(*outcome.lock().unwrap(), Some(true));
    pool.shutdown().unwrap();
}

#[test]
fn failed_worker_is_reported() {
    setup();

    let pool = ThreadPool::new(2, |worker| {
        worker.serve(|worker| {
            if worker.index() == 1 {
                return Err(Error::BadState("refusing to work"));
            }
            Ok(())
        })
    })
    .unwrap();

    pool.reset_work_counts(&[]).unwrap();
    pool.send_message_to_all(Message::Start).unwrap();
    assert!(matches!(
        pool.wait_all_done(),
        Err(Error::WorkerFailed { index: 1 })
    ));

    // The failed worker stays failed for later batches.
    pool.send_message_to_all(Message::Start).unwrap();
    assert!(matches!(
        pool.wait_one_done(1),
        Err(Error::WorkerFailed { index: 1 })
    ));
    pool.wait_one_done(0).unwrap();

    // Its thread exited normally, so it joins cleanly.
    pool.shutdown().unwrap();
}

#[test]
fn panicking_worker_fails_to_join() {
    setup();

    let pool = ThreadPool::new(1, |worker| {
        worker.serve(|_| panic!("worker exploded"))
    })
    .unwrap();

    pool.reset_work_counts(&[]).unwrap();
    pool.send_message_to_all(Message::Start).unwrap();
    assert!(matches!(
        pool.wait_all_done(),
        Err(Error::WorkerFailed { index: 0 })
    ));
    assert!(matches!(pool.shutdown(), Err(Error::JoinFailed { index: 0 })));
}

#[test]
fn panicking_worker_is_reported_under_one_identity() {
    setup();

    let pool = ThreadPool::new(3, |worker| {
        worker.serve(|worker| {
            if worker.index() == 2 {
                panic!("worker {} exploded", worker.index());
            }
            Ok(())
        })
    })
    .unwrap();

    pool.reset_work_counts(&[]).unwrap();
    pool.send_message_to_all(Message::Start).unwrap();
    assert!(matches!(
        pool.wait_all_done(),
        Err(Error::WorkerFailed { index: 2 })
    ));
    assert!(matches!(pool.shutdown(), Err(Error::JoinFailed { index: 2 })));
}
