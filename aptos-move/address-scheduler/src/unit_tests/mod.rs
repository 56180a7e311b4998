// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::BlockExecutorConfig,
    errors::{BlockExecutionError, PanicError},
    executor::BlockExecutor,
    monitor::{AcquireStatus, AddressResourceMonitor},
    proptest_types::types::{Output, SlotType, Task, Transaction, ValueType},
    state_store::{BufferedState, InMemoryStateStore, StateStore},
    transaction_task::{AbortObserver, TransactionTask},
    types::TxnIndex,
};
use claims::{assert_matches, assert_none, assert_ok, assert_ok_eq, assert_some_eq};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

type TestMonitor = AddressResourceMonitor<u8, ()>;
type TestStore = InMemoryStateStore<u8, SlotType, ValueType>;
type TestExecutor = BlockExecutor<Transaction<u8>, Task<u8>, TestStore>;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn task(index: TxnIndex, incarnation: u32) -> Arc<TransactionTask<()>> {
    Arc::new(TransactionTask::new(index, incarnation, ()))
}

fn wait_until(condition: impl Fn() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "condition not reached"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Records the order in which buffered states are applied.
struct RecordCommit<'a> {
    log: &'a Mutex<Vec<TxnIndex>>,
    txn_idx: TxnIndex,
}

impl<'a> RecordCommit<'a> {
    fn new(log: &'a Mutex<Vec<TxnIndex>>, txn_idx: TxnIndex) -> Self {
        Self { log, txn_idx }
    }
}

impl BufferedState for RecordCommit<'_> {
    fn apply(self) {
        self.log.lock().push(self.txn_idx);
    }
}

#[derive(Default)]
struct CountingObserver(AtomicUsize);

impl AbortObserver for CountingObserver {
    fn external_set_abort_state(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

///////////////////////////////////////////////////////////////////////////
// Transaction task
///////////////////////////////////////////////////////////////////////////

#[test]
fn task_identity_is_index() {
    let first = task(3, 0);
    let retry = task(3, 5);
    assert_eq!(*first, *retry);
    assert_eq!(retry.version(), (3, 5));
    assert!(*task(2, 7) < *first);
    assert!(*task(4, 0) > *retry);
}

#[test]
fn abort_is_forwarded_once() {
    let observer = Arc::new(CountingObserver::default());
    let t = task(0, 0);
    t.attach_helper(observer.clone());
    assert_eq!(observer.0.load(Ordering::SeqCst), 0);

    assert!(t.set_abort_state());
    assert!(!t.set_abort_state());
    assert!(t.in_abort_state());
    assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    assert!(t.detach_helper().is_some());
    assert!(t.detach_helper().is_none());
}

#[test]
fn abort_before_attach_is_forwarded_on_attach() {
    let observer = Arc::new(CountingObserver::default());
    let t = task(1, 0);
    assert!(t.set_abort_state());
    t.attach_helper(observer.clone());
    assert_eq!(observer.0.load(Ordering::SeqCst), 1);
}

///////////////////////////////////////////////////////////////////////////
// Monitor
///////////////////////////////////////////////////////////////////////////

#[test]
fn reentrant_acquire() {
    let monitor = TestMonitor::new(None);
    let t0 = task(0, 0);

    assert_ok_eq!(monitor.acquire(&1, &t0), AcquireStatus::Granted);
    assert_ok_eq!(monitor.acquire(&1, &t0), AcquireStatus::Granted);
    assert_some_eq!(monitor.owner_of(&1), 0);
    assert_eq!(monitor.waiting_tasks(&1), vec![0]);
    assert_eq!(monitor.num_tracked_resources(0), 1);
    assert_eq!(monitor.num_resources(), 1);
}

#[test]
fn aborted_owner_reacquire_is_denied() {
    let monitor = TestMonitor::new(None);
    let t1 = task(1, 0);
    assert_ok_eq!(monitor.acquire(&7, &t1), AcquireStatus::Granted);

    t1.set_abort_state();
    assert_ok_eq!(monitor.acquire(&7, &t1), AcquireStatus::Aborted);
    assert_ok_eq!(monitor.acquire(&8, &t1), AcquireStatus::Aborted);
    // Ownership is only given up on release.
    assert_some_eq!(monitor.owner_of(&7), 1);
    assert_none!(monitor.owner_of(&8));
    assert_eq!(monitor.num_tracked_resources(1), 1);

    assert_ok!(monitor.release(&t1));
    assert_none!(monitor.owner_of(&7));
}

#[test]
fn aborted_requester_is_not_queued() {
    let monitor = TestMonitor::new(None);
    let t0 = task(0, 0);
    let t5 = task(5, 0);
    assert_ok_eq!(monitor.acquire(&7, &t5), AcquireStatus::Granted);

    t0.set_abort_state();
    assert_ok_eq!(monitor.acquire(&7, &t0), AcquireStatus::Aborted);
    assert!(!t5.in_abort_state());
    assert_eq!(monitor.waiting_tasks(&7), vec![5]);
    assert_eq!(monitor.num_tracked_resources(0), 0);
}

#[test]
fn higher_index_waits_for_owner() {
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let t0 = task(0, 0);
    let t1 = task(1, 0);
    assert_ok_eq!(monitor.acquire(&9, &t0), AcquireStatus::Granted);

    thread::scope(|s| {
        let waiter = s.spawn(|| monitor.acquire(&9, &t1));
        wait_until(|| monitor.waiting_tasks(&9) == vec![0, 1]);
        assert!(!t0.in_abort_state());
        assert_some_eq!(monitor.owner_of(&9), 0);

        assert_ok_eq!(
            monitor.commit_kernel_for_task(&t0, RecordCommit::new(&log, 0)),
            true
        );
        assert_ok_eq!(waiter.join().unwrap(), AcquireStatus::Granted);
    });

    assert_some_eq!(monitor.owner_of(&9), 1);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t1, RecordCommit::new(&log, 1)),
        true
    );
    assert_eq!(*log.lock(), vec![0, 1]);
    assert_none!(monitor.owner_of(&9));
}

#[test]
fn lower_index_overtakes_parked_waiter() {
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let (t0, t1, t2) = (task(0, 0), task(1, 0), task(2, 0));
    assert_ok_eq!(monitor.acquire(&3, &t0), AcquireStatus::Granted);

    thread::scope(|s| {
        let late = s.spawn(|| monitor.acquire(&3, &t2));
        wait_until(|| monitor.waiting_tasks(&3) == vec![0, 2]);
        let early = s.spawn(|| monitor.acquire(&3, &t1));
        wait_until(|| monitor.waiting_tasks(&3) == vec![0, 1, 2]);
        // Neither waiter precedes the owner.
        assert!(!t0.in_abort_state());

        assert_ok_eq!(
            monitor.commit_kernel_for_task(&t0, RecordCommit::new(&log, 0)),
            true
        );
        assert_ok_eq!(early.join().unwrap(), AcquireStatus::Granted);
        assert_some_eq!(monitor.owner_of(&3), 1);
        assert_eq!(monitor.waiting_tasks(&3), vec![1, 2]);
        assert!(!late.is_finished());

        assert_ok_eq!(
            monitor.commit_kernel_for_task(&t1, RecordCommit::new(&log, 1)),
            true
        );
        assert_ok_eq!(late.join().unwrap(), AcquireStatus::Granted);
    });

    assert_some_eq!(monitor.owner_of(&3), 2);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t2, RecordCommit::new(&log, 2)),
        true
    );
    assert_eq!(*log.lock(), vec![0, 1, 2]);
    assert!(!t1.in_abort_state() && !t2.in_abort_state());
}

#[test]
fn priority_inversion_aborts_owner() {
    init_logging();
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let t0 = task(0, 0);
    let t1 = task(1, 0);
    assert_ok_eq!(monitor.acquire(&7, &t1), AcquireStatus::Granted);

    thread::scope(|s| {
        let preempting = s.spawn(|| monitor.acquire(&7, &t0));
        wait_until(|| t1.in_abort_state());
        // Preemption only flags the owner, ownership moves on release.
        assert_some_eq!(monitor.owner_of(&7), 1);

        assert_ok_eq!(
            monitor.commit_kernel_for_task(&t1, RecordCommit::new(&log, 1)),
            false
        );
        assert_ok_eq!(preempting.join().unwrap(), AcquireStatus::Granted);
    });

    assert!(!t0.in_abort_state());
    assert_some_eq!(monitor.owner_of(&7), 0);
    assert_eq!(monitor.num_tracked_resources(1), 0);

    // The re-created transaction queues behind the lower index.
    let t1_retry = task(1, 1);
    thread::scope(|s| {
        let retry = s.spawn(|| monitor.acquire(&7, &t1_retry));
        wait_until(|| monitor.waiting_tasks(&7) == vec![0, 1]);
        assert_ok_eq!(
            monitor.commit_kernel_for_task(&t0, RecordCommit::new(&log, 0)),
            true
        );
        assert_ok_eq!(retry.join().unwrap(), AcquireStatus::Granted);
    });
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t1_retry, RecordCommit::new(&log, 1)),
        true
    );
    assert_eq!(*log.lock(), vec![0, 1]);
    assert_eq!(monitor.commit_counter(), 2);
}

#[test]
fn commits_follow_index_order() {
    const NUM_TASKS: TxnIndex = 8;
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let tasks: Vec<_> = (0..NUM_TASKS).map(|idx| task(idx, 0)).collect();

    thread::scope(|s| {
        for t in tasks.iter().rev() {
            let (monitor, log) = (&monitor, &log);
            s.spawn(move || {
                let address = t.index() as u8;
                assert_ok_eq!(monitor.acquire(&address, t), AcquireStatus::Granted);
                assert_ok_eq!(
                    monitor.commit_kernel_for_task(t, RecordCommit::new(log, t.index())),
                    true
                );
            });
        }
    });

    assert_eq!(*log.lock(), (0..NUM_TASKS).collect::<Vec<_>>());
    assert_eq!(monitor.commit_counter(), NUM_TASKS);
    for idx in 0..NUM_TASKS {
        assert_eq!(monitor.num_tracked_resources(idx), 0);
        assert_none!(monitor.owner_of(&(idx as u8)));
    }
}

#[test]
fn aborted_commit_is_refused() {
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let t0 = task(0, 0);
    assert_ok_eq!(monitor.acquire(&1, &t0), AcquireStatus::Granted);
    assert_ok_eq!(monitor.acquire(&2, &t0), AcquireStatus::Granted);

    assert!(monitor.abort(&t0));
    assert!(!monitor.abort(&t0));
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t0, RecordCommit::new(&log, 0)),
        false
    );
    assert!(log.lock().is_empty());
    assert_eq!(monitor.commit_counter(), 0);
    assert_eq!(monitor.num_tracked_resources(0), 0);
    assert_none!(monitor.owner_of(&1));
    assert_none!(monitor.owner_of(&2));

    // The retry of the same index commits.
    let t0_retry = task(0, 1);
    assert_ok_eq!(monitor.acquire(&1, &t0_retry), AcquireStatus::Granted);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t0_retry, RecordCommit::new(&log, 0)),
        true
    );
    assert_eq!(*log.lock(), vec![0]);
}

#[test]
fn commit_behind_counter_is_invariant_error() {
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&task(0, 0), RecordCommit::new(&log, 0)),
        true
    );
    assert_matches!(
        monitor.commit_kernel_for_task(&task(0, 1), RecordCommit::new(&log, 0)),
        Err(PanicError::CodeInvariantError(_))
    );
    assert_eq!(*log.lock(), vec![0]);
}

#[test]
fn abort_wakes_parked_waiter() {
    let monitor = TestMonitor::new(None);
    let t0 = task(0, 0);
    let t3 = task(3, 0);
    assert_ok_eq!(monitor.acquire(&5, &t0), AcquireStatus::Granted);

    thread::scope(|s| {
        let waiter = s.spawn(|| monitor.acquire(&5, &t3));
        wait_until(|| monitor.waiting_tasks(&5) == vec![0, 3]);
        assert!(monitor.abort(&t3));
        assert_ok_eq!(waiter.join().unwrap(), AcquireStatus::Aborted);
    });

    // The aborted waiter left the queue right away.
    assert_eq!(monitor.waiting_tasks(&5), vec![0]);
    assert_eq!(monitor.num_tracked_resources(3), 0);
    assert_some_eq!(monitor.owner_of(&5), 0);
}

#[test]
fn release_withdraws_from_every_queue() {
    let monitor = TestMonitor::new(None);
    let t0 = task(0, 0);
    let t1 = task(1, 0);
    for address in 1..=3 {
        assert_ok_eq!(monitor.acquire(&address, &t1), AcquireStatus::Granted);
    }
    assert_eq!(monitor.num_tracked_resources(1), 3);

    assert_ok!(monitor.release(&t1));
    assert_eq!(monitor.num_tracked_resources(1), 0);
    assert_eq!(monitor.num_resources(), 0);
    for address in 1..=3 {
        assert_none!(monitor.owner_of(&address));
        assert!(monitor.waiting_tasks(&address).is_empty());
    }
    // Released addresses are free for anyone.
    assert_ok_eq!(monitor.acquire(&2, &t0), AcquireStatus::Granted);
    // Releasing a task that holds nothing is a no-op.
    assert_ok!(monitor.release(&t1));
}

#[test]
fn halt_wakes_waiters_and_denies_everything() {
    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let t0 = task(0, 0);
    let t1 = task(1, 0);
    assert_ok_eq!(monitor.acquire(&4, &t0), AcquireStatus::Granted);

    thread::scope(|s| {
        let waiter = s.spawn(|| monitor.acquire(&4, &t1));
        let committer = s.spawn(|| {
            let t2 = task(2, 0);
            monitor.commit_kernel_for_task(&t2, RecordCommit::new(&log, 2))
        });
        wait_until(|| monitor.waiting_tasks(&4) == vec![0, 1]);

        assert!(monitor.halt());
        assert!(!monitor.halt());
        assert_ok_eq!(waiter.join().unwrap(), AcquireStatus::Aborted);
        assert_ok_eq!(committer.join().unwrap(), false);
    });

    assert!(monitor.is_halted());
    assert!(t0.in_abort_state());
    assert_ok_eq!(monitor.acquire(&8, &task(5, 0)), AcquireStatus::Aborted);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t0, RecordCommit::new(&log, 0)),
        false
    );
    assert!(log.lock().is_empty());
}

#[test]
fn halting_commit_stops_later_commits() {
    struct Halting;
    impl BufferedState for Halting {
        fn apply(self) {}

        fn halts_batch(&self) -> bool {
            true
        }
    }

    let monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let t1 = task(1, 0);
    assert_ok_eq!(monitor.acquire(&3, &t1), AcquireStatus::Granted);

    assert_ok_eq!(monitor.commit_kernel_for_task(&task(0, 0), Halting), true);
    assert!(monitor.is_halted());
    assert!(t1.in_abort_state());
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t1, RecordCommit::new(&log, 1)),
        false
    );
    assert_eq!(monitor.commit_counter(), 1);
    assert!(log.lock().is_empty());
}

#[test]
fn watchdog_bounds_waits() {
    let monitor = TestMonitor::new(Some(Duration::from_millis(20)));
    let log = Mutex::new(vec![]);
    let t0 = task(0, 0);
    let t1 = task(1, 0);
    assert_ok_eq!(monitor.acquire(&6, &t0), AcquireStatus::Granted);

    assert_matches!(
        monitor.acquire(&6, &t1),
        Err(PanicError::WaitTimeout { txn_idx: 1, .. })
    );
    assert_matches!(
        monitor.commit_kernel_for_task(&task(2, 0), RecordCommit::new(&log, 2)),
        Err(PanicError::WaitTimeout { txn_idx: 2, .. })
    );
    assert!(log.lock().is_empty());
}

#[test]
fn clear_resets_state() {
    let mut monitor = TestMonitor::new(None);
    let log = Mutex::new(vec![]);
    let t0 = task(0, 0);
    assert_ok_eq!(monitor.acquire(&1, &t0), AcquireStatus::Granted);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&t0, RecordCommit::new(&log, 0)),
        true
    );
    assert_ok_eq!(monitor.acquire(&2, &task(1, 0)), AcquireStatus::Granted);
    monitor.halt();

    monitor.clear();
    assert_eq!(monitor.commit_counter(), 0);
    assert_eq!(monitor.num_resources(), 0);
    assert_eq!(monitor.num_tracked_resources(1), 0);
    assert!(!monitor.is_halted());

    // Index 0 can commit again in the next batch.
    let next = task(0, 0);
    assert_ok_eq!(monitor.acquire(&2, &next), AcquireStatus::Granted);
    assert_ok_eq!(
        monitor.commit_kernel_for_task(&next, RecordCommit::new(&log, 0)),
        true
    );
    assert_eq!(*log.lock(), vec![0, 0]);
}

///////////////////////////////////////////////////////////////////////////
// Block executor
///////////////////////////////////////////////////////////////////////////

fn increment(address: u8, long_running: bool) -> Transaction<u8> {
    Transaction::Write {
        incarnation: Arc::new(AtomicUsize::new(0)),
        reads: vec![vec![(address, 0)]],
        writes: vec![vec![((address, 0), Some(1))]],
        long_running,
    }
}

fn executor(concurrency_level: usize) -> TestExecutor {
    let executor_thread_pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency_level)
            .build()
            .unwrap(),
    );
    TestExecutor::new(
        BlockExecutorConfig::new(concurrency_level),
        executor_thread_pool,
    )
    .unwrap()
}

#[test]
fn contended_counter() {
    init_logging();
    const NUM_TXNS: usize = 200;
    let transactions: Vec<_> = (0..NUM_TXNS)
        .map(|idx| increment(0, idx % 10 == 0))
        .collect();
    let store = TestStore::new();

    let outputs = executor(4)
        .execute_transactions_parallel((), &transactions, &store)
        .unwrap();

    assert_eq!(outputs.len(), NUM_TXNS);
    assert_eq!(outputs[0], Output(vec![None]));
    for (idx, output) in outputs.iter().enumerate().skip(1) {
        assert_eq!(*output, Output(vec![Some(idx as ValueType)]));
    }
    assert_some_eq!(store.get_state_value(&0, &0), NUM_TXNS as ValueType);
}

#[test]
fn parallel_matches_sequential() {
    // Transaction i moves the counter of address i % 3 and reads its neighbour.
    let build = || -> Vec<Transaction<u8>> {
        (0..60u8)
            .map(|idx| Transaction::Write {
                incarnation: Arc::new(AtomicUsize::new(0)),
                reads: vec![vec![(idx % 3, 0), ((idx + 1) % 3, 1)]],
                writes: vec![vec![
                    ((idx % 3, 0), Some(idx as ValueType)),
                    (((idx + 1) % 3, 1), Some(1)),
                ]],
                long_running: idx % 7 == 0,
            })
            .collect()
    };

    let parallel_store = TestStore::new();
    let parallel = executor(4)
        .execute_block((), build(), &parallel_store)
        .unwrap();
    let sequential_store = TestStore::new();
    let sequential = executor(1)
        .execute_block((), build(), &sequential_store)
        .unwrap();

    assert_eq!(parallel, sequential);
    assert_eq!(parallel_store.snapshot(), sequential_store.snapshot());
}

#[test]
fn fatal_vm_error_commits_prefix() {
    let mut transactions: Vec<_> = (0..20).map(|idx| increment(idx % 2, false)).collect();
    transactions[5] = Transaction::Abort;
    let store = TestStore::new();

    let result = executor(4).execute_transactions_parallel((), &transactions, &store);
    assert_matches!(result, Err(BlockExecutionError::FatalVMError(5)));

    // Transactions 0..5 committed, nothing after the failing one.
    let expected: BTreeMap<_, _> = [((0, 0), 3), ((1, 0), 2)].into_iter().collect();
    assert_eq!(store.snapshot(), expected);

    let sequential_store = TestStore::new();
    let result = executor(1).execute_transactions_sequential((), &transactions, &sequential_store);
    assert_matches!(result, Err(BlockExecutionError::FatalVMError(5)));
    assert_eq!(sequential_store.snapshot(), expected);
}

#[test]
fn empty_and_single_transaction_blocks() {
    let store = TestStore::new();
    let executor = executor(4);
    assert_ok_eq!(
        executor.execute_transactions_parallel((), &[], &store),
        vec![]
    );
    assert_ok_eq!(
        executor.execute_block((), vec![increment(1, true)], &store),
        vec![Output(vec![None])]
    );
    assert_eq!(store.len(), 1);
}

#[test]
fn zero_concurrency_is_rejected() {
    let executor_thread_pool = Arc::new(rayon::ThreadPoolBuilder::new().build().unwrap());
    assert!(TestExecutor::new(BlockExecutorConfig::new(0), executor_thread_pool).is_err());
}
