// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{BlockExecutorConfig, ConfigError},
    counters::{
        PARALLEL_EXECUTION_SECONDS, SEQUENTIAL_EXECUTION_SECONDS, SPECULATIVE_RETRY_COUNT,
        TASK_EXECUTE_SECONDS,
    },
    errors::{code_invariant_error, BlockExecutionError, BlockExecutionResult},
    monitor::AddressResourceMonitor,
    state_store::{PendingCommit, StateStore, WriteSet},
    task::{ExecutionStatus, ExecutorTask, Transaction},
    transaction_task::TransactionTask,
    types::{AtomicTxnIndex, Incarnation, TxnIndex},
    view::{LatestView, ParallelState, ViewState},
};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use rayon::ThreadPool;
use std::{
    marker::PhantomData,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tracing::{debug, info};

pub struct BlockExecutor<T, E, S> {
    // Number of active concurrent tasks, corresponding to the maximum number of rayon
    // threads that may be concurrently participating in parallel execution.
    concurrency_level: usize,
    wait_timeout: Option<Duration>,
    executor_thread_pool: Arc<ThreadPool>,
    phantom: PhantomData<(T, E, S)>,
}

impl<T, E, S> BlockExecutor<T, E, S>
where
    T: Transaction,
    E: ExecutorTask<Txn = T>,
    S: StateStore<Address = T::Address, Key = T::Key, Value = T::Value>,
{
    pub fn new(
        config: BlockExecutorConfig,
        executor_thread_pool: Arc<ThreadPool>,
    ) -> Result<Self, ConfigError> {
        config.sanitize()?;
        Ok(Self {
            concurrency_level: config.concurrency_level,
            wait_timeout: config.wait_timeout(),
            executor_thread_pool,
            phantom: PhantomData,
        })
    }

    /// Runs incarnations of `txn_idx` until one of them commits. Returns `None` if the block
    /// was halted before that happened.
    fn execute_until_committed<'a>(
        txn_idx: TxnIndex,
        txn: &'a T,
        executor: &E,
        base_view: &S,
        monitor: &AddressResourceMonitor<T::Address, &'a T>,
    ) -> BlockExecutionResult<Option<E::Output>, E::Error> {
        let mut incarnation: Incarnation = 0;
        loop {
            let task = Arc::new(TransactionTask::new(txn_idx, incarnation, txn));
            let view = LatestView::<T, S, &T>::new(
                base_view,
                ViewState::Sync(ParallelState::new(monitor, &task)),
                txn_idx,
            );
            let execute_result = {
                let _timer = TASK_EXECUTE_SECONDS.start_timer();
                executor.execute_transaction(&view, task.context(), txn_idx)
            };
            // The execution unit returned, later aborts only concern the commit wait.
            task.detach_helper();

            if let Some(err) = view.take_fatal_error() {
                monitor.release(&task)?;
                return Err(err.into());
            }

            match execute_result {
                ExecutionStatus::Success(output) => {
                    let buffered = PendingCommit::new(base_view, view.into_write_set());
                    if monitor.commit_kernel_for_task(&task, buffered)? {
                        return Ok(Some(output));
                    }
                },
                ExecutionStatus::Abort(err) => {
                    // A committed VM error ends the block at this position.
                    let buffered = PendingCommit::halting(base_view, WriteSet::new());
                    if monitor.commit_kernel_for_task(&task, buffered)? {
                        return Err(BlockExecutionError::FatalVMError(err));
                    }
                },
                ExecutionStatus::SpeculativeExecutionAbortError(msg) => {
                    monitor.release(&task)?;
                    if !task.in_abort_state() {
                        return Err(code_invariant_error(format!(
                            "Transaction {} reported a speculative abort without being aborted: {}",
                            txn_idx, msg
                        ))
                        .into());
                    }
                },
            }

            if monitor.is_halted() {
                return Ok(None);
            }
            SPECULATIVE_RETRY_COUNT.inc();
            debug!(
                txn_idx = txn_idx,
                incarnation = incarnation,
                "Speculative execution aborted, re-executing"
            );
            incarnation += 1;
        }
    }

    fn worker_loop<'a>(
        executor_arguments: &E::Argument,
        block: &'a [T],
        base_view: &S,
        monitor: &AddressResourceMonitor<T::Address, &'a T>,
        shared_counter: &AtomicTxnIndex,
        final_results: &[CachePadded<Mutex<Option<E::Output>>>],
        maybe_error: &Mutex<Option<BlockExecutionError<E::Error>>>,
    ) {
        // Make executor for each thread.
        let executor = E::init(*executor_arguments);
        let num_txns = block.len() as TxnIndex;

        loop {
            let txn_idx = shared_counter.fetch_add(1, Ordering::SeqCst);
            if txn_idx >= num_txns || monitor.is_halted() {
                break;
            }

            match Self::execute_until_committed(
                txn_idx,
                &block[txn_idx as usize],
                &executor,
                base_view,
                monitor,
            ) {
                Ok(Some(output)) => {
                    *final_results[txn_idx as usize].lock() = Some(output);
                },
                Ok(None) => break,
                Err(err) => {
                    maybe_error.lock().get_or_insert(err);
                    monitor.halt();
                    break;
                },
            }
        }
    }

    pub fn execute_transactions_parallel(
        &self,
        executor_initial_arguments: E::Argument,
        signature_verified_block: &[T],
        base_view: &S,
    ) -> BlockExecutionResult<Vec<E::Output>, E::Error> {
        let _timer = PARALLEL_EXECUTION_SECONDS.start_timer();
        if signature_verified_block.is_empty() {
            return Ok(vec![]);
        }

        let num_txns = signature_verified_block.len();
        let num_workers = self.concurrency_level.min(num_txns);
        let monitor = AddressResourceMonitor::new(self.wait_timeout);
        let shared_counter = AtomicTxnIndex::new(0);
        let final_results: Vec<_> = (0..num_txns)
            .map(|_| CachePadded::new(Mutex::new(None)))
            .collect();
        let maybe_error = Mutex::new(None);

        info!(
            num_txns = num_txns,
            num_workers = num_workers,
            "Launching parallel block execution"
        );
        self.executor_thread_pool.scope(|s| {
            for _ in 0..num_workers {
                s.spawn(|_| {
                    Self::worker_loop(
                        &executor_initial_arguments,
                        signature_verified_block,
                        base_view,
                        &monitor,
                        &shared_counter,
                        &final_results,
                        &maybe_error,
                    );
                });
            }
        });

        if let Some(err) = maybe_error.into_inner() {
            return Err(err);
        }
        let committed = monitor.commit_counter();
        if committed as usize != num_txns {
            return Err(code_invariant_error(format!(
                "Parallel execution finished with {} of {} transactions committed",
                committed, num_txns
            ))
            .into());
        }

        final_results
            .into_iter()
            .enumerate()
            .map(|(idx, output)| {
                output.into_inner().into_inner().ok_or_else(|| {
                    BlockExecutionError::from(code_invariant_error(format!(
                        "Missing output of committed transaction {}",
                        idx
                    )))
                })
            })
            .collect()
    }

    pub fn execute_transactions_sequential(
        &self,
        executor_arguments: E::Argument,
        signature_verified_block: &[T],
        base_view: &S,
    ) -> BlockExecutionResult<Vec<E::Output>, E::Error> {
        let _timer = SEQUENTIAL_EXECUTION_SECONDS.start_timer();
        let executor = E::init(executor_arguments);
        let mut ret = Vec::with_capacity(signature_verified_block.len());

        for (idx, txn) in signature_verified_block.iter().enumerate() {
            let txn_idx = idx as TxnIndex;
            let unsync_view = LatestView::<T, S, ()>::new(base_view, ViewState::Unsync, txn_idx);
            let res = {
                let _timer = TASK_EXECUTE_SECONDS.start_timer();
                executor.execute_transaction(&unsync_view, txn, txn_idx)
            };

            match res {
                ExecutionStatus::Success(output) => {
                    base_view.apply_writes(unsync_view.into_write_set());
                    ret.push(output);
                },
                ExecutionStatus::Abort(err) => {
                    return Err(BlockExecutionError::FatalVMError(err));
                },
                ExecutionStatus::SpeculativeExecutionAbortError(msg) => {
                    return Err(code_invariant_error(format!(
                        "Sequential execution of transaction {} must not be aborted: {}",
                        txn_idx, msg
                    ))
                    .into());
                },
            }
        }
        Ok(ret)
    }

    /// Executes the block against `base_view` and commits it there. Outputs are in block
    /// order. On error the base view holds the commits of a prefix of the block.
    pub fn execute_block(
        &self,
        executor_arguments: E::Argument,
        signature_verified_block: Vec<T>,
        base_view: &S,
    ) -> BlockExecutionResult<Vec<E::Output>, E::Error> {
        let ret = if self.concurrency_level > 1 && signature_verified_block.len() > 1 {
            self.execute_transactions_parallel(
                executor_arguments,
                &signature_verified_block,
                base_view,
            )
        } else {
            self.execute_transactions_sequential(
                executor_arguments,
                &signature_verified_block,
                base_view,
            )
        };

        self.executor_thread_pool.spawn(move || {
            // Explicit async drops.
            drop(signature_verified_block);
        });
        ret
    }
}
