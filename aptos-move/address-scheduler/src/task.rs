// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{errors::SpeculativeAbort, transaction_task::AbortObserver, types::TxnIndex};
use std::{fmt::Debug, hash::Hash, sync::Arc};

/// The execution result of a transaction
#[derive(Debug)]
pub enum ExecutionStatus<T, E> {
    /// Transaction was executed successfully.
    Success(T),
    /// Transaction hit a none recoverable error during execution, halt the execution and propagate
    /// the error back to the caller.
    Abort(E),
    /// The execution observed that its task was asked to abort and unwound early. The result
    /// is discarded and the transaction re-executed.
    SpeculativeExecutionAbortError(String),
}

/// Trait that defines a transaction that could be parallel executed by the scheduler. Each
/// transaction reads and writes slots (`Key`) of accounts (`Address`). Ownership is arbitrated
/// per address: a transaction must own an address before touching any of its slots.
pub trait Transaction: Sync + Send + 'static {
    type Address: Ord + Clone + Hash + Eq + Debug + Send + Sync;
    type Key: Ord + Clone + Hash + Eq + Debug + Send + Sync;
    type Value: Clone + Debug + Send + Sync;
}

/// What an execution unit sees of the state while executing one transaction.
pub trait TStateView {
    type Txn: Transaction;

    /// Reads a slot, acquiring its address first when executing in parallel. Writes of the
    /// same transaction are visible to its later reads.
    fn get_state_value(
        &self,
        address: &<Self::Txn as Transaction>::Address,
        key: &<Self::Txn as Transaction>::Key,
    ) -> Result<Option<<Self::Txn as Transaction>::Value>, SpeculativeAbort>;

    /// Buffers a write (`None` deletes), acquiring the address first when executing in
    /// parallel. Buffered writes reach the ground truth only if the transaction commits.
    fn set_state_value(
        &self,
        address: &<Self::Txn as Transaction>::Address,
        key: &<Self::Txn as Transaction>::Key,
        value: Option<<Self::Txn as Transaction>::Value>,
    ) -> Result<(), SpeculativeAbort>;

    fn txn_idx(&self) -> TxnIndex;

    /// Cheap poll for long-running executions that do not touch state for a while.
    fn is_aborted(&self) -> bool;

    /// Registers a hook that is invoked as soon as the transaction is asked to abort.
    fn attach_abort_observer(&self, observer: Arc<dyn AbortObserver>);
}

/// Trait for single threaded transaction executor.
pub trait ExecutorTask: Sync {
    /// Type of transaction and its associated address, key and value.
    type Txn: Transaction;

    /// The output of a transaction. State changes are not part of it: they go through the
    /// view and are committed by the scheduler.
    type Output: Send + Debug + 'static;

    /// Type of error when the executor failed to process a transaction and needs to abort.
    type Error: Clone + Send + Sync + Debug + Eq + 'static;

    /// Type to intialize the single thread transaction executor. Copy and Sync are required because
    /// we will create an instance of executor on each individual thread.
    type Argument: Sync + Copy;

    /// Create an instance of the transaction executor.
    fn init(args: Self::Argument) -> Self;

    /// Execute a single transaction given the view of the current state.
    fn execute_transaction(
        &self,
        view: &impl TStateView<Txn = Self::Txn>,
        txn: &Self::Txn,
        txn_idx: TxnIndex,
    ) -> ExecutionStatus<Self::Output, Self::Error>;
}
