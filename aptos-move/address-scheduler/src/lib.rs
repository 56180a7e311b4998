// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

/*!
The address scheduler executes a block of transactions on multiple threads and produces the
same outputs and final state as executing the block one transaction after the other, in
block order.

Every transaction of the block runs optimistically on some worker thread. Before reading or
writing any slot of an account, the execution acquires exclusive ownership of that account's
address from the [`AddressResourceMonitor`]. Ownership of an address is granted in ascending
transaction index order through a per-address waiting queue, and ownership lasts until the
transaction either commits or is aborted.

## Priority

The position of a transaction in the block is its priority: a lower index always wins. If a
lower-index transaction starts waiting on an address owned by a higher-index transaction, the
owner is flagged for abort (a priority inversion preemption) instead of letting the lower
index wait behind it. The aborted execution notices the flag, either when its next acquire is
denied or through an [`AbortObserver`] hooked into its execution loop, and unwinds. Its
buffered writes are discarded and the transaction is executed again as a new incarnation with
the same index.

## Commit

Writes are buffered by the execution view and are applied to the [`StateStore`] only by
[`AddressResourceMonitor::commit_kernel_for_task`], which lets transaction `i` commit only
after transactions `0..i` have committed. Committing releases every address the transaction
holds and wakes all parked workers, which re-check whether they can proceed.

Because a transaction holds every address it touched until it commits, and commits happen in
index order, a committed transaction observed exactly the state produced by the transactions
before it. The lowest uncommitted index is never preempted and never waits on a higher index
for long, so the block always makes progress.

## Failures

A non-recoverable VM error ([`ExecutionStatus::Abort`]) is committed at the position of the
failing transaction and halts the block: no later transaction commits. Scheduler failures
(broken invariants, an expired wait watchdog) also halt the block and are reported as
[`BlockExecutionError::FatalBlockExecutorError`].
!*/

mod address_resource;
pub mod config;
pub mod counters;
pub mod errors;
pub mod executor;
pub mod monitor;
#[cfg(any(test, feature = "fuzzing"))]
pub mod proptest_types;
pub mod state_store;
pub mod task;
pub mod transaction_task;
pub mod types;
#[cfg(test)]
mod unit_tests;
mod view;

pub use config::{BlockExecutorConfig, ConfigError};
pub use errors::{BlockExecutionError, BlockExecutionResult, PanicError, SpeculativeAbort};
pub use executor::BlockExecutor;
pub use monitor::{AcquireStatus, AddressResourceMonitor};
pub use state_store::{BufferedState, InMemoryStateStore, PendingCommit, StateStore, WriteSet};
pub use task::{ExecutionStatus, ExecutorTask, TStateView, Transaction};
pub use transaction_task::{AbortObserver, TransactionTask};
