// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    task::{ExecutionStatus, ExecutorTask, TStateView, Transaction as TransactionType},
    transaction_task::AbortObserver,
    types::TxnIndex,
};
use proptest::{collection::vec, prelude::*, sample::Index};
use proptest_derive::Arbitrary;
use std::{
    collections::BTreeSet,
    fmt::Debug,
    hash::Hash,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

/// Slot of an account. Accounts are the unit of ownership, slots only address values inside.
pub type SlotType = u8;
pub type ValueType = u64;

/// Number of spin iterations of a long-running transaction, polled for abort on each one.
pub const LONG_RUNNING_ITERATIONS: usize = 2_000;

///////////////////////////////////////////////////////////////////////////
// Generation of transactions
///////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug)]
pub struct TransactionGenParams {
    /// Each transaction's write-set consists of between 1 and write_size-1 many writes.
    pub write_size: usize,
    /// Each transaction's read-set consists of between 1 and read_size-1 many reads.
    pub read_size: usize,
    /// Number of slots per account that reads and writes are spread over.
    pub num_slots: SlotType,
    /// The number of different read- and write-sets that an execution of the transaction may have
    /// is going to be between 1 and read_write_alternatives-1, i.e. read_write_alternatives = 2
    /// corresponds to a static transaction, while read_write_alternatives > 2 may lead to dynamic
    /// behavior when executing different incarnations of the transaction.
    pub read_write_alternatives: usize,
    /// Probability that the transaction spins between its reads and its writes.
    pub long_running_probability: f64,
}

impl TransactionGenParams {
    pub fn new_dynamic() -> Self {
        TransactionGenParams {
            read_write_alternatives: 4,
            ..Default::default()
        }
    }

    pub fn new_long_running() -> Self {
        TransactionGenParams {
            long_running_probability: 0.2,
            ..Default::default()
        }
    }
}

impl Default for TransactionGenParams {
    fn default() -> Self {
        TransactionGenParams {
            write_size: 4,
            read_size: 6,
            num_slots: 4,
            read_write_alternatives: 2,
            long_running_probability: 0.0,
        }
    }
}

#[derive(Arbitrary, Debug, Clone)]
#[proptest(params = "TransactionGenParams")]
pub struct TransactionGen {
    /// Generate account indices, slots and salts for the possible write-sets. A `None` salt
    /// deletes the slot.
    #[proptest(
        strategy = "vec(vec((any::<Index>(), 0..params.num_slots, proptest::option::weighted(0.9, any::<ValueType>())), 1..params.write_size), 1..params.read_write_alternatives)"
    )]
    keys_modified: Vec<Vec<(Index, SlotType, Option<ValueType>)>>,
    /// Generate account indices and slots for the possible read-sets.
    #[proptest(
        strategy = "vec(vec((any::<Index>(), 0..params.num_slots), 1..params.read_size), 1..params.read_write_alternatives)"
    )]
    keys_read: Vec<Vec<(Index, SlotType)>>,
    #[proptest(strategy = "proptest::bool::weighted(params.long_running_probability)")]
    long_running: bool,
}

/// A naive transaction that could be used to test the correctness and throughput of the system.
/// Written values are derived from the values read, so that any read that misses an earlier
/// write (or observes a later one) changes the final state.
///
/// To test dynamic behavior, different read and write sets are generated and used depending
/// on the incarnation counter value. Each execution of the transaction increments the counter,
/// and its value determines the index for choosing the read & write sets of that execution.
#[derive(Debug, Clone)]
pub enum Transaction<A> {
    Write {
        /// Incarnation counter for dynamic behavior i.e. incarnations differ in reads and writes.
        incarnation: Arc<AtomicUsize>,
        /// Possible read-sets, chosen round-robin by the incarnation counter.
        reads: Vec<Vec<(A, SlotType)>>,
        /// Possible write-sets, chosen round-robin by the incarnation counter. Each write
        /// stores `salt + sum of values read` into the slot, or deletes it.
        writes: Vec<Vec<((A, SlotType), Option<ValueType>)>>,
        /// Spin between reads and writes, holding every account read so far.
        long_running: bool,
    },
    /// Fail with a non-recoverable error.
    Abort,
}

impl TransactionGen {
    fn writes_from_gen<A: Clone + Ord>(
        universe: &[A],
        generated: Vec<Vec<(Index, SlotType, Option<ValueType>)>>,
    ) -> Vec<Vec<((A, SlotType), Option<ValueType>)>> {
        let mut ret = vec![];
        for write_gen in generated.into_iter() {
            let mut keys_modified = BTreeSet::new();
            let mut incarnation_writes = vec![];
            for (idx, slot, salt) in write_gen.into_iter() {
                let key = (universe[idx.index(universe.len())].clone(), slot);
                if keys_modified.insert(key.clone()) {
                    incarnation_writes.push((key, salt));
                }
            }
            ret.push(incarnation_writes);
        }
        ret
    }

    fn reads_from_gen<A: Clone>(
        universe: &[A],
        generated: Vec<Vec<(Index, SlotType)>>,
    ) -> Vec<Vec<(A, SlotType)>> {
        generated
            .into_iter()
            .map(|read_gen| {
                read_gen
                    .into_iter()
                    .map(|(idx, slot)| (universe[idx.index(universe.len())].clone(), slot))
                    .collect()
            })
            .collect()
    }

    pub fn materialize<A: Clone + Ord>(self, universe: &[A]) -> Transaction<A> {
        Transaction::Write {
            incarnation: Arc::new(AtomicUsize::new(0)),
            reads: Self::reads_from_gen(universe, self.keys_read),
            writes: Self::writes_from_gen(universe, self.keys_modified),
            long_running: self.long_running,
        }
    }
}

impl<A> Transaction<A> {
    /// Read and write sets of the latest execution. Must be invoked after the transaction
    /// executed at least once if it is dynamic.
    pub(crate) fn last_read_write_sets(
        &self,
    ) -> Option<(&[(A, SlotType)], &[((A, SlotType), Option<ValueType>)])> {
        match self {
            Transaction::Write {
                incarnation,
                reads,
                writes,
                ..
            } => {
                let executions = incarnation.load(Ordering::SeqCst);
                let read_set = if reads.len() == 1 {
                    &reads[0]
                } else {
                    assert!(executions > 0, "must run after parallel execution");
                    &reads[(executions - 1) % reads.len()]
                };
                let write_set = if writes.len() == 1 {
                    &writes[0]
                } else {
                    assert!(executions > 0, "must run after parallel execution");
                    &writes[(executions - 1) % writes.len()]
                };
                Some((read_set, write_set))
            },
            Transaction::Abort => None,
        }
    }
}

impl<A> TransactionType for Transaction<A>
where
    A: Ord + Clone + Hash + Eq + Debug + Send + Sync + 'static,
{
    type Address = A;
    type Key = SlotType;
    type Value = ValueType;
}

/// Value a write stores, given its salt and the values read by the same execution.
pub(crate) fn written_value(salt: ValueType, reads: &[Option<ValueType>]) -> ValueType {
    reads
        .iter()
        .flatten()
        .fold(salt, |acc, value| acc.wrapping_add(*value))
}

///////////////////////////////////////////////////////////////////////////
// Naive transaction executor implementation.
///////////////////////////////////////////////////////////////////////////

/// Abort hook of a long-running execution, polled by its spin loop.
#[derive(Default)]
struct InterruptFlag(AtomicBool);

impl AbortObserver for InterruptFlag {
    fn external_set_abort_state(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct Task<A>(PhantomData<A>);

impl<A> Task<A> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<A> Default for Task<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ExecutorTask for Task<A>
where
    A: Ord + Clone + Hash + Eq + Debug + Send + Sync + 'static,
{
    type Argument = ();
    type Error = usize;
    type Output = Output;
    type Txn = Transaction<A>;

    fn init(_argument: Self::Argument) -> Self {
        Self::new()
    }

    fn execute_transaction(
        &self,
        view: &impl TStateView<Txn = Self::Txn>,
        txn: &Self::Txn,
        txn_idx: TxnIndex,
    ) -> ExecutionStatus<Self::Output, Self::Error> {
        match txn {
            Transaction::Write {
                incarnation,
                reads,
                writes,
                long_running,
            } => {
                // Use incarnation counter value as an index to determine the read-
                // and write-sets of the execution.
                let idx = incarnation.fetch_add(1, Ordering::SeqCst);
                let read_set = &reads[idx % reads.len()];
                let write_set = &writes[idx % writes.len()];

                let mut reads_result = vec![];
                for (address, slot) in read_set.iter() {
                    match view.get_state_value(address, slot) {
                        Ok(value) => reads_result.push(value),
                        Err(err) => {
                            return ExecutionStatus::SpeculativeExecutionAbortError(
                                err.to_string(),
                            )
                        },
                    }
                }

                if *long_running {
                    let interrupted = Arc::new(InterruptFlag::default());
                    view.attach_abort_observer(interrupted.clone());
                    for _ in 0..LONG_RUNNING_ITERATIONS {
                        if interrupted.0.load(Ordering::SeqCst) {
                            return ExecutionStatus::SpeculativeExecutionAbortError(format!(
                                "Long-running transaction {} interrupted",
                                txn_idx
                            ));
                        }
                        std::hint::spin_loop();
                    }
                }

                for ((address, slot), salt) in write_set.iter() {
                    let value = salt.map(|salt| written_value(salt, &reads_result));
                    if let Err(err) = view.set_state_value(address, slot, value) {
                        return ExecutionStatus::SpeculativeExecutionAbortError(err.to_string());
                    }
                }
                ExecutionStatus::Success(Output(reads_result))
            },
            Transaction::Abort => ExecutionStatus::Abort(view.txn_idx() as usize),
        }
    }
}

/// Values observed by the reads of the committed execution, in read-set order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output(pub Vec<Option<ValueType>>);
