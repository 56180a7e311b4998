// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    address_resource::AddressResource,
    counters::{ACQUIRE_WAIT_SECONDS, COMMIT_WAIT_SECONDS, PRIORITY_INVERSION_PREEMPTIONS},
    errors::{code_invariant_error, PanicError},
    state_store::BufferedState,
    transaction_task::TransactionTask,
    types::TxnIndex,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Outcome of [`AddressResourceMonitor::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    /// The task now owns the address (or already did).
    Granted,
    /// The task was flagged for abort (or the batch was halted) before ownership could be
    /// granted. The caller must stop touching shared state and unwind.
    Aborted,
}

struct MonitorState<A, C> {
    resources: HashMap<A, AddressResource<C>>,
    // txn_idx -> addresses the task is queued at or owns, for O(k) bulk release.
    ownerships: HashMap<TxnIndex, HashSet<A>>,
    // Index of the only transaction currently allowed to commit.
    commit_counter: TxnIndex,
    halted: bool,
}

impl<A, C> MonitorState<A, C> {
    fn new() -> Self {
        Self {
            resources: HashMap::new(),
            ownerships: HashMap::new(),
            commit_counter: 0,
            halted: false,
        }
    }
}

/// The single synchronization point of a batch: arbitrates exclusive ownership of addresses
/// among the batch's tasks and serializes their commits in index order.
///
/// Granting follows ascending index order, and a lower-index task that starts waiting on an
/// address held by a higher-index task forces the holder to abort rather than wait behind it.
/// Together with commits happening strictly in index order this makes the outcome of the
/// concurrent execution equal to executing the batch sequentially.
///
/// All state lives behind one mutex; parked threads wait on one condition variable and
/// re-check their predicate on every wake-up.
///
/// One monitor is created per batch and shared by reference with every worker.
pub struct AddressResourceMonitor<A, C> {
    state: Mutex<MonitorState<A, C>>,
    cvar: Condvar,
    wait_timeout: Option<Duration>,
}

impl<A, C> AddressResourceMonitor<A, C>
where
    A: Clone + Eq + Hash + Debug,
{
    /// `wait_timeout` bounds every individual wait in `acquire` and `commit_kernel_for_task`;
    /// `None` waits indefinitely.
    pub fn new(wait_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(MonitorState::new()),
            cvar: Condvar::new(),
            wait_timeout,
        }
    }

    /// Blocks until `task` owns `address`, or until `task` is aborted.
    ///
    /// Acquisition is reentrant: a task that already owns the address returns immediately
    /// without being re-queued. A task already flagged for abort gets `Aborted` right away.
    pub fn acquire(
        &self,
        address: &A,
        task: &Arc<TransactionTask<C>>,
    ) -> Result<AcquireStatus, PanicError> {
        let txn_idx = task.index();
        let mut state = self.state.lock();
        if state.halted {
            task.set_abort_state();
            return Ok(AcquireStatus::Aborted);
        }
        // An aborted task is neither granted nor queued, even as the current owner.
        if task.in_abort_state() {
            return Ok(AcquireStatus::Aborted);
        }

        let state_ref = &mut *state;
        let resource = state_ref
            .resources
            .entry(address.clone())
            .or_insert_with(AddressResource::new);
        if resource.is_owned_by(txn_idx) {
            return Ok(AcquireStatus::Granted);
        }

        let prev_owner = resource.owner().map(|owner| owner.index());
        if resource.add_to_waiting_queue(task) {
            PRIORITY_INVERSION_PREEMPTIONS.inc();
            debug!(
                txn_idx = txn_idx,
                owner_idx = ?prev_owner,
                address = ?address,
                "Lower index requested owned address, aborting owner"
            );
            self.cvar.notify_all();
        }
        state_ref
            .ownerships
            .entry(txn_idx)
            .or_default()
            .insert(address.clone());

        let started = Instant::now();
        loop {
            if task.in_abort_state() || state.halted {
                break;
            }
            let resource = Self::resource(&state, address)?;
            if resource.is_owned_by(txn_idx) {
                return Err(code_invariant_error(format!(
                    "Transaction {} became owner of {:?} while parked",
                    txn_idx, address
                )));
            }
            if !resource.is_owned() && resource.is_next_owner(task) {
                break;
            }
            self.wait(&mut state, txn_idx, "address ownership", started)?;
        }
        ACQUIRE_WAIT_SECONDS.observe(started.elapsed().as_secs_f64());

        let state_ref = &mut *state;
        let resource = Self::resource_mut(&mut state_ref.resources, address)?;
        if task.in_abort_state() || state_ref.halted {
            // Leave the queue right away, it may be blocking the next legitimate owner.
            resource.remove_from_waiting_queue(txn_idx);
            if let Some(tracked) = state_ref.ownerships.get_mut(&txn_idx) {
                tracked.remove(address);
            }
            self.cvar.notify_all();
            return Ok(AcquireStatus::Aborted);
        }

        if !resource.is_next_owner(task) {
            return Err(code_invariant_error(format!(
                "Transaction {} granted {:?} without being the next owner (head {:?})",
                txn_idx,
                address,
                resource.get_next_owner().map(|head| head.index())
            )));
        }
        resource.set_owner(Some(task.clone()));
        Ok(AcquireStatus::Granted)
    }

    /// Blocks until it is `task`'s turn to commit (or `task` is aborted), applies `buffered`
    /// if the task was not aborted, then releases everything the task holds and wakes all
    /// waiters. Returns whether the commit happened; on false the caller discards the result
    /// and may retry the transaction as a new task with the same index.
    pub fn commit_kernel_for_task<B: BufferedState>(
        &self,
        task: &Arc<TransactionTask<C>>,
        buffered: B,
    ) -> Result<bool, PanicError> {
        let txn_idx = task.index();
        let mut state = self.state.lock();
        if txn_idx < state.commit_counter {
            return Err(code_invariant_error(format!(
                "Transaction {} tried to commit, but commit counter is already at {}",
                txn_idx, state.commit_counter
            )));
        }

        let started = Instant::now();
        while state.commit_counter != txn_idx && !task.in_abort_state() && !state.halted {
            self.wait(&mut state, txn_idx, "its commit turn", started)?;
        }
        COMMIT_WAIT_SECONDS.observe(started.elapsed().as_secs_f64());

        let committed = !task.in_abort_state() && !state.halted;
        if committed {
            let halts_batch = buffered.halts_batch();
            buffered.apply();
            state.commit_counter += 1;
            if halts_batch {
                Self::halt_locked(&mut state);
                info!(txn_idx = txn_idx, "Batch halted by committed transaction");
            }
        }

        Self::release_locked(&mut state, txn_idx)?;
        self.cvar.notify_all();
        Ok(committed)
    }

    /// Releases every address `task` is queued at or owns, without committing.
    pub fn release(&self, task: &TransactionTask<C>) -> Result<(), PanicError> {
        let mut state = self.state.lock();
        Self::release_locked(&mut state, task.index())?;
        self.cvar.notify_all();
        Ok(())
    }

    /// Flags `task` for abort and wakes parked threads, so that the task leaves `acquire` or
    /// `commit_kernel_for_task` if it is waiting there.
    pub fn abort(&self, task: &TransactionTask<C>) -> bool {
        let _state = self.state.lock();
        let aborted = task.set_abort_state();
        self.cvar.notify_all();
        aborted
    }

    /// Stops the batch: every owner and waiter is flagged for abort, and from now on
    /// `acquire` denies and `commit_kernel_for_task` refuses every task. Returns true if
    /// this call halted the batch.
    pub fn halt(&self) -> bool {
        let mut state = self.state.lock();
        if state.halted {
            return false;
        }
        Self::halt_locked(&mut state);
        self.cvar.notify_all();
        info!(
            commit_counter = state.commit_counter,
            "Address resource monitor halted"
        );
        true
    }

    /// Resets the monitor for the next batch. Taking `&mut self` guarantees there are no
    /// in-flight `acquire` or `commit_kernel_for_task` calls.
    pub fn clear(&mut self) {
        *self.state.get_mut() = MonitorState::new();
    }

    pub fn commit_counter(&self) -> TxnIndex {
        self.state.lock().commit_counter
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    pub fn owner_of(&self, address: &A) -> Option<TxnIndex> {
        self.state
            .lock()
            .resources
            .get(address)
            .and_then(|resource| resource.owner().map(|owner| owner.index()))
    }

    /// Indices queued at `address` (including the owner), in priority order.
    pub fn waiting_tasks(&self, address: &A) -> Vec<TxnIndex> {
        self.state
            .lock()
            .resources
            .get(address)
            .map(|resource| resource.waiting_tasks().map(|task| task.index()).collect())
            .unwrap_or_default()
    }

    /// Number of addresses the transaction is currently queued at or owns.
    pub fn num_tracked_resources(&self, txn_idx: TxnIndex) -> usize {
        self.state
            .lock()
            .ownerships
            .get(&txn_idx)
            .map_or(0, HashSet::len)
    }

    /// Number of addresses currently owned or waited on.
    pub fn num_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    fn resource<'a>(
        state: &'a MonitorState<A, C>,
        address: &A,
    ) -> Result<&'a AddressResource<C>, PanicError> {
        state.resources.get(address).ok_or_else(|| {
            code_invariant_error(format!("Missing resource record for {:?}", address))
        })
    }

    fn resource_mut<'a>(
        resources: &'a mut HashMap<A, AddressResource<C>>,
        address: &A,
    ) -> Result<&'a mut AddressResource<C>, PanicError> {
        resources.get_mut(address).ok_or_else(|| {
            code_invariant_error(format!("Missing resource record for {:?}", address))
        })
    }

    fn release_locked(state: &mut MonitorState<A, C>, txn_idx: TxnIndex) -> Result<(), PanicError> {
        let Some(addresses) = state.ownerships.remove(&txn_idx) else {
            return Ok(());
        };
        for address in addresses {
            let resource = Self::resource_mut(&mut state.resources, &address)?;
            resource.remove_from_waiting_queue(txn_idx);
            if resource.is_owned_by(txn_idx) {
                resource.set_owner(None);
            }
            if resource.is_empty() {
                state.resources.remove(&address);
            }
        }
        Ok(())
    }

    fn halt_locked(state: &mut MonitorState<A, C>) {
        state.halted = true;
        for resource in state.resources.values() {
            if let Some(owner) = resource.owner() {
                owner.set_abort_state();
            }
            for waiter in resource.waiting_tasks() {
                waiter.set_abort_state();
            }
        }
    }

    /// Parks the calling thread until the next notification. Spurious wake-ups are fine:
    /// every caller re-checks its predicate in a loop.
    fn wait(
        &self,
        state: &mut MutexGuard<'_, MonitorState<A, C>>,
        txn_idx: TxnIndex,
        waiting_on: &'static str,
        started: Instant,
    ) -> Result<(), PanicError> {
        match self.wait_timeout {
            None => {
                self.cvar.wait(state);
                Ok(())
            },
            Some(timeout) => {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    warn!(
                        txn_idx = txn_idx,
                        waiting_on = waiting_on,
                        timeout_ms = timeout.as_millis() as u64,
                        "Watchdog timeout expired"
                    );
                    return Err(PanicError::WaitTimeout {
                        txn_idx,
                        waiting_on,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                self.cvar.wait_for(state, timeout - elapsed);
                Ok(())
            },
        }
    }
}
