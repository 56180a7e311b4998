// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::{PanicError, SpeculativeAbort},
    monitor::{AcquireStatus, AddressResourceMonitor},
    state_store::{StateStore, WriteSet},
    task::{TStateView, Transaction},
    transaction_task::{AbortObserver, TransactionTask},
    types::TxnIndex,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct ParallelState<'a, T: Transaction, C> {
    monitor: &'a AddressResourceMonitor<T::Address, C>,
    task: &'a Arc<TransactionTask<C>>,
}

impl<'a, T: Transaction, C> ParallelState<'a, T, C> {
    pub(crate) fn new(
        monitor: &'a AddressResourceMonitor<T::Address, C>,
        task: &'a Arc<TransactionTask<C>>,
    ) -> Self {
        Self { monitor, task }
    }
}

pub(crate) enum ViewState<'a, T: Transaction, C> {
    Sync(ParallelState<'a, T, C>),
    Unsync,
}

/// A struct that is always used by a single thread performing an execution task. The struct is
/// passed to the VM and acts as a proxy to the ground truth: in parallel mode it acquires the
/// address through the monitor before every access, and it buffers the transaction's writes
/// until commit.
pub(crate) struct LatestView<'a, T: Transaction, S, C> {
    base_view: &'a S,
    latest_view: ViewState<'a, T, C>,
    txn_idx: TxnIndex,
    writes: Mutex<WriteSet<T::Address, T::Key, T::Value>>,
    // Set when the monitor itself failed; the execution unit only sees a speculative abort.
    fatal_error: Mutex<Option<PanicError>>,
}

impl<'a, T, S, C> LatestView<'a, T, S, C>
where
    T: Transaction,
    S: StateStore<Address = T::Address, Key = T::Key, Value = T::Value>,
{
    pub(crate) fn new(base_view: &'a S, latest_view: ViewState<'a, T, C>, txn_idx: TxnIndex) -> Self {
        Self {
            base_view,
            latest_view,
            txn_idx,
            writes: Mutex::new(WriteSet::new()),
            fatal_error: Mutex::new(None),
        }
    }

    pub(crate) fn take_fatal_error(&self) -> Option<PanicError> {
        self.fatal_error.lock().take()
    }

    pub(crate) fn into_write_set(self) -> WriteSet<T::Address, T::Key, T::Value> {
        self.writes.into_inner()
    }

    fn speculative_abort(&self) -> SpeculativeAbort {
        SpeculativeAbort {
            txn_idx: self.txn_idx,
        }
    }

    fn acquire(&self, address: &T::Address) -> Result<(), SpeculativeAbort> {
        let state = match &self.latest_view {
            ViewState::Sync(state) => state,
            ViewState::Unsync => return Ok(()),
        };
        match state.monitor.acquire(address, state.task) {
            Ok(AcquireStatus::Granted) => Ok(()),
            Ok(AcquireStatus::Aborted) => Err(self.speculative_abort()),
            Err(err) => {
                self.fatal_error.lock().get_or_insert(err);
                Err(self.speculative_abort())
            },
        }
    }
}

impl<T, S, C> TStateView for LatestView<'_, T, S, C>
where
    T: Transaction,
    S: StateStore<Address = T::Address, Key = T::Key, Value = T::Value>,
{
    type Txn = T;

    fn get_state_value(
        &self,
        address: &T::Address,
        key: &T::Key,
    ) -> Result<Option<T::Value>, SpeculativeAbort> {
        self.acquire(address)?;
        if let Some(buffered) = self.writes.lock().get(address, key) {
            return Ok(buffered.cloned());
        }
        Ok(self.base_view.get_state_value(address, key))
    }

    fn set_state_value(
        &self,
        address: &T::Address,
        key: &T::Key,
        value: Option<T::Value>,
    ) -> Result<(), SpeculativeAbort> {
        self.acquire(address)?;
        self.writes
            .lock()
            .insert(address.clone(), key.clone(), value);
        Ok(())
    }

    fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    fn is_aborted(&self) -> bool {
        match &self.latest_view {
            ViewState::Sync(state) => state.task.in_abort_state(),
            ViewState::Unsync => false,
        }
    }

    fn attach_abort_observer(&self, observer: Arc<dyn AbortObserver>) {
        // Sequential execution is never aborted.
        if let ViewState::Sync(state) = &self.latest_view {
            state.task.attach_helper(observer);
        }
    }
}
