// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{transaction_task::TransactionTask, types::TxnIndex};
use std::{collections::BTreeMap, sync::Arc};

/// Arbitration record for a single address within a batch.
///
/// The waiting queue is ordered by transaction index, so its head is always the lowest
/// pending index, i.e. the legitimate next owner. The current owner stays queued (at the head
/// when it was granted) until it releases. All methods are called with the monitor lock held.
///
/// Ownership state machine:
/// ```text
/// Unowned --acquire(T)--> Owned(T) --acquire(T)--> Owned(T)
///                            |
///                            | lower-index waiter arrives: T flagged for abort,
///                            | owner unchanged until T releases
///                            |
///                            +--release(T)--> Unowned
/// ```
pub(crate) struct AddressResource<C> {
    waiting_queue: BTreeMap<TxnIndex, Arc<TransactionTask<C>>>,
    owned_by: Option<Arc<TransactionTask<C>>>,
}

impl<C> AddressResource<C> {
    pub(crate) fn new() -> Self {
        Self {
            waiting_queue: BTreeMap::new(),
            owned_by: None,
        }
    }

    /// Inserts the task unless already queued. If the task thereby becomes the next owner
    /// while a different task owns the resource, the owner is flagged for abort: a higher
    /// index may never block a lower one. Returns true only if this call flagged the owner.
    pub(crate) fn add_to_waiting_queue(&mut self, task: &Arc<TransactionTask<C>>) -> bool {
        if self.waiting_queue.contains_key(&task.index()) {
            return false;
        }
        self.waiting_queue.insert(task.index(), task.clone());

        if !self.is_next_owner(task) {
            return false;
        }
        match &self.owned_by {
            Some(owner) if owner.index() != task.index() => owner.set_abort_state(),
            _ => false,
        }
    }

    /// Removes the task from the queue, returns whether it was present.
    pub(crate) fn remove_from_waiting_queue(&mut self, txn_idx: TxnIndex) -> bool {
        self.waiting_queue.remove(&txn_idx).is_some()
    }

    pub(crate) fn is_next_owner(&self, task: &TransactionTask<C>) -> bool {
        self.waiting_queue
            .keys()
            .next()
            .is_some_and(|head| *head == task.index())
    }

    pub(crate) fn get_next_owner(&self) -> Option<&Arc<TransactionTask<C>>> {
        self.waiting_queue.values().next()
    }

    pub(crate) fn set_owner(&mut self, owner: Option<Arc<TransactionTask<C>>>) {
        self.owned_by = owner;
    }

    pub(crate) fn owner(&self) -> Option<&Arc<TransactionTask<C>>> {
        self.owned_by.as_ref()
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owned_by.is_some()
    }

    pub(crate) fn is_owned_by(&self, txn_idx: TxnIndex) -> bool {
        self.owned_by
            .as_ref()
            .is_some_and(|owner| owner.index() == txn_idx)
    }

    pub(crate) fn waiting_tasks(&self) -> impl Iterator<Item = &Arc<TransactionTask<C>>> {
        self.waiting_queue.values()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiting_queue.is_empty() && self.owned_by.is_none()
    }
}
