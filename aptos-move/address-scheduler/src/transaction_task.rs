// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::types::{Incarnation, TxnIndex, Version};
use parking_lot::Mutex;
use std::{
    cmp::Ordering as CmpOrdering,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Hook into a running execution unit (e.g. an interpreter loop) through which the scheduler
/// requests cooperative cancellation. Implementations must be cheap and must not block: they
/// are invoked while the scheduler holds its coordination lock.
pub trait AbortObserver: Send + Sync {
    fn external_set_abort_state(&self);
}

/// The unit of concurrent work: one incarnation of one transaction in a batch.
///
/// Identity, priority and commit order are all given by `index`. Two tasks are equal iff
/// their indices are equal, so a task re-created for a retry (same index, next incarnation)
/// takes the place of the aborted one.
///
/// Abort is a polled flag, never an unwinding panic: any thread may set it, the thread
/// running the task observes it (directly, or through an attached [`AbortObserver`]).
pub struct TransactionTask<C> {
    index: TxnIndex,
    incarnation: Incarnation,
    abort_state: AtomicBool,
    // Guarded together with the forwarding of the abort flag so that an abort racing with
    // `attach_helper` reaches the helper through at least one of the two paths.
    helper: Mutex<Option<Arc<dyn AbortObserver>>>,
    context: C,
}

impl<C> TransactionTask<C> {
    pub fn new(index: TxnIndex, incarnation: Incarnation, context: C) -> Self {
        Self {
            index,
            incarnation,
            abort_state: AtomicBool::new(false),
            helper: Mutex::new(None),
            context,
        }
    }

    pub fn index(&self) -> TxnIndex {
        self.index
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn version(&self) -> Version {
        (self.index, self.incarnation)
    }

    /// The transaction and block context this task executes.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Marks the task as needing to abort and forwards the request to the attached
    /// execution handle, if any. Idempotent: returns true only for the call that
    /// flipped the flag.
    pub fn set_abort_state(&self) -> bool {
        if self.abort_state.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(helper) = self.helper.lock().as_ref() {
            helper.external_set_abort_state();
        }
        true
    }

    /// Binds the execution unit's abort hook. If the task was aborted before the hook was
    /// attached, the abort is forwarded immediately.
    pub fn attach_helper(&self, helper: Arc<dyn AbortObserver>) {
        let mut slot = self.helper.lock();
        if self.in_abort_state() {
            helper.external_set_abort_state();
        }
        *slot = Some(helper);
    }

    pub fn detach_helper(&self) -> Option<Arc<dyn AbortObserver>> {
        self.helper.lock().take()
    }

    pub fn in_abort_state(&self) -> bool {
        self.abort_state.load(Ordering::SeqCst)
    }
}

impl<C> PartialEq for TransactionTask<C> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<C> Eq for TransactionTask<C> {}

impl<C> PartialOrd for TransactionTask<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for TransactionTask<C> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.index.cmp(&other.index)
    }
}

impl<C> fmt::Debug for TransactionTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTask")
            .field("index", &self.index)
            .field("incarnation", &self.incarnation)
            .field("aborted", &self.in_abort_state())
            .finish()
    }
}
