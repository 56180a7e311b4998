// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::types::TxnIndex;
use thiserror::Error;
use tracing::error;

/// Unrecoverable failure of the scheduler itself. Never caused by transaction logic:
/// it means the batch must be abandoned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PanicError {
    #[error("{0}")]
    CodeInvariantError(String),
    /// A parked worker exceeded the configured watchdog timeout.
    #[error("Transaction {txn_idx} waited more than {timeout_ms}ms for {waiting_on}")]
    WaitTimeout {
        txn_idx: TxnIndex,
        waiting_on: &'static str,
        timeout_ms: u64,
    },
}

pub fn code_invariant_error<M: std::fmt::Debug>(message: M) -> PanicError {
    let msg = format!(
        "Code invariant broken (there is a bug in the code), {:?}",
        message
    );
    error!("{}", msg);
    PanicError::CodeInvariantError(msg)
}

/// Returned by the state view to the execution unit once its task has been asked to abort.
/// The unit is expected to stop issuing reads and writes and unwind.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("Speculative execution of transaction {txn_idx} was aborted")]
pub struct SpeculativeAbort {
    pub txn_idx: TxnIndex,
}

/// If an unrecoverable error occurs during block execution, it is propagated back to the
/// caller and the whole block is discarded.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockExecutionError<E> {
    /// unrecoverable scheduler error
    #[error("Fatal block executor error: {0}")]
    FatalBlockExecutorError(PanicError),
    /// unrecoverable VM error, committed at the position of the failing transaction
    #[error("Fatal VM error: {0:?}")]
    FatalVMError(E),
}

pub type BlockExecutionResult<T, E> = Result<T, BlockExecutionError<E>>;

impl<E> From<PanicError> for BlockExecutionError<E> {
    fn from(err: PanicError) -> Self {
        BlockExecutionError::FatalBlockExecutorError(err)
    }
}
