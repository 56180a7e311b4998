// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicU32;

pub type AtomicTxnIndex = AtomicU32;
/// Position of a transaction in its batch. Defines both priority (lower is more important)
/// and commit order.
pub type TxnIndex = u32;
/// Number of times a transaction has been (re-)started after an abort.
pub type Incarnation = u32;
pub type Version = (TxnIndex, Incarnation);
