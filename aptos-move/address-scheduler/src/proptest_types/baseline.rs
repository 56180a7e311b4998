// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::{BlockExecutionError, BlockExecutionResult},
    proptest_types::types::{written_value, Output, SlotType, Transaction, ValueType},
};
use std::{collections::BTreeMap, fmt::Debug};

pub type World<A> = BTreeMap<(A, SlotType), ValueType>;

/// Sequential baseline of execution result for dummy transactions: the outputs and the final
/// state of executing the block one transaction after the other.
#[derive(Debug)]
pub enum BaselineOutput<A> {
    /// The transaction at the index failed. The world holds the writes of all transactions
    /// before it.
    Aborted(usize, World<A>),
    Success(Vec<Vec<Option<ValueType>>>, World<A>),
}

impl<A: Ord + Clone + Debug> BaselineOutput<A> {
    /// Must be invoked after parallel execution to work with dynamic read/writes.
    pub fn generate(txns: &[Transaction<A>], initial_world: &World<A>) -> Self {
        let mut current_world = initial_world.clone();
        let mut result_vec = vec![];
        for (idx, txn) in txns.iter().enumerate() {
            let Some((read_set, write_set)) = txn.last_read_write_sets() else {
                return Self::Aborted(idx, current_world);
            };

            let reads: Vec<_> = read_set
                .iter()
                .map(|key| current_world.get(key).copied())
                .collect();
            for (key, salt) in write_set.iter() {
                match salt {
                    Some(salt) => {
                        current_world.insert(key.clone(), written_value(*salt, &reads));
                    },
                    None => {
                        current_world.remove(key);
                    },
                }
            }
            result_vec.push(reads);
        }
        Self::Success(result_vec, current_world)
    }

    pub fn world(&self) -> &World<A> {
        match self {
            Self::Aborted(_, world) | Self::Success(_, world) => world,
        }
    }

    pub fn assert_output(
        &self,
        results: &BlockExecutionResult<Vec<Output>, usize>,
        final_world: &World<A>,
    ) {
        match self {
            Self::Aborted(idx, _) => match results {
                Err(BlockExecutionError::FatalVMError(i)) => assert_eq!(i, idx),
                _ => panic!("Expected transaction {} to abort, got {:?}", idx, results),
            },
            Self::Success(expected_results, _) => {
                let outputs = match results {
                    Ok(outputs) => outputs,
                    Err(err) => panic!("Expected successful execution, got {:?}", err),
                };
                assert_eq!(outputs.len(), expected_results.len());
                for (idx, (Output(result), expected)) in
                    outputs.iter().zip(expected_results.iter()).enumerate()
                {
                    assert_eq!(result, expected, "Reads of transaction {} differ", idx);
                }
            },
        }
        assert_eq!(final_world, self.world());
    }
}
