// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use parking_lot::RwLock;
use std::{
    collections::{btree_map, BTreeMap, HashMap},
    hash::Hash,
};

/// Output of a finished execution unit that still has to be applied to the ground truth.
/// Applied by the monitor inside the serialized commit step, i.e. at most once per batch
/// position and strictly in index order.
pub trait BufferedState {
    fn apply(self);

    /// When true, the monitor halts the batch atomically with this commit, so that no
    /// later transaction can commit after it.
    fn halts_batch(&self) -> bool {
        false
    }
}

/// Ground truth the batch reads from and commits into.
pub trait StateStore: Sync {
    type Address;
    type Key;
    type Value;

    fn get_state_value(&self, address: &Self::Address, key: &Self::Key) -> Option<Self::Value>;

    fn apply_writes(&self, writes: WriteSet<Self::Address, Self::Key, Self::Value>);
}

/// Buffered writes of one transaction, ordered by (address, key). `None` deletes the slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteSet<A, K, V> {
    writes: BTreeMap<(A, K), Option<V>>,
}

impl<A: Ord, K: Ord, V> WriteSet<A, K, V> {
    pub fn new() -> Self {
        Self {
            writes: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, address: A, key: K, value: Option<V>) {
        self.writes.insert((address, key), value);
    }

    /// Outer None: slot untouched by this write set. Inner None: slot deleted.
    pub fn get(&self, address: &A, key: &K) -> Option<Option<&V>>
    where
        A: Clone,
        K: Clone,
    {
        self.writes
            .get(&(address.clone(), key.clone()))
            .map(Option::as_ref)
    }

}

impl<A: Ord, K: Ord, V> Default for WriteSet<A, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, K, V> IntoIterator for WriteSet<A, K, V> {
    type IntoIter = btree_map::IntoIter<(A, K), Option<V>>;
    type Item = ((A, K), Option<V>);

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// The write set of a finished transaction, bound to the store it commits into.
pub struct PendingCommit<'a, S: StateStore> {
    store: &'a S,
    writes: WriteSet<S::Address, S::Key, S::Value>,
    halts_batch: bool,
}

impl<'a, S: StateStore> PendingCommit<'a, S> {
    pub fn new(store: &'a S, writes: WriteSet<S::Address, S::Key, S::Value>) -> Self {
        Self {
            store,
            writes,
            halts_batch: false,
        }
    }

    /// Commits the given writes (usually none) and halts the batch.
    pub fn halting(store: &'a S, writes: WriteSet<S::Address, S::Key, S::Value>) -> Self {
        Self {
            store,
            writes,
            halts_batch: true,
        }
    }
}

impl<S: StateStore> BufferedState for PendingCommit<'_, S> {
    fn apply(self) {
        self.store.apply_writes(self.writes);
    }

    fn halts_batch(&self) -> bool {
        self.halts_batch
    }
}

/// In-memory ground truth, used by tests, benches and embedders without persistent storage.
#[derive(Debug)]
pub struct InMemoryStateStore<A, K, V> {
    data: RwLock<HashMap<(A, K), V>>,
}

impl<A, K, V> Default for InMemoryStateStore<A, K, V> {
    fn default() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl<A, K, V> InMemoryStateStore<A, K, V>
where
    A: Clone + Eq + Hash + Ord,
    K: Clone + Eq + Hash + Ord,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Ordered copy of the current contents.
    pub fn snapshot(&self) -> BTreeMap<(A, K), V> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<A, K, V> FromIterator<((A, K), V)> for InMemoryStateStore<A, K, V>
where
    A: Eq + Hash,
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = ((A, K), V)>>(iter: I) -> Self {
        Self {
            data: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl<A, K, V> StateStore for InMemoryStateStore<A, K, V>
where
    A: Clone + Eq + Hash + Ord + Send + Sync,
    K: Clone + Eq + Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
{
    type Address = A;
    type Key = K;
    type Value = V;

    fn get_state_value(&self, address: &A, key: &K) -> Option<V> {
        self.data
            .read()
            .get(&(address.clone(), key.clone()))
            .cloned()
    }

    fn apply_writes(&self, writes: WriteSet<A, K, V>) {
        let mut data = self.data.write();
        for (state_key, value) in writes {
            match value {
                Some(value) => {
                    data.insert(state_key, value);
                },
                None => {
                    data.remove(&state_key);
                },
            }
        }
    }
}
