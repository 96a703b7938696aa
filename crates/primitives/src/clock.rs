use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{IndexHead, WriterKey};

/// Causal frontier of a node: for each observed writer, the highest length
/// reachable from the node.
///
/// Entries for lengths already absorbed into the indexed prefix are pruned
/// at merge time, so a clock only ever names live (unindexed) positions.
/// The map is ordered by writer key, which keeps iteration deterministic
/// across participants.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Clock(BTreeMap<WriterKey, u64>);

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &WriterKey) -> Option<u64> {
        self.0.get(key).copied()
    }

    /// Whether this clock covers `length` entries of `key`.
    pub fn includes(&self, key: &WriterKey, length: u64) -> bool {
        self.get(key).is_some_and(|l| l >= length)
    }

    /// Raises the entry for `key` to at least `length`.
    pub fn observe(&mut self, key: WriterKey, length: u64) {
        let entry = self.0.entry(key).or_insert(length);
        if *entry < length {
            *entry = length;
        }
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &Clock) {
        for (key, length) in other.iter() {
            self.observe(key, length);
        }
    }

    pub fn remove(&mut self, key: &WriterKey) -> Option<u64> {
        self.0.remove(key)
    }

    /// Drops entries for which `absorbed` reports the position as already
    /// part of the indexed prefix.
    pub fn prune<F>(&mut self, mut absorbed: F)
    where
        F: FnMut(&WriterKey, u64) -> bool,
    {
        self.0.retain(|key, length| !absorbed(key, *length));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WriterKey, u64)> + '_ {
        self.0.iter().map(|(k, l)| (*k, *l))
    }

    /// The clock as a head list, ordered by writer key.
    pub fn to_heads(&self) -> Vec<IndexHead> {
        self.iter()
            .map(|(key, length)| IndexHead::new(key, length))
            .collect()
    }
}

impl FromIterator<(WriterKey, u64)> for Clock {
    fn from_iter<T: IntoIterator<Item = (WriterKey, u64)>>(iter: T) -> Self {
        let mut clock = Clock::new();
        for (key, length) in iter {
            clock.observe(key, length);
        }
        clock
    }
}
