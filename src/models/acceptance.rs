//! The set of chunk indices accepted for an upload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Chunk indices that have been durably written for one object.
///
/// Backed by a `BTreeSet`, so inserting an index twice never counts it twice.
/// Serializes as an ascending JSON array (`[0,1,4]`), which is the column
/// format in the metadata store.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct AcceptanceSet(BTreeSet<u32>);

impl AcceptanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `index`. Returns `true` if it was already present.
    pub fn insert(&mut self, index: u32) -> bool {
        !self.0.insert(index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.0.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

}

impl FromIterator<u32> for AcceptanceSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
