//! Revision store: the lookup table behind the context handler

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::revision::{Revision, RevisionKey};

/// Read-mostly map of known revisions, keyed by `(namespace, name)`.
/// Written by the endpoint watcher, read on every request.
#[derive(Default)]
pub struct RevisionStore {
    inner: RwLock<HashMap<RevisionKey, Arc<Revision>>>,
}

impl RevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a revision
    pub fn insert(&self, revision: Revision) {
        let mut map = self.inner.write().unwrap();
        map.insert(revision.key.clone(), Arc::new(revision));
    }

    /// Remove a revision, returning whether it was present
    pub fn remove(&self, key: &RevisionKey) -> bool {
        self.inner.write().unwrap().remove(key).is_some()
    }

    /// Look up a revision by key
    pub fn get(&self, key: &RevisionKey) -> Option<Arc<Revision>> {
        self.inner.read().unwrap().get(key).cloned()
    }

    /// Number of known revisions
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
