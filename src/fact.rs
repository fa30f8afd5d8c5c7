// Fact handles are the identities under which facts live in working memory.
// They are owned by a keeper, shared with tuples through Arc, and keep
// their value behind a lock so that an update swaps the value in place.

use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use seahash::SeaHasher;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ReteError, Result};

pub type IdHasher = BuildHasherDefault<SeaHasher>;

// ------------- FactId -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FactId(pub u64);

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub const GENESIS: u64 = 0;

#[derive(Debug)]
pub struct HandleGenerator {
    lower_bound: u64,
}

impl HandleGenerator {
    pub fn new() -> Self {
        Self {
            lower_bound: GENESIS,
        }
    }
    // Handles are never released back for reuse: a retracted id may still be
    // the origin of tuples that are staged but not yet evaluated.
    pub fn generate(&mut self) -> FactId {
        self.lower_bound += 1;
        FactId(self.lower_bound)
    }
    pub fn current(&self) -> u64 {
        self.lower_bound
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ------------- FactHandle -------------
#[derive(Debug)]
struct FactState {
    value: Value,
    version: u64,
    modified_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FactHandle {
    id: FactId,
    fact_type: String,
    inserted_at: DateTime<Utc>,
    state: RwLock<FactState>,
}

impl FactHandle {
    pub fn new(id: FactId, fact_type: String, value: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            fact_type,
            inserted_at: now,
            state: RwLock::new(FactState {
                value,
                version: 0,
                modified_at: now,
            }),
        }
    }
    pub fn id(&self) -> FactId {
        self.id
    }
    pub fn fact_type(&self) -> &str {
        &self.fact_type
    }
    pub fn inserted_at(&self) -> DateTime<Utc> {
        self.inserted_at
    }
    /// A copy of the current value. A poisoned lock still yields the last
    /// written value, since writes replace the value atomically.
    pub fn value(&self) -> Value {
        match self.state.read() {
            Ok(state) => state.value.clone(),
            Err(poisoned) => poisoned.into_inner().value.clone(),
        }
    }
    pub fn version(&self) -> u64 {
        match self.state.read() {
            Ok(state) => state.version,
            Err(poisoned) => poisoned.into_inner().version,
        }
    }
    pub fn modified_at(&self) -> DateTime<Utc> {
        match self.state.read() {
            Ok(state) => state.modified_at,
            Err(poisoned) => poisoned.into_inner().modified_at,
        }
    }
    pub(crate) fn swap(&self, value: Value) -> Result<Value> {
        let mut state = self.state.write()?;
        state.version += 1;
        state.modified_at = Utc::now();
        Ok(std::mem::replace(&mut state.value, value))
    }
}

impl fmt::Display for FactHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::<{}> {}", self.id, self.fact_type, self.value())
    }
}

// ------------- FactKeeper -------------
#[derive(Debug, Default)]
pub struct FactKeeper {
    generator: HandleGenerator,
    kept: HashMap<FactId, Arc<FactHandle>, IdHasher>,
}

impl FactKeeper {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn keep(&mut self, fact_type: &str, value: Value) -> Arc<FactHandle> {
        let id = self.generator.generate();
        let handle = Arc::new(FactHandle::new(id, fact_type.to_owned(), value));
        self.kept.insert(id, Arc::clone(&handle));
        handle
    }
    pub fn get(&self, id: FactId) -> Result<Arc<FactHandle>> {
        self.kept
            .get(&id)
            .cloned()
            .ok_or(ReteError::UnknownFact(id.0))
    }
    pub fn release(&mut self, id: FactId) -> Result<Arc<FactHandle>> {
        self.kept.remove(&id).ok_or(ReteError::UnknownFact(id.0))
    }
    pub fn contains(&self, id: FactId) -> bool {
        self.kept.contains_key(&id)
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FactHandle>> {
        self.kept.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_never_reused() {
        let mut keeper = FactKeeper::new();
        let a = keeper.keep("A", json!(1));
        keeper.release(a.id()).unwrap();
        let b = keeper.keep("A", json!(1));
        assert_ne!(a.id(), b.id());
        assert!(keeper.get(a.id()).is_err());
    }

    #[test]
    fn swap_bumps_the_lifecycle_stamp() {
        let mut keeper = FactKeeper::new();
        let a = keeper.keep("A", json!({"x": 1}));
        let old = a.swap(json!({"x": 2})).unwrap();
        assert_eq!(old, json!({"x": 1}));
        assert_eq!(a.value(), json!({"x": 2}));
        assert_eq!(a.version(), 1);
        assert!(a.modified_at() >= a.inserted_at());
    }
}
