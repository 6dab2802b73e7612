//! Client-side normalized cache.
//!
//! This module provides the data-consistency layer every view reads from:
//! - Derives a stable key for every fetched entity ([`IdentityResolver`])
//! - Stores entities once and links them by key ([`Store`])
//! - Resolves client-only fields on every read ([`LocalSchema`])
//! - Shares one cache context per session, with change notifications
//!   ([`CacheHandle`])

mod identity;
mod local;
mod result;
mod store;

pub use identity::{EntityKey, IdentityResolver, IdentityScheme, ID_FIELDS};
pub use local::{LocalResolver, LocalSchema};
pub use result::{CacheResult, CacheSource};
pub use store::{FieldBag, Store, StoreValue, ROOT_QUERY};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::document::{Operation, Variables};
use crate::error::OperationError;

/// The store together with the local schema it resolves client fields from.
#[derive(Debug)]
pub struct Cache {
  store: Store,
  local: LocalSchema,
  /// Bumped on every reset
  generation: u64,
}

impl Cache {
  pub fn new(identity: IdentityResolver, local: LocalSchema) -> Self {
    Self {
      store: Store::new(identity),
      local,
      generation: 0,
    }
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn local(&self) -> &LocalSchema {
    &self.local
  }

  /// Read an operation's full shape, local fields included.
  pub fn read_query(&self, operation: &Operation, vars: &Variables) -> Option<Value> {
    self
      .store
      .read(&Store::root(), &operation.selection, vars, &self.local)
  }

  /// Write a complete result for an operation's shape.
  pub fn write_query(
    &mut self,
    operation: &Operation,
    vars: &Variables,
    data: &Value,
  ) -> Result<(), OperationError> {
    self
      .store
      .write(&Store::root(), &operation.selection, vars, data)
  }

  /// Merge the entities of a mutation result.
  pub fn merge_result(
    &mut self,
    operation: &Operation,
    vars: &Variables,
    data: &Value,
  ) -> Result<(), OperationError> {
    self.store.merge_entities(&operation.selection, vars, data)
  }

  /// When the operation's root fields were last written.
  pub fn written_at(&self, operation: &Operation, vars: &Variables) -> Option<DateTime<Utc>> {
    self
      .store
      .written_at(&Store::root(), &operation.selection, vars)
  }

  pub fn identify(&self, typename: &str, value: &Value) -> Option<EntityKey> {
    self.store.identity().identify_value(typename, value)
  }

  pub fn key(&self, typename: &str, id: &str) -> EntityKey {
    self.store.identity().key(typename, id)
  }

  pub fn evict(&mut self, key: &EntityKey) -> bool {
    self.store.evict(key)
  }

  pub fn reset(&mut self) {
    self.store.reset();
    self.generation += 1;
  }

  /// How many times the store has been reset.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Run `f`, restoring the store as it was if `f` fails.
  pub fn staged<R>(
    &mut self,
    f: impl FnOnce(&mut Cache) -> Result<R, OperationError>,
  ) -> Result<R, OperationError> {
    let saved = self.store.clone();
    let result = f(self);
    if result.is_err() {
      self.store = saved;
    }
    result
  }
}

/// Shared handle to a session's cache.
///
/// Every access runs inside one lock acquisition and nothing awaits while
/// holding it, so an update (a whole reconciliation included) is atomic to
/// readers. Each update bumps a version that live queries subscribe to.
#[derive(Clone)]
pub struct CacheHandle {
  inner: Arc<Mutex<Cache>>,
  changes: Arc<watch::Sender<u64>>,
}

impl CacheHandle {
  pub fn new(identity: IdentityResolver, local: LocalSchema) -> Self {
    let (tx, _rx) = watch::channel(0);
    Self {
      inner: Arc::new(Mutex::new(Cache::new(identity, local))),
      changes: Arc::new(tx),
    }
  }

  /// Run a read-only closure against the cache.
  pub fn read<R>(&self, f: impl FnOnce(&Cache) -> R) -> R {
    f(&self.lock())
  }

  /// Run a mutating closure against the cache and notify subscribers.
  pub fn update<R>(&self, f: impl FnOnce(&mut Cache) -> R) -> R {
    let result = f(&mut self.lock());
    self.notify();
    result
  }

  /// Run a mutating closure for a response to a request sent at
  /// `generation`. A reset since then fences it out: the store is left alone
  /// and nobody is notified.
  pub fn update_from<R>(
    &self,
    generation: u64,
    f: impl FnOnce(&mut Cache) -> Result<R, OperationError>,
  ) -> Result<R, OperationError> {
    let result = {
      let mut cache = self.lock();
      if cache.generation != generation {
        return Err(OperationError::Transport(
          "store reset while request was in flight".to_string(),
        ));
      }
      f(&mut cache)
    };
    self.notify();
    result
  }

  /// Current reset generation, captured before a request is sent.
  pub fn generation(&self) -> u64 {
    self.lock().generation
  }

  /// Drop every cached entity.
  pub fn reset(&self) {
    self.update(Cache::reset);
  }

  /// Wake subscribers after a change to state the local schema reads.
  pub fn notify(&self) {
    self.changes.send_modify(|version| *version += 1);
  }

  /// Receiver that observes every update.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.changes.subscribe()
  }

  pub fn version(&self) -> u64 {
    *self.changes.borrow()
  }

  fn lock(&self) -> MutexGuard<'_, Cache> {
    // Updates are applied all at once, so a panic mid-closure cannot leave a
    // half-normalized payload behind; keep serving the last state.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl std::fmt::Debug for CacheHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheHandle")
      .field("version", &self.version())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::{Field, Selection};
  use serde_json::json;

  fn authors() -> Operation {
    Operation::query(
      "GetAuthors",
      [Field::object(
        "authors",
        Selection::new("Author", [Field::scalar("id"), Field::scalar("name")]),
      )],
    )
  }

  #[test]
  fn test_update_bumps_version_and_notifies() {
    let cache = CacheHandle::new(IdentityResolver::default(), LocalSchema::new());
    let mut rx = cache.subscribe();
    assert_eq!(cache.version(), 0);

    cache
      .update(|c| {
        c.write_query(
          &authors(),
          &Variables::new(),
          &json!({"authors": [{"id": "a1", "name": "Herbert"}]}),
        )
      })
      .unwrap();

    assert_eq!(cache.version(), 1);
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();
    assert!(!rx.has_changed().unwrap());
  }

  #[test]
  fn test_read_sees_previous_update() {
    let cache = CacheHandle::new(IdentityResolver::default(), LocalSchema::new());
    let data = json!({"authors": [{"id": "a1", "name": "Herbert"}]});
    cache
      .update(|c| c.write_query(&authors(), &Variables::new(), &data))
      .unwrap();

    let read = cache.read(|c| c.read_query(&authors(), &Variables::new()));
    assert_eq!(read, Some(data));
  }

  #[test]
  fn test_reset_clears_shared_state() {
    let cache = CacheHandle::new(IdentityResolver::default(), LocalSchema::new());
    let clone = cache.clone();
    cache
      .update(|c| {
        c.write_query(
          &authors(),
          &Variables::new(),
          &json!({"authors": [{"id": "a1", "name": "Herbert"}]}),
        )
      })
      .unwrap();

    clone.reset();
    assert!(cache.read(|c| c.store().is_empty()));
    assert_eq!(cache.read(|c| c.read_query(&authors(), &Variables::new())), None);
  }

  #[test]
  fn test_update_from_old_generation_is_fenced() {
    let cache = CacheHandle::new(IdentityResolver::default(), LocalSchema::new());
    let generation = cache.generation();
    cache.reset();
    let version = cache.version();

    let result = cache.update_from(generation, |c| {
      c.write_query(
        &authors(),
        &Variables::new(),
        &json!({"authors": [{"id": "a1", "name": "Herbert"}]}),
      )
    });

    assert!(matches!(result, Err(OperationError::Transport(_))));
    assert!(cache.read(|c| c.store().is_empty()));
    assert_eq!(cache.version(), version);

    cache
      .update_from(cache.generation(), |c| {
        c.write_query(
          &authors(),
          &Variables::new(),
          &json!({"authors": [{"id": "a1", "name": "Herbert"}]}),
        )
      })
      .unwrap();
    assert!(!cache.read(|c| c.store().is_empty()));
  }

  #[test]
  fn test_staged_rolls_back_on_failure() {
    let cache = CacheHandle::new(IdentityResolver::default(), LocalSchema::new());
    let result = cache.update(|c| {
      c.staged(|c| {
        c.write_query(
          &authors(),
          &Variables::new(),
          &json!({"authors": [{"id": "a1", "name": "Herbert"}]}),
        )?;
        Err::<(), _>(OperationError::Decode("second step failed".into()))
      })
    });

    assert!(result.is_err());
    assert!(cache.read(|c| c.store().is_empty()));
  }
}
