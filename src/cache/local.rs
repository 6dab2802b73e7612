//! Client-only fields that are read through the same interface as cached
//! remote fields but are computed from process state on every read.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Computes the current value of a local field.
pub type LocalResolver = Arc<dyn Fn() -> Value + Send + Sync>;

/// Registry of local field resolvers.
#[derive(Clone, Default)]
pub struct LocalSchema {
  resolvers: HashMap<&'static str, LocalResolver>,
}

impl LocalSchema {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare a local field and how to resolve it.
  pub fn field<F>(mut self, name: &'static str, resolver: F) -> Self
  where
    F: Fn() -> Value + Send + Sync + 'static,
  {
    self.resolvers.insert(name, Arc::new(resolver));
    self
  }

  pub fn declares(&self, name: &str) -> bool {
    self.resolvers.contains_key(name)
  }

  /// Resolve a field now. Never cached: the underlying state may have
  /// changed since the last read.
  pub fn resolve(&self, name: &str) -> Option<Value> {
    self.resolvers.get(name).map(|resolver| resolver())
  }
}

impl fmt::Debug for LocalSchema {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.resolvers.keys().collect();
    names.sort();
    f.debug_struct("LocalSchema").field("fields", &names).finish()
  }
}
