//! Entity identity: the stable key every normalized object is stored under.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

/// Identifier fields, in lookup order. The catalog server sends `_id`.
pub const ID_FIELDS: &[&str] = &["id", "_id"];

/// Key of an entry in the normalized store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(String);

impl EntityKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for EntityKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// How identifiers are turned into keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityScheme {
  /// The identifier alone. Server ids are globally unique object ids.
  #[default]
  Raw,
  /// `Type:id`, for servers whose ids are only unique per type
  Typed,
}

/// Derives entity keys from fetched objects.
///
/// Changing the scheme invalidates every key already in a store, so a store
/// is always built with one resolver for its whole lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityResolver {
  scheme: IdentityScheme,
}

impl IdentityResolver {
  pub fn new(scheme: IdentityScheme) -> Self {
    Self { scheme }
  }

  pub fn scheme(&self) -> IdentityScheme {
    self.scheme
  }

  /// Key for an object of the given type, or `None` if it carries no
  /// identifier (such objects stay nested in their parent).
  pub fn identify(&self, typename: &str, object: &Map<String, Value>) -> Option<EntityKey> {
    let id = ID_FIELDS
      .iter()
      .find_map(|field| object.get(*field).and_then(id_string))?;
    Some(self.key(typename, &id))
  }

  /// Same as [`identify`](Self::identify) for any JSON value.
  pub fn identify_value(&self, typename: &str, value: &Value) -> Option<EntityKey> {
    value
      .as_object()
      .and_then(|object| self.identify(typename, object))
  }

  /// Key for a known type and identifier.
  pub fn key(&self, typename: &str, id: &str) -> EntityKey {
    match self.scheme {
      IdentityScheme::Raw => EntityKey::new(id),
      IdentityScheme::Typed => EntityKey::new(format!("{}:{}", typename, id)),
    }
  }
}

fn id_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
