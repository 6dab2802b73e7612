//! Normalized store: a flat map from entity key to field-bag.
//!
//! Objects with an identity are stored once under their key and referenced
//! from everywhere else by that key. Objects without one are kept inline in
//! their parent. Query root fields live in the [`ROOT_QUERY`] entry.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::identity::{EntityKey, IdentityResolver};
use super::local::LocalSchema;
use crate::document::{Field, Selection, Variables};
use crate::error::OperationError;

/// Entry holding the root fields of every query.
pub const ROOT_QUERY: &str = "ROOT_QUERY";

/// Stored value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
  Scalar(Value),
  Ref(EntityKey),
  List(Vec<StoreValue>),
  /// Anonymous object without identity, not shared with anything
  Inline(FieldBag),
}

/// Fields of one entity, keyed by storage key (name plus arguments).
pub type FieldBag = BTreeMap<String, StoreValue>;

#[derive(Debug, Clone, Default)]
pub struct Store {
  entries: HashMap<EntityKey, FieldBag>,
  identity: IdentityResolver,
  /// When each `(entry, field)` was last written
  written_at: HashMap<(EntityKey, String), DateTime<Utc>>,
}

impl Store {
  pub fn new(identity: IdentityResolver) -> Self {
    Self {
      entries: HashMap::new(),
      identity,
      written_at: HashMap::new(),
    }
  }

  pub fn root() -> EntityKey {
    EntityKey::from(ROOT_QUERY)
  }

  pub fn identity(&self) -> IdentityResolver {
    self.identity
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn contains(&self, key: &EntityKey) -> bool {
    self.entries.contains_key(key)
  }

  pub fn entity(&self, key: &EntityKey) -> Option<&FieldBag> {
    self.entries.get(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
    self.entries.keys()
  }

  /// Read a shape starting at `root`.
  ///
  /// Returns `None` when any requested field, at any depth, is missing or
  /// points at an entry that does not exist. `None` means "fetch it", not
  /// "empty".
  pub fn read(
    &self,
    root: &EntityKey,
    selection: &Selection,
    vars: &Variables,
    local: &LocalSchema,
  ) -> Option<Value> {
    let empty = FieldBag::new();
    let bag = self.entries.get(root).unwrap_or(&empty);
    self
      .read_selection(selection, bag, vars, local)
      .map(Value::Object)
  }

  fn read_selection(
    &self,
    selection: &Selection,
    bag: &FieldBag,
    vars: &Variables,
    local: &LocalSchema,
  ) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    for field in &selection.fields {
      let value = if field.local {
        local.resolve(field.name)?
      } else {
        let stored = bag.get(&field.storage_key(vars))?;
        self.read_value(field, stored, vars, local)?
      };
      out.insert(field.name.to_string(), value);
    }
    Some(out)
  }

  fn read_value(
    &self,
    field: &Field,
    stored: &StoreValue,
    vars: &Variables,
    local: &LocalSchema,
  ) -> Option<Value> {
    match (stored, &field.selection) {
      (StoreValue::Scalar(value), None) => Some(value.clone()),
      (StoreValue::Scalar(Value::Null), Some(_)) => Some(Value::Null),
      (StoreValue::Ref(key), Some(selection)) => {
        let bag = self.entries.get(key)?;
        self
          .read_selection(selection, bag, vars, local)
          .map(Value::Object)
      }
      (StoreValue::Inline(bag), Some(selection)) => self
        .read_selection(selection, bag, vars, local)
        .map(Value::Object),
      (StoreValue::List(items), _) => items
        .iter()
        .map(|item| self.read_value(field, item, vars, local))
        .collect::<Option<Vec<_>>>()
        .map(Value::Array),
      // Shape and stored value disagree (scalar vs object); treat as absent.
      _ => None,
    }
  }

  /// Write `data` for `selection` under `root`, merging every identified
  /// object into its entry.
  ///
  /// Field-bags merge field by field; list fields are replaced whole. The
  /// whole payload is normalized before anything is committed, so a payload
  /// that does not match the shape leaves the store untouched.
  pub fn write(
    &mut self,
    root: &EntityKey,
    selection: &Selection,
    vars: &Variables,
    data: &Value,
  ) -> Result<(), OperationError> {
    let (root_bag, pending) = self.normalize(selection, vars, data)?;
    self.commit(pending);

    let now = Utc::now();
    for field in root_bag.keys() {
      self.written_at.insert((root.clone(), field.clone()), now);
    }
    self.entries.entry(root.clone()).or_default().extend(root_bag);
    Ok(())
  }

  /// Normalize `data` into entity entries without storing its root fields.
  /// Used for mutation payloads, whose root is not a cacheable query.
  pub fn merge_entities(
    &mut self,
    selection: &Selection,
    vars: &Variables,
    data: &Value,
  ) -> Result<(), OperationError> {
    let (_, pending) = self.normalize(selection, vars, data)?;
    self.commit(pending);
    Ok(())
  }

  /// Oldest write time among the remote root fields of `selection`.
  pub fn written_at(
    &self,
    root: &EntityKey,
    selection: &Selection,
    vars: &Variables,
  ) -> Option<DateTime<Utc>> {
    selection
      .fields
      .iter()
      .filter(|f| !f.local)
      .filter_map(|f| {
        self
          .written_at
          .get(&(root.clone(), f.storage_key(vars)))
          .copied()
      })
      .min()
  }

  /// Remove an entity and every reference to it.
  ///
  /// References inside lists are dropped from the list; single references
  /// become `null`. Returns whether the entity existed.
  pub fn evict(&mut self, key: &EntityKey) -> bool {
    let existed = self.entries.remove(key).is_some();
    for bag in self.entries.values_mut() {
      scrub_bag(bag, key);
    }
    self.written_at.retain(|(entry, _), _| entry != key);
    if existed {
      debug!(%key, "evicted entity");
    }
    existed
  }

  /// Drop every entry.
  pub fn reset(&mut self) {
    debug!(entries = self.entries.len(), "store reset");
    self.entries.clear();
    self.written_at.clear();
  }

  /// Keys referenced from some entry that have no entry of their own.
  pub fn dangling_refs(&self) -> Vec<EntityKey> {
    let mut refs = Vec::new();
    for bag in self.entries.values() {
      collect_refs_bag(bag, &mut refs);
    }
    refs.retain(|key| !self.entries.contains_key(key));
    refs.sort();
    refs.dedup();
    refs
  }

  fn normalize(
    &self,
    selection: &Selection,
    vars: &Variables,
    data: &Value,
  ) -> Result<(FieldBag, Vec<(EntityKey, FieldBag)>), OperationError> {
    let object = data.as_object().ok_or_else(|| {
      OperationError::Decode(format!("expected an object for {}", selection.typename))
    })?;
    let mut normalizer = Normalizer {
      identity: self.identity,
      vars,
      pending: Vec::new(),
    };
    let bag = normalizer.selection(selection, object)?;
    Ok((bag, normalizer.pending))
  }

  fn commit(&mut self, pending: Vec<(EntityKey, FieldBag)>) {
    for (key, bag) in pending {
      self.entries.entry(key).or_default().extend(bag);
    }
  }
}

struct Normalizer<'a> {
  identity: IdentityResolver,
  vars: &'a Variables,
  /// Entity merges, applied in order once the whole payload is normalized
  pending: Vec<(EntityKey, FieldBag)>,
}

impl Normalizer<'_> {
  fn selection(
    &mut self,
    selection: &Selection,
    object: &Map<String, Value>,
  ) -> Result<FieldBag, OperationError> {
    let mut bag = FieldBag::new();
    for field in selection.fields.iter().filter(|f| !f.local) {
      let value = object.get(field.name).ok_or_else(|| {
        OperationError::Decode(format!(
          "missing field `{}` on {}",
          field.name, selection.typename
        ))
      })?;
      let stored = self.value(field, value)?;
      bag.insert(field.storage_key(self.vars), stored);
    }
    Ok(bag)
  }

  fn value(&mut self, field: &Field, value: &Value) -> Result<StoreValue, OperationError> {
    let selection = match &field.selection {
      None => return Ok(StoreValue::Scalar(value.clone())),
      Some(selection) => selection,
    };

    match value {
      Value::Null => Ok(StoreValue::Scalar(Value::Null)),
      Value::Array(items) => items
        .iter()
        .map(|item| self.value(field, item))
        .collect::<Result<Vec<_>, _>>()
        .map(StoreValue::List),
      Value::Object(object) => {
        let bag = self.selection(selection, object)?;
        match self.identity.identify(selection.typename, object) {
          Some(key) => {
            self.pending.push((key.clone(), bag));
            Ok(StoreValue::Ref(key))
          }
          None => Ok(StoreValue::Inline(bag)),
        }
      }
      other => Err(OperationError::Decode(format!(
        "expected {} object for `{}`, got {}",
        selection.typename, field.name, other
      ))),
    }
  }
}

fn scrub_bag(bag: &mut FieldBag, key: &EntityKey) {
  for value in bag.values_mut() {
    scrub_value(value, key);
  }
}

fn scrub_value(value: &mut StoreValue, key: &EntityKey) {
  if matches!(value, StoreValue::Ref(target) if target == key) {
    *value = StoreValue::Scalar(Value::Null);
    return;
  }
  match value {
    StoreValue::List(items) => {
      items.retain(|item| !matches!(item, StoreValue::Ref(target) if target == key));
      for item in items.iter_mut() {
        scrub_value(item, key);
      }
    }
    StoreValue::Inline(bag) => scrub_bag(bag, key),
    _ => {}
  }
}

fn collect_refs_bag(bag: &FieldBag, out: &mut Vec<EntityKey>) {
  for value in bag.values() {
    collect_refs_value(value, out);
  }
}

fn collect_refs_value(value: &StoreValue, out: &mut Vec<EntityKey>) {
  match value {
    StoreValue::Ref(key) => out.push(key.clone()),
    StoreValue::List(items) => items.iter().for_each(|item| collect_refs_value(item, out)),
    StoreValue::Inline(bag) => collect_refs_bag(bag, out),
    StoreValue::Scalar(_) => {}
  }
}
