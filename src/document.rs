//! Typed operation documents.
//!
//! An [`Operation`] is a named query or mutation whose selection set is an
//! explicit tree of [`Field`]s. Every object selection is tagged with the
//! entity type it returns, which is what lets the normalizer derive entity
//! keys without trusting the payload to carry its own type name.
//!
//! Documents are rendered to the wire query language on demand; fields
//! marked local are stripped from the rendered text and resolved on the
//! client instead.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Variables sent alongside an operation document.
pub type Variables = Map<String, Value>;

/// Build a variables map from `(name, value)` pairs.
pub fn variables<I, V>(pairs: I) -> Variables
where
  I: IntoIterator<Item = (&'static str, V)>,
  V: Into<Value>,
{
  pairs
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.into()))
    .collect()
}

/// Argument value of a field: either a reference to an operation variable
/// or an inline literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
  Var(&'static str),
  Literal(Value),
}

impl Arg {
  fn resolve(&self, vars: &Variables) -> Value {
    match self {
      Arg::Var(name) => vars.get(*name).cloned().unwrap_or(Value::Null),
      Arg::Literal(value) => value.clone(),
    }
  }

  fn render(&self) -> String {
    match self {
      Arg::Var(name) => format!("${}", name),
      Arg::Literal(value) => value.to_string(),
    }
  }
}

/// A single requested field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
  pub name: &'static str,
  pub args: Vec<(&'static str, Arg)>,
  /// Sub-selection for object (or list-of-object) fields
  pub selection: Option<Selection>,
  /// Resolved on the client, never sent to the server
  pub local: bool,
}

impl Field {
  /// A remote scalar field.
  pub fn scalar(name: &'static str) -> Self {
    Self {
      name,
      args: Vec::new(),
      selection: None,
      local: false,
    }
  }

  /// A remote field returning an object or a list of objects.
  pub fn object(name: &'static str, selection: Selection) -> Self {
    Self {
      name,
      args: Vec::new(),
      selection: Some(selection),
      local: false,
    }
  }

  /// A client-only scalar field.
  pub fn local(name: &'static str) -> Self {
    Self {
      name,
      args: Vec::new(),
      selection: None,
      local: true,
    }
  }

  pub fn arg(mut self, name: &'static str, arg: Arg) -> Self {
    self.args.push((name, arg));
    self
  }

  /// Key under which this field is stored in its parent field-bag.
  ///
  /// Fields without arguments use their name; fields with arguments append
  /// the resolved arguments as canonical (key-sorted) JSON, so `book(id: "b1")`
  /// and `book(id: "b2")` occupy different slots.
  pub fn storage_key(&self, vars: &Variables) -> String {
    if self.args.is_empty() {
      return self.name.to_string();
    }
    let args: BTreeMap<&str, Value> = self
      .args
      .iter()
      .map(|(name, arg)| (*name, arg.resolve(vars)))
      .collect();
    let rendered = serde_json::to_string(&args).unwrap_or_default();
    format!("{}({})", self.name, rendered)
  }

  fn is_remote(&self) -> bool {
    !self.local
      && self
        .selection
        .as_ref()
        .map(Selection::has_remote_fields)
        .unwrap_or(true)
  }

  fn render(&self, out: &mut String) {
    out.push_str(self.name);
    if !self.args.is_empty() {
      let args: Vec<String> = self
        .args
        .iter()
        .map(|(name, arg)| format!("{}: {}", name, arg.render()))
        .collect();
      let _ = write!(out, "({})", args.join(", "));
    }
    if let Some(selection) = &self.selection {
      out.push(' ');
      selection.render(out);
    }
  }
}

/// A set of fields requested on one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
  pub typename: &'static str,
  pub fields: Vec<Field>,
}

impl Selection {
  pub fn new(typename: &'static str, fields: impl IntoIterator<Item = Field>) -> Self {
    Self {
      typename,
      fields: fields.into_iter().collect(),
    }
  }

  /// Add a field, replacing any earlier field of the same name.
  pub fn with(mut self, field: Field) -> Self {
    self.fields.retain(|f| f.name != field.name);
    self.fields.push(field);
    self
  }

  pub fn has_remote_fields(&self) -> bool {
    self.fields.iter().any(Field::is_remote)
  }

  fn render(&self, out: &mut String) {
    out.push_str("{ ");
    for field in self.fields.iter().filter(|f| f.is_remote()) {
      field.render(out);
      out.push(' ');
    }
    out.push('}');
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  Query,
  Mutation,
}

impl OperationKind {
  fn keyword(self) -> &'static str {
    match self {
      OperationKind::Query => "query",
      OperationKind::Mutation => "mutation",
    }
  }
}

/// A named query or mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
  pub kind: OperationKind,
  pub name: &'static str,
  /// Declared variables as `(name, type)` pairs, e.g. `("bookId", "ID!")`
  pub variables: Vec<(&'static str, &'static str)>,
  pub selection: Selection,
}

impl Operation {
  pub fn query(name: &'static str, fields: impl IntoIterator<Item = Field>) -> Self {
    Self {
      kind: OperationKind::Query,
      name,
      variables: Vec::new(),
      selection: Selection::new("Query", fields),
    }
  }

  pub fn mutation(name: &'static str, fields: impl IntoIterator<Item = Field>) -> Self {
    Self {
      kind: OperationKind::Mutation,
      name,
      variables: Vec::new(),
      selection: Selection::new("Mutation", fields),
    }
  }

  pub fn variable(mut self, name: &'static str, ty: &'static str) -> Self {
    self.variables.push((name, ty));
    self
  }

  /// The first top-level field. Typed results are read from it.
  pub fn root_field(&self) -> Option<&Field> {
    self.selection.fields.first()
  }

  /// True when nothing in this operation needs the network.
  pub fn is_local_only(&self) -> bool {
    !self.selection.has_remote_fields()
  }

  /// Render the network document, with local fields stripped.
  pub fn document(&self) -> String {
    let mut out = String::new();
    out.push_str(self.kind.keyword());
    out.push(' ');
    out.push_str(self.name);
    if !self.variables.is_empty() {
      let defs: Vec<String> = self
        .variables
        .iter()
        .map(|(name, ty)| format!("${}: {}", name, ty))
        .collect();
      let _ = write!(out, "({})", defs.join(", "));
    }
    out.push(' ');
    self.selection.render(&mut out);
    out
  }
}
