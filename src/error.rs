//! Error taxonomy for cache-backed operations.
//!
//! None of these are fatal: executors hand them to the caller, and the
//! worst a caller sees is an error state on a view.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Source position of a server-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
  pub line: u32,
  pub column: u32,
}

/// One structured error entry returned by the server instead of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
  pub message: String,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub path: Vec<Value>,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub locations: Vec<Location>,
  #[serde(default)]
  pub extensions: Option<Value>,
}

/// Servers send `null` as readily as they omit the field.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de>,
{
  Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ServerError {
  /// Dotted rendering of the response path, e.g. `book.author`.
  pub fn path_string(&self) -> String {
    self
      .path
      .iter()
      .map(|segment| match segment {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      })
      .collect::<Vec<_>>()
      .join(".")
  }
}

#[derive(Debug, Clone, Error)]
pub enum OperationError {
  /// The request never reached the server or no response came back.
  #[error("network error: {0}")]
  Transport(String),

  /// The server answered with structured errors instead of data.
  #[error("server error: {}", summarize(.0))]
  Protocol(Vec<ServerError>),

  /// A well-formed response that explicitly reports failure.
  #[error("{0}")]
  Rejected(String),

  /// A shape that was needed locally is not in the store.
  #[error("{0} is not cached")]
  CacheMiss(String),

  /// The response did not match the requested shape.
  #[error("unexpected response: {0}")]
  Decode(String),
}

impl OperationError {
  /// Whether retrying the same operation can succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Transport(_) | Self::Protocol(_))
  }

  pub fn cache_miss(what: impl Into<String>) -> Self {
    Self::CacheMiss(what.into())
  }
}

impl From<serde_json::Error> for OperationError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

fn summarize(errors: &[ServerError]) -> String {
  if errors.is_empty() {
    return "empty error list".to_string();
  }
  errors
    .iter()
    .map(|e| e.message.as_str())
    .collect::<Vec<_>>()
    .join("; ")
}
