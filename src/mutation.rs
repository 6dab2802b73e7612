//! Mutation execution with cache reconciliation.
//!
//! A write goes to the server first. Only a successful, accepted result is
//! merged into the store, followed by the caller's reconciliation, both inside
//! one cache update so readers never observe a half-applied patch.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheHandle};
use crate::document::{Operation, Variables};
use crate::error::OperationError;
use crate::query::extract_root;
use crate::transport::{OperationRequest, Pipeline};

/// A mutation payload that can report a business-level refusal.
pub trait Outcome {
  /// Message to show when the server declined the write.
  fn rejection(&self) -> Option<String> {
    None
  }
}

/// Untyped payloads follow the catalog's `{success, message}` convention.
impl Outcome for Value {
  fn rejection(&self) -> Option<String> {
    match self.get("success") {
      Some(Value::Bool(false)) => Some(rejection_message(
        self.get("message").and_then(Value::as_str),
      )),
      _ => None,
    }
  }
}

/// User-facing text for a refusal, with a fallback for an empty message.
pub fn rejection_message(message: Option<&str>) -> String {
  match message {
    Some(message) if !message.is_empty() => message.to_string(),
    _ => "The request was declined".to_string(),
  }
}

/// Patches the store after an accepted mutation.
///
/// Returning [`OperationError::CacheMiss`] means the shape being patched was
/// never cached in this session; the executor skips it.
pub trait Reconcile<T>: Send + Sync {
  fn reconcile(&self, cache: &mut Cache, result: &T) -> Result<(), OperationError>;
}

impl<T, F> Reconcile<T> for F
where
  F: Fn(&mut Cache, &T) -> Result<(), OperationError> + Send + Sync,
{
  fn reconcile(&self, cache: &mut Cache, result: &T) -> Result<(), OperationError> {
    self(cache, result)
  }
}

/// Reconciliation for mutations whose normalized merge is enough.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReconcile;

impl<T> Reconcile<T> for NoReconcile {
  fn reconcile(&self, _cache: &mut Cache, _result: &T) -> Result<(), OperationError> {
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct MutationExecutor {
  cache: CacheHandle,
  pipeline: Pipeline,
}

impl MutationExecutor {
  pub fn new(cache: CacheHandle, pipeline: Pipeline) -> Self {
    Self { cache, pipeline }
  }

  pub fn cache(&self) -> &CacheHandle {
    &self.cache
  }

  /// Issue a write and reconcile the store with its result.
  ///
  /// Transport and protocol failures, refusals, and `null` payloads all leave
  /// the store untouched. So does a reset while the request is in flight,
  /// and a reconciliation that fails for any reason other than a missing
  /// cached shape.
  pub async fn mutate<T, R>(
    &self,
    operation: &Operation,
    vars: Variables,
    reconcile: &R,
  ) -> Result<T, OperationError>
  where
    T: DeserializeOwned + Outcome,
    R: Reconcile<T> + ?Sized,
  {
    let generation = self.cache.generation();
    let request = OperationRequest::new(operation, &vars);
    let data = self.pipeline.execute(request).await?.into_data()?;

    let payload = extract_root::<T>(operation, &data)?.ok_or_else(|| {
      OperationError::Rejected(format!("{} returned nothing", operation.name))
    })?;
    if let Some(message) = payload.rejection() {
      info!(operation = operation.name, %message, "mutation declined");
      return Err(OperationError::Rejected(message));
    }

    self
      .cache
      .update_from(generation, |cache| {
        cache.staged(|cache| {
          cache.merge_result(operation, &vars, &data)?;
          match reconcile.reconcile(cache, &payload) {
            Ok(()) => debug!(operation = operation.name, "cache reconciled"),
            Err(OperationError::CacheMiss(what)) => {
              debug!(operation = operation.name, %what, "reconciliation skipped")
            }
            Err(e) => return Err(e),
          }
          Ok(())
        })
      })
      .map_err(|e| {
        warn!(operation = operation.name, error = %e, "mutation result not applied");
        e
      })?;

    Ok(payload)
  }
}
