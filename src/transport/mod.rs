//! Request pipeline between the executors and the network.
//!
//! Every operation goes through one [`Pipeline`]: an ordered list of
//! [`Middleware`] that see the outgoing request and the outcome, ending in a
//! terminal [`Transport`]. Middleware observe and decorate traffic; they never
//! touch the cache and never turn an outcome into a panic.

mod http;
mod middleware;

pub use http::HttpTransport;
pub use middleware::{AuthHeader, Diagnostic, DiagnosticSink, ErrorReporter, TracingSink};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::document::{Operation, Variables};
use crate::error::{OperationError, ServerError};

/// Header carrying the credential token.
pub const AUTH_HEADER: &str = "authorization";

/// Wire form of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
  pub operation_name: String,
  pub query: String,
  pub variables: Variables,
  #[serde(skip)]
  pub headers: Vec<(String, String)>,
}

impl OperationRequest {
  pub fn new(operation: &Operation, variables: &Variables) -> Self {
    Self {
      operation_name: operation.name.to_string(),
      query: operation.document(),
      variables: variables.clone(),
      headers: Vec::new(),
    }
  }

  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.into()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Wire form of a response: data, structured errors, or both.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationResponse {
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub errors: Vec<ServerError>,
}

impl OperationResponse {
  pub fn has_errors(&self) -> bool {
    !self.errors.is_empty()
  }

  /// Data payload, or a protocol error if the server reported any.
  pub fn into_data(self) -> Result<Value, OperationError> {
    if !self.errors.is_empty() {
      return Err(OperationError::Protocol(self.errors));
    }
    self
      .data
      .ok_or_else(|| OperationError::Decode("response carried neither data nor errors".into()))
  }
}

/// Terminal link that actually delivers a request.
pub trait Transport: Send + Sync {
  fn send<'a>(
    &'a self,
    request: &'a OperationRequest,
  ) -> BoxFuture<'a, Result<OperationResponse, OperationError>>;
}

/// Hooks run for every request passing through a [`Pipeline`].
pub trait Middleware: Send + Sync {
  /// Decorate the outgoing request. Runs in pipeline order.
  fn on_request(&self, _request: &mut OperationRequest) {}

  /// Observe the outcome. Runs in reverse pipeline order.
  fn on_response(
    &self,
    _request: &OperationRequest,
    _outcome: &Result<OperationResponse, OperationError>,
  ) {
  }
}

/// Ordered middleware chain ending in a transport.
#[derive(Clone)]
pub struct Pipeline {
  middleware: Vec<Arc<dyn Middleware>>,
  transport: Arc<dyn Transport>,
}

impl Pipeline {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self {
      middleware: Vec::new(),
      transport,
    }
  }

  /// Append a middleware; it runs after those already added.
  pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
    self.middleware.push(Arc::new(middleware));
    self
  }

  pub async fn execute(
    &self,
    mut request: OperationRequest,
  ) -> Result<OperationResponse, OperationError> {
    for middleware in &self.middleware {
      middleware.on_request(&mut request);
    }

    let outcome = self.transport.send(&request).await;

    for middleware in self.middleware.iter().rev() {
      middleware.on_response(&request, &outcome);
    }
    outcome
  }
}

impl std::fmt::Debug for Pipeline {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pipeline")
      .field("middleware", &self.middleware.len())
      .finish_non_exhaustive()
  }
}
