//! Built-in middleware: credential attachment and error diagnostics.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{Middleware, OperationRequest, OperationResponse, AUTH_HEADER};
use crate::error::{OperationError, ServerError};
use crate::session::TokenStore;

/// Attaches the credential token, when one is stored, to every request.
pub struct AuthHeader {
  tokens: Arc<dyn TokenStore>,
}

impl AuthHeader {
  pub fn new(tokens: Arc<dyn TokenStore>) -> Self {
    Self { tokens }
  }
}

impl Middleware for AuthHeader {
  fn on_request(&self, request: &mut OperationRequest) {
    match self.tokens.load() {
      Ok(Some(token)) => request.set_header(AUTH_HEADER, token),
      Ok(None) => {}
      // Sent anonymously; the server decides what that means.
      Err(e) => warn!(error = %e, "could not read credential token"),
    }
  }
}

/// A failure worth reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
  /// The request failed before a response arrived.
  Transport { operation: String, message: String },
  /// The server returned a structured error entry.
  Protocol { operation: String, error: ServerError },
}

/// Where diagnostics go.
pub trait DiagnosticSink: Send + Sync {
  fn report(&self, diagnostic: Diagnostic);
}

/// Sink that writes diagnostics to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
  fn report(&self, diagnostic: Diagnostic) {
    match diagnostic {
      Diagnostic::Transport { operation, message } => {
        warn!(%operation, "[network error] {}", message);
      }
      Diagnostic::Protocol { operation, error } => {
        warn!(
          %operation,
          path = %error.path_string(),
          locations = ?error.locations,
          extensions = ?error.extensions,
          "[server error] {}",
          error.message
        );
      }
    }
  }
}

/// Routes transport and protocol failures to a [`DiagnosticSink`].
///
/// Purely observational: the outcome reaches the executors unchanged and
/// they decide how to present it.
pub struct ErrorReporter {
  sink: Arc<dyn DiagnosticSink>,
}

impl ErrorReporter {
  pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
    Self { sink }
  }
}

impl Default for ErrorReporter {
  fn default() -> Self {
    Self::new(Arc::new(TracingSink))
  }
}

impl Middleware for ErrorReporter {
  fn on_response(
    &self,
    request: &OperationRequest,
    outcome: &Result<OperationResponse, OperationError>,
  ) {
    let operation = &request.operation_name;
    match outcome {
      Ok(response) if response.has_errors() => {
        for error in &response.errors {
          self.sink.report(Diagnostic::Protocol {
            operation: operation.clone(),
            error: error.clone(),
          });
        }
      }
      Ok(_) => debug!(%operation, "operation completed"),
      Err(e) => self.sink.report(Diagnostic::Transport {
        operation: operation.clone(),
        message: e.to_string(),
      }),
    }
  }
}
