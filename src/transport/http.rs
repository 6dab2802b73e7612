//! HTTP transport: one JSON POST per operation to a single endpoint.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Instant;
use tracing::debug;
use url::Url;

use super::{OperationRequest, OperationResponse, Transport};
use crate::error::OperationError;

#[derive(Debug, Clone)]
pub struct HttpTransport {
  endpoint: Url,
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(endpoint: Url) -> Self {
    Self {
      endpoint,
      client: reqwest::Client::new(),
    }
  }

  pub fn with_client(endpoint: Url, client: reqwest::Client) -> Self {
    Self { endpoint, client }
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  async fn post(&self, request: &OperationRequest) -> Result<OperationResponse, OperationError> {
    let mut builder = self.client.post(self.endpoint.clone()).json(request);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let started = Instant::now();
    debug!(
      operation = %request.operation_name,
      endpoint = %self.endpoint,
      "sending operation"
    );

    let response = builder
      .send()
      .await
      .map_err(|e| OperationError::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| OperationError::Transport(format!("failed to read response body: {}", e)))?;

    debug!(
      operation = %request.operation_name,
      %status,
      duration_ms = started.elapsed().as_millis() as u64,
      "response received"
    );

    // Servers answer request-level errors (bad document, bad variables) with a
    // 4xx status and a regular error body; keep those as protocol errors.
    match serde_json::from_str::<OperationResponse>(&body) {
      Ok(parsed) if status.is_success() || parsed.has_errors() => Ok(parsed),
      Ok(_) => Err(OperationError::Transport(format!("HTTP {}", status))),
      Err(e) if status.is_success() => Err(OperationError::Decode(format!(
        "malformed response body: {}",
        e
      ))),
      Err(_) => Err(OperationError::Transport(format!(
        "HTTP {}: {}",
        status,
        truncate(&body, 200)
      ))),
    }
  }
}

impl Transport for HttpTransport {
  fn send<'a>(
    &'a self,
    request: &'a OperationRequest,
  ) -> BoxFuture<'a, Result<OperationResponse, OperationError>> {
    self.post(request).boxed()
  }
}

fn truncate(s: &str, max_len: usize) -> &str {
  match s.char_indices().nth(max_len) {
    Some((idx, _)) => &s[..idx],
    None => s,
  }
}
