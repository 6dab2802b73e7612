//! Query execution over the normalized cache.
//!
//! [`QueryExecutor`] answers an operation from the store when the requested
//! shape is complete and fresh, and otherwise fetches it, normalizes the
//! response into the store, and reads the shape back. Identical operations in
//! flight at the same time share one request.
//!
//! [`WatchedQuery`] is the live view a screen holds on to. It encapsulates
//! loading/success/error states and follows store changes, so a mutation that
//! patches an entity shows up in every view that reads it.
//!
//! # Example
//!
//! ```ignore
//! let mut query = executor.watch::<Book>(documents::get_book(), variables([("bookId", id)]));
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(book) => render_book(book),
//!     QueryState::NotFound => render_not_found(),
//!     QueryState::Error { message, .. } => render_error(message),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::cache::{CacheHandle, CacheResult};
use crate::document::{Operation, Variables};
use crate::error::OperationError;
use crate::transport::{OperationRequest, OperationResponse, Pipeline};

/// How a read may use the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
  /// Serve a complete, fresh cached shape; fetch otherwise.
  #[default]
  CacheFirst,
  /// Always fetch (the response is still normalized into the store).
  NetworkOnly,
  /// Never fetch; an incomplete shape is a cache miss.
  CacheOnly,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, OperationError>>>;

/// Runs queries against the store and the network.
#[derive(Clone)]
pub struct QueryExecutor {
  inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
  cache: CacheHandle,
  pipeline: Pipeline,
  /// Requests currently on the wire, keyed by [`query_key`]
  in_flight: Mutex<HashMap<String, SharedFetch>>,
  /// How long a cached shape is served before it is refetched
  stale_time: Option<Duration>,
}

impl QueryExecutor {
  pub fn new(cache: CacheHandle, pipeline: Pipeline) -> Self {
    Self::build(cache, pipeline, Some(Duration::minutes(5)))
  }

  /// Set the stale time for cached shapes. `None` never goes stale.
  pub fn with_stale_time(self, stale_time: Option<Duration>) -> Self {
    Self::build(
      self.inner.cache.clone(),
      self.inner.pipeline.clone(),
      stale_time,
    )
  }

  fn build(cache: CacheHandle, pipeline: Pipeline, stale_time: Option<Duration>) -> Self {
    Self {
      inner: Arc::new(ExecutorInner {
        cache,
        pipeline,
        in_flight: Mutex::new(HashMap::new()),
        stale_time,
      }),
    }
  }

  pub fn cache(&self) -> &CacheHandle {
    &self.inner.cache
  }

  /// Create a live view. It stays idle until [`WatchedQuery::fetch`].
  pub fn watch<T: DeserializeOwned>(
    &self,
    operation: Operation,
    variables: Variables,
  ) -> WatchedQuery<T> {
    WatchedQuery::new(self.clone(), operation, variables)
  }

  /// Read the complete shape from the store, without touching the network.
  pub fn read_cached(&self, operation: &Operation, vars: &Variables) -> Option<Value> {
    self.inner.cache.read(|c| c.read_query(operation, vars))
  }

  /// Complete cached shape that is still within its stale time.
  fn read_fresh(
    &self,
    operation: &Operation,
    vars: &Variables,
  ) -> Option<(Value, Option<DateTime<Utc>>)> {
    let (data, written_at) = self.inner.cache.read(|c| {
      c.read_query(operation, vars)
        .map(|data| (data, c.written_at(operation, vars)))
    })?;
    if self.is_stale(written_at) {
      debug!(operation = operation.name, "cached shape is stale");
      return None;
    }
    Some((data, written_at))
  }

  fn is_stale(&self, written_at: Option<DateTime<Utc>>) -> bool {
    match (self.inner.stale_time, written_at) {
      (Some(stale_time), Some(written_at)) => Utc::now() - written_at >= stale_time,
      _ => false,
    }
  }

  /// Resolve an operation according to `policy`.
  pub async fn fetch(
    &self,
    operation: &Operation,
    vars: Variables,
    policy: FetchPolicy,
  ) -> Result<CacheResult<Value>, OperationError> {
    // Local-only operations are answered from process state, always.
    if operation.is_local_only() {
      return self
        .read_cached(operation, &vars)
        .map(|data| CacheResult::from_cache(data, None))
        .ok_or_else(|| OperationError::cache_miss(operation.name));
    }

    match policy {
      FetchPolicy::CacheOnly => {
        let written_at = self.inner.cache.read(|c| c.written_at(operation, &vars));
        return self
          .read_cached(operation, &vars)
          .map(|data| CacheResult::from_cache(data, written_at))
          .ok_or_else(|| OperationError::cache_miss(operation.name));
      }
      FetchPolicy::CacheFirst => {
        if let Some((data, written_at)) = self.read_fresh(operation, &vars) {
          debug!(operation = operation.name, "served from cache");
          return Ok(CacheResult::from_cache(data, written_at));
        }
      }
      FetchPolicy::NetworkOnly => {}
    }

    let data = self.fetch_network(operation, &vars).await?;
    // Read back through the store so local fields and merged entity fields
    // look exactly as they would on a cache hit.
    let data = self.read_cached(operation, &vars).unwrap_or(data);
    Ok(CacheResult::from_network(data))
  }

  /// Like [`fetch`](Self::fetch), returning the typed root field; `None`
  /// when the server answered `null` (not found).
  pub async fn fetch_root<T: DeserializeOwned>(
    &self,
    operation: &Operation,
    vars: Variables,
    policy: FetchPolicy,
  ) -> Result<Option<CacheResult<T>>, OperationError> {
    let result = self.fetch(operation, vars, policy).await?;
    let root = extract_root::<T>(operation, &result.data)?;
    Ok(root.map(|data| CacheResult {
      data,
      source: result.source,
      cached_at: result.cached_at,
    }))
  }

  async fn fetch_network(
    &self,
    operation: &Operation,
    vars: &Variables,
  ) -> Result<Value, OperationError> {
    // Requests sent before a reset are never joined afterwards.
    let generation = self.inner.cache.generation();
    let key = format!("{}:{}", generation, query_key(operation, vars));
    let fetch = {
      let mut in_flight = self
        .inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      match in_flight.get(&key) {
        Some(shared) => {
          debug!(operation = operation.name, "joining in-flight request");
          shared.clone()
        }
        None => {
          let shared =
            self.start_request(key.clone(), generation, operation.clone(), vars.clone());
          in_flight.insert(key, shared.clone());
          shared
        }
      }
    };
    fetch.await
  }

  fn start_request(
    &self,
    key: String,
    generation: u64,
    operation: Operation,
    vars: Variables,
  ) -> SharedFetch {
    let inner = Arc::clone(&self.inner);
    async move {
      let request = OperationRequest::new(&operation, &vars);
      let result = inner
        .pipeline
        .execute(request)
        .await
        .and_then(OperationResponse::into_data)
        .and_then(|data| {
          // Normalized once, however many callers share this request.
          inner
            .cache
            .update_from(generation, |c| c.write_query(&operation, &vars, &data))?;
          Ok(data)
        });

      inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&key);
      result
    }
    .boxed()
    .shared()
  }
}

impl std::fmt::Debug for QueryExecutor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryExecutor")
      .field("stale_time", &self.inner.stale_time)
      .finish_non_exhaustive()
  }
}

/// Deduplication key: SHA-256 over the operation and its canonical variables.
pub fn query_key(operation: &Operation, vars: &Variables) -> String {
  let canonical: BTreeMap<&String, &Value> = vars.iter().collect();
  let mut hasher = Sha256::new();
  hasher.update(operation.name.as_bytes());
  hasher.update(b"\n");
  hasher.update(operation.document().as_bytes());
  hasher.update(b"\n");
  hasher.update(serde_json::to_string(&canonical).unwrap_or_default().as_bytes());
  hex::encode(hasher.finalize())
}

/// Typed value of the operation's root field; `None` for `null`.
pub fn extract_root<T: DeserializeOwned>(
  operation: &Operation,
  data: &Value,
) -> Result<Option<T>, OperationError> {
  let root = operation
    .root_field()
    .ok_or_else(|| OperationError::Decode(format!("{} selects no fields", operation.name)))?;
  match data.get(root.name) {
    None | Some(Value::Null) => Ok(None),
    Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
  }
}

/// The state of a watched query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Fetching, with no complete cached shape to show
  Loading,
  /// Data present
  Success(T),
  /// The server answered, and the requested entity does not exist
  NotFound,
  /// Fetch failed. The last good data, if any, is kept in `stale`.
  Error { message: String, stale: Option<T> },
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, QueryState::NotFound)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error { .. })
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      QueryState::Error { stale, .. } => stale.as_ref(),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error { message, .. } => Some(message),
      _ => None,
    }
  }
}

/// Live view over one operation.
///
/// WatchedQuery<T> encapsulates:
/// - The operation and its variables
/// - Loading/success/not-found/error states
/// - Async result handling via channels
/// - Store change tracking, so cache patches re-render without a refetch
pub struct WatchedQuery<T> {
  executor: QueryExecutor,
  operation: Operation,
  variables: Variables,
  policy: FetchPolicy,
  state: QueryState<T>,
  /// Last good data while a refetch is loading
  previous: Option<T>,
  /// Raw root data last applied, to skip no-op store notifications
  snapshot: Option<Value>,
  receiver: Option<mpsc::UnboundedReceiver<Result<Value, OperationError>>>,
  changes: watch::Receiver<u64>,
}

impl<T: DeserializeOwned> WatchedQuery<T> {
  fn new(executor: QueryExecutor, operation: Operation, variables: Variables) -> Self {
    let mut changes = executor.cache().subscribe();
    changes.borrow_and_update();
    Self {
      executor,
      operation,
      variables,
      policy: FetchPolicy::CacheFirst,
      state: QueryState::Idle,
      previous: None,
      snapshot: None,
      receiver: None,
      changes,
    }
  }

  /// Set the fetch policy used by [`fetch`](Self::fetch).
  pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Data to show: current, or the last good data while loading or failed.
  pub fn data(&self) -> Option<&T> {
    match &self.state {
      QueryState::Loading => self.previous.as_ref(),
      state => state.data(),
    }
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_not_found(&self) -> bool {
    self.state.is_not_found()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  pub fn variables(&self) -> &Variables {
    &self.variables
  }

  /// Start fetching data if not already loading.
  ///
  /// A complete, fresh cached shape is applied immediately, without a
  /// loading state.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start(self.policy);
  }

  /// Force a network refetch, even if already loading or data exists.
  pub fn refetch(&mut self) {
    // Drop any pending fetch by dropping the receiver
    self.receiver = None;
    self.start(FetchPolicy::NetworkOnly);
  }

  /// Switch to new variables. The old data does not carry over.
  pub fn set_variables(&mut self, variables: Variables) {
    if variables == self.variables {
      return;
    }
    self.variables = variables;
    self.receiver = None;
    self.previous = None;
    self.snapshot = None;
    self.state = QueryState::Idle;
    self.start(self.policy);
  }

  /// Poll for fetch results and store changes.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if let Some(receiver) = &mut self.receiver {
      // Try to receive without blocking
      match receiver.try_recv() {
        Ok(result) => {
          self.receiver = None;
          self.apply(result);
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => {}
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Sender dropped without sending - treat as error
          self.receiver = None;
          self.apply(Err(OperationError::Transport(
            "query was cancelled".to_string(),
          )));
          changed = true;
        }
      }
    }

    if self.changes.has_changed().unwrap_or(false) {
      self.changes.borrow_and_update();
      if self.receiver.is_none() && !matches!(self.state, QueryState::Idle) {
        changed |= self.refresh_from_cache();
      }
    }

    changed
  }

  /// Re-read after a store change. Returns whether the view changed.
  fn refresh_from_cache(&mut self) -> bool {
    match self
      .executor
      .read_cached(&self.operation, &self.variables)
    {
      Some(data) => {
        if self.snapshot.as_ref() == Some(&data) {
          return false;
        }
        self.apply(Ok(data));
        true
      }
      None => {
        // Evicted or reset underneath us; the shape has to be fetched again.
        debug!(operation = self.operation.name, "watched shape left the store");
        self.start(self.policy);
        true
      }
    }
  }

  fn start(&mut self, policy: FetchPolicy) {
    if policy != FetchPolicy::NetworkOnly {
      let cached = if policy == FetchPolicy::CacheOnly {
        self.executor.read_cached(&self.operation, &self.variables)
      } else {
        self
          .executor
          .read_fresh(&self.operation, &self.variables)
          .map(|(data, _)| data)
      };
      if let Some(data) = cached {
        self.apply(Ok(data));
        return;
      }
    }

    match std::mem::replace(&mut self.state, QueryState::Loading) {
      QueryState::Success(data) => self.previous = Some(data),
      QueryState::Error {
        stale: Some(data), ..
      } => self.previous = Some(data),
      _ => {}
    }

    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);

    let executor = self.executor.clone();
    let operation = self.operation.clone();
    let variables = self.variables.clone();
    tokio::spawn(async move {
      let result = executor
        .fetch(&operation, variables, policy)
        .await
        .map(|result| result.data);
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }

  fn apply(&mut self, result: Result<Value, OperationError>) {
    let result = result.and_then(|data| {
      let root = extract_root::<T>(&self.operation, &data)?;
      Ok((data, root))
    });

    match result {
      Ok((data, Some(root))) => {
        self.snapshot = Some(data);
        self.previous = None;
        self.state = QueryState::Success(root);
      }
      Ok((data, None)) => {
        self.snapshot = Some(data);
        self.previous = None;
        self.state = QueryState::NotFound;
      }
      Err(e) => {
        let stale = match std::mem::replace(&mut self.state, QueryState::Idle) {
          QueryState::Success(data) => Some(data),
          QueryState::Error { stale, .. } => stale,
          _ => self.previous.take(),
        };
        self.state = QueryState::Error {
          message: e.to_string(),
          stale,
        };
      }
    }
  }
}

// WatchedQuery is not Clone because the receiver is owned.
// If you need to share one, wrap it in Arc<Mutex<WatchedQuery<T>>>.

impl<T: std::fmt::Debug> std::fmt::Debug for WatchedQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WatchedQuery")
      .field("operation", &self.operation.name)
      .field("state", &self.state)
      .field("policy", &self.policy)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, LocalSchema};
  use crate::document::{variables, Arg, Field, Selection};
  use crate::testing::{executor_with, ScriptedTransport};
  use serde::Deserialize;
  use serde_json::json;
  use std::time::Duration as StdDuration;

  #[derive(Debug, Clone, PartialEq, Deserialize)]
  struct Book {
    id: String,
    title: String,
  }

  fn book_fields() -> Selection {
    Selection::new("Book", [Field::scalar("id"), Field::scalar("title")])
  }

  fn get_books() -> Operation {
    Operation::query("GetBooks", [Field::object("books", book_fields())])
  }

  fn get_book() -> Operation {
    Operation::query(
      "GetBook",
      [Field::object("book", book_fields()).arg("id", Arg::Var("bookId"))],
    )
    .variable("bookId", "ID!")
  }

  fn books_response() -> Value {
    json!({"data": {"books": [{"id": "b1", "title": "Dune"}]}})
  }

  fn book_response(request: &OperationRequest) -> Result<Value, OperationError> {
    match request.variables.get("bookId").and_then(Value::as_str) {
      Some("b1") => Ok(json!({"data": {"book": {"id": "b1", "title": "Dune"}}})),
      Some("b2") => Ok(json!({"data": {"book": {"id": "b2", "title": "Emma"}}})),
      _ => Ok(json!({"data": {"book": null}})),
    }
  }

  async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }

  #[tokio::test]
  async fn test_cache_first_serves_complete_shape() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let executor = executor_with(transport.clone(), LocalSchema::new());

    let first = executor
      .fetch(&get_books(), Variables::new(), FetchPolicy::CacheFirst)
      .await
      .unwrap();
    let second = executor
      .fetch(&get_books(), Variables::new(), FetchPolicy::CacheFirst)
      .await
      .unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(first.data, second.data);
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_network_only_always_fetches() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let executor = executor_with(transport.clone(), LocalSchema::new());

    for _ in 0..2 {
      executor
        .fetch(&get_books(), Variables::new(), FetchPolicy::NetworkOnly)
        .await
        .unwrap();
    }
    assert_eq!(transport.requests().len(), 2);
  }

  #[tokio::test]
  async fn test_cache_only_reports_miss() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let executor = executor_with(transport.clone(), LocalSchema::new());

    let result = executor
      .fetch(&get_books(), Variables::new(), FetchPolicy::CacheOnly)
      .await;
    assert!(matches!(result, Err(OperationError::CacheMiss(_))));
    assert!(transport.requests().is_empty());
  }

  #[tokio::test]
  async fn test_partial_cache_hit_fetches() {
    let transport = Arc::new(ScriptedTransport::new(|_| {
      Ok(json!({"data": {"books": [{"id": "b1", "title": "Dune", "isBooked": true}]}}))
    }));
    let executor = executor_with(transport.clone(), LocalSchema::new());
    executor
      .fetch(&get_books(), Variables::new(), FetchPolicy::CacheFirst)
      .await
      .unwrap();

    let detailed = Operation::query(
      "GetBooksDetailed",
      [Field::object(
        "books",
        book_fields().with(Field::scalar("isBooked")),
      )],
    );
    let result = executor
      .fetch(&detailed, Variables::new(), FetchPolicy::CacheFirst)
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(transport.requests().len(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_identical_queries_share_one_request() {
    let transport = Arc::new(
      ScriptedTransport::new(|_| Ok(books_response())).with_delay(StdDuration::from_millis(30)),
    );
    let executor = executor_with(transport.clone(), LocalSchema::new());

    let operation = get_books();
    let (a, b) = tokio::join!(
      executor.fetch(&operation, Variables::new(), FetchPolicy::NetworkOnly),
      executor.fetch(&operation, Variables::new(), FetchPolicy::NetworkOnly),
    );

    assert_eq!(a.unwrap().data, b.unwrap().data);
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_reset_fences_requests_in_flight() {
    let transport = Arc::new(
      ScriptedTransport::new(|_| Ok(books_response())).with_delay(StdDuration::from_millis(50)),
    );
    let executor = executor_with(transport.clone(), LocalSchema::new());

    let pending = {
      let executor = executor.clone();
      tokio::spawn(async move {
        executor
          .fetch(&get_books(), Variables::new(), FetchPolicy::NetworkOnly)
          .await
      })
    };
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    executor.cache().reset();

    // A request after the reset does not join the one sent before it.
    let fresh = executor
      .fetch(&get_books(), Variables::new(), FetchPolicy::NetworkOnly)
      .await;
    assert!(fresh.is_ok());
    assert_eq!(transport.requests().len(), 2);

    let stale = pending.await.unwrap();
    assert!(matches!(stale, Err(OperationError::Transport(_))));
  }

  #[tokio::test]
  async fn test_reset_drops_late_response() {
    let transport = Arc::new(
      ScriptedTransport::new(|_| Ok(books_response())).with_delay(StdDuration::from_millis(30)),
    );
    let executor = executor_with(transport, LocalSchema::new());

    let pending = {
      let executor = executor.clone();
      tokio::spawn(async move {
        executor
          .fetch(&get_books(), Variables::new(), FetchPolicy::NetworkOnly)
          .await
      })
    };
    tokio::time::sleep(StdDuration::from_millis(5)).await;
    executor.cache().reset();

    assert!(pending.await.unwrap().is_err());
    assert!(executor.cache().read(|c| c.store().is_empty()));
  }

  #[tokio::test]
  async fn test_different_variables_are_not_deduplicated() {
    let transport = Arc::new(
      ScriptedTransport::new(book_response).with_delay(StdDuration::from_millis(10)),
    );
    let executor = executor_with(transport.clone(), LocalSchema::new());

    let operation = get_book();
    let (a, b) = tokio::join!(
      executor.fetch_root::<Book>(&operation, variables([("bookId", "b1")]), FetchPolicy::CacheFirst),
      executor.fetch_root::<Book>(&operation, variables([("bookId", "b2")]), FetchPolicy::CacheFirst),
    );

    assert_eq!(a.unwrap().unwrap().data.title, "Dune");
    assert_eq!(b.unwrap().unwrap().data.title, "Emma");
    assert_eq!(transport.requests().len(), 2);
  }

  #[tokio::test]
  async fn test_stale_shape_is_refetched() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let executor =
      executor_with(transport.clone(), LocalSchema::new()).with_stale_time(Some(Duration::zero()));

    for _ in 0..2 {
      executor
        .fetch(&get_books(), Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap();
    }
    assert_eq!(transport.requests().len(), 2);
  }

  #[tokio::test]
  async fn test_errors_leave_store_untouched() {
    let transport = Arc::new(ScriptedTransport::new(|_| {
      Ok(json!({"errors": [{"message": "boom", "path": ["books"]}]}))
    }));
    let executor = executor_with(transport, LocalSchema::new());

    let result = executor
      .fetch(&get_books(), Variables::new(), FetchPolicy::CacheFirst)
      .await;

    assert!(matches!(result, Err(OperationError::Protocol(_))));
    assert!(executor.cache().read(|c| c.store().is_empty()));
  }

  #[tokio::test]
  async fn test_local_fields_merge_with_remote() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let local = LocalSchema::new().field("isAuthenticated", || json!(true));
    let executor = executor_with(transport.clone(), local);

    let mixed = Operation::query(
      "Home",
      [
        Field::object("books", book_fields()),
        Field::local("isAuthenticated"),
      ],
    );
    let result = executor
      .fetch(&mixed, Variables::new(), FetchPolicy::CacheFirst)
      .await
      .unwrap();

    assert_eq!(result.data["isAuthenticated"], json!(true));
    assert_eq!(result.data["books"][0]["title"], json!("Dune"));
    assert!(!transport.requests()[0].query.contains("isAuthenticated"));

    let local_only = Operation::query("IsAuthenticated", [Field::local("isAuthenticated")]);
    let result = executor
      .fetch(&local_only, Variables::new(), FetchPolicy::NetworkOnly)
      .await
      .unwrap();
    assert_eq!(result.data, json!({"isAuthenticated": true}));
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_fetch_root_maps_null_to_none() {
    let transport = Arc::new(ScriptedTransport::new(book_response));
    let executor = executor_with(transport, LocalSchema::new());

    let missing = executor
      .fetch_root::<Book>(&get_book(), variables([("bookId", "nope")]), FetchPolicy::CacheFirst)
      .await
      .unwrap();
    assert!(missing.is_none());
  }

  #[test]
  fn test_query_key_ignores_variable_order() {
    let mut a = Variables::new();
    a.insert("x".into(), json!(1));
    a.insert("y".into(), json!(2));
    let mut b = Variables::new();
    b.insert("y".into(), json!(2));
    b.insert("x".into(), json!(1));

    assert_eq!(query_key(&get_book(), &a), query_key(&get_book(), &b));
    assert_ne!(
      query_key(&get_book(), &a),
      query_key(&get_book(), &variables([("bookId", "b1")]))
    );
  }

  #[tokio::test]
  async fn test_watched_query_success() {
    let transport = Arc::new(ScriptedTransport::new(book_response));
    let executor = executor_with(transport, LocalSchema::new());
    let mut query = executor.watch::<Book>(get_book(), variables([("bookId", "b1")]));

    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    settle().await;

    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.data().map(|b| b.title.as_str()), Some("Dune"));
  }

  #[tokio::test]
  async fn test_watched_query_not_found_is_distinct() {
    let transport = Arc::new(ScriptedTransport::new(book_response));
    let executor = executor_with(transport, LocalSchema::new());
    let mut query = executor.watch::<Book>(get_book(), variables([("bookId", "zzz")]));

    query.fetch();
    assert!(!query.is_not_found());
    settle().await;
    query.poll();

    assert!(query.is_not_found());
    assert!(query.data().is_none());
  }

  #[tokio::test]
  async fn test_watched_query_served_from_cache_without_loading() {
    let transport = Arc::new(ScriptedTransport::new(book_response));
    let executor = executor_with(transport.clone(), LocalSchema::new());
    executor
      .fetch(&get_book(), variables([("bookId", "b1")]), FetchPolicy::CacheFirst)
      .await
      .unwrap();

    let mut query = executor.watch::<Book>(get_book(), variables([("bookId", "b1")]));
    query.fetch();

    assert!(query.is_success());
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_watched_query_keeps_data_on_error() {
    let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let fail_clone = fail.clone();
    let transport = Arc::new(ScriptedTransport::new(move |request| {
      if fail_clone.load(std::sync::atomic::Ordering::SeqCst) {
        Err(OperationError::Transport("offline".into()))
      } else {
        book_response(request)
      }
    }));
    let executor = executor_with(transport, LocalSchema::new());
    let mut query = executor.watch::<Book>(get_book(), variables([("bookId", "b1")]));

    query.fetch();
    settle().await;
    query.poll();
    assert!(query.is_success());

    fail.store(true, std::sync::atomic::Ordering::SeqCst);
    query.refetch();
    assert_eq!(query.data().map(|b| b.id.as_str()), Some("b1"));
    settle().await;
    query.poll();

    assert!(query.is_error());
    assert_eq!(query.error(), Some("network error: offline"));
    assert_eq!(query.data().map(|b| b.id.as_str()), Some("b1"));
  }

  #[tokio::test]
  async fn test_watched_query_follows_store_changes() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let executor = executor_with(transport.clone(), LocalSchema::new());
    let mut query = executor.watch::<Vec<Book>>(get_books(), Variables::new());
    query.fetch();
    settle().await;
    query.poll();

    // Nothing changed since the last poll.
    assert!(!query.poll());

    executor
      .cache()
      .update(|c| {
        c.write_query(
          &get_book(),
          &variables([("bookId", "b1")]),
          &json!({"book": {"id": "b1", "title": "Dune (revised)"}}),
        )
      })
      .unwrap();

    assert!(query.poll());
    assert_eq!(query.data().unwrap()[0].title, "Dune (revised)");
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_watched_query_refetches_after_reset() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(books_response())));
    let executor = executor_with(transport.clone(), LocalSchema::new());
    let mut query = executor.watch::<Vec<Book>>(get_books(), Variables::new());
    query.fetch();
    settle().await;
    query.poll();

    executor.cache().reset();
    assert!(query.poll());
    assert!(query.is_loading());

    settle().await;
    query.poll();
    assert!(query.is_success());
    assert_eq!(transport.requests().len(), 2);
  }

  #[tokio::test]
  async fn test_set_variables_reloads() {
    let transport = Arc::new(ScriptedTransport::new(book_response));
    let executor = executor_with(transport, LocalSchema::new());
    let mut query = executor.watch::<Book>(get_book(), variables([("bookId", "b1")]));
    query.fetch();
    settle().await;
    query.poll();

    query.set_variables(variables([("bookId", "b2")]));
    assert!(query.is_loading());
    assert!(query.data().is_none());

    settle().await;
    query.poll();
    assert_eq!(query.data().map(|b| b.title.as_str()), Some("Emma"));
  }
}
