//! Catalog client that wires the cache, executors, and session together.

use chrono::Duration;
use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::documents;
use super::reconcile::{BorrowBook, CreateBook, DeleteBook, RememberUser, ReturnBook};
use super::route::Route;
use super::types::{
  AuthPayload, Author, AuthorSummary, Book, BookUpdatePayload, DeletePayload, SessionUser,
};
use crate::cache::{CacheHandle, IdentityResolver, IdentityScheme};
use crate::config::Config;
use crate::document::{variables, Operation, Variables};
use crate::mutation::MutationExecutor;
use crate::query::{FetchPolicy, QueryExecutor, WatchedQuery};
use crate::session::{SessionGate, SessionState, TokenStore, IS_AUTHENTICATED};
use crate::transport::{AuthHeader, ErrorReporter, HttpTransport, Pipeline, Transport};

/// Catalog client with a normalized cache behind every read.
///
/// Clones share one cache and one session.
#[derive(Clone)]
pub struct LibraryClient {
  queries: QueryExecutor,
  mutations: MutationExecutor,
  session: SessionGate,
}

impl LibraryClient {
  /// Create a client talking to the configured endpoint over HTTP.
  pub fn new(config: &Config, tokens: Arc<dyn TokenStore>) -> Result<Self> {
    let transport = HttpTransport::new(config.endpoint_url()?);
    Ok(Self::with_transport(
      Arc::new(transport),
      tokens,
      config.identity,
      config.stale_time(),
    ))
  }

  pub fn with_transport(
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
    identity: IdentityScheme,
    stale_time: Option<Duration>,
  ) -> Self {
    let session = SessionGate::new(Arc::clone(&tokens));
    let cache = CacheHandle::new(IdentityResolver::new(identity), session.local_schema());
    let pipeline = Pipeline::new(transport)
      .with(ErrorReporter::default())
      .with(AuthHeader::new(tokens));

    Self {
      queries: QueryExecutor::new(cache.clone(), pipeline.clone()).with_stale_time(stale_time),
      mutations: MutationExecutor::new(cache, pipeline),
      session,
    }
  }

  pub fn cache(&self) -> &CacheHandle {
    self.queries.cache()
  }

  pub fn queries(&self) -> &QueryExecutor {
    &self.queries
  }

  pub fn mutations(&self) -> &MutationExecutor {
    &self.mutations
  }

  pub fn session(&self) -> &SessionGate {
    &self.session
  }

  /// Validate a stored token against the server. Call once at startup.
  pub async fn restore_session(&self) -> SessionState {
    self
      .session
      .restore(&self.queries, &documents::current_user())
      .await
  }

  /// Whether `route` may be shown in the current session.
  pub fn allows(&self, route: &Route) -> bool {
    self.session.allows(route)
  }

  /// Read through the same interface views use, so it reflects the token
  /// slot at call time.
  pub fn is_authenticated(&self) -> bool {
    self
      .queries
      .read_cached(&documents::is_authenticated(), &Variables::new())
      .and_then(|data| data.get(IS_AUTHENTICATED).and_then(Value::as_bool))
      .unwrap_or(false)
  }

  async fn fetch<T: serde::de::DeserializeOwned>(
    &self,
    operation: &Operation,
    vars: Variables,
  ) -> Result<Option<T>> {
    let result = self
      .queries
      .fetch_root::<T>(operation, vars, FetchPolicy::CacheFirst)
      .await?;
    Ok(result.map(|r| r.data))
  }

  pub async fn books(&self) -> Result<Vec<Book>> {
    let books = self.fetch(&documents::get_books(), Variables::new()).await?;
    Ok(books.unwrap_or_default())
  }

  /// A single book; `None` when the server does not know it.
  pub async fn book(&self, book_id: &str) -> Result<Option<Book>> {
    self
      .fetch(&documents::get_book(), variables([("bookId", book_id)]))
      .await
  }

  pub async fn authors(&self) -> Result<Vec<AuthorSummary>> {
    let authors = self.fetch(&documents::get_authors(), Variables::new()).await?;
    Ok(authors.unwrap_or_default())
  }

  pub async fn author(&self, author_id: &str) -> Result<Option<Author>> {
    self
      .fetch(&documents::get_author(), variables([("authorId", author_id)]))
      .await
  }

  /// The signed-in user; `None` for an anonymous session.
  pub async fn me(&self) -> Result<Option<SessionUser>> {
    self
      .fetch(&documents::current_user(), Variables::new())
      .await
  }

  pub fn watch_books(&self) -> WatchedQuery<Vec<Book>> {
    self.queries.watch(documents::get_books(), Variables::new())
  }

  pub fn watch_book(&self, book_id: &str) -> WatchedQuery<Book> {
    self
      .queries
      .watch(documents::get_book(), variables([("bookId", book_id)]))
  }

  pub fn watch_me(&self) -> WatchedQuery<SessionUser> {
    self
      .queries
      .watch(documents::current_user(), Variables::new())
  }

  pub async fn login(&self, username: &str, password: &str) -> Result<AuthPayload> {
    self
      .authenticate(&documents::login(), username, password)
      .await
  }

  pub async fn signup(&self, username: &str, password: &str) -> Result<AuthPayload> {
    self
      .authenticate(&documents::signup(), username, password)
      .await
  }

  async fn authenticate(
    &self,
    operation: &Operation,
    username: &str,
    password: &str,
  ) -> Result<AuthPayload> {
    let payload: AuthPayload = self
      .mutations
      .mutate(
        operation,
        variables([("username", username), ("password", password)]),
        &RememberUser,
      )
      .await?;

    self.session.sign_in(&payload.token)?;
    // `isAuthenticated` reads the token slot; wake views that show it.
    self.cache().notify();
    info!(user = %payload.username, "authenticated");
    Ok(payload)
  }

  /// Clear the token and everything cached for this session.
  pub fn logout(&self) -> Result<()> {
    self.session.sign_out(self.cache())
  }

  pub async fn borrow(&self, book_id: &str) -> Result<BookUpdatePayload> {
    let payload = self
      .mutations
      .mutate(
        &documents::borrow_book(),
        variables([("bookIds", json!([book_id]))]),
        &BorrowBook,
      )
      .await?;
    Ok(payload)
  }

  pub async fn return_book(&self, book_id: &str) -> Result<BookUpdatePayload> {
    let reconcile = ReturnBook {
      book_id: book_id.to_string(),
    };
    let payload = self
      .mutations
      .mutate(
        &documents::return_book(),
        variables([("bookId", book_id)]),
        &reconcile,
      )
      .await?;
    Ok(payload)
  }

  pub async fn create_book(&self, title: &str, author_id: &str) -> Result<Book> {
    let book = self
      .mutations
      .mutate(
        &documents::create_book(),
        variables([("title", title), ("authorId", author_id)]),
        &CreateBook,
      )
      .await?;
    Ok(book)
  }

  /// Delete a book. Returns where to go next, since the book's own page is
  /// gone.
  pub async fn delete_book(&self, book_id: &str) -> Result<Route> {
    let reconcile = DeleteBook {
      author_id: self.cached_author_of(book_id),
    };
    let _: DeletePayload = self
      .mutations
      .mutate(
        &documents::delete_book(),
        variables([("bookId", book_id)]),
        &reconcile,
      )
      .await?;
    Ok(Route::Books)
  }

  /// Author of a cached book, from its detail view or the book index.
  fn cached_author_of(&self, book_id: &str) -> Option<String> {
    let from_detail = self
      .queries
      .read_cached(&documents::get_book(), &variables([("bookId", book_id)]))
      .and_then(|data| data["book"]["author"]["_id"].as_str().map(String::from));
    from_detail.or_else(|| {
      let data = self
        .queries
        .read_cached(&documents::get_books(), &Variables::new())?;
      data["books"]
        .as_array()?
        .iter()
        .find(|book| book["_id"].as_str() == Some(book_id))
        .and_then(|book| book["author"]["_id"].as_str().map(String::from))
    })
  }
}

impl std::fmt::Debug for LibraryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LibraryClient")
      .field("queries", &self.queries)
      .field("session", &self.session)
      .finish_non_exhaustive()
  }
}
