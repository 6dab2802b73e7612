//! Test doubles: a scripted transport, a recording diagnostic sink, and an
//! in-memory catalog server.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheHandle, IdentityResolver, LocalSchema};
use crate::error::OperationError;
use crate::query::QueryExecutor;
use crate::transport::{
  Diagnostic, DiagnosticSink, OperationRequest, OperationResponse, Pipeline, Transport,
  AUTH_HEADER,
};

type Handler = Box<dyn Fn(&OperationRequest) -> Result<Value, OperationError> + Send + Sync>;

/// Transport answering from a closure that returns the full response body.
pub(crate) struct ScriptedTransport {
  handler: Handler,
  delay: Option<Duration>,
  requests: Mutex<Vec<OperationRequest>>,
}

impl ScriptedTransport {
  pub fn new<F>(handler: F) -> Self
  where
    F: Fn(&OperationRequest) -> Result<Value, OperationError> + Send + Sync + 'static,
  {
    Self {
      handler: Box::new(handler),
      delay: None,
      requests: Mutex::new(Vec::new()),
    }
  }

  /// Hold every response for `delay`, so concurrent requests overlap.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn requests(&self) -> Vec<OperationRequest> {
    self.requests.lock().unwrap().clone()
  }

  /// Number of requests sent for `operation`.
  pub fn calls(&self, operation: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.operation_name == operation)
      .count()
  }

  async fn respond(&self, request: &OperationRequest) -> Result<OperationResponse, OperationError> {
    self.requests.lock().unwrap().push(request.clone());
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    let body = (self.handler)(request)?;
    Ok(serde_json::from_value(body)?)
  }
}

impl Transport for ScriptedTransport {
  fn send<'a>(
    &'a self,
    request: &'a OperationRequest,
  ) -> BoxFuture<'a, Result<OperationResponse, OperationError>> {
    self.respond(request).boxed()
  }
}

/// Sink that keeps every diagnostic for inspection.
#[derive(Default)]
pub(crate) struct RecordingSink {
  diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
  pub fn diagnostics(&self) -> Vec<Diagnostic> {
    self.diagnostics.lock().unwrap().clone()
  }
}

impl DiagnosticSink for RecordingSink {
  fn report(&self, diagnostic: Diagnostic) {
    self.diagnostics.lock().unwrap().push(diagnostic);
  }
}

/// Query executor over a fresh cache and a bare pipeline.
pub(crate) fn executor_with(transport: Arc<ScriptedTransport>, local: LocalSchema) -> QueryExecutor {
  let cache = CacheHandle::new(IdentityResolver::default(), local);
  QueryExecutor::new(cache, Pipeline::new(transport))
}

#[derive(Debug, Clone)]
struct FakeBook {
  id: String,
  title: String,
  author_id: String,
  is_booked: bool,
}

#[derive(Debug, Clone)]
struct FakeUser {
  id: String,
  username: String,
  password: String,
  token: String,
  books: Vec<String>,
}

#[derive(Debug, Default)]
struct LibraryState {
  authors: Vec<(String, String)>,
  books: Vec<FakeBook>,
  users: Vec<FakeUser>,
  next_id: u32,
}

/// In-memory catalog server speaking the wire protocol.
///
/// Seeded with author `a1` (Herbert) and book `b1` (Dune), author `a2`
/// (Austen) and book `b2` (Emma), user `paul` / `spice` whose token is
/// `tok-u1`, and user `jessica` / `bene` whose token is `tok-u2`.
pub(crate) struct FakeLibrary {
  state: Mutex<LibraryState>,
}

impl FakeLibrary {
  pub fn seeded() -> Arc<Self> {
    let state = LibraryState {
      authors: vec![
        ("a1".into(), "Herbert".into()),
        ("a2".into(), "Austen".into()),
      ],
      books: vec![
        FakeBook {
          id: "b1".into(),
          title: "Dune".into(),
          author_id: "a1".into(),
          is_booked: false,
        },
        FakeBook {
          id: "b2".into(),
          title: "Emma".into(),
          author_id: "a2".into(),
          is_booked: false,
        },
      ],
      users: vec![
        FakeUser {
          id: "u1".into(),
          username: "paul".into(),
          password: "spice".into(),
          token: "tok-u1".into(),
          books: Vec::new(),
        },
        FakeUser {
          id: "u2".into(),
          username: "jessica".into(),
          password: "bene".into(),
          token: "tok-u2".into(),
          books: Vec::new(),
        },
      ],
      next_id: 100,
    };
    Arc::new(Self {
      state: Mutex::new(state),
    })
  }

  /// Scripted transport backed by this server.
  pub fn transport(self: &Arc<Self>) -> Arc<ScriptedTransport> {
    Arc::new(self.scripted())
  }

  /// Like [`transport`](Self::transport), answering each request after
  /// `delay`. The request's headers are the ones it was sent with.
  pub fn slow_transport(self: &Arc<Self>, delay: Duration) -> Arc<ScriptedTransport> {
    Arc::new(self.scripted().with_delay(delay))
  }

  fn scripted(self: &Arc<Self>) -> ScriptedTransport {
    let server = Arc::clone(self);
    ScriptedTransport::new(move |request| Ok(server.handle(request)))
  }

  /// Mark a book as borrowed behind the client's back.
  pub fn set_booked(&self, book_id: &str, booked: bool) {
    let mut state = self.state.lock().unwrap();
    if let Some(book) = state.books.iter_mut().find(|b| b.id == book_id) {
      book.is_booked = booked;
    }
  }

  pub fn book_exists(&self, book_id: &str) -> bool {
    self.state.lock().unwrap().books.iter().any(|b| b.id == book_id)
  }

  fn handle(&self, request: &OperationRequest) -> Value {
    let mut state = self.state.lock().unwrap();
    let var = |name: &str| {
      request
        .variables
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
    };
    let viewer = request
      .header(AUTH_HEADER)
      .and_then(|token| state.users.iter().position(|u| u.token == token));

    let data = match request.operation_name.as_str() {
      "GetBooks" => json!({"books": state.books.iter().map(|b| state.book_json(b)).collect::<Vec<_>>()}),
      "GetBook" => json!({"book": state.find_book(&var("bookId")).map(|b| state.book_json(b))}),
      "GetAuthors" => json!({
        "authors": state.authors.iter().map(|(id, _)| state.author_json(id)).collect::<Vec<_>>()
      }),
      "GetAuthor" => json!({"author": state.author_json(&var("authorId"))}),
      "CurrentUser" => json!({"me": viewer.map(|i| state.user_json(&state.users[i]))}),
      "LogIn" => {
        let user = state
          .users
          .iter()
          .find(|u| u.username == var("username") && u.password == var("password"));
        json!({"login": user.map(auth_json)})
      }
      "SignUp" => {
        if state.users.iter().any(|u| u.username == var("username")) {
          return json!({
            "data": null,
            "errors": [{"message": "Username already taken", "path": ["signup"]}]
          });
        }
        let id = state.fresh_id("u");
        let user = FakeUser {
          token: format!("tok-{}", id),
          id,
          username: var("username"),
          password: var("password"),
          books: Vec::new(),
        };
        let payload = auth_json(&user);
        state.users.push(user);
        json!({"signup": payload})
      }
      "BorrowBook" | "ReturnBook" | "CreateBook" | "DeleteBook" if viewer.is_none() => {
        return json!({
          "data": null,
          "errors": [{"message": "Not authenticated", "extensions": {"code": "UNAUTHENTICATED"}}]
        });
      }
      "BorrowBook" => {
        let ids: Vec<String> = request
          .variables
          .get("bookIds")
          .and_then(Value::as_array)
          .map(|ids| {
            ids
              .iter()
              .filter_map(Value::as_str)
              .map(String::from)
              .collect()
          })
          .unwrap_or_default();
        let available = ids
          .iter()
          .all(|id| state.find_book(id).map_or(false, |b| !b.is_booked));
        if !available {
          json!({"borrowBooks": {
            "success": false,
            "message": "Book is already checked out",
            "books": ids.iter().filter_map(|id| state.find_book(id)).map(|b| state.book_json(b)).collect::<Vec<_>>()
          }})
        } else {
          let user = viewer.unwrap_or_default();
          for id in &ids {
            if let Some(book) = state.books.iter_mut().find(|b| &b.id == id) {
              book.is_booked = true;
            }
            state.users[user].books.push(id.clone());
          }
          json!({"borrowBooks": {
            "success": true,
            "message": "Books checked out",
            "books": ids.iter().filter_map(|id| state.find_book(id)).map(|b| state.book_json(b)).collect::<Vec<_>>()
          }})
        }
      }
      "ReturnBook" => {
        let id = var("bookId");
        let user = viewer.unwrap_or_default();
        if !state.users[user].books.contains(&id) {
          json!({"returnBook": {"success": false, "message": "Book was not borrowed", "books": []}})
        } else {
          state.users[user].books.retain(|b| b != &id);
          if let Some(book) = state.books.iter_mut().find(|b| b.id == id) {
            book.is_booked = false;
          }
          json!({"returnBook": {
            "success": true,
            "message": "Book returned",
            "books": state.find_book(&id).map(|b| state.book_json(b)).into_iter().collect::<Vec<_>>()
          }})
        }
      }
      "CreateBook" => {
        let author_id = var("authorId");
        if !state.authors.iter().any(|(id, _)| id == &author_id) {
          json!({"createBook": null})
        } else {
          let book = FakeBook {
            id: state.fresh_id("b"),
            title: var("title"),
            author_id,
            is_booked: false,
          };
          let payload = state.book_json(&book);
          state.books.push(book);
          json!({"createBook": payload})
        }
      }
      "DeleteBook" => {
        let id = var("bookId");
        match state.books.iter().position(|b| b.id == id) {
          Some(index) if state.books[index].is_booked => json!({"deleteBook": {
            "success": false, "message": "Book is checked out", "_id": id
          }}),
          Some(index) => {
            state.books.remove(index);
            json!({"deleteBook": {"success": true, "message": "Book deleted", "_id": id}})
          }
          None => json!({"deleteBook": {"success": false, "message": "No such book", "_id": id}}),
        }
      }
      other => {
        return json!({
          "errors": [{"message": format!("Unknown operation {}", other)}]
        });
      }
    };
    json!({ "data": data })
  }
}

impl LibraryState {
  fn fresh_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{}{}", prefix, self.next_id)
  }

  fn find_book(&self, id: &str) -> Option<&FakeBook> {
    self.books.iter().find(|b| b.id == id)
  }

  fn author_name(&self, id: &str) -> Option<&str> {
    self
      .authors
      .iter()
      .find(|(author, _)| author == id)
      .map(|(_, name)| name.as_str())
  }

  fn book_json(&self, book: &FakeBook) -> Value {
    json!({
      "_id": book.id,
      "title": book.title,
      "isBooked": book.is_booked,
      "author": {"_id": book.author_id, "name": self.author_name(&book.author_id)},
    })
  }

  fn author_json(&self, id: &str) -> Value {
    match self.author_name(id) {
      Some(name) => json!({
        "_id": id,
        "name": name,
        "books": self
          .books
          .iter()
          .filter(|b| b.author_id == id)
          .map(|b| json!({"_id": b.id, "title": b.title}))
          .collect::<Vec<_>>(),
      }),
      None => Value::Null,
    }
  }

  fn user_json(&self, user: &FakeUser) -> Value {
    json!({
      "_id": user.id,
      "username": user.username,
      "books": user
        .books
        .iter()
        .filter_map(|id| self.find_book(id))
        .map(|b| json!({"_id": b.id, "title": b.title}))
        .collect::<Vec<_>>(),
    })
  }
}

fn auth_json(user: &FakeUser) -> Value {
  json!({
    "_id": user.id,
    "username": user.username,
    "token": user.token,
    "loggedIn": true,
  })
}
