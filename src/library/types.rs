use serde::{Deserialize, Serialize};

use crate::mutation::{rejection_message, Outcome};

/// Author as embedded in a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSummary {
  #[serde(rename = "_id")]
  pub id: String,
  pub name: String,
}

/// Book as listed under an author or a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
  #[serde(rename = "_id")]
  pub id: String,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
  #[serde(rename = "_id")]
  pub id: String,
  pub title: String,
  /// Only present when the query asked for it (the detail view does)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub is_booked: Option<bool>,
  pub author: AuthorSummary,
}

impl Book {
  pub fn summary(&self) -> BookSummary {
    BookSummary {
      id: self.id.clone(),
      title: self.title.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
  #[serde(rename = "_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub books: Vec<BookSummary>,
}

/// The signed-in user and their borrowed books.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
  #[serde(rename = "_id")]
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub books: Vec<BookSummary>,
}

impl SessionUser {
  pub fn has_borrowed(&self, book_id: &str) -> bool {
    self.books.iter().any(|b| b.id == book_id)
  }
}

/// Result of borrowing or returning books.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookUpdatePayload {
  pub success: bool,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub books: Vec<Book>,
}

impl Outcome for BookUpdatePayload {
  fn rejection(&self) -> Option<String> {
    (!self.success).then(|| rejection_message(self.message.as_deref()))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeletePayload {
  pub success: bool,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(rename = "_id")]
  pub id: String,
}

impl Outcome for DeletePayload {
  fn rejection(&self) -> Option<String> {
    (!self.success).then(|| rejection_message(self.message.as_deref()))
  }
}

/// A created book carries no status flag; a `null` result is the refusal.
impl Outcome for Book {}

/// Credentials issued by login or signup.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
  #[serde(rename = "_id")]
  pub id: String,
  pub username: String,
  pub token: String,
  #[serde(default)]
  pub logged_in: bool,
}

impl Outcome for AuthPayload {
  fn rejection(&self) -> Option<String> {
    (self.token.is_empty() || !self.logged_in).then(|| "Invalid credentials".to_string())
  }
}

impl std::fmt::Debug for AuthPayload {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AuthPayload")
      .field("id", &self.id)
      .field("username", &self.username)
      .field("token", &"<redacted>")
      .field("logged_in", &self.logged_in)
      .finish()
  }
}
