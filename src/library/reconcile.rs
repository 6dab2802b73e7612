//! Store patches applied after accepted catalog mutations.
//!
//! Each one reads a cached shape, edits its book list, and writes the shape
//! back; shapes that were never cached are skipped.

use serde_json::Value;
use tracing::debug;

use super::documents;
use super::types::{AuthPayload, Book, BookUpdatePayload, DeletePayload};
use crate::cache::{Cache, IdentityResolver};
use crate::document::{variables, Operation, Variables};
use crate::error::OperationError;
use crate::mutation::Reconcile;

const BOOK: &str = "Book";

/// Appends the borrowed books to the session user's list.
///
/// The `isBooked` flag needs no patch: the returned books merge into the
/// shared entities.
#[derive(Debug, Default, Clone, Copy)]
pub struct BorrowBook;

impl Reconcile<BookUpdatePayload> for BorrowBook {
  fn reconcile(&self, cache: &mut Cache, result: &BookUpdatePayload) -> Result<(), OperationError> {
    let borrowed = result
      .books
      .iter()
      .map(|book| serde_json::to_value(book.summary()))
      .collect::<Result<Vec<_>, _>>()?;
    patch_books(cache, &documents::current_user(), &Variables::new(), |books| {
      books.extend(borrowed)
    })
  }
}

/// Removes the returned book from the session user's list.
#[derive(Debug, Clone)]
pub struct ReturnBook {
  pub book_id: String,
}

impl Reconcile<BookUpdatePayload> for ReturnBook {
  fn reconcile(&self, cache: &mut Cache, _result: &BookUpdatePayload) -> Result<(), OperationError> {
    let identity = cache.store().identity();
    patch_books(cache, &documents::current_user(), &Variables::new(), |books| {
      remove_book(books, identity, &self.book_id)
    })
  }
}

/// Appends a new book to the global list and to its author's list.
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateBook;

impl Reconcile<Book> for CreateBook {
  fn reconcile(&self, cache: &mut Cache, book: &Book) -> Result<(), OperationError> {
    let listed = serde_json::to_value(book)?;
    let summary = serde_json::to_value(book.summary())?;

    let in_index = patched(patch_books(
      cache,
      &documents::get_books(),
      &Variables::new(),
      |books| books.push(listed),
    ))?;
    let in_author = patched(patch_books(
      cache,
      &documents::get_author(),
      &variables([("authorId", book.author.id.as_str())]),
      |books| books.push(summary),
    ))?;

    if in_index || in_author {
      Ok(())
    } else {
      Err(OperationError::cache_miss("book lists"))
    }
  }
}

/// Drops a deleted book from every list, then evicts the entity.
#[derive(Debug, Clone, Default)]
pub struct DeleteBook {
  /// The book's author, when known, so their cached list is filtered too
  pub author_id: Option<String>,
}

impl Reconcile<DeletePayload> for DeleteBook {
  fn reconcile(&self, cache: &mut Cache, result: &DeletePayload) -> Result<(), OperationError> {
    let identity = cache.store().identity();
    patched(patch_books(
      cache,
      &documents::get_books(),
      &Variables::new(),
      |books| remove_book(books, identity, &result.id),
    ))?;
    if let Some(author_id) = &self.author_id {
      patched(patch_books(
        cache,
        &documents::get_author(),
        &variables([("authorId", author_id.as_str())]),
        |books| remove_book(books, identity, &result.id),
      ))?;
    }

    // Anything else still pointing at it (a user's list, `book(_id)`) is
    // scrubbed by the eviction.
    let key = identity.key(BOOK, &result.id);
    cache.evict(&key);
    Ok(())
  }
}

/// Records who signed in, so views of the user's identity resolve at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct RememberUser;

impl Reconcile<AuthPayload> for RememberUser {
  fn reconcile(&self, cache: &mut Cache, result: &AuthPayload) -> Result<(), OperationError> {
    let me = serde_json::json!({
      "me": {"_id": result.id, "username": result.username}
    });
    cache.write_query(&documents::me_identity(), &Variables::new(), &me)
  }
}

/// Read `operation`, hand its book list to `patch`, and write it back.
fn patch_books(
  cache: &mut Cache,
  operation: &Operation,
  vars: &Variables,
  patch: impl FnOnce(&mut Vec<Value>),
) -> Result<(), OperationError> {
  let root = operation.root_field().map(|f| f.name).unwrap_or_default();
  let mut data = cache
    .read_query(operation, vars)
    .ok_or_else(|| OperationError::cache_miss(operation.name))?;
  let books = data
    .get_mut(root)
    .and_then(book_list)
    .ok_or_else(|| OperationError::cache_miss(operation.name))?;
  patch(books);
  cache.write_query(operation, vars, &data)
}

/// The list itself, or the `books` field of an entity.
fn book_list(value: &mut Value) -> Option<&mut Vec<Value>> {
  match value {
    Value::Array(items) => Some(items),
    Value::Object(object) => object.get_mut("books").and_then(Value::as_array_mut),
    _ => None,
  }
}

fn remove_book(books: &mut Vec<Value>, identity: IdentityResolver, book_id: &str) {
  let target = identity.key(BOOK, book_id);
  books.retain(|book| identity.identify_value(BOOK, book).as_ref() != Some(&target));
}

/// Whether the patch applied; a missing shape is not an error here.
fn patched(result: Result<(), OperationError>) -> Result<bool, OperationError> {
  match result {
    Ok(()) => Ok(true),
    Err(OperationError::CacheMiss(what)) => {
      debug!(%what, "list not cached, skipping");
      Ok(false)
    }
    Err(e) => Err(e),
  }
}
