//! Operation documents for the catalog server.
//!
//! Every view reads through one of these shapes; the reconciliations in
//! [`super::reconcile`] read and patch the same shapes.

use crate::document::{Arg, Field, Operation, Selection};
use crate::session::IS_AUTHENTICATED;

/// Fields every book view needs.
pub fn book_data() -> Selection {
  Selection::new(
    "Book",
    [
      Field::scalar("_id"),
      Field::scalar("title"),
      Field::object(
        "author",
        Selection::new("Author", [Field::scalar("_id"), Field::scalar("name")]),
      ),
    ],
  )
}

fn book_summary() -> Selection {
  Selection::new("Book", [Field::scalar("_id"), Field::scalar("title")])
}

fn book_status() -> Selection {
  book_data().with(Field::scalar("isBooked"))
}

pub fn get_books() -> Operation {
  Operation::query("GetBooks", [Field::object("books", book_data())])
}

pub fn get_book() -> Operation {
  Operation::query(
    "GetBook",
    [Field::object("book", book_status()).arg("_id", Arg::Var("bookId"))],
  )
  .variable("bookId", "ID!")
}

pub fn get_authors() -> Operation {
  Operation::query(
    "GetAuthors",
    [Field::object(
      "authors",
      Selection::new("Author", [Field::scalar("_id"), Field::scalar("name")]),
    )],
  )
}

pub fn get_author() -> Operation {
  Operation::query(
    "GetAuthor",
    [Field::object(
      "author",
      Selection::new(
        "Author",
        [
          Field::scalar("_id"),
          Field::scalar("name"),
          Field::object("books", book_summary()),
        ],
      ),
    )
    .arg("_id", Arg::Var("authorId"))],
  )
  .variable("authorId", "ID!")
}

/// The session user with their borrowed books. Doubles as the startup
/// token check.
pub fn current_user() -> Operation {
  Operation::query(
    "CurrentUser",
    [Field::object(
      "me",
      Selection::new(
        "User",
        [
          Field::scalar("_id"),
          Field::scalar("username"),
          Field::object("books", book_summary()),
        ],
      ),
    )],
  )
}

/// Identity half of [`current_user`], written on login.
pub fn me_identity() -> Operation {
  Operation::query(
    "Me",
    [Field::object(
      "me",
      Selection::new("User", [Field::scalar("_id"), Field::scalar("username")]),
    )],
  )
}

/// Client-only: answered from the token slot, never sent.
pub fn is_authenticated() -> Operation {
  Operation::query("IsAuthenticated", [Field::local(IS_AUTHENTICATED)])
}

fn credentials(name: &'static str, field: &'static str) -> Operation {
  Operation::mutation(
    name,
    [Field::object(
      field,
      Selection::new(
        "User",
        [
          Field::scalar("_id"),
          Field::scalar("username"),
          Field::scalar("token"),
          Field::scalar("loggedIn"),
        ],
      ),
    )
    .arg("username", Arg::Var("username"))
    .arg("password", Arg::Var("password"))],
  )
  .variable("username", "String!")
  .variable("password", "String!")
}

pub fn login() -> Operation {
  credentials("LogIn", "login")
}

pub fn signup() -> Operation {
  credentials("SignUp", "signup")
}

fn book_update() -> Selection {
  Selection::new(
    "BookUpdateResponse",
    [
      Field::scalar("success"),
      Field::scalar("message"),
      Field::object("books", book_status()),
    ],
  )
}

pub fn borrow_book() -> Operation {
  Operation::mutation(
    "BorrowBook",
    [Field::object("borrowBooks", book_update())
      .arg("bookIds", Arg::Var("bookIds"))],
  )
  .variable("bookIds", "[ID]!")
}

pub fn return_book() -> Operation {
  Operation::mutation(
    "ReturnBook",
    [Field::object("returnBook", book_update())
      .arg("bookId", Arg::Var("bookId"))],
  )
  .variable("bookId", "ID!")
}

pub fn create_book() -> Operation {
  Operation::mutation(
    "CreateBook",
    [Field::object("createBook", book_data())
      .arg("title", Arg::Var("title"))
      .arg("authorId", Arg::Var("authorId"))],
  )
  .variable("title", "String!")
  .variable("authorId", "ID!")
}

pub fn delete_book() -> Operation {
  Operation::mutation(
    "DeleteBook",
    [Field::object(
      "deleteBook",
      Selection::new(
        "DeleteBookResponse",
        [
          Field::scalar("success"),
          Field::scalar("message"),
          Field::scalar("_id"),
        ],
      ),
    )
    .arg("_id", Arg::Var("bookId"))],
  )
  .variable("bookId", "ID!")
}
