use std::fmt;

use crate::session::Gated;

/// A page of the catalog, parsed from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  Books,
  Book(String),
  Authors,
  Author(String),
  Profile,
  Login,
  Signup,
  NotFound(String),
}

impl Route {
  pub fn parse(path: &str) -> Self {
    let segments: Vec<&str> = path
      .trim()
      .split('/')
      .filter(|s| !s.is_empty())
      .collect();

    match segments.as_slice() {
      [] | ["books"] => Route::Books,
      ["books", id] => Route::Book(id.to_string()),
      ["authors"] => Route::Authors,
      ["authors", id] => Route::Author(id.to_string()),
      ["profile"] | ["me"] => Route::Profile,
      ["login"] => Route::Login,
      ["signup"] => Route::Signup,
      _ => Route::NotFound(path.to_string()),
    }
  }

  pub fn is_protected(&self) -> bool {
    matches!(self, Route::Profile)
  }
}

impl Gated for Route {
  fn is_protected(&self) -> bool {
    Route::is_protected(self)
  }
}

impl fmt::Display for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Route::Books => write!(f, "/"),
      Route::Book(id) => write!(f, "/books/{}", id),
      Route::Authors => write!(f, "/authors"),
      Route::Author(id) => write!(f, "/authors/{}", id),
      Route::Profile => write!(f, "/profile"),
      Route::Login => write!(f, "/login"),
      Route::Signup => write!(f, "/signup"),
      Route::NotFound(path) => write!(f, "{}", path),
    }
  }
}
