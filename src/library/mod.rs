//! The library catalog: entity types, operation documents, reconciliations,
//! routes, and the client that ties them to the cache.

mod client;
pub mod documents;
pub mod reconcile;
mod route;
mod types;

pub use client::LibraryClient;
pub use route::Route;
pub use types::{
  AuthPayload, Author, AuthorSummary, Book, BookSummary, BookUpdatePayload, DeletePayload,
  SessionUser,
};
