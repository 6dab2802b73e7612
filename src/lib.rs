//! Client for a library-book catalog, built around a normalized cache.
//!
//! Every view reads through the [`query::QueryExecutor`], every write goes
//! through the [`mutation::MutationExecutor`], and both share one
//! [`cache::CacheHandle`] per session. [`library::LibraryClient`] wires them
//! to the catalog's documents and reconciliations.

pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod library;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
