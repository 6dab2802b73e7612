//! Session gate: authentication state derived from the credential token.
//!
//! The token is the only state that outlives a cache reset. It lives in a
//! durable key-value slot ([`SqliteTokenStore`]) and drives the local
//! `isAuthenticated` field and route gating.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{CacheHandle, LocalSchema};
use crate::document::{Operation, Variables};
use crate::error::OperationError;
use crate::query::{FetchPolicy, QueryExecutor};

/// Local field reporting whether a credential token is present.
pub const IS_AUTHENTICATED: &str = "isAuthenticated";

/// Name of the durable slot holding the token.
pub const TOKEN_SLOT: &str = "token";

/// Durable storage for the credential token.
pub trait TokenStore: Send + Sync {
  fn load(&self) -> Result<Option<String>>;

  fn save(&self, token: &str) -> Result<()>;

  fn clear(&self) -> Result<()>;
}

/// Token store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
  token: Mutex<Option<String>>,
}

impl TokenStore for MemoryTokenStore {
  fn load(&self) -> Result<Option<String>> {
    let token = self
      .token
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(token.clone())
  }

  fn save(&self, token: &str) -> Result<()> {
    let mut slot = self
      .token
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *slot = Some(token.to_string());
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let mut slot = self
      .token
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *slot = None;
    Ok(())
  }
}

/// SQLite-backed key-value slot for the token.
pub struct SqliteTokenStore {
  conn: Mutex<Connection>,
}

impl SqliteTokenStore {
  /// Open the token store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the token store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open session database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shelf").join("session.db"))
  }

  /// When the current token was stored.
  pub fn stored_at(&self) -> Result<Option<DateTime<Utc>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let stored_at: Option<String> = conn
      .query_row(
        "SELECT stored_at FROM kv WHERE name = ?",
        params![TOKEN_SLOT],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read token timestamp: {}", e))?;

    stored_at.as_deref().map(parse_datetime).transpose()
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SESSION_SCHEMA)
      .map_err(|e| eyre!("Failed to run session migrations: {}", e))?;

    Ok(())
  }
}

const SESSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl TokenStore for SqliteTokenStore {
  fn load(&self) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM kv WHERE name = ?",
        params![TOKEN_SLOT],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read token: {}", e))
  }

  fn save(&self, token: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (name, value, stored_at) VALUES (?, ?, datetime('now'))",
        params![TOKEN_SLOT, token],
      )
      .map_err(|e| eyre!("Failed to store token: {}", e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv WHERE name = ?", params![TOKEN_SLOT])
      .map_err(|e| eyre!("Failed to clear token: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Anonymous,
  Authenticated,
}

/// Something that may only be shown to an authenticated session.
pub trait Gated {
  fn is_protected(&self) -> bool;
}

/// Derives session state from the token slot and guards protected views.
#[derive(Clone)]
pub struct SessionGate {
  tokens: Arc<dyn TokenStore>,
}

impl SessionGate {
  pub fn new(tokens: Arc<dyn TokenStore>) -> Self {
    Self { tokens }
  }

  pub fn tokens(&self) -> Arc<dyn TokenStore> {
    Arc::clone(&self.tokens)
  }

  pub fn token(&self) -> Option<String> {
    match self.tokens.load() {
      Ok(token) => token.filter(|t| !t.is_empty()),
      Err(e) => {
        warn!(error = %e, "could not read credential token");
        None
      }
    }
  }

  pub fn state(&self) -> SessionState {
    if self.token().is_some() {
      SessionState::Authenticated
    } else {
      SessionState::Anonymous
    }
  }

  pub fn is_authenticated(&self) -> bool {
    self.state() == SessionState::Authenticated
  }

  pub fn allows(&self, view: &impl Gated) -> bool {
    !view.is_protected() || self.is_authenticated()
  }

  /// Local schema exposing `isAuthenticated`, re-evaluated on every read.
  pub fn local_schema(&self) -> LocalSchema {
    let gate = self.clone();
    LocalSchema::new().field(IS_AUTHENTICATED, move || {
      Value::Bool(gate.is_authenticated())
    })
  }

  /// Record a freshly issued token.
  pub fn sign_in(&self, token: &str) -> Result<()> {
    if token.is_empty() {
      return Err(eyre!("Refusing to store an empty credential token"));
    }
    self.tokens.save(token)?;
    info!("signed in");
    Ok(())
  }

  /// Clear the token and drop every cached entity.
  ///
  /// Always a full reset: nothing cached may outlive the identity it was
  /// fetched for.
  pub fn sign_out(&self, cache: &CacheHandle) -> Result<()> {
    let cleared = self.tokens.clear();
    cache.reset();
    cleared?;
    info!("signed out");
    Ok(())
  }

  /// Re-validate a stored token at startup.
  ///
  /// Fetches `user_query` from the network. A `null`
  /// user or a server error means the token is no longer valid: it is
  /// cleared and the cache reset. A network failure keeps the token, since
  /// nothing could be learned about it.
  pub async fn restore(&self, queries: &QueryExecutor, user_query: &Operation) -> SessionState {
    if !self.is_authenticated() {
      return SessionState::Anonymous;
    }

    let valid = match queries
      .fetch_root::<Value>(user_query, Variables::new(), FetchPolicy::NetworkOnly)
      .await
    {
      Ok(Some(_)) => true,
      Ok(_) => {
        info!("stored token no longer maps to a user");
        false
      }
      Err(OperationError::Transport(e)) => {
        warn!(error = %e, "could not validate session; keeping token");
        true
      }
      Err(e) => {
        info!(error = %e, "session validation failed");
        false
      }
    };

    if valid {
      debug!("session restored");
      return SessionState::Authenticated;
    }

    if let Err(e) = self.sign_out(queries.cache()) {
      warn!(error = %e, "failed to clear invalid token");
    }
    SessionState::Anonymous
  }
}

impl std::fmt::Debug for SessionGate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionGate")
      .field("state", &self.state())
      .finish()
  }
}
