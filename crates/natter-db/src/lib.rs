pub mod conversations;
pub mod error;
pub mod groups;
pub mod ids;
pub mod media;
pub mod messages;
pub mod migrations;
pub mod reactions;
pub mod status;
pub mod users;

#[cfg(test)]
mod test_support;

use anyhow::{Context, anyhow};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

pub use error::{StoreError, StoreResult};
pub use ids::{IdGenerator, IdKind, IdScheme};

/// Handle to the chat store. Every public operation either reads through
/// [`Database::with_conn`] or mutates through [`Database::with_tx`].
pub struct Database {
    conn: Mutex<Connection>,
    ids: IdGenerator,
}

impl Database {
    pub fn open(path: &Path, ids: IdGenerator) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database at {}", path.display()))?;

        // WAL mode for concurrent readers in other processes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::init(conn, ids)?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory(ids: IdGenerator) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self::init(conn, ids)?;

        debug!("In-memory database opened");
        Ok(db)
    }

    fn init(conn: Connection, ids: IdGenerator) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            ids,
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction. Commits on `Ok`; any error
    /// drops the transaction, which rolls it back.
    pub(crate) fn with_tx<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transaction")?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().context("commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                Err(e)
            }
        }
    }

    /// Draw a fresh identifier for `kind`, checked against `conn`.
    pub(crate) fn next_id(&self, conn: &Connection, kind: IdKind) -> StoreResult<String> {
        self.ids.generate(conn, kind)
    }
}

pub(crate) fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
