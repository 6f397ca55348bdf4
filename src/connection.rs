//! Host database connections with a stable identity.

use duckdb::{Config, Connection, Transaction};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one host connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A DuckDB connection owned by the host, shared with the bridge by reference.
pub struct HostConnection {
    id: ConnectionId,
    conn: Mutex<Connection>,
}

impl HostConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(path, Config::default())?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    /// A second connection to the same database, with its own identity.
    pub fn try_clone(&self) -> Result<Self> {
        let conn = self.conn.lock().try_clone()?;
        Ok(Self::new(conn))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run `f` against the connection outside any explicit transaction.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction, committing only if it succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Execute a batch of statements; convenience for hosts and tests.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with(|conn| Ok(conn.execute_batch(sql)?))
    }
}

impl fmt::Debug for HostConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConnection").field("id", &self.id).finish()
    }
}
