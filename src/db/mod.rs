//! SQLite persistence for grievances and budgets
//!
//! ## Architecture
//!
//! - One connection behind a mutex; every mutation runs inside a single
//!   SQLite transaction, which makes writes to a grievance linearizable
//! - Busy/locked errors are retried a bounded number of times before
//!   surfacing as `StoreUnavailable`
//!
//! ## Tables
//!
//! - `grievances` - Grievance rows with denormalized upvote count and budget totals
//! - `grievance_upvotes` - (grievance, user) pairs, the upvote ledger
//! - `grievance_transitions` - Status change audit trail
//! - `budget_entries` / `budget_expenses` - Per-grievance budgets
//! - `system_budgets` / `category_budgets` - Fiscal year roll-ups

pub mod budget;
pub mod grievances;
pub mod models;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info, warn};

use crate::error::GrievanceError;

/// Default number of retries for busy/locked writes
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// SQLite database for grievances and budgets
pub struct GrievanceDb {
    conn: Mutex<Connection>,
    write_retries: u32,
}

impl GrievanceDb {
    /// Open or create the database under `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, GrievanceError> {
        let db_path = storage_dir.join("grievances.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| GrievanceError::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| GrievanceError::Database(format!("Failed to set PRAGMA: {}", e)))?;
        conn.busy_timeout(Duration::from_millis(250))
            .map_err(|e| GrievanceError::Database(format!("Failed to set busy timeout: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, GrievanceError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(|e| {
            GrievanceError::Database(format!("Failed to open in-memory SQLite: {}", e))
        })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| GrievanceError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, GrievanceError> {
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            write_retries: DEFAULT_WRITE_RETRIES,
        })
    }

    /// Override the number of retries for busy/locked writes
    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    /// Run a read against the shared connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, GrievanceError>
    where
        F: FnOnce(&Connection) -> Result<T, GrievanceError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| GrievanceError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside one transaction, committing only if it returns `Ok`.
    ///
    /// `f` may run more than once when the store reports busy/locked, so it
    /// must not have side effects outside the transaction. Blocks the calling
    /// thread while waiting on the connection and between retries; async
    /// callers go through `spawn_blocking`.
    pub fn write<F, T>(&self, mut f: F) -> Result<T, GrievanceError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, GrievanceError>,
    {
        let mut attempt = 0;
        loop {
            match self.try_write(&mut f) {
                Err(GrievanceError::StoreUnavailable(msg)) if attempt < self.write_retries => {
                    attempt += 1;
                    warn!(attempt, error = %msg, "Store busy, retrying write");
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    fn try_write<F, T>(&self, f: &mut F) -> Result<T, GrievanceError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, GrievanceError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| GrievanceError::Internal(format!("Lock poisoned: {}", e)))?;

        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, GrievanceError> {
        self.with_conn(|conn| {
            let grievance_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM grievances", [], |row| row.get(0))?;
            let upvote_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM grievance_upvotes", [], |row| row.get(0))?;
            let expense_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM budget_expenses", [], |row| row.get(0))?;

            Ok(DbStats {
                grievance_count: grievance_count as u64,
                upvote_count: upvote_count as u64,
                expense_count: expense_count as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    pub grievance_count: u64,
    pub upvote_count: u64,
    pub expense_count: u64,
}

pub use models::{
    BudgetEntry, Category, CategoryAggregate, Expense, Grievance, Priority, Role, Status,
    SystemBudget, TransitionRecord,
};
