//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::GrievanceError;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), GrievanceError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(GrievanceError::Database(format!(
            "schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, GrievanceError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| GrievanceError::Database(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), GrievanceError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| GrievanceError::Database(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| GrievanceError::Database(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), GrievanceError> {
    conn.execute_batch(GRIEVANCES_SCHEMA)
        .map_err(|e| GrievanceError::Database(format!("Failed to create grievance tables: {}", e)))?;

    conn.execute_batch(BUDGET_SCHEMA)
        .map_err(|e| GrievanceError::Database(format!("Failed to create budget tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| GrievanceError::Database(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

const GRIEVANCES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS grievances (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    priority TEXT NOT NULL DEFAULT 'medium',
    submitted_by TEXT NOT NULL,
    assigned_to TEXT,
    upvotes INTEGER NOT NULL DEFAULT 0 CHECK (upvotes >= 0),
    budget_allocated REAL NOT NULL DEFAULT 0,
    budget_spent REAL NOT NULL DEFAULT 0,
    proof_of_work TEXT,
    status_reason TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    resolved_at TEXT
);

-- One row per (grievance, user); the primary key is the duplicate guard
CREATE TABLE IF NOT EXISTS grievance_upvotes (
    grievance_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (grievance_id, user_id),
    FOREIGN KEY (grievance_id) REFERENCES grievances(id)
);

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS grievance_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    grievance_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_role TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    reason TEXT,
    proof TEXT,
    at TEXT NOT NULL,
    FOREIGN KEY (grievance_id) REFERENCES grievances(id)
);
"#;

const BUDGET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS budget_entries (
    grievance_id TEXT PRIMARY KEY NOT NULL,
    category TEXT NOT NULL,
    fiscal_year TEXT NOT NULL,
    allocated REAL NOT NULL DEFAULT 0,
    spent REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (grievance_id) REFERENCES grievances(id)
);

CREATE TABLE IF NOT EXISTS budget_expenses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    grievance_id TEXT NOT NULL,
    amount REAL NOT NULL CHECK (amount > 0),
    description TEXT NOT NULL,
    recorded_by TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    FOREIGN KEY (grievance_id) REFERENCES budget_entries(grievance_id)
);

CREATE TABLE IF NOT EXISTS system_budgets (
    fiscal_year TEXT PRIMARY KEY NOT NULL,
    total_allocated REAL NOT NULL,
    salary_allocated REAL NOT NULL DEFAULT 0,
    salary_spent REAL NOT NULL DEFAULT 0,
    operational_allocated REAL NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Roll-up maintained in the same transaction as every budget write
CREATE TABLE IF NOT EXISTS category_budgets (
    fiscal_year TEXT NOT NULL,
    category TEXT NOT NULL,
    allocated REAL NOT NULL DEFAULT 0,
    spent REAL NOT NULL DEFAULT 0,
    grievance_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (fiscal_year, category)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_grievances_status ON grievances(status);
CREATE INDEX IF NOT EXISTS idx_grievances_created ON grievances(created_at);
CREATE INDEX IF NOT EXISTS idx_transitions_grievance ON grievance_transitions(grievance_id);
CREATE INDEX IF NOT EXISTS idx_expenses_grievance ON budget_expenses(grievance_id);
CREATE INDEX IF NOT EXISTS idx_expenses_recorded ON budget_expenses(recorded_at);
CREATE INDEX IF NOT EXISTS idx_budget_entries_year ON budget_entries(fiscal_year, category);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();

        let err = init_schema(&conn).unwrap_err();
        assert!(matches!(err, GrievanceError::Database(msg) if msg.contains("newer than supported")));
    }
}
