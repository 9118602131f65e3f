//! Budget entries, expenses and fiscal-year roll-ups
//!
//! Allocations are charged to the fiscal year the entry was opened in;
//! expenses are charged to the fiscal year of their `recorded_at`. Every
//! write to `budget_entries` or `budget_expenses` must be followed by
//! [`recompute_category`] for each affected year in the same transaction so
//! `category_budgets` never lags what it summarizes.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::models::{
    format_timestamp, parse_timestamp, BudgetEntry, Category, CategoryAggregate, Expense,
    SystemBudget,
};
use crate::error::GrievanceError;

// ============================================================================
// Fiscal years
// ============================================================================

/// Fiscal year label ("2025-26") for a date; years start on April 1
pub fn fiscal_year_of(date: NaiveDate) -> String {
    let start = if date.month() >= 4 {
        date.year()
    } else {
        date.year() - 1
    };
    format!("{}-{:02}", start, (start + 1).rem_euclid(100))
}

/// Half-open `[start, end)` range covered by a fiscal year label
pub fn fiscal_year_bounds(label: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), GrievanceError> {
    let invalid = || GrievanceError::InvalidInput(format!("'{}' is not a fiscal year like 2025-26", label));

    let (first, second) = label.split_once('-').ok_or_else(invalid)?;
    if first.len() != 4 || second.len() != 2 {
        return Err(invalid());
    }
    let start: i32 = first.parse().map_err(|_| invalid())?;
    let tail: i32 = second.parse().map_err(|_| invalid())?;
    if (start + 1).rem_euclid(100) != tail {
        return Err(invalid());
    }

    let from = Utc
        .with_ymd_and_hms(start, 4, 1, 0, 0, 0)
        .single()
        .ok_or_else(invalid)?;
    let to = Utc
        .with_ymd_and_hms(start + 1, 4, 1, 0, 0, 0)
        .single()
        .ok_or_else(invalid)?;
    Ok((from, to))
}

// ============================================================================
// Budget entries
// ============================================================================

pub fn get_entry(conn: &Connection, grievance_id: &str) -> Result<Option<BudgetEntry>, GrievanceError> {
    let row = conn
        .query_row(
            "SELECT grievance_id, category, fiscal_year, allocated, spent, updated_at
             FROM budget_entries WHERE grievance_id = ?",
            params![grievance_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((grievance_id, category, fiscal_year, allocated, spent, updated_at)) = row else {
        return Ok(None);
    };

    let expenses = list_expenses(conn, &grievance_id)?;
    Ok(Some(BudgetEntry {
        category: parse_category(&category)?,
        updated_at: parse_timestamp(&updated_at)?,
        grievance_id,
        fiscal_year,
        allocated,
        spent,
        expenses,
    }))
}

/// Load the entry for a grievance, creating a zero-allocation one charged
/// to the fiscal year containing `now`
pub fn ensure_entry(
    conn: &Connection,
    grievance_id: &str,
    category: Category,
    now: DateTime<Utc>,
) -> Result<BudgetEntry, GrievanceError> {
    if let Some(entry) = get_entry(conn, grievance_id)? {
        return Ok(entry);
    }

    let fiscal_year = fiscal_year_of(now.date_naive());
    conn.execute(
        "INSERT INTO budget_entries (grievance_id, category, fiscal_year, allocated, spent, updated_at)
         VALUES (?, ?, ?, 0, 0, ?)",
        params![grievance_id, category.as_str(), fiscal_year, format_timestamp(now)],
    )?;

    Ok(BudgetEntry {
        grievance_id: grievance_id.to_string(),
        category,
        fiscal_year,
        allocated: 0.0,
        spent: 0.0,
        expenses: vec![],
        updated_at: now,
    })
}

pub fn set_allocation(
    conn: &Connection,
    grievance_id: &str,
    allocated: f64,
    now: DateTime<Utc>,
) -> Result<(), GrievanceError> {
    conn.execute(
        "UPDATE budget_entries SET allocated = ?, updated_at = ? WHERE grievance_id = ?",
        params![allocated, format_timestamp(now), grievance_id],
    )?;
    Ok(())
}

/// Append an expense and add it to the entry's spent total
pub fn insert_expense(
    conn: &Connection,
    grievance_id: &str,
    amount: f64,
    description: &str,
    recorded_by: &str,
    now: DateTime<Utc>,
) -> Result<Expense, GrievanceError> {
    conn.execute(
        "INSERT INTO budget_expenses (grievance_id, amount, description, recorded_by, recorded_at)
         VALUES (?, ?, ?, ?, ?)",
        params![grievance_id, amount, description, recorded_by, format_timestamp(now)],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE budget_entries SET spent = spent + ?, updated_at = ? WHERE grievance_id = ?",
        params![amount, format_timestamp(now), grievance_id],
    )?;

    Ok(Expense {
        id,
        grievance_id: grievance_id.to_string(),
        amount,
        description: description.to_string(),
        recorded_by: recorded_by.to_string(),
        recorded_at: now,
    })
}

pub fn list_expenses(conn: &Connection, grievance_id: &str) -> Result<Vec<Expense>, GrievanceError> {
    let mut stmt = conn.prepare(
        "SELECT id, grievance_id, amount, description, recorded_by, recorded_at
         FROM budget_expenses WHERE grievance_id = ? ORDER BY id",
    )?;
    let raw = stmt
        .query_map(params![grievance_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, grievance_id, amount, description, recorded_by, recorded_at)| {
            Ok(Expense {
                id,
                grievance_id,
                amount,
                description,
                recorded_by,
                recorded_at: parse_timestamp(&recorded_at)?,
            })
        })
        .collect()
}

// ============================================================================
// Category roll-up
// ============================================================================

/// Rebuild one `category_budgets` row: allocations of entries opened in
/// `fiscal_year`, plus expenses recorded inside its date range
pub fn recompute_category(
    conn: &Connection,
    fiscal_year: &str,
    category: Category,
) -> Result<(), GrievanceError> {
    let (from, to) = fiscal_year_bounds(fiscal_year)?;
    conn.execute(
        "INSERT INTO category_budgets (fiscal_year, category, allocated, spent, grievance_count)
         SELECT ?1, ?2,
            (SELECT COALESCE(SUM(allocated), 0) FROM budget_entries
             WHERE fiscal_year = ?1 AND category = ?2),
            (SELECT COALESCE(SUM(x.amount), 0)
             FROM budget_expenses x JOIN budget_entries b ON b.grievance_id = x.grievance_id
             WHERE b.category = ?2 AND x.recorded_at >= ?3 AND x.recorded_at < ?4),
            (SELECT COUNT(*) FROM budget_entries b
             WHERE b.category = ?2 AND (b.fiscal_year = ?1 OR EXISTS (
                SELECT 1 FROM budget_expenses x
                WHERE x.grievance_id = b.grievance_id
                  AND x.recorded_at >= ?3 AND x.recorded_at < ?4)))
         WHERE 1
         ON CONFLICT (fiscal_year, category) DO UPDATE SET
            allocated = excluded.allocated,
            spent = excluded.spent,
            grievance_count = excluded.grievance_count",
        params![
            fiscal_year,
            category.as_str(),
            format_timestamp(from),
            format_timestamp(to)
        ],
    )?;
    Ok(())
}

/// Category rows for a fiscal year, in category order
pub fn list_category_aggregates(
    conn: &Connection,
    fiscal_year: &str,
) -> Result<Vec<CategoryAggregate>, GrievanceError> {
    let mut stmt = conn.prepare(
        "SELECT category, allocated, spent, grievance_count
         FROM category_budgets WHERE fiscal_year = ? AND grievance_count > 0",
    )?;
    let raw = stmt
        .query_map(params![fiscal_year], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = raw
        .into_iter()
        .map(|(category, allocated, spent, grievance_count)| {
            Ok(CategoryAggregate {
                category: parse_category(&category)?,
                allocated,
                spent,
                grievance_count,
            })
        })
        .collect::<Result<Vec<_>, GrievanceError>>()?;
    rows.sort_by_key(|r| r.category);
    Ok(rows)
}

// ============================================================================
// System budget
// ============================================================================

pub fn get_system_budget(
    conn: &Connection,
    fiscal_year: &str,
) -> Result<Option<SystemBudget>, GrievanceError> {
    let row = conn
        .query_row(
            "SELECT fiscal_year, total_allocated, salary_allocated, salary_spent,
                    operational_allocated, created_by, updated_at
             FROM system_budgets WHERE fiscal_year = ?",
            params![fiscal_year],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(fiscal_year, total, salary_allocated, salary_spent, operational, created_by, updated_at)| {
            Ok(SystemBudget {
                fiscal_year,
                total_allocated: total,
                salary_allocated,
                salary_spent,
                operational_allocated: operational,
                created_by,
                updated_at: parse_timestamp(&updated_at)?,
            })
        },
    )
    .transpose()
}

/// Insert or replace the allocations of a fiscal year. Salary already spent
/// and the original creator are preserved on update.
pub fn upsert_system_budget(conn: &Connection, budget: &SystemBudget) -> Result<(), GrievanceError> {
    conn.execute(
        "INSERT INTO system_budgets (fiscal_year, total_allocated, salary_allocated, salary_spent,
            operational_allocated, created_by, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (fiscal_year) DO UPDATE SET
            total_allocated = excluded.total_allocated,
            salary_allocated = excluded.salary_allocated,
            operational_allocated = excluded.operational_allocated,
            updated_at = excluded.updated_at",
        params![
            budget.fiscal_year,
            budget.total_allocated,
            budget.salary_allocated,
            budget.salary_spent,
            budget.operational_allocated,
            budget.created_by,
            format_timestamp(budget.updated_at),
        ],
    )?;
    Ok(())
}

/// Returns false when no system budget exists for the year
pub fn add_salary_spent(
    conn: &Connection,
    fiscal_year: &str,
    amount: f64,
    now: DateTime<Utc>,
) -> Result<bool, GrievanceError> {
    let changed = conn.execute(
        "UPDATE system_budgets SET salary_spent = salary_spent + ?, updated_at = ?
         WHERE fiscal_year = ?",
        params![amount, format_timestamp(now), fiscal_year],
    )?;
    Ok(changed == 1)
}

// ============================================================================
// Reports
// ============================================================================

/// Totals across every budget entry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryTotals {
    pub allocated: f64,
    pub spent: f64,
    pub grievance_count: i64,
    pub over_budget_count: i64,
}

/// Spend grouped under a label (category or status)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendBreakdown {
    pub key: String,
    pub allocated: f64,
    pub spent: f64,
    pub grievance_count: i64,
}

pub fn entry_totals(conn: &Connection) -> Result<EntryTotals, GrievanceError> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(allocated), 0), COALESCE(SUM(spent), 0), COUNT(*),
                COALESCE(SUM(CASE WHEN spent > allocated THEN 1 ELSE 0 END), 0)
         FROM budget_entries",
        [],
        |row| {
            Ok(EntryTotals {
                allocated: row.get(0)?,
                spent: row.get(1)?,
                grievance_count: row.get(2)?,
                over_budget_count: row.get(3)?,
            })
        },
    )?)
}

/// Sum of the expenses recorded inside a fiscal year
pub fn fiscal_year_spent(conn: &Connection, fiscal_year: &str) -> Result<f64, GrievanceError> {
    let (from, to) = fiscal_year_bounds(fiscal_year)?;
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM budget_expenses
         WHERE recorded_at >= ? AND recorded_at < ?",
        params![format_timestamp(from), format_timestamp(to)],
        |row| row.get(0),
    )?)
}

pub fn spend_by_category(conn: &Connection) -> Result<Vec<SpendBreakdown>, GrievanceError> {
    breakdown(
        conn,
        "SELECT category, SUM(allocated), SUM(spent), COUNT(*)
         FROM budget_entries GROUP BY category ORDER BY category",
    )
}

pub fn spend_by_status(conn: &Connection) -> Result<Vec<SpendBreakdown>, GrievanceError> {
    breakdown(
        conn,
        "SELECT g.status, SUM(b.allocated), SUM(b.spent), COUNT(*)
         FROM budget_entries b JOIN grievances g ON g.id = b.grievance_id
         GROUP BY g.status ORDER BY g.status",
    )
}

fn breakdown(conn: &Connection, sql: &str) -> Result<Vec<SpendBreakdown>, GrievanceError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SpendBreakdown {
                key: row.get(0)?,
                allocated: row.get(1)?,
                spent: row.get(2)?,
                grievance_count: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Expense totals per calendar month ("YYYY-MM") recorded at or after `since`
pub fn monthly_spend(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<Vec<(String, f64, i64)>, GrievanceError> {
    let mut stmt = conn.prepare(
        "SELECT substr(recorded_at, 1, 7) AS month, SUM(amount), COUNT(*)
         FROM budget_expenses WHERE recorded_at >= ?
         GROUP BY month ORDER BY month",
    )?;
    let rows = stmt
        .query_map(params![format_timestamp(since)], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_category(value: &str) -> Result<Category, GrievanceError> {
    value
        .parse()
        .map_err(|e| GrievanceError::Database(format!("stored category: {}", e)))
}
