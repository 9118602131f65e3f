//! Grievance, upvote ledger and transition-trail operations
//!
//! Functions take a plain `&Connection`; callers that mutate pass the
//! transaction from [`GrievanceDb::write`](super::GrievanceDb::write), which
//! derefs to one.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::models::{
    format_timestamp, parse_timestamp, Category, Grievance, Priority, Role, Status,
    TransitionRecord,
};
use crate::error::GrievanceError;

// ============================================================================
// Row mapping
// ============================================================================

const GRIEVANCE_COLUMNS: &str = "id, title, description, category, status, priority, \
     submitted_by, assigned_to, upvotes, budget_allocated, budget_spent, proof_of_work, \
     status_reason, version, created_at, updated_at, resolved_at";

/// Raw grievance row before enum and timestamp parsing
struct GrievanceRow {
    id: String,
    title: String,
    description: String,
    category: String,
    status: String,
    priority: String,
    submitted_by: String,
    assigned_to: Option<String>,
    upvotes: i64,
    budget_allocated: f64,
    budget_spent: f64,
    proof_of_work: Option<String>,
    status_reason: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
    resolved_at: Option<String>,
}

impl GrievanceRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            category: row.get("category")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            submitted_by: row.get("submitted_by")?,
            assigned_to: row.get("assigned_to")?,
            upvotes: row.get("upvotes")?,
            budget_allocated: row.get("budget_allocated")?,
            budget_spent: row.get("budget_spent")?,
            proof_of_work: row.get("proof_of_work")?,
            status_reason: row.get("status_reason")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            resolved_at: row.get("resolved_at")?,
        })
    }

    fn into_grievance(self, upvoted_by: Vec<String>) -> Result<Grievance, GrievanceError> {
        Ok(Grievance {
            category: self.category.parse().map_err(corrupt(&self.id))?,
            status: self.status.parse().map_err(corrupt(&self.id))?,
            priority: self.priority.parse().map_err(corrupt(&self.id))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            title: self.title,
            description: self.description,
            submitted_by: self.submitted_by,
            assigned_to: self.assigned_to,
            upvotes: self.upvotes,
            upvoted_by,
            budget_allocated: self.budget_allocated,
            budget_spent: self.budget_spent,
            proof_of_work: self.proof_of_work,
            status_reason: self.status_reason,
            version: self.version,
        })
    }
}

/// Stored enum text that no longer parses is a store fault, not bad input
fn corrupt(id: &str) -> impl Fn(GrievanceError) -> GrievanceError + '_ {
    move |e| GrievanceError::Database(format!("grievance {}: {}", id, e))
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get a grievance with its upvoter set
pub fn get_grievance(conn: &Connection, id: &str) -> Result<Option<Grievance>, GrievanceError> {
    let sql = format!("SELECT {} FROM grievances WHERE id = ?", GRIEVANCE_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], GrievanceRow::from_row)
        .optional()?;

    match row {
        Some(row) => {
            let upvoted_by = list_upvoters(conn, id)?;
            Ok(Some(row.into_grievance(upvoted_by)?))
        }
        None => Ok(None),
    }
}

/// Get a grievance or fail with `NotFound`
pub fn require_grievance(conn: &Connection, id: &str) -> Result<Grievance, GrievanceError> {
    get_grievance(conn, id)?.ok_or_else(|| GrievanceError::NotFound(format!("grievance {}", id)))
}

/// Sort order for the public listing; ties break on `created_at`, then id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrder {
    Oldest,
    MostUpvoted,
    MostUrgent,
}

/// Filter and page for [`list_public`]
#[derive(Debug, Clone)]
pub struct PublicListing {
    /// Latest `created_at` that still counts as past the deadline (inclusive)
    pub created_before: DateTime<Utc>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub order: ListingOrder,
    pub limit: u32,
    pub offset: u64,
}

/// One page of publicly visible grievances and the total number of matches
///
/// Upvoter sets are loaded only for the rows on the page.
pub fn list_public(
    conn: &Connection,
    listing: &PublicListing,
) -> Result<(Vec<Grievance>, u64), GrievanceError> {
    let hidden: Vec<&str> = Status::ALL
        .iter()
        .filter(|s| s.hides_from_public())
        .map(|s| s.as_str())
        .collect();

    let mut clauses = vec![
        format!("status NOT IN ({})", vec!["?"; hidden.len()].join(", ")),
        "created_at <= ?".to_string(),
    ];
    let mut args: Vec<Value> = hidden.iter().map(|s| Value::Text(s.to_string())).collect();
    args.push(Value::Text(format_timestamp(listing.created_before)));
    if let Some(category) = listing.category {
        clauses.push("category = ?".to_string());
        args.push(Value::Text(category.as_str().to_string()));
    }
    if let Some(priority) = listing.priority {
        clauses.push("priority = ?".to_string());
        args.push(Value::Text(priority.as_str().to_string()));
    }
    let filter = clauses.join(" AND ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM grievances WHERE {}", filter),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let order = match listing.order {
        ListingOrder::Oldest => String::new(),
        ListingOrder::MostUpvoted => "upvotes DESC, ".to_string(),
        ListingOrder::MostUrgent => format!("{} DESC, ", priority_rank()),
    };
    let sql = format!(
        "SELECT {} FROM grievances WHERE {} ORDER BY {}created_at, id LIMIT ? OFFSET ?",
        GRIEVANCE_COLUMNS, filter, order
    );
    args.push(Value::Integer(i64::from(listing.limit)));
    args.push(Value::Integer(i64::try_from(listing.offset).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), GrievanceRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let page = rows
        .into_iter()
        .map(|row| {
            let upvoted_by = list_upvoters(conn, &row.id)?;
            row.into_grievance(upvoted_by)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((page, total.max(0) as u64))
}

/// `CASE` expression ranking the stored priority text by urgency
fn priority_rank() -> String {
    let arms: Vec<String> = Priority::ALL
        .iter()
        .enumerate()
        .map(|(rank, p)| format!("WHEN '{}' THEN {}", p.as_str(), rank))
        .collect();
    format!("CASE priority {} ELSE -1 END", arms.join(" "))
}

/// Ids of grievances resolved at or before `cutoff`
pub fn list_resolved_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>, GrievanceError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM grievances
         WHERE status = ? AND resolved_at IS NOT NULL AND resolved_at <= ?
         ORDER BY resolved_at, id",
    )?;
    let ids = stmt
        .query_map(
            params![Status::Resolved.as_str(), format_timestamp(cutoff)],
            |row| row.get(0),
        )?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Users who upvoted a grievance, in upvote order
pub fn list_upvoters(conn: &Connection, grievance_id: &str) -> Result<Vec<String>, GrievanceError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM grievance_upvotes WHERE grievance_id = ? ORDER BY created_at, user_id",
    )?;
    let users = stmt
        .query_map(params![grievance_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(users)
}

pub fn count_upvotes(conn: &Connection, grievance_id: &str) -> Result<i64, GrievanceError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM grievance_upvotes WHERE grievance_id = ?",
        params![grievance_id],
        |row| row.get(0),
    )?)
}

/// Audit trail for a grievance, oldest first
pub fn list_transitions(
    conn: &Connection,
    grievance_id: &str,
) -> Result<Vec<TransitionRecord>, GrievanceError> {
    let mut stmt = conn.prepare(
        "SELECT id, grievance_id, actor_id, actor_role, from_status, to_status, reason, proof, at
         FROM grievance_transitions WHERE grievance_id = ? ORDER BY id",
    )?;

    let raw = stmt
        .query_map(params![grievance_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, grievance_id, actor_id, role, from, to, reason, proof, at)| {
            Ok(TransitionRecord {
                id,
                actor_role: role.parse::<Role>().map_err(corrupt(&grievance_id))?,
                from_status: from.parse().map_err(corrupt(&grievance_id))?,
                to_status: to.parse().map_err(corrupt(&grievance_id))?,
                at: parse_timestamp(&at)?,
                grievance_id,
                actor_id,
                reason,
                proof,
            })
        })
        .collect()
}

// ============================================================================
// Write Operations
// ============================================================================

pub fn insert_grievance(conn: &Connection, g: &Grievance) -> Result<(), GrievanceError> {
    conn.execute(
        "INSERT INTO grievances (id, title, description, category, status, priority,
            submitted_by, assigned_to, upvotes, budget_allocated, budget_spent,
            proof_of_work, status_reason, version, created_at, updated_at, resolved_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            g.id,
            g.title,
            g.description,
            g.category.as_str(),
            g.status.as_str(),
            g.priority.as_str(),
            g.submitted_by,
            g.assigned_to,
            g.upvotes,
            g.budget_allocated,
            g.budget_spent,
            g.proof_of_work,
            g.status_reason,
            g.version,
            format_timestamp(g.created_at),
            format_timestamp(g.updated_at),
            g.resolved_at.map(format_timestamp),
        ],
    )?;
    Ok(())
}

/// Persist the mutable fields of `g` if the stored version still equals
/// `g.version`, then bump the version. Returns the new version.
pub fn update_grievance(conn: &Connection, g: &Grievance) -> Result<i64, GrievanceError> {
    let changed = conn.execute(
        "UPDATE grievances SET
            status = ?, priority = ?, assigned_to = ?, upvotes = ?,
            budget_allocated = ?, budget_spent = ?, proof_of_work = ?, status_reason = ?,
            updated_at = ?, resolved_at = ?, version = version + 1
         WHERE id = ? AND version = ?",
        params![
            g.status.as_str(),
            g.priority.as_str(),
            g.assigned_to,
            g.upvotes,
            g.budget_allocated,
            g.budget_spent,
            g.proof_of_work,
            g.status_reason,
            format_timestamp(g.updated_at),
            g.resolved_at.map(format_timestamp),
            g.id,
            g.version,
        ],
    )?;

    if changed == 0 {
        let actual: Option<i64> = conn
            .query_row(
                "SELECT version FROM grievances WHERE id = ?",
                params![g.id],
                |row| row.get(0),
            )
            .optional()?;
        return match actual {
            Some(actual) => Err(GrievanceError::Conflict {
                expected: g.version,
                actual,
            }),
            None => Err(GrievanceError::NotFound(format!("grievance {}", g.id))),
        };
    }

    Ok(g.version + 1)
}

/// Add `user_id` to the ledger. Returns false when the pair already exists.
pub fn insert_upvote(
    conn: &Connection,
    grievance_id: &str,
    user_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, GrievanceError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO grievance_upvotes (grievance_id, user_id, created_at)
         VALUES (?, ?, ?)",
        params![grievance_id, user_id, format_timestamp(at)],
    )?;
    Ok(inserted == 1)
}

#[allow(clippy::too_many_arguments)]
pub fn append_transition(
    conn: &Connection,
    grievance_id: &str,
    actor_id: &str,
    actor_role: Role,
    from: Status,
    to: Status,
    reason: Option<&str>,
    proof: Option<&str>,
    at: DateTime<Utc>,
) -> Result<i64, GrievanceError> {
    conn.execute(
        "INSERT INTO grievance_transitions
            (grievance_id, actor_id, actor_role, from_status, to_status, reason, proof, at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            grievance_id,
            actor_id,
            actor_role.as_str(),
            from.as_str(),
            to.as_str(),
            reason,
            proof,
            format_timestamp(at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
