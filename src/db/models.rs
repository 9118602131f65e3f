//! Domain models shared by the repository and service layers
//!
//! Enums are stored as their `as_str()` form in SQLite and serialized with
//! the same spelling over the wire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GrievanceError;

/// Format a timestamp the way every table stores it
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, GrievanceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GrievanceError::Database(format!("Bad timestamp '{}': {}", value, e)))
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = GrievanceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(GrievanceError::InvalidInput(format!(
                        "'{}' is not a valid {}",
                        other,
                        stringify!($name).to_lowercase()
                    ))),
                }
            }
        }
    };
}

// ============================================================================
// Enumerations
// ============================================================================

/// Grievance category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Infrastructure,
    Health,
    Academic,
    Administrative,
    Other,
}

string_enum!(Category {
    Infrastructure => "infrastructure",
    Health => "health",
    Academic => "academic",
    Administrative => "administrative",
    Other => "other",
});

/// Grievance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Open,
    InProgress,
    Resolved,
    Closed,
    Rejected,
    Blocked,
}

string_enum!(Status {
    Open => "open",
    InProgress => "in-progress",
    Resolved => "resolved",
    Closed => "closed",
    Rejected => "rejected",
    Blocked => "blocked",
});

impl Status {
    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Closed | Status::Rejected)
    }

    /// Statuses that take a grievance out of the public overdue listing
    pub fn hides_from_public(&self) -> bool {
        matches!(self, Status::Resolved | Status::Closed | Status::Rejected)
    }
}

/// Priority tier, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

string_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Role carried by a verified actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Engineer,
    Admin,
    /// Internal maintenance jobs; never issued in a token
    System,
}

string_enum!(Role {
    Citizen => "citizen",
    Engineer => "engineer",
    Admin => "admin",
    System => "system",
});

// ============================================================================
// Grievances
// ============================================================================

/// Grievance as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grievance {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub status: Status,
    pub priority: Priority,
    pub submitted_by: String,
    pub assigned_to: Option<String>,
    pub upvotes: i64,
    pub upvoted_by: Vec<String>,
    pub budget_allocated: f64,
    pub budget_spent: f64,
    pub proof_of_work: Option<String>,
    pub status_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Audit record appended on every status change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub id: i64,
    pub grievance_id: String,
    pub actor_id: String,
    pub actor_role: Role,
    pub from_status: Status,
    pub to_status: Status,
    pub reason: Option<String>,
    pub proof: Option<String>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Budgets
// ============================================================================

/// Single expense line on a budget entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: i64,
    pub grievance_id: String,
    pub amount: f64,
    pub description: String,
    pub recorded_by: String,
    pub recorded_at: DateTime<Utc>,
}

/// Per-grievance budget
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetEntry {
    pub grievance_id: String,
    pub category: Category,
    pub fiscal_year: String,
    pub allocated: f64,
    pub spent: f64,
    pub expenses: Vec<Expense>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetEntry {
    /// Spending above allocation is allowed but flagged
    pub fn over_budget(&self) -> bool {
        self.spent > self.allocated
    }

    /// Spent as a percentage of allocated; 0 when nothing is allocated
    pub fn utilization_percent(&self) -> f64 {
        utilization(self.allocated, self.spent)
    }
}

/// Category roll-up row for one fiscal year
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryAggregate {
    pub category: Category,
    pub allocated: f64,
    pub spent: f64,
    pub grievance_count: i64,
}

/// System budget singleton for one fiscal year
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemBudget {
    pub fiscal_year: String,
    pub total_allocated: f64,
    pub salary_allocated: f64,
    pub salary_spent: f64,
    pub operational_allocated: f64,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Percentage helper shared by budget projections
pub fn utilization(allocated: f64, spent: f64) -> f64 {
    if allocated <= 0.0 {
        0.0
    } else {
        spent / allocated * 100.0
    }
}
