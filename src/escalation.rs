//! Escalation and priority policy
//!
//! A grievance that stays unresolved past the deadline becomes public and can
//! collect citizen upvotes. Upvote counts push priority up through fixed,
//! inclusive thresholds. Nothing here touches the store: visibility is always
//! recomputed from `created_at` and the current time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Grievance, Priority, Status};

/// Days after creation before an unresolved grievance goes public
pub const DEFAULT_DEADLINE_DAYS: i64 = 7;

/// Upvotes at which priority becomes at least `high`
pub const DEFAULT_HIGH_THRESHOLD: i64 = 25;

/// Upvotes at which priority becomes `critical`
pub const DEFAULT_CRITICAL_THRESHOLD: i64 = 50;

/// Tunable escalation thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    #[serde(default = "default_deadline_days")]
    pub deadline_days: i64,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: i64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: i64,
}

fn default_deadline_days() -> i64 {
    DEFAULT_DEADLINE_DAYS
}

fn default_high_threshold() -> i64 {
    DEFAULT_HIGH_THRESHOLD
}

fn default_critical_threshold() -> i64 {
    DEFAULT_CRITICAL_THRESHOLD
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            deadline_days: DEFAULT_DEADLINE_DAYS,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
        }
    }
}

impl EscalationPolicy {
    /// Whole days elapsed since creation, never negative
    pub fn days_open(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (now - created_at).num_days().max(0)
    }

    /// Public iff unresolved and strictly past the deadline
    pub fn is_public(&self, status: Status, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        !status.hides_from_public() && self.days_open(created_at, now) > self.deadline_days
    }

    /// Latest `created_at` that is past the deadline at `now`; equivalent to
    /// the `days_open > deadline_days` half of [`is_public`](Self::is_public)
    pub fn public_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.deadline_days + 1)
    }

    pub fn compute_visibility(&self, grievance: &Grievance, now: DateTime<Utc>) -> bool {
        self.is_public(grievance.status, grievance.created_at, now)
    }

    /// Raise priority to the tier the upvote count earns; never lowers it
    pub fn compute_priority(&self, upvotes: i64, current: Priority) -> Priority {
        let earned = if upvotes >= self.critical_threshold {
            Priority::Critical
        } else if upvotes >= self.high_threshold {
            Priority::High
        } else {
            return current;
        };

        earned.max(current)
    }

    pub fn deadline(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::days(self.deadline_days)
    }

    pub fn days_overdue(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (self.days_open(created_at, now) - self.deadline_days).max(0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.deadline_days < 0 {
            return Err("deadline_days must not be negative".into());
        }
        if self.high_threshold <= 0 || self.critical_threshold <= self.high_threshold {
            return Err(format!(
                "thresholds must satisfy 0 < high ({}) < critical ({})",
                self.high_threshold, self.critical_threshold
            ));
        }
        Ok(())
    }
}

/// Derived escalation fields attached to a grievance view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationView {
    pub days_open: i64,
    pub days_overdue: i64,
    pub deadline: DateTime<Utc>,
    pub is_public: bool,
}

impl EscalationView {
    pub fn of(policy: &EscalationPolicy, grievance: &Grievance, now: DateTime<Utc>) -> Self {
        Self {
            days_open: policy.days_open(grievance.created_at, now),
            days_overdue: policy.days_overdue(grievance.created_at, now),
            deadline: policy.deadline(grievance.created_at),
            is_public: policy.compute_visibility(grievance, now),
        }
    }
}
