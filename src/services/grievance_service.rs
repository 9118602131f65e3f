//! Grievance service - lifecycle, escalation and the upvote ledger
//!
//! Every mutation loads the grievance, checks it against the state machine
//! and escalation policy, and writes the result back inside one store
//! transaction, so two requests touching the same grievance are applied one
//! after the other.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{Actor, Capability};
use crate::clock::Clock;
use crate::db::grievances::{self, ListingOrder, PublicListing};
use crate::db::models::{Category, Grievance, Priority, Role, Status, TransitionRecord};
use crate::db::GrievanceDb;
use crate::error::GrievanceError;
use crate::escalation::EscalationView;
use crate::lifecycle::{self, TransitionPlan, TransitionRequest};

use super::budget_service::allocate_in_tx;
use super::events::{EventBus, GrievanceEvent};
use super::ServiceSettings;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5000;

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

// ============================================================================
// Inputs and views
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrievanceInput {
    pub title: String,
    pub description: String,
    pub category: Category,
    /// Admins may file on behalf of a citizen
    #[serde(default)]
    pub submitted_by: Option<String>,
}

/// Body of `PUT /grievances/:id`; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGrievanceInput {
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub budget_allocated: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub proof_of_work: Option<String>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

impl UpdateGrievanceInput {
    fn is_empty(&self) -> bool {
        self.status.is_none() && self.assigned_to.is_none() && self.budget_allocated.is_none()
    }
}

/// Grievance with its derived escalation fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrievanceView {
    #[serde(flatten)]
    pub grievance: Grievance,
    #[serde(flatten)]
    pub escalation: EscalationView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteOutcome {
    pub upvotes: i64,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    #[default]
    DaysOpen,
    Upvotes,
    Priority,
}

/// Query string of the overdue listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort_by: Option<SortBy>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverduePage {
    pub grievances: Vec<GrievanceView>,
    pub pagination: Pagination,
}

/// Fail with `Conflict` when the caller's version is stale
pub(crate) fn check_version(
    grievance: &Grievance,
    expected: Option<i64>,
) -> Result<(), GrievanceError> {
    match expected {
        Some(expected) if expected != grievance.version => Err(GrievanceError::Conflict {
            expected,
            actual: grievance.version,
        }),
        _ => Ok(()),
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct GrievanceService {
    db: Arc<GrievanceDb>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
}

impl GrievanceService {
    pub fn new(
        db: Arc<GrievanceDb>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            db,
            events,
            clock,
            settings,
        }
    }

    fn view(&self, grievance: Grievance, now: DateTime<Utc>) -> GrievanceView {
        GrievanceView {
            escalation: EscalationView::of(&self.settings.escalation, &grievance, now),
            grievance,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, id: &str) -> Result<GrievanceView, GrievanceError> {
        let grievance = self
            .db
            .with_conn(|conn| grievances::require_grievance(conn, id))?;
        Ok(self.view(grievance, self.clock.now()))
    }

    /// Audit trail, oldest first
    pub fn history(&self, id: &str) -> Result<Vec<TransitionRecord>, GrievanceError> {
        self.db.with_conn(|conn| {
            grievances::require_grievance(conn, id)?;
            grievances::list_transitions(conn, id)
        })
    }

    /// Page through publicly visible grievances
    pub fn list_overdue(&self, query: &OverdueQuery) -> Result<OverduePage, GrievanceError> {
        let page = query.page.unwrap_or(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page == 0 {
            return Err(GrievanceError::InvalidInput("page must be at least 1".into()));
        }
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(GrievanceError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }

        let now = self.clock.now();
        let listing = PublicListing {
            created_before: self.settings.escalation.public_cutoff(now),
            category: query.category,
            priority: query.priority,
            order: match query.sort_by.unwrap_or_default() {
                // Older first means more days open
                SortBy::DaysOpen => ListingOrder::Oldest,
                SortBy::Upvotes => ListingOrder::MostUpvoted,
                SortBy::Priority => ListingOrder::MostUrgent,
            },
            limit,
            offset: u64::from(page - 1) * u64::from(limit),
        };
        let (rows, total) = self
            .db
            .with_conn(|conn| grievances::list_public(conn, &listing))?;
        let total_pages = total.div_ceil(u64::from(limit));
        let grievances = rows.into_iter().map(|g| self.view(g, now)).collect();

        Ok(OverduePage {
            grievances,
            pagination: Pagination {
                page,
                limit,
                total,
                total_pages,
            },
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// File a new grievance; it starts open at medium priority
    pub fn create(
        &self,
        input: CreateGrievanceInput,
        actor: &Actor,
    ) -> Result<GrievanceView, GrievanceError> {
        actor.require(Capability::FileGrievance)?;

        let title = input.title.trim();
        let description = input.description.trim();
        validate_length("title", title, MAX_TITLE_LEN)?;
        validate_length("description", description, MAX_DESCRIPTION_LEN)?;

        let submitted_by = match (actor.role, input.submitted_by) {
            (Role::Admin, Some(citizen)) if !citizen.trim().is_empty() => citizen.trim().to_string(),
            _ => actor.id.clone(),
        };

        let now = self.clock.now();
        let grievance = Grievance {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.to_string(),
            category: input.category,
            status: Status::Open,
            priority: Priority::default(),
            submitted_by,
            assigned_to: None,
            upvotes: 0,
            upvoted_by: vec![],
            budget_allocated: 0.0,
            budget_spent: 0.0,
            proof_of_work: None,
            status_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        self.db.write(|tx| grievances::insert_grievance(tx, &grievance))?;

        self.events.emit(GrievanceEvent::GrievanceFiled {
            id: grievance.id.clone(),
            category: grievance.category,
            submitted_by: grievance.submitted_by.clone(),
        });

        Ok(self.view(grievance, now))
    }

    /// Move a grievance to `to`, appending an audit record
    pub fn transition(
        &self,
        id: &str,
        to: Status,
        actor: &Actor,
        request: &TransitionRequest,
        expected_version: Option<i64>,
    ) -> Result<GrievanceView, GrievanceError> {
        self.update(
            id,
            UpdateGrievanceInput {
                status: Some(to),
                reason: request.reason.clone(),
                proof_of_work: request.proof.clone(),
                expected_version,
                ..Default::default()
            },
            actor,
        )
    }

    /// Set the assigned officer
    pub fn assign(
        &self,
        id: &str,
        officer_id: &str,
        actor: &Actor,
        expected_version: Option<i64>,
    ) -> Result<GrievanceView, GrievanceError> {
        self.update(
            id,
            UpdateGrievanceInput {
                assigned_to: Some(officer_id.to_string()),
                expected_version,
                ..Default::default()
            },
            actor,
        )
    }

    /// Apply an assignment, allocation and/or status change atomically.
    ///
    /// Assignment and allocation are applied before the status change so an
    /// engineer assigned in the same request may resolve.
    pub fn update(
        &self,
        id: &str,
        input: UpdateGrievanceInput,
        actor: &Actor,
    ) -> Result<GrievanceView, GrievanceError> {
        if input.is_empty() {
            return Err(GrievanceError::InvalidInput(
                "nothing to update: expected status, assignedTo or budgetAllocated".into(),
            ));
        }
        if input.assigned_to.is_some() {
            actor.require(Capability::AssignGrievance)?;
        }
        if input.budget_allocated.is_some() {
            actor.require(Capability::AllocateBudget)?;
        }

        let now = self.clock.now();
        let require_proof = self.settings.require_proof_for_resolution;
        let request = TransitionRequest {
            reason: input.reason.clone(),
            proof: input.proof_of_work.clone(),
        };

        let (grievance, plan) = self.db.write(|tx| {
            let mut grievance = grievances::require_grievance(tx, id)?;
            check_version(&grievance, input.expected_version)?;

            if let Some(officer) = &input.assigned_to {
                assign_in_place(&mut grievance, officer, now)?;
            }
            if let Some(amount) = input.budget_allocated {
                allocate_in_tx(tx, &mut grievance, amount, now)?;
            }

            let plan = match input.status {
                Some(to) => {
                    let plan =
                        lifecycle::plan_transition(&grievance, to, actor, &request, require_proof)?;
                    apply_transition(tx, &mut grievance, &plan, actor, now)?;
                    Some(plan)
                }
                None => None,
            };

            grievance.version = grievances::update_grievance(tx, &grievance)?;
            Ok((grievance, plan))
        })?;

        if let Some(officer) = &input.assigned_to {
            self.events.emit(GrievanceEvent::GrievanceAssigned {
                id: id.to_string(),
                officer_id: officer.clone(),
            });
        }
        if let Some(amount) = input.budget_allocated {
            self.events.emit(GrievanceEvent::BudgetAllocated {
                grievance_id: id.to_string(),
                allocated: amount,
            });
        }
        if let Some(plan) = plan {
            self.events.emit(GrievanceEvent::StatusChanged {
                id: id.to_string(),
                from: plan.from,
                to: plan.to,
                actor_id: actor.id.clone(),
            });
        }

        Ok(self.view(grievance, now))
    }

    /// Record one citizen's upvote on a public grievance.
    ///
    /// Checks run in a fixed order: missing grievance, duplicate upvote,
    /// then visibility. The ledger insert, recount and priority update share
    /// one transaction.
    pub fn upvote(&self, id: &str, actor: &Actor) -> Result<UpvoteOutcome, GrievanceError> {
        actor.require(Capability::Upvote)?;

        let now = self.clock.now();
        let policy = self.settings.escalation;

        let (outcome, previous) = self.db.write(|tx| {
            let mut grievance = grievances::require_grievance(tx, id)?;
            let duplicate = || GrievanceError::AlreadyUpvoted {
                grievance_id: id.to_string(),
                user_id: actor.id.clone(),
            };

            if grievance.upvoted_by.iter().any(|u| u == &actor.id) {
                return Err(duplicate());
            }
            if !policy.compute_visibility(&grievance, now) {
                return Err(GrievanceError::NotEligible(id.to_string()));
            }
            if !grievances::insert_upvote(tx, id, &actor.id, now)? {
                return Err(duplicate());
            }

            let previous = grievance.priority;
            grievance.upvotes = grievances::count_upvotes(tx, id)?;
            grievance.priority = policy.compute_priority(grievance.upvotes, grievance.priority);
            grievance.updated_at = now;
            grievances::update_grievance(tx, &grievance)?;

            Ok((
                UpvoteOutcome {
                    upvotes: grievance.upvotes,
                    priority: grievance.priority,
                },
                previous,
            ))
        })?;

        self.events.emit(GrievanceEvent::Upvoted {
            id: id.to_string(),
            user_id: actor.id.clone(),
            upvotes: outcome.upvotes,
        });
        if outcome.priority != previous {
            self.events.emit(GrievanceEvent::PriorityEscalated {
                id: id.to_string(),
                from: previous,
                to: outcome.priority,
            });
        }

        Ok(outcome)
    }

    /// Close, as the system actor, every grievance left resolved longer than
    /// the confirmation window. Returns the number closed.
    pub fn sweep_stale_resolved(&self) -> Result<usize, GrievanceError> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(self.settings.auto_close_after_days);
        let system = Actor::system();

        let candidates = self
            .db
            .with_conn(|conn| grievances::list_resolved_before(conn, cutoff))?;
        debug!(candidates = candidates.len(), cutoff = %cutoff, "Sweeping stale resolved grievances");

        let mut closed = 0;
        for id in candidates {
            // Re-check inside the write: the citizen may have disputed meanwhile
            let plan = self.db.write(|tx| {
                let mut grievance = grievances::require_grievance(tx, &id)?;
                let stale = grievance.status == Status::Resolved
                    && grievance.resolved_at.is_some_and(|at| at <= cutoff);
                if !stale {
                    return Ok(None);
                }

                let plan = lifecycle::plan_transition(
                    &grievance,
                    Status::Closed,
                    &system,
                    &TransitionRequest {
                        reason: Some("auto-closed after confirmation window".into()),
                        proof: None,
                    },
                    false,
                )?;
                apply_transition(tx, &mut grievance, &plan, &system, now)?;
                grievances::update_grievance(tx, &grievance)?;
                Ok(Some(plan))
            })?;

            if let Some(plan) = plan {
                closed += 1;
                self.events.emit(GrievanceEvent::StatusChanged {
                    id: id.clone(),
                    from: plan.from,
                    to: plan.to,
                    actor_id: system.id.clone(),
                });
            }
        }

        if closed > 0 {
            info!(closed, "Auto-closed resolved grievances");
            self.events.emit(GrievanceEvent::AutoClosed { count: closed });
        }
        Ok(closed)
    }
}

fn validate_length(field: &str, value: &str, max: usize) -> Result<(), GrievanceError> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(GrievanceError::InvalidInput(format!(
            "{} must be 1..={} characters, got {}",
            field, max, len
        )));
    }
    Ok(())
}

fn assign_in_place(
    grievance: &mut Grievance,
    officer: &str,
    now: DateTime<Utc>,
) -> Result<(), GrievanceError> {
    // Reported as a transition into the "assigned" pseudo-state
    if grievance.status.is_terminal() {
        return Err(GrievanceError::InvalidTransition {
            from: grievance.status.to_string(),
            to: "assigned".into(),
        });
    }
    let officer = officer.trim();
    if officer.is_empty() {
        return Err(GrievanceError::InvalidInput("assignedTo must not be empty".into()));
    }
    grievance.assigned_to = Some(officer.to_string());
    grievance.updated_at = now;
    Ok(())
}

fn apply_transition(
    conn: &Connection,
    grievance: &mut Grievance,
    plan: &TransitionPlan,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<(), GrievanceError> {
    grievance.status = plan.to;
    grievance.updated_at = now;

    match plan.to {
        Status::Resolved => {
            grievance.resolved_at = Some(now);
            if plan.proof.is_some() {
                grievance.proof_of_work = plan.proof.clone();
            }
        }
        _ if plan.reason.is_some() => grievance.status_reason = plan.reason.clone(),
        _ => {}
    }

    grievances::append_transition(
        conn,
        &grievance.id,
        &actor.id,
        actor.role,
        plan.from,
        plan.to,
        plan.reason.as_deref(),
        plan.proof.as_deref(),
        now,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::models::parse_timestamp;

    fn t0() -> DateTime<Utc> {
        parse_timestamp("2025-06-01T09:00:00.000Z").unwrap()
    }

    fn service() -> (GrievanceService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let service = GrievanceService::new(
            Arc::new(GrievanceDb::open_in_memory().unwrap()),
            Arc::new(EventBus::new()),
            clock.clone(),
            ServiceSettings::default(),
        );
        (service, clock)
    }

    fn citizen(id: &str) -> Actor {
        Actor::new(id, Role::Citizen)
    }

    fn file(service: &GrievanceService, title: &str) -> GrievanceView {
        service
            .create(
                CreateGrievanceInput {
                    title: title.into(),
                    description: "Needs attention".into(),
                    category: Category::Infrastructure,
                    submitted_by: None,
                },
                &citizen("citizen-1"),
            )
            .unwrap()
    }

    #[test]
    fn test_create_defaults() {
        let (service, _) = service();
        let view = file(&service, "  Broken bench  ");
        assert_eq!(view.grievance.title, "Broken bench");
        assert_eq!(view.grievance.status, Status::Open);
        assert_eq!(view.grievance.priority, Priority::Medium);
        assert_eq!(view.grievance.submitted_by, "citizen-1");
        assert!(!view.escalation.is_public);
    }

    #[test]
    fn test_create_validates_lengths() {
        let (service, _) = service();
        let err = service
            .create(
                CreateGrievanceInput {
                    title: "x".repeat(MAX_TITLE_LEN + 1),
                    description: "d".into(),
                    category: Category::Other,
                    submitted_by: None,
                },
                &citizen("c"),
            )
            .unwrap_err();
        assert!(matches!(err, GrievanceError::InvalidInput(_)));
    }

    #[test]
    fn test_engineer_cannot_file() {
        let (service, _) = service();
        let err = service
            .create(
                CreateGrievanceInput {
                    title: "t".into(),
                    description: "d".into(),
                    category: Category::Other,
                    submitted_by: None,
                },
                &Actor::new("eng", Role::Engineer),
            )
            .unwrap_err();
        assert!(matches!(err, GrievanceError::Forbidden(_)));
    }

    #[test]
    fn test_stale_expected_version_conflicts() {
        let (service, _) = service();
        let id = file(&service, "Streetlight").grievance.id;
        let admin = Actor::new("admin", Role::Admin);

        service.assign(&id, "eng-1", &admin, Some(1)).unwrap();
        let err = service.assign(&id, "eng-2", &admin, Some(1)).unwrap_err();
        assert!(matches!(err, GrievanceError::Conflict { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_listing_sorts_and_paginates() {
        let (service, clock) = service();
        let a = file(&service, "a").grievance.id;
        clock.advance(Duration::hours(1));
        let b = file(&service, "b").grievance.id;
        clock.advance(Duration::days(9));

        service.upvote(&b, &citizen("u1")).unwrap();

        let page = service.list_overdue(&OverdueQuery::default()).unwrap();
        let ids: Vec<&str> = page.grievances.iter().map(|g| g.grievance.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
        assert_eq!(page.pagination.total, 2);
        assert_eq!(page.pagination.total_pages, 1);

        let by_votes = service
            .list_overdue(&OverdueQuery {
                sort_by: Some(SortBy::Upvotes),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_votes.grievances[0].grievance.id, b);
        assert_eq!(by_votes.pagination.total_pages, 2);
    }

    #[test]
    fn test_assigning_a_terminal_grievance_names_the_assignment() {
        let (service, _) = service();
        let id = file(&service, "Duplicate report").grievance.id;
        let admin = Actor::new("admin", Role::Admin);
        service
            .transition(
                &id,
                Status::Rejected,
                &admin,
                &TransitionRequest {
                    reason: Some("duplicate".into()),
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let err = service.assign(&id, "eng-1", &admin, None).unwrap_err();
        match &err {
            GrievanceError::InvalidTransition { from, to } => {
                assert_eq!(from, "rejected");
                assert_eq!(to, "assigned");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.to_string().contains("rejected -> rejected"));
    }

    #[test]
    fn test_listing_filters_by_category_and_priority() {
        let (service, clock) = service();
        let roads = file(&service, "Road").grievance.id;
        let clinic = service
            .create(
                CreateGrievanceInput {
                    title: "Clinic".into(),
                    description: "No doctor on duty".into(),
                    category: Category::Health,
                    submitted_by: None,
                },
                &citizen("citizen-2"),
            )
            .unwrap()
            .grievance
            .id;
        clock.advance(Duration::days(9));
        for voter in 0..25 {
            service.upvote(&roads, &citizen(&format!("v{voter}"))).unwrap();
        }

        let health = service
            .list_overdue(&OverdueQuery {
                category: Some(Category::Health),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(health.pagination.total, 1);
        assert_eq!(health.grievances[0].grievance.id, clinic);

        let high = service
            .list_overdue(&OverdueQuery {
                priority: Some(Priority::High),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(high.pagination.total, 1);
        assert_eq!(high.grievances[0].grievance.id, roads);

        let by_priority = service
            .list_overdue(&OverdueQuery {
                sort_by: Some(SortBy::Priority),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = by_priority.grievances.iter().map(|g| g.grievance.id.as_str()).collect();
        assert_eq!(ids, vec![roads.as_str(), clinic.as_str()]);
    }

    #[test]
    fn test_listing_rejects_bad_paging() {
        let (service, _) = service();
        for query in [
            OverdueQuery {
                page: Some(0),
                ..Default::default()
            },
            OverdueQuery {
                limit: Some(101),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                service.list_overdue(&query),
                Err(GrievanceError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_sweep_closes_only_stale_resolved() {
        let (service, clock) = service();
        let id = file(&service, "Drain").grievance.id;
        let admin = Actor::new("admin", Role::Admin);
        let engineer = Actor::new("eng-1", Role::Engineer);

        service.assign(&id, "eng-1", &admin, None).unwrap();
        service
            .transition(&id, Status::InProgress, &engineer, &TransitionRequest::default(), None)
            .unwrap();
        service
            .transition(
                &id,
                Status::Resolved,
                &engineer,
                &TransitionRequest {
                    proof: Some("photo://drain".into()),
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        clock.advance(Duration::days(13));
        assert_eq!(service.sweep_stale_resolved().unwrap(), 0);

        clock.advance(Duration::days(2));
        assert_eq!(service.sweep_stale_resolved().unwrap(), 1);
        assert_eq!(service.get(&id).unwrap().grievance.status, Status::Closed);
        assert_eq!(service.sweep_stale_resolved().unwrap(), 0);

        let trail = service.history(&id).unwrap();
        assert_eq!(trail.last().unwrap().actor_role, Role::System);
    }
}
