//! Grievance state machine
//!
//! ```text
//!            admin/engineer          engineer + proof       submitter/system
//!   open ──────────────────▶ in-progress ──────────▶ resolved ──────────▶ closed
//!     ▲                          ▲                        │
//!     │ admin (unblock)          └────── submitter ───────┘ (dispute + reason)
//!  blocked
//!
//!   any non-terminal ──admin + reason──▶ rejected | blocked
//! ```
//!
//! `closed` and `rejected` are terminal.

use serde::Deserialize;

use crate::auth::{Actor, Capability};
use crate::db::models::{Grievance, Role, Status};
use crate::error::GrievanceError;

/// Who, beyond holding the capability, may take a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Any,
    /// The assigned officer when one is set
    Assignee,
    /// The citizen who filed the grievance; the system actor bypasses this
    Submitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    None,
    Proof,
    Reason,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    capability: Capability,
    ownership: Ownership,
    requirement: Requirement,
}

fn rule_for(from: Status, to: Status) -> Option<Rule> {
    use Status::*;

    let rule = |capability, ownership, requirement| Rule {
        capability,
        ownership,
        requirement,
    };

    match (from, to) {
        (f, _) if f.is_terminal() => None,
        (f, t) if f == t => None,
        (_, Rejected) | (_, Blocked) => {
            Some(rule(Capability::RejectOrBlock, Ownership::Any, Requirement::Reason))
        }
        (Open, InProgress) => Some(rule(Capability::StartWork, Ownership::Any, Requirement::None)),
        (InProgress, Resolved) => Some(rule(
            Capability::ResolveGrievance,
            Ownership::Assignee,
            Requirement::Proof,
        )),
        (Resolved, Closed) => Some(rule(
            Capability::ConfirmClosure,
            Ownership::Submitter,
            Requirement::None,
        )),
        (Resolved, InProgress) => Some(rule(
            Capability::DisputeResolution,
            Ownership::Submitter,
            Requirement::Reason,
        )),
        (Blocked, Open) => Some(rule(Capability::Unblock, Ownership::Any, Requirement::None)),
        _ => None,
    }
}

/// Requested status change
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub reason: Option<String>,
    pub proof: Option<String>,
}

/// Validated change ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub from: Status,
    pub to: Status,
    pub reason: Option<String>,
    pub proof: Option<String>,
}

/// Check a status change against the table and the actor's capabilities.
///
/// Order of checks: unknown edge (`InvalidTransition`), then capability and
/// ownership (`Forbidden`), then required proof or reason (`InvalidInput`).
pub fn plan_transition(
    grievance: &Grievance,
    to: Status,
    actor: &Actor,
    request: &TransitionRequest,
    require_proof: bool,
) -> Result<TransitionPlan, GrievanceError> {
    let from = grievance.status;
    let rule = rule_for(from, to).ok_or_else(|| GrievanceError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    })?;

    actor.require(rule.capability)?;
    check_ownership(rule.ownership, grievance, actor)?;

    let reason = non_blank(request.reason.as_deref());
    let proof = non_blank(request.proof.as_deref());

    match rule.requirement {
        Requirement::Proof if require_proof && proof.is_none() => {
            return Err(GrievanceError::InvalidInput(format!(
                "proof of work is required to move {} -> {}",
                from, to
            )));
        }
        Requirement::Reason if reason.is_none() => {
            return Err(GrievanceError::InvalidInput(format!(
                "a reason is required to move {} -> {}",
                from, to
            )));
        }
        _ => {}
    }

    Ok(TransitionPlan {
        from,
        to,
        reason,
        proof,
    })
}

fn check_ownership(
    ownership: Ownership,
    grievance: &Grievance,
    actor: &Actor,
) -> Result<(), GrievanceError> {
    match ownership {
        Ownership::Any => Ok(()),
        Ownership::Assignee => match &grievance.assigned_to {
            Some(assignee) if assignee != &actor.id => Err(GrievanceError::Forbidden(format!(
                "grievance {} is assigned to another officer",
                grievance.id
            ))),
            _ => Ok(()),
        },
        Ownership::Submitter => {
            if actor.role == Role::System || grievance.submitted_by == actor.id {
                Ok(())
            } else {
                Err(GrievanceError::Forbidden(format!(
                    "only the submitter of grievance {} may do this",
                    grievance.id
                )))
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
