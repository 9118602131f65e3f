//! Actors and the capabilities their roles grant
//!
//! Every mutating operation takes an [`Actor`] and asks it for one
//! [`Capability`]; role branching lives only in [`Role::grants`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::models::Role;
use crate::error::GrievanceError;

/// Operations that need an authorized actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FileGrievance,
    AssignGrievance,
    StartWork,
    ResolveGrievance,
    ConfirmClosure,
    DisputeResolution,
    RejectOrBlock,
    Unblock,
    Upvote,
    RecordExpense,
    AllocateBudget,
    ManageSystemBudget,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::FileGrievance => "file grievances",
            Capability::AssignGrievance => "assign grievances",
            Capability::StartWork => "start work on grievances",
            Capability::ResolveGrievance => "resolve grievances",
            Capability::ConfirmClosure => "confirm closure",
            Capability::DisputeResolution => "dispute resolutions",
            Capability::RejectOrBlock => "reject or block grievances",
            Capability::Unblock => "unblock grievances",
            Capability::Upvote => "upvote grievances",
            Capability::RecordExpense => "record expenses",
            Capability::AllocateBudget => "allocate budgets",
            Capability::ManageSystemBudget => "manage the system budget",
        };
        f.write_str(name)
    }
}

impl Role {
    pub fn grants(&self, capability: Capability) -> bool {
        use Capability::*;

        match self {
            Role::Citizen => matches!(
                capability,
                FileGrievance | ConfirmClosure | DisputeResolution | Upvote
            ),
            Role::Engineer => matches!(capability, StartWork | ResolveGrievance | RecordExpense),
            Role::Admin => matches!(
                capability,
                FileGrievance
                    | AssignGrievance
                    | StartWork
                    | RejectOrBlock
                    | Unblock
                    | RecordExpense
                    | AllocateBudget
                    | ManageSystemBudget
            ),
            Role::System => matches!(capability, ConfirmClosure),
        }
    }
}

/// Verified caller of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Actor used by maintenance jobs
    pub fn system() -> Self {
        Self::new("system", Role::System)
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.role.grants(capability)
    }

    /// Fail with `Forbidden` unless the role grants `capability`
    pub fn require(&self, capability: Capability) -> Result<(), GrievanceError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(GrievanceError::Forbidden(format!(
                "role '{}' may not {}",
                self.role, capability
            )))
        }
    }
}
