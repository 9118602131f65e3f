//! Service layer for the grievance engine
//!
//! Services sit between HTTP handlers and the repository functions in
//! `db/`. Each one:
//! - checks the actor's capability
//! - validates input
//! - runs its reads and writes inside one store transaction
//! - emits events once the transaction has committed
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (policy + orchestration)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod budget_service;
pub mod events;
pub mod grievance_service;
pub mod response;

pub use budget_service::BudgetService;
pub use events::{spawn_logging_listener, EventBus, EventListener, GrievanceEvent};
pub use grievance_service::GrievanceService;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::db::GrievanceDb;
use crate::escalation::EscalationPolicy;

/// Default days a resolved grievance waits for the citizen before auto-closing
pub const DEFAULT_AUTO_CLOSE_AFTER_DAYS: i64 = 14;

/// Policy knobs shared by the services
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceSettings {
    pub escalation: EscalationPolicy,
    pub require_proof_for_resolution: bool,
    pub auto_close_after_days: i64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            escalation: EscalationPolicy::default(),
            require_proof_for_resolution: true,
            auto_close_after_days: DEFAULT_AUTO_CLOSE_AFTER_DAYS,
        }
    }
}

/// Service container handed to the HTTP server and the sweep task
pub struct Services {
    pub grievances: Arc<GrievanceService>,
    pub budget: Arc<BudgetService>,
    pub events: Arc<EventBus>,
    pub db: Arc<GrievanceDb>,
}

impl Services {
    /// Services on the wall clock
    pub fn new(db: Arc<GrievanceDb>, settings: ServiceSettings) -> Self {
        Self::with_clock(db, settings, Arc::new(SystemClock))
    }

    /// Services reading time from `clock`; tests pass a manual clock
    pub fn with_clock(
        db: Arc<GrievanceDb>,
        settings: ServiceSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventBus::new());

        Self {
            grievances: Arc::new(GrievanceService::new(
                db.clone(),
                events.clone(),
                clock.clone(),
                settings,
            )),
            budget: Arc::new(BudgetService::new(db.clone(), events.clone(), clock)),
            events,
            db,
        }
    }
}
