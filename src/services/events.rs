//! Domain events emitted by services
//!
//! Events are broadcast after the owning transaction commits. The logging
//! listener turns them into the audit log; other subscribers (notifications,
//! caches) can attach without touching the services.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::db::models::{Category, Priority, Status};

#[derive(Debug, Clone, PartialEq)]
pub enum GrievanceEvent {
    GrievanceFiled {
        id: String,
        category: Category,
        submitted_by: String,
    },
    GrievanceAssigned {
        id: String,
        officer_id: String,
    },
    StatusChanged {
        id: String,
        from: Status,
        to: Status,
        actor_id: String,
    },
    Upvoted {
        id: String,
        user_id: String,
        upvotes: i64,
    },
    PriorityEscalated {
        id: String,
        from: Priority,
        to: Priority,
    },
    BudgetAllocated {
        grievance_id: String,
        allocated: f64,
    },
    ExpenseRecorded {
        grievance_id: String,
        amount: f64,
        over_budget: bool,
    },
    SystemBudgetUpdated {
        fiscal_year: String,
    },
    SalaryDisbursed {
        fiscal_year: String,
        amount: f64,
    },
    AutoClosed {
        count: usize,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &GrievanceEvent);
}

/// Broadcast bus for grievance events
pub struct EventBus {
    sender: broadcast::Sender<GrievanceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: GrievanceEvent) {
        trace!(event = ?event, "Emitting grievance event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GrievanceEvent> {
        self.sender.subscribe()
    }

}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes every event to the tracing log
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &GrievanceEvent) {
        match event {
            GrievanceEvent::GrievanceFiled {
                id,
                category,
                submitted_by,
            } => {
                info!(grievance_id = %id, category = %category, submitted_by = %submitted_by, "Grievance filed");
            }
            GrievanceEvent::StatusChanged {
                id,
                from,
                to,
                actor_id,
            } => {
                info!(grievance_id = %id, from = %from, to = %to, actor = %actor_id, "Status changed");
            }
            GrievanceEvent::PriorityEscalated { id, from, to } => {
                info!(grievance_id = %id, from = %from, to = %to, "Priority escalated");
            }
            GrievanceEvent::ExpenseRecorded {
                grievance_id,
                amount,
                over_budget: true,
            } => {
                warn!(grievance_id = %grievance_id, amount, "Expense pushed grievance over budget");
            }
            GrievanceEvent::AutoClosed { count } => {
                info!(count, "Auto-closed stale resolved grievances");
            }
            _ => {
                debug!(event = ?event, "Grievance event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
