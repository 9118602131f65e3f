//! End-to-end grievance lifecycle, escalation and upvote scenarios
//!
//! Time is driven by a manual clock so the 7-day deadline can be crossed
//! without sleeping.

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, Utc};
use redressal::db::{Category, Priority, Role, Status};
use redressal::lifecycle::TransitionRequest;
use redressal::services::grievance_service::CreateGrievanceInput;
use redressal::{Actor, GrievanceDb, GrievanceError, ManualClock, ServiceSettings, Services};
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-07-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn setup() -> (Services, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let db = Arc::new(GrievanceDb::open_in_memory().unwrap());
    let services = Services::with_clock(db, ServiceSettings::default(), clock.clone());
    (services, clock)
}

fn citizen(n: usize) -> Actor {
    Actor::new(format!("citizen-{}", n), Role::Citizen)
}

fn file_grievance(services: &Services) -> String {
    services
        .grievances
        .create(
            CreateGrievanceInput {
                title: "Streetlights out on Ring Road".into(),
                description: "Whole stretch has been dark for a week".into(),
                category: Category::Infrastructure,
                submitted_by: None,
            },
            &citizen(0),
        )
        .unwrap()
        .grievance
        .id
}

#[test]
fn test_escalation_and_upvote_scenario() {
    let (services, clock) = setup();
    let id = file_grievance(&services);

    // Not yet public: upvotes are refused
    let err = services.grievances.upvote(&id, &citizen(1)).unwrap_err();
    assert!(matches!(err, GrievanceError::NotEligible(_)));

    clock.advance(Duration::days(8));
    let view = services.grievances.get(&id).unwrap();
    assert!(view.escalation.is_public);
    assert_eq!(view.escalation.days_open, 8);
    assert_eq!(view.escalation.days_overdue, 1);

    let first = services.grievances.upvote(&id, &citizen(1)).unwrap();
    assert_eq!(first.upvotes, 1);
    assert_eq!(first.priority, Priority::Medium);

    for n in 2..=24 {
        services.grievances.upvote(&id, &citizen(n)).unwrap();
    }
    let at_25 = services.grievances.upvote(&id, &citizen(25)).unwrap();
    assert_eq!(at_25.upvotes, 25);
    assert_eq!(at_25.priority, Priority::High);

    for n in 26..=49 {
        let outcome = services.grievances.upvote(&id, &citizen(n)).unwrap();
        assert_eq!(outcome.priority, Priority::High);
    }
    let at_50 = services.grievances.upvote(&id, &citizen(50)).unwrap();
    assert_eq!(at_50.upvotes, 50);
    assert_eq!(at_50.priority, Priority::Critical);

    let err = services.grievances.upvote(&id, &citizen(1)).unwrap_err();
    assert!(matches!(err, GrievanceError::AlreadyUpvoted { .. }));

    let g = services.grievances.get(&id).unwrap().grievance;
    assert_eq!(g.upvotes, 50);
    assert_eq!(g.upvotes as usize, g.upvoted_by.len());
}

#[test]
fn test_duplicate_check_precedes_visibility() {
    let (services, clock) = setup();
    let id = file_grievance(&services);
    clock.advance(Duration::days(8));
    services.grievances.upvote(&id, &citizen(1)).unwrap();

    // Resolving hides the grievance; a repeat upvote is still a duplicate
    let admin = Actor::new("admin", Role::Admin);
    let engineer = Actor::new("eng-1", Role::Engineer);
    services
        .grievances
        .transition(&id, Status::InProgress, &admin, &TransitionRequest::default(), None)
        .unwrap();
    services
        .grievances
        .transition(
            &id,
            Status::Resolved,
            &engineer,
            &TransitionRequest {
                proof: Some("photo://lights-on".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();

    let err = services.grievances.upvote(&id, &citizen(1)).unwrap_err();
    assert!(matches!(err, GrievanceError::AlreadyUpvoted { .. }));
    let err = services.grievances.upvote(&id, &citizen(2)).unwrap_err();
    assert!(matches!(err, GrievanceError::NotEligible(_)));
}

#[test]
fn test_upvote_unknown_grievance_is_not_found() {
    let (services, _) = setup();
    let err = services.grievances.upvote("missing", &citizen(1)).unwrap_err();
    assert!(matches!(err, GrievanceError::NotFound(_)));
}

#[test]
fn test_officers_cannot_upvote() {
    let (services, clock) = setup();
    let id = file_grievance(&services);
    clock.advance(Duration::days(8));

    let err = services
        .grievances
        .upvote(&id, &Actor::new("eng-1", Role::Engineer))
        .unwrap_err();
    assert!(matches!(err, GrievanceError::Forbidden(_)));
}

#[test]
fn test_open_to_closed_is_rejected() {
    let (services, _) = setup();
    let id = file_grievance(&services);

    let err = services
        .grievances
        .transition(&id, Status::Closed, &citizen(0), &TransitionRequest::default(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        GrievanceError::InvalidTransition { ref from, ref to } if from == "open" && to == "closed"
    ));

    let g = services.grievances.get(&id).unwrap().grievance;
    assert_eq!(g.status, Status::Open);
    assert_eq!(g.version, 1);
    assert!(services.grievances.history(&id).unwrap().is_empty());
}

#[test]
fn test_full_lifecycle_records_audit_trail() {
    let (services, clock) = setup();
    let id = file_grievance(&services);
    let admin = Actor::new("admin-1", Role::Admin);
    let engineer = Actor::new("eng-7", Role::Engineer);

    let view = services.grievances.assign(&id, "eng-7", &admin, Some(1)).unwrap();
    assert_eq!(view.grievance.assigned_to.as_deref(), Some("eng-7"));

    services
        .grievances
        .transition(&id, Status::InProgress, &engineer, &TransitionRequest::default(), None)
        .unwrap();

    clock.advance(Duration::days(2));
    let resolved = services
        .grievances
        .transition(
            &id,
            Status::Resolved,
            &engineer,
            &TransitionRequest {
                proof: Some("photo://fixed".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(resolved.grievance.proof_of_work.as_deref(), Some("photo://fixed"));
    assert_eq!(resolved.grievance.resolved_at, Some(clock_now(&clock)));

    // Citizen disputes, engineer resolves again, citizen confirms
    services
        .grievances
        .transition(
            &id,
            Status::InProgress,
            &citizen(0),
            &TransitionRequest {
                reason: Some("Still dark at night".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    services
        .grievances
        .transition(
            &id,
            Status::Resolved,
            &engineer,
            &TransitionRequest {
                proof: Some("photo://fixed-again".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    let closed = services
        .grievances
        .transition(&id, Status::Closed, &citizen(0), &TransitionRequest::default(), None)
        .unwrap();
    assert_eq!(closed.grievance.status, Status::Closed);

    let trail = services.grievances.history(&id).unwrap();
    let steps: Vec<(Status, Status)> = trail.iter().map(|t| (t.from_status, t.to_status)).collect();
    assert_eq!(
        steps,
        vec![
            (Status::Open, Status::InProgress),
            (Status::InProgress, Status::Resolved),
            (Status::Resolved, Status::InProgress),
            (Status::InProgress, Status::Resolved),
            (Status::Resolved, Status::Closed),
        ]
    );
    assert_eq!(trail[2].reason.as_deref(), Some("Still dark at night"));

    // Terminal: nothing moves it any more
    let err = services
        .grievances
        .transition(
            &id,
            Status::Rejected,
            &admin,
            &TransitionRequest {
                reason: Some("late".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap_err();
    assert!(matches!(err, GrievanceError::InvalidTransition { .. }));
}

fn clock_now(clock: &ManualClock) -> DateTime<Utc> {
    use redressal::Clock;
    clock.now()
}

#[test]
fn test_concurrent_upvotes_never_lose_increments() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let db = Arc::new(GrievanceDb::open(dir.path()).unwrap().with_write_retries(10));
    let services = Arc::new(Services::with_clock(db, ServiceSettings::default(), clock.clone()));

    let id = file_grievance(&services);
    clock.advance(Duration::days(10));

    let threads = 8;
    let per_thread = 10;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let services = services.clone();
            let id = id.clone();
            thread::spawn(move || {
                for n in 0..per_thread {
                    services
                        .grievances
                        .upvote(&id, &citizen(1000 + t * per_thread + n))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let g = services.grievances.get(&id).unwrap().grievance;
    assert_eq!(g.upvotes, (threads * per_thread) as i64);
    assert_eq!(g.upvoted_by.len(), threads * per_thread);
    assert_eq!(g.priority, Priority::Critical);
}

#[test]
fn test_concurrent_duplicate_upvotes_succeed_once() {
    let (services, clock) = setup();
    let services = Arc::new(services);
    let id = file_grievance(&services);
    clock.advance(Duration::days(10));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let services = services.clone();
            let id = id.clone();
            thread::spawn(move || services.grievances.upvote(&id, &citizen(42)))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(GrievanceError::AlreadyUpvoted { .. })))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(services.grievances.get(&id).unwrap().grievance.upvotes, 1);
}
