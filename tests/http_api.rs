//! HTTP routing, authentication and error rendering
//!
//! Requests go straight into `HttpServer::handle`, so no socket is bound.

use std::sync::{mpsc, Arc};
use std::time::{Duration as StdDuration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use http_body_util::BodyExt;
use hyper::{header, Method, Request, StatusCode};
use redressal::auth::TokenInput;
use redressal::db::Role;
use redressal::{GrievanceDb, HttpServer, JwtValidator, ManualClock, ServiceSettings, Services};
use serde_json::{json, Value};

struct Harness {
    server: Arc<HttpServer>,
    services: Arc<Services>,
    clock: Arc<ManualClock>,
    jwt: JwtValidator,
}

impl Harness {
    fn new() -> Self {
        let start = DateTime::parse_from_rfc3339("2025-07-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let db = Arc::new(GrievanceDb::open_in_memory().unwrap());
        let services = Arc::new(Services::with_clock(
            db,
            ServiceSettings::default(),
            clock.clone(),
        ));
        let jwt = JwtValidator::new_dev();
        let server = Arc::new(HttpServer::new(
            services.clone(),
            jwt.clone(),
            "127.0.0.1:0".parse().unwrap(),
        ));
        Self {
            server,
            services,
            clock,
            jwt,
        }
    }

    fn token(&self, user_id: &str, role: Role) -> String {
        self.jwt
            .generate_token(TokenInput {
                user_id: user_id.into(),
                name: String::new(),
                email: String::new(),
                role,
            })
            .unwrap()
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = body
            .map(|b| Bytes::from(serde_json::to_vec(&b).unwrap()))
            .unwrap_or_default();
        let response = self.server.clone().handle(builder.body(body).unwrap()).await;

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn file(&self, token: &str, title: &str, category: &str) -> String {
        let (status, body) = self
            .call(
                Method::POST,
                "/grievances",
                Some(token),
                Some(json!({
                    "title": title,
                    "description": "Reported through the portal",
                    "category": category,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().to_string()
    }
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let (status, body) = h.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_returns_view() {
    let h = Harness::new();
    let citizen = h.token("citizen-1", Role::Citizen);

    let (status, body) = h
        .call(
            Method::POST,
            "/grievances",
            Some(&citizen),
            Some(json!({
                "title": "Potholes on Station Road",
                "description": "Three deep potholes near the bus stop",
                "category": "infrastructure",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "open");
    assert_eq!(body["priority"], "medium");
    assert_eq!(body["submittedBy"], "citizen-1");
    assert_eq!(body["upvotes"], 0);
    assert_eq!(body["isPublic"], false);
    assert_eq!(body["version"], 1);

    let id = body["id"].as_str().unwrap();
    let (status, fetched) = h
        .call(Method::GET, &format!("/grievances/{}", id), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "Potholes on Station Road");
}

#[tokio::test]
async fn test_mutations_require_authentication() {
    let h = Harness::new();
    let (status, body) = h
        .call(
            Method::POST,
            "/grievances",
            None,
            Some(json!({"title": "t", "description": "d", "category": "other"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "UNAUTHORIZED");

    let (status, _) = h
        .call(Method::POST, "/grievances", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bad_bodies_are_rejected() {
    let h = Harness::new();
    let citizen = h.token("citizen-1", Role::Citizen);

    let (status, body) = h
        .call(Method::POST, "/grievances", Some(&citizen), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_INPUT");

    let (status, body) = h
        .call(
            Method::POST,
            "/grievances",
            Some(&citizen),
            Some(json!({"title": "t", "description": "d", "category": "weather"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_JSON");

    let (status, body) = h
        .call(
            Method::POST,
            "/grievances",
            Some(&citizen),
            Some(json!({"title": "   ", "description": "d", "category": "other"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_INPUT");
}

#[tokio::test]
async fn test_upvote_flow_over_http() {
    let h = Harness::new();
    let citizen = h.token("citizen-1", Role::Citizen);
    let id = h.file(&citizen, "Garbage not collected", "other").await;
    let upvote_uri = format!("/grievances/{}/upvote", id);

    let (status, body) = h.call(Method::POST, &upvote_uri, Some(&citizen), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "NOT_ELIGIBLE");

    h.clock.advance(Duration::days(8));
    let (status, body) = h.call(Method::POST, &upvote_uri, Some(&citizen), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upvotes"], 1);
    assert_eq!(body["priority"], "medium");

    let (status, body) = h.call(Method::POST, &upvote_uri, Some(&citizen), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "ALREADY_UPVOTED");
    assert!(body["error"]["message"].as_str().unwrap().contains("citizen-1"));

    let engineer = h.token("eng-1", Role::Engineer);
    let (status, body) = h.call(Method::POST, &upvote_uri, Some(&engineer), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "FORBIDDEN");

    let (status, body) = h
        .call(Method::POST, "/grievances/missing/upvote", Some(&citizen), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NOT_FOUND");
}

#[tokio::test]
async fn test_update_status_and_conflicts() {
    let h = Harness::new();
    let citizen = h.token("citizen-1", Role::Citizen);
    let admin = h.token("admin-1", Role::Admin);
    let id = h.file(&citizen, "Water supply irregular", "health").await;
    let uri = format!("/grievances/{}", id);

    let (status, body) = h
        .call(Method::PUT, &uri, Some(&citizen), Some(json!({"status": "closed"})))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "INVALID_TRANSITION");

    let (status, body) = h
        .call(
            Method::PUT,
            &uri,
            Some(&admin),
            Some(json!({"assignedTo": "eng-2", "status": "in-progress", "expectedVersion": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "in-progress");
    assert_eq!(body["assignedTo"], "eng-2");
    assert_eq!(body["version"], 2);

    let (status, body) = h
        .call(
            Method::PUT,
            &uri,
            Some(&admin),
            Some(json!({"budgetAllocated": 500.0, "expectedVersion": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "CONFLICT");

    let (status, body) = h
        .call(Method::GET, &format!("{}/history", uri), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["toStatus"], "in-progress");
}

#[tokio::test]
async fn test_overdue_listing_is_public_and_paginated() {
    let h = Harness::new();
    let citizen = h.token("citizen-1", Role::Citizen);
    for n in 0..3 {
        h.file(&citizen, &format!("Broken bench {}", n), "infrastructure")
            .await;
    }
    h.file(&citizen, "Clinic closed early", "health").await;

    let (status, body) = h.call(Method::GET, "/grievances/overdue", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 0);

    h.clock.advance(Duration::days(9));
    let (status, body) = h
        .call(
            Method::GET,
            "/grievances/overdue?page=2&limit=2&category=infrastructure",
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 3);
    assert_eq!(body["pagination"]["totalPages"], 2);
    assert_eq!(body["grievances"].as_array().unwrap().len(), 1);
    assert_eq!(body["grievances"][0]["daysOverdue"], 2);

    let (status, body) = h
        .call(Method::GET, "/grievances/overdue?limit=1000", None, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_INPUT");
}

#[tokio::test]
async fn test_budget_endpoints() {
    let h = Harness::new();
    let citizen = h.token("citizen-1", Role::Citizen);
    let admin = h.token("admin-1", Role::Admin);
    let engineer = h.token("eng-1", Role::Engineer);
    let id = h.file(&citizen, "Library roof", "academic").await;

    let (status, body) = h
        .call(Method::GET, &format!("/grievances/{}/budget", id), None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{}", body);

    let (status, _) = h
        .call(Method::GET, "/budget/system/public?fiscalYear=2025-26", None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let system = json!({
        "fiscalYear": "2025-26",
        "totalAllocated": 10000.0,
        "salaryAllocated": 6000.0,
        "operationalAllocated": 4000.0,
    });
    let (status, body) = h
        .call(Method::PUT, "/budget/system", Some(&engineer), Some(system.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "FORBIDDEN");

    let (status, _) = h
        .call(Method::PUT, "/budget/system", Some(&admin), Some(system))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = h
        .call(
            Method::PUT,
            &format!("/grievances/{}", id),
            Some(&admin),
            Some(json!({"budgetAllocated": 800.0})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h
        .call(
            Method::POST,
            &format!("/grievances/{}/expense", id),
            Some(&engineer),
            Some(json!({"amount": 300.0, "description": "Tarpaulin"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["budget"]["spent"], 300.0);
    assert_eq!(body["budget"]["overBudget"], false);

    let (status, body) = h
        .call(Method::GET, &format!("/grievances/{}/budget", id), None, None)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["allocated"], 800.0);
    assert_eq!(body["spent"], 300.0);
    assert_eq!(body["fiscalYear"], "2025-26");
    assert_eq!(body["expenses"].as_array().unwrap().len(), 1);

    let (status, body) = h
        .call(Method::GET, "/grievances/missing/budget", None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NOT_FOUND");

    let (status, body) = h
        .call(Method::GET, "/budget/system/public", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fiscalYear"], "2025-26");
    assert_eq!(body["totalSpent"], 300.0);
    assert_eq!(body["operational"]["spent"], 300.0);
    assert_eq!(body["categoryWise"][0]["category"], "academic");

    let (status, body) = h
        .call(
            Method::POST,
            "/budget/system/salary",
            Some(&admin),
            Some(json!({"fiscalYear": "2025-26", "amount": 1000.0})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalSpent"], 1300.0);

    let (status, body) = h.call(Method::GET, "/budget/overview", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalAllocated"], 800.0);

    let (status, body) = h
        .call(Method::GET, "/budget/trends?months=3", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["months"].as_array().unwrap().len(), 3);
    assert_eq!(body["months"][2]["month"], "2025-07");

    let (status, _) = h
        .call(Method::GET, "/budget/trends?months=0", None, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_routes_and_methods() {
    let h = Harness::new();

    let (status, body) = h.call(Method::GET, "/nope", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NOT_FOUND");

    let (status, body) = h.call(Method::DELETE, "/grievances/abc", None, None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(&body), "METHOD_NOT_ALLOWED");
}

#[tokio::test]
async fn test_request_waiting_on_the_store_leaves_the_runtime_free() {
    let h = Harness::new();
    let db = h.services.db.clone();
    let (held_tx, held_rx) = mpsc::channel();
    let holder = std::thread::spawn(move || {
        db.with_conn(|_| {
            held_tx.send(()).unwrap();
            std::thread::sleep(StdDuration::from_millis(300));
            Ok(())
        })
        .unwrap();
    });
    held_rx.recv().unwrap();

    let request = async {
        let (status, _) = h.call(Method::GET, "/budget/overview", None, None).await;
        (status, Instant::now())
    };
    let timer = async {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        Instant::now()
    };
    let ((status, answered_at), fired_at) = tokio::join!(request, timer);
    holder.join().unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(fired_at < answered_at);
}
