//! HTTP API for grievances and budgets
//!
//! ## Endpoints
//!
//! - `GET  /health` - Liveness and store statistics
//! - `POST /grievances` - File a grievance (citizen, admin)
//! - `GET  /grievances/overdue` - Public, paginated overdue listing
//! - `GET  /grievances/{id}` - Grievance with escalation fields
//! - `GET  /grievances/{id}/history` - Status change audit trail
//! - `PUT  /grievances/{id}` - Status change, assignment and/or allocation
//! - `POST /grievances/{id}/upvote` - Citizen upvote
//! - `POST /grievances/{id}/expense` - Record an expense (admin, engineer)
//! - `GET  /grievances/{id}/budget` - Budget entry with its expense lines
//! - `GET  /budget/system/public` - Fiscal-year summary (`?fiscalYear=2025-26`)
//! - `PUT  /budget/system` - Create or replace the system budget (admin)
//! - `POST /budget/system/salary` - Record a salary disbursement (admin)
//! - `GET  /budget/overview` - Totals across every budget entry
//! - `GET  /budget/trends` - Monthly spend (`?months=6`)
//!
//! Mutating endpoints need `Authorization: Bearer <jwt>`.
//!
//! ## Example
//!
//! ```bash
//! curl -X POST http://localhost:8095/grievances/$ID/upvote \
//!   -H "Authorization: Bearer $TOKEN"
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::auth::{Actor, JwtValidator};
use crate::error::GrievanceError;
use crate::services::budget_service::{RecordExpenseInput, SalaryDisbursementInput, SystemBudgetInput};
use crate::services::grievance_service::{CreateGrievanceInput, OverdueQuery, UpdateGrievanceInput};
use crate::services::response::{self, error_response, method_not_allowed, route_not_found};
use crate::services::Services;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    fiscal_year: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrendsQuery {
    months: Option<u32>,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    jwt: JwtValidator,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, jwt: JwtValidator, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            jwt,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), GrievanceError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let response = match body.collect().await {
                            Ok(collected) => {
                                server
                                    .clone()
                                    .handle(Request::from_parts(parts, collected.to_bytes()))
                                    .await
                            }
                            Err(e) => error_response(GrievanceError::InvalidInput(format!(
                                "failed to read body: {}",
                                e
                            ))),
                        };
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route a request whose body has already been read
    ///
    /// Services block on the store mutex and its write backoff, so dispatch
    /// runs on tokio's blocking pool rather than on a runtime worker.
    pub async fn handle(self: Arc<Self>, req: Request<Bytes>) -> HttpResponse {
        match tokio::task::spawn_blocking(move || self.dispatch(req)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request handler aborted");
                error_response(GrievanceError::Internal("request handler aborted".into()))
            }
        }
    }

    fn dispatch(&self, req: Request<Bytes>) -> HttpResponse {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        debug!(method = %method, path = %path, "Incoming request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let result = match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => self.handle_health(),

            (&Method::POST, ["grievances"]) => self.handle_create(&req),
            (&Method::GET, ["grievances", "overdue"]) => self.handle_overdue(&req),
            (&Method::GET, ["grievances", id]) => {
                Ok(response::from_result(self.services.grievances.get(id)))
            }
            (&Method::GET, ["grievances", id, "history"]) => {
                Ok(response::from_result(self.services.grievances.history(id)))
            }
            (&Method::GET, ["grievances", id, "budget"]) => {
                Ok(response::from_result(self.services.budget.entry(id)))
            }
            (&Method::PUT, ["grievances", id]) => self.handle_update(&req, id),
            (&Method::POST, ["grievances", id, "upvote"]) => self.handle_upvote(&req, id),
            (&Method::POST, ["grievances", id, "expense"]) => self.handle_expense(&req, id),

            (&Method::GET, ["budget", "system", "public"]) => self.handle_system_summary(&req),
            (&Method::PUT, ["budget", "system"]) => self.handle_upsert_system(&req),
            (&Method::POST, ["budget", "system", "salary"]) => self.handle_salary(&req),
            (&Method::GET, ["budget", "overview"]) => {
                Ok(response::from_result(self.services.budget.overview()))
            }
            (&Method::GET, ["budget", "trends"]) => self.handle_trends(&req),

            (_, segs) if is_known_route(segs) => Ok(method_not_allowed()),
            _ => Ok(route_not_found(&path)),
        };

        result.unwrap_or_else(error_response)
    }

    // =========================================================================
    // Request helpers
    // =========================================================================

    /// Verified caller; mutating routes reject anonymous requests
    fn actor(&self, req: &Request<Bytes>) -> Result<Actor, GrievanceError> {
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .map(|v| {
                v.to_str()
                    .map_err(|_| GrievanceError::Unauthorized("Malformed Authorization header".into()))
            })
            .transpose()?;

        self.jwt
            .authenticate(header)?
            .ok_or_else(|| GrievanceError::Unauthorized("Authentication required".into()))
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn handle_health(&self) -> Result<HttpResponse, GrievanceError> {
        let stats = self.services.db.stats()?;
        Ok(response::ok(&serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "stats": stats,
        })))
    }

    fn handle_create(&self, req: &Request<Bytes>) -> Result<HttpResponse, GrievanceError> {
        let actor = self.actor(req)?;
        let input: CreateGrievanceInput = json_body(req)?;
        Ok(response::from_create_result(
            self.services.grievances.create(input, &actor),
        ))
    }

    fn handle_overdue(&self, req: &Request<Bytes>) -> Result<HttpResponse, GrievanceError> {
        let query: OverdueQuery = query_params(req)?;
        Ok(response::from_result(
            self.services.grievances.list_overdue(&query),
        ))
    }

    fn handle_update(&self, req: &Request<Bytes>, id: &str) -> Result<HttpResponse, GrievanceError> {
        let actor = self.actor(req)?;
        let input: UpdateGrievanceInput = json_body(req)?;
        Ok(response::from_result(
            self.services.grievances.update(id, input, &actor),
        ))
    }

    fn handle_upvote(&self, req: &Request<Bytes>, id: &str) -> Result<HttpResponse, GrievanceError> {
        let actor = self.actor(req)?;
        Ok(response::from_result(
            self.services.grievances.upvote(id, &actor),
        ))
    }

    fn handle_expense(&self, req: &Request<Bytes>, id: &str) -> Result<HttpResponse, GrievanceError> {
        let actor = self.actor(req)?;
        let input: RecordExpenseInput = json_body(req)?;
        Ok(response::from_create_result(
            self.services.budget.record_expense(id, input, &actor),
        ))
    }

    fn handle_system_summary(&self, req: &Request<Bytes>) -> Result<HttpResponse, GrievanceError> {
        let query: SummaryQuery = query_params(req)?;
        Ok(response::from_result(
            self.services
                .budget
                .system_summary(query.fiscal_year.as_deref()),
        ))
    }

    fn handle_upsert_system(&self, req: &Request<Bytes>) -> Result<HttpResponse, GrievanceError> {
        let actor = self.actor(req)?;
        let input: SystemBudgetInput = json_body(req)?;
        Ok(response::from_result(
            self.services.budget.upsert_system_budget(input, &actor),
        ))
    }

    fn handle_salary(&self, req: &Request<Bytes>) -> Result<HttpResponse, GrievanceError> {
        let actor = self.actor(req)?;
        let input: SalaryDisbursementInput = json_body(req)?;
        Ok(response::from_result(
            self.services.budget.record_salary_disbursement(input, &actor),
        ))
    }

    fn handle_trends(&self, req: &Request<Bytes>) -> Result<HttpResponse, GrievanceError> {
        let query: TrendsQuery = query_params(req)?;
        Ok(response::from_result(
            self.services.budget.trends(query.months),
        ))
    }
}

fn is_known_route(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["grievances"]
            | ["grievances", _]
            | ["grievances", _, "history" | "upvote" | "expense" | "budget"]
            | ["budget", "system"]
            | ["budget", "system", "public" | "salary"]
            | ["budget", "overview" | "trends"]
    )
}

fn json_body<T: DeserializeOwned>(req: &Request<Bytes>) -> Result<T, GrievanceError> {
    if req.body().is_empty() {
        return Err(GrievanceError::InvalidInput("request body is required".into()));
    }
    Ok(serde_json::from_slice(req.body())?)
}

fn query_params<T: DeserializeOwned>(req: &Request<Bytes>) -> Result<T, GrievanceError> {
    serde_urlencoded::from_str(req.uri().query().unwrap_or(""))
        .map_err(|e| GrievanceError::InvalidInput(format!("invalid query string: {}", e)))
}
