//! Redressal - grievance lifecycle and escalation engine
//!
//! Backend for a citizen grievance portal. Citizens file civic complaints,
//! officers work them through a lifecycle, complaints left unresolved past
//! a deadline become public, and citizens upvote public complaints to raise
//! their priority. Budget entries on grievances roll up into category and
//! fiscal-year transparency reports.
//!
//! ## Architecture
//!
//! - **lifecycle** / **escalation**: pure policy, no I/O
//! - **db**: SQLite repository functions over one serialized connection
//! - **services**: capability checks, transactions and domain events
//! - **http**: hyper server mapping routes onto services
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/redressal/
//! ├── grievances.db          # SQLite (WAL)
//! └── config.toml            # Configuration
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod escalation;
pub mod http;
pub mod lifecycle;
pub mod services;

pub use auth::{Actor, Capability, JwtValidator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::GrievanceDb;
pub use error::{GrievanceError, Result};
pub use escalation::EscalationPolicy;
pub use http::HttpServer;
pub use services::{ServiceSettings, Services};
