//! Authentication and authorization
//!
//! - `jwt` verifies bearer tokens issued by the external auth service
//! - `permissions` maps roles to the capabilities operations require

pub mod jwt;
pub mod permissions;

pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenInput};
pub use permissions::{Actor, Capability};
