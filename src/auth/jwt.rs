//! Bearer token verification
//!
//! Accounts and login live in an external auth service; this side only
//! verifies the HS256 tokens it issues and turns their claims into an
//! [`Actor`]. `generate_token` exists for the `issue-token` command and tests.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::Actor;
use crate::db::models::Role;
use crate::error::GrievanceError;

/// Minimum secret length accepted outside dev mode
pub const MIN_SECRET_LEN: usize = 32;

/// Payload stored in JWT token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub role: Role,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl Claims {
    pub fn actor(&self) -> Actor {
        Actor::new(self.sub.clone(), self.role)
    }
}

/// Input for creating a new token
#[derive(Debug, Clone)]
pub struct TokenInput {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// JWT validator and generator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Returns an error if the secret is empty or too short
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, GrievanceError> {
        if secret.is_empty() {
            return Err(GrievanceError::Config("JWT_SECRET is required".into()));
        }

        if secret.len() < MIN_SECRET_LEN {
            return Err(GrievanceError::Config(format!(
                "JWT_SECRET must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }

        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Create a validator for dev mode
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    pub fn generate_token(&self, input: TokenInput) -> Result<String, GrievanceError> {
        if input.role == Role::System {
            return Err(GrievanceError::InvalidInput(
                "tokens cannot carry the system role".into(),
            ));
        }

        let now = unix_now()?;
        let claims = Claims {
            sub: input.user_id,
            name: input.name,
            email: input.email,
            role: input.role,
            iat: now,
            exp: now + self.expiry_seconds,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| GrievanceError::Internal(format!("Failed to generate token: {}", e)))?;

        Ok(token)
    }

    /// Verify signature and expiry, returning the claims
    pub fn verify_token(&self, token: &str) -> Result<Claims, GrievanceError> {
        let validation = Validation::default();

        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        ) {
            Ok(data) if data.claims.role == Role::System => Err(GrievanceError::Unauthorized(
                "Token carries a reserved role".into(),
            )),
            Ok(data) => Ok(data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let message = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Token validation failed",
                };
                Err(GrievanceError::Unauthorized(message.into()))
            }
        }
    }

    /// Resolve the `Authorization` header to an actor.
    ///
    /// No header means an anonymous caller (`Ok(None)`); a header that is
    /// present but malformed or invalid is `Unauthorized`.
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<Option<Actor>, GrievanceError> {
        let Some(header) = auth_header else {
            return Ok(None);
        };
        let token = extract_token_from_header(Some(header))
            .ok_or_else(|| GrievanceError::Unauthorized("Malformed Authorization header".into()))?;
        Ok(Some(self.verify_token(token)?.actor()))
    }
}

fn unix_now() -> Result<u64, GrievanceError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| GrievanceError::Internal(format!("System time error: {}", e)))
}

/// Extract token from an Authorization header value
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let token = auth_header?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
