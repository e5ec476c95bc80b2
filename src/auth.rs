//! Bearer-token authentication and airport tenancy.
//!
//! Tokens are HS256 JWTs issued by the external login service. This module
//! only verifies them and turns the claims into an [`AuthUser`] that
//! handlers receive as an extractor.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::AppState;
use crate::error::{AppError, Result};

/// User roles, in ascending order of privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access to the user's airport.
    Leitor,
    /// Records field data: strikes, sightings, inspections.
    Operador,
    /// Manages the airport's records, including deletions.
    Gestor,
    /// Unrestricted, across all airports.
    Admin,
}

/// JWT claims accepted by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    /// Airport the user belongs to. Required for every role but admin.
    #[serde(default)]
    pub airport_id: Option<i64>,
    pub exp: u64,
}

/// Verification key and rules, built once at startup.
#[derive(Clone)]
pub struct AuthKeys {
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Check signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Rejected bearer token");
                AppError::Unauthorized
            })
    }
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub role: Role,
    pub airport_id: Option<i64>,
}

impl AuthUser {
    pub fn from_claims(claims: Claims) -> Result<Self> {
        if claims.role != Role::Admin && claims.airport_id.is_none() {
            return Err(AppError::Forbidden(
                "user is not bound to an airport".to_string(),
            ));
        }

        Ok(Self {
            subject: claims.sub,
            role: claims.role,
            airport_id: claims.airport_id,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Fail unless the caller has at least `role`.
    pub fn require(&self, role: Role) -> Result<()> {
        if self.role >= role {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role '{:?}' cannot perform this operation",
                self.role
            )))
        }
    }

    /// Resolve the airport filter for a request.
    ///
    /// Admins get what they asked for (`None` meaning every airport).
    /// Everyone else is pinned to their own airport, and asking for a
    /// different one is forbidden.
    pub fn scope(&self, requested: Option<i64>) -> Result<Option<i64>> {
        if self.is_admin() {
            return Ok(requested);
        }

        let own = self
            .airport_id
            .ok_or_else(|| AppError::Forbidden("user is not bound to an airport".to_string()))?;

        match requested {
            Some(other) if other != own => Err(AppError::Forbidden(format!(
                "no access to airport {other}"
            ))),
            _ => Ok(Some(own)),
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let claims = state.auth.verify(token.trim())?;
        AuthUser::from_claims(claims)
    }
}
