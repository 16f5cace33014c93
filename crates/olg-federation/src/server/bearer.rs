//! Bearer token extraction for the admin API.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::ApiError;
use crate::auth::{Actor, AuthError};
use crate::service::FederationService;

/// The authenticated caller of an admin route.
///
/// Capability checks happen in the components, so a valid token with no
/// capabilities still gets through here and is refused (and audited) there.
#[derive(Debug, Clone)]
pub struct Caller(pub Actor);

impl FromRequestParts<FederationService> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &FederationService,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;

        let claims = state.jwt.validate(token)?;
        tracing::trace!(sub = %claims.sub, "Bearer token accepted");
        Ok(Self(Actor::User(claims.principal())))
    }
}
