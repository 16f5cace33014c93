//! HTTP error responses.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use crate::audit::AuditError;
use crate::auth::AuthError;
use crate::error::{Classify, FederationErrorKind};
use crate::queue::QueueError;
use crate::registry::RegistryError;
use crate::storage::DatabaseError;
use crate::sync::SyncError;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: FederationErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: FederationErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            kind,
            message: message.into(),
        }
    }

    /// Missing or invalid bearer credential.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: FederationErrorKind::Unauthorized,
            message: message.into(),
        }
    }
}

/// Status code for an error kind.
pub const fn status_for(kind: FederationErrorKind) -> StatusCode {
    match kind {
        FederationErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        FederationErrorKind::AuthFailure => StatusCode::UNAUTHORIZED,
        FederationErrorKind::Conflict => StatusCode::CONFLICT,
        FederationErrorKind::ProtocolMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        FederationErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        FederationErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        FederationErrorKind::Validation => StatusCode::BAD_REQUEST,
        FederationErrorKind::NotFound => StatusCode::NOT_FOUND,
    }
}

macro_rules! from_classified {
    ($($ty:ty),+ $(,)?) => {$(
        impl From<$ty> for ApiError {
            fn from(e: $ty) -> Self {
                Self::new(e.kind(), e.to_string())
            }
        }
    )+};
}

from_classified!(
    AuditError,
    DatabaseError,
    QueueError,
    RegistryError,
    SyncError
);

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingToken | AuthError::InvalidToken(_) => {
                Self::unauthenticated(e.to_string())
            }
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            kind: FederationErrorKind::Validation,
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(FederationErrorKind::Validation, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = if self.status.is_server_error() && self.kind != FederationErrorKind::Transient
        {
            error!(kind = ?self.kind, error = %self.message, "Request failed");
            "Internal server error".to_string()
        } else {
            warn!(kind = ?self.kind, status = self.status.as_u16(), error = %self.message, "Request rejected");
            self.message
        };

        let body = json!({
            "status": "error",
            "error": message,
            "kind": self.kind,
            "status_code": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_statuses() {
        assert_eq!(
            ApiError::from(QueueError::BadSignature("x".into())).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(SyncError::SchemaMismatch("x".into())).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(RegistryError::DuplicateInstance("peer.example".into())).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(DatabaseError::Query("disk".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bearer_problems_are_401_and_missing_capability_is_403() {
        assert_eq!(ApiError::from(AuthError::MissingToken).status, StatusCode::UNAUTHORIZED);
        let denied = AuthError::MissingCapability {
            actor: "user:bob".into(),
            capability: crate::auth::Capability::FederationAdmin,
        };
        assert_eq!(ApiError::from(denied).status, StatusCode::FORBIDDEN);
    }
}
