//! The HTTP boundary error for authentication flows.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::auth::{
    metadata::FetchError, request::RequestError, session_store::SessionError,
    validate::ValidationError,
};

/// Errors surfaced at the request-handling boundary.
///
/// Per-request failures map to 4xx responses; nothing in here is fatal to
/// the process. Validation failures keep their step-specific kind so the
/// error hook and the logs can tell a replay from a bad signature.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No session; the caller must authenticate at the IdP first.
    #[error("authentication required")]
    AuthRequired { redirect_url: String },

    /// Session cookie did not resolve to a live session.
    #[error("session not found")]
    SessionNotFound,

    /// Session exists but has expired.
    #[error("session expired")]
    SessionExpired,

    /// The SAML Response failed validation.
    #[error("SAML response rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Access denied.
    #[error("access forbidden: {0}")]
    Forbidden(String),

    /// Internal error during authentication.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable code for logs and error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::AuthRequired { .. } => "auth_required",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::SessionExpired => "session_expired",
            AuthError::Validation(e) => e.kind(),
            AuthError::Forbidden(_) => "forbidden",
            AuthError::Internal(_) => "internal_error",
        }
    }
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => AuthError::SessionNotFound,
            SessionError::Expired => AuthError::SessionExpired,
        }
    }
}

impl From<FetchError> for AuthError {
    fn from(e: FetchError) -> Self {
        AuthError::Internal(format!("IdP metadata unavailable: {e}"))
    }
}

impl From<RequestError> for AuthError {
    fn from(e: RequestError) -> Self {
        AuthError::Internal(format!("Failed to build AuthnRequest: {e}"))
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::AuthRequired { redirect_url } => {
                // Not an error to the browser, just the start of the flow
                return Response::builder()
                    .status(StatusCode::FOUND)
                    .header("Location", redirect_url.as_str())
                    .body(axum::body::Body::empty())
                    .unwrap();
            }
            AuthError::SessionNotFound => (StatusCode::UNAUTHORIZED, "Session not found"),
            AuthError::SessionExpired => (StatusCode::UNAUTHORIZED, "Session has expired"),
            AuthError::Validation(_) => {
                // Step-specific detail goes to the logs and the error hook,
                // never to the peer
                (StatusCode::FORBIDDEN, "SAML response rejected")
            }
            AuthError::Forbidden(_) => (StatusCode::FORBIDDEN, "Access forbidden"),
            AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        };

        let body = serde_json::json!({
            "error": {
                "type": "authentication_error",
                "code": self.code(),
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_required_is_a_redirect() {
        let error = AuthError::AuthRequired {
            redirect_url: "https://idp.example.com/sso?SAMLRequest=x".to_string(),
        };
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get("Location").unwrap(),
            "https://idp.example.com/sso?SAMLRequest=x"
        );
    }

    #[test]
    fn session_errors_are_401() {
        assert_eq!(
            AuthError::SessionNotFound.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::SessionExpired.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn validation_failures_are_403_with_the_step_kind() {
        let error = AuthError::Validation(ValidationError::Replay("_id".to_string()));
        assert_eq!(error.code(), "replay");
        assert_eq!(error.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn session_error_conversion() {
        assert!(matches!(
            AuthError::from(SessionError::Expired),
            AuthError::SessionExpired
        ));
    }
}
