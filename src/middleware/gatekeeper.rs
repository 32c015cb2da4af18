//! Request gatekeeper.
//!
//! Intercepts requests to protected routes. With a live session, the
//! subject attributes ride along in the request extensions; without one,
//! the response is a redirect into the SP-initiated SSO flow that brings
//! the browser back to the original path afterwards.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    auth::{AuthError, session_store::Session},
    state::AppState,
};

/// Injected error handler, invoked synchronously on the request path for
/// every authentication failure before the error response is produced.
pub type ErrorHook = Arc<dyn Fn(&AuthError) + Send + Sync>;

/// Authenticated subject attributes attached to the request context.
///
/// Protected handlers read these via `Extension<SessionAttributes>`.
#[derive(Clone)]
pub struct SessionAttributes(Arc<Session>);

impl SessionAttributes {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(session))
    }

    /// The authenticated subject identifier.
    pub fn subject(&self) -> &str {
        &self.0.subject
    }

    /// First value of the named attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.0.attributes.first(name)
    }

    /// All values of the named attribute, in assertion order.
    pub fn attributes(&self, name: &str) -> &[String] {
        self.0.attributes.get(name).unwrap_or(&[])
    }

    /// The underlying session record.
    pub fn session(&self) -> &Session {
        &self.0
    }
}

/// Middleware guarding protected routes.
///
/// State machine per request: a resolvable session cookie forwards the
/// request downstream with attributes attached; anything else issues an
/// AuthnRequest and redirects to the IdP, with the original path as the
/// post-login target.
pub async fn require_session(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(cookie) = cookies.get(state.authenticator.cookie_name())
        && let Ok(session_id) = cookie.value().parse::<Uuid>()
    {
        match state.authenticator.resolve_session(session_id).await {
            Ok(session) => {
                request
                    .extensions_mut()
                    .insert(SessionAttributes::new(session));
                return next.run(request).await;
            }
            Err(e) => {
                // Stale cookie; fall through into re-authentication
                tracing::debug!(error = %e, "Session cookie did not resolve");
            }
        }
    }

    let return_to = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string());

    match state.authenticator.login_redirect(return_to) {
        Ok(issued) => AuthError::AuthRequired {
            redirect_url: issued.url,
        }
        .into_response(),
        Err(e) => {
            state.report_auth_failure(&e);
            e.into_response()
        }
    }
}
