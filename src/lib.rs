//! Palisade: a SAML 2.0 Service Provider.
//!
//! Implements the SP side of SAML Web Browser SSO end to end: IdP metadata
//! resolution with periodic refresh, signed AuthnRequest issuance over the
//! redirect and POST bindings, response validation (XML signatures,
//! status, replay, validity window, audience), cookie-backed sessions, and
//! an axum middleware that gates protected routes behind the flow.
//!
//! Use the binary for a standalone service, or embed the pieces:
//!
//! - [`auth::SamlAuthenticator`] drives the protocol.
//! - [`middleware::require_session`] guards routes; handlers read the
//!   subject via [`middleware::SessionAttributes`].
//! - [`routes::router`] wires the standard endpoint set.

pub mod auth;
pub mod config;
pub mod middleware;
pub mod observability;
pub mod routes;
pub mod state;

pub use auth::{
    Assertion, AttributeBag, AuthError, SamlAuthenticator, ServiceProviderIdentity, Session,
    ValidationError,
};
pub use config::PalisadeConfig;
pub use state::{AppState, StartupError};
