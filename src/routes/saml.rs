//! SAML protocol endpoints.
//!
//! - `/saml/login` - generates an AuthnRequest and redirects to the IdP
//! - `/saml/acs` - Assertion Consumer Service (handles the SAML Response)
//! - `/saml/metadata` - this SP's EntityDescriptor for IdP registration
//! - `/saml/logout` - destroys the session, redirecting to IdP SLO if offered

use axum::{
    Form,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tower_cookies::{
    Cookie, Cookies,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};
use uuid::Uuid;

use crate::{
    auth::AuthError,
    config::{SameSite, SessionConfig},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Site-relative path to return to after authentication.
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,

    #[serde(rename = "RelayState")]
    #[allow(dead_code)] // Part of the binding contract; correlation uses InResponseTo
    pub relay_state: Option<String>,
}

/// Initiate SP-initiated SSO: issue an AuthnRequest and redirect to the IdP.
#[tracing::instrument(name = "saml.login", skip(state))]
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect, AuthError> {
    match state.authenticator.login_redirect(query.return_to) {
        Ok(issued) => Ok(Redirect::to(&issued.url)),
        Err(e) => {
            state.report_auth_failure(&e);
            Err(e)
        }
    }
}

/// Assertion Consumer Service: validate the SAML Response, establish the
/// session, and send the browser back where it wanted to go.
#[tracing::instrument(name = "saml.acs", skip_all)]
pub async fn acs(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<AcsForm>,
) -> Result<Response, AuthError> {
    let (session, return_to) = match state
        .authenticator
        .consume_response(&form.saml_response)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            // Rejected responses never become sessions; surface and bail
            state.report_auth_failure(&e);
            return Err(e);
        }
    };

    let session_config = state.authenticator.session_config();
    cookies.add(session_cookie(session_config, session.id));

    tracing::info!(
        session_id = %session.id,
        subject = %session.subject,
        return_to = ?return_to,
        "SAML login completed"
    );

    // Only relative paths; anything else is an open redirect
    let redirect_to = return_to
        .filter(|url| url.starts_with('/') && !url.starts_with("//"))
        .unwrap_or_else(|| "/".to_string());

    Ok(Redirect::to(&redirect_to).into_response())
}

/// Publish this SP's metadata for IdP-side registration.
#[tracing::instrument(name = "saml.metadata", skip_all)]
pub async fn metadata(State(state): State<AppState>) -> Result<Response, AuthError> {
    let xml = state.authenticator.sp_metadata_xml()?;
    Ok(([(header::CONTENT_TYPE, "application/samlmetadata+xml")], xml).into_response())
}

/// Log out: destroy the local session, then redirect to the IdP's SLO
/// endpoint when its metadata advertises one, or home otherwise.
#[tracing::instrument(name = "saml.logout", skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Response, AuthError> {
    let session_config = state.authenticator.session_config().clone();

    let mut idp_redirect = None;
    if let Some(cookie) = cookies.get(&session_config.cookie_name)
        && let Ok(session_id) = cookie.value().parse::<Uuid>()
    {
        match state.authenticator.logout(session_id).await {
            Ok(url) => idp_redirect = url,
            Err(e) => {
                // Local logout still proceeds
                state.report_auth_failure(&e);
            }
        }
    }

    cookies.remove(removal_cookie(&session_config));

    Ok(Redirect::to(idp_redirect.as_deref().unwrap_or("/")).into_response())
}

/// Build the session cookie: HttpOnly always, Secure per config.
fn session_cookie(config: &SessionConfig, session_id: Uuid) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), session_id.to_string()))
        .path("/")
        .http_only(true)
        .secure(config.secure)
        .same_site(cookie_same_site(config.same_site))
        .max_age(CookieDuration::seconds(config.duration_secs as i64))
        .build()
}

fn removal_cookie(config: &SessionConfig) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), ""))
        .path("/")
        .build()
}

fn cookie_same_site(same_site: SameSite) -> CookieSameSite {
    match same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    }
}
