//! HTTP routes: the SAML protocol endpoints plus a protected
//! demonstration route showing the downstream handler contract.

mod saml;

use axum::{
    Extension, Json, Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use serde::Serialize;
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use crate::{middleware::SessionAttributes, state::AppState};

/// Authenticated identity as seen by a downstream handler.
#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub subject: String,
    pub session_index: Option<String>,
    pub attributes: Vec<AttributeEntry>,
}

#[derive(Debug, Serialize)]
pub struct AttributeEntry {
    pub name: String,
    pub values: Vec<String>,
}

/// Protected route: echoes the subject and attributes the gatekeeper
/// attached to the request context.
#[tracing::instrument(name = "whoami", skip_all)]
pub async fn whoami(Extension(session): Extension<SessionAttributes>) -> Json<WhoamiResponse> {
    let attributes = session
        .session()
        .attributes
        .iter()
        .map(|(name, values)| AttributeEntry {
            name: name.to_string(),
            values: values.to_vec(),
        })
        .collect();

    Json(WhoamiResponse {
        subject: session.subject().to_string(),
        session_index: session.session().session_index.clone(),
        attributes,
    })
}

/// Assemble the application router.
///
/// Everything under the gatekeeper layer requires a session; the SAML
/// endpoints themselves are necessarily public.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/whoami", get(whoami))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::require_session,
        ));

    Router::new()
        .route("/saml/login", get(saml::login))
        .route("/saml/acs", post(saml::acs))
        .route("/saml/metadata", get(saml::metadata))
        .route("/saml/logout", get(saml::logout))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.config.server.body_limit_bytes))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        auth::{
            MemorySessionStore, MetadataResolver, SamlAuthenticator, ServiceProviderIdentity,
            credentials::testutil::generate_test_certificate_pem,
            metadata::testutil::idp_metadata,
            validate::testutil::ResponseFixture,
        },
        config::{
            IdpConfig, ObservabilityConfig, PalisadeConfig, ServerConfig, SessionConfig,
            SpConfig, ValidationConfig,
        },
    };

    struct TestIdp {
        key: openssl::pkey::PKey<openssl::pkey::Private>,
        cert: openssl::x509::X509,
    }

    fn test_state() -> (AppState, TestIdp) {
        let sp_config = SpConfig {
            entity_id: "https://sp.example.com".to_string(),
            private_key_path: String::new(),
            certificate_path: String::new(),
            base_url: None,
            sign_requests: false,
            name_id_format: "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".to_string(),
            force_authn: false,
        };

        let (sp_cert_pem, sp_key_pem) = generate_test_certificate_pem("sp.example.com");
        let identity = Arc::new(
            ServiceProviderIdentity::from_pem(
                &sp_config.entity_id,
                sp_key_pem.as_bytes(),
                sp_cert_pem.as_bytes(),
            )
            .unwrap(),
        );

        let (idp_cert, idp_key) =
            crate::auth::credentials::testutil::generate_test_certificate("idp.example.com");
        let metadata = MetadataResolver::with_static(idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![idp_cert.clone()],
        ));

        // Non-HTTPS test harness; cookies must not be Secure-only
        let session_config = SessionConfig {
            secure: false,
            ..SessionConfig::default()
        };

        let authenticator = Arc::new(SamlAuthenticator::new(
            identity,
            metadata,
            Arc::new(MemorySessionStore::new()),
            sp_config.clone(),
            session_config.clone(),
            &ValidationConfig::default(),
        ));

        let config = PalisadeConfig {
            server: ServerConfig::default(),
            sp: sp_config,
            idp: IdpConfig {
                metadata_url: "https://idp.example.com/metadata".to_string(),
                refresh_interval_secs: 3600,
                fetch_timeout_secs: 10,
                require_https: true,
            },
            session: session_config,
            validation: ValidationConfig::default(),
            observability: ObservabilityConfig::default(),
        };

        (
            AppState::from_parts(config, authenticator),
            TestIdp {
                key: idp_key,
                cert: idp_cert,
            },
        )
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn metadata_endpoint_serves_entity_descriptor() {
        let (state, _) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/saml/metadata")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/samlmetadata+xml"
        );
        let body = body_string(response).await;
        assert!(body.contains("entityID=\"https://sp.example.com\""));
        assert!(body.contains("<md:AssertionConsumerService"));
    }

    #[tokio::test]
    async fn protected_route_redirects_to_idp_when_unauthenticated() {
        let (state, _) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("https://idp.example.com/sso?"));
        assert!(location.contains("SAMLRequest="));
    }

    #[tokio::test]
    async fn login_endpoint_redirects_to_idp() {
        let (state, _) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/saml/login?return_to=/dashboard")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("https://idp.example.com/sso?"));
    }

    #[tokio::test]
    async fn acs_establishes_session_and_whoami_sees_attributes() {
        let (state, idp) = test_state();
        let app = router(state.clone());

        // Start a login to register a pending request
        let issued = state.authenticator.login_redirect(Some("/dashboard".to_string())).unwrap();

        let saml_response = ResponseFixture::new(&issued.pending.id).build_b64(&idp.key, &idp.cert);
        let form = format!(
            "SAMLResponse={}&RelayState={}",
            url::form_urlencoded::byte_serialize(saml_response.as_bytes()).collect::<String>(),
            issued.pending.relay_state,
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/saml/acs")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/dashboard");

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(set_cookie.contains("HttpOnly"));
        let cookie_pair = set_cookie.split(';').next().unwrap().to_string();

        // The session now opens the protected route
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(header::COOKIE, cookie_pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("alice@example.com"));
        assert!(body.contains("Alice"));
    }

    #[tokio::test]
    async fn acs_rejects_invalid_response_without_creating_a_session() {
        let (state, _) = test_state();
        let hook_hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits = hook_hits.clone();
        let state = state.with_error_hook(Arc::new(move |_| {
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/saml/acs")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("SAMLResponse=bm90LXhtbA%3D%3D"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(hook_hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn logout_clears_the_cookie_and_offers_slo() {
        let (state, idp) = test_state();
        let app = router(state.clone());

        let issued = state.authenticator.login_redirect(None).unwrap();
        let saml_response = ResponseFixture::new(&issued.pending.id).build_b64(&idp.key, &idp.cert);
        let (session, _) = state
            .authenticator
            .consume_response(&saml_response)
            .await
            .unwrap();

        let cookie_pair = format!("{}={}", state.authenticator.cookie_name(), session.id);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/saml/logout")
                    .header(header::COOKIE, cookie_pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("https://idp.example.com/sso/slo?"));
    }
}
