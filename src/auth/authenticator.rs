//! The SAML service provider authenticator.
//!
//! Ties the components together: the credential store signs requests, the
//! metadata resolver supplies trust anchors and endpoints, the request
//! builder tracks outstanding logins, the validator checks responses, and
//! the session store holds the results. Route handlers and the gatekeeper
//! middleware only ever talk to this type.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::{
    auth::{
        AuthError,
        assertion::Assertion,
        credentials::ServiceProviderIdentity,
        metadata::{BINDING_HTTP_POST, MetadataResolver},
        request::{IssuedRequest, RequestBuilder, random_token},
        session_store::{Session, SessionError, SharedSessionStore},
        validate::ResponseValidator,
    },
    config::{SessionConfig, SpConfig, ValidationConfig},
};

/// SAML 2.0 service provider authenticator handling SP-initiated SSO.
pub struct SamlAuthenticator {
    identity: Arc<ServiceProviderIdentity>,
    metadata: Arc<MetadataResolver>,
    requests: RequestBuilder,
    validator: ResponseValidator,
    sessions: SharedSessionStore,
    sp_config: SpConfig,
    session_config: SessionConfig,
}

impl SamlAuthenticator {
    pub fn new(
        identity: Arc<ServiceProviderIdentity>,
        metadata: Arc<MetadataResolver>,
        sessions: SharedSessionStore,
        sp_config: SpConfig,
        session_config: SessionConfig,
        validation: &ValidationConfig,
    ) -> Self {
        let requests = RequestBuilder::new(
            identity.clone(),
            sp_config.clone(),
            std::time::Duration::from_secs(validation.pending_ttl_secs),
        );
        let validator = ResponseValidator::new(
            sp_config.entity_id.clone(),
            sp_config.acs_url(),
            validation,
        );

        Self {
            identity,
            metadata,
            requests,
            validator,
            sessions,
            sp_config,
            session_config,
        }
    }

    /// Issue an AuthnRequest and return the IdP redirect URL.
    ///
    /// `return_to` is kept with the pending request and honored after the
    /// callback; only site-relative paths survive, anything else is an
    /// open-redirect vector and gets dropped.
    pub fn login_redirect(&self, return_to: Option<String>) -> Result<IssuedRequest, AuthError> {
        let metadata = self.metadata.current();
        let destination = metadata.sso_url()?;

        let issued = self
            .requests
            .issue(destination, sanitize_return_to(return_to))?;

        tracing::debug!(
            request_id = %issued.pending.id,
            destination = %destination,
            "Issued AuthnRequest"
        );

        Ok(issued)
    }

    /// Validate a SAML Response from the ACS endpoint and establish a
    /// session.
    ///
    /// Returns the session and the sanitized post-login redirect path.
    pub async fn consume_response(
        &self,
        saml_response: &str,
    ) -> Result<(Session, Option<String>), AuthError> {
        // Snapshot taken once; a metadata refresh mid-validation cannot
        // change the certificate set under us
        let metadata = self.metadata.current();

        let validated = self.validator.validate(
            saml_response,
            &metadata,
            self.requests.pending(),
            None,
        )?;

        let session = self.establish(&validated.assertion).await?;
        Ok((session, validated.pending.return_to))
    }

    /// Convert a validated assertion into a stored session.
    ///
    /// The session never outlives the assertion: expiry is the configured
    /// duration clamped to NotOnOrAfter.
    pub async fn establish(&self, assertion: &Assertion) -> Result<Session, AuthError> {
        let now = Utc::now();
        let mut expires_at = now + Duration::seconds(self.session_config.duration_secs as i64);
        if let Some(not_on_or_after) = assertion.not_on_or_after
            && not_on_or_after < expires_at
        {
            expires_at = not_on_or_after;
        }

        let session = Session {
            id: Uuid::new_v4(),
            subject: assertion.subject.clone(),
            name_id_format: assertion.name_id_format.clone(),
            session_index: assertion.session_index.clone(),
            attributes: assertion.attributes.clone(),
            created_at: now,
            expires_at,
        };

        self.sessions
            .create_session(session.clone())
            .await
            .map_err(|e| AuthError::Internal(format!("Failed to store session: {e}")))?;

        tracing::info!(
            session_id = %session.id,
            subject = %session.subject,
            expires_at = %session.expires_at,
            "Session established"
        );

        Ok(session)
    }

    /// Resolve a session token, enforcing expiry.
    pub async fn resolve_session(&self, id: Uuid) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_session(id)
            .await?
            .ok_or(SessionError::NotFound)?;

        if session.is_expired() {
            let _ = self.sessions.delete_session(id).await;
            return Err(SessionError::Expired);
        }

        Ok(session)
    }

    /// Destroy a session; when the IdP advertises a SLO endpoint, return
    /// the LogoutRequest redirect URL for it.
    pub async fn logout(&self, session_id: Uuid) -> Result<Option<String>, AuthError> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .map_err(|e| AuthError::Internal(format!("Session lookup failed: {e}")))?;

        let _ = self.sessions.delete_session(session_id).await;

        let metadata = self.metadata.current();
        let (Some(slo_url), Some(session)) = (metadata.slo_redirect_url.as_deref(), session)
        else {
            return Ok(None);
        };

        let url = self.requests.logout_url(
            slo_url,
            &session.subject,
            session.session_index.as_deref(),
            &random_token(),
        )?;

        tracing::debug!(subject = %session.subject, "Redirecting to IdP SLO endpoint");
        Ok(Some(url))
    }

    /// Generate this SP's metadata XML for IdP-side registration.
    pub fn sp_metadata_xml(&self) -> Result<String, AuthError> {
        let cert_b64 = self
            .identity
            .certificate_b64()
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        let signed = if self.sp_config.sign_requests { "true" } else { "false" };

        Ok(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}">
  <md:SPSSODescriptor AuthnRequestsSigned="{signed}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{cert_b64}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:NameIDFormat>{name_id_format}</md:NameIDFormat>
    <md:AssertionConsumerService
        Binding="{post_binding}"
        Location="{acs_url}"
        index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
            entity_id = self.sp_config.entity_id,
            name_id_format = self.sp_config.name_id_format,
            post_binding = BINDING_HTTP_POST,
            acs_url = self.sp_config.acs_url(),
        ))
    }

    /// Drop expired pending requests and sessions.
    pub async fn sweep(&self) {
        self.requests.pending().sweep();
        let _ = self.sessions.cleanup().await;
    }

    /// Spawn the periodic cleanup task.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let authenticator = Arc::clone(self);
        let period = std::time::Duration::from_secs(self.session_config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                authenticator.sweep().await;
            }
        })
    }

    pub fn cookie_name(&self) -> &str {
        &self.session_config.cookie_name
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn sp_entity_id(&self) -> &str {
        &self.sp_config.entity_id
    }

    pub fn acs_url(&self) -> String {
        self.sp_config.acs_url()
    }
}

/// Keep only site-relative redirect targets.
fn sanitize_return_to(return_to: Option<String>) -> Option<String> {
    return_to.filter(|url| url.starts_with('/') && !url.starts_with("//"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        credentials::testutil::generate_test_certificate_pem,
        metadata::testutil::idp_metadata,
        session_store::MemorySessionStore,
        validate::testutil::ResponseFixture,
    };

    fn sp_config() -> SpConfig {
        SpConfig {
            entity_id: "https://sp.example.com".to_string(),
            private_key_path: String::new(),
            certificate_path: String::new(),
            base_url: None,
            sign_requests: false,
            name_id_format: "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".to_string(),
            force_authn: false,
        }
    }

    /// Authenticator wired to a static metadata snapshot plus the IdP key
    /// pair that signs fixture responses.
    fn authenticator() -> (
        SamlAuthenticator,
        openssl::pkey::PKey<openssl::pkey::Private>,
        openssl::x509::X509,
    ) {
        let (sp_cert_pem, sp_key_pem) = generate_test_certificate_pem("sp.example.com");
        let identity = Arc::new(
            ServiceProviderIdentity::from_pem(
                "https://sp.example.com",
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

        let authenticator = SamlAuthenticator::new(
            identity,
            metadata,
            Arc::new(MemorySessionStore::new()),
            sp_config(),
            SessionConfig::default(),
            &ValidationConfig::default(),
        );

        (authenticator, idp_key, idp_cert)
    }

    #[tokio::test]
    async fn full_login_flow_round_trip() {
        let (authenticator, idp_key, idp_cert) = authenticator();

        let issued = authenticator
            .login_redirect(Some("/dashboard".to_string()))
            .unwrap();
        assert!(issued.url.starts_with("https://idp.example.com/sso?"));

        let raw = ResponseFixture::new(&issued.pending.id).build_b64(&idp_key, &idp_cert);
        let (session, return_to) = authenticator.consume_response(&raw).await.unwrap();

        assert_eq!(session.subject, "alice@example.com");
        assert_eq!(session.attributes.first("cn"), Some("Alice"));
        assert_eq!(return_to.as_deref(), Some("/dashboard"));

        let resolved = authenticator.resolve_session(session.id).await.unwrap();
        assert_eq!(resolved.subject, "alice@example.com");
    }

    #[tokio::test]
    async fn replayed_response_is_rejected() {
        let (authenticator, idp_key, idp_cert) = authenticator();

        let issued = authenticator.login_redirect(None).unwrap();
        let raw = ResponseFixture::new(&issued.pending.id).build_b64(&idp_key, &idp_cert);

        assert!(authenticator.consume_response(&raw).await.is_ok());
        let err = authenticator.consume_response(&raw).await.unwrap_err();
        assert_eq!(err.code(), "replay");
    }

    #[tokio::test]
    async fn session_expiry_is_clamped_to_assertion_window() {
        let (authenticator, idp_key, idp_cert) = authenticator();

        let issued = authenticator.login_redirect(None).unwrap();
        let mut fixture = ResponseFixture::new(&issued.pending.id);
        // The assertion expires long before the configured session duration
        fixture.not_on_or_after = Utc::now() + Duration::minutes(5);
        let raw = fixture.build_b64(&idp_key, &idp_cert);

        let (session, _) = authenticator.consume_response(&raw).await.unwrap();
        assert!(session.expires_at <= Utc::now() + Duration::minutes(5) + Duration::seconds(1));
    }

    #[tokio::test]
    async fn absolute_return_to_is_dropped() {
        let (authenticator, _, _) = authenticator();

        let issued = authenticator
            .login_redirect(Some("https://evil.example.com/phish".to_string()))
            .unwrap();
        assert!(issued.pending.return_to.is_none());

        let issued = authenticator
            .login_redirect(Some("//evil.example.com".to_string()))
            .unwrap();
        assert!(issued.pending.return_to.is_none());
    }

    #[tokio::test]
    async fn expired_session_resolution_fails_and_evicts() {
        let (authenticator, idp_key, idp_cert) = authenticator();

        let issued = authenticator.login_redirect(None).unwrap();
        let mut fixture = ResponseFixture::new(&issued.pending.id);
        fixture.not_on_or_after = Utc::now() + Duration::seconds(1);
        let raw = fixture.build_b64(&idp_key, &idp_cert);

        let (session, _) = authenticator.consume_response(&raw).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(matches!(
            authenticator.resolve_session(session.id).await,
            Err(SessionError::Expired)
        ));
        // A second lookup no longer finds the record at all
        assert!(matches!(
            authenticator.resolve_session(session.id).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn logout_returns_the_slo_redirect() {
        let (authenticator, idp_key, idp_cert) = authenticator();

        let issued = authenticator.login_redirect(None).unwrap();
        let raw = ResponseFixture::new(&issued.pending.id).build_b64(&idp_key, &idp_cert);
        let (session, _) = authenticator.consume_response(&raw).await.unwrap();

        let slo = authenticator.logout(session.id).await.unwrap();
        let slo = slo.expect("metadata advertises a SLO endpoint");
        assert!(slo.starts_with("https://idp.example.com/sso/slo?"));
        assert!(slo.contains("SAMLRequest="));

        // Session is gone regardless of what the IdP does next
        assert!(matches!(
            authenticator.resolve_session(session.id).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn logout_without_session_is_local_only() {
        let (authenticator, _, _) = authenticator();
        let slo = authenticator.logout(Uuid::new_v4()).await.unwrap();
        assert!(slo.is_none());
    }

    #[test]
    fn sp_metadata_lists_acs_and_certificate() {
        let (authenticator, _, _) = authenticator();
        let metadata = authenticator.sp_metadata_xml().unwrap();

        assert!(metadata.contains("entityID=\"https://sp.example.com\""));
        assert!(metadata.contains("<md:AssertionConsumerService"));
        assert!(metadata.contains("Location=\"https://sp.example.com/saml/acs\""));
        assert!(metadata.contains("<ds:X509Certificate>"));
        assert!(metadata.contains("AuthnRequestsSigned=\"false\""));
        assert!(!metadata.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn sweep_clears_expired_pending_requests() {
        let (authenticator, _, _) = authenticator();

        let _ = authenticator.login_redirect(None).unwrap();
        assert_eq!(authenticator.requests.pending().len(), 1);

        authenticator.sweep().await;
        // Fresh entries survive a sweep
        assert_eq!(authenticator.requests.pending().len(), 1);
    }
}
