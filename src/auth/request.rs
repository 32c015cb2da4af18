//! AuthnRequest issuance and outstanding-request tracking.
//!
//! Request IDs come from the OS CSPRNG; a predictable ID generator would
//! let an attacker forge InResponseTo correlations. The pending table is
//! the replay gate: consumption is a test-and-set under one lock, so two
//! concurrent responses carrying the same ID cannot both pass.

use std::{collections::HashMap, io::Write, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use flate2::{Compression, write::DeflateEncoder};
use parking_lot::Mutex;
use rand::RngCore;

use crate::{
    auth::{
        credentials::ServiceProviderIdentity,
        metadata::BINDING_HTTP_POST,
        xmldsig::ALG_RSA_SHA256,
    },
    config::SpConfig,
};

/// Request construction errors.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Failed to encode AuthnRequest: {0}")]
    Encode(String),

    #[error("Failed to sign request: {0}")]
    Signing(String),
}

/// Why a pending-request consumption was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsumeError {
    /// Never issued, expired, or already swept.
    #[error("unknown or expired request ID")]
    Unknown,

    /// Consumed before; a second response with the same ID is a replay.
    #[error("request ID already consumed")]
    Replayed,
}

/// An outstanding AuthnRequest awaiting its response.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Request ID (also the expected InResponseTo value).
    pub id: String,

    /// When the AuthnRequest was issued.
    pub issued_at: DateTime<Utc>,

    /// Opaque RelayState sent alongside the request.
    pub relay_state: String,

    /// Where to send the browser after a successful login.
    pub return_to: Option<String>,
}

struct PendingEntry {
    request: PendingRequest,
    consumed: bool,
}

/// Table of outstanding request IDs.
///
/// Consumed entries are retained until their TTL passes so that a replayed
/// ID is reported as a replay rather than as unknown.
pub struct PendingStore {
    inner: Mutex<HashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl PendingStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    /// Register a freshly issued request.
    pub fn insert(&self, request: PendingRequest) {
        self.inner
            .lock()
            .insert(request.id.clone(), PendingEntry {
                request,
                consumed: false,
            });
    }

    /// Atomically check and mark a request ID as consumed.
    pub fn consume(&self, id: &str) -> Result<PendingRequest, ConsumeError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let Some(entry) = inner.get_mut(id) else {
            return Err(ConsumeError::Unknown);
        };

        if entry.consumed {
            return Err(ConsumeError::Replayed);
        }

        if now - entry.request.issued_at > self.ttl {
            // No longer live; drop it so the table cannot grow unbounded
            inner.remove(id);
            return Err(ConsumeError::Unknown);
        }

        entry.consumed = true;
        Ok(entry.request.clone())
    }

    /// Drop entries past their TTL, consumed or not.
    pub fn sweep(&self) {
        let cutoff = Utc::now() - self.ttl;
        self.inner
            .lock()
            .retain(|_, entry| entry.request.issued_at > cutoff);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// An issued AuthnRequest: the redirect URL plus its tracking record.
#[derive(Debug, Clone)]
pub struct IssuedRequest {
    /// Fully encoded IdP redirect URL.
    pub url: String,

    /// The registered pending request.
    pub pending: PendingRequest,
}

/// A POST-binding AuthnRequest.
#[derive(Debug, Clone)]
pub struct PostRequest {
    /// IdP SSO endpoint to post to.
    pub destination: String,

    /// Base64-encoded AuthnRequest XML.
    pub saml_request: String,

    /// RelayState form field value.
    pub relay_state: String,

    /// The registered pending request.
    pub pending: PendingRequest,
}

impl PostRequest {
    /// Auto-submitting HTML form carrying the request to the IdP.
    pub fn auto_submit_form(&self) -> String {
        format!(
            r#"<!DOCTYPE html>
<html><body onload="document.forms[0].submit()">
<form method="POST" action="{destination}">
<input type="hidden" name="SAMLRequest" value="{saml_request}" />
<input type="hidden" name="RelayState" value="{relay_state}" />
</form></body></html>"#,
            destination = self.destination,
            saml_request = self.saml_request,
            relay_state = self.relay_state,
        )
    }
}

/// Builds signed AuthnRequest messages and registers them in the pending
/// table.
pub struct RequestBuilder {
    identity: Arc<ServiceProviderIdentity>,
    config: SpConfig,
    pending: PendingStore,
}

impl RequestBuilder {
    pub fn new(
        identity: Arc<ServiceProviderIdentity>,
        config: SpConfig,
        pending_ttl: std::time::Duration,
    ) -> Self {
        Self {
            identity,
            config,
            pending: PendingStore::new(pending_ttl),
        }
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    /// Issue an AuthnRequest for the HTTP-Redirect binding.
    pub fn issue(
        &self,
        destination: &str,
        return_to: Option<String>,
    ) -> Result<IssuedRequest, RequestError> {
        let pending = self.track(return_to);
        let xml = self.authn_request_xml(&pending.id, destination);

        let encoded = deflate_b64(&xml)?;
        let url = self.redirect_url(destination, &encoded, &pending.relay_state)?;

        self.pending.insert(pending.clone());
        Ok(IssuedRequest { url, pending })
    }

    /// Issue an AuthnRequest for the HTTP-POST binding.
    pub fn issue_post(
        &self,
        destination: &str,
        return_to: Option<String>,
    ) -> Result<PostRequest, RequestError> {
        let pending = self.track(return_to);
        let xml = self.authn_request_xml(&pending.id, destination);

        let saml_request = STANDARD.encode(xml.as_bytes());
        let relay_state = pending.relay_state.clone();

        self.pending.insert(pending.clone());
        Ok(PostRequest {
            destination: destination.to_string(),
            saml_request,
            relay_state,
            pending,
        })
    }

    /// Build a LogoutRequest redirect URL for SP-initiated Single Logout.
    pub fn logout_url(
        &self,
        slo_destination: &str,
        name_id: &str,
        session_index: Option<&str>,
        relay_state: &str,
    ) -> Result<String, RequestError> {
        let id = generate_request_id();
        let issue_instant = saml_instant(Utc::now());

        let session_index_xml = session_index
            .map(|idx| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", xml_escape(idx)))
            .unwrap_or_default();

        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}">
<saml:Issuer>{issuer}</saml:Issuer>
<saml:NameID Format="{format}">{name_id}</saml:NameID>
{session_index_xml}</samlp:LogoutRequest>"#,
            destination = xml_escape(slo_destination),
            issuer = xml_escape(&self.config.entity_id),
            format = xml_escape(&self.config.name_id_format),
            name_id = xml_escape(name_id),
        );

        let encoded = deflate_b64(&xml)?;
        self.redirect_url(slo_destination, &encoded, relay_state)
    }

    fn track(&self, return_to: Option<String>) -> PendingRequest {
        PendingRequest {
            id: generate_request_id(),
            issued_at: Utc::now(),
            relay_state: random_token(),
            return_to,
        }
    }

    fn authn_request_xml(&self, request_id: &str, destination: &str) -> String {
        let issue_instant = saml_instant(Utc::now());
        let force_authn = if self.config.force_authn { "true" } else { "false" };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{request_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}" AssertionConsumerServiceURL="{acs_url}" ProtocolBinding="{post_binding}" ForceAuthn="{force_authn}">
<saml:Issuer>{issuer}</saml:Issuer>
<samlp:NameIDPolicy Format="{name_id_format}" AllowCreate="true"/>
</samlp:AuthnRequest>"#,
            destination = xml_escape(destination),
            acs_url = xml_escape(&self.config.acs_url()),
            post_binding = BINDING_HTTP_POST,
            issuer = xml_escape(&self.config.entity_id),
            name_id_format = xml_escape(&self.config.name_id_format),
        )
    }

    /// Build the redirect URL, signing the query string when configured.
    ///
    /// The detached signature covers `SAMLRequest=..&RelayState=..&SigAlg=..`
    /// exactly, per SAML 2.0 Bindings §3.4.4.1.
    fn redirect_url(
        &self,
        destination: &str,
        saml_request: &str,
        relay_state: &str,
    ) -> Result<String, RequestError> {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("SAMLRequest", saml_request);
        query.append_pair("RelayState", relay_state);

        let query = if self.config.sign_requests {
            query.append_pair("SigAlg", ALG_RSA_SHA256);
            let signed_part = query.finish();

            let signature = self
                .identity
                .sign_sha256(signed_part.as_bytes())
                .map_err(|e| RequestError::Signing(e.to_string()))?;

            let mut sig_param = url::form_urlencoded::Serializer::new(String::new());
            sig_param.append_pair("Signature", &STANDARD.encode(signature));
            format!("{}&{}", signed_part, sig_param.finish())
        } else {
            query.finish()
        };

        let separator = if destination.contains('?') { '&' } else { '?' };
        Ok(format!("{destination}{separator}{query}"))
    }
}

/// Generate a 128-bit random request ID from the OS CSPRNG.
///
/// The leading underscore keeps the value a valid XML NCName.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut id = String::with_capacity(33);
    id.push('_');
    for b in bytes {
        id.push_str(&format!("{b:02x}"));
    }
    id
}

/// Random opaque token for RelayState values.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// UTC instant in the `YYYY-MM-DDTHH:MM:SSZ` form SAML expects.
fn saml_instant(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// DEFLATE-compress and base64-encode a message for the redirect binding.
fn deflate_b64(xml: &str) -> Result<String, RequestError> {
    let mut compressed = Vec::new();
    {
        let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
        encoder
            .write_all(xml.as_bytes())
            .map_err(|e| RequestError::Encode(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| RequestError::Encode(e.to_string()))?;
    }
    Ok(STANDARD.encode(&compressed))
}

/// Escape text for inclusion in XML content or attribute values.
fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
