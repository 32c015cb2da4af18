//! SAML Response validation.
//!
//! The pipeline runs in a fixed order and short-circuits on the first
//! failure: transport decoding, XML parsing, signature verification against
//! the current metadata snapshot, status check, InResponseTo correlation
//! (the replay gate), validity window, audience restriction, and finally
//! subject/attribute extraction. Every failure mode carries its own error
//! variant; a rejected response is always attributable to one step.

use std::io::Read;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use flate2::read::DeflateDecoder;
use quick_xml::{Reader, events::Event};

use crate::{
    auth::{
        assertion::{Assertion, AttributeBag},
        metadata::IdpMetadata,
        request::{ConsumeError, PendingRequest, PendingStore},
        xmldsig::{self, DsigError},
    },
    config::ValidationConfig,
};

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Response validation failures, one variant per pipeline step.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("signature rejected: {0}")]
    Signature(String),

    #[error("response status is not success: {0}")]
    StatusNotSuccess(String),

    #[error("response does not match a known request: {0}")]
    UnknownRequest(String),

    #[error("request ID already consumed: {0}")]
    Replay(String),

    #[error("assertion validity window has passed")]
    Expired,

    #[error("assertion is not yet valid")]
    NotYetValid,

    #[error("audience restriction does not include this SP (found: {found:?})")]
    AudienceMismatch { found: Vec<String> },
}

impl ValidationError {
    /// Stable kind label for logs and the error hook.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Signature(_) => "signature",
            Self::StatusNotSuccess(_) => "status",
            Self::UnknownRequest(_) => "unknown-request",
            Self::Replay(_) => "replay",
            Self::Expired => "expired",
            Self::NotYetValid => "not-yet-valid",
            Self::AudienceMismatch { .. } => "audience",
        }
    }
}

/// The outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedResponse {
    /// The validated assertion.
    pub assertion: Assertion,

    /// The pending request the response answered, now consumed.
    pub pending: PendingRequest,
}

/// Validates SAML Responses against metadata and the pending-request table.
pub struct ResponseValidator {
    sp_entity_id: String,
    acs_url: String,
    clock_skew: Duration,
    allow_sha1: bool,
}

impl ResponseValidator {
    pub fn new(sp_entity_id: String, acs_url: String, config: &ValidationConfig) -> Self {
        Self {
            sp_entity_id,
            acs_url,
            clock_skew: Duration::seconds(config.clock_skew_secs as i64),
            allow_sha1: config.allow_sha1,
        }
    }

    /// Validate a base64-encoded SAML Response.
    ///
    /// `expected_request_id` pins the response to one specific outstanding
    /// request; without it, any live pending request with a matching
    /// InResponseTo is accepted.
    pub fn validate(
        &self,
        raw_response: &str,
        metadata: &IdpMetadata,
        pending: &PendingStore,
        expected_request_id: Option<&str>,
    ) -> Result<ValidatedResponse, ValidationError> {
        // 1. Transport decoding
        let xml = decode_transport(raw_response)?;

        // 2. Parse; this also rejects responses without exactly one assertion
        let parsed = parse_response(&xml)?;
        let assertion = parsed.single_assertion()?;

        // 3. Signature over the element we process, verified against the
        //    metadata snapshot taken by the caller
        let verified = xmldsig::verified_reference_ids(
            &xml,
            &metadata.signing_certs,
            self.allow_sha1,
        )
        .map_err(map_dsig_error)?;

        let covered = verified.iter().any(|id| *id == parsed.id)
            || verified.iter().any(|id| *id == assertion.id);
        if !covered {
            return Err(ValidationError::Signature(
                "no trusted signature covers the processed element".to_string(),
            ));
        }

        // Origin cross-check: the signature proves possession of an IdP key,
        // the issuer must name that IdP
        for issuer in [&parsed.issuer, &assertion.issuer].into_iter().flatten() {
            if *issuer != metadata.entity_id {
                return Err(ValidationError::Signature(format!(
                    "issuer '{issuer}' does not match IdP entity ID '{}'",
                    metadata.entity_id
                )));
            }
        }

        // 4. Status
        match parsed.status_code.as_deref() {
            Some(STATUS_SUCCESS) => {}
            Some(code) => return Err(ValidationError::StatusNotSuccess(code.to_string())),
            None => {
                return Err(ValidationError::StatusNotSuccess(
                    "missing StatusCode".to_string(),
                ));
            }
        }

        if let Some(destination) = &parsed.destination
            && *destination != self.acs_url
        {
            return Err(ValidationError::Malformed(format!(
                "destination '{destination}' is not this SP's ACS URL"
            )));
        }

        // 5. InResponseTo correlation; consumption is the atomic replay gate
        let in_response_to = parsed.in_response_to.clone().ok_or_else(|| {
            ValidationError::UnknownRequest(
                "missing InResponseTo (IdP-initiated responses are not accepted)".to_string(),
            )
        })?;

        if let Some(expected) = expected_request_id
            && expected != in_response_to
        {
            return Err(ValidationError::UnknownRequest(in_response_to));
        }

        let pending_request = pending.consume(&in_response_to).map_err(|e| match e {
            ConsumeError::Unknown => ValidationError::UnknownRequest(in_response_to.clone()),
            ConsumeError::Replayed => ValidationError::Replay(in_response_to.clone()),
        })?;

        // 6. Validity window with clock-skew tolerance
        let now = Utc::now();
        if let Some(not_on_or_after) = assertion.not_on_or_after
            && now - self.clock_skew >= not_on_or_after
        {
            return Err(ValidationError::Expired);
        }
        if let Some(not_before) = assertion.not_before
            && now + self.clock_skew < not_before
        {
            return Err(ValidationError::NotYetValid);
        }

        // 7. Audience restriction, when the assertion carries one
        if !assertion.audiences.is_empty()
            && !assertion.audiences.iter().any(|a| *a == self.sp_entity_id)
        {
            return Err(ValidationError::AudienceMismatch {
                found: assertion.audiences.clone(),
            });
        }

        // 8. Subject and attribute extraction
        let subject = assertion
            .name_id
            .clone()
            .ok_or_else(|| ValidationError::Malformed("assertion has no NameID".to_string()))?;

        let issuer = assertion
            .issuer
            .clone()
            .or_else(|| parsed.issuer.clone())
            .unwrap_or_default();

        Ok(ValidatedResponse {
            assertion: Assertion {
                id: assertion.id.clone(),
                issuer,
                subject,
                name_id_format: assertion.name_id_format.clone(),
                session_index: assertion.session_index.clone(),
                not_before: assertion.not_before,
                not_on_or_after: assertion.not_on_or_after,
                audiences: assertion.audiences.clone(),
                attributes: assertion.attributes.clone(),
            },
            pending: pending_request,
        })
    }
}

fn map_dsig_error(e: DsigError) -> ValidationError {
    match e {
        DsigError::Xml(msg) => ValidationError::Malformed(msg),
        other => ValidationError::Signature(other.to_string()),
    }
}

/// Decode the transport encoding: base64, with DEFLATE for messages that
/// arrived through the redirect binding.
fn decode_transport(raw: &str) -> Result<String, ValidationError> {
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|e| ValidationError::Malformed(format!("invalid base64: {e}")))?;

    if let Ok(text) = String::from_utf8(bytes.clone())
        && text.trim_start().starts_with('<')
    {
        return Ok(text);
    }

    let mut inflated = String::new();
    DeflateDecoder::new(&bytes[..])
        .read_to_string(&mut inflated)
        .map_err(|e| ValidationError::Malformed(format!("neither XML nor DEFLATE: {e}")))?;
    Ok(inflated)
}

#[derive(Debug, Default)]
struct ParsedResponse {
    id: String,
    in_response_to: Option<String>,
    destination: Option<String>,
    issuer: Option<String>,
    status_code: Option<String>,
    assertions: Vec<ParsedAssertion>,
}

impl ParsedResponse {
    /// The one assertion this response must carry.
    ///
    /// Processing exactly one assertion removes the ambiguity signature
    /// wrapping relies on: there is never a second assertion for a
    /// confused extractor to pick up.
    fn single_assertion(&self) -> Result<&ParsedAssertion, ValidationError> {
        match self.assertions.as_slice() {
            [one] => Ok(one),
            [] => Err(ValidationError::Malformed(
                "response carries no assertion".to_string(),
            )),
            _ => Err(ValidationError::Malformed(format!(
                "expected exactly one assertion, found {}",
                self.assertions.len()
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct ParsedAssertion {
    id: String,
    issuer: Option<String>,
    name_id: Option<String>,
    name_id_format: Option<String>,
    session_index: Option<String>,
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
    audiences: Vec<String>,
    attributes: AttributeBag,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValidationError::Malformed(format!("invalid timestamp '{value}': {e}")))
}

/// Streaming parse of a Response document.
fn parse_response(xml: &str) -> Result<ParsedResponse, ValidationError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut response = ParsedResponse::default();
    let mut assertion: Option<ParsedAssertion> = None;
    let mut current_element = String::new();
    let mut current_attr_name: Option<String> = None;
    let mut current_attr_values: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                current_element = name.clone();

                if !saw_root {
                    if name != "Response" {
                        return Err(ValidationError::Malformed(format!(
                            "root element is '{name}', expected Response"
                        )));
                    }
                    saw_root = true;
                }

                match name.as_str() {
                    "Response" => {
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value).to_string();
                            match attr.key.as_ref() {
                                b"ID" => response.id = value,
                                b"InResponseTo" => response.in_response_to = Some(value),
                                b"Destination" => response.destination = Some(value),
                                _ => {}
                            }
                        }
                    }
                    "Assertion" => {
                        if assertion.is_some() {
                            return Err(ValidationError::Malformed(
                                "nested assertions".to_string(),
                            ));
                        }
                        let mut parsed = ParsedAssertion::default();
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"ID" {
                                parsed.id = String::from_utf8_lossy(&attr.value).to_string();
                            }
                        }
                        assertion = Some(parsed);
                    }
                    "StatusCode" => {
                        // Only the top-level StatusCode carries the outcome;
                        // nested codes refine a failure
                        if response.status_code.is_none() {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"Value" {
                                    response.status_code =
                                        Some(String::from_utf8_lossy(&attr.value).to_string());
                                }
                            }
                        }
                    }
                    "NameID" => {
                        if let Some(assertion) = assertion.as_mut() {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"Format" {
                                    assertion.name_id_format =
                                        Some(String::from_utf8_lossy(&attr.value).to_string());
                                }
                            }
                        }
                    }
                    "Conditions" => {
                        if let Some(assertion) = assertion.as_mut() {
                            for attr in e.attributes().flatten() {
                                let value = String::from_utf8_lossy(&attr.value).to_string();
                                match attr.key.as_ref() {
                                    b"NotBefore" => {
                                        assertion.not_before = Some(parse_timestamp(&value)?)
                                    }
                                    b"NotOnOrAfter" => {
                                        assertion.not_on_or_after = Some(parse_timestamp(&value)?)
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                    "AuthnStatement" => {
                        if let Some(assertion) = assertion.as_mut() {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"SessionIndex" {
                                    assertion.session_index =
                                        Some(String::from_utf8_lossy(&attr.value).to_string());
                                }
                            }
                        }
                    }
                    "Attribute" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Name" {
                                current_attr_name =
                                    Some(String::from_utf8_lossy(&attr.value).to_string());
                                current_attr_values.clear();
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| ValidationError::Malformed(e.to_string()))?
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                match current_element.as_str() {
                    "Issuer" => {
                        if let Some(assertion) = assertion.as_mut() {
                            assertion.issuer = Some(text);
                        } else {
                            response.issuer = Some(text);
                        }
                    }
                    "NameID" => {
                        if let Some(assertion) = assertion.as_mut() {
                            assertion.name_id = Some(text);
                        }
                    }
                    "Audience" => {
                        if let Some(assertion) = assertion.as_mut() {
                            assertion.audiences.push(text);
                        }
                    }
                    "AttributeValue" => current_attr_values.push(text),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "Assertion" => {
                        if let Some(parsed) = assertion.take() {
                            if parsed.id.is_empty() {
                                return Err(ValidationError::Malformed(
                                    "assertion has no ID".to_string(),
                                ));
                            }
                            response.assertions.push(parsed);
                        }
                    }
                    "Attribute" => {
                        if let Some(attr_name) = current_attr_name.take() {
                            if let Some(assertion) = assertion.as_mut() {
                                assertion.attributes.insert(
                                    attr_name,
                                    std::mem::take(&mut current_attr_values),
                                );
                            }
                        }
                    }
                    _ => {}
                }
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ValidationError::Malformed(e.to_string())),
            _ => {}
        }
    }

    if !saw_root {
        return Err(ValidationError::Malformed("empty document".to_string()));
    }
    if response.id.is_empty() {
        return Err(ValidationError::Malformed("response has no ID".to_string()));
    }

    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        testutil::{ResponseFixture, SignaturePlacement},
        *,
    };
    use crate::auth::{
        credentials::testutil::generate_test_certificate,
        metadata::testutil::idp_metadata,
        request::PendingRequest,
    };

    fn validator() -> ResponseValidator {
        ResponseValidator::new(
            "https://sp.example.com".to_string(),
            "https://sp.example.com/saml/acs".to_string(),
            &ValidationConfig::default(),
        )
    }

    fn pending_store_with(id: &str) -> PendingStore {
        let store = PendingStore::new(std::time::Duration::from_secs(300));
        store.insert(PendingRequest {
            id: id.to_string(),
            issued_at: Utc::now(),
            relay_state: "rs".to_string(),
            return_to: Some("/dashboard".to_string()),
        });
        store
    }

    #[test]
    fn valid_response_yields_subject_and_attributes() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let raw = ResponseFixture::new("_request-1").build_b64(&key, &cert);
        let validated = validator()
            .validate(&raw, &metadata, &pending, None)
            .unwrap();

        assert_eq!(validated.assertion.subject, "alice@example.com");
        assert_eq!(validated.assertion.issuer, "https://idp.example.com");
        assert_eq!(validated.assertion.attributes.first("cn"), Some("Alice"));
        assert_eq!(
            validated.assertion.attributes.get("groups"),
            Some(&["staff".to_string(), "admins".to_string()][..])
        );
        assert_eq!(validated.assertion.session_index.as_deref(), Some("session-1"));
        assert_eq!(validated.pending.return_to.as_deref(), Some("/dashboard"));
    }

    #[test]
    fn assertion_level_signature_is_accepted() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let mut fixture = ResponseFixture::new("_request-1");
        fixture.placement = SignaturePlacement::Assertion;
        let raw = fixture.build_b64(&key, &cert);

        assert!(validator().validate(&raw, &metadata, &pending, None).is_ok());
    }

    #[test]
    fn second_delivery_is_a_replay() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let raw = ResponseFixture::new("_request-1").build_b64(&key, &cert);
        let v = validator();

        assert!(v.validate(&raw, &metadata, &pending, None).is_ok());
        assert!(matches!(
            v.validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Replay(_))
        ));
    }

    #[test]
    fn tampered_content_fails_signature_despite_valid_status() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let xml = ResponseFixture::new("_request-1").build(&key, &cert);
        let tampered = xml.replace("alice@example.com", "mallory@example.com");
        let raw = STANDARD.encode(tampered);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Signature(_))
        ));
    }

    #[test]
    fn unsigned_response_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let mut fixture = ResponseFixture::new("_request-1");
        fixture.placement = SignaturePlacement::None;
        let raw = fixture.build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Signature(_))
        ));
    }

    #[test]
    fn signature_from_untrusted_key_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let (trusted_cert, _) = generate_test_certificate("other-idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![trusted_cert],
        );
        let pending = pending_store_with("_request-1");

        let raw = ResponseFixture::new("_request-1").build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Signature(_))
        ));
    }

    #[test]
    fn expired_assertion_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let mut fixture = ResponseFixture::new("_request-1");
        fixture.not_before = Utc::now() - Duration::minutes(30);
        fixture.not_on_or_after = Utc::now() - Duration::minutes(10);
        let raw = fixture.build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Expired)
        ));
    }

    #[test]
    fn expiry_within_clock_skew_is_tolerated() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        // 30 seconds past NotOnOrAfter, within the default 90-second skew
        let mut fixture = ResponseFixture::new("_request-1");
        fixture.not_on_or_after = Utc::now() - Duration::seconds(30);
        let raw = fixture.build_b64(&key, &cert);

        assert!(validator().validate(&raw, &metadata, &pending, None).is_ok());
    }

    #[test]
    fn not_yet_valid_assertion_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let mut fixture = ResponseFixture::new("_request-1");
        fixture.not_before = Utc::now() + Duration::minutes(10);
        fixture.not_on_or_after = Utc::now() + Duration::minutes(20);
        let raw = fixture.build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::NotYetValid)
        ));
    }

    #[test]
    fn unknown_in_response_to_is_rejected_without_consuming() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let raw = ResponseFixture::new("unknown-id-123").build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::UnknownRequest(_))
        ));
        // The live request is untouched
        assert!(pending.consume("_request-1").is_ok());
    }

    #[test]
    fn audience_mismatch_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let mut fixture = ResponseFixture::new("_request-1");
        fixture.audience = Some("https://other-sp.example.com".to_string());
        let raw = fixture.build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::AudienceMismatch { .. })
        ));
    }

    #[test]
    fn failure_status_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let mut fixture = ResponseFixture::new("_request-1");
        fixture.status = "urn:oasis:names:tc:SAML:2.0:status:Responder".to_string();
        let raw = fixture.build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::StatusNotSuccess(_))
        ));
    }

    #[test]
    fn issuer_not_in_metadata_is_rejected() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://different-idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let raw = ResponseFixture::new("_request-1").build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Signature(_))
        ));
    }

    #[test]
    fn expected_request_id_pins_the_correlation() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        );
        let pending = pending_store_with("_request-1");

        let raw = ResponseFixture::new("_request-1").build_b64(&key, &cert);

        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, Some("_some-other-request")),
            Err(ValidationError::UnknownRequest(_))
        ));
        assert!(
            validator()
                .validate(&raw, &metadata, &pending, Some("_request-1"))
                .is_ok()
        );
    }

    #[test]
    fn garbage_base64_is_malformed() {
        let (cert, _) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert],
        );
        let pending = pending_store_with("_request-1");

        assert!(matches!(
            validator().validate("!!!not-base64!!!", &metadata, &pending, None),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn non_saml_xml_is_malformed() {
        let (cert, _) = generate_test_certificate("idp.example.com");
        let metadata = idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert],
        );
        let pending = pending_store_with("_request-1");

        let raw = STANDARD.encode("<NotASamlResponse>hello</NotASamlResponse>");
        assert!(matches!(
            validator().validate(&raw, &metadata, &pending, None),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn concurrent_delivery_admits_exactly_one() {
        let (cert, key) = generate_test_certificate("idp.example.com");
        let metadata = Arc::new(idp_metadata(
            "https://idp.example.com",
            "https://idp.example.com/sso",
            vec![cert.clone()],
        ));
        let pending = Arc::new(pending_store_with("_request-1"));
        let raw = Arc::new(ResponseFixture::new("_request-1").build_b64(&key, &cert));
        let validator = Arc::new(validator());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (validator, raw, metadata, pending) = (
                    Arc::clone(&validator),
                    Arc::clone(&raw),
                    Arc::clone(&metadata),
                    Arc::clone(&pending),
                );
                std::thread::spawn(move || {
                    validator.validate(&raw, &metadata, &pending, None)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let replays = results
            .iter()
            .filter(|r| matches!(r, Err(ValidationError::Replay(_))))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(replays, 3);
    }

    #[test]
    fn validation_error_kinds_are_distinct() {
        let kinds = [
            ValidationError::Malformed(String::new()).kind(),
            ValidationError::Signature(String::new()).kind(),
            ValidationError::StatusNotSuccess(String::new()).kind(),
            ValidationError::UnknownRequest(String::new()).kind(),
            ValidationError::Replay(String::new()).kind(),
            ValidationError::Expired.kind(),
            ValidationError::NotYetValid.kind(),
            ValidationError::AudienceMismatch { found: vec![] }.kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
