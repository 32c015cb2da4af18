//! Enveloped XML signature processing.
//!
//! Implements the XML-DSig subset SAML actually uses: enveloped signatures
//! over ID-referenced elements, RSA with SHA-2 digests, exclusive
//! canonicalization. Verification works on the raw document text so that
//! the bytes being hashed are the bytes the peer signed, not a re-parse.
//!
//! Signature wrapping is countered structurally: a Reference must resolve
//! to exactly one element (duplicate IDs are a hard error), and callers
//! only trust content extracted from elements whose ID this module reports
//! as covered by a valid signature.

use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::X509,
};
use quick_xml::{
    Reader, Writer,
    events::{BytesEnd, BytesStart, BytesText, Event},
};

pub const ALG_RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const ALG_RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
pub const ALG_RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";

pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

pub const C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const TRANSFORM_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// XML signature processing errors.
#[derive(Debug, thiserror::Error)]
pub enum DsigError {
    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("duplicate element ID '{0}'")]
    DuplicateId(String),

    #[error("signature references unknown element '{0}'")]
    UnknownReference(String),

    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// Signature algorithms accepted in SignatureMethod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            ALG_RSA_SHA1 => Some(Self::RsaSha1),
            ALG_RSA_SHA256 => Some(Self::RsaSha256),
            ALG_RSA_SHA384 => Some(Self::RsaSha384),
            ALG_RSA_SHA512 => Some(Self::RsaSha512),
            _ => None,
        }
    }

    pub fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha1 => ALG_RSA_SHA1,
            Self::RsaSha256 => ALG_RSA_SHA256,
            Self::RsaSha384 => ALG_RSA_SHA384,
            Self::RsaSha512 => ALG_RSA_SHA512,
        }
    }

    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::RsaSha1 => MessageDigest::sha1(),
            Self::RsaSha256 => MessageDigest::sha256(),
            Self::RsaSha384 => MessageDigest::sha384(),
            Self::RsaSha512 => MessageDigest::sha512(),
        }
    }

    /// SHA-1 signatures are deprecated and rejected unless explicitly allowed.
    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::RsaSha1)
    }
}

/// Digest algorithms accepted in DigestMethod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            DIGEST_SHA1 => Some(Self::Sha1),
            DIGEST_SHA256 => Some(Self::Sha256),
            DIGEST_SHA384 => Some(Self::Sha384),
            DIGEST_SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::Sha1)
    }
}

/// Byte range of an element within a document, start tag through end tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn slice<'a>(&self, xml: &'a str) -> &'a str {
        &xml[self.start..self.end]
    }

    fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Collect the byte spans of all elements matching `pred`, including
/// matches nested inside other matches.
fn element_spans(
    xml: &str,
    mut pred: impl FnMut(&BytesStart<'_>) -> bool,
) -> Result<Vec<Span>, DsigError> {
    let mut reader = Reader::from_str(xml);
    let mut spans = Vec::new();
    // (start offset, depth at which the match opened), innermost last
    let mut open: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0usize;

    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if pred(e) {
                    open.push((pos_before, depth));
                }
                depth += 1;
            }
            Ok(Event::End(_)) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| DsigError::Xml("unbalanced end tag".to_string()))?;
                if let Some(&(start, open_depth)) = open.last()
                    && open_depth == depth
                {
                    open.pop();
                    spans.push(Span {
                        start,
                        end: reader.buffer_position() as usize,
                    });
                }
            }
            Ok(Event::Empty(ref e)) => {
                if pred(e) {
                    spans.push(Span {
                        start: pos_before,
                        end: reader.buffer_position() as usize,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DsigError::Xml(e.to_string())),
            _ => {}
        }
    }

    Ok(spans)
}

/// Find the single element carrying `ID="id"`.
///
/// More than one match is a wrapping attempt and a hard error.
fn find_by_id(xml: &str, id: &str) -> Result<Span, DsigError> {
    let spans = element_spans(xml, |e| {
        e.attributes()
            .flatten()
            .any(|a| a.key.as_ref() == b"ID" && *a.value == *id.as_bytes())
    })?;

    match spans.as_slice() {
        [] => Err(DsigError::UnknownReference(id.to_string())),
        [span] => Ok(*span),
        _ => Err(DsigError::DuplicateId(id.to_string())),
    }
}

/// One parsed Signature element.
#[derive(Debug)]
struct SignatureBlock {
    span: Span,
    signed_info_span: Span,
    reference_id: String,
    signature_algorithm: SignatureAlgorithm,
    digest_algorithm: DigestAlgorithm,
    digest_value: String,
    signature_value: String,
}

/// Extract every Signature element in the document.
fn extract_signature_blocks(xml: &str) -> Result<Vec<SignatureBlock>, DsigError> {
    let sig_spans = element_spans(xml, |e| e.local_name().as_ref() == b"Signature")?;

    let mut blocks = Vec::with_capacity(sig_spans.len());
    for span in sig_spans {
        blocks.push(parse_signature_block(xml, span)?);
    }
    Ok(blocks)
}

fn parse_signature_block(xml: &str, span: Span) -> Result<SignatureBlock, DsigError> {
    let slice = span.slice(xml);

    let signed_info_spans = element_spans(slice, |e| e.local_name().as_ref() == b"SignedInfo")?;
    let [signed_info_local] = signed_info_spans.as_slice() else {
        return Err(DsigError::MalformedSignature(
            "expected exactly one SignedInfo".to_string(),
        ));
    };
    let signed_info_span = Span {
        start: span.start + signed_info_local.start,
        end: span.start + signed_info_local.end,
    };

    let mut reference_uris = Vec::new();
    let mut signature_method = None;
    let mut digest_method = None;
    let mut digest_value = None;
    let mut signature_value = None;

    let mut reader = Reader::from_str(slice);
    reader.config_mut().trim_text(true);
    let mut current_element = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                current_element = name.clone();

                match name.as_str() {
                    "SignatureMethod" | "DigestMethod" => {
                        let algorithm = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"Algorithm")
                            .map(|a| String::from_utf8_lossy(&a.value).to_string());
                        if name == "SignatureMethod" {
                            signature_method = algorithm;
                        } else {
                            digest_method = algorithm;
                        }
                    }
                    "Reference" => {
                        if let Some(uri) = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"URI")
                        {
                            reference_uris.push(String::from_utf8_lossy(&uri.value).to_string());
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| DsigError::Xml(e.to_string()))?
                    .to_string();
                match current_element.as_str() {
                    "DigestValue" => {
                        digest_value =
                            Some(text.chars().filter(|c| !c.is_whitespace()).collect())
                    }
                    "SignatureValue" => {
                        signature_value =
                            Some(text.chars().filter(|c| !c.is_whitespace()).collect())
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current_element.clear(),
            Ok(Event::Eof) => break,
            Err(e) => return Err(DsigError::Xml(e.to_string())),
            _ => {}
        }
    }

    let [reference_uri] = reference_uris.as_slice() else {
        return Err(DsigError::MalformedSignature(
            "expected exactly one Reference".to_string(),
        ));
    };
    let reference_id = reference_uri
        .strip_prefix('#')
        .ok_or_else(|| {
            DsigError::MalformedSignature(format!(
                "Reference URI '{reference_uri}' is not a same-document reference"
            ))
        })?
        .to_string();
    if reference_id.is_empty() {
        return Err(DsigError::MalformedSignature(
            "empty Reference URI".to_string(),
        ));
    }

    let signature_method = signature_method
        .ok_or_else(|| DsigError::MalformedSignature("missing SignatureMethod".to_string()))?;
    let signature_algorithm = SignatureAlgorithm::from_uri(&signature_method)
        .ok_or(DsigError::UnsupportedAlgorithm(signature_method))?;

    let digest_method = digest_method
        .ok_or_else(|| DsigError::MalformedSignature("missing DigestMethod".to_string()))?;
    let digest_algorithm =
        DigestAlgorithm::from_uri(&digest_method).ok_or(DsigError::UnsupportedAlgorithm(digest_method))?;

    Ok(SignatureBlock {
        span,
        signed_info_span,
        reference_id,
        signature_algorithm,
        digest_algorithm,
        digest_value: digest_value
            .ok_or_else(|| DsigError::MalformedSignature("missing DigestValue".to_string()))?,
        signature_value: signature_value
            .ok_or_else(|| DsigError::MalformedSignature("missing SignatureValue".to_string()))?,
    })
}

/// Canonicalize an XML fragment.
///
/// Normalizations applied: XML declaration, comments, PIs, and DOCTYPE are
/// dropped; attributes are sorted; entity representations are normalized;
/// self-closing elements are expanded; inter-element whitespace is removed
/// and text content trimmed. The same function runs on both the signing and
/// verifying side, which is what the digest comparison requires.
pub fn canonicalize(xml: &str) -> Result<String, DsigError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut writer = Writer::new(Cursor::new(Vec::new()));

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let element = sorted_attributes(e)?;
                writer
                    .write_event(Event::Start(element))
                    .map_err(|e| DsigError::Xml(e.to_string()))?;
            }
            Ok(Event::Empty(ref e)) => {
                // C14N expands self-closing elements into start/end pairs
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let element = sorted_attributes(e)?;
                writer
                    .write_event(Event::Start(element))
                    .map_err(|e| DsigError::Xml(e.to_string()))?;
                writer
                    .write_event(Event::End(BytesEnd::new(name)))
                    .map_err(|e| DsigError::Xml(e.to_string()))?;
            }
            Ok(Event::End(ref e)) => {
                writer
                    .write_event(Event::End(e.clone()))
                    .map_err(|e| DsigError::Xml(e.to_string()))?;
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| DsigError::Xml(e.to_string()))?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    writer
                        .write_event(Event::Text(BytesText::new(trimmed)))
                        .map_err(|e| DsigError::Xml(e.to_string()))?;
                }
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e).into_owned();
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    writer
                        .write_event(Event::Text(BytesText::new(trimmed)))
                        .map_err(|e| DsigError::Xml(e.to_string()))?;
                }
            }
            Ok(Event::Comment(_)) | Ok(Event::PI(_)) | Ok(Event::Decl(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Eof) => break,
            Err(e) => return Err(DsigError::Xml(e.to_string())),
            _ => {}
        }
    }

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| DsigError::Xml(e.to_string()))
}

/// Sort element attributes lexicographically by qualified name.
fn sorted_attributes(element: &BytesStart<'_>) -> Result<BytesStart<'static>, DsigError> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| DsigError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| DsigError::Xml(e.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }
    attrs.sort();

    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let name_len = name.len();
    let mut sorted = BytesStart::from_content(name, name_len);
    for (key, value) in &attrs {
        sorted.push_attribute((key.as_str(), value.as_str()));
    }
    Ok(sorted)
}

/// Element IDs covered by a signature that verified against a trusted
/// certificate.
///
/// Signatures that fail digest or key verification are skipped (and
/// logged); structurally broken signatures, unsupported algorithms, and
/// ambiguous references are hard errors. The caller decides whether the
/// covered set is sufficient for the element it is about to trust.
pub fn verified_reference_ids(
    xml: &str,
    trusted_certs: &[X509],
    allow_sha1: bool,
) -> Result<Vec<String>, DsigError> {
    let blocks = extract_signature_blocks(xml)?;
    let mut verified = Vec::new();

    for block in &blocks {
        if (block.signature_algorithm.is_deprecated() || block.digest_algorithm.is_deprecated())
            && !allow_sha1
        {
            return Err(DsigError::UnsupportedAlgorithm(
                "SHA-1 signatures are not allowed".to_string(),
            ));
        }

        let target = find_by_id(xml, &block.reference_id)?;

        // Enveloped transform: drop this Signature element before digesting
        let digest_input = if target.contains(&block.span) {
            let mut s = String::with_capacity(target.end - target.start);
            s.push_str(&xml[target.start..block.span.start]);
            s.push_str(&xml[block.span.end..target.end]);
            s
        } else {
            target.slice(xml).to_string()
        };

        let canonical = canonicalize(&digest_input)?;
        let digest = openssl::hash::hash(
            block.digest_algorithm.message_digest(),
            canonical.as_bytes(),
        )
        .map_err(|e| DsigError::Crypto(e.to_string()))?;

        if STANDARD.encode(&digest) != block.digest_value {
            tracing::debug!(
                reference = %block.reference_id,
                "Digest mismatch for signature reference"
            );
            continue;
        }

        let canonical_signed_info = canonicalize(block.signed_info_span.slice(xml))?;
        let signature_bytes = STANDARD
            .decode(&block.signature_value)
            .map_err(|e| DsigError::MalformedSignature(format!("invalid signature base64: {e}")))?;

        let valid = trusted_certs.iter().any(|cert| {
            verify_with_certificate(
                canonical_signed_info.as_bytes(),
                &signature_bytes,
                cert,
                block.signature_algorithm,
            )
            .unwrap_or(false)
        });

        if valid {
            verified.push(block.reference_id.clone());
        } else {
            tracing::debug!(
                reference = %block.reference_id,
                "Signature did not verify against any trusted certificate"
            );
        }
    }

    Ok(verified)
}

fn verify_with_certificate(
    data: &[u8],
    signature: &[u8],
    cert: &X509,
    algorithm: SignatureAlgorithm,
) -> Result<bool, DsigError> {
    let public_key = cert
        .public_key()
        .map_err(|e| DsigError::Crypto(e.to_string()))?;
    let mut verifier = Verifier::new(algorithm.message_digest(), &public_key)
        .map_err(|e| DsigError::Crypto(e.to_string()))?;
    verifier
        .update(data)
        .map_err(|e| DsigError::Crypto(e.to_string()))?;
    verifier
        .verify(signature)
        .map_err(|e| DsigError::Crypto(e.to_string()))
}

/// Sign the element carrying `ID="reference_id"` with an enveloped
/// RSA-SHA256 signature and return the document with the Signature element
/// inserted.
pub fn sign_enveloped(
    xml: &str,
    reference_id: &str,
    key: &PKey<Private>,
    cert: &X509,
) -> Result<String, DsigError> {
    let target = find_by_id(xml, reference_id)?;

    let canonical = canonicalize(target.slice(xml))?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
        .map_err(|e| DsigError::Crypto(e.to_string()))?;
    let digest_b64 = STANDARD.encode(&digest);

    let signed_info = format!(
        r##"<ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm="{C14N_EXCLUSIVE}"/><ds:SignatureMethod Algorithm="{ALG_RSA_SHA256}"/><ds:Reference URI="#{reference_id}"><ds:Transforms><ds:Transform Algorithm="{TRANSFORM_ENVELOPED}"/><ds:Transform Algorithm="{C14N_EXCLUSIVE}"/></ds:Transforms><ds:DigestMethod Algorithm="{DIGEST_SHA256}"/><ds:DigestValue>{digest_b64}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##
    );

    let canonical_signed_info = canonicalize(&signed_info)?;
    let mut signer =
        Signer::new(MessageDigest::sha256(), key).map_err(|e| DsigError::Crypto(e.to_string()))?;
    signer
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| DsigError::Crypto(e.to_string()))?;
    let signature_b64 = STANDARD.encode(
        signer
            .sign_to_vec()
            .map_err(|e| DsigError::Crypto(e.to_string()))?,
    );

    let cert_b64 = STANDARD.encode(
        cert.to_der()
            .map_err(|e| DsigError::Crypto(e.to_string()))?,
    );

    let signature_xml = format!(
        r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{signed_info}<ds:SignatureValue>{signature_b64}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert_b64}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#
    );

    // Insert immediately before the target's closing tag; the enveloped
    // transform strips it back out before digest verification.
    let closing_offset = xml[target.start..target.end]
        .rfind("</")
        .ok_or_else(|| DsigError::Xml("referenced element has no closing tag".to_string()))?;
    let insert_at = target.start + closing_offset;

    let mut signed = String::with_capacity(xml.len() + signature_xml.len());
    signed.push_str(&xml[..insert_at]);
    signed.push_str(&signature_xml);
    signed.push_str(&xml[insert_at..]);
    Ok(signed)
}
