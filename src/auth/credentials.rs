//! Service provider credential material.
//!
//! Loads the SP's signing key pair and certificate once at startup; the
//! resulting identity is immutable and shared across requests.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    sign::Signer,
    x509::X509,
};

use crate::config::SpConfig;

/// Credential loading or usage errors. Loading errors are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to read {1}: {0}")]
    Io(std::io::Error, String),

    #[error("Failed to parse SP private key (expected PEM format): {0}")]
    Key(String),

    #[error("Failed to parse SP certificate (expected PEM format): {0}")]
    Certificate(String),

    #[error("SP certificate public key does not match the private key")]
    KeyMismatch,

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// The SP's identity towards the IdP: entity ID, private key, certificate.
///
/// Read-only after load.
pub struct ServiceProviderIdentity {
    entity_id: String,
    private_key: PKey<Private>,
    certificate: X509,
}

impl ServiceProviderIdentity {
    /// Load the identity from the paths in the SP configuration.
    pub fn load(config: &SpConfig) -> Result<Self, CredentialError> {
        let key_pem = std::fs::read(&config.private_key_path)
            .map_err(|e| CredentialError::Io(e, config.private_key_path.clone()))?;
        let cert_pem = std::fs::read(&config.certificate_path)
            .map_err(|e| CredentialError::Io(e, config.certificate_path.clone()))?;

        Self::from_pem(&config.entity_id, &key_pem, &cert_pem)
    }

    /// Build the identity from in-memory PEM data.
    pub fn from_pem(
        entity_id: &str,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> Result<Self, CredentialError> {
        let private_key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| CredentialError::Key(e.to_string()))?;
        let certificate =
            X509::from_pem(cert_pem).map_err(|e| CredentialError::Certificate(e.to_string()))?;

        let cert_key = certificate
            .public_key()
            .map_err(|e| CredentialError::Certificate(e.to_string()))?;
        if !cert_key.public_eq(&private_key) {
            return Err(CredentialError::KeyMismatch);
        }

        Ok(Self {
            entity_id: entity_id.to_string(),
            private_key,
            certificate,
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// The certificate as base64 DER, the form embedded in metadata XML.
    pub fn certificate_b64(&self) -> Result<String, CredentialError> {
        let der = self
            .certificate
            .to_der()
            .map_err(|e| CredentialError::Certificate(e.to_string()))?;
        Ok(STANDARD.encode(der))
    }

    /// Sign `data` with RSA-SHA256.
    pub fn sign_sha256(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        signer
            .update(data)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        signer
            .sign_to_vec()
            .map_err(|e| CredentialError::Signing(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use openssl::{
        asn1::Asn1Time,
        bn::BigNum,
        hash::MessageDigest,
        pkey::{PKey, Private},
        rsa::Rsa,
        x509::{X509, X509Builder, X509NameBuilder},
    };

    /// Generate a self-signed X.509 certificate and private key for tests.
    ///
    /// Returns (certificate, private key).
    pub fn generate_test_certificate(common_name: &str) -> (X509, PKey<Private>) {
        let rsa = Rsa::generate(2048).unwrap();
        let private_key = PKey::from_rsa(rsa).unwrap();

        let mut x509_name = X509NameBuilder::new().unwrap();
        x509_name.append_entry_by_text("CN", common_name).unwrap();
        let x509_name = x509_name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();

        let serial_number = BigNum::from_u32(1).unwrap();
        builder
            .set_serial_number(&serial_number.to_asn1_integer().unwrap())
            .unwrap();

        builder.set_subject_name(&x509_name).unwrap();
        builder.set_issuer_name(&x509_name).unwrap();
        builder.set_pubkey(&private_key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&private_key, MessageDigest::sha256()).unwrap();

        (builder.build(), private_key)
    }

    /// Same key pair as PEM strings, for file-based loading tests.
    pub fn generate_test_certificate_pem(common_name: &str) -> (String, String) {
        let (cert, key) = generate_test_certificate(common_name);
        let cert_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
        let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        (cert_pem, key_pem)
    }
}
