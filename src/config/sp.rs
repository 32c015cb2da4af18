use serde::{Deserialize, Serialize};

/// Service provider identity configuration.
///
/// The entity ID is the SP's identifier towards the IdP; the key pair signs
/// outgoing AuthnRequests and appears in the published SP metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// SP entity identifier (a URL by convention).
    pub entity_id: String,

    /// Path to the SP private key (PEM, PKCS#8 or PKCS#1).
    pub private_key_path: String,

    /// Path to the SP certificate (PEM).
    pub certificate_path: String,

    /// Externally reachable base URL of this service.
    ///
    /// Used to derive the ACS and metadata URLs advertised to the IdP. When
    /// unset, the entity ID's scheme and authority are used. This matters in
    /// container deployments where the bind address differs from the address
    /// browsers reach the service at.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Whether to sign AuthnRequests (redirect-binding detached signature).
    #[serde(default = "default_true")]
    pub sign_requests: bool,

    /// NameID format requested from the IdP.
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,

    /// Whether to force re-authentication at the IdP.
    #[serde(default)]
    pub force_authn: bool,
}

impl SpConfig {
    /// The externally reachable base URL (explicit `base_url`, or derived
    /// from the entity ID).
    pub fn public_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self.entity_id.trim_end_matches('/').to_string(),
        }
    }

    /// The Assertion Consumer Service URL advertised to the IdP.
    pub fn acs_url(&self) -> String {
        format!("{}/saml/acs", self.public_url())
    }
}

fn default_true() -> bool {
    true
}

fn default_name_id_format() -> String {
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".to_string()
}
