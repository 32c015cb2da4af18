use serde::{Deserialize, Serialize};

/// Identity provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    /// URL of the IdP's SAML metadata document (EntityDescriptor XML).
    pub metadata_url: String,

    /// Metadata refresh interval in seconds.
    ///
    /// IdP metadata changes infrequently and IdPs overlap old and new
    /// certificates during rotations, so an hourly refresh is sufficient.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Timeout for metadata fetch requests in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Require HTTPS for the metadata URL. Disable for local development
    /// against a test IdP only.
    #[serde(default = "default_true")]
    pub require_https: bool,
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
