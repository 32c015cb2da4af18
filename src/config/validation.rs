use serde::{Deserialize, Serialize};

/// Response validation policy.
///
/// The protocol mandates the checks but not the tolerances; both knobs here
/// are deployment policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Clock-skew tolerance in seconds applied to NotBefore/NotOnOrAfter.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Lifetime of an outstanding AuthnRequest in seconds. Responses
    /// referencing an older request are rejected even if otherwise valid.
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,

    /// Accept SHA-1 based XML signatures. Deprecated; some legacy IdPs
    /// still emit them.
    #[serde(default)]
    pub allow_sha1: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew(),
            pending_ttl_secs: default_pending_ttl(),
            allow_sha1: false,
        }
    }
}

fn default_clock_skew() -> u64 {
    90
}

fn default_pending_ttl() -> u64 {
    300
}
