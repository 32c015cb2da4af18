use serde::{Deserialize, Serialize};

/// Session cookie and lifetime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Cookie name.
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,

    /// Session duration in seconds. The effective session expiry is clamped
    /// to the assertion's NotOnOrAfter.
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,

    /// Secure cookie (HTTPS only).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// SameSite cookie attribute.
    #[serde(default)]
    pub same_site: SameSite,

    /// Interval between sweeps of expired sessions and stale pending
    /// requests, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_session_cookie(),
            duration_secs: default_session_duration(),
            secure: true,
            same_site: SameSite::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// SameSite cookie policy.
///
/// `Lax` is the default: the ACS redirect arrives as a top-level navigation,
/// which Lax permits, while cross-site subresource requests stay blocked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

fn default_session_cookie() -> String {
    "palisade_session".to_string()
}

fn default_session_duration() -> u64 {
    8 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}
