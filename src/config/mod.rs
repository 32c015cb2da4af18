//! Configuration module for the service provider.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [sp]
//! entity_id = "http://localhost:8000"
//! private_key_path = "sp.key"
//! certificate_path = "sp.cert"
//!
//! [idp]
//! metadata_url = "https://samltest.id/saml/idp"
//! ```

mod idp;
mod observability;
mod server;
mod session;
mod sp;
mod validation;

use std::path::Path;

pub use idp::*;
pub use observability::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use session::*;
pub use sp::*;
pub use validation::*;

/// Root configuration for the service provider.
///
/// All sections except `[sp]` and `[idp]` are optional with sensible
/// defaults, allowing minimal configuration for simple deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PalisadeConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Service provider identity: entity ID and credential material.
    pub sp: SpConfig,

    /// Identity provider configuration (metadata source and refresh policy).
    pub idp: IdpConfig,

    /// Session cookie and lifetime configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Response validation policy (clock skew, pending-request TTL).
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl PalisadeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        // Expand environment variables
        let expanded = expand_env_vars(contents)?;

        let config: PalisadeConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sp.entity_id.is_empty() {
            return Err(ConfigError::Validation("sp.entity_id must not be empty".into()));
        }

        url::Url::parse(&self.sp.entity_id).map_err(|e| {
            ConfigError::Validation(format!("sp.entity_id is not a valid URL: {e}"))
        })?;

        url::Url::parse(&self.sp.public_url()).map_err(|e| {
            ConfigError::Validation(format!("sp.public_url is not a valid URL: {e}"))
        })?;

        let metadata_url = url::Url::parse(&self.idp.metadata_url).map_err(|e| {
            ConfigError::Validation(format!("idp.metadata_url is not a valid URL: {e}"))
        })?;

        // Metadata carries the trust anchors for signature validation; fetching
        // it over plaintext HTTP would let an active attacker swap certificates.
        if self.idp.require_https && metadata_url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "idp.metadata_url must use HTTPS (got '{}'); set idp.require_https = false \
                 for local development only",
                metadata_url.scheme()
            )));
        }

        if self.validation.pending_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "validation.pending_ttl_secs must be greater than zero".into(),
            ));
        }

        if self.session.duration_secs == 0 {
            return Err(ConfigError::Validation(
                "session.duration_secs must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Expand `${VAR_NAME}` references in the configuration text.
///
/// Variables inside TOML comments are left untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let match_start = cap.get(0).unwrap().start();

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && match_start >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..match_start]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = cap.get(0).unwrap().end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

/// Configuration errors. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
