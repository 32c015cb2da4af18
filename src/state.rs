//! Shared application state.

use std::sync::Arc;

use crate::{
    auth::{
        AuthError, CredentialError, FetchError, MemorySessionStore, MetadataResolver,
        SamlAuthenticator, ServiceProviderIdentity,
    },
    config::{ConfigError, PalisadeConfig},
    middleware::ErrorHook,
};

/// Startup failures. All of them abort the process before it serves.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Initial IdP metadata fetch failed: {0}")]
    Metadata(#[from] FetchError),
}

/// Application state shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PalisadeConfig>,
    pub authenticator: Arc<SamlAuthenticator>,
    error_hook: Option<ErrorHook>,
}

impl AppState {
    /// Build the state: load credentials, fetch IdP metadata, and start
    /// the background refresh and cleanup tasks.
    pub async fn new(config: PalisadeConfig) -> Result<Self, StartupError> {
        let identity = Arc::new(ServiceProviderIdentity::load(&config.sp)?);
        let metadata = MetadataResolver::bootstrap(&config.idp).await?;
        metadata.spawn_refresh();

        let authenticator = Arc::new(SamlAuthenticator::new(
            identity,
            metadata,
            Arc::new(MemorySessionStore::new()),
            config.sp.clone(),
            config.session.clone(),
            &config.validation,
        ));
        authenticator.spawn_maintenance();

        Ok(Self {
            config: Arc::new(config),
            authenticator,
            error_hook: None,
        })
    }

    /// Assemble state from pre-built parts; background tasks are the
    /// caller's business. Used by embedders and tests.
    pub fn from_parts(config: PalisadeConfig, authenticator: Arc<SamlAuthenticator>) -> Self {
        Self {
            config: Arc::new(config),
            authenticator,
            error_hook: None,
        }
    }

    /// Install an error hook invoked for every authentication failure.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Log an authentication failure and notify the error hook.
    ///
    /// Failures never propagate as successful responses; this is the one
    /// place they fan out to the logs and the injected handler.
    pub fn report_auth_failure(&self, error: &AuthError) {
        tracing::warn!(code = error.code(), error = %error, "Authentication failure");
        if let Some(hook) = &self.error_hook {
            hook(error);
        }
    }
}
