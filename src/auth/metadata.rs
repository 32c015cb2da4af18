//! IdP metadata: fetching, parsing, and the refreshed cache.
//!
//! The resolver holds the current metadata behind an atomically swapped
//! `Arc`. Validations grab a snapshot up front, so a concurrent refresh can
//! never change the certificate set under a validation in progress.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::x509::X509;
use parking_lot::RwLock;
use quick_xml::{Reader, events::Event};

use crate::config::IdpConfig;

/// SAML 2.0 binding URNs.
pub const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
pub const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// Metadata fetch/parse errors. Recoverable after bootstrap: the resolver
/// keeps serving the last-known-good document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to fetch IdP metadata: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IdP metadata endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Failed to parse IdP metadata: {0}")]
    Parse(String),

    #[error("IdP metadata contains no signing certificates")]
    NoCertificates,

    #[error("IdP metadata advertises no SSO endpoint")]
    NoSsoEndpoint,
}

/// Parsed IdP metadata: trust anchors and endpoints.
#[derive(Debug, Clone)]
pub struct IdpMetadata {
    /// IdP entity identifier.
    pub entity_id: String,

    /// SSO endpoint for the HTTP-Redirect binding.
    pub sso_redirect_url: Option<String>,

    /// SSO endpoint for the HTTP-POST binding.
    pub sso_post_url: Option<String>,

    /// Single Logout endpoint for the HTTP-Redirect binding.
    pub slo_redirect_url: Option<String>,

    /// Signing certificates, in document order. Multiple entries appear
    /// during key rollover; all are accepted for signature validation.
    pub signing_certs: Vec<X509>,
}

impl IdpMetadata {
    /// The SSO endpoint to redirect AuthnRequests to, preferring the
    /// redirect binding.
    pub fn sso_url(&self) -> Result<&str, FetchError> {
        self.sso_redirect_url
            .as_deref()
            .or(self.sso_post_url.as_deref())
            .ok_or(FetchError::NoSsoEndpoint)
    }
}

/// Parse an EntityDescriptor metadata document.
pub fn parse_entity_descriptor(xml: &str) -> Result<IdpMetadata, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entity_id = String::new();
    let mut sso_redirect_url = None;
    let mut sso_post_url = None;
    let mut slo_redirect_url = None;
    let mut cert_b64: Vec<String> = Vec::new();

    let mut in_idp_descriptor = false;
    let mut in_signing_key = false;
    let mut current_element = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                current_element = name.clone();

                match name.as_str() {
                    "EntityDescriptor" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"entityID" {
                                entity_id = String::from_utf8_lossy(&attr.value).to_string();
                            }
                        }
                    }
                    "IDPSSODescriptor" => in_idp_descriptor = true,
                    "KeyDescriptor" if in_idp_descriptor => {
                        // `use` is optional; an unqualified KeyDescriptor
                        // serves both signing and encryption.
                        let key_use = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"use")
                            .map(|a| String::from_utf8_lossy(&a.value).to_string());
                        in_signing_key = key_use.as_deref() != Some("encryption");
                    }
                    "SingleSignOnService" | "SingleLogoutService" if in_idp_descriptor => {
                        let mut binding = None;
                        let mut location = None;
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"Binding" => {
                                    binding = Some(String::from_utf8_lossy(&attr.value).to_string())
                                }
                                b"Location" => {
                                    location =
                                        Some(String::from_utf8_lossy(&attr.value).to_string())
                                }
                                _ => {}
                            }
                        }
                        if let (Some(binding), Some(location)) = (binding, location) {
                            match (name.as_str(), binding.as_str()) {
                                ("SingleSignOnService", BINDING_HTTP_REDIRECT) => {
                                    sso_redirect_url.get_or_insert(location);
                                }
                                ("SingleSignOnService", BINDING_HTTP_POST) => {
                                    sso_post_url.get_or_insert(location);
                                }
                                ("SingleLogoutService", BINDING_HTTP_REDIRECT) => {
                                    slo_redirect_url.get_or_insert(location);
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                if current_element == "X509Certificate" && in_idp_descriptor && in_signing_key {
                    let raw = e
                        .unescape()
                        .map_err(|e| FetchError::Parse(e.to_string()))?;
                    cert_b64.push(raw.chars().filter(|c| !c.is_whitespace()).collect());
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "IDPSSODescriptor" => in_idp_descriptor = false,
                    "KeyDescriptor" => in_signing_key = false,
                    _ => {}
                }
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Parse(e.to_string())),
            _ => {}
        }
    }

    if entity_id.is_empty() {
        return Err(FetchError::Parse("missing entityID".to_string()));
    }

    let mut signing_certs = Vec::with_capacity(cert_b64.len());
    for b64 in &cert_b64 {
        let der = STANDARD
            .decode(b64)
            .map_err(|e| FetchError::Parse(format!("invalid certificate base64: {e}")))?;
        let cert = X509::from_der(&der)
            .map_err(|e| FetchError::Parse(format!("invalid certificate DER: {e}")))?;
        signing_certs.push(cert);
    }

    if signing_certs.is_empty() {
        return Err(FetchError::NoCertificates);
    }

    if sso_redirect_url.is_none() && sso_post_url.is_none() {
        return Err(FetchError::NoSsoEndpoint);
    }

    Ok(IdpMetadata {
        entity_id,
        sso_redirect_url,
        sso_post_url,
        slo_redirect_url,
        signing_certs,
    })
}

/// Fetches and caches IdP metadata with periodic refresh.
pub struct MetadataResolver {
    http_client: reqwest::Client,
    metadata_url: String,
    refresh_interval: Duration,
    current: RwLock<Arc<IdpMetadata>>,
}

impl MetadataResolver {
    /// Fetch the metadata once and construct the resolver.
    ///
    /// The initial fetch must succeed; there is no trust anchor to fall
    /// back to, so a failure here is fatal at startup.
    pub async fn bootstrap(config: &IdpConfig) -> Result<Arc<Self>, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;

        let initial = Self::fetch(&http_client, &config.metadata_url).await?;

        tracing::info!(
            idp_entity_id = %initial.entity_id,
            certificates = initial.signing_certs.len(),
            url = %config.metadata_url,
            "Loaded IdP metadata"
        );

        Ok(Arc::new(Self {
            http_client,
            metadata_url: config.metadata_url.clone(),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            current: RwLock::new(Arc::new(initial)),
        }))
    }

    /// Fetch and parse the metadata document from `url`.
    pub async fn fetch(
        http_client: &reqwest::Client,
        url: &str,
    ) -> Result<IdpMetadata, FetchError> {
        let response = http_client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        parse_entity_descriptor(&body)
    }

    /// Build a resolver around a fixed metadata document.
    ///
    /// For deployments where the IdP metadata is provisioned out of band
    /// instead of fetched; `refresh` becomes a no-op failure and the
    /// static document stays last-known-good forever.
    pub fn with_static(metadata: IdpMetadata) -> Arc<Self> {
        Arc::new(Self {
            http_client: reqwest::Client::new(),
            metadata_url: String::new(),
            refresh_interval: Duration::from_secs(3600),
            current: RwLock::new(Arc::new(metadata)),
        })
    }

    /// The current metadata snapshot.
    ///
    /// Callers hold the returned `Arc` for the duration of a validation;
    /// a concurrent refresh swaps the cache without touching snapshots
    /// already handed out.
    pub fn current(&self) -> Arc<IdpMetadata> {
        self.current.read().clone()
    }

    /// Re-fetch the metadata and swap the cache on success.
    ///
    /// On failure the last-known-good document is retained and the
    /// condition logged; callers decide the policy.
    pub async fn refresh(&self) -> Result<(), FetchError> {
        match Self::fetch(&self.http_client, &self.metadata_url).await {
            Ok(metadata) => {
                tracing::debug!(
                    idp_entity_id = %metadata.entity_id,
                    certificates = metadata.signing_certs.len(),
                    "Refreshed IdP metadata"
                );
                *self.current.write() = Arc::new(metadata);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    url = %self.metadata_url,
                    "IdP metadata refresh failed; keeping last-known-good"
                );
                Err(e)
            }
        }
    }

    /// Spawn the periodic refresh task.
    pub fn spawn_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolver.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it, bootstrap just fetched.
            interval.tick().await;
            loop {
                interval.tick().await;
                let _ = resolver.refresh().await;
            }
        })
    }
}
