// src/provider.rs
//
// The provider abstraction: local password auth, OIDC, and future providers
// share one trait, created through an explicit registry constructed at
// startup and passed by reference to whatever needs it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::error::OidcError;
use crate::model::VerifiedIdentity;

/// Provider-specific credentials, tagged by provider family.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Email/password for the local provider (external to this crate).
    Local { email: String, password: String },
    /// Authorization-code callback data for OIDC providers.
    Oidc {
        code: String,
        redirect_uri: String,
        /// Nonce consumed from the transient store for this attempt.
        nonce: String,
        /// PKCE verifier consumed from the transient store for this attempt.
        code_verifier: String,
    },
}

/// Interface every authentication provider implements.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Validates the provider's configuration, reaching out to remote
    /// endpoints where needed (OIDC discovery).
    async fn validate_config(&self) -> Result<(), OidcError>;

    /// Preloads remote state needed before `authorization_url` can run
    /// synchronously. Idempotent.
    async fn prepare(&self) -> Result<(), OidcError>;

    /// Builds the redirect URL to the external IdP. Returns `None` for
    /// providers without an authorization leg (local).
    fn authorization_url(
        &self,
        state: &str,
        nonce: Option<&str>,
        code_challenge: Option<&str>,
    ) -> Result<Option<Url>, OidcError>;

    /// Authenticates the user and returns their normalized identity.
    async fn authenticate(&self, credentials: Credentials) -> Result<VerifiedIdentity, OidcError>;
}

type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn AuthProvider>, OidcError> + Send + Sync>;

/// Maps provider ids to constructors. Built once at startup; no process-wide
/// mutable state.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, provider_id: &str, factory: F)
    where
        F: Fn() -> Result<Arc<dyn AuthProvider>, OidcError> + Send + Sync + 'static,
    {
        self.factories
            .insert(provider_id.to_lowercase(), Arc::new(factory));
    }

    pub fn create(&self, provider_id: &str) -> Result<Arc<dyn AuthProvider>, OidcError> {
        let factory = self
            .factories
            .get(&provider_id.to_lowercase())
            .ok_or_else(|| OidcError::UnknownProvider(provider_id.to_string()))?;
        factory()
    }

    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Application session tokens issued after reconciliation. Opaque to this
/// subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// External collaborator that maps a verified IdP identity onto an
/// application user (create-or-link) and issues session tokens.
#[async_trait]
pub trait IdentityReconciler: Send + Sync {
    async fn reconcile(
        &self,
        provider_id: &str,
        identity: &VerifiedIdentity,
    ) -> Result<SessionTokens, OidcError>;
}
