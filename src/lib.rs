// src/lib.rs
//
// OpenID Connect relying-party authentication: authorization-code flow with
// PKCE (S256), CSRF state, nonce replay protection, ID-token verification
// per OIDC Core 1.0, and fixed-window rate limiting.

pub mod config;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod model;
pub mod oidc;
pub mod pkce;
pub mod provider;
pub mod ratelimit;
pub mod store;

#[cfg(feature = "redis-store")]
pub mod redis_store;

/// The public prelude for the `ember-oidc` crate.
///
/// Re-exports the types most integrations need.
pub mod prelude {
    pub use crate::config::{FlowSettings, OidcSettings, ProviderConfig, ProviderConfigBuilder};
    pub use crate::error::OidcError;
    pub use crate::flow::{
        registry_with_oidc, AuthenticatedSession, AuthorizeGrant, CallbackRequest, OidcFlow,
        NO_STORE_HEADERS,
    };
    pub use crate::model::{TokenResponse, VerifiedIdentity};
    pub use crate::oidc::OidcProvider;
    pub use crate::provider::{
        AuthProvider, Credentials, IdentityReconciler, ProviderRegistry, SessionTokens,
    };
    pub use crate::ratelimit::{resolve_client_ip, RateLimiter};
    pub use crate::store::{MemoryStore, TransientStore};
    pub use jsonwebtoken::Algorithm;
}
