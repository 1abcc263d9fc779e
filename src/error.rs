// src/error.rs

use thiserror::Error;

/// The primary error type for the `ember-oidc` library.
///
/// Variants group into four classes, mirrored by [`OidcError::http_status`]:
/// configuration failures (500), client protocol failures (400),
/// authentication failures (401), and rate limiting (429).
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("OIDC authentication is not enabled")]
    Disabled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// Endpoint failed the HTTPS / same-origin-as-issuer check.
    #[error("Insecure or cross-origin endpoint: {0}")]
    InsecureEndpoint(String),

    #[error("OIDC discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Transient store error: {0}")]
    Store(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Missing required request field: {0}")]
    MissingRequestField(&'static str),

    #[error("Invalid or expired state")]
    InvalidOrExpiredState,

    #[error("Invalid or expired nonce")]
    InvalidOrExpiredNonce,

    #[error("Invalid or expired PKCE verifier")]
    InvalidOrExpiredPkce,

    /// The IdP rejected the code exchange. The upstream body is logged
    /// server-side only and never carried here.
    #[error("Token exchange failed with status {status}")]
    TokenExchangeFailed { status: u16 },

    #[error("Invalid token response from provider: {0}")]
    InvalidTokenResponse(String),

    #[error("The JWT header is missing the 'kid' (Key ID) field")]
    MissingKeyId,

    #[error("Key not found for kid: {0}")]
    KeyNotFound(String),

    #[error("Invalid JWK format: {0}")]
    InvalidKeyFormat(String),

    #[error("Unsupported JWT algorithm: {0:?}")]
    UnsupportedAlgorithm(jsonwebtoken::Algorithm),

    /// The token header declares one algorithm while the matched JWKS key
    /// declares another. Failing here blocks algorithm-substitution attacks.
    #[error("Algorithm mismatch between token header ({header:?}) and signing key ({key:?})")]
    AlgorithmMismatch {
        header: jsonwebtoken::Algorithm,
        key: jsonwebtoken::Algorithm,
    },

    #[error("JWT validation error: {0}")]
    JwtValidation(#[from] Box<jsonwebtoken::errors::Error>),

    #[error("Token issued in the future")]
    IssuedInFuture,

    #[error("Token not yet valid (nbf)")]
    NotYetValid,

    #[error("ID token 'at_hash' does not match the access token")]
    AtHashMismatch,

    #[error("ID token is missing the 'nonce' claim")]
    MissingNonceInToken,

    #[error("Nonce mismatch - possible replay attack")]
    NonceMismatch,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider received credentials of the wrong kind")]
    UnsupportedCredentials,

    #[error("Identity reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },
}

impl OidcError {
    /// HTTP status the conceptual surface maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Disabled => 404,
            Self::MissingRequestField(_)
            | Self::InvalidOrExpiredState
            | Self::InvalidOrExpiredNonce
            | Self::InvalidOrExpiredPkce => 400,
            Self::RateLimitExceeded { .. } => 429,
            Self::TokenExchangeFailed { .. }
            | Self::InvalidTokenResponse(_)
            | Self::MissingKeyId
            | Self::KeyNotFound(_)
            | Self::InvalidKeyFormat(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::AlgorithmMismatch { .. }
            | Self::JwtValidation(_)
            | Self::IssuedInFuture
            | Self::NotYetValid
            | Self::AtHashMismatch
            | Self::MissingNonceInToken
            | Self::NonceMismatch
            | Self::Reconciliation(_) => 401,
            _ => 500,
        }
    }

    /// Message safe to return to the client. Authentication failures are
    /// intentionally generic so validation detail never aids an attacker.
    pub fn client_message(&self) -> &'static str {
        match self.http_status() {
            401 => "Authentication failed",
            404 => "OIDC authentication is not enabled",
            429 => "Too many requests",
            400 => match self {
                Self::InvalidOrExpiredState => "Invalid or expired state",
                Self::InvalidOrExpiredNonce => "Invalid or expired nonce",
                Self::InvalidOrExpiredPkce => "Invalid or expired PKCE verifier",
                _ => "Invalid request",
            },
            _ => "Internal server error",
        }
    }

    /// Retry-After hint, present only for rate-limit errors.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for OidcError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::JwtValidation(Box::new(err))
    }
}

/// Truncated, non-sensitive correlation fragment for server-side logs.
/// Full state tokens never appear in log output.
pub fn state_prefix(state: &str) -> &str {
    state.get(..8).unwrap_or(state)
}
