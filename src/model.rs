// src/model.rs

use serde::{Deserialize, Serialize};

use crate::error::OidcError;

/// The subset of the provider's `.well-known/openid-configuration` document
/// this subsystem needs. All three endpoints are required; each must be HTTPS
/// and same-origin with the issuer (enforced in `discovery`).
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// A single JSON Web Key (JWK) as defined in RFC 7517.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKey {
    pub kid: Option<String>,
    pub kty: String,
    #[serde(rename = "use")]
    pub use_purpose: Option<String>,
    pub alg: Option<String>,
    // RSA components
    pub n: Option<String>,
    pub e: Option<String>,
    // EC components
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

/// A JSON Web Key Set (JWKS), the provider's published signing keys.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

/// Wire response from the token endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Checks the response is usable for OIDC: an `id_token` must be present
    /// and `token_type` must be `bearer` (case-insensitive).
    pub fn require_id_token(&self) -> Result<&str, OidcError> {
        let token_type = self
            .token_type
            .as_deref()
            .ok_or_else(|| OidcError::InvalidTokenResponse("missing 'token_type'".into()))?;
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(OidcError::InvalidTokenResponse(format!(
                "unexpected token_type '{token_type}'"
            )));
        }
        self.id_token
            .as_deref()
            .ok_or_else(|| OidcError::InvalidTokenResponse("missing 'id_token'".into()))
    }
}

/// The `aud` claim may be a single string or an array of strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

/// Claims decoded from a verified ID token.
///
/// Standard OIDC claims plus the profile fields this subsystem normalizes
/// into a [`VerifiedIdentity`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: u64,
    pub iat: u64,
    pub nbf: Option<u64>,
    pub nonce: Option<String>,
    /// Access-token hash (OIDC Core 3.1.3.8), present when the IdP binds
    /// the access token to this ID token.
    pub at_hash: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    pub preferred_username: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub picture: Option<String>,
}

/// Normalized identity data handed to the identity-reconciliation
/// collaborator after a successful callback. A value object with no
/// lifecycle of its own.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIdentity {
    /// The `sub` claim: the provider's stable identifier for this user.
    pub provider_user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    /// From `username` (some IdPs) or `preferred_username` (standard OIDC).
    pub username: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    /// Raw token response from the IdP, carried as opaque metadata.
    pub tokens: TokenResponse,
}

/// Empty strings from lax IdPs are normalized to absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl VerifiedIdentity {
    pub fn from_claims(claims: IdTokenClaims, tokens: TokenResponse) -> Self {
        Self {
            provider_user_id: claims.sub,
            email: non_empty(claims.email),
            name: non_empty(claims.name),
            username: non_empty(claims.username).or_else(|| non_empty(claims.preferred_username)),
            phone: non_empty(claims.phone_number),
            avatar_url: non_empty(claims.picture),
            email_verified: claims.email_verified.unwrap_or(false),
            tokens,
        }
    }
}
