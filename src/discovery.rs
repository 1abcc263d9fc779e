// src/discovery.rs
//
// Fetches and caches the provider's discovery document and signing keys.
// The discovery document is cached for the life of the provider instance;
// the JWKS is a single-slot snapshot with TTL refresh, replaced wholesale
// on every fetch.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{validate_provider_endpoint, ProviderConfig};
use crate::error::OidcError;
use crate::model::{DiscoveryDocument, JsonWebKey, JsonWebKeySet};

/// Discovery endpoints after HTTPS/same-origin validation.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
}

/// One signing key resolved from the JWKS.
#[derive(Clone)]
pub struct SigningKey {
    pub decoding_key: DecodingKey,
    /// Algorithm declared on the JWK itself, when present. Cross-checked
    /// against the token header in the verifier.
    pub algorithm: Option<Algorithm>,
}

struct JwksSnapshot {
    keys: HashMap<String, SigningKey>,
    fetched_at: Instant,
}

/// Client for the provider's discovery and JWKS endpoints.
///
/// Shared across concurrent requests; reads take the lock briefly and a
/// racing refresh replaces the whole snapshot (last writer wins, which is
/// safe because every refresh fetches the same authoritative source).
pub struct DiscoveryClient {
    config: ProviderConfig,
    http: reqwest::Client,
    // Discovery documents are not expected to move endpoints: set once,
    // cached for the life of the provider instance.
    endpoints: OnceLock<ProviderEndpoints>,
    jwks: RwLock<Option<JwksSnapshot>>,
}

impl DiscoveryClient {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            endpoints: OnceLock::new(),
            jwks: RwLock::new(None),
        }
    }

    /// Fetches and validates the discovery document if not already cached.
    /// Idempotent; safe to call before every authorization request.
    #[instrument(skip(self), err)]
    pub async fn ensure_discovery_loaded(&self) -> Result<ProviderEndpoints, OidcError> {
        if let Some(endpoints) = self.endpoints.get() {
            return Ok(endpoints.clone());
        }

        debug!(discovery_url = %self.config.discovery_url, "performing OIDC discovery");
        let response = self
            .http
            .get(self.config.discovery_url.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OidcError::DiscoveryFailed(format!(
                "discovery endpoint returned status {}",
                response.status()
            )));
        }
        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| OidcError::DiscoveryFailed(format!("invalid discovery document: {e}")))?;

        if let Some(issuer) = &document.issuer {
            if issuer.trim_end_matches('/') != self.config.issuer.as_str().trim_end_matches('/') {
                warn!(
                    declared = %issuer,
                    configured = %self.config.issuer,
                    "discovery document declares a different issuer"
                );
            }
        }

        // Every endpoint the document references is revalidated against the
        // issuer origin; a malicious document cannot point us elsewhere.
        let endpoints = ProviderEndpoints {
            authorization_endpoint: validate_provider_endpoint(
                &document.authorization_endpoint,
                &self.config.issuer,
                "authorization_endpoint",
            )?,
            token_endpoint: validate_provider_endpoint(
                &document.token_endpoint,
                &self.config.issuer,
                "token_endpoint",
            )?,
            jwks_uri: validate_provider_endpoint(
                &document.jwks_uri,
                &self.config.issuer,
                "jwks_uri",
            )?,
        };

        info!(issuer = %self.config.issuer, "OIDC discovery loaded");
        // A racing load resolved first; both fetched the same document.
        let _ = self.endpoints.set(endpoints.clone());
        Ok(endpoints)
    }

    /// Returns the cached endpoints without fetching.
    pub fn endpoints(&self) -> Option<&ProviderEndpoints> {
        self.endpoints.get()
    }

    /// Resolves a signing key by `kid`.
    ///
    /// Serves from the snapshot while it is within TTL and contains the key;
    /// otherwise fetches a fresh JWKS, replaces the snapshot wholesale, and
    /// looks up the `kid` again.
    #[instrument(skip(self), err)]
    pub async fn get_signing_key(&self, kid: &str) -> Result<SigningKey, OidcError> {
        {
            let snapshot = self.jwks.read().await;
            if let Some(snapshot) = snapshot.as_ref() {
                if snapshot.fetched_at.elapsed() < self.config.jwks_cache_ttl {
                    if let Some(key) = snapshot.keys.get(kid) {
                        debug!(kid, "JWKS cache hit");
                        return Ok(key.clone());
                    }
                }
            }
        }

        debug!(kid, "JWKS cache miss, fetching key set");
        let keys = self.fetch_jwks().await?;
        let found = keys.get(kid).cloned();
        *self.jwks.write().await = Some(JwksSnapshot {
            keys,
            fetched_at: Instant::now(),
        });

        found.ok_or_else(|| OidcError::KeyNotFound(kid.to_string()))
    }

    async fn fetch_jwks(&self) -> Result<HashMap<String, SigningKey>, OidcError> {
        let endpoints = self.ensure_discovery_loaded().await?;
        let response = self.http.get(endpoints.jwks_uri).send().await?;
        if !response.status().is_success() {
            return Err(OidcError::DiscoveryFailed(format!(
                "JWKS endpoint returned status {}",
                response.status()
            )));
        }
        let jwks: JsonWebKeySet = response
            .json()
            .await
            .map_err(|e| OidcError::DiscoveryFailed(format!("invalid JWKS document: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            let Some(kid) = jwk.kid.clone() else {
                // Keys without a kid cannot be matched to a token header.
                continue;
            };
            match build_signing_key(&jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => {
                    warn!(kid, kty = %jwk.kty, %err, "skipping unusable JWK");
                }
            }
        }
        info!(num_keys = keys.len(), "JWKS fetched");
        Ok(keys)
    }
}

fn build_signing_key(jwk: &JsonWebKey) -> Result<SigningKey, OidcError> {
    let decoding_key = match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_deref()
                .ok_or_else(|| OidcError::InvalidKeyFormat("RSA key missing 'n'".into()))?;
            let e = jwk
                .e
                .as_deref()
                .ok_or_else(|| OidcError::InvalidKeyFormat("RSA key missing 'e'".into()))?;
            DecodingKey::from_rsa_components(n, e)?
        }
        "EC" => {
            let x = jwk
                .x
                .as_deref()
                .ok_or_else(|| OidcError::InvalidKeyFormat("EC key missing 'x'".into()))?;
            let y = jwk
                .y
                .as_deref()
                .ok_or_else(|| OidcError::InvalidKeyFormat("EC key missing 'y'".into()))?;
            DecodingKey::from_ec_components(x, y)?
        }
        other => {
            return Err(OidcError::InvalidKeyFormat(format!(
                "unsupported key type '{other}'"
            )));
        }
    };

    let algorithm = match jwk.alg.as_deref() {
        Some(alg) => Some(
            Algorithm::from_str(alg)
                .map_err(|_| OidcError::InvalidKeyFormat(format!("unknown algorithm '{alg}'")))?,
        ),
        // Some providers omit `alg` on the JWK; for EC keys the curve still
        // pins the algorithm.
        None => match jwk.crv.as_deref() {
            Some("P-256") => Some(Algorithm::ES256),
            Some("P-384") => Some(Algorithm::ES384),
            _ => None,
        },
    };

    Ok(SigningKey {
        decoding_key,
        algorithm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwk(value: serde_json::Value) -> JsonWebKey {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn rsa_jwk_builds_with_declared_algorithm() {
        // Small but structurally valid base64url RSA components.
        let key = build_signing_key(&jwk(serde_json::json!({
            "kid": "k1",
            "kty": "RSA",
            "alg": "RS256",
            "n": "xKs6K65y2jz9clJ5qL_uHdm4raQAnyzL5ZbGiE1kXW0",
            "e": "AQAB",
        })))
        .unwrap();
        assert_eq!(key.algorithm, Some(Algorithm::RS256));
    }

    #[test]
    fn ec_jwk_without_alg_falls_back_to_curve() {
        let key = build_signing_key(&jwk(serde_json::json!({
            "kid": "k2",
            "kty": "EC",
            "crv": "P-256",
            "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
            "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM",
        })))
        .unwrap();
        assert_eq!(key.algorithm, Some(Algorithm::ES256));
    }

    #[test]
    fn rsa_jwk_without_alg_has_no_pinned_algorithm() {
        let key = build_signing_key(&jwk(serde_json::json!({
            "kid": "k3",
            "kty": "RSA",
            "n": "xKs6K65y2jz9clJ5qL_uHdm4raQAnyzL5ZbGiE1kXW0",
            "e": "AQAB",
        })))
        .unwrap();
        assert!(key.algorithm.is_none());
    }

    #[test]
    fn unsupported_kty_is_rejected() {
        let result = build_signing_key(&jwk(serde_json::json!({
            "kid": "k4",
            "kty": "oct",
        })));
        assert!(matches!(result, Err(OidcError::InvalidKeyFormat(_))));
    }

    #[test]
    fn unknown_algorithm_string_is_rejected() {
        let result = build_signing_key(&jwk(serde_json::json!({
            "kid": "k5",
            "kty": "RSA",
            "alg": "XS256",
            "n": "xKs6K65y2jz9clJ5qL_uHdm4raQAnyzL5ZbGiE1kXW0",
            "e": "AQAB",
        })));
        assert!(matches!(result, Err(OidcError::InvalidKeyFormat(_))));
    }
}
