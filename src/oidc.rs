// src/oidc.rs
//
// The OIDC provider: authorization-URL construction, authorization-code
// exchange, and ID-token verification per OpenID Connect Core 1.0.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::ProviderConfig;
use crate::discovery::DiscoveryClient;
use crate::error::OidcError;
use crate::model::{IdTokenClaims, TokenResponse, VerifiedIdentity};
use crate::pkce;
use crate::provider::{AuthProvider, Credentials};

/// Signature algorithms accepted on ID tokens. `none` and the HMAC family
/// are excluded: accepting them would let an attacker forge tokens with the
/// public client secret, or with no key at all. ES512 is absent because
/// `jsonwebtoken` does not implement it.
pub const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Clock-skew tolerance for `iat`/`nbf`/`exp` checks.
pub const CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Per-call timeout for discovery, JWKS, and token-endpoint requests, so a
/// hung IdP cannot exhaust request-handling capacity.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct OidcProvider {
    config: ProviderConfig,
    discovery: DiscoveryClient,
    http: reqwest::Client,
}

impl OidcProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            discovery: DiscoveryClient::new(config.clone(), http.clone()),
            config,
            http,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    /// POSTs the authorization code to the token endpoint.
    #[instrument(skip_all, err)]
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, OidcError> {
        let endpoints = self.discovery.ensure_discovery_loaded().await?;
        let response = self
            .http
            .post(endpoints.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // Upstream bodies stay in server logs; the client sees a
            // generic authentication failure.
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), %body, "token exchange failed");
            return Err(OidcError::TokenExchangeFailed {
                status: status.as_u16(),
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| OidcError::InvalidTokenResponse(e.to_string()))
    }

    /// Verifies an ID token: signature, issuer, audience, time claims with
    /// 60s skew tolerance, exact nonce binding, and `at_hash` when the token
    /// carries one.
    #[instrument(skip_all, err)]
    pub(crate) async fn verify_id_token(
        &self,
        id_token: &str,
        expected_nonce: &str,
        access_token: Option<&str>,
    ) -> Result<IdTokenClaims, OidcError> {
        let header = decode_header(id_token)?;
        let kid = header.kid.ok_or(OidcError::MissingKeyId)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(OidcError::UnsupportedAlgorithm(header.alg));
        }

        let signing_key = self.discovery.get_signing_key(&kid).await?;
        if let Some(key_alg) = signing_key.algorithm {
            if key_alg != header.alg {
                return Err(OidcError::AlgorithmMismatch {
                    header: header.alg,
                    key: key_alg,
                });
            }
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = CLOCK_SKEW.as_secs();
        // Url normalization appends a trailing slash to a bare-origin
        // issuer, while IdPs emit the canonical `iss` string without one.
        // Accept both forms, exact-match on everything else.
        let issuer = self.config.issuer.as_str();
        validation.set_issuer(&[issuer.trim_end_matches('/'), issuer]);
        validation.set_audience(&[&self.config.client_id]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud", "sub"]);

        let token_data = decode::<IdTokenClaims>(id_token, &signing_key.decoding_key, &validation)?;
        let claims = token_data.claims;

        let now = unix_now();
        let skew = CLOCK_SKEW.as_secs();
        if claims.iat > now + skew {
            return Err(OidcError::IssuedInFuture);
        }
        if let Some(nbf) = claims.nbf {
            if now + skew < nbf {
                return Err(OidcError::NotYetValid);
            }
        }

        let token_nonce = claims
            .nonce
            .as_deref()
            .ok_or(OidcError::MissingNonceInToken)?;
        if token_nonce != expected_nonce {
            warn!(sub = %claims.sub, "nonce mismatch on verified token");
            return Err(OidcError::NonceMismatch);
        }

        // at_hash binds the access token to this ID token (OIDC Core
        // 3.1.3.8). Enforced whenever the claim is present.
        if let Some(at_hash) = claims.at_hash.as_deref() {
            let matches = access_token
                .map(|token| expected_at_hash(token, header.alg) == at_hash)
                .unwrap_or(false);
            if !matches {
                warn!(sub = %claims.sub, "at_hash does not match the access token");
                return Err(OidcError::AtHashMismatch);
            }
        }

        debug!(sub = %claims.sub, iss = %claims.iss, "ID token verified");
        Ok(claims)
    }
}

/// Left-most half of the access token's digest, base64url without padding.
/// The hash function follows the ID token's signature algorithm.
fn expected_at_hash(access_token: &str, alg: Algorithm) -> String {
    let digest = match alg {
        Algorithm::RS384 | Algorithm::ES384 => {
            Sha384::digest(access_token.as_bytes()).to_vec()
        }
        Algorithm::RS512 => Sha512::digest(access_token.as_bytes()).to_vec(),
        _ => Sha256::digest(access_token.as_bytes()).to_vec(),
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl AuthProvider for OidcProvider {
    fn provider_id(&self) -> &str {
        "oidc"
    }

    async fn validate_config(&self) -> Result<(), OidcError> {
        // Field-level checks ran at construction; what remains is proving
        // the discovery endpoint is reachable and well-formed.
        self.discovery.ensure_discovery_loaded().await?;
        Ok(())
    }

    async fn prepare(&self) -> Result<(), OidcError> {
        self.discovery.ensure_discovery_loaded().await?;
        Ok(())
    }

    fn authorization_url(
        &self,
        state: &str,
        nonce: Option<&str>,
        code_challenge: Option<&str>,
    ) -> Result<Option<Url>, OidcError> {
        let endpoints = self.discovery.endpoints().ok_or_else(|| {
            OidcError::DiscoveryFailed("discovery not loaded - call prepare() first".into())
        })?;
        let nonce = nonce
            .filter(|n| !n.is_empty())
            .ok_or(OidcError::MissingRequestField("nonce"))?;
        let code_challenge = code_challenge
            .filter(|c| !c.is_empty())
            .ok_or(OidcError::MissingRequestField("code_challenge"))?;

        let mut url = endpoints.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("nonce", nonce)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            // Cache buster: identical-looking requests must never be served
            // a stale redirect by an intermediate cache.
            .append_pair("_t", &pkce::cache_buster().to_string());
        Ok(Some(url))
    }

    #[instrument(skip_all, err)]
    async fn authenticate(&self, credentials: Credentials) -> Result<VerifiedIdentity, OidcError> {
        let Credentials::Oidc {
            code,
            redirect_uri,
            nonce,
            code_verifier,
        } = credentials
        else {
            return Err(OidcError::UnsupportedCredentials);
        };
        if code.is_empty() {
            return Err(OidcError::MissingRequestField("code"));
        }
        if redirect_uri.is_empty() {
            return Err(OidcError::MissingRequestField("redirect_uri"));
        }
        if nonce.is_empty() {
            return Err(OidcError::MissingRequestField("nonce"));
        }

        let tokens = self.exchange_code(&code, &redirect_uri, &code_verifier).await?;
        let id_token = tokens.require_id_token()?.to_string();
        let claims = self
            .verify_id_token(&id_token, &nonce, tokens.access_token.as_deref())
            .await?;

        info!(sub = %claims.sub, "OIDC authentication succeeded");
        Ok(VerifiedIdentity::from_claims(claims, tokens))
    }
}
