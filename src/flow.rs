// src/flow.rs
//
// Framework-agnostic orchestration of the two-request flow:
// authorize (build redirect, persist attempt) and callback (atomic consume,
// exchange, verify, reconcile). HTTP status mapping lives on OidcError.

use std::sync::Arc;

use tracing::{info, instrument};
use url::Url;

use crate::config::{FlowSettings, ProviderConfig};
use crate::error::{state_prefix, OidcError};
use crate::model::VerifiedIdentity;
use crate::oidc::OidcProvider;
use crate::pkce;
use crate::provider::{
    AuthProvider, Credentials, IdentityReconciler, ProviderRegistry, SessionTokens,
};
use crate::ratelimit::RateLimiter;
use crate::store::{keys, TransientStore};

/// Response headers for the authorize endpoint, so browsers and CDNs never
/// replay a stale state/URL pair.
pub const NO_STORE_HEADERS: &[(&str, &str)] = &[
    (
        "Cache-Control",
        "no-store, no-cache, must-revalidate, max-age=0",
    ),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// Successful authorize response: redirect target plus the state echoing
/// back at callback time.
#[derive(Debug, Clone)]
pub struct AuthorizeGrant {
    pub authorization_url: Url,
    pub state: String,
}

/// Callback request body.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub code: String,
    pub state: String,
}

/// Successful callback outcome: the verified identity and the application
/// session tokens the reconciler issued for it.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub identity: VerifiedIdentity,
    pub tokens: SessionTokens,
}

/// Builds a registry with the OIDC provider registered under `"oidc"`.
/// Callers add their own providers (local, future OAuth variants) next to it.
pub fn registry_with_oidc(config: ProviderConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register("oidc", move || {
        Ok(Arc::new(OidcProvider::new(config.clone())?) as Arc<dyn AuthProvider>)
    });
    registry
}

pub struct OidcFlow {
    settings: FlowSettings,
    redirect_uri: Url,
    provider: Arc<dyn AuthProvider>,
    store: Arc<dyn TransientStore>,
    limiter: RateLimiter,
    reconciler: Arc<dyn IdentityReconciler>,
}

impl OidcFlow {
    pub fn new(
        settings: FlowSettings,
        redirect_uri: Url,
        provider: Arc<dyn AuthProvider>,
        store: Arc<dyn TransientStore>,
        reconciler: Arc<dyn IdentityReconciler>,
    ) -> Self {
        let limiter = RateLimiter::new(store.clone(), settings.rate_limit_window);
        Self {
            settings,
            redirect_uri,
            provider,
            store,
            limiter,
            reconciler,
        }
    }

    /// GET /auth/oidc/authorize
    ///
    /// Generates state, nonce, and a PKCE pair, persists all three under
    /// their own TTLs, and returns the IdP redirect URL. The attempt is in
    /// the store before the URL leaves this function.
    #[instrument(skip(self), err)]
    pub async fn authorize(&self, client: &str) -> Result<AuthorizeGrant, OidcError> {
        if !self.settings.enabled {
            return Err(OidcError::Disabled);
        }
        self.limiter
            .check_and_increment("authorize", client, self.settings.authorize_rate_limit)
            .await?;

        self.provider.prepare().await?;

        let state = pkce::random_token();
        let nonce = pkce::random_token();
        let (verifier, challenge) = pkce::generate_pkce_pair();

        self.store
            .set(&keys::state(&state), "1", keys::STATE_TTL)
            .await?;
        self.store
            .set(&keys::nonce(&state), &nonce, keys::NONCE_TTL)
            .await?;
        self.store
            .set(&keys::pkce(&state), &verifier, keys::PKCE_TTL)
            .await?;

        let authorization_url = self
            .provider
            .authorization_url(&state, Some(&nonce), Some(&challenge))?
            .ok_or_else(|| {
                OidcError::DiscoveryFailed("provider produced no authorization URL".into())
            })?;

        info!(state = state_prefix(&state), "authorization attempt created");
        Ok(AuthorizeGrant {
            authorization_url,
            state,
        })
    }

    /// POST /auth/oidc/callback
    ///
    /// Consumes the attempt atomically, then exchanges and verifies. Every
    /// failure past the consume is terminal for this attempt: the client
    /// restarts from authorize, and a replayed state can never succeed.
    #[instrument(skip(self, request), err)]
    pub async fn callback(
        &self,
        request: CallbackRequest,
        client: &str,
    ) -> Result<AuthenticatedSession, OidcError> {
        if !self.settings.enabled {
            return Err(OidcError::Disabled);
        }
        self.limiter
            .check_and_increment("callback", client, self.settings.callback_rate_limit)
            .await?;

        if request.code.is_empty() {
            return Err(OidcError::MissingRequestField("code"));
        }
        if request.state.is_empty() {
            return Err(OidcError::MissingRequestField("state"));
        }

        let taken = self
            .store
            .take_attempt(
                &keys::state(&request.state),
                &keys::nonce(&request.state),
                &keys::pkce(&request.state),
            )
            .await?;
        if !taken.state_found {
            return Err(OidcError::InvalidOrExpiredState);
        }
        // A state without its nonce is a hard failure, not a downgrade to
        // nonce-less verification.
        let nonce = taken.nonce.ok_or(OidcError::InvalidOrExpiredNonce)?;
        let verifier = taken.verifier.ok_or(OidcError::InvalidOrExpiredPkce)?;

        let identity = self
            .provider
            .authenticate(Credentials::Oidc {
                code: request.code,
                redirect_uri: self.redirect_uri.to_string(),
                nonce,
                code_verifier: verifier,
            })
            .await?;

        let tokens = self
            .reconciler
            .reconcile(self.provider.provider_id(), &identity)
            .await?;

        info!(
            state = state_prefix(&request.state),
            sub = %identity.provider_user_id,
            "OIDC callback completed"
        );
        Ok(AuthenticatedSession { identity, tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubProvider;

    #[async_trait]
    impl AuthProvider for StubProvider {
        fn provider_id(&self) -> &str {
            "oidc"
        }

        async fn validate_config(&self) -> Result<(), OidcError> {
            Ok(())
        }

        async fn prepare(&self) -> Result<(), OidcError> {
            Ok(())
        }

        fn authorization_url(
            &self,
            state: &str,
            nonce: Option<&str>,
            code_challenge: Option<&str>,
        ) -> Result<Option<Url>, OidcError> {
            let mut url = Url::parse("https://issuer.example.com/oauth/authorize").unwrap();
            url.query_pairs_mut()
                .append_pair("state", state)
                .append_pair("nonce", nonce.unwrap_or_default())
                .append_pair("code_challenge", code_challenge.unwrap_or_default());
            Ok(Some(url))
        }

        async fn authenticate(
            &self,
            credentials: Credentials,
        ) -> Result<VerifiedIdentity, OidcError> {
            let Credentials::Oidc { nonce, .. } = credentials else {
                return Err(OidcError::UnsupportedCredentials);
            };
            assert!(!nonce.is_empty());
            let claims: crate::model::IdTokenClaims = serde_json::from_value(serde_json::json!({
                "iss": "https://issuer.example.com",
                "sub": "stub-user",
                "aud": "client-abc",
                "exp": 2_000_000_000u64,
                "iat": 1_700_000_000u64,
            }))
            .unwrap();
            let tokens: crate::model::TokenResponse =
                serde_json::from_value(serde_json::json!({
                    "id_token": "ey.stub.token",
                    "token_type": "bearer",
                }))
                .unwrap();
            Ok(VerifiedIdentity::from_claims(claims, tokens))
        }
    }

    struct StubReconciler;

    #[async_trait]
    impl IdentityReconciler for StubReconciler {
        async fn reconcile(
            &self,
            provider_id: &str,
            identity: &VerifiedIdentity,
        ) -> Result<SessionTokens, OidcError> {
            assert_eq!(provider_id, "oidc");
            Ok(SessionTokens {
                access_token: format!("access-{}", identity.provider_user_id),
                refresh_token: "refresh".into(),
            })
        }
    }

    fn flow(store: Arc<MemoryStore>, enabled: bool) -> OidcFlow {
        let settings = FlowSettings {
            enabled,
            rate_limit_window: Duration::from_secs(60),
            authorize_rate_limit: 100,
            callback_rate_limit: 100,
            ..FlowSettings::default()
        };
        OidcFlow::new(
            settings,
            Url::parse("https://app.example.com/auth/callback").unwrap(),
            Arc::new(StubProvider),
            store,
            Arc::new(StubReconciler),
        )
    }

    #[tokio::test]
    async fn authorize_fails_when_disabled() {
        let flow = flow(Arc::new(MemoryStore::new()), false);
        assert!(matches!(
            flow.authorize("1.2.3.4").await,
            Err(OidcError::Disabled)
        ));
    }

    #[tokio::test]
    async fn authorize_persists_attempt_before_returning_url() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(store.clone(), true);
        let grant = flow.authorize("1.2.3.4").await.unwrap();

        assert!(store.contains(&keys::state(&grant.state)));
        assert!(store.contains(&keys::nonce(&grant.state)));
        assert!(store.contains(&keys::pkce(&grant.state)));

        let query: Vec<(String, String)> = grant
            .authorization_url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.iter().any(|(k, v)| k == "state" && v == &grant.state));
    }

    #[tokio::test]
    async fn callback_round_trip_consumes_attempt() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(store.clone(), true);
        let grant = flow.authorize("1.2.3.4").await.unwrap();

        let session = flow
            .callback(
                CallbackRequest {
                    code: "auth-code".into(),
                    state: grant.state.clone(),
                },
                "1.2.3.4",
            )
            .await
            .unwrap();
        assert_eq!(session.identity.provider_user_id, "stub-user");
        assert_eq!(session.tokens.access_token, "access-stub-user");

        assert!(!store.contains(&keys::state(&grant.state)));
        assert!(!store.contains(&keys::nonce(&grant.state)));
        assert!(!store.contains(&keys::pkce(&grant.state)));
    }

    #[tokio::test]
    async fn replayed_callback_fails_with_invalid_state() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(store, true);
        let grant = flow.authorize("1.2.3.4").await.unwrap();
        let request = CallbackRequest {
            code: "auth-code".into(),
            state: grant.state,
        };

        flow.callback(request.clone(), "1.2.3.4").await.unwrap();
        let err = flow.callback(request, "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, OidcError::InvalidOrExpiredState));
    }

    #[tokio::test]
    async fn expired_state_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(store.clone(), true);
        let grant = flow.authorize("1.2.3.4").await.unwrap();
        store.expire_now(&keys::state(&grant.state));

        let err = flow
            .callback(
                CallbackRequest {
                    code: "auth-code".into(),
                    state: grant.state,
                },
                "1.2.3.4",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::InvalidOrExpiredState));
    }

    #[tokio::test]
    async fn missing_nonce_is_a_hard_failure() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(store.clone(), true);
        let grant = flow.authorize("1.2.3.4").await.unwrap();
        store.expire_now(&keys::nonce(&grant.state));

        let err = flow
            .callback(
                CallbackRequest {
                    code: "auth-code".into(),
                    state: grant.state,
                },
                "1.2.3.4",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::InvalidOrExpiredNonce));
    }

    #[tokio::test]
    async fn missing_pkce_verifier_is_a_hard_failure() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(store.clone(), true);
        let grant = flow.authorize("1.2.3.4").await.unwrap();
        store.expire_now(&keys::pkce(&grant.state));

        let err = flow
            .callback(
                CallbackRequest {
                    code: "auth-code".into(),
                    state: grant.state,
                },
                "1.2.3.4",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::InvalidOrExpiredPkce));
    }

    #[tokio::test]
    async fn missing_request_fields_are_rejected() {
        let flow = flow(Arc::new(MemoryStore::new()), true);
        let err = flow
            .callback(
                CallbackRequest {
                    code: String::new(),
                    state: "s".into(),
                },
                "1.2.3.4",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::MissingRequestField("code")));
    }

    #[tokio::test]
    async fn authorize_rate_limit_applies() {
        let store = Arc::new(MemoryStore::new());
        let settings = FlowSettings {
            enabled: true,
            authorize_rate_limit: 1,
            ..FlowSettings::default()
        };
        let flow = OidcFlow::new(
            settings,
            Url::parse("https://app.example.com/auth/callback").unwrap(),
            Arc::new(StubProvider),
            store,
            Arc::new(StubReconciler),
        );

        flow.authorize("1.2.3.4").await.unwrap();
        let err = flow.authorize("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, OidcError::RateLimitExceeded { .. }));
        // A different client is unaffected.
        flow.authorize("5.6.7.8").await.unwrap();
    }
}
