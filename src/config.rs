// src/config.rs

use std::net::IpAddr;
use std::time::Duration;

use url::Url;

use crate::error::OidcError;

pub const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];
pub const DEFAULT_JWKS_CACHE_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_AUTHORIZE_RATE_LIMIT: u32 = 10;
pub const DEFAULT_CALLBACK_RATE_LIMIT: u32 = 5;
pub const DEFAULT_CLIENT_IP_HEADERS: &str = "cf-connecting-ip,x-real-ip";

/// Validates that `raw` is a well-formed URL, uses HTTPS, and is same-origin
/// with the issuer. Plain `http` is tolerated only for loopback hosts so the
/// full flow can run against a local IdP or a test double.
///
/// Every endpoint referenced by a discovery document passes through this
/// check, so a compromised discovery document cannot redirect key or token
/// lookups to an attacker-controlled host.
pub(crate) fn validate_provider_endpoint(
    raw: &str,
    issuer: &Url,
    what: &str,
) -> Result<Url, OidcError> {
    let url = Url::parse(raw).map_err(|e| OidcError::InvalidUrl(format!("{what}: {e}")))?;
    require_https_or_loopback(&url, what)?;
    if url.origin() != issuer.origin() {
        return Err(OidcError::InsecureEndpoint(format!(
            "{what} is not same-origin with issuer"
        )));
    }
    Ok(url)
}

pub(crate) fn require_https_or_loopback(url: &Url, what: &str) -> Result<(), OidcError> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(url) => Ok(()),
        other => Err(OidcError::InsecureEndpoint(format!(
            "{what} must use https, got '{other}'"
        ))),
    }
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

/// Immutable per-provider configuration, validated at construction time and
/// long-lived for the process lifetime.
#[derive(Clone)]
pub struct ProviderConfig {
    /// Display name for UI purposes (e.g., "Google", "Company SSO").
    pub provider_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub issuer: Url,
    /// Derived from the issuer unless overridden; always HTTPS and
    /// same-origin with the issuer.
    pub discovery_url: Url,
    /// Ordered scope list, space-joined into the authorization request.
    pub scopes: Vec<String>,
    pub redirect_uri: Url,
    pub jwks_cache_ttl: Duration,
}

// Manual Debug so the client secret never leaks through derived formatting.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_name", &self.provider_name)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("issuer", &self.issuer.as_str())
            .field("discovery_url", &self.discovery_url.as_str())
            .field("scopes", &self.scopes)
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .finish()
    }
}

/// Builder for [`ProviderConfig`]. Required fields: `client_id`,
/// `client_secret`, `issuer`, `redirect_uri`.
#[derive(Default)]
pub struct ProviderConfigBuilder {
    provider_name: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    issuer: Option<Url>,
    discovery_url: Option<String>,
    scopes: Option<Vec<String>>,
    redirect_uri: Option<String>,
    jwks_cache_ttl: Option<Duration>,
}

impl ProviderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Sets the issuer URL, e.g. "https://accounts.google.com".
    pub fn issuer(mut self, url: &str) -> Result<Self, OidcError> {
        let parsed =
            Url::parse(url).map_err(|e| OidcError::InvalidUrl(format!("issuer: {e}")))?;
        self.issuer = Some(parsed);
        Ok(self)
    }

    /// Overrides the discovery URL. Must still be HTTPS and same-origin with
    /// the issuer; validated in `build`.
    pub fn discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = Some(url.into());
        self
    }

    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn redirect_uri(mut self, url: impl Into<String>) -> Self {
        self.redirect_uri = Some(url.into());
        self
    }

    pub fn jwks_cache_ttl(mut self, ttl: Duration) -> Self {
        self.jwks_cache_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<ProviderConfig, OidcError> {
        let client_id = self
            .client_id
            .filter(|v| !v.is_empty())
            .ok_or(OidcError::MissingConfiguration("client_id".into()))?;
        let client_secret = self
            .client_secret
            .filter(|v| !v.is_empty())
            .ok_or(OidcError::MissingConfiguration("client_secret".into()))?;
        let issuer = self
            .issuer
            .ok_or(OidcError::MissingConfiguration("issuer".into()))?;
        require_https_or_loopback(&issuer, "issuer")?;

        let discovery_url = match self.discovery_url.filter(|v| !v.is_empty()) {
            Some(raw) => validate_provider_endpoint(&raw, &issuer, "discovery_url")?,
            None => {
                let raw = format!(
                    "{}/.well-known/openid-configuration",
                    issuer.as_str().trim_end_matches('/')
                );
                Url::parse(&raw).map_err(|e| OidcError::InvalidUrl(format!("discovery_url: {e}")))?
            }
        };

        let redirect_uri_raw = self
            .redirect_uri
            .filter(|v| !v.is_empty())
            .ok_or(OidcError::MissingConfiguration("redirect_uri".into()))?;
        let redirect_uri = Url::parse(&redirect_uri_raw)
            .map_err(|e| OidcError::InvalidUrl(format!("redirect_uri: {e}")))?;

        let scopes = self
            .scopes
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());

        Ok(ProviderConfig {
            provider_name: self.provider_name.unwrap_or_default(),
            client_id,
            client_secret,
            issuer,
            discovery_url,
            scopes,
            redirect_uri,
            jwks_cache_ttl: self.jwks_cache_ttl.unwrap_or(DEFAULT_JWKS_CACHE_TTL),
        })
    }
}

/// Flow-level settings: the enable flag, rate limits, and client-IP
/// resolution policy for the authorize/callback endpoints.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub enabled: bool,
    pub rate_limit_window: Duration,
    pub authorize_rate_limit: u32,
    pub callback_rate_limit: u32,
    /// Direct peers allowed to set forwarded-for style headers.
    pub trusted_proxies: Vec<IpAddr>,
    /// Priority-ordered header names consulted for the real client IP when
    /// the direct peer is a trusted proxy.
    pub client_ip_headers: Vec<String>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            authorize_rate_limit: DEFAULT_AUTHORIZE_RATE_LIMIT,
            callback_rate_limit: DEFAULT_CALLBACK_RATE_LIMIT,
            trusted_proxies: Vec::new(),
            client_ip_headers: parse_csv(DEFAULT_CLIENT_IP_HEADERS),
        }
    }
}

/// Full configuration surface, one environment variable per item.
#[derive(Debug)]
pub struct OidcSettings {
    pub flow: FlowSettings,
    /// Present only when OIDC is enabled.
    pub provider: Option<ProviderConfig>,
}

impl OidcSettings {
    /// Loads settings from `OIDC_*` environment variables. Provider fields
    /// are only required (and only validated) when `OIDC_ENABLED` is set.
    pub fn from_env() -> Result<Self, OidcError> {
        let enabled = env_bool("OIDC_ENABLED");

        let flow = FlowSettings {
            enabled,
            rate_limit_window: Duration::from_secs(
                env_parse("OIDC_RATE_LIMIT_WINDOW_SECONDS")?.unwrap_or(60),
            ),
            authorize_rate_limit: env_parse("OIDC_AUTHORIZE_RATE_LIMIT")?
                .unwrap_or(DEFAULT_AUTHORIZE_RATE_LIMIT),
            callback_rate_limit: env_parse("OIDC_CALLBACK_RATE_LIMIT")?
                .unwrap_or(DEFAULT_CALLBACK_RATE_LIMIT),
            trusted_proxies: parse_csv(&env_string("OIDC_TRUSTED_PROXY_IPS"))
                .iter()
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|_| {
                        OidcError::MissingConfiguration(format!(
                            "OIDC_TRUSTED_PROXY_IPS contains invalid address '{s}'"
                        ))
                    })
                })
                .collect::<Result<_, _>>()?,
            client_ip_headers: {
                let raw = env_string("OIDC_CLIENT_IP_HEADERS");
                if raw.is_empty() {
                    parse_csv(DEFAULT_CLIENT_IP_HEADERS)
                } else {
                    parse_csv(&raw)
                }
            },
        };

        if !enabled {
            return Ok(Self {
                flow,
                provider: None,
            });
        }

        let mut builder = ProviderConfigBuilder::new()
            .provider_name(env_string("OIDC_PROVIDER_NAME"))
            .client_id(env_string("OIDC_CLIENT_ID"))
            .client_secret(env_string("OIDC_CLIENT_SECRET"))
            .issuer(&env_string("OIDC_ISSUER"))?
            .redirect_uri(env_string("OIDC_REDIRECT_URI"));

        let discovery = env_string("OIDC_DISCOVERY_URL");
        if !discovery.is_empty() {
            builder = builder.discovery_url(discovery);
        }
        let scopes = env_string("OIDC_SCOPES");
        if !scopes.is_empty() {
            builder = builder.scopes(scopes.split_whitespace().map(String::from).collect());
        }
        if let Some(ttl) = env_parse::<u64>("OIDC_JWKS_CACHE_TTL_SECONDS")? {
            builder = builder.jwks_cache_ttl(Duration::from_secs(ttl));
        }

        Ok(Self {
            flow,
            provider: Some(builder.build()?),
        })
    }
}

fn env_string(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_string(name).to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, OidcError> {
    let raw = env_string(name);
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| OidcError::MissingConfiguration(format!("{name} has invalid value '{raw}'")))
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::new()
            .client_id("client-abc")
            .client_secret("secret")
            .issuer("https://issuer.example.com")
            .unwrap()
            .redirect_uri("https://app.example.com/auth/callback")
    }

    #[test]
    fn derives_discovery_url_from_issuer() {
        let config = base_builder().build().unwrap();
        assert_eq!(
            config.discovery_url.as_str(),
            "https://issuer.example.com/.well-known/openid-configuration"
        );
        assert_eq!(config.scopes, vec!["openid", "email", "profile"]);
        assert_eq!(config.jwks_cache_ttl, DEFAULT_JWKS_CACHE_TTL);
    }

    #[test]
    fn rejects_non_https_issuer() {
        let result = ProviderConfigBuilder::new()
            .client_id("c")
            .client_secret("s")
            .issuer("http://issuer.example.com")
            .unwrap()
            .redirect_uri("https://app.example.com/cb")
            .build();
        assert!(matches!(result, Err(OidcError::InsecureEndpoint(_))));
    }

    #[test]
    fn allows_http_for_loopback_issuer() {
        let config = ProviderConfigBuilder::new()
            .client_id("c")
            .client_secret("s")
            .issuer("http://127.0.0.1:8443")
            .unwrap()
            .redirect_uri("http://localhost:3000/cb")
            .build()
            .unwrap();
        assert_eq!(config.issuer.as_str(), "http://127.0.0.1:8443/");
    }

    #[test]
    fn rejects_cross_origin_discovery_override() {
        let result = base_builder()
            .discovery_url("https://evil.example.net/.well-known/openid-configuration")
            .build();
        assert!(matches!(result, Err(OidcError::InsecureEndpoint(_))));
    }

    #[test]
    fn accepts_same_origin_discovery_override() {
        let config = base_builder()
            .discovery_url("https://issuer.example.com/custom/openid-configuration")
            .build()
            .unwrap();
        assert_eq!(
            config.discovery_url.as_str(),
            "https://issuer.example.com/custom/openid-configuration"
        );
    }

    #[test]
    fn missing_required_fields_fail() {
        let result = ProviderConfigBuilder::new()
            .client_id("c")
            .issuer("https://issuer.example.com")
            .unwrap()
            .redirect_uri("https://app.example.com/cb")
            .build();
        assert!(matches!(result, Err(OidcError::MissingConfiguration(f)) if f == "client_secret"));
    }

    #[test]
    fn endpoint_validation_rejects_cross_origin() {
        let issuer = Url::parse("https://issuer.example.com").unwrap();
        assert!(
            validate_provider_endpoint("https://other.example.com/jwks", &issuer, "jwks_uri")
                .is_err()
        );
        assert!(
            validate_provider_endpoint("http://issuer.example.com/jwks", &issuer, "jwks_uri")
                .is_err()
        );
        assert!(
            validate_provider_endpoint("https://issuer.example.com/jwks", &issuer, "jwks_uri")
                .is_ok()
        );
    }

    #[test]
    fn debug_redacts_client_secret() {
        let config = ProviderConfigBuilder::new()
            .client_id("client-abc")
            .client_secret("hunter2-do-not-log")
            .issuer("https://issuer.example.com")
            .unwrap()
            .redirect_uri("https://app.example.com/cb")
            .build()
            .unwrap();
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2-do-not-log"));
    }

    #[test]
    fn parse_csv_trims_and_lowercases() {
        assert_eq!(
            parse_csv("CF-Connecting-IP, X-Real-IP"),
            vec!["cf-connecting-ip", "x-real-ip"]
        );
        assert!(parse_csv("").is_empty());
    }
}
