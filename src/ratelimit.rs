// src/ratelimit.rs
//
// Fixed-window rate limiting for the authorize and callback endpoints,
// backed by the transient store so limits hold across processes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::config::FlowSettings;
use crate::error::OidcError;
use crate::store::{keys, TransientStore};

pub struct RateLimiter {
    store: Arc<dyn TransientStore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TransientStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Increments the window counter for `(action, client)` and fails with
    /// `RateLimitExceeded` once the post-increment count passes `limit`.
    /// The window expiry is set on the first increment only (fixed window).
    /// A `limit` of zero disables the check.
    #[instrument(skip(self), err)]
    pub async fn check_and_increment(
        &self,
        action: &str,
        client: &str,
        limit: u32,
    ) -> Result<(), OidcError> {
        if limit == 0 {
            return Ok(());
        }
        let counted = self
            .store
            .incr_window(&keys::rate_limit(action, client), self.window)
            .await?;
        if counted.count > u64::from(limit) {
            warn!(action, client, count = counted.count, limit, "rate limit exceeded");
            return Err(OidcError::RateLimitExceeded {
                retry_after_secs: counted.retry_after_secs.max(1),
            });
        }
        Ok(())
    }
}

/// Resolves the client identifier used for rate limiting.
///
/// The direct transport peer is authoritative. Forwarded-for style headers
/// are consulted only when the peer itself is in the trusted-proxy list, in
/// the configured priority order, taking the first comma-separated value.
/// Anything else would let an untrusted client pick its own rate-limit
/// bucket with a spoofed header.
pub fn resolve_client_ip(
    settings: &FlowSettings,
    peer: IpAddr,
    headers: &[(String, String)],
) -> String {
    if !settings.trusted_proxies.contains(&peer) {
        return peer.to_string();
    }
    for name in &settings.client_ip_headers {
        let value = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str());
        if let Some(value) = value {
            let first = value.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first.parse::<IpAddr>() {
                return ip.to_string();
            }
        }
    }
    peer.to_string()
}
