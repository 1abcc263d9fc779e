// src/store.rs
//
// Transient key-value storage for CSRF state, nonces, PKCE verifiers, and
// rate-limit counters. Every key carries its own TTL; the callback path
// depends on `take_attempt` being atomic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::OidcError;

/// Key templates and TTL constants, centralized so the namespaces stay
/// private to this subsystem.
pub mod keys {
    use std::time::Duration;

    /// CSRF state marker and its companions live for five minutes; an
    /// abandoned flow simply expires.
    pub const STATE_TTL: Duration = Duration::from_secs(300);
    pub const NONCE_TTL: Duration = Duration::from_secs(300);
    pub const PKCE_TTL: Duration = Duration::from_secs(300);

    /// CSRF state existence marker. Value is always `"1"`.
    pub fn state(state: &str) -> String {
        format!("oidc_state:{state}")
    }

    /// Replay nonce, keyed by the state it belongs to.
    pub fn nonce(state: &str) -> String {
        format!("oidc_nonce:{state}")
    }

    /// PKCE code verifier, keyed by the state it belongs to.
    pub fn pkce(state: &str) -> String {
        format!("oidc_pkce:{state}")
    }

    /// Fixed-window rate-limit counter.
    pub fn rate_limit(action: &str, client: &str) -> String {
        format!("oidc_rl:{action}:{client}")
    }
}

/// Result of atomically consuming one authorization attempt.
///
/// All three keys are deleted in the same transaction that reads them, so a
/// second concurrent callback with the same state observes nothing, never a
/// partially-consumed attempt.
#[derive(Debug, Clone)]
pub struct TakenAttempt {
    pub state_found: bool,
    pub nonce: Option<String>,
    pub verifier: Option<String>,
}

/// Result of one fixed-window counter increment.
#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    /// Post-increment count within the current window.
    pub count: u64,
    /// Remaining window in seconds, floored at 1 for Retry-After use.
    pub retry_after_secs: u64,
}

/// A key-value store with per-key TTL, atomic multi-key read+delete, and
/// atomic increment-with-expire. Backends: in-memory ([`MemoryStore`]) and
/// Redis (`RedisStore`, behind the `redis-store` feature).
#[async_trait]
pub trait TransientStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OidcError>;

    async fn get(&self, key: &str) -> Result<Option<String>, OidcError>;

    async fn delete(&self, key: &str) -> Result<(), OidcError>;

    /// In one transaction: check existence of `state_key`, read `nonce_key`
    /// and `verifier_key`, then delete all three.
    async fn take_attempt(
        &self,
        state_key: &str,
        nonce_key: &str,
        verifier_key: &str,
    ) -> Result<TakenAttempt, OidcError>;

    /// Increments a window counter. The expiry is set to `window` on the
    /// first increment only, making the window fixed rather than sliding.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, OidcError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory [`TransientStore`]. Suitable for tests and single-process
/// deployments; a multi-process deployment needs the Redis backend so both
/// flow legs can land on different processes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops an entry regardless of TTL. Test hook for simulating expiry.
    pub fn expire_now(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl TransientStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OidcError> {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, OidcError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn delete(&self, key: &str) -> Result<(), OidcError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn take_attempt(
        &self,
        state_key: &str,
        nonce_key: &str,
        verifier_key: &str,
    ) -> Result<TakenAttempt, OidcError> {
        // One lock held across check + reads + deletes gives the same
        // atomicity a Redis MULTI/EXEC pipeline provides.
        let mut entries = self.entries.lock().unwrap();
        let state_found = Self::live_value(&mut entries, state_key).is_some();
        let nonce = Self::live_value(&mut entries, nonce_key);
        let verifier = Self::live_value(&mut entries, verifier_key);
        entries.remove(state_key);
        entries.remove(nonce_key);
        entries.remove(verifier_key);
        Ok(TakenAttempt {
            state_found,
            nonce,
            verifier,
        })
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, OidcError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                let count = entry.value.parse::<u64>().unwrap_or(0) + 1;
                entry.value = count.to_string();
                let retry_after_secs = entry
                    .expires_at
                    .saturating_duration_since(now)
                    .as_secs()
                    .max(1);
                Ok(WindowCount {
                    count,
                    retry_after_secs,
                })
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: now + window,
                    },
                );
                Ok(WindowCount {
                    count: 1,
                    retry_after_secs: window.as_secs().max(1),
                })
            }
        }
    }
}
