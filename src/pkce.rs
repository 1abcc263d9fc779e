// src/pkce.rs
//
// PKCE (RFC 7636, S256 only) plus the random tokens the authorization
// request needs: CSRF state and the replay nonce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Unreserved characters permitted in a PKCE code verifier (RFC 7636 §4.1).
const VERIFIER_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Verifier length in characters. 43 chars over a 64-symbol alphabet is
/// ~258 bits of entropy, above the 32-byte floor required here.
const VERIFIER_LEN: usize = 43;

/// Generates a random PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    (0..VERIFIER_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..VERIFIER_CHARSET.len());
            VERIFIER_CHARSET[idx] as char
        })
        .collect()
}

/// Derives the S256 code challenge: `base64url_nopad(sha256(verifier))`.
/// The plain method is deliberately unsupported.
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generates verifier and challenge together.
pub fn generate_pkce_pair() -> (String, String) {
    let verifier = generate_code_verifier();
    let challenge = code_challenge(&verifier);
    (verifier, challenge)
}

/// A high-entropy URL-safe random token, used for both the CSRF `state`
/// parameter and the ID-token `nonce`. 32 bytes before encoding.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

static CACHE_BUSTER: AtomicU64 = AtomicU64::new(0);

/// Monotonically-increasing value for the `_t` query parameter, so
/// identical-looking authorization requests are never served from an
/// intermediate cache. Seeded from the clock, then strictly increasing even
/// if the clock steps backwards.
pub fn cache_buster() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    CACHE_BUSTER
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .map(|last| now.max(last + 1))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn challenge_matches_rfc7636_test_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_uses_allowed_charset_and_length() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), VERIFIER_LEN);
        assert!(verifier.bytes().all(|b| VERIFIER_CHARSET.contains(&b)));
    }

    #[test]
    fn pkce_pairs_are_unique_and_rederivable() {
        let mut verifiers = HashSet::new();
        let mut challenges = HashSet::new();
        for _ in 0..10_000 {
            let (verifier, challenge) = generate_pkce_pair();
            assert_eq!(code_challenge(&verifier), challenge);
            assert!(verifiers.insert(verifier));
            assert!(challenges.insert(challenge));
        }
    }

    #[test]
    fn random_tokens_are_unique() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        // 32 bytes base64url-encoded without padding.
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn cache_buster_is_strictly_increasing() {
        let mut last = cache_buster();
        for _ in 0..1000 {
            let next = cache_buster();
            assert!(next > last);
            last = next;
        }
    }
}
