// src/redis_store.rs
//
// Redis-backed TransientStore. This is the backend a multi-process
// deployment needs: the authorize and callback legs of one flow may land on
// different server processes, so the attempt state has to live in a shared
// store with genuinely atomic consume.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::OidcError;
use crate::store::{TakenAttempt, TransientStore, WindowCount};

// INCR and EXPIRE must be one server-side step; a client-side sequence would
// leave counters without TTLs when a client dies between the two calls.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 1 then
    ttl = 1
end
return {count, ttl}
"#;

pub struct RedisStore {
    conn: MultiplexedConnection,
    incr_window: redis::Script,
}

impl RedisStore {
    /// Connects to Redis at `url` (e.g., "redis://127.0.0.1:6379/0").
    pub async fn connect(url: &str) -> Result<Self, OidcError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_err)?;
        Ok(Self {
            conn,
            incr_window: redis::Script::new(INCR_WINDOW_SCRIPT),
        })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            incr_window: redis::Script::new(INCR_WINDOW_SCRIPT),
        }
    }
}

fn store_err(err: redis::RedisError) -> OidcError {
    OidcError::Store(err.to_string())
}

#[async_trait]
impl TransientStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OidcError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, OidcError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<(), OidcError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(store_err)?;
        Ok(())
    }

    async fn take_attempt(
        &self,
        state_key: &str,
        nonce_key: &str,
        verifier_key: &str,
    ) -> Result<TakenAttempt, OidcError> {
        let mut conn = self.conn.clone();
        // MULTI/EXEC: the existence check, reads, and deletes execute as one
        // transaction, so concurrent callbacks with the same state cannot
        // interleave between check and delete.
        let (state_found, nonce, verifier): (bool, Option<String>, Option<String>) = redis::pipe()
            .atomic()
            .exists(state_key)
            .get(nonce_key)
            .get(verifier_key)
            .del(state_key)
            .ignore()
            .del(nonce_key)
            .ignore()
            .del(verifier_key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(TakenAttempt {
            state_found,
            nonce,
            verifier,
        })
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, OidcError> {
        let mut conn = self.conn.clone();
        let (count, retry_after_secs): (u64, u64) = self
            .incr_window
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(WindowCount {
            count,
            retry_after_secs,
        })
    }
}
