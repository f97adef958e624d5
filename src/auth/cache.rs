use std::time::{Duration, Instant};

use log::trace;
use moka::{Expiry, future::Cache};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    authority: String,
    scheme: &'static str,
    scope_key: String,
}

impl CacheKey {
    pub fn basic(authority: impl Into<String>) -> Self {
        CacheKey {
            authority: authority.into(),
            scheme: "basic",
            scope_key: String::new(),
        }
    }

    pub fn bearer(authority: impl Into<String>, scope_key: impl Into<String>) -> Self {
        CacheKey {
            authority: authority.into(),
            scheme: "bearer",
            scope_key: scope_key.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<CacheKey, Token> for ExpireToken {
    fn expire_after_create(&self, key: &CacheKey, value: &Token, _now: Instant) -> Option<Duration> {
        trace!("{key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

/// Bounded, TTL-evicting, concurrency-safe cache of tokens keyed by
/// `(authority, scheme, scope-key)`. Built the same way as a per-registry token cache,
/// generalised so distinct scopes on the same authority do not collide.
#[derive(Clone)]
pub struct TokenCache {
    cache: Cache<CacheKey, Token>,
}

impl TokenCache {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .weigher(|k: &CacheKey, v: &Token| {
                (k.authority.len() + k.scope_key.len() + v.value.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .eviction_listener(|k, _v, reason| {
                trace!("token eviction {k:?} {reason:?}");
            })
            .expire_after(ExpireToken)
            .build();
        TokenCache { cache }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Token> {
        self.cache.get(key).await
    }

    // moka stores the init future's error behind an Arc so concurrent waiters can share
    // it; since our Error isn't Clone, we drop it to a fixed variant the way the teacher's
    // own token-fetch path does ("drop the error to go from Arc<Error> to Error").
    pub async fn get_with(
        &self,
        key: CacheKey,
        init: impl Future<Output = Result<Token, crate::auth::Error>>,
    ) -> Result<Token, crate::auth::Error> {
        self.cache
            .entry(key)
            .or_try_insert_with(init)
            .await
            .map(|entry| entry.into_value())
            .map_err(|e| {
                log::error!("token acquisition failed: {e:?}");
                crate::auth::Error::AuthenticationFailed
            })
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(10_000_000)
    }
}
