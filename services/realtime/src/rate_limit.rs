//! Per-`(user, scope)` token buckets, guarded by fine-grained per-key
//! locks via a `RwLock<HashMap<_>>` registry -- the same get-or-create
//! shape used for the hub's subscription registries.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio::sync::RwLock;

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RateLimiters {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    per_minute: u32,
}

impl RateLimiters {
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            per_minute,
        }
    }

    async fn get_or_create(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().await.get(key) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get(key) {
            return bucket.clone();
        }
        let quota = Quota::per_minute(NonZeroU32::new(self.per_minute).unwrap());
        let bucket = Arc::new(GovernorLimiter::direct(quota));
        buckets.insert(key.to_string(), bucket.clone());
        bucket
    }

    /// Returns `true` if the call is allowed under the `(user, scope)` bucket.
    pub async fn check(&self, user_key: &str, scope: &str) -> bool {
        let key = format!("{user_key}:{scope}");
        self.get_or_create(&key).await.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_scopes_have_independent_buckets() {
        let limiters = RateLimiters::new(1);
        assert!(limiters.check("u1", "send:c1").await);
        assert!(!limiters.check("u1", "send:c1").await);
        assert!(limiters.check("u1", "send:c2").await);
    }

    #[tokio::test]
    async fn distinct_users_have_independent_buckets() {
        let limiters = RateLimiters::new(1);
        assert!(limiters.check("u1", "call:initiate").await);
        assert!(limiters.check("u2", "call:initiate").await);
    }
}
