//! Best-effort per-user liveness tracking with a TTL, backed by the same
//! Redis deployment as the pub/sub bus. Absence is never treated as
//! authoritative "offline" — only as "no recent heartbeat".

use std::time::Duration;

use redis::aio::ConnectionManager;
use secureconnect_protocol::{CoreError, UserId};

pub struct Presence {
    manager: ConnectionManager,
    ttl: Duration,
}

impl Presence {
    #[must_use]
    pub fn new(manager: ConnectionManager, ttl: Duration) -> Self {
        Self { manager, ttl }
    }

    fn key(user_id: UserId) -> String {
        format!("presence:{user_id}")
    }

    pub async fn touch(&self, user_id: UserId) -> Result<(), CoreError> {
        let mut manager = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::key(user_id))
            .arg(1)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async::<()>(&mut manager)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))
    }

    pub async fn is_recently_live(&self, user_id: UserId) -> Result<bool, CoreError> {
        let mut manager = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::key(user_id))
            .query_async(&mut manager)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(exists)
    }
}
