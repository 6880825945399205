//! Cross-instance pub/sub bridge with degraded-mode tracking, backed by
//! Redis. Publish/subscribe is the cross-instance fan-out path a hub uses
//! to reach sockets held open on other processes.

pub mod presence;

pub use presence::Presence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use secureconnect_protocol::limits::BUS_HEALTH_CHECK_DEADLINE;
use secureconnect_protocol::CoreError;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Ok,
    Degraded,
    Failed,
}

/// One event delivered on a subscription stream.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Sent once, before the first payload, once the subscription is live.
    SubscribeReady,
    Payload(Vec<u8>),
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> PublishOutcome;

    /// Long-lived. The returned stream ends when `cancel` fires, the
    /// upstream connection closes, or the bus is degraded.
    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<BusEvent>, CoreError>;

    async fn health_check(&self) -> Result<(), CoreError>;

    fn is_degraded(&self) -> bool;
}

/// Invoked exactly once per degraded-flag edge transition, for metrics.
pub type DegradedTransitionCallback = Arc<dyn Fn(bool) + Send + Sync>;

pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    degraded: AtomicBool,
    health_check_lock: Mutex<()>,
    on_transition: Option<DegradedTransitionCallback>,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, CoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CoreError::Internal(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            manager,
            degraded: AtomicBool::new(false),
            health_check_lock: Mutex::new(()),
            on_transition: None,
        })
    }

    #[must_use]
    pub fn with_transition_callback(mut self, cb: DegradedTransitionCallback) -> Self {
        self.on_transition = Some(cb);
        self
    }

    /// Shares the same managed connection the bus uses, for `Presence` to
    /// reuse rather than opening a second pool.
    #[must_use]
    pub fn connection_manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn set_degraded(&self, degraded: bool) {
        let previous = self.degraded.swap(degraded, Ordering::SeqCst);
        if previous != degraded {
            if let Some(cb) = &self.on_transition {
                cb(degraded);
            }
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> PublishOutcome {
        if self.is_degraded() {
            return PublishOutcome::Degraded;
        }
        let mut manager = self.manager.clone();
        let result: Result<(), redis::RedisError> =
            redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut manager).await;
        match result {
            Ok(()) => PublishOutcome::Ok,
            Err(e) => {
                warn!(error = %e, channel, "bus publish failed, marking degraded");
                self.set_degraded(true);
                PublishOutcome::Failed
            }
        }
    }

    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<BusEvent>, CoreError> {
        if self.is_degraded() {
            return Err(CoreError::Degraded("bus is degraded".into()));
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let (tx, rx) = mpsc::channel(secureconnect_protocol::limits::Q_HUB);
        let _ = tx.send(BusEvent::SubscribeReady).await;

        let channel_owned = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(channel = %channel_owned, "subscription cancelled");
                        break;
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
                                if tx.send(BusEvent::Payload(payload)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                debug!(channel = %channel_owned, "upstream subscription closed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        let _guard = self.health_check_lock.lock().await;
        let mut manager = self.manager.clone();
        let result = tokio::time::timeout(
            BUS_HEALTH_CHECK_DEADLINE,
            redis::cmd("PING").query_async::<String>(&mut manager),
        )
        .await;
        match result {
            Ok(Ok(_)) => {
                self.set_degraded(false);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_degraded(true);
                Err(CoreError::Degraded(e.to_string()))
            }
            Err(_) => {
                self.set_degraded(true);
                Err(CoreError::Degraded("health check timed out".into()))
            }
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn transition_callback_fires_once_per_edge() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let flag = AtomicBool::new(false);
        let on_transition = move |degraded: bool| {
            if degraded {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }
        };

        // Simulate the same swap-and-compare logic RedisBus::set_degraded uses,
        // without requiring a live Redis connection for this unit test.
        for degraded in [false, true, true, false, true] {
            let previous = flag.swap(degraded, Ordering::SeqCst);
            if previous != degraded {
                on_transition(degraded);
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
