//! `PushNotifier` is consumed as an external collaborator (FCM/APNs
//! adapters live outside this core); only the interface and a logging
//! stand-in implementation live here.

use async_trait::async_trait;
use secureconnect_protocol::UserId;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    NewMessage,
    IncomingCall,
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn send(&self, user_id: UserId, kind: PushKind, title: &str, body: &str, data: Value);
}

/// Logs instead of delivering; used until a provider adapter is wired in.
pub struct LoggingPushNotifier;

#[async_trait]
impl PushNotifier for LoggingPushNotifier {
    async fn send(&self, user_id: UserId, kind: PushKind, title: &str, body: &str, data: Value) {
        debug!(%user_id, ?kind, title, body, %data, "push notification (no provider configured)");
    }
}
