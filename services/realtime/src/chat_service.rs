//! Orchestrates `sendMessage`: authorize -> validate -> rate-limit ->
//! idempotent persist -> best-effort publish -> detached push fan-out.
//! Modeled on the persist-then-broadcast-then-ack sequence used for
//! ingesting event batches elsewhere in this codebase.

use std::sync::Arc;
use std::time::Duration;

use secureconnect_bus::{Bus, PublishOutcome};
use secureconnect_protocol::limits::{
    MAX_CONTENT_BYTES, MAX_TEXT_CONTENT_BYTES, STORE_READ_DEADLINE, STORE_WRITE_DEADLINE,
};
use secureconnect_protocol::{ChatFrame, ConversationId, CoreError, Message, MessageKind, UserId};
use secureconnect_store::{AppendResult, MembershipStore, MessageStore};
use tracing::{info, warn};

use crate::push::{PushKind, PushNotifier};
use crate::rate_limit::RateLimiters;

pub struct ChatService {
    membership: Arc<dyn MembershipStore>,
    messages: Arc<dyn MessageStore>,
    bus: Arc<dyn Bus>,
    push: Arc<dyn PushNotifier>,
    rate_limiters: Arc<RateLimiters>,
}

impl ChatService {
    #[must_use]
    pub fn new(
        membership: Arc<dyn MembershipStore>,
        messages: Arc<dyn MessageStore>,
        bus: Arc<dyn Bus>,
        push: Arc<dyn PushNotifier>,
        rate_limiters: Arc<RateLimiters>,
    ) -> Self {
        Self { membership, messages, bus, push, rate_limiters }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: Vec<u8>,
        kind: MessageKind,
        is_encrypted: bool,
        metadata: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Message, CoreError> {
        // 1. Authorize.
        if !self
            .membership
            .is_participant(conversation_id, sender_id, STORE_READ_DEADLINE)
            .await?
        {
            return Err(CoreError::Unauthorized(format!(
                "{sender_id} is not a participant of {conversation_id}"
            )));
        }

        // 2. Validate.
        if content.len() > MAX_CONTENT_BYTES {
            return Err(CoreError::InvalidArgument("content exceeds MaxContentBytes".into()));
        }
        if kind == MessageKind::Text && content.len() > MAX_TEXT_CONTENT_BYTES {
            return Err(CoreError::InvalidArgument("text content exceeds the 10 KiB text limit".into()));
        }

        // 3. Rate-limit.
        let scope = format!("send:{conversation_id}");
        if !self.rate_limiters.check(&sender_id.to_string(), &scope).await {
            return Err(CoreError::Throttled("message rate limit exceeded for this conversation".into()));
        }

        // 4 & 5. Idempotent persist. `append` performs the conflict check atomically;
        // a prior message short-circuits here without republishing.
        let result = self
            .messages
            .append(
                conversation_id,
                sender_id,
                kind,
                content,
                is_encrypted,
                metadata,
                idempotency_key,
                STORE_WRITE_DEADLINE,
            )
            .await?;

        let message = match result {
            AppendResult::Existing(message) => return Ok(message),
            AppendResult::Inserted(message) => message,
        };

        // 6. Publish, best-effort. Persist already succeeded; publish failure
        // is logged and counted, never surfaced to the caller.
        let frame = ChatFrame::Message { message: message.clone() };
        if let Ok(payload) = serde_json::to_vec(&frame) {
            let channel = format!("chat:{conversation_id}");
            match self.bus.publish(&channel, payload).await {
                PublishOutcome::Ok => {}
                PublishOutcome::Degraded => {
                    info!(%conversation_id, "publish skipped, bus degraded");
                }
                PublishOutcome::Failed => {
                    warn!(%conversation_id, "publish failed");
                }
            }
        }

        // 7. Notify, detached, best-effort, off the request path.
        self.spawn_push_fanout(conversation_id, sender_id, message.id);

        Ok(message)
    }

    pub async fn read_range(
        &self,
        conversation_id: ConversationId,
        requester_id: UserId,
        before: Option<secureconnect_protocol::MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, CoreError> {
        if !self
            .membership
            .is_participant(conversation_id, requester_id, STORE_READ_DEADLINE)
            .await?
        {
            return Err(CoreError::Unauthorized(format!(
                "{requester_id} is not a participant of {conversation_id}"
            )));
        }
        self.messages.read_range(conversation_id, before, limit, STORE_READ_DEADLINE).await
    }

    fn spawn_push_fanout(&self, conversation_id: ConversationId, sender_id: UserId, message_id: secureconnect_protocol::MessageId) {
        let membership = self.membership.clone();
        let push = self.push.clone();
        tokio::spawn(async move {
            let deadline = Duration::from_secs(5);
            let participants = tokio::time::timeout(
                deadline,
                membership.participants_of(conversation_id, STORE_READ_DEADLINE),
            )
            .await;
            let Ok(Ok(participants)) = participants else {
                return;
            };
            for user_id in participants {
                if user_id == sender_id {
                    continue;
                }
                push.send(
                    user_id,
                    PushKind::NewMessage,
                    "New message",
                    "You have a new message",
                    serde_json::json!({ "conversation_id": conversation_id.to_string(), "message_id": message_id.to_string() }),
                )
                .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secureconnect_bus::BusEvent;
    use secureconnect_store::Role;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_stream::wrappers::ReceiverStream;

    struct FakeMembership {
        participants: Vec<UserId>,
    }

    #[async_trait]
    impl MembershipStore for FakeMembership {
        async fn is_participant(&self, _c: ConversationId, u: UserId, _d: Duration) -> Result<bool, CoreError> {
            Ok(self.participants.contains(&u))
        }
        async fn is_invited_to_call(&self, _k: secureconnect_protocol::CallId, _u: UserId, _d: Duration) -> Result<bool, CoreError> {
            Ok(false)
        }
        async fn participants_of(&self, _c: ConversationId, _d: Duration) -> Result<Vec<UserId>, CoreError> {
            Ok(self.participants.clone())
        }
        async fn role_of(&self, _c: ConversationId, _u: UserId, _d: Duration) -> Result<Role, CoreError> {
            Ok(Role::Member)
        }
    }

    #[derive(Default)]
    struct FakeMessages {
        rows: Mutex<HashMap<(ConversationId, UserId, String), Message>>,
        unkeyed: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageStore for FakeMessages {
        async fn append(
            &self,
            conversation_id: ConversationId,
            sender_id: UserId,
            kind: MessageKind,
            content: Vec<u8>,
            is_encrypted: bool,
            metadata: serde_json::Value,
            idempotency_key: Option<String>,
            _deadline: Duration,
        ) -> Result<AppendResult, CoreError> {
            // Mirrors Postgres's NULL-distinct UNIQUE semantics: an absent key
            // never dedups against anything, so it always inserts.
            let Some(idempotency_key) = idempotency_key else {
                let mut unkeyed = self.unkeyed.lock().unwrap();
                let message = Message {
                    id: secureconnect_protocol::MessageId::new(),
                    conversation_id,
                    sender_id,
                    kind,
                    content,
                    is_encrypted,
                    metadata,
                    idempotency_key: None,
                    sent_at_ms: unkeyed.len() as i64,
                };
                unkeyed.push(message.clone());
                return Ok(AppendResult::Inserted(message));
            };

            let mut rows = self.rows.lock().unwrap();
            let key = (conversation_id, sender_id, idempotency_key.clone());
            if let Some(existing) = rows.get(&key) {
                return Ok(AppendResult::Existing(existing.clone()));
            }
            let message = Message {
                id: secureconnect_protocol::MessageId::new(),
                conversation_id,
                sender_id,
                kind,
                content,
                is_encrypted,
                metadata,
                idempotency_key: Some(idempotency_key),
                sent_at_ms: rows.len() as i64,
            };
            rows.insert(key, message.clone());
            Ok(AppendResult::Inserted(message))
        }

        async fn read_range(
            &self,
            conversation_id: ConversationId,
            _before: Option<secureconnect_protocol::MessageId>,
            _limit: u32,
            _deadline: Duration,
        ) -> Result<Vec<Message>, CoreError> {
            let keyed = self.rows.lock().unwrap().values().cloned().collect::<Vec<_>>();
            let unkeyed = self.unkeyed.lock().unwrap().clone();
            Ok(keyed
                .into_iter()
                .chain(unkeyed)
                .filter(|m| m.conversation_id == conversation_id)
                .collect())
        }
    }

    struct FakeBus;

    #[async_trait]
    impl Bus for FakeBus {
        async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> PublishOutcome {
            PublishOutcome::Ok
        }
        async fn subscribe(
            &self,
            _channel: &str,
            _cancel: tokio_util::sync::CancellationToken,
        ) -> Result<ReceiverStream<BusEvent>, CoreError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(ReceiverStream::new(rx))
        }
        async fn health_check(&self) -> Result<(), CoreError> {
            Ok(())
        }
        fn is_degraded(&self) -> bool {
            false
        }
    }

    fn make_service(participants: Vec<UserId>) -> ChatService {
        ChatService::new(
            Arc::new(FakeMembership { participants }),
            Arc::new(FakeMessages::default()),
            Arc::new(FakeBus),
            Arc::new(crate::push::LoggingPushNotifier),
            Arc::new(RateLimiters::new(1000)),
        )
    }

    #[tokio::test]
    async fn unauthorized_sender_is_rejected() {
        let sender = UserId::new();
        let service = make_service(vec![]);
        let result = service
            .send_message(
                ConversationId::new(),
                sender,
                b"hi".to_vec(),
                MessageKind::Text,
                false,
                serde_json::json!({}),
                Some("k1".into()),
            )
            .await;
        assert!(matches!(result, Err(CoreError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_same_message() {
        let sender = UserId::new();
        let conversation_id = ConversationId::new();
        let service = make_service(vec![sender]);

        let first = service
            .send_message(
                conversation_id,
                sender,
                b"hi".to_vec(),
                MessageKind::Text,
                false,
                serde_json::json!({}),
                Some("k-17".into()),
            )
            .await
            .unwrap();
        let second = service
            .send_message(
                conversation_id,
                sender,
                b"hi".to_vec(),
                MessageKind::Text,
                false,
                serde_json::json!({}),
                Some("k-17".into()),
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn absent_idempotency_key_never_dedups() {
        let sender = UserId::new();
        let conversation_id = ConversationId::new();
        let service = make_service(vec![sender]);

        let first = service
            .send_message(conversation_id, sender, b"hi".to_vec(), MessageKind::Text, false, serde_json::json!({}), None)
            .await
            .unwrap();
        let second = service
            .send_message(conversation_id, sender, b"hi".to_vec(), MessageKind::Text, false, serde_json::json!({}), None)
            .await
            .unwrap();
        assert_ne!(first.id, second.id, "two sends with no idempotency key are never deduped");
    }

    #[tokio::test]
    async fn oversized_text_content_is_rejected() {
        let sender = UserId::new();
        let conversation_id = ConversationId::new();
        let service = make_service(vec![sender]);

        let oversized = vec![0u8; MAX_TEXT_CONTENT_BYTES + 1];
        let result = service
            .send_message(
                conversation_id,
                sender,
                oversized,
                MessageKind::Text,
                false,
                serde_json::json!({}),
                Some("k1".into()),
            )
            .await;
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn exact_text_limit_succeeds() {
        let sender = UserId::new();
        let conversation_id = ConversationId::new();
        let service = make_service(vec![sender]);

        let exact = vec![0u8; MAX_TEXT_CONTENT_BYTES];
        let result = service
            .send_message(
                conversation_id,
                sender,
                exact,
                MessageKind::Text,
                false,
                serde_json::json!({}),
                Some("k1".into()),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn encrypted_flag_and_metadata_round_trip_through_append() {
        let sender = UserId::new();
        let conversation_id = ConversationId::new();
        let service = make_service(vec![sender]);

        let metadata = serde_json::json!({"thread_id": "t-1"});
        let message = service
            .send_message(
                conversation_id,
                sender,
                b"ciphertext".to_vec(),
                MessageKind::Text,
                true,
                metadata.clone(),
                Some("k1".into()),
            )
            .await
            .unwrap();
        assert!(message.is_encrypted);
        assert_eq!(message.metadata, metadata);
    }
}
