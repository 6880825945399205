use std::time::Duration;

use async_trait::async_trait;
use secureconnect_protocol::{CallId, CallParticipant, ConversationId, CoreError, Message, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Admin,
    None,
}

/// Answers membership/invitation questions against the relational store.
/// All operations are read-only from the core's perspective and must be
/// called with a deadline (default `STORE_READ_DEADLINE`, 2s).
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<bool, CoreError>;

    async fn is_invited_to_call(
        &self,
        call_id: CallId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<bool, CoreError>;

    async fn participants_of(
        &self,
        conversation_id: ConversationId,
        deadline: Duration,
    ) -> Result<Vec<UserId>, CoreError>;

    async fn role_of(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<Role, CoreError>;
}

/// Outcome of an idempotent append, mirroring the insert-or-existing split
/// used for ingest deduplication elsewhere in this codebase.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendResult {
    Inserted(Message),
    Existing(Message),
}

/// Durable message storage. `append` is atomic with respect to the
/// idempotency-key conflict check: two concurrent calls for the same
/// `(conversation_id, sender_id, idempotency_key)` never both insert.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        kind: secureconnect_protocol::MessageKind,
        content: Vec<u8>,
        is_encrypted: bool,
        metadata: serde_json::Value,
        idempotency_key: Option<String>,
        deadline: Duration,
    ) -> Result<AppendResult, CoreError>;

    /// Ordered by `(sent_at, message_id)`, most recent first when `before`
    /// is absent; `before` paginates strictly older than the given message.
    async fn read_range(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
        deadline: Duration,
    ) -> Result<Vec<Message>, CoreError>;
}

/// Tracks call records and participant join/leave lifecycle.
/// `add_participant` and `end_call` must be serialized per call id to
/// uphold the "at most one active row per (K, U)" and terminal-status
/// invariants; the Postgres implementation does this with row locking.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
        kind: secureconnect_protocol::CallKind,
        max_duration: Duration,
        deadline: Duration,
    ) -> Result<CallRecord, CoreError>;

    async fn get(&self, call_id: CallId, deadline: Duration) -> Result<Option<CallRecord>, CoreError>;

    async fn list_active_participants(
        &self,
        call_id: CallId,
        deadline: Duration,
    ) -> Result<Vec<CallParticipant>, CoreError>;

    /// Fails with `Conflict` if an active row already exists for `(call_id, user_id)`.
    async fn add_participant(
        &self,
        call_id: CallId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<(), CoreError>;

    async fn remove_participant(
        &self,
        call_id: CallId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<(), CoreError>;

    /// Idempotent: ending an already-ended call is a no-op success.
    async fn end_call(&self, call_id: CallId, deadline: Duration) -> Result<(), CoreError>;

    async fn mark_active(&self, call_id: CallId, deadline: Duration) -> Result<(), CoreError>;

    async fn list_active_calls(&self, deadline: Duration) -> Result<Vec<CallRecord>, CoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub kind: secureconnect_protocol::CallKind,
    pub status: secureconnect_protocol::CallStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub expires_at_ms: i64,
}
