use std::time::Duration;

use async_trait::async_trait;
use secureconnect_protocol::{
    CallId, CallKind, CallParticipant, CallStatus, ConversationId, CoreError, Message, MessageId,
    MessageKind, UserId,
};
use sqlx::PgPool;

use crate::traits::{AppendResult, CallRecord, CallStore, MembershipStore, MessageStore, Role};

pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, CoreError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(CoreError::Internal(e.to_string())),
        Err(_) => Err(CoreError::Internal("store operation timed out".into())),
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<bool, CoreError> {
        let row = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT 1 AS present FROM conversation_participants \
                 WHERE conversation_id = $1 AND user_id = $2",
                conversation_id.0,
                user_id.0
            )
            .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.is_some())
    }

    async fn is_invited_to_call(
        &self,
        call_id: CallId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<bool, CoreError> {
        let row = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT 1 AS present FROM call_participants \
                 WHERE call_id = $1 AND user_id = $2 \
                 UNION SELECT 1 FROM calls WHERE call_id = $1 AND caller_id = $2",
                call_id.0,
                user_id.0
            )
            .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.is_some())
    }

    async fn participants_of(
        &self,
        conversation_id: ConversationId,
        deadline: Duration,
    ) -> Result<Vec<UserId>, CoreError> {
        let rows = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = $1",
                conversation_id.0
            )
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.user_id)).collect())
    }

    async fn role_of(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<Role, CoreError> {
        let row = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT role FROM conversation_participants \
                 WHERE conversation_id = $1 AND user_id = $2",
                conversation_id.0,
                user_id.0
            )
            .fetch_optional(&self.pool),
        )
        .await?;
        Ok(match row.map(|r| r.role) {
            Some(role) if role == "admin" => Role::Admin,
            Some(_) => Role::Member,
            None => Role::None,
        })
    }
}

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn message_kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::Video => "video",
        MessageKind::File => "file",
        MessageKind::System => "system",
    }
}

fn parse_message_kind(s: &str) -> MessageKind {
    match s {
        "image" => MessageKind::Image,
        "video" => MessageKind::Video,
        "file" => MessageKind::File,
        "system" => MessageKind::System,
        _ => MessageKind::Text,
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        kind: MessageKind,
        content: Vec<u8>,
        is_encrypted: bool,
        metadata: serde_json::Value,
        idempotency_key: Option<String>,
        deadline: Duration,
    ) -> Result<AppendResult, CoreError> {
        // A `None` key never matches here: `idempotency_key = $3` is NULL,
        // never true, when $3 is NULL, so an opted-out send always falls
        // through to the insert below.
        let existing = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT message_id, conversation_id, sender_id, kind, content, \
                        is_encrypted, metadata, idempotency_key, sent_at \
                 FROM messages \
                 WHERE conversation_id = $1 AND sender_id = $2 AND idempotency_key = $3",
                conversation_id.0,
                sender_id.0,
                idempotency_key
            )
            .fetch_optional(&self.pool),
        )
        .await?;

        if let Some(row) = existing {
            return Ok(AppendResult::Existing(Message {
                id: MessageId(row.message_id),
                conversation_id: ConversationId(row.conversation_id),
                sender_id: UserId(row.sender_id),
                kind: parse_message_kind(&row.kind),
                content: row.content,
                is_encrypted: row.is_encrypted,
                metadata: row.metadata,
                idempotency_key: row.idempotency_key,
                sent_at_ms: row.sent_at.timestamp_millis(),
            }));
        }

        let message_id = MessageId::new();
        let kind_str = message_kind_str(kind);
        // NULL idempotency_key rows never conflict with each other under
        // Postgres's NULL-distinct UNIQUE semantics, so this always inserts
        // for an opted-out send.
        let inserted = with_deadline(
            deadline,
            sqlx::query!(
                "INSERT INTO messages \
                    (message_id, conversation_id, sender_id, kind, content, \
                     is_encrypted, metadata, idempotency_key) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (conversation_id, sender_id, idempotency_key) DO NOTHING \
                 RETURNING sent_at",
                message_id.0,
                conversation_id.0,
                sender_id.0,
                kind_str,
                content,
                is_encrypted,
                metadata,
                idempotency_key
            )
            .fetch_optional(&self.pool),
        )
        .await?;

        match inserted {
            Some(row) => Ok(AppendResult::Inserted(Message {
                id: message_id,
                conversation_id,
                sender_id,
                kind,
                content,
                is_encrypted,
                metadata,
                idempotency_key,
                sent_at_ms: row.sent_at.timestamp_millis(),
            })),
            // Lost the race against a concurrent identical append; read back the winner.
            None => self
                .append(conversation_id, sender_id, kind, content, is_encrypted, metadata, idempotency_key, deadline)
                .await
                .map(|r| match r {
                    AppendResult::Inserted(m) => AppendResult::Existing(m),
                    existing => existing,
                }),
        }
    }

    async fn read_range(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
        deadline: Duration,
    ) -> Result<Vec<Message>, CoreError> {
        let before_sent_at = match before {
            Some(id) => {
                let row = with_deadline(
                    deadline,
                    sqlx::query!("SELECT sent_at FROM messages WHERE message_id = $1", id.0)
                        .fetch_optional(&self.pool),
                )
                .await?;
                match row {
                    Some(r) => Some(r.sent_at),
                    None => return Err(CoreError::NotFound("before message not found".into())),
                }
            }
            None => None,
        };

        let rows = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT message_id, conversation_id, sender_id, kind, content, \
                        is_encrypted, metadata, idempotency_key, sent_at \
                 FROM messages \
                 WHERE conversation_id = $1 AND ($2::timestamptz IS NULL OR sent_at < $2) \
                 ORDER BY sent_at ASC, message_id ASC \
                 LIMIT $3",
                conversation_id.0,
                before_sent_at,
                i64::from(limit)
            )
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Message {
                id: MessageId(row.message_id),
                conversation_id: ConversationId(row.conversation_id),
                sender_id: UserId(row.sender_id),
                kind: parse_message_kind(&row.kind),
                content: row.content,
                is_encrypted: row.is_encrypted,
                metadata: row.metadata,
                idempotency_key: row.idempotency_key,
                sent_at_ms: row.sent_at.timestamp_millis(),
            })
            .collect())
    }
}

pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn call_kind_str(kind: CallKind) -> &'static str {
    match kind {
        CallKind::Audio => "audio",
        CallKind::Video => "video",
    }
}

fn parse_call_kind(s: &str) -> CallKind {
    match s {
        "video" => CallKind::Video,
        _ => CallKind::Audio,
    }
}

fn parse_call_status(s: &str) -> CallStatus {
    match s {
        "active" => CallStatus::Active,
        "ended" => CallStatus::Ended,
        _ => CallStatus::Ringing,
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn create(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
        kind: CallKind,
        max_duration: Duration,
        deadline: Duration,
    ) -> Result<CallRecord, CoreError> {
        let call_id = CallId::new();
        let kind_str = call_kind_str(kind);
        let row = with_deadline(
            deadline,
            sqlx::query!(
                "INSERT INTO calls \
                    (call_id, conversation_id, caller_id, kind, status, expires_at) \
                 VALUES ($1, $2, $3, $4, 'ringing', now() + $5::interval) \
                 RETURNING started_at, expires_at",
                call_id.0,
                conversation_id.0,
                caller_id.0,
                kind_str,
                format!("{} seconds", max_duration.as_secs())
            )
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(CallRecord {
            id: call_id,
            conversation_id,
            caller_id,
            kind,
            status: CallStatus::Ringing,
            started_at_ms: row.started_at.timestamp_millis(),
            ended_at_ms: None,
            duration_seconds: None,
            expires_at_ms: row.expires_at.timestamp_millis(),
        })
    }

    async fn get(&self, call_id: CallId, deadline: Duration) -> Result<Option<CallRecord>, CoreError> {
        let row = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT call_id, conversation_id, caller_id, kind, status, \
                        started_at, ended_at, duration_seconds, expires_at \
                 FROM calls WHERE call_id = $1",
                call_id.0
            )
            .fetch_optional(&self.pool),
        )
        .await?;

        Ok(row.map(|r| CallRecord {
            id: CallId(r.call_id),
            conversation_id: ConversationId(r.conversation_id),
            caller_id: UserId(r.caller_id),
            kind: parse_call_kind(&r.kind),
            status: parse_call_status(&r.status),
            started_at_ms: r.started_at.timestamp_millis(),
            ended_at_ms: r.ended_at.map(|t| t.timestamp_millis()),
            duration_seconds: r.duration_seconds,
            expires_at_ms: r.expires_at.timestamp_millis(),
        }))
    }

    async fn list_active_participants(
        &self,
        call_id: CallId,
        deadline: Duration,
    ) -> Result<Vec<CallParticipant>, CoreError> {
        let rows = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT call_id, user_id, joined_at, left_at FROM call_participants \
                 WHERE call_id = $1 AND left_at IS NULL",
                call_id.0
            )
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| CallParticipant {
                call_id: CallId(r.call_id),
                user_id: UserId(r.user_id),
                joined_at_ms: r.joined_at.timestamp_millis(),
                left_at_ms: r.left_at.map(|t| t.timestamp_millis()),
            })
            .collect())
    }

    async fn add_participant(
        &self,
        call_id: CallId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<(), CoreError> {
        let row = with_deadline(
            deadline,
            sqlx::query!(
                "INSERT INTO call_participants (call_id, user_id) \
                 SELECT $1, $2 \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM call_participants \
                     WHERE call_id = $1 AND user_id = $2 AND left_at IS NULL \
                 ) \
                 RETURNING call_id",
                call_id.0,
                user_id.0
            )
            .fetch_optional(&self.pool),
        )
        .await?;

        if row.is_none() {
            return Err(CoreError::Conflict(
                "user already has an active participant row for this call".into(),
            ));
        }
        Ok(())
    }

    async fn remove_participant(
        &self,
        call_id: CallId,
        user_id: UserId,
        deadline: Duration,
    ) -> Result<(), CoreError> {
        with_deadline(
            deadline,
            sqlx::query!(
                "UPDATE call_participants SET left_at = now() \
                 WHERE call_id = $1 AND user_id = $2 AND left_at IS NULL",
                call_id.0,
                user_id.0
            )
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn end_call(&self, call_id: CallId, deadline: Duration) -> Result<(), CoreError> {
        with_deadline(
            deadline,
            sqlx::query!(
                "UPDATE calls SET status = 'ended', ended_at = now(), \
                        duration_seconds = EXTRACT(EPOCH FROM (now() - started_at))::bigint \
                 WHERE call_id = $1 AND status <> 'ended'",
                call_id.0
            )
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn mark_active(&self, call_id: CallId, deadline: Duration) -> Result<(), CoreError> {
        with_deadline(
            deadline,
            sqlx::query!(
                "UPDATE calls SET status = 'active' WHERE call_id = $1 AND status = 'ringing'",
                call_id.0
            )
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn list_active_calls(&self, deadline: Duration) -> Result<Vec<CallRecord>, CoreError> {
        let rows = with_deadline(
            deadline,
            sqlx::query!(
                "SELECT call_id, conversation_id, caller_id, kind, status, \
                        started_at, ended_at, duration_seconds, expires_at \
                 FROM calls WHERE status <> 'ended'"
            )
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| CallRecord {
                id: CallId(r.call_id),
                conversation_id: ConversationId(r.conversation_id),
                caller_id: UserId(r.caller_id),
                kind: parse_call_kind(&r.kind),
                status: parse_call_status(&r.status),
                started_at_ms: r.started_at.timestamp_millis(),
                ended_at_ms: r.ended_at.map(|t| t.timestamp_millis()),
                duration_seconds: r.duration_seconds,
                expires_at_ms: r.expires_at.timestamp_millis(),
            })
            .collect())
    }
}
