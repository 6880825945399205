//! End-to-end call lifecycle against in-memory fakes: initiate -> join ->
//! leave-drains-to-end. Mirrors the persist-then-publish integration style
//! used for the ingest path, scoped to `CallService` instead of the HTTP layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use realtime::call_service::CallService;
use realtime::push::LoggingPushNotifier;
use realtime::rate_limit::RateLimiters;
use secureconnect_bus::{Bus, BusEvent, PublishOutcome};
use secureconnect_protocol::{
    CallId, CallKind, CallParticipant, CallStatus, ConversationId, CoreError, UserId,
};
use secureconnect_store::{CallRecord, CallStore, MembershipStore, Role};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

struct FakeMembership {
    conversation_members: Vec<UserId>,
    call_invitees: Mutex<Vec<UserId>>,
}

#[async_trait]
impl MembershipStore for FakeMembership {
    async fn is_participant(&self, _c: ConversationId, u: UserId, _d: Duration) -> Result<bool, CoreError> {
        Ok(self.conversation_members.contains(&u))
    }
    async fn is_invited_to_call(&self, _k: CallId, u: UserId, _d: Duration) -> Result<bool, CoreError> {
        Ok(self.call_invitees.lock().unwrap().contains(&u))
    }
    async fn participants_of(&self, _c: ConversationId, _d: Duration) -> Result<Vec<UserId>, CoreError> {
        Ok(self.conversation_members.clone())
    }
    async fn role_of(&self, _c: ConversationId, _u: UserId, _d: Duration) -> Result<Role, CoreError> {
        Ok(Role::Member)
    }
}

#[derive(Default)]
struct FakeCalls {
    records: Mutex<HashMap<CallId, CallRecord>>,
    participants: Mutex<HashMap<CallId, Vec<CallParticipant>>>,
}

#[async_trait]
impl CallStore for FakeCalls {
    async fn create(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
        kind: CallKind,
        _max_duration: Duration,
        _deadline: Duration,
    ) -> Result<CallRecord, CoreError> {
        let record = CallRecord {
            id: CallId::new(),
            conversation_id,
            caller_id,
            kind,
            status: CallStatus::Ringing,
            started_at_ms: 0,
            ended_at_ms: None,
            duration_seconds: None,
            expires_at_ms: 0,
        };
        self.records.lock().unwrap().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, call_id: CallId, _deadline: Duration) -> Result<Option<CallRecord>, CoreError> {
        Ok(self.records.lock().unwrap().get(&call_id).cloned())
    }

    async fn list_active_participants(
        &self,
        call_id: CallId,
        _deadline: Duration,
    ) -> Result<Vec<CallParticipant>, CoreError> {
        Ok(self
            .participants
            .lock()
            .unwrap()
            .get(&call_id)
            .map(|rows| rows.iter().filter(|p| p.left_at_ms.is_none()).cloned().collect())
            .unwrap_or_default())
    }

    async fn add_participant(&self, call_id: CallId, user_id: UserId, _deadline: Duration) -> Result<(), CoreError> {
        let mut participants = self.participants.lock().unwrap();
        let rows = participants.entry(call_id).or_default();
        if rows.iter().any(|p| p.user_id == user_id && p.left_at_ms.is_none()) {
            return Err(CoreError::Conflict("already an active participant".into()));
        }
        rows.push(CallParticipant { call_id, user_id, joined_at_ms: 0, left_at_ms: None });
        Ok(())
    }

    async fn remove_participant(&self, call_id: CallId, user_id: UserId, _deadline: Duration) -> Result<(), CoreError> {
        let mut participants = self.participants.lock().unwrap();
        if let Some(rows) = participants.get_mut(&call_id) {
            for row in rows.iter_mut() {
                if row.user_id == user_id && row.left_at_ms.is_none() {
                    row.left_at_ms = Some(1);
                }
            }
        }
        Ok(())
    }

    async fn end_call(&self, call_id: CallId, _deadline: Duration) -> Result<(), CoreError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(&call_id) {
            record.status = CallStatus::Ended;
            record.ended_at_ms = Some(1);
        }
        Ok(())
    }

    async fn mark_active(&self, call_id: CallId, _deadline: Duration) -> Result<(), CoreError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(&call_id) {
            record.status = CallStatus::Active;
        }
        Ok(())
    }

    async fn list_active_calls(&self, _deadline: Duration) -> Result<Vec<CallRecord>, CoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status != CallStatus::Ended)
            .cloned()
            .collect())
    }
}

struct FakeBus;

#[async_trait]
impl Bus for FakeBus {
    async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> PublishOutcome {
        PublishOutcome::Ok
    }
    async fn subscribe(&self, _channel: &str, _cancel: CancellationToken) -> Result<ReceiverStream<BusEvent>, CoreError> {
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

#[tokio::test]
async fn joining_then_leaving_solo_participant_ends_the_call() {
    let caller = UserId::new();
    let invitee = UserId::new();
    let conversation_id = ConversationId::new();

    let membership = Arc::new(FakeMembership {
        conversation_members: vec![caller, invitee],
        call_invitees: Mutex::new(vec![invitee]),
    });
    let calls = Arc::new(FakeCalls::default());
    let service = CallService::new(
        membership,
        calls.clone(),
        Arc::new(FakeBus),
        Arc::new(LoggingPushNotifier),
        Arc::new(RateLimiters::new(1000)),
    );

    let call_id = service.initiate(conversation_id, caller, CallKind::Audio, vec![invitee]).await.unwrap();
    let record = service.get(call_id).await.unwrap();
    assert_eq!(record.status, CallStatus::Ringing);

    service.join(call_id, invitee).await.unwrap();
    let record = service.get(call_id).await.unwrap();
    assert_eq!(record.status, CallStatus::Active);

    service.leave(call_id, caller).await.unwrap();
    let record = service.get(call_id).await.unwrap();
    assert_eq!(record.status, CallStatus::Active, "one active participant remains");

    service.leave(call_id, invitee).await.unwrap();
    let record = service.get(call_id).await.unwrap();
    assert_eq!(record.status, CallStatus::Ended);
}

#[tokio::test]
async fn join_rejects_uninvited_user() {
    let caller = UserId::new();
    let stranger = UserId::new();
    let conversation_id = ConversationId::new();

    let membership = Arc::new(FakeMembership {
        conversation_members: vec![caller],
        call_invitees: Mutex::new(vec![]),
    });
    let calls = Arc::new(FakeCalls::default());
    let service = CallService::new(
        membership,
        calls,
        Arc::new(FakeBus),
        Arc::new(LoggingPushNotifier),
        Arc::new(RateLimiters::new(1000)),
    );

    let call_id = service.initiate(conversation_id, caller, CallKind::Audio, vec![]).await.unwrap();
    let result = service.join(call_id, stranger).await;
    assert!(matches!(result, Err(CoreError::Unauthorized(_))));
}

#[tokio::test]
async fn end_call_is_idempotent() {
    let caller = UserId::new();
    let conversation_id = ConversationId::new();

    let membership = Arc::new(FakeMembership { conversation_members: vec![caller], call_invitees: Mutex::new(vec![]) });
    let calls = Arc::new(FakeCalls::default());
    let service = CallService::new(
        membership,
        calls,
        Arc::new(FakeBus),
        Arc::new(LoggingPushNotifier),
        Arc::new(RateLimiters::new(1000)),
    );

    let call_id = service.initiate(conversation_id, caller, CallKind::Audio, vec![]).await.unwrap();
    service.end_call(call_id).await.unwrap();
    service.end_call(call_id).await.unwrap();
    assert_eq!(service.get(call_id).await.unwrap().status, CallStatus::Ended);
}
