//! Call lifecycle orchestration: initiate / join / leave / end, plus the
//! periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use secureconnect_bus::Bus;
use secureconnect_protocol::limits::{
    CALL_RINGING_TIMEOUT, MAX_CALL_DURATION, MAX_CALL_PARTICIPANTS, STORE_READ_DEADLINE,
    STORE_WRITE_DEADLINE,
};
use secureconnect_protocol::{CallEndReason, CallId, CallKind, CallStatus, ConversationId, CoreError, SignalingFrame, UserId};
use secureconnect_store::{CallRecord, CallStore, MembershipStore};
use tracing::{info, warn};

use crate::push::{PushKind, PushNotifier};
use crate::rate_limit::RateLimiters;

pub struct CallService {
    membership: Arc<dyn MembershipStore>,
    calls: Arc<dyn CallStore>,
    bus: Arc<dyn Bus>,
    push: Arc<dyn PushNotifier>,
    rate_limiters: Arc<RateLimiters>,
}

impl CallService {
    #[must_use]
    pub fn new(
        membership: Arc<dyn MembershipStore>,
        calls: Arc<dyn CallStore>,
        bus: Arc<dyn Bus>,
        push: Arc<dyn PushNotifier>,
        rate_limiters: Arc<RateLimiters>,
    ) -> Self {
        Self { membership, calls, bus, push, rate_limiters }
    }

    pub async fn initiate(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
        kind: CallKind,
        invitees: Vec<UserId>,
    ) -> Result<CallId, CoreError> {
        if !self
            .membership
            .is_participant(conversation_id, caller_id, STORE_READ_DEADLINE)
            .await?
        {
            return Err(CoreError::Unauthorized(format!("{caller_id} is not a participant of {conversation_id}")));
        }

        if invitees.len() + 1 > MAX_CALL_PARTICIPANTS {
            return Err(CoreError::InvalidArgument("too many invitees for MaxCallParticipants".into()));
        }

        if !self.rate_limiters.check(&caller_id.to_string(), "call:initiate").await {
            return Err(CoreError::Throttled("call initiation rate limit exceeded".into()));
        }

        let call = self
            .calls
            .create(conversation_id, caller_id, kind, MAX_CALL_DURATION, STORE_WRITE_DEADLINE)
            .await?;

        self.calls.add_participant(call.id, caller_id, STORE_WRITE_DEADLINE).await?;
        for invitee in &invitees {
            self.calls.add_participant(call.id, *invitee, STORE_WRITE_DEADLINE).await?;
        }

        self.spawn_invite_push(call.id, caller_id, invitees);

        Ok(call.id)
    }

    pub async fn join(&self, call_id: CallId, user_id: UserId) -> Result<(), CoreError> {
        let call = self.require_call(call_id).await?;

        if call.status == CallStatus::Ended {
            return Err(CoreError::Conflict("call has already ended".into()));
        }
        if call.status == CallStatus::Ringing {
            let age = now_ms().saturating_sub(call.started_at_ms);
            if age > i64::try_from(CALL_RINGING_TIMEOUT.as_millis()).unwrap_or(i64::MAX) {
                return Err(CoreError::Conflict("call ringing timeout elapsed".into()));
            }
        }

        if !self.membership.is_invited_to_call(call_id, user_id, STORE_READ_DEADLINE).await? {
            return Err(CoreError::Unauthorized(format!("{user_id} is not invited to {call_id}")));
        }

        let active = self.calls.list_active_participants(call_id, STORE_READ_DEADLINE).await?;
        if active.iter().any(|p| p.user_id == user_id) {
            return Err(CoreError::Conflict("user already has an active participant row".into()));
        }
        if active.len() >= MAX_CALL_PARTICIPANTS {
            return Err(CoreError::InvalidArgument("call is at MaxCallParticipants".into()));
        }

        self.calls.add_participant(call_id, user_id, STORE_WRITE_DEADLINE).await?;
        if call.status == CallStatus::Ringing {
            self.calls.mark_active(call_id, STORE_WRITE_DEADLINE).await?;
        }

        self.publish_signaling(
            call_id,
            SignalingFrame::ParticipantJoined { user_id, joined_at_ms: now_ms() },
        )
        .await;

        Ok(())
    }

    /// Used both by explicit client leaves and by `SignalingHub` disconnect cleanup.
    pub async fn leave(&self, call_id: CallId, user_id: UserId) -> Result<(), CoreError> {
        self.calls.remove_participant(call_id, user_id, STORE_WRITE_DEADLINE).await?;

        self.publish_signaling(
            call_id,
            SignalingFrame::ParticipantLeft { user_id, left_at_ms: now_ms() },
        )
        .await;

        let active = self.calls.list_active_participants(call_id, STORE_READ_DEADLINE).await?;
        if active.is_empty() {
            self.end_call(call_id).await?;
        }
        Ok(())
    }

    /// Idempotent: ending an already-ended call is a no-op success.
    pub async fn end_call(&self, call_id: CallId) -> Result<(), CoreError> {
        self.calls.end_call(call_id, STORE_WRITE_DEADLINE).await?;
        self.publish_signaling(call_id, SignalingFrame::CallEnded { reason: CallEndReason::Hangup }).await;
        Ok(())
    }

    pub async fn get(&self, call_id: CallId) -> Result<CallRecord, CoreError> {
        self.require_call(call_id).await
    }

    /// Runs every 60s: forces expiry for calls that have exceeded `MaxCallDuration`.
    pub async fn run_expiry_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(secureconnect_protocol::limits::CALL_EXPIRY_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let Ok(active_calls) = self.calls.list_active_calls(STORE_READ_DEADLINE).await else {
                continue;
            };
            for call in active_calls {
                let age_ms = now_ms().saturating_sub(call.started_at_ms);
                if age_ms > i64::try_from(MAX_CALL_DURATION.as_millis()).unwrap_or(i64::MAX) {
                    if let Err(e) = self.calls.end_call(call.id, STORE_WRITE_DEADLINE).await {
                        warn!(call_id = %call.id, error = %e, "expiry sweep failed to end call");
                        continue;
                    }
                    self.publish_signaling(call.id, SignalingFrame::CallEnded { reason: CallEndReason::Expired }).await;
                    info!(call_id = %call.id, "call force-ended by expiry sweep");
                }
            }
        }
    }

    async fn require_call(&self, call_id: CallId) -> Result<CallRecord, CoreError> {
        self.calls
            .get(call_id, STORE_READ_DEADLINE)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("call {call_id} not found")))
    }

    async fn publish_signaling(&self, call_id: CallId, frame: SignalingFrame) {
        if let Ok(payload) = serde_json::to_vec(&frame) {
            let channel = format!("call:{call_id}");
            let _ = self.bus.publish(&channel, payload).await;
        }
    }

    fn spawn_invite_push(&self, call_id: CallId, caller_id: UserId, invitees: Vec<UserId>) {
        let push = self.push.clone();
        tokio::spawn(async move {
            for invitee in invitees {
                push.send(
                    invitee,
                    PushKind::IncomingCall,
                    "Incoming call",
                    "You have an incoming call",
                    serde_json::json!({ "call_id": call_id.to_string(), "caller_id": caller_id.to_string() }),
                )
                .await;
            }
        });
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    //! Exercised against a real Postgres-backed `CallStore` in
    //! `secureconnect-store`; this module only covers the pure invariants
    //! that don't require storage.
    use super::*;

    #[test]
    fn invitee_count_over_limit_is_rejected_before_any_store_call() {
        let invitees: Vec<UserId> = (0..MAX_CALL_PARTICIPANTS).map(|_| UserId::new()).collect();
        assert!(invitees.len() + 1 > MAX_CALL_PARTICIPANTS);
    }
}
