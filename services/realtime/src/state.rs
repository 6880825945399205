use std::sync::Arc;

use secureconnect_bus::{Bus, Presence};
use secureconnect_protocol::limits::BUS_HEALTH_CHECK_INTERVAL;
use secureconnect_store::{CallStore, MembershipStore, MessageStore};
use tracing::warn;

use crate::auth::AuthValidator;
use crate::call_service::CallService;
use crate::chat_hub::ChatHub;
use crate::chat_service::ChatService;
use crate::push::PushNotifier;
use crate::rate_limit::RateLimiters;
use crate::signaling_hub::SignalingHub;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthValidator>,
    pub chat_hub: Arc<ChatHub>,
    pub signaling_hub: Arc<SignalingHub>,
    pub chat_service: Arc<ChatService>,
    pub call_service: Arc<CallService>,
    pub membership: Arc<dyn MembershipStore>,
    pub bus: Arc<dyn Bus>,
    pub presence: Arc<Presence>,
}

impl AppState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthValidator,
        bus: Arc<dyn Bus>,
        presence: Arc<Presence>,
        membership: Arc<dyn MembershipStore>,
        messages: Arc<dyn MessageStore>,
        calls: Arc<dyn CallStore>,
        push: Arc<dyn PushNotifier>,
        message_rate_limiters: Arc<RateLimiters>,
        call_rate_limiters: Arc<RateLimiters>,
        max_connections: usize,
    ) -> Self {
        let chat_service = Arc::new(ChatService::new(
            membership.clone(),
            messages,
            bus.clone(),
            push.clone(),
            message_rate_limiters,
        ));
        let call_service = Arc::new(CallService::new(
            membership.clone(),
            calls,
            bus.clone(),
            push,
            call_rate_limiters,
        ));
        let chat_hub = ChatHub::new(bus.clone(), presence.clone(), max_connections);
        let signaling_hub =
            SignalingHub::new(bus.clone(), call_service.clone(), presence.clone(), max_connections);

        tokio::spawn(call_service.clone().run_expiry_sweep());
        tokio::spawn(run_bus_health_sweep(bus.clone()));

        Self {
            auth: Arc::new(auth),
            chat_hub,
            signaling_hub,
            chat_service,
            call_service,
            membership,
            bus,
            presence,
        }
    }
}

/// Periodically re-probes the bus so a degraded connection can self-heal
/// back to healthy without waiting for the next publish/subscribe attempt.
async fn run_bus_health_sweep(bus: Arc<dyn Bus>) {
    let mut interval = tokio::time::interval(BUS_HEALTH_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = bus.health_check().await {
            warn!(error = %e, "bus health check failed");
        }
    }
}
