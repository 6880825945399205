//! Per-process WebSocket fan-out for call signaling. Same shape as
//! `ChatHub` but keyed by call id, with SDP/ICE relay validation and a
//! disconnect-time hook into `CallService.leave`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use secureconnect_bus::{Bus, BusEvent, Presence};
use secureconnect_protocol::limits::{PING_INTERVAL, Q_HUB, Q_SIGNALING, WRITE_DEADLINE};
use secureconnect_protocol::{CallId, ErrorEnvelope, ErrorKind, SignalingFrame, UserId};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::call_service::CallService;

struct SignalingClientHandle {
    client_id: Uuid,
    user_id: UserId,
    tx: mpsc::Sender<SignalingFrame>,
}

struct Subscription {
    cancel: CancellationToken,
}

enum HubCommand {
    Register { call_id: CallId, client: SignalingClientHandle },
    Unregister { call_id: CallId, client_id: Uuid },
    Broadcast { call_id: CallId, frame: SignalingFrame },
}

#[derive(Default)]
pub struct HubMetrics {
    pub broadcast_channel_drops: AtomicU64,
    pub outbound_queue_drops: AtomicU64,
}

pub struct SignalingHub {
    clients: RwLock<HashMap<CallId, HashMap<Uuid, SignalingClientHandle>>>,
    subscriptions: RwLock<HashMap<CallId, Subscription>>,
    cmd_tx: mpsc::Sender<HubCommand>,
    semaphore: Arc<Semaphore>,
    bus: Arc<dyn Bus>,
    call_service: Arc<CallService>,
    presence: Arc<Presence>,
    pub metrics: Arc<HubMetrics>,
}

impl SignalingHub {
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        call_service: Arc<CallService>,
        presence: Arc<Presence>,
        max_connections: usize,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(Q_HUB);
        let hub = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            cmd_tx,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            bus,
            call_service,
            presence,
            metrics: Arc::new(HubMetrics::default()),
        });
        tokio::spawn(Self::run(hub.clone(), cmd_rx));
        hub
    }

    async fn run(hub: Arc<Self>, mut cmd_rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HubCommand::Register { call_id, client } => {
                    hub.clone().handle_register(call_id, client).await;
                }
                HubCommand::Unregister { call_id, client_id } => {
                    hub.clone().handle_unregister(call_id, client_id).await;
                }
                HubCommand::Broadcast { call_id, frame } => {
                    hub.handle_broadcast(call_id, frame).await;
                }
            }
        }
    }

    async fn handle_register(self: Arc<Self>, call_id: CallId, client: SignalingClientHandle) {
        let user_id = client.user_id;
        {
            let mut clients = self.clients.write().await;
            clients.entry(call_id).or_default().insert(client.client_id, client);
        }

        if let Err(e) = self.presence.touch(user_id).await {
            warn!(%user_id, error = %e, "failed to record presence on connect");
        }

        let needs_subscription = !self.subscriptions.read().await.contains_key(&call_id);
        if needs_subscription {
            let mut subs = self.subscriptions.write().await;
            if !subs.contains_key(&call_id) {
                let cancel = CancellationToken::new();
                subs.insert(call_id, Subscription { cancel: cancel.clone() });
                drop(subs);
                tokio::spawn(Self::subscribe_to_call(self, call_id, cancel));
            }
        }
    }

    async fn handle_unregister(self: Arc<Self>, call_id: CallId, client_id: Uuid) {
        let mut disconnected_user = None;
        let mut should_cancel_subscription = false;
        {
            let mut clients = self.clients.write().await;
            if let Some(by_client) = clients.get_mut(&call_id) {
                if let Some(handle) = by_client.remove(&client_id) {
                    disconnected_user = Some(handle.user_id);
                }
                should_cancel_subscription = by_client.is_empty();
                if should_cancel_subscription {
                    clients.remove(&call_id);
                }
            }
        }
        self.semaphore.add_permits(1);

        if should_cancel_subscription {
            if let Some(sub) = self.subscriptions.write().await.remove(&call_id) {
                sub.cancel.cancel();
            }
        }

        // Disconnect-time lifecycle: when the last local client for this call
        // unregisters, tell CallService with a bounded timeout; failures never
        // bubble into the run loop.
        if let Some(user_id) = disconnected_user {
            let call_service = self.call_service.clone();
            tokio::spawn(async move {
                let result = tokio::time::timeout(Duration::from_secs(5), call_service.leave(call_id, user_id)).await;
                if let Err(_elapsed) = result {
                    warn!(%call_id, %user_id, "CallService.leave timed out on disconnect");
                } else if let Ok(Err(e)) = result {
                    warn!(%call_id, %user_id, error = %e, "CallService.leave failed on disconnect");
                }
            });
        }
    }

    async fn handle_broadcast(&self, call_id: CallId, frame: SignalingFrame) {
        // Relayed offer/answer/ice frames carry their own targeting: `Some(u)`
        // delivers only to `u`, `None` delivers to every other peer in the
        // call (never echoed back to the sender). Every other frame kind
        // (ParticipantJoined/Left, CallEnded, Error, ...) goes to everyone.
        let (exclude, only) = match &frame {
            SignalingFrame::Relayed { sender_user_id, target_user_id, .. } => {
                (Some(*sender_user_id), *target_user_id)
            }
            _ => (None, None),
        };

        let mut stale = Vec::new();
        {
            let clients = self.clients.read().await;
            if let Some(by_client) = clients.get(&call_id) {
                for handle in by_client.values() {
                    if let Some(target) = only {
                        if handle.user_id != target {
                            continue;
                        }
                    } else if Some(handle.user_id) == exclude {
                        continue;
                    }
                    if handle.tx.try_send(frame.clone()).is_err() {
                        self.metrics.outbound_queue_drops.fetch_add(1, Ordering::Relaxed);
                        stale.push(handle.client_id);
                    }
                }
            }
        }
        for client_id in stale {
            self.send_unregister(call_id, client_id).await;
        }
    }

    /// Routes back through the command channel rather than calling
    /// `handle_unregister` directly, since the latter needs `Arc<Self>`
    /// for its disconnect-leave spawn and `handle_broadcast` only has `&self`.
    async fn send_unregister(&self, call_id: CallId, client_id: Uuid) {
        let _ = self.cmd_tx.send(HubCommand::Unregister { call_id, client_id }).await;
    }

    async fn subscribe_to_call(self: Arc<Self>, call_id: CallId, cancel: CancellationToken) {
        let channel = format!("call:{call_id}");
        let mut stream = match self.bus.subscribe(&channel, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%call_id, error = %e, "signaling channel unavailable, closing local clients");
                let error_frame = SignalingFrame::Error {
                    error: ErrorEnvelope { kind: ErrorKind::Degraded, message: "signaling channel unavailable".into() },
                };
                self.handle_broadcast(call_id, error_frame).await;
                let client_ids: Vec<Uuid> = self
                    .clients
                    .read()
                    .await
                    .get(&call_id)
                    .map(|by_client| by_client.keys().copied().collect())
                    .unwrap_or_default();
                for client_id in client_ids {
                    self.send_unregister(call_id, client_id).await;
                }
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                BusEvent::SubscribeReady => debug!(%call_id, "signaling subscription ready"),
                BusEvent::Payload(bytes) => match serde_json::from_slice::<SignalingFrame>(&bytes) {
                    Ok(frame) => {
                        if self.cmd_tx.try_send(HubCommand::Broadcast { call_id, frame }).is_err() {
                            self.metrics.broadcast_channel_drops.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => warn!(%call_id, error = %e, "dropping malformed signaling payload"),
                },
            }
        }
    }

    /// Entry point for a freshly upgraded WebSocket. Caller must have
    /// already validated the JWT, conversation membership, and call
    /// invitation before calling this.
    pub async fn serve(self: Arc<Self>, ws: WebSocket, user_id: UserId, call_id: CallId) {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            let _ = ws;
            warn!(%user_id, %call_id, "signaling hub at capacity, closing");
            return;
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(Q_SIGNALING);
        let client_id = Uuid::new_v4();
        let client = SignalingClientHandle { client_id, user_id, tx: outbound_tx };

        if self.cmd_tx.send(HubCommand::Register { call_id, client }).await.is_err() {
            return;
        }

        let (ws_sink, ws_stream) = ws.split();
        let cmd_tx = self.cmd_tx.clone();
        let presence = self.presence.clone();
        let write_task = tokio::spawn(Self::write_pump(ws_sink, outbound_rx, presence, user_id));
        let read_task = tokio::spawn(Self::read_pump(ws_stream, cmd_tx.clone(), call_id, user_id));

        tokio::select! {
            _ = write_task => read_task.abort(),
            _ = read_task => write_task.abort(),
        }
        drop(permit);
        let _ = cmd_tx.send(HubCommand::Unregister { call_id, client_id }).await;
    }

    async fn read_pump(
        mut ws_stream: futures_util::stream::SplitStream<WebSocket>,
        cmd_tx: mpsc::Sender<HubCommand>,
        call_id: CallId,
        user_id: UserId,
    ) {
        loop {
            match ws_stream.next().await {
                Some(Ok(WsMessage::Pong(_) | WsMessage::Ping(_))) => {}
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<SignalingFrame>(&text) {
                    // Only offer/answer/ice/leave are accepted from clients; server-only
                    // frames (Relayed, ParticipantJoined/Left, CallEnded, ...) sent by a
                    // client are never forwarded.
                    Ok(frame @ (SignalingFrame::Offer { .. } | SignalingFrame::Answer { .. } | SignalingFrame::Ice { .. })) => {
                        let Some(stamped) = stamp_inbound_frame(frame, user_id, call_id) else {
                            warn!(%call_id, %user_id, "dropping malformed ICE candidate");
                            continue;
                        };
                        let _ = cmd_tx.send(HubCommand::Broadcast { call_id, frame: stamped }).await;
                    }
                    Ok(SignalingFrame::Leave) => break,
                    Ok(_other) => warn!(%call_id, %user_id, "client sent a server-only signaling frame, ignoring"),
                    Err(e) => warn!(%call_id, error = %e, "dropping malformed client signaling frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "signaling read-pump error");
                    break;
                }
            }
        }
    }

    async fn write_pump(
        mut ws_sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
        mut outbound_rx: mpsc::Receiver<SignalingFrame>,
        presence: Arc<Presence>,
        user_id: UserId,
    ) {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    let send = tokio::time::timeout(WRITE_DEADLINE, ws_sink.send(WsMessage::Text(text)));
                    if send.await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    let send = tokio::time::timeout(WRITE_DEADLINE, ws_sink.send(WsMessage::Ping(Vec::new())));
                    if send.await.is_err() {
                        break;
                    }
                    if let Err(e) = presence.touch(user_id).await {
                        warn!(%user_id, error = %e, "failed to refresh presence");
                    }
                }
            }
        }
    }

    #[must_use]
    pub async fn has_subscription(&self, call_id: CallId) -> bool {
        self.subscriptions.read().await.contains_key(&call_id)
    }
}

/// Stamps `sender_user_id`/`call_id`/`timestamp_ms` on an inbound
/// offer/answer/ice frame before it is re-broadcast, overwriting any
/// client-supplied values for those fields. Returns `None` for an ICE
/// frame missing a required field (the hub never forwards a malformed one).
/// Callers only pass `Offer`/`Answer`/`Ice` frames.
fn stamp_inbound_frame(frame: SignalingFrame, sender_user_id: UserId, call_id: CallId) -> Option<SignalingFrame> {
    use secureconnect_protocol::RelayPayload;

    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    let (target_user_id, payload) = match frame {
        SignalingFrame::Offer { target_user_id, payload } => (target_user_id, RelayPayload::Offer { payload }),
        SignalingFrame::Answer { target_user_id, payload } => (target_user_id, RelayPayload::Answer { payload }),
        SignalingFrame::Ice { target_user_id, payload } => {
            if payload.candidate.is_null() || payload.sdp_mid.is_null() || payload.sdp_m_line_index.is_null() {
                return None;
            }
            (target_user_id, RelayPayload::Ice { payload })
        }
        _ => unreachable!("read_pump only forwards offer/answer/ice frames here"),
    };

    Some(SignalingFrame::Relayed { sender_user_id, target_user_id, call_id, timestamp_ms, payload })
}
