//! Per-process WebSocket fan-out for chat. Owns the client registry and
//! the per-conversation subscription lifecycle, run loop modeled on the
//! register -> select-loop -> cleanup shape used for the WebSocket pumps
//! elsewhere in this codebase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use secureconnect_bus::{Bus, BusEvent, Presence};
use secureconnect_protocol::limits::{PING_INTERVAL, Q_CHAT, Q_HUB, WRITE_DEADLINE};
use secureconnect_protocol::{ChatFrame, ConversationId, UserId};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

struct ChatClientHandle {
    client_id: Uuid,
    user_id: UserId,
    tx: mpsc::Sender<ChatFrame>,
}

struct Subscription {
    cancel: CancellationToken,
}

enum HubCommand {
    Register {
        conversation_id: ConversationId,
        client: ChatClientHandle,
    },
    Unregister {
        conversation_id: ConversationId,
        client_id: Uuid,
    },
    Broadcast {
        conversation_id: ConversationId,
        frame: ChatFrame,
    },
}

#[derive(Default)]
pub struct HubMetrics {
    pub broadcast_channel_drops: AtomicU64,
    pub outbound_queue_drops: AtomicU64,
}

pub struct ChatHub {
    clients: RwLock<HashMap<ConversationId, HashMap<Uuid, ChatClientHandle>>>,
    subscriptions: RwLock<HashMap<ConversationId, Subscription>>,
    cmd_tx: mpsc::Sender<HubCommand>,
    semaphore: Arc<Semaphore>,
    bus: Arc<dyn Bus>,
    presence: Arc<Presence>,
    pub metrics: Arc<HubMetrics>,
}

impl ChatHub {
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, presence: Arc<Presence>, max_connections: usize) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(Q_HUB);
        let hub = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            cmd_tx,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            bus,
            presence,
            metrics: Arc::new(HubMetrics::default()),
        });
        tokio::spawn(Self::run(hub.clone(), cmd_rx));
        hub
    }

    async fn run(hub: Arc<Self>, mut cmd_rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HubCommand::Register { conversation_id, client } => {
                    hub.clone().handle_register(conversation_id, client).await;
                }
                HubCommand::Unregister { conversation_id, client_id } => {
                    hub.handle_unregister(conversation_id, client_id).await;
                }
                HubCommand::Broadcast { conversation_id, frame } => {
                    hub.handle_broadcast(conversation_id, frame).await;
                }
            }
        }
    }

    async fn handle_register(self: Arc<Self>, conversation_id: ConversationId, client: ChatClientHandle) {
        let user_id = client.user_id;
        {
            let mut clients = self.clients.write().await;
            clients.entry(conversation_id).or_default().insert(client.client_id, client);
        }

        if let Err(e) = self.presence.touch(user_id).await {
            warn!(%user_id, error = %e, "failed to record presence on connect");
        }

        let needs_subscription = !self.subscriptions.read().await.contains_key(&conversation_id);
        if needs_subscription {
            let mut subs = self.subscriptions.write().await;
            if !subs.contains_key(&conversation_id) {
                let cancel = CancellationToken::new();
                subs.insert(conversation_id, Subscription { cancel: cancel.clone() });
                drop(subs);
                tokio::spawn(Self::subscribe_to_conversation(self, conversation_id, cancel));
            }
        }
    }

    async fn handle_unregister(&self, conversation_id: ConversationId, client_id: Uuid) {
        let should_cancel_subscription;
        {
            let mut clients = self.clients.write().await;
            if let Some(by_client) = clients.get_mut(&conversation_id) {
                by_client.remove(&client_id);
                should_cancel_subscription = by_client.is_empty();
                if should_cancel_subscription {
                    clients.remove(&conversation_id);
                }
            } else {
                should_cancel_subscription = false;
            }
        }
        self.semaphore.add_permits(1);

        if should_cancel_subscription {
            if let Some(sub) = self.subscriptions.write().await.remove(&conversation_id) {
                sub.cancel.cancel();
            }
        }
    }

    async fn handle_broadcast(&self, conversation_id: ConversationId, frame: ChatFrame) {
        let mut stale = Vec::new();
        {
            let clients = self.clients.read().await;
            if let Some(by_client) = clients.get(&conversation_id) {
                for handle in by_client.values() {
                    if handle.tx.try_send(frame.clone()).is_err() {
                        self.metrics.outbound_queue_drops.fetch_add(1, Ordering::Relaxed);
                        stale.push(handle.client_id);
                    }
                }
            }
        }
        for client_id in stale {
            self.handle_unregister(conversation_id, client_id).await;
        }
    }

    async fn subscribe_to_conversation(
        self: Arc<Self>,
        conversation_id: ConversationId,
        cancel: CancellationToken,
    ) {
        let channel = format!("chat:{conversation_id}");
        let mut stream = match self.bus.subscribe(&channel, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%conversation_id, error = %e, "failed to subscribe to conversation channel");
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                BusEvent::SubscribeReady => debug!(%conversation_id, "chat subscription ready"),
                BusEvent::Payload(bytes) => match serde_json::from_slice::<ChatFrame>(&bytes) {
                    Ok(frame) => {
                        if self
                            .cmd_tx
                            .try_send(HubCommand::Broadcast { conversation_id, frame })
                            .is_err()
                        {
                            self.metrics.broadcast_channel_drops.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => warn!(%conversation_id, error = %e, "dropping malformed chat payload"),
                },
            }
        }
    }

    /// Pushes a frame into the hub's broadcast channel; drops and counts on full.
    pub fn broadcast(&self, conversation_id: ConversationId, frame: ChatFrame) {
        if self
            .cmd_tx
            .try_send(HubCommand::Broadcast { conversation_id, frame })
            .is_err()
        {
            self.metrics.broadcast_channel_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entry point for a freshly upgraded WebSocket. Caller must have
    /// already validated the JWT and membership before calling this.
    pub async fn serve(self: Arc<Self>, ws: WebSocket, user_id: UserId, conversation_id: ConversationId) {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            let _ = ws;
            warn!(%user_id, %conversation_id, "chat hub at capacity, closing");
            return;
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(Q_CHAT);
        let client_id = Uuid::new_v4();
        let client = ChatClientHandle { client_id, user_id, tx: outbound_tx };

        if self
            .cmd_tx
            .send(HubCommand::Register { conversation_id, client })
            .await
            .is_err()
        {
            return;
        }

        let (ws_sink, ws_stream) = ws.split();
        let cmd_tx = self.cmd_tx.clone();
        let presence = self.presence.clone();
        let write_task = tokio::spawn(Self::write_pump(ws_sink, outbound_rx, presence, user_id));
        let read_task = tokio::spawn(Self::read_pump(ws_stream));

        // Destroy the client on the first of {read-pump exit, write-pump exit}:
        // whichever finishes first, abort the other rather than waiting on a
        // channel the peer can no longer drive.
        tokio::select! {
            _ = write_task => read_task.abort(),
            _ = read_task => write_task.abort(),
        }
        drop(permit);
        let _ = cmd_tx
            .send(HubCommand::Unregister { conversation_id, client_id })
            .await;
    }

    async fn read_pump(mut ws_stream: futures_util::stream::SplitStream<WebSocket>) {
        loop {
            match ws_stream.next().await {
                Some(Ok(WsMessage::Pong(_) | WsMessage::Ping(_))) => {}
                Some(Ok(WsMessage::Text(text))) => {
                    // Only typing indicators and pings are accepted from clients; anything
                    // else is dropped with a warning per the wire-format contract.
                    match serde_json::from_str::<ChatFrame>(&text) {
                        Ok(ChatFrame::Ping) => {}
                        Ok(_other) => warn!("client sent a server-only chat frame, ignoring"),
                        Err(e) => warn!(error = %e, "dropping malformed client chat frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "chat read-pump error");
                    break;
                }
            }
        }
    }

    async fn write_pump(
        mut ws_sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
        mut outbound_rx: mpsc::Receiver<ChatFrame>,
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
                    // PING_INTERVAL is shorter than the presence TTL, so a
                    // connection that outlives the TTL still reads as live.
                    if let Err(e) = presence.touch(user_id).await {
                        warn!(%user_id, error = %e, "failed to refresh presence");
                    }
                }
            }
        }
    }

    #[must_use]
    pub async fn has_subscription(&self, conversation_id: ConversationId) -> bool {
        self.subscriptions.read().await.contains_key(&conversation_id)
    }

    #[must_use]
    pub async fn client_count(&self, conversation_id: ConversationId) -> usize {
        self.clients
            .read()
            .await
            .get(&conversation_id)
            .map_or(0, HashMap::len)
    }
}
