//! WebSocket session handling for `/api/notify`.
//!
//! Every consumer attaches here: browser sessions subscribe to events, agents
//! additionally authenticate with an `agent-login` envelope. Each inbound
//! frame gets exactly one reply; matched events are pushed to subscribers as
//! `{"event": {...}}` frames over the same connection.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::{
    extract::{
        State,
        connect_info::ConnectInfo,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use armada_core::{
    AgentLoginPayload, AgentRecord, ArmadaError, CLOSE_AGENT_NOT_FOUND, CLOSE_ALREADY_CONNECTED,
    CLOSE_INVALID_LOGIN, ClientFrame, Event, EventEnvelope, EventType, Intent, Recipient, Reply,
    StatusUpdatePayload, SubscriberType, Subscription,
};

use crate::reconciler;
use crate::server::GatewayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let source_ip = source_ip(&headers, peer);
    ws.on_upgrade(move |socket| handle_connection(socket, state, source_ip))
}

/// A proxy-forwarded header wins over the transport peer address.
fn source_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// What handling one inbound frame produces.
enum FrameOutcome {
    Reply(Reply),
    Close { code: u16, reason: String },
}

async fn handle_connection(socket: WebSocket, state: GatewayState, source_ip: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Forward queued outbound frames to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        state,
        outbound: tx,
        subscriptions: Vec::new(),
        agent: None,
        source_ip,
    };
    let mut clean_close = false;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match session.handle_text(&text).await {
                FrameOutcome::Reply(reply) => session.send_reply(reply),
                FrameOutcome::Close { code, reason } => {
                    let _ = session.outbound.send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Owned(reason),
                    })));
                    clean_close = true;
                    break;
                }
            },
            Ok(Message::Close(frame)) => {
                clean_close = frame.map_or(true, |frame| frame.code == 1000);
                break;
            }
            Ok(_) => {} // binary, ping, pong
            Err(_) => break,
        }
    }

    session.finish(clean_close).await;
    let _ = send_task.await;
}

/// Per-connection state: the subscriptions this connection registered and,
/// once an `agent-login` succeeded, the agent it acts as.
struct Session {
    state: GatewayState,
    outbound: mpsc::UnboundedSender<Message>,
    subscriptions: Vec<Uuid>,
    agent: Option<AgentRecord>,
    source_ip: String,
}

impl Session {
    async fn handle_text(&mut self, text: &str) -> FrameOutcome {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => return FrameOutcome::Reply(Reply::error(err.to_string())),
        };
        match frame {
            ClientFrame::Intent(Intent::Subscribe {
                subscriber_type,
                event_type,
                id,
            }) => {
                let subscription = self.register_push_subscription(subscriber_type, event_type, id);
                FrameOutcome::Reply(Reply::ok().with_subscription(subscription))
            }
            ClientFrame::Intent(Intent::Unsubscribe { sub_id }) => {
                self.state.bus.unsubscribe(sub_id);
                self.subscriptions.retain(|id| *id != sub_id);
                FrameOutcome::Reply(Reply::ok())
            }
            ClientFrame::Event(event) => self.handle_event(event).await,
        }
    }

    /// Register a subscription whose handler re-serializes matched events
    /// onto this connection. A closed connection reports delivery failure.
    fn register_push_subscription(
        &mut self,
        kind: SubscriberType,
        event_type: EventType,
        id: Option<String>,
    ) -> Subscription {
        let outbound = self.outbound.clone();
        let subscription = self
            .state
            .bus
            .subscribe(kind, event_type, id, move |event| {
                let outbound = outbound.clone();
                async move {
                    match serde_json::to_string(&EventEnvelope::new(event)) {
                        Ok(text) => outbound.send(Message::Text(text)).is_ok(),
                        Err(_) => false,
                    }
                }
            });
        self.subscriptions.push(subscription.id);
        subscription
    }

    async fn handle_event(&mut self, event: Event) -> FrameOutcome {
        if event.kind == EventType::AgentLogin {
            return self.handle_login(event).await;
        }
        if event.kind == EventType::SoftwareStatusUpdate {
            if let Err(err) = self.apply_status_update(&event).await {
                warn!(error = %err, "rejected status update");
                return FrameOutcome::Reply(Reply::error(err.to_string()));
            }
        }
        self.dispatch(event.clone()).await;
        FrameOutcome::Reply(Reply::ok().with_event(event))
    }

    /// Authenticate this connection as an agent. Failures close the
    /// connection with their distinct code; the previous session (if any)
    /// is left untouched.
    async fn handle_login(&mut self, event: Event) -> FrameOutcome {
        let payload: AgentLoginPayload = match serde_json::from_value(event.message.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return FrameOutcome::Close {
                    code: CLOSE_INVALID_LOGIN,
                    reason: format!("invalid login payload: {err}"),
                };
            }
        };
        let agent = match self.state.store.lookup_agent(payload.agent_id).await {
            Ok(agent) => agent,
            Err(err) => return FrameOutcome::Reply(Reply::error(err.to_string())),
        };
        let Some(mut agent) = agent else {
            return FrameOutcome::Close {
                code: CLOSE_AGENT_NOT_FOUND,
                reason: format!("agent '{}' not found", payload.agent_id),
            };
        };
        if agent.connected {
            return FrameOutcome::Close {
                code: CLOSE_ALREADY_CONNECTED,
                reason: "agent is already connected".to_string(),
            };
        }
        agent.connected = true;
        agent.connection_interrupted = false;
        agent.last_connection_start = Some(Utc::now());
        agent.connection_from_ip_address = Some(self.source_ip.clone());
        if let Err(err) = self.state.store.persist_agent(&agent).await {
            return FrameOutcome::Reply(Reply::error(err.to_string()));
        }
        info!(agent = %agent.id, ip = %self.source_ip, "agent logged in");
        self.agent = Some(agent);
        self.dispatch(event).await;
        FrameOutcome::Reply(Reply::ok())
    }

    async fn apply_status_update(&self, event: &Event) -> Result<(), ArmadaError> {
        let agent = self.agent.as_ref().ok_or(ArmadaError::LoginRequired)?;
        let payload: StatusUpdatePayload = serde_json::from_value(event.message.clone())
            .map_err(|err| ArmadaError::MalformedFrame(err.to_string()))?;
        reconciler::apply_status_update(&self.state, agent, payload).await
    }

    /// Hand an accepted event to the dispatcher; an undelivered durable
    /// event goes onto the queue for the drain tick.
    async fn dispatch(&self, event: Event) {
        let delivered = self.state.bus.notify(&event).await;
        if !delivered && !event.ephemeral {
            self.state.bus.enqueue(event);
        }
    }

    fn send_reply(&self, reply: Reply) {
        if let Ok(text) = serde_json::to_string(&reply) {
            let _ = self.outbound.send(Message::Text(text));
        }
    }

    /// Disconnect cleanup. Subscriptions registered by this connection are
    /// removed first so no handler outlives its socket, then the agent's
    /// connectivity bookkeeping is persisted and a `ws-disconnect` event is
    /// emitted for server-side observers.
    async fn finish(mut self, clean: bool) {
        for id in self.subscriptions.drain(..) {
            self.state.bus.unsubscribe(id);
        }
        let Some(mut agent) = self.agent.take() else {
            debug!("connection closed");
            return;
        };
        agent.connected = false;
        agent.last_connection_end = Some(Utc::now());
        if clean {
            debug!(agent = %agent.id, "agent connection closed");
        } else {
            agent.connection_interrupted = true;
            warn!(agent = %agent.id, "agent connection closed unexpectedly");
        }
        if let Err(err) = self.state.store.persist_agent(&agent).await {
            warn!(error = %err, "failed to persist agent disconnect state");
        }
        let event = Event::new(
            EventType::WsDisconnect,
            Some(Recipient::broadcast(SubscriberType::Server)),
            json!({"agent_id": agent.id}),
        );
        self.state.bus.notify(&event).await;
    }
}
