//! The agent command loop.
//!
//! Outer loop: connect, log in, subscribe to this agent's command topics,
//! then hand off to the inner loop. Any failure sleeps a fixed interval and
//! reconnects until the retry budget runs out (an infinite budget never
//! decrements). Inner loop: `select!` over the socket and the outbound
//! report queue, so slow playbook runs never stall the network path — each
//! command executes in its own task and pushes its report onto the queue.
//! The queue outlives connections: a report produced while disconnected is
//! delivered on the next successful session, and a failed send puts the
//! report back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use armada_core::{
    Event, EventEnvelope, EventType, Intent, Recipient, Reply, SubscriberType,
};

use crate::commands::{self, Command};
use crate::config::AgentConfig;
use crate::playbook::PlaybookRunner;

/// Fixed pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Connection attempts before giving up, unless running with infinite
/// retries.
pub const DEFAULT_RETRIES: u32 = 5;

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct AgentClient {
    config: AgentConfig,
    runner: Arc<dyn PlaybookRunner>,
    retries: Option<u32>,
}

impl AgentClient {
    /// `retries = None` reconnects forever.
    pub fn new(config: AgentConfig, runner: Arc<dyn PlaybookRunner>, retries: Option<u32>) -> Self {
        Self {
            config,
            runner,
            retries,
        }
    }

    /// Run until the retry budget is exhausted. Only returns with an error.
    pub async fn run(self) -> Result<()> {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Event>();
        let mut remaining = self.retries;
        info!(
            agent = %self.config.agent.id,
            url = %self.config.notify_url(),
            "starting command loop"
        );
        loop {
            if let Err(err) = self.session(&report_tx, &mut report_rx).await {
                warn!(error = %err, "connection to server failed");
            }
            if let Some(left) = remaining.as_mut() {
                *left -= 1;
                if *left == 0 {
                    bail!("connection retries exhausted");
                }
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    /// One connection lifetime: handshake, then the inner loop.
    async fn session(
        &self,
        report_tx: &mpsc::UnboundedSender<Event>,
        report_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<()> {
        let url = self.config.notify_url();
        debug!(url = %url, "connecting");
        let (mut socket, _) = connect_async(&url)
            .await
            .context("websocket connect failed")?;

        send_event(&mut socket, login_event(self.config.agent.id)).await?;
        expect_success(&mut socket).await.context("login rejected")?;
        info!("logged in successfully");

        for event_type in [EventType::InstallSoftware, EventType::UninstallSoftware] {
            subscribe(&mut socket, event_type, self.config.agent.id).await?;
        }
        info!("subscribed to command topics");

        loop {
            tokio::select! {
                frame = socket.next() => {
                    let msg = frame
                        .ok_or_else(|| anyhow!("server closed the connection"))?
                        .context("websocket read failed")?;
                    match msg {
                        Message::Text(text) => self.handle_frame(&text, report_tx),
                        Message::Close(frame) => bail!("server closed the connection: {frame:?}"),
                        _ => {}
                    }
                }
                Some(report) = report_rx.recv() => {
                    let text = serde_json::to_string(&EventEnvelope::new(report.clone()))?;
                    if let Err(err) = socket.send(Message::Text(text)).await {
                        // Keep the report for the next connection.
                        let _ = report_tx.send(report);
                        return Err(err).context("failed to send status report");
                    }
                    debug!("sent status report");
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, report_tx: &mpsc::UnboundedSender<Event>) {
        match parse_inbound(text) {
            Ok(Inbound::Reply(reply)) => {
                if reply.success {
                    debug!("received positive confirmation");
                } else {
                    warn!(error = ?reply.error, "server reported an error");
                }
            }
            Ok(Inbound::Event(event)) => self.handle_event(event, report_tx),
            Err(err) => warn!(error = %err, "received uninterpretable frame"),
        }
    }

    fn handle_event(&self, event: Event, report_tx: &mpsc::UnboundedSender<Event>) {
        if event.kind == EventType::SoftwareStatusUpdate {
            return;
        }
        if !commands::addressed_to(&event, self.config.agent.id) {
            warn!(event_type = %event.kind, "received event for a different agent");
            return;
        }
        let command = match event.kind {
            EventType::InstallSoftware | EventType::UninstallSoftware => {
                match Command::from_event(&event) {
                    Some(command) => command,
                    None => {
                        warn!(event_type = %event.kind, "malformed command payload");
                        return;
                    }
                }
            }
            other => {
                error!(event_type = %other, "received unsupported event");
                return;
            }
        };
        // Execution may take minutes; it must not hold up the socket.
        let runner = self.runner.clone();
        let report_tx = report_tx.clone();
        tokio::spawn(async move {
            let report = commands::execute(runner.as_ref(), command).await;
            let _ = report_tx.send(report);
        });
    }
}

enum Inbound {
    Reply(Reply),
    Event(Event),
}

fn parse_inbound(text: &str) -> Result<Inbound> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("success").is_some() {
        return Ok(Inbound::Reply(serde_json::from_value(value)?));
    }
    if value.get("event").is_some() {
        let envelope: EventEnvelope = serde_json::from_value(value)?;
        return Ok(Inbound::Event(envelope.event));
    }
    bail!("frame is neither a reply nor an event")
}

fn login_event(agent_id: Uuid) -> Event {
    Event::new(
        EventType::AgentLogin,
        Some(Recipient::broadcast(SubscriberType::Server)),
        json!({"agent_id": agent_id}),
    )
}

async fn send_event(socket: &mut ClientSocket, event: Event) -> Result<()> {
    let text = serde_json::to_string(&EventEnvelope::new(event))?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn subscribe(socket: &mut ClientSocket, event_type: EventType, agent_id: Uuid) -> Result<()> {
    let intent = Intent::Subscribe {
        subscriber_type: SubscriberType::Agent,
        event_type,
        id: Some(agent_id.to_string()),
    };
    socket
        .send(Message::Text(serde_json::to_string(&intent)?))
        .await?;
    expect_success(socket)
        .await
        .with_context(|| format!("subscription to '{event_type}' rejected"))
}

/// Read frames until the next reply; fail on an unsuccessful one.
async fn expect_success(socket: &mut ClientSocket) -> Result<()> {
    loop {
        let msg = socket
            .next()
            .await
            .ok_or_else(|| anyhow!("server closed the connection"))??;
        match msg {
            Message::Text(text) => {
                return match parse_inbound(&text)? {
                    Inbound::Reply(reply) if reply.success => Ok(()),
                    Inbound::Reply(reply) => bail!(
                        "server rejected request: {}",
                        reply.error.unwrap_or_else(|| "unknown error".to_string())
                    ),
                    Inbound::Event(_) => bail!("expected a reply, received an event"),
                };
            }
            Message::Close(frame) => bail!("server closed the connection: {frame:?}"),
            _ => {}
        }
    }
}
