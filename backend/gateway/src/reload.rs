//! Per-user reload fan-out.
//!
//! Web sessions subscribe to `reload` events for their own user id. This
//! worker watches the server-addressed fleet events and converts each one
//! into a reload notification for the user owning the affected agent, so a
//! browser refreshes the moment an agent logs in, drops, or reports status.

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use armada_core::{Event, EventType, Recipient, SubscriberType};

use crate::server::GatewayState;

/// Front-end route refreshed by fleet reload notifications.
pub const RELOAD_PATH: &str = "/agents/software";

/// Register the server-side subscriptions driving the fan-out. Call once at
/// process start, after the bus exists.
pub fn register_reload_fanout(state: &GatewayState) {
    for event_type in [
        EventType::AgentLogin,
        EventType::WsDisconnect,
        EventType::SoftwareStatusUpdate,
    ] {
        let state = state.clone();
        state.bus.clone().subscribe(
            SubscriberType::Server,
            event_type,
            None,
            move |event| {
                let state = state.clone();
                async move {
                    if let Some(reload) = user_reload_event(&state, &event).await {
                        state.bus.notify(&reload).await;
                    }
                    // Never fail the triggering event's delivery.
                    true
                }
            },
        );
    }
    info!("registered reload fan-out subscriptions");
}

/// Resolve the user owning the agent an event concerns. Returns `None` when
/// the chain of lookups breaks (deleted record, malformed message).
async fn user_reload_event(state: &GatewayState, event: &Event) -> Option<Event> {
    let agent_id = match event.kind {
        EventType::AgentLogin | EventType::WsDisconnect => uuid_field(event, "agent_id")?,
        EventType::SoftwareStatusUpdate => {
            let software_id = uuid_field(event, "software_id")?;
            state
                .store
                .lookup_software(software_id)
                .await
                .ok()
                .flatten()?
                .agent_id
        }
        _ => return None,
    };
    let agent = state.store.lookup_agent(agent_id).await.ok().flatten()?;
    Some(Event::new(
        EventType::Reload,
        Some(Recipient::single(
            SubscriberType::User,
            agent.user_id.to_string(),
        )),
        json!({"path": RELOAD_PATH}),
    ))
}

fn uuid_field(event: &Event, key: &str) -> Option<Uuid> {
    event
        .message
        .get(key)
        .and_then(|value| value.as_str())
        .and_then(|value| Uuid::parse_str(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_bus::EventBus;
    use armada_core::{AgentRecord, AgentSoftwareRecord, MemoryStore};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn seeded_state() -> (GatewayState, AgentRecord) {
        let store = MemoryStore::new();
        let agent = AgentRecord::new(Uuid::new_v4(), Uuid::new_v4());
        store.insert_agent(agent.clone()).await;
        let state = GatewayState {
            bus: Arc::new(EventBus::new()),
            store: Arc::new(store),
        };
        (state, agent)
    }

    fn count_user_reloads(state: &GatewayState, user_id: Uuid) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        state.bus.subscribe(
            SubscriberType::User,
            EventType::Reload,
            Some(user_id.to_string()),
            move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
        );
        hits
    }

    #[tokio::test]
    async fn test_agent_login_fans_out_to_owner() {
        let (state, agent) = seeded_state().await;
        register_reload_fanout(&state);
        let hits = count_user_reloads(&state, agent.user_id);

        let login = Event::new(
            EventType::AgentLogin,
            Some(Recipient::broadcast(SubscriberType::Server)),
            json!({"agent_id": agent.id}),
        );
        state.bus.notify(&login).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_update_resolves_owner_through_software() {
        let (state, agent) = seeded_state().await;
        let software = AgentSoftwareRecord::new(Uuid::new_v4(), agent.id);
        state
            .store
            .persist_software(&software)
            .await
            .unwrap();
        register_reload_fanout(&state);
        let hits = count_user_reloads(&state, agent.user_id);

        let update = Event::new(
            EventType::SoftwareStatusUpdate,
            Some(Recipient::broadcast(SubscriberType::Server)),
            json!({"software_id": software.id}),
        );
        state.bus.notify(&update).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_event_is_skipped_quietly() {
        let (state, agent) = seeded_state().await;
        register_reload_fanout(&state);
        let hits = count_user_reloads(&state, agent.user_id);

        let orphan = Event::new(
            EventType::WsDisconnect,
            Some(Recipient::broadcast(SubscriberType::Server)),
            json!({"agent_id": Uuid::new_v4()}),
        );
        // Delivery still succeeds; there is just nothing to fan out.
        assert!(state.bus.notify(&orphan).await);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
