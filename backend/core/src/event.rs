use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of events that travel over the fleet bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// Tell a user's browser session to refresh a view
    Reload,
    /// Server → agent: install a software version
    InstallSoftware,
    /// Server → agent: uninstall a software package
    UninstallSoftware,
    /// Agent → server: report install/uninstall/corruption state
    SoftwareStatusUpdate,
    /// Agent → server: authenticate a connection as an agent
    AgentLogin,
    /// Server-internal: an agent session ended
    WsDisconnect,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// The classes of parties that subscribe to and receive events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberType {
    User,
    Agent,
    Server,
}

/// A matching key registered against the bus: class, event type, and an
/// optional identity. `id = None` matches any identity within the class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Subscriber {
    #[serde(rename = "type")]
    pub kind: SubscriberType,
    pub event_type: EventType,
    pub id: Option<String>,
}

impl Subscriber {
    pub fn new(kind: SubscriberType, event_type: EventType, id: Option<String>) -> Self {
        Self {
            kind,
            event_type,
            id,
        }
    }

    /// The three-way wildcard rule: event types must be equal; if the event is
    /// addressed, the classes must be equal; and either side may omit an
    /// identity to mean "all".
    pub fn matches(&self, event: &Event) -> bool {
        if self.event_type != event.kind {
            return false;
        }
        match &event.recipient {
            None => true,
            Some(recipient) => {
                if self.kind != recipient.kind {
                    return false;
                }
                recipient.id.is_none() || self.id.is_none() || self.id == recipient.id
            }
        }
    }
}

/// Addressing info carried by an event. `id = None` broadcasts to the class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Recipient {
    #[serde(rename = "subscriber_type")]
    pub kind: SubscriberType,
    pub id: Option<String>,
}

impl Recipient {
    pub fn broadcast(kind: SubscriberType) -> Self {
        Self { kind, id: None }
    }

    pub fn single(kind: SubscriberType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
        }
    }
}

/// An event on the bus. Ephemeral events are fire-and-forget; non-ephemeral
/// events are retried until at least one subscriber takes delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub recipient: Option<Recipient>,
    pub message: serde_json::Value,
    #[serde(default = "default_ephemeral")]
    pub ephemeral: bool,
}

fn default_ephemeral() -> bool {
    true
}

impl Event {
    pub fn new(kind: EventType, recipient: Option<Recipient>, message: serde_json::Value) -> Self {
        Self {
            kind,
            recipient,
            message,
            ephemeral: true,
        }
    }

    /// An event that must eventually land on at least one subscriber.
    pub fn durable(
        kind: EventType,
        recipient: Option<Recipient>,
        message: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            recipient,
            message,
            ephemeral: false,
        }
    }
}

/// A live registration on the bus. The UUID is the handle used to unsubscribe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub subscriber: Subscriber,
    pub id: Uuid,
}

impl Subscription {
    pub fn new(subscriber: Subscriber) -> Self {
        Self {
            subscriber,
            id: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn install_event(recipient: Option<Recipient>) -> Event {
        Event::new(EventType::InstallSoftware, recipient, json!({}))
    }

    #[test]
    fn test_wildcard_subscriber_matches_any_recipient_id() {
        let sub = Subscriber::new(SubscriberType::Agent, EventType::InstallSoftware, None);
        assert!(sub.matches(&install_event(Some(Recipient::single(SubscriberType::Agent, "A1")))));
        assert!(sub.matches(&install_event(Some(Recipient::broadcast(SubscriberType::Agent)))));
        assert!(sub.matches(&install_event(None)));
    }

    #[test]
    fn test_identified_subscriber_matches_own_id_and_broadcast() {
        let sub = Subscriber::new(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            Some("A1".to_string()),
        );
        assert!(sub.matches(&install_event(Some(Recipient::single(SubscriberType::Agent, "A1")))));
        assert!(sub.matches(&install_event(Some(Recipient::broadcast(SubscriberType::Agent)))));
        assert!(!sub.matches(&install_event(Some(Recipient::single(SubscriberType::Agent, "A2")))));
    }

    #[test]
    fn test_subscriber_never_matches_other_class_or_type() {
        let sub = Subscriber::new(SubscriberType::Agent, EventType::InstallSoftware, None);
        assert!(!sub.matches(&install_event(Some(Recipient::broadcast(SubscriberType::User)))));
        assert!(!sub.matches(&Event::new(EventType::Reload, None, json!({}))));
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::SoftwareStatusUpdate.to_string(), "software-status-update");
        assert_eq!(EventType::AgentLogin.to_string(), "agent-login");
        assert_eq!(EventType::WsDisconnect.to_string(), "ws-disconnect");
    }

    #[test]
    fn test_event_deserialize_defaults_ephemeral() {
        let event: Event = serde_json::from_value(json!({
            "type": "install-software",
            "recipient": {"subscriber_type": "agent", "id": "A1"},
            "message": {"service": "nginx"}
        }))
        .unwrap();
        assert!(event.ephemeral);
        assert_eq!(event.kind, EventType::InstallSoftware);
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = Event::durable(
            EventType::SoftwareStatusUpdate,
            Some(Recipient::broadcast(SubscriberType::Server)),
            json!({"software_id": "s1"}),
        );
        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
        assert!(!back.ephemeral);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result: Result<Event, _> = serde_json::from_value(json!({
            "type": "drop-tables",
            "recipient": null,
            "message": {}
        }));
        assert!(result.is_err());
    }
}
