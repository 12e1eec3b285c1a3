//! Wire protocol for the `/api/notify` WebSocket.
//!
//! Every frame is an independent JSON text message: clients send intents
//! (subscribe/unsubscribe) or event envelopes, the server answers each frame
//! with exactly one [`Reply`] and pushes matched events as envelopes.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::ArmadaError;
use crate::event::{Event, EventType, Subscription, SubscriberType};

/// Close code for a login frame whose payload could not be decoded.
pub const CLOSE_INVALID_LOGIN: u16 = 4000;
/// Close code when the agent already has a live session.
pub const CLOSE_ALREADY_CONNECTED: u16 = 4003;
/// Close code when the login names an unknown agent.
pub const CLOSE_AGENT_NOT_FOUND: u16 = 4004;

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Intent(Intent),
    Event(Event),
}

impl ClientFrame {
    /// Decode a text frame. Unknown event/subscriber types and missing
    /// required fields are rejected here, before any business logic runs.
    pub fn parse(text: &str) -> Result<Self, ArmadaError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ArmadaError::MalformedFrame(e.to_string()))?;
        if value.get("intent").is_some() {
            let intent: Intent = serde_json::from_value(value)
                .map_err(|e| ArmadaError::MalformedFrame(e.to_string()))?;
            return Ok(ClientFrame::Intent(intent));
        }
        if value.get("event").is_some() {
            let envelope: EventEnvelope = serde_json::from_value(value)
                .map_err(|e| ArmadaError::MalformedFrame(e.to_string()))?;
            return Ok(ClientFrame::Event(envelope.event));
        }
        Err(ArmadaError::MalformedFrame(
            "instructions unclear: expected an intent or an event".to_string(),
        ))
    }
}

/// Client → server intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "lowercase")]
pub enum Intent {
    Subscribe {
        subscriber_type: SubscriberType,
        event_type: EventType,
        #[serde(default)]
        id: Option<String>,
    },
    Unsubscribe {
        sub_id: Uuid,
    },
}

/// The `{"event": {...}}` envelope used in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self { event }
    }
}

/// Per-frame reply. `error`, `subscription`, and `event` appear only when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            subscription: None,
            event: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            subscription: None,
            event: None,
        }
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.event = Some(event);
        self
    }
}

/// Message payload of an `agent-login` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoginPayload {
    pub agent_id: Uuid,
}

/// Message payload of a `software-status-update` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub software_id: Uuid,
    pub status: StatusPatch,
}

/// Partial field set applied to an [`crate::records::AgentSoftwareRecord`].
///
/// Only the four listed keys are permitted; anything else fails the decode and
/// the whole update is rejected. `installed_version` distinguishes an absent
/// key (leave untouched) from an explicit `null` (clear the version).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusPatch {
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub installed_version: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstalling: Option<bool>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe_intent() {
        let frame = ClientFrame::parse(
            r#"{"intent":"subscribe","subscriber_type":"agent","event_type":"install-software","id":"A1"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Intent(Intent::Subscribe {
                subscriber_type,
                event_type,
                id,
            }) => {
                assert_eq!(subscriber_type, SubscriberType::Agent);
                assert_eq!(event_type, EventType::InstallSoftware);
                assert_eq!(id.as_deref(), Some("A1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unsubscribe_intent() {
        let sub_id = Uuid::new_v4();
        let frame =
            ClientFrame::parse(&format!(r#"{{"intent":"unsubscribe","sub_id":"{sub_id}"}}"#))
                .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Intent(Intent::Unsubscribe { sub_id: id }) if id == sub_id
        ));
    }

    #[test]
    fn test_parse_event_envelope() {
        let frame = ClientFrame::parse(
            r#"{"event":{"type":"agent-login","recipient":{"subscriber_type":"server","id":null},"message":{"agent_id":"7a6f3a3e-9f5a-4a0e-9a3b-2f9d1c8e4b21"}}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Event(event) => assert_eq!(event.kind, EventType::AgentLogin),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_shapes() {
        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse(r#"{"hello":"world"}"#).is_err());
        assert!(ClientFrame::parse(r#"{"intent":"fly"}"#).is_err());
        assert!(
            ClientFrame::parse(r#"{"event":{"type":"no-such-type","recipient":null,"message":{}}}"#)
                .is_err()
        );
    }

    #[test]
    fn test_reply_serialization_omits_unset_fields() {
        let text = serde_json::to_string(&Reply::ok()).unwrap();
        assert_eq!(text, r#"{"success":true}"#);
        let text = serde_json::to_string(&Reply::error("nope")).unwrap();
        assert_eq!(text, r#"{"success":false,"error":"nope"}"#);
    }

    #[test]
    fn test_status_patch_null_vs_absent() {
        let patch: StatusPatch =
            serde_json::from_value(json!({"installed_version": null, "uninstalling": false}))
                .unwrap();
        assert_eq!(patch.installed_version, Some(None));
        assert_eq!(patch.uninstalling, Some(false));
        assert_eq!(patch.corrupt, None);

        let patch: StatusPatch = serde_json::from_value(json!({"corrupt": true})).unwrap();
        assert_eq!(patch.installed_version, None);
        assert_eq!(patch.corrupt, Some(true));
    }

    #[test]
    fn test_status_patch_rejects_foreign_keys() {
        let result: Result<StatusPatch, _> =
            serde_json::from_value(json!({"corrupt": true, "favourite_color": "green"}));
        assert!(result.is_err());
    }
}
