pub mod error;
pub mod event;
pub mod protocol;
pub mod records;
pub mod store;

pub use error::ArmadaError;
pub use event::{Event, EventType, Recipient, Subscriber, SubscriberType, Subscription};
pub use protocol::{
    AgentLoginPayload, ClientFrame, EventEnvelope, Intent, Reply, StatusPatch,
    StatusUpdatePayload, CLOSE_AGENT_NOT_FOUND, CLOSE_ALREADY_CONNECTED, CLOSE_INVALID_LOGIN,
};
pub use records::{AgentRecord, AgentSoftwareRecord};
pub use store::{FleetStore, MemoryStore};
