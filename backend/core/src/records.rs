use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable record of one remote machine. Connection bookkeeping is mutated
/// only by the gateway session handler (and the boot-time reset pass).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    /// Owning user, resolved when fanning out reload notifications.
    pub user_id: Uuid,
    pub name: Option<String>,
    pub connected: bool,
    pub connection_interrupted: bool,
    pub last_connection_start: Option<DateTime<Utc>>,
    pub last_connection_end: Option<DateTime<Utc>>,
    pub connection_from_ip_address: Option<String>,
}

impl AgentRecord {
    pub fn new(id: Uuid, user_id: Uuid) -> Self {
        Self {
            id,
            user_id,
            name: None,
            connected: false,
            connection_interrupted: false,
            last_connection_start: None,
            last_connection_end: None,
            connection_from_ip_address: None,
        }
    }
}

/// Durable record of one software package on one agent. Mutated only by the
/// lifecycle reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSoftwareRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub installed_version: Option<String>,
    pub corrupt: bool,
    pub installing: bool,
    pub uninstalling: bool,
}

impl AgentSoftwareRecord {
    pub fn new(id: Uuid, agent_id: Uuid) -> Self {
        Self {
            id,
            agent_id,
            installed_version: None,
            corrupt: false,
            installing: false,
            uninstalling: false,
        }
    }
}
