//! Persistence collaborator seam.
//!
//! The relational store for accounts, catalog, and fleet entities lives
//! outside this runtime; [`FleetStore`] is the interface the core consumes.
//! [`MemoryStore`] backs the tests and the default process wiring.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ArmadaError;
use crate::records::{AgentRecord, AgentSoftwareRecord};

/// Lookup and persistence operations the event core needs from the store.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn lookup_agent(&self, id: Uuid) -> Result<Option<AgentRecord>, ArmadaError>;

    /// Insert-or-update by id.
    async fn persist_agent(&self, agent: &AgentRecord) -> Result<(), ArmadaError>;

    async fn lookup_software(&self, id: Uuid) -> Result<Option<AgentSoftwareRecord>, ArmadaError>;

    /// Insert-or-update by id.
    async fn persist_software(&self, software: &AgentSoftwareRecord) -> Result<(), ArmadaError>;

    async fn delete_software(&self, id: Uuid) -> Result<(), ArmadaError>;

    /// Agents currently flagged connected (used by the boot-time reset pass).
    async fn connected_agents(&self) -> Result<Vec<AgentRecord>, ArmadaError>;
}

/// In-memory [`FleetStore`].
#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<Uuid, AgentRecord>>,
    software: RwLock<HashMap<Uuid, AgentSoftwareRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_agent(&self, agent: AgentRecord) {
        self.agents.write().await.insert(agent.id, agent);
    }

    pub async fn insert_software(&self, software: AgentSoftwareRecord) {
        self.software.write().await.insert(software.id, software);
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn lookup_agent(&self, id: Uuid) -> Result<Option<AgentRecord>, ArmadaError> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn persist_agent(&self, agent: &AgentRecord) -> Result<(), ArmadaError> {
        self.agents.write().await.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn lookup_software(&self, id: Uuid) -> Result<Option<AgentSoftwareRecord>, ArmadaError> {
        Ok(self.software.read().await.get(&id).cloned())
    }

    async fn persist_software(&self, software: &AgentSoftwareRecord) -> Result<(), ArmadaError> {
        self.software
            .write()
            .await
            .insert(software.id, software.clone());
        Ok(())
    }

    async fn delete_software(&self, id: Uuid) -> Result<(), ArmadaError> {
        self.software.write().await.remove(&id);
        Ok(())
    }

    async fn connected_agents(&self) -> Result<Vec<AgentRecord>, ArmadaError> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .filter(|agent| agent.connected)
            .cloned()
            .collect())
    }
}
