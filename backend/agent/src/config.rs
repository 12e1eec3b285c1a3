//! Agent-side configuration file (`agent.yml`).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentIdentity,
    pub server: ServerEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Identity this machine connects as.
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Host (and optional port) of the central server, without a scheme.
    pub host: String,
    /// Use TLS for the WebSocket and for playbook downloads.
    pub secure: bool,
}

impl AgentConfig {
    pub fn new(id: Uuid, host: impl Into<String>, secure: bool) -> Self {
        Self {
            agent: AgentIdentity { id },
            server: ServerEndpoint {
                host: host.into(),
                secure,
            },
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config YAML at: {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)?;
        fs::write(path, raw)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))
    }

    /// WebSocket endpoint: `ws[s]://{host}/api/notify`.
    pub fn notify_url(&self) -> String {
        let scheme = if self.server.secure { "wss" } else { "ws" };
        format!("{}://{}/api/notify", scheme, self.server.host)
    }

    /// Base URL for playbook downloads: `http[s]://{host}`.
    pub fn http_base(&self) -> String {
        let scheme = if self.server.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.server.host)
    }
}
