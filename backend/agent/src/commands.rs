//! Inbound command decoding and outbound status reports.

use serde_json::json;
use tracing::error;
use uuid::Uuid;

use armada_core::{Event, EventType, Recipient, StatusPatch, SubscriberType};

use crate::playbook::{PlaybookError, PlaybookRunner};

/// A command the server addressed to this agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Install {
        system: String,
        software_id: Uuid,
        version: String,
    },
    Uninstall {
        system: String,
        software_id: Uuid,
    },
}

impl Command {
    /// Decode an install/uninstall event. The message carries the catalog
    /// system name under `service`, the software record id under `software`,
    /// and (for installs) the target `version`.
    pub fn from_event(event: &Event) -> Option<Command> {
        let message = &event.message;
        let system = message.get("service")?.as_str()?.to_string();
        let software_id = message
            .get("software")
            .and_then(|value| value.as_str())
            .and_then(|value| Uuid::parse_str(value).ok())?;
        match event.kind {
            EventType::InstallSoftware => {
                let version = message.get("version")?.as_str()?.to_string();
                Some(Command::Install {
                    system,
                    software_id,
                    version,
                })
            }
            EventType::UninstallSoftware => Some(Command::Uninstall {
                system,
                software_id,
            }),
            _ => None,
        }
    }

    pub fn software_id(&self) -> Uuid {
        match self {
            Command::Install { software_id, .. } | Command::Uninstall { software_id, .. } => {
                *software_id
            }
        }
    }

    pub fn system(&self) -> &str {
        match self {
            Command::Install { system, .. } | Command::Uninstall { system, .. } => system,
        }
    }

    /// Playbook name fetched from the server: the version for installs, the
    /// fixed `uninstall` playbook otherwise.
    pub fn playbook(&self) -> &str {
        match self {
            Command::Install { version, .. } => version,
            Command::Uninstall { .. } => "uninstall",
        }
    }

    /// Version carried in the status report: installs report the version
    /// they ran, uninstalls clear it.
    fn reported_version(&self) -> Option<&str> {
        match self {
            Command::Install { version, .. } => Some(version),
            Command::Uninstall { .. } => None,
        }
    }
}

/// Events not addressed to this agent's class and id (or broadcast to the
/// class) are protocol violations and must not be executed.
pub fn addressed_to(event: &Event, agent_id: Uuid) -> bool {
    match &event.recipient {
        Some(recipient) => {
            recipient.kind == SubscriberType::Agent
                && recipient
                    .id
                    .as_ref()
                    .is_none_or(|id| *id == agent_id.to_string())
        }
        None => false,
    }
}

/// Run a command to completion and report the outcome. Every execution
/// produces a status report, corrupt on failure; a failed fetch additionally
/// means no version ever landed on the machine.
pub async fn execute(runner: &dyn PlaybookRunner, command: Command) -> Event {
    let software_id = command.software_id();
    match runner.fetch_and_run(command.system(), command.playbook()).await {
        Ok(()) => status_event(software_id, command.reported_version(), false),
        Err(err @ PlaybookError::Fetch(_)) => {
            error!(error = %err, software = %software_id, "command failed");
            status_event(software_id, None, true)
        }
        Err(err @ PlaybookError::Run(_)) => {
            error!(error = %err, software = %software_id, "command failed");
            status_event(software_id, command.reported_version(), true)
        }
    }
}

/// Build the `software-status-update` event reporting a finished command.
pub fn status_event(software_id: Uuid, installed_version: Option<&str>, corrupt: bool) -> Event {
    Event::new(
        EventType::SoftwareStatusUpdate,
        Some(Recipient::broadcast(SubscriberType::Server)),
        json!({
            "software_id": software_id,
            "status": StatusPatch {
                installed_version: Some(installed_version.map(str::to_string)),
                corrupt: Some(corrupt),
                installing: Some(false),
                uninstalling: Some(false),
            }
        }),
    )
}
