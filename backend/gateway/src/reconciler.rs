//! Software lifecycle reconciliation.
//!
//! Status updates flow `installing → installed → uninstalling → (deleted)`
//! with an orthogonal `corrupt` flag settable from any state. An update is a
//! per-field merge; the terminal transition retires the record and queues a
//! reload for the owning user's sessions.

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use armada_core::{
    AgentRecord, ArmadaError, Event, EventType, Recipient, StatusUpdatePayload, SubscriberType,
};

use crate::reload::RELOAD_PATH;
use crate::server::GatewayState;

/// Apply one status update on behalf of the authenticated agent.
///
/// The update must reference software managed by that agent; the patch itself
/// was already validated at the deserialization boundary (only the four
/// status fields decode).
pub async fn apply_status_update(
    state: &GatewayState,
    agent: &AgentRecord,
    payload: StatusUpdatePayload,
) -> Result<(), ArmadaError> {
    let mut software = state
        .store
        .lookup_software(payload.software_id)
        .await?
        .ok_or(ArmadaError::SoftwareNotFound(payload.software_id))?;
    if software.agent_id != agent.id {
        return Err(ArmadaError::ForeignSoftware);
    }

    // The terminal check needs the pre-merge value: an update that clears
    // `uninstalling` and reports no version is only terminal if the record
    // was uninstalling when the update arrived.
    let was_uninstalling = software.uninstalling;

    let status = payload.status;
    if let Some(installed_version) = status.installed_version {
        software.installed_version = installed_version;
    }
    if let Some(corrupt) = status.corrupt {
        software.corrupt = corrupt;
    }
    if let Some(installing) = status.installing {
        software.installing = installing;
    }
    if let Some(uninstalling) = status.uninstalling {
        software.uninstalling = uninstalling;
    }
    state.store.persist_software(&software).await?;
    debug!(software = %software.id, agent = %agent.id, "applied software status update");

    let uninstall_finished = software.installed_version.is_none()
        && !software.uninstalling
        && was_uninstalling
        && !software.installing
        && !software.corrupt;
    if uninstall_finished {
        queue_owner_reload(state, agent.user_id);
        state.store.delete_software(software.id).await?;
        info!(
            software = %software.id,
            agent = %agent.id,
            "uninstall complete, software record retired"
        );
    }
    Ok(())
}

fn queue_owner_reload(state: &GatewayState, user_id: Uuid) {
    state.bus.enqueue(Event::new(
        EventType::Reload,
        Some(Recipient::single(SubscriberType::User, user_id.to_string())),
        json!({"path": RELOAD_PATH}),
    ));
}
