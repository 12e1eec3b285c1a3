//! Playbook execution collaborator.
//!
//! Install and uninstall commands resolve to an Ansible playbook served by
//! the central server: fetch it, run it, report the exit.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command as ProcessCommand;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PlaybookError {
    /// The playbook could not be downloaded from the server.
    #[error("error fetching playbook: {0}")]
    Fetch(String),
    /// `ansible-playbook` failed or could not be spawned.
    #[error("playbook run failed: {0}")]
    Run(String),
}

/// Fetches and executes install/uninstall playbooks. Calls block for as long
/// as the package manager runs (seconds to minutes).
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn fetch_and_run(&self, system_name: &str, playbook: &str) -> Result<(), PlaybookError>;
}

/// Production runner: downloads from
/// `{base}/ansible/playbooks/{system}/{playbook}.yml` and shells out to
/// `ansible-playbook`.
pub struct AnsibleRunner {
    http: Client,
    base_url: String,
}

impl AnsibleRunner {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl PlaybookRunner for AnsibleRunner {
    async fn fetch_and_run(&self, system_name: &str, playbook: &str) -> Result<(), PlaybookError> {
        let url = format!(
            "{}/ansible/playbooks/{}/{}.yml",
            self.base_url, system_name, playbook
        );
        debug!(url = %url, "fetching playbook");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| PlaybookError::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PlaybookError::Fetch(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| PlaybookError::Fetch(err.to_string()))?;

        let path = PathBuf::from(format!("{system_name}.yml"));
        fs::write(&path, body)
            .await
            .map_err(|err| PlaybookError::Run(err.to_string()))?;
        let status = ProcessCommand::new("ansible-playbook")
            .arg(&path)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await;
        let _ = fs::remove_file(&path).await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(PlaybookError::Run(format!(
                "ansible-playbook exited with {status}"
            ))),
            Err(err) => Err(PlaybookError::Run(err.to_string())),
        }
    }
}
