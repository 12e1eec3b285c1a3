pub mod client;
pub mod commands;
pub mod config;
pub mod playbook;

pub use client::{AgentClient, DEFAULT_RETRIES, RECONNECT_DELAY};
pub use commands::Command;
pub use config::AgentConfig;
pub use playbook::{AnsibleRunner, PlaybookError, PlaybookRunner};
