use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::client::{AgentChannel, AgentClient};
use crate::error::QgaError;
use crate::protocol::GuestInfo;

/// Commands every session needs before anything else is attempted.
pub const REQUIRED_COMMANDS: [&str; 6] = [
    "guest-exec",
    "guest-exec-status",
    "guest-file-close",
    "guest-file-open",
    "guest-file-read",
    "guest-file-write",
];

/// One entry of the agent's `supported_commands` list.
///
/// Compared structurally: a command that is reported but disabled, or that
/// does not send a success response, does not satisfy a requirement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "success-response")]
    pub success_response: bool,
}

impl Capability {
    pub fn enabled(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            success_response: true,
        }
    }
}

pub fn required() -> BTreeSet<Capability> {
    REQUIRED_COMMANDS.iter().map(|n| Capability::enabled(n)).collect()
}

/// Names of required capabilities absent from `reported`, sorted.
pub fn missing(required: &BTreeSet<Capability>, reported: &BTreeSet<Capability>) -> Vec<String> {
    required
        .difference(reported)
        .map(|c| c.name.clone())
        .collect()
}

/// What the guest agent reported in reply to `guest-info`.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    version: Option<String>,
    reported: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn new(version: Option<String>, reported: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            version,
            reported: reported.into_iter().collect(),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn reported(&self) -> &BTreeSet<Capability> {
        &self.reported
    }

    pub fn missing_required(&self) -> Vec<String> {
        missing(&required(), &self.reported)
    }

    pub fn check(self) -> Result<Self, QgaError> {
        let missing = self.missing_required();
        if missing.is_empty() {
            return Ok(self);
        }
        tracing::debug!(?missing, "required capabilities missing");
        Err(QgaError::MissingCapability { missing })
    }
}

/// Ask the agent what it supports. Sends exactly one `guest-info`.
pub fn query<C: AgentChannel>(client: &AgentClient<C>) -> Result<CapabilitySet, QgaError> {
    let info = client.call(&GuestInfo)?;
    tracing::trace!(capabilities = ?info.supported_commands, "guest capabilities");
    if let Some(version) = &info.version {
        tracing::debug!(%version, "guest agent version");
    }
    Ok(CapabilitySet::new(info.version, info.supported_commands))
}

/// Query the agent and fail unless every required capability is present.
pub fn verify<C: AgentChannel>(client: &AgentClient<C>) -> Result<CapabilitySet, QgaError> {
    query(client)?.check()
}
