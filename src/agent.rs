use std::path::Path;
use std::time::Duration;

use crate::capability::{self, CapabilitySet};
use crate::client::{AgentChannel, AgentClient, DEFAULT_RPC_TIMEOUT};
use crate::error::QgaError;
use crate::exec::{self, ExecOptions, ExecOutput};
use crate::platform::{Platform, PlatformKind};
use crate::session::AgentSession;
use crate::transfer::{self, DEFAULT_CHUNK_SIZE};

/// Tunables shared by every operation on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub rpc_timeout: Duration,
    pub chunk_size: usize,
    /// Applied to [`GuestAgent::exec`]; `None` waits forever.
    pub exec_deadline: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exec_deadline: None,
        }
    }
}

/// A negotiated guest agent session.
///
/// Every operation takes `&mut self`: one command or transfer at a time.
/// Open another session to run things in parallel.
pub struct GuestAgent<C> {
    client: AgentClient<C>,
    platform: Box<dyn Platform>,
    capabilities: CapabilitySet,
    settings: Settings,
}

impl GuestAgent<AgentSession> {
    /// Connect to `domain` over libvirt at `uri` and negotiate capabilities.
    pub fn connect(
        uri: &str,
        domain: &str,
        kind: PlatformKind,
        settings: Settings,
    ) -> Result<Self, QgaError> {
        let session = AgentSession::connect(uri, domain)?;
        Self::negotiate(session, kind, settings)
    }
}

impl<C: AgentChannel> GuestAgent<C> {
    /// Verify the agent behind `channel` supports every required command.
    /// Nothing but `guest-info` is sent unless that check passes.
    pub fn negotiate(channel: C, kind: PlatformKind, settings: Settings) -> Result<Self, QgaError> {
        let client = AgentClient::new(channel, settings.rpc_timeout);
        let capabilities = capability::verify(&client)?;
        tracing::debug!(platform = %kind, "guest agent session established");

        Ok(Self {
            client,
            platform: kind.strategy(),
            capabilities,
            settings,
        })
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Run `command` and wait for it, bounded by the session's exec deadline.
    pub fn exec(&mut self, command: &str) -> Result<ExecOutput, QgaError> {
        let opts = ExecOptions {
            deadline: self.settings.exec_deadline,
            ..ExecOptions::default()
        };
        self.exec_with(command, &opts)
    }

    pub fn exec_with(&mut self, command: &str, opts: &ExecOptions) -> Result<ExecOutput, QgaError> {
        let _span = tracing::debug_span!("exec").entered();
        tracing::debug!(command, "EXEC");
        exec::run(&self.client, self.platform.as_ref(), command, opts)
    }

    /// Upload `local` to `remote`, returning the number of bytes sent.
    pub fn put(&mut self, local: &Path, remote: &str) -> Result<u64, QgaError> {
        let _span = tracing::debug_span!("put").entered();
        transfer::put(&self.client, local, remote, self.settings.chunk_size)
    }

    /// Download `remote` to `local`, returning the number of bytes received.
    pub fn get(&mut self, remote: &str, local: &Path) -> Result<u64, QgaError> {
        let _span = tracing::debug_span!("get").entered();
        transfer::get(&self.client, remote, local, self.settings.chunk_size)
    }
}
