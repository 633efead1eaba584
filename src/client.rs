use std::time::Duration;

use crate::error::QgaError;
use crate::protocol::{self, AgentCommand};

/// Default per-call timeout for a single guest agent request.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport for raw guest agent requests.
///
/// Implementations send one JSON request and block until the matching reply
/// arrives or `timeout` expires. A timeout must surface as
/// [`QgaError::TransportTimeout`], never as an empty reply.
pub trait AgentChannel {
    fn command(&self, name: &str, request: &str, timeout: Duration) -> Result<String, QgaError>;
}

impl<T: AgentChannel + ?Sized> AgentChannel for &T {
    fn command(&self, name: &str, request: &str, timeout: Duration) -> Result<String, QgaError> {
        (**self).command(name, request, timeout)
    }
}

/// Typed request/response layer over an [`AgentChannel`].
pub struct AgentClient<C> {
    channel: C,
    timeout: Duration,
}

impl<C: AgentChannel> AgentClient<C> {
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Send `cmd` and decode its `return` value.
    pub fn call<T: AgentCommand>(&self, cmd: &T) -> Result<T::Reply, QgaError> {
        let request = protocol::encode(cmd)?;
        tracing::debug!(command = T::NAME, "GA send");
        tracing::trace!(command = T::NAME, %request, "GA send");

        let reply = self.channel.command(T::NAME, &request, self.timeout)?;
        tracing::trace!(command = T::NAME, %reply, "GA return");

        protocol::decode::<T>(&reply)
    }
}
