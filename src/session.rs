use std::time::Duration;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorNumber};

use crate::client::AgentChannel;
use crate::error::QgaError;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// A libvirt connection plus the resolved guest domain.
///
/// Owned by exactly one caller. Dropping it releases the domain handle and
/// closes the connection; nothing is sent to the guest agent.
pub struct AgentSession {
    // dropped before `_conn`
    domain: Domain,
    _conn: ConnGuard,
}

impl AgentSession {
    /// Open `uri` and look up `domain_name`. No retries.
    pub fn connect(uri: &str, domain_name: &str) -> Result<Self, QgaError> {
        // Keep libvirt from printing its own copy of every error to stderr.
        virt_error::clear_error_callback();

        tracing::debug!(uri, "CONNECT");
        let conn = Connect::open(Some(uri))
            .map(ConnGuard)
            .map_err(|e| QgaError::ConnectionFailure {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;

        tracing::debug!(domain = domain_name, "FIND DOMAIN");
        let domain =
            Domain::lookup_by_name(&conn, domain_name).map_err(|e| QgaError::DomainNotFound {
                name: domain_name.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            domain,
            _conn: conn,
        })
    }
}

impl AgentChannel for AgentSession {
    fn command(&self, name: &str, request: &str, timeout: Duration) -> Result<String, QgaError> {
        self.domain
            .qemu_agent_command(request, timeout_secs(timeout), 0)
            .map_err(|e| agent_error(name, e.code(), e.to_string(), timeout))
    }
}

/// libvirt takes whole seconds and treats 0 as "don't wait", so round up
/// and never go below one.
fn timeout_secs(timeout: Duration) -> i32 {
    let secs = timeout.as_secs_f64().ceil();
    if secs >= f64::from(i32::MAX) {
        i32::MAX
    } else {
        (secs as i32).max(1)
    }
}

fn agent_error(name: &str, code: ErrorNumber, message: String, timeout: Duration) -> QgaError {
    match code {
        ErrorNumber::OperationTimeout | ErrorNumber::AgentUnresponsive => {
            QgaError::TransportTimeout {
                command: name.to_string(),
                timeout,
            }
        }
        _ => QgaError::Agent {
            command: name.to_string(),
            message,
        },
    }
}
