use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum QgaError {
    #[error("failed to connect to hypervisor at {uri}: {message}")]
    #[diagnostic(help("ensure libvirtd is running and you have access to {uri}"))]
    ConnectionFailure { uri: String, message: String },

    #[error("domain not found: {name}: {message}")]
    #[diagnostic(help("check `virsh list --all` for the domain name"))]
    DomainNotFound { name: String, message: String },

    #[error("guest agent is missing required capabilities: {}", .missing.join(", "))]
    #[diagnostic(help(
        "install qemu-guest-agent in the guest and make sure these commands are not blocked"
    ))]
    MissingCapability { missing: Vec<String> },

    #[error("file or module does not exist: {}", .path.display())]
    LocalFileNotFound { path: PathBuf },

    #[error("failed to transfer file {src} to {dst}")]
    TransferFailure {
        src: String,
        dst: String,
        #[source]
        source: Box<QgaError>,
    },

    #[error("{command} timed out after {}s", .timeout.as_secs_f64())]
    #[diagnostic(help("the guest agent did not answer; check that qemu-guest-agent is running"))]
    TransportTimeout { command: String, timeout: Duration },

    #[error("{command} failed: {message}")]
    Agent { command: String, message: String },

    #[error("unexpected response to {command}: {message}")]
    Protocol { command: String, message: String },

    #[error("invalid command: {message}")]
    InvalidCommand { message: String },

    #[error("process {pid} did not exit within {}s", .elapsed.as_secs_f64())]
    DeadlineExceeded { pid: i64, elapsed: Duration },

    #[error("wait for process {pid} was cancelled")]
    Cancelled { pid: i64 },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl QgaError {
    pub(crate) fn protocol(command: &str, message: impl Into<String>) -> Self {
        QgaError::Protocol {
            command: command.to_string(),
            message: message.into(),
        }
    }
}
