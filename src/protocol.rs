//! Wire types for the QEMU guest agent JSON protocol.
//!
//! Every request is `{"execute": <name>, "arguments": {...}}` and every reply
//! is either `{"return": <value>}` or `{"error": {"class", "desc"}}`. Field
//! names on the wire are hyphenated; the Rust side uses snake_case with
//! explicit renames.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Capability;
use crate::error::QgaError;

/// A guest agent command together with the shape of its `return` value.
pub trait AgentCommand: Serialize {
    const NAME: &'static str;
    /// `guest-info` is sent without an `arguments` member.
    const HAS_ARGUMENTS: bool = true;
    type Reply: DeserializeOwned;
}

#[derive(Serialize)]
struct Request<'a, C: Serialize> {
    execute: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a C>,
}

/// Serialize a command into its request envelope.
pub fn encode<C: AgentCommand>(cmd: &C) -> Result<String, QgaError> {
    let request = Request {
        execute: C::NAME,
        arguments: C::HAS_ARGUMENTS.then_some(cmd),
    };
    serde_json::to_string(&request)
        .map_err(|e| QgaError::protocol(C::NAME, format!("failed to encode request: {e}")))
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    class: String,
    #[serde(default)]
    desc: String,
}

/// Parse a reply envelope, mapping an `error` member to [`QgaError::Agent`].
pub fn decode<C: AgentCommand>(raw: &str) -> Result<C::Reply, QgaError> {
    let mut value: Value = serde_json::from_str(raw)
        .map_err(|e| QgaError::protocol(C::NAME, format!("invalid JSON: {e}")))?;

    if let Some(err) = value.get_mut("error") {
        let body: ErrorBody = serde_json::from_value(err.take())
            .map_err(|e| QgaError::protocol(C::NAME, format!("malformed error reply: {e}")))?;
        return Err(QgaError::Agent {
            command: C::NAME.to_string(),
            message: format!("{}: {}", body.class, body.desc),
        });
    }

    let ret = value
        .get_mut("return")
        .map(Value::take)
        .ok_or_else(|| QgaError::protocol(C::NAME, "reply has neither `return` nor `error`"))?;

    serde_json::from_value(ret).map_err(|e| QgaError::protocol(C::NAME, e.to_string()))
}

// ── Commands ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct GuestInfo;

#[derive(Debug, Deserialize)]
pub struct GuestInfoReply {
    #[serde(default)]
    pub version: Option<String>,
    pub supported_commands: Vec<Capability>,
}

impl AgentCommand for GuestInfo {
    const NAME: &'static str = "guest-info";
    const HAS_ARGUMENTS: bool = false;
    type Reply = GuestInfoReply;
}

#[derive(Debug, Serialize)]
pub struct GuestExec {
    pub path: String,
    pub arg: Vec<String>,
    #[serde(rename = "capture-output")]
    pub capture_output: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExecStarted {
    pub pid: i64,
}

impl AgentCommand for GuestExec {
    const NAME: &'static str = "guest-exec";
    type Reply = ExecStarted;
}

#[derive(Debug, Serialize)]
pub struct GuestExecStatus {
    pub pid: i64,
}

/// Reply to `guest-exec-status`. `exited = false` is an ordinary
/// intermediate state; the other fields are only meaningful once it flips.
#[derive(Debug, Default, Deserialize)]
pub struct ExecStatus {
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i64>,
    #[serde(default)]
    pub signal: Option<i64>,
    #[serde(default, rename = "out-data")]
    pub out_data: Option<String>,
    #[serde(default, rename = "err-data")]
    pub err_data: Option<String>,
    #[serde(default, rename = "out-truncated")]
    pub out_truncated: bool,
    #[serde(default, rename = "err-truncated")]
    pub err_truncated: bool,
}

impl AgentCommand for GuestExecStatus {
    const NAME: &'static str = "guest-exec-status";
    type Reply = ExecStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "wb+")]
    WriteCreateTruncate,
}

#[derive(Debug, Serialize)]
pub struct GuestFileOpen {
    pub path: String,
    pub mode: FileMode,
}

impl AgentCommand for GuestFileOpen {
    const NAME: &'static str = "guest-file-open";
    type Reply = i64;
}

#[derive(Debug, Serialize)]
pub struct GuestFileWrite {
    pub handle: i64,
    #[serde(rename = "buf-b64")]
    pub buf_b64: String,
}

impl AgentCommand for GuestFileWrite {
    const NAME: &'static str = "guest-file-write";
    type Reply = IgnoredAny;
}

#[derive(Debug, Serialize)]
pub struct GuestFileRead {
    pub handle: i64,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReadChunk {
    #[serde(default, rename = "buf-b64")]
    pub buf_b64: Option<String>,
    pub eof: bool,
}

impl AgentCommand for GuestFileRead {
    const NAME: &'static str = "guest-file-read";
    type Reply = ReadChunk;
}

#[derive(Debug, Serialize)]
pub struct GuestFileClose {
    pub handle: i64,
}

impl AgentCommand for GuestFileClose {
    const NAME: &'static str = "guest-file-close";
    type Reply = IgnoredAny;
}
