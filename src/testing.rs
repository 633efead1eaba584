//! In-memory guest agent used by unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::capability::{Capability, REQUIRED_COMMANDS};
use crate::client::AgentChannel;
use crate::error::QgaError;

struct OpenFile {
    path: String,
    pos: usize,
}

struct State {
    capabilities: Vec<Capability>,
    files: HashMap<String, Vec<u8>>,
    handles: HashMap<i64, OpenFile>,
    closed: Vec<i64>,
    next_handle: i64,
    next_pid: i64,
    statuses: VecDeque<Value>,
    timeouts: HashSet<String>,
    fail_write_at: Option<usize>,
    writes: usize,
    requests: Vec<(String, Value)>,
}

/// Fake guest agent: answers every command the crate sends, keeps guest
/// files in memory and records each request for later inspection.
pub struct FakeAgent {
    state: RefCell<State>,
}

impl FakeAgent {
    pub fn new() -> Self {
        let capabilities = REQUIRED_COMMANDS
            .iter()
            .map(|name| Capability::enabled(name))
            .collect();
        Self {
            state: RefCell::new(State {
                capabilities,
                files: HashMap::new(),
                handles: HashMap::new(),
                closed: Vec::new(),
                next_handle: 1000,
                next_pid: 4242,
                statuses: VecDeque::new(),
                timeouts: HashSet::new(),
                fail_write_at: None,
                writes: 0,
                requests: Vec::new(),
            }),
        }
    }

    pub fn with_capabilities(capabilities: Vec<Capability>) -> Self {
        let agent = Self::new();
        agent.state.borrow_mut().capabilities = capabilities;
        agent
    }

    /// Queue `guest-exec-status` replies. Once drained the process is
    /// reported as still running.
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = Value>) {
        self.state.borrow_mut().statuses.extend(statuses);
    }

    pub fn time_out_on(&self, command: &str) {
        self.state.borrow_mut().timeouts.insert(command.to_string());
    }

    /// Make the `n`th `guest-file-write` (1-based) return an agent error.
    pub fn fail_write_at(&self, n: usize) {
        self.state.borrow_mut().fail_write_at = Some(n);
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.state
            .borrow_mut()
            .files
            .insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.borrow().files.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .borrow()
            .requests
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn requests(&self, command: &str) -> Vec<Value> {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|(name, _)| name == command)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Decoded payload sizes of every `guest-file-write`, in order.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.requests("guest-file-write")
            .iter()
            .map(|r| {
                let b64 = r["arguments"]["buf-b64"].as_str().unwrap_or_default();
                STANDARD.decode(b64).map(|b| b.len()).unwrap_or(0)
            })
            .collect()
    }

    pub fn open_handles(&self) -> usize {
        self.state.borrow().handles.len()
    }

    pub fn closed_handles(&self) -> Vec<i64> {
        self.state.borrow().closed.clone()
    }

    fn dispatch(state: &mut State, name: &str, args: &Value) -> Value {
        match name {
            "guest-info" => json!({
                "return": {"version": "8.2.0", "supported_commands": state.capabilities}
            }),
            "guest-exec" => {
                let pid = state.next_pid;
                state.next_pid += 1;
                json!({"return": {"pid": pid}})
            }
            "guest-exec-status" => {
                let status = state
                    .statuses
                    .pop_front()
                    .unwrap_or_else(|| json!({"exited": false}));
                json!({"return": status})
            }
            "guest-file-open" => {
                let path = args["path"].as_str().unwrap_or_default().to_string();
                match args["mode"].as_str() {
                    Some("r") if !state.files.contains_key(&path) => {
                        agent_error("No such file or directory")
                    }
                    Some("r") => Self::open(state, path),
                    Some("wb+") => {
                        state.files.insert(path.clone(), Vec::new());
                        Self::open(state, path)
                    }
                    _ => agent_error("unsupported mode"),
                }
            }
            "guest-file-write" => {
                state.writes += 1;
                if state.fail_write_at == Some(state.writes) {
                    return agent_error("No space left on device");
                }
                let handle = args["handle"].as_i64().unwrap_or_default();
                let Some(open) = state.handles.get(&handle) else {
                    return agent_error("invalid handle");
                };
                let data = STANDARD
                    .decode(args["buf-b64"].as_str().unwrap_or_default())
                    .unwrap_or_default();
                let count = data.len();
                if let Some(file) = state.files.get_mut(&open.path) {
                    file.extend_from_slice(&data);
                }
                json!({"return": {"count": count, "eof": false}})
            }
            "guest-file-read" => {
                let handle = args["handle"].as_i64().unwrap_or_default();
                let count = args["count"].as_u64().unwrap_or_default() as usize;
                let Some(open) = state.handles.get_mut(&handle) else {
                    return agent_error("invalid handle");
                };
                let file = state.files.get(&open.path).cloned().unwrap_or_default();
                let end = (open.pos + count).min(file.len());
                let chunk = &file[open.pos..end];
                open.pos = end;
                json!({"return": {
                    "count": chunk.len(),
                    "buf-b64": STANDARD.encode(chunk),
                    "eof": chunk.len() < count,
                }})
            }
            "guest-file-close" => {
                let handle = args["handle"].as_i64().unwrap_or_default();
                if state.handles.remove(&handle).is_none() {
                    return agent_error("invalid handle");
                }
                state.closed.push(handle);
                json!({"return": {}})
            }
            _ => json!({"error": {"class": "CommandNotFound", "desc": name}}),
        }
    }

    fn open(state: &mut State, path: String) -> Value {
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, OpenFile { path, pos: 0 });
        json!({"return": handle})
    }
}

fn agent_error(desc: &str) -> Value {
    json!({"error": {"class": "GenericError", "desc": desc}})
}

impl AgentChannel for FakeAgent {
    fn command(&self, name: &str, request: &str, timeout: Duration) -> Result<String, QgaError> {
        let req: Value = serde_json::from_str(request).expect("request is valid JSON");
        let mut state = self.state.borrow_mut();
        state.requests.push((name.to_string(), req.clone()));
        if state.timeouts.contains(name) {
            return Err(QgaError::TransportTimeout {
                command: name.to_string(),
                timeout,
            });
        }
        Ok(Self::dispatch(&mut state, name, &req["arguments"]).to_string())
    }
}
