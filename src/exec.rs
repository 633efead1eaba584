use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::{AgentChannel, AgentClient};
use crate::decode::decode_payload;
use crate::error::QgaError;
use crate::platform::Platform;
use crate::protocol::{ExecStatus, GuestExec, GuestExecStatus};

pub const MIN_BACKOFF: Duration = Duration::from_micros(200);
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Delay before the next status poll: 5% of the time already spent waiting,
/// clamped to `[MIN_BACKOFF, MAX_BACKOFF]`.
pub fn backoff(elapsed: Duration) -> Duration {
    elapsed.mul_f64(0.05).clamp(MIN_BACKOFF, MAX_BACKOFF)
}

/// Flag another thread can set to stop waiting on a running command.
/// Checked between status polls only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub capture_output: bool,
    /// Give up waiting after this long. `None` waits for as long as the
    /// guest takes.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            capture_output: true,
            deadline: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

struct PollState {
    command_start: Instant,
    last_poll: Instant,
}

impl PollState {
    fn start() -> Self {
        let now = Instant::now();
        Self {
            command_start: now,
            last_poll: now,
        }
    }
}

/// Start `command` in the guest and block until it exits.
pub fn run<C: AgentChannel>(
    client: &AgentClient<C>,
    platform: &dyn Platform,
    command: &str,
    opts: &ExecOptions,
) -> Result<ExecOutput, QgaError> {
    let mut argv = platform.build_argv(command)?.into_iter();
    let Some(path) = argv.next() else {
        return Err(QgaError::InvalidCommand {
            message: "command is empty".into(),
        });
    };

    let started = client.call(&GuestExec {
        path,
        arg: argv.collect(),
        capture_output: opts.capture_output,
    })?;
    let pid = started.pid;
    tracing::debug!(pid, "guest process started");

    let status = wait(client, pid, opts)?;
    collect(platform, pid, status)
}

fn wait<C: AgentChannel>(
    client: &AgentClient<C>,
    pid: i64,
    opts: &ExecOptions,
) -> Result<ExecStatus, QgaError> {
    let request = GuestExecStatus { pid };
    let mut poll = PollState::start();

    loop {
        let status = client.call(&request)?;
        let now = Instant::now();
        let since_last = now - poll.last_poll;
        poll.last_poll = now;
        if status.exited {
            return Ok(status);
        }

        if opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(QgaError::Cancelled { pid });
        }

        let elapsed = now - poll.command_start;
        let mut sleep = backoff(elapsed);
        if let Some(deadline) = opts.deadline {
            if elapsed >= deadline {
                return Err(QgaError::DeadlineExceeded { pid, elapsed });
            }
            sleep = sleep.min(deadline - elapsed);
        }

        tracing::trace!(pid, ?elapsed, ?since_last, ?sleep, "guest process still running");
        thread::sleep(sleep);
    }
}

fn collect(platform: &dyn Platform, pid: i64, status: ExecStatus) -> Result<ExecOutput, QgaError> {
    const CMD: &str = "guest-exec-status";

    let exit_code = match (status.exitcode, status.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => {
            return Err(QgaError::protocol(
                CMD,
                format!("process {pid} exited without an exit code or signal"),
            ));
        }
    };

    if status.out_truncated {
        tracing::warn!(pid, "guest agent truncated stdout");
    }
    if status.err_truncated {
        tracing::warn!(pid, "guest agent truncated stderr");
    }

    let stdout = platform.decode_stdout(decode_payload(CMD, status.out_data.as_deref())?);
    let stderr = decode_payload(CMD, status.err_data.as_deref())?;

    tracing::debug!(
        pid,
        exit_code,
        stdout = %String::from_utf8_lossy(&stdout),
        stderr = %String::from_utf8_lossy(&stderr),
        "guest process exited"
    );

    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::DEFAULT_RPC_TIMEOUT;
    use crate::platform::{Posix, PowerShell};
    use crate::testing::FakeAgent;

    fn run_on(agent: &FakeAgent, command: &str, opts: &ExecOptions) -> Result<ExecOutput, QgaError> {
        let client = AgentClient::new(agent, DEFAULT_RPC_TIMEOUT);
        run(&client, &Posix, command, opts)
    }

    #[test]
    fn backoff_is_five_percent_of_elapsed() {
        assert_eq!(backoff(Duration::from_secs(1)), Duration::from_millis(50));
        assert_eq!(backoff(Duration::from_secs(10)), Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_clamped() {
        assert_eq!(backoff(Duration::ZERO), MIN_BACKOFF);
        assert_eq!(backoff(Duration::from_millis(2)), MIN_BACKOFF);
        assert_eq!(backoff(Duration::from_secs(20)), MAX_BACKOFF);
        assert_eq!(backoff(Duration::from_secs(3600)), MAX_BACKOFF);
    }

    #[test]
    fn backoff_never_decreases() {
        let mut prev = Duration::ZERO;
        for ms in (0..30_000).step_by(7) {
            let next = backoff(Duration::from_millis(ms));
            assert!(next >= prev, "backoff dropped at {ms}ms");
            prev = next;
        }
    }

    #[test]
    fn two_poll_command_returns_output() {
        let agent = FakeAgent::new();
        agent.script_statuses([
            json!({"exited": false}),
            json!({"exited": true, "exitcode": 0, "out-data": "aGkK"}),
        ]);

        let out = run_on(&agent, "/bin/echo hi", &ExecOptions::default()).unwrap();
        assert_eq!(
            out,
            ExecOutput {
                exit_code: 0,
                stdout: b"hi\n".to_vec(),
                stderr: Vec::new(),
            }
        );
        assert_eq!(
            agent.calls(),
            vec!["guest-exec", "guest-exec-status", "guest-exec-status"]
        );

        let exec = &agent.requests("guest-exec")[0]["arguments"];
        assert_eq!(exec["path"], "/bin/echo");
        assert_eq!(exec["arg"], json!(["hi"]));
        assert_eq!(exec["capture-output"], true);
        for status in agent.requests("guest-exec-status") {
            assert_eq!(status["arguments"]["pid"], 4242);
        }
    }

    #[test]
    fn stderr_and_exit_code_are_reported() {
        let agent = FakeAgent::new();
        agent.script_statuses([json!({
            "exited": true,
            "exitcode": 2,
            "err-data": "bm8gc3VjaCBmaWxlCg==",
        })]);

        let out = run_on(&agent, "ls /nope", &ExecOptions::default()).unwrap();
        assert_eq!(out.exit_code, 2);
        assert!(out.stdout.is_empty());
        assert_eq!(out.stderr, b"no such file\n");
    }

    #[test]
    fn killed_process_maps_signal_to_exit_code() {
        let agent = FakeAgent::new();
        agent.script_statuses([json!({"exited": true, "signal": 9})]);
        let out = run_on(&agent, "sleep 100", &ExecOptions::default()).unwrap();
        assert_eq!(out.exit_code, 137);
    }

    #[test]
    fn exit_without_code_is_a_protocol_error() {
        let agent = FakeAgent::new();
        agent.script_statuses([json!({"exited": true})]);
        let err = run_on(&agent, "true", &ExecOptions::default()).unwrap_err();
        assert!(matches!(err, QgaError::Protocol { .. }));
    }

    #[test]
    fn deadline_stops_waiting() {
        let agent = FakeAgent::new();
        let opts = ExecOptions {
            deadline: Some(Duration::ZERO),
            ..ExecOptions::default()
        };
        let err = run_on(&agent, "sleep infinity", &opts).unwrap_err();
        assert!(matches!(err, QgaError::DeadlineExceeded { pid: 4242, .. }));
    }

    #[test]
    fn short_deadline_polls_until_expired() {
        let agent = FakeAgent::new();
        let opts = ExecOptions {
            deadline: Some(Duration::from_millis(30)),
            ..ExecOptions::default()
        };
        let started = Instant::now();
        let err = run_on(&agent, "sleep infinity", &opts).unwrap_err();
        assert!(matches!(err, QgaError::DeadlineExceeded { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(agent.requests("guest-exec-status").len() > 1);
    }

    #[test]
    fn cancelled_token_stops_waiting() {
        let agent = FakeAgent::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let opts = ExecOptions {
            cancel: Some(cancel),
            ..ExecOptions::default()
        };
        let err = run_on(&agent, "sleep infinity", &opts).unwrap_err();
        assert!(matches!(err, QgaError::Cancelled { pid: 4242 }));
        assert_eq!(agent.requests("guest-exec-status").len(), 1);
    }

    #[test]
    fn status_timeout_is_surfaced() {
        let agent = FakeAgent::new();
        agent.time_out_on("guest-exec-status");
        let err = run_on(&agent, "true", &ExecOptions::default()).unwrap_err();
        assert!(matches!(err, QgaError::TransportTimeout { .. }));
    }

    #[test]
    fn invalid_command_sends_nothing() {
        let agent = FakeAgent::new();
        let err = run_on(&agent, "echo 'unterminated", &ExecOptions::default()).unwrap_err();
        assert!(matches!(err, QgaError::InvalidCommand { .. }));
        assert!(agent.calls().is_empty());
    }

    #[test]
    fn windows_status_codes_beyond_i32_are_kept() {
        let agent = FakeAgent::new();
        agent.script_statuses([json!({"exited": true, "exitcode": 3221225477u64})]);

        let client = AgentClient::new(&agent, DEFAULT_RPC_TIMEOUT);
        let out = run(&client, &PowerShell, "& .\\crash.exe", &ExecOptions::default()).unwrap();
        assert_eq!(out.exit_code, 0xC000_0005);
    }

    #[test]
    fn powershell_unwraps_clixml_on_stdout_only() {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD;

        let clixml = "#< CLIXML\r\n<Objs Version=\"1.1.0.1\"><S S=\"Error\">bad_x000D__x000A_</S></Objs>";
        let agent = FakeAgent::new();
        agent.script_statuses([json!({
            "exited": true,
            "exitcode": 1,
            "out-data": STANDARD.encode(clixml),
            "err-data": STANDARD.encode(clixml),
        })]);

        let client = AgentClient::new(&agent, DEFAULT_RPC_TIMEOUT);
        let out = run(&client, &PowerShell, "Get-Item C:\\nope", &ExecOptions::default()).unwrap();
        assert_eq!(out.stdout, b"bad\r\n");
        assert_eq!(out.stderr, clixml.as_bytes());

        let exec = &agent.requests("guest-exec")[0]["arguments"];
        assert_eq!(exec["path"], "PowerShell");
        assert_eq!(exec["arg"][4], "-EncodedCommand");
    }
}
