use std::io::Write;

use clap::Parser;

use qga::agent::GuestAgent;
use qga::capability;
use qga::cli::{Cli, Command};
use qga::client::AgentClient;
use qga::config::{self, Overrides};
use qga::error::QgaError;
use qga::exec::ExecOptions;
use qga::logging;
use qga::platform::PlatformKind;
use qga::session::AgentSession;

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose, cli.log_file.as_deref())?;

    let exec_deadline_s = match &cli.command {
        Command::Exec { deadline, .. } => *deadline,
        _ => None,
    };
    let (file_config, source) = config::load(cli.config.as_deref())?;
    let target = config::resolve(
        file_config,
        Overrides {
            uri: cli.uri,
            domain: cli.domain,
            platform: cli.platform,
            exec_deadline_s,
        },
        source,
    )?;

    let _span = tracing::info_span!("qga", domain = %target.domain).entered();
    match &target.source {
        Some(path) => tracing::debug!(path = %path.display(), uri = %target.uri, "config resolved"),
        None => tracing::debug!(uri = %target.uri, "no config file, using defaults"),
    }

    match cli.command {
        Command::Caps => {
            let session = AgentSession::connect(&target.uri, &target.domain)?;
            let client = AgentClient::new(session, target.settings.rpc_timeout);
            let caps = capability::query(&client)?;

            let version = caps.version().unwrap_or("unknown version");
            println!("guest agent {version} on '{}'", target.domain);
            for cap in caps.reported() {
                let state = if cap.enabled { "enabled" } else { "disabled" };
                println!("  {:<32} {state}", cap.name);
            }
            let missing = caps.missing_required();
            if missing.is_empty() {
                println!("all required commands available");
            } else {
                println!("missing required: {}", missing.join(", "));
            }
        }
        Command::Exec { command, .. } => {
            let mut agent = GuestAgent::connect(
                &target.uri,
                &target.domain,
                target.platform,
                target.settings,
            )?;
            let opts = ExecOptions {
                deadline: target.settings.exec_deadline,
                ..ExecOptions::default()
            };
            let line = command_line(target.platform, &command);
            let out = agent.exec_with(&line, &opts)?;
            drop(agent);

            write_stream(std::io::stdout(), &out.stdout, "stdout")?;
            write_stream(std::io::stderr(), &out.stderr, "stderr")?;
            // Windows status codes such as 0xC0000005 wrap to the same bits.
            std::process::exit(out.exit_code as i32);
        }
        Command::Put { local, remote } => {
            let mut agent = GuestAgent::connect(
                &target.uri,
                &target.domain,
                target.platform,
                target.settings,
            )?;
            let bytes = agent.put(&local, &remote)?;
            println!("{} -> :{remote} ({bytes} bytes)", local.display());
        }
        Command::Get { remote, local } => {
            let mut agent = GuestAgent::connect(
                &target.uri,
                &target.domain,
                target.platform,
                target.settings,
            )?;
            let bytes = agent.get(&remote, &local)?;
            println!(":{remote} -> {} ({bytes} bytes)", local.display());
        }
    }

    Ok(())
}

/// A single argument is taken verbatim; several are re-quoted for POSIX
/// guests so the guest-side split gives the same words back.
fn command_line(platform: PlatformKind, args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ if platform.is_windows() => args.join(" "),
        _ => shell_words::join(args),
    }
}

fn write_stream(mut w: impl Write, data: &[u8], name: &str) -> Result<(), QgaError> {
    w.write_all(data)
        .and_then(|()| w.flush())
        .map_err(|e| QgaError::Io {
            context: format!("writing guest {name}"),
            source: e,
        })
}
