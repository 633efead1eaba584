use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::QgaError;

/// Install the global subscriber. Only the binary calls this; the library
/// itself just emits events.
///
/// Terminal output goes to stderr so stdout stays byte-exact guest output.
/// `-v` forces `qga=debug`; otherwise `RUST_LOG` applies, falling back to
/// warnings only. A log file, when given, always records at trace level.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<(), QgaError> {
    let terminal_filter = if verbose {
        EnvFilter::new("qga=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qga=warn"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| QgaError::Io {
                    context: format!("creating log directory {}", parent.display()),
                    source: e,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| QgaError::Io {
                    context: format!("opening log file {}", path.display()),
                    source: e,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new("qga=trace")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();
    Ok(())
}
