//! Guest OS flavours.
//!
//! A [`Platform`] decides how a command line becomes the `path` + `arg`
//! pair sent with `guest-exec`, and how captured stdout is post-processed.
//! The strategy is picked once per session from a [`PlatformKind`].

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::decode;
use crate::error::QgaError;

pub trait Platform: fmt::Debug {
    fn build_argv(&self, command: &str) -> Result<Vec<String>, QgaError>;

    fn decode_stdout(&self, stdout: Vec<u8>) -> Vec<u8> {
        stdout
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlatformKind {
    #[default]
    Posix,
    PowerShell,
    Cmd,
}

impl PlatformKind {
    pub fn strategy(self) -> Box<dyn Platform> {
        match self {
            PlatformKind::Posix => Box::new(Posix),
            // cmd hosts are driven through PowerShell just the same
            PlatformKind::PowerShell | PlatformKind::Cmd => Box::new(PowerShell),
        }
    }

    pub fn is_windows(self) -> bool {
        !matches!(self, PlatformKind::Posix)
    }
}

impl FromStr for PlatformKind {
    type Err = QgaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posix" | "sh" | "/bin/sh" => Ok(PlatformKind::Posix),
            "powershell" => Ok(PlatformKind::PowerShell),
            "cmd" => Ok(PlatformKind::Cmd),
            other => Err(QgaError::Validation {
                message: format!("unknown platform '{other}' (use posix, powershell or cmd)"),
            }),
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlatformKind::Posix => "posix",
            PlatformKind::PowerShell => "powershell",
            PlatformKind::Cmd => "cmd",
        })
    }
}

/// Shell-word splitting, quotes and backslash escapes respected.
#[derive(Debug, Clone, Copy)]
pub struct Posix;

impl Platform for Posix {
    fn build_argv(&self, command: &str) -> Result<Vec<String>, QgaError> {
        let argv = shell_words::split(command).map_err(|e| QgaError::InvalidCommand {
            message: format!("{e}: {command}"),
        })?;
        if argv.is_empty() {
            return Err(QgaError::InvalidCommand {
                message: "command is empty".into(),
            });
        }
        Ok(argv)
    }
}

const POWERSHELL_ARGS: [&str; 5] = [
    "PowerShell",
    "-NoProfile",
    "-NonInteractive",
    "-ExecutionPolicy",
    "Unrestricted",
];

/// Runs the command text as an `-EncodedCommand` script and unwraps CLIXML
/// from stdout.
#[derive(Debug, Clone, Copy)]
pub struct PowerShell;

impl PowerShell {
    /// UTF-16LE + base64 of the script with lines trimmed and blanks dropped.
    pub fn encode_script(script: &str) -> String {
        let script = script
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
        STANDARD.encode(utf16)
    }
}

impl Platform for PowerShell {
    fn build_argv(&self, command: &str) -> Result<Vec<String>, QgaError> {
        let mut argv: Vec<String> = POWERSHELL_ARGS.iter().map(|s| s.to_string()).collect();
        if command == "-" {
            argv.extend(["-Command".to_string(), "-".to_string()]);
        } else {
            argv.extend(["-EncodedCommand".to_string(), Self::encode_script(command)]);
        }
        Ok(argv)
    }

    fn decode_stdout(&self, stdout: Vec<u8>) -> Vec<u8> {
        decode::unwrap_clixml(stdout)
    }
}
