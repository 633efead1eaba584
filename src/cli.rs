use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "qga",
    about = "Run commands and copy files through the QEMU guest agent"
)]
pub struct Cli {
    /// Path to config file (default: ./qga.toml, then ~/.config/qga/qga.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// libvirt connection URI
    #[arg(long)]
    pub uri: Option<String>,

    /// Guest domain name
    #[arg(short, long)]
    pub domain: Option<String>,

    /// Guest platform: posix, powershell or cmd
    #[arg(long)]
    pub platform: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Also write a trace-level log to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in the guest and exit with its exit code
    Exec {
        /// Stop waiting after this many seconds
        #[arg(long)]
        deadline: Option<u64>,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Upload a local file to the guest
    Put { local: PathBuf, remote: String },

    /// Download a guest file
    Get { remote: String, local: PathBuf },

    /// Show the commands the guest agent supports
    Caps,
}
