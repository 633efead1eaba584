use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::agent::Settings;
use crate::error::QgaError;
use crate::paths;
use crate::platform::PlatformKind;
use crate::transfer::MAX_CHUNK_SIZE;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub connection: ConnectionConfig,
    #[facet(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ConnectionConfig {
    #[facet(default = "qemu:///system")]
    pub uri: String,
    #[facet(default)]
    pub domain: String,
    #[facet(default = "posix")]
    pub platform: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
            domain: String::new(),
            platform: "posix".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AgentConfig {
    #[facet(default = 5)]
    pub rpc_timeout_s: u64,
    #[facet(default = 65536)]
    pub chunk_size: u64,
    /// 0 disables the deadline.
    #[facet(default)]
    pub exec_deadline_s: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_s: 5,
            chunk_size: 65536,
            exec_deadline_s: 0,
        }
    }
}

/// Values given on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub uri: Option<String>,
    pub domain: Option<String>,
    pub platform: Option<String>,
    /// Seconds; 0 disables the deadline like `agent.exec_deadline_s = 0`.
    pub exec_deadline_s: Option<u64>,
}

/// Everything needed to open a session, validated.
#[derive(Debug, Clone)]
pub struct Target {
    pub uri: String,
    pub domain: String,
    pub platform: PlatformKind,
    pub settings: Settings,
    /// Config file the values came from, if any.
    pub source: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config, QgaError> {
    let contents = std::fs::read_to_string(path).map_err(|source| QgaError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    facet_toml::from_str(&contents).map_err(|e| QgaError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load `explicit` if given, otherwise the first config found by
/// [`paths::config_candidates`], otherwise defaults.
pub fn load(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>), QgaError> {
    if let Some(path) = explicit {
        return Ok((load_config(path)?, Some(path.to_path_buf())));
    }
    for candidate in paths::config_candidates() {
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "using config file");
            let config = load_config(&candidate)?;
            return Ok((config, Some(candidate)));
        }
    }
    Ok((Config::default(), None))
}

pub fn resolve(
    config: Config,
    overrides: Overrides,
    source: Option<PathBuf>,
) -> Result<Target, QgaError> {
    let Config { connection, agent } = config;

    let uri = overrides.uri.unwrap_or(connection.uri);
    let domain = overrides.domain.unwrap_or(connection.domain);
    let platform: PlatformKind = overrides
        .platform
        .as_deref()
        .unwrap_or(&connection.platform)
        .parse()?;

    if uri.trim().is_empty() {
        return Err(QgaError::Validation {
            message: "connection uri must not be empty".into(),
        });
    }
    if domain.trim().is_empty() {
        return Err(QgaError::Validation {
            message: "domain must be set (use --domain or [connection] domain)".into(),
        });
    }
    if agent.rpc_timeout_s == 0 || agent.rpc_timeout_s > i32::MAX as u64 {
        return Err(QgaError::Validation {
            message: format!(
                "agent.rpc_timeout_s must be between 1 and {}, got {}",
                i32::MAX,
                agent.rpc_timeout_s
            ),
        });
    }
    if agent.chunk_size == 0 || agent.chunk_size > MAX_CHUNK_SIZE as u64 {
        return Err(QgaError::Validation {
            message: format!(
                "agent.chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                agent.chunk_size
            ),
        });
    }

    let settings = Settings {
        rpc_timeout: Duration::from_secs(agent.rpc_timeout_s),
        chunk_size: agent.chunk_size as usize,
        exec_deadline: deadline(overrides.exec_deadline_s.unwrap_or(agent.exec_deadline_s)),
    };

    Ok(Target {
        uri,
        domain,
        platform,
        settings,
        source,
    })
}

fn deadline(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
