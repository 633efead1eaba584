use std::path::PathBuf;

pub const CONFIG_FILE: &str = "qga.toml";

/// User config file: `~/.config/qga/qga.toml`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("qga").join(CONFIG_FILE))
}

/// Config files tried in order when none is given: `./qga.toml`, then the
/// user config.
pub fn config_candidates() -> Vec<PathBuf> {
    std::iter::once(PathBuf::from(CONFIG_FILE))
        .chain(user_config_path())
        .collect()
}
