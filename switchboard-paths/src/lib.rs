//! XDG Base Directory paths for switchboard.
//!
//! The CLI resolves every on-disk location through this crate so that
//! provider records, conversation transcripts and catalog caches land in the
//! same places on every platform, the way gh, docker and kubectl do it.

use std::path::PathBuf;

const APP_DIR: &str = "switchboard";

fn xdg_dir(env_var: &str, home_fallback: &str) -> PathBuf {
    if let Ok(dir) = std::env::var(env_var)
        && !dir.is_empty()
    {
        PathBuf::from(dir).join(APP_DIR)
    } else if let Some(home) = dirs::home_dir() {
        home.join(home_fallback).join(APP_DIR)
    } else {
        PathBuf::from(home_fallback).join(APP_DIR)
    }
}

/// Get the switchboard config directory.
///
/// Returns `$XDG_CONFIG_HOME/switchboard` if set, otherwise
/// `~/.config/switchboard`. Holds `config.toml` and `providers.toml`.
///
/// # Examples
///
/// ```
/// use switchboard_paths::config_dir;
///
/// let providers = config_dir().join("providers.toml");
/// ```
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

/// Get the switchboard data directory.
///
/// Returns `$XDG_DATA_HOME/switchboard` if set, otherwise
/// `~/.local/share/switchboard`. Holds favorites, quota counters and
/// conversation transcripts.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// Get the switchboard cache directory.
///
/// Returns `$XDG_CACHE_HOME/switchboard` if set, otherwise
/// `~/.cache/switchboard`. Holds the last-known-good model catalogs.
pub fn cache_dir() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache")
}
