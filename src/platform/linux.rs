// Quick Tabs platform paths for Linux
// Config: ~/.config/quicktabs
// Data:   ~/.local/share/quicktabs

use std::env;
use std::path::PathBuf;

use super::APP_DIR_NAME;

fn home() -> PathBuf {
    PathBuf::from(env::var("HOME").unwrap_or_else(|_| String::from("/tmp")))
}

/// Uses `$XDG_CONFIG_HOME/quicktabs` if set, otherwise `~/.config/quicktabs`.
pub fn get_config_dir() -> PathBuf {
    match env::var("XDG_CONFIG_HOME") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_DIR_NAME),
        _ => home().join(".config").join(APP_DIR_NAME),
    }
}

/// Uses `$XDG_DATA_HOME/quicktabs` if set, otherwise `~/.local/share/quicktabs`.
pub fn get_data_dir() -> PathBuf {
    match env::var("XDG_DATA_HOME") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_DIR_NAME),
        _ => home().join(".local").join("share").join(APP_DIR_NAME),
    }
}
