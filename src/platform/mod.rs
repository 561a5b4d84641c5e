// Quick Tabs platform abstraction
// Provides platform-specific config and data paths for Windows, macOS, and Linux.
//
// Uses `cfg(target_os)` for conditional compilation to select the correct
// platform-specific implementation at compile time.

use std::path::PathBuf;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "windows")]
mod windows;

/// Directory name used under every platform root.
pub const APP_DIR_NAME: &str = "quicktabs";

/// Returns the platform-specific configuration directory.
///
/// - **Linux**: `~/.config/quicktabs` (or `$XDG_CONFIG_HOME/quicktabs`)
/// - **macOS**: `~/Library/Application Support/quicktabs`
/// - **Windows**: `%APPDATA%/quicktabs`
pub fn get_config_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        linux::get_config_dir()
    }
    #[cfg(target_os = "macos")]
    {
        macos::get_config_dir()
    }
    #[cfg(target_os = "windows")]
    {
        windows::get_config_dir()
    }
}

/// Returns the platform-specific data directory holding the SQLite store.
///
/// - **Linux**: `~/.local/share/quicktabs` (or `$XDG_DATA_HOME/quicktabs`)
/// - **macOS**: `~/Library/Application Support/quicktabs/data`
/// - **Windows**: `%LOCALAPPDATA%/quicktabs`
pub fn get_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        linux::get_data_dir()
    }
    #[cfg(target_os = "macos")]
    {
        macos::get_data_dir()
    }
    #[cfg(target_os = "windows")]
    {
        windows::get_data_dir()
    }
}
