// Quick Tabs platform paths for Windows
// Config: %APPDATA%\quicktabs
// Data:   %LOCALAPPDATA%\quicktabs

use std::env;
use std::path::PathBuf;

use super::APP_DIR_NAME;

/// Returns `%APPDATA%\quicktabs`, falling back to the current directory.
pub fn get_config_dir() -> PathBuf {
    let appdata = env::var("APPDATA").unwrap_or_else(|_| String::from("."));
    PathBuf::from(appdata).join(APP_DIR_NAME)
}

/// Returns `%LOCALAPPDATA%\quicktabs`, falling back to `.\quicktabs-data`.
pub fn get_data_dir() -> PathBuf {
    match env::var("LOCALAPPDATA") {
        Ok(local) => PathBuf::from(local).join(APP_DIR_NAME),
        Err(_) => PathBuf::from(".").join("quicktabs-data"),
    }
}
