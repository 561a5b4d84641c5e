// Quick Tabs platform paths for macOS
// Config: ~/Library/Application Support/quicktabs
// Data:   ~/Library/Application Support/quicktabs/data

use std::env;
use std::path::PathBuf;

use super::APP_DIR_NAME;

fn app_support() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| String::from("/tmp"));
    PathBuf::from(home).join("Library").join("Application Support").join(APP_DIR_NAME)
}

pub fn get_config_dir() -> PathBuf {
    app_support()
}

pub fn get_data_dir() -> PathBuf {
    app_support().join("data")
}
