//! Path utilities for configuration.

use once_cell::sync::Lazy;
use std::path::PathBuf;

/// Get the ggufchat home directory.
///
/// Uses `GGUFCHAT_HOME` environment variable if set, otherwise `~/.ggufchat`.
pub fn ggufchat_home() -> PathBuf {
    std::env::var("GGUFCHAT_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ggufchat")
        })
}

/// Global ggufchat home directory.
pub static GGUFCHAT_HOME: Lazy<PathBuf> = Lazy::new(ggufchat_home);

/// Configuration file path.
pub static CONFIG_FILE: Lazy<PathBuf> = Lazy::new(|| GGUFCHAT_HOME.join("config.toml"));
