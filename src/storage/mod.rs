//! Persistent storage
//!
//! Locates the application data directory and stores user settings in it.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\localgen\localgen\data`
/// - macOS: `/Users/{user}/Library/Application Support/org.localgen.localgen`
/// - Linux: `/home/{user}/.local/share/localgen`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("org", "localgen", "localgen")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Creates the data directory and its default `models/` subdirectory
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(data_dir.join("models"))?;

    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_names_the_app() {
        // Sandboxes without a home directory have no data dir at all
        if let Ok(path) = get_data_dir() {
            assert!(path.to_string_lossy().contains("localgen"));
        }
    }
}
