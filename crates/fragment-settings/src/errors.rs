use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Syntax {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The merged document does not fit the settings schema, e.g. a
    /// string where a port number belongs.
    #[error("invalid settings: {0}")]
    Shape(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
