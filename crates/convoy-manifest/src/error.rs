//! Manifest parsing and validation errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is neither valid YAML ({yaml}) nor valid JSON ({json})")]
    Parse { yaml: String, json: String },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),
}

impl From<ManifestError> for convoy_core::Error {
    fn from(err: ManifestError) -> Self {
        convoy_core::Error::InvalidManifest(err.to_string())
    }
}

pub type ManifestResult<T> = std::result::Result<T, ManifestError>;
