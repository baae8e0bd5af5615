//! Deployment manifest parsing and validation.
//!
//! Manifests arrive as YAML or JSON. [`parse`] tries YAML first, then JSON;
//! [`validate`] enforces the schema rules and fills defaults in place.
//! Neither is ever retried by the engine: a bad manifest is a client error.

pub mod error;
pub mod validate;

pub use error::{ManifestError, ManifestResult};
pub use validate::validate;

use convoy_core::manifest::Manifest;

/// Parse a manifest from raw bytes. Unknown fields are tolerated; missing
/// required fields fail.
pub fn parse(bytes: &[u8]) -> ManifestResult<Manifest> {
    let yaml_err = match serde_yaml::from_slice::<Manifest>(bytes) {
        Ok(manifest) => return Ok(manifest),
        Err(e) => e,
    };
    match serde_json::from_slice::<Manifest>(bytes) {
        Ok(manifest) => Ok(manifest),
        Err(json_err) => Err(ManifestError::Parse {
            yaml: yaml_err.to_string(),
            json: json_err.to_string(),
        }),
    }
}

/// Parse and validate in one step; the returned manifest has defaults filled.
pub fn parse_and_validate(bytes: &[u8]) -> ManifestResult<Manifest> {
    let mut manifest = parse(bytes)?;
    validate(&mut manifest)?;
    Ok(manifest)
}
