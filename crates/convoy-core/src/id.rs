//! Deployment identifiers.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-generated opaque id of a deployment.
///
/// Backed by UUIDv7: ids embed their creation instant and sort in creation
/// order, so listings and event scans stay index-friendly. Clients only ever
/// receive one from the control surface; there is no default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    /// Mint a fresh id for a newly submitted deployment.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an id read back from storage.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The creation instant embedded in the id, when present. Useful as a
    /// coarse ordering hint without touching the store.
    pub fn created_hint(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}
