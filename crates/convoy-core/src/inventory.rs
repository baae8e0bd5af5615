//! Read-only access to the device inventory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A registered device as the engine sees it: an opaque id plus labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Read-only device inventory provider. Registration and heartbeat live in
/// the fleet registry; the engine only resolves selectors against it.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Convenience lookup for exact label equality.
    async fn list_by_labels(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let devices = self.list_devices().await?;
        let mut ids: Vec<String> = devices
            .into_iter()
            .filter(|d| labels.iter().all(|(k, v)| d.labels.get(k) == Some(v)))
            .map(|d| d.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
