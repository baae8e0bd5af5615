//! PostgreSQL-backed device inventory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;

use convoy_core::Result;
use convoy_core::inventory::{DeviceInventory, DeviceRecord};

/// Reads the `device` table the fleet registry maintains. The engine never
/// writes it.
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Keep only string-valued labels; a device with unparseable labels simply
/// matches nothing.
fn labels_from_json(value: serde_json::Value) -> BTreeMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[async_trait]
impl DeviceInventory for PgInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let rows: Vec<(String, serde_json::Value)> =
            sqlx::query_as("SELECT id, labels FROM device ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(crate::DbError::from)?;
        Ok(rows
            .into_iter()
            .map(|(id, labels)| DeviceRecord {
                id,
                labels: labels_from_json(labels),
            })
            .collect())
    }
}
