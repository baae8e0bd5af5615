//! PostgreSQL implementation of the deployment store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use convoy_core::deployment::{
    AssignmentStatus, Deployment, DeploymentEvent, DeploymentProgress, DeploymentStatus,
    DeviceAssignment, EventType,
};
use convoy_core::store::{DeploymentStore, ListFilter};
use convoy_core::{DeploymentId, Error, Result};

use crate::DbError;

/// PostgreSQL-backed deployment store. Creation commits the deployment row
/// and its assignment rows in one transaction; per-row updates rely on the
/// database's isolation and are last-write-wins.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: uuid::Uuid,
    name: String,
    namespace: String,
    manifest: serde_json::Value,
    strategy: serde_json::Value,
    selector: serde_json::Value,
    status: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = Error;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        Ok(Deployment {
            id: DeploymentId::from_uuid(row.id),
            name: row.name,
            namespace: row.namespace,
            manifest: serde_json::from_value(row.manifest)
                .map_err(|e| Error::Internal(format!("corrupt manifest column: {}", e)))?,
            strategy: serde_json::from_value(row.strategy)
                .map_err(|e| Error::Internal(format!("corrupt strategy column: {}", e)))?,
            selector: serde_json::from_value(row.selector)
                .map_err(|e| Error::Internal(format!("corrupt selector column: {}", e)))?,
            status: row
                .status
                .parse::<DeploymentStatus>()
                .map_err(Error::Internal)?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    deployment_id: uuid::Uuid,
    device_id: String,
    status: String,
    progress: i32,
    message: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AssignmentRow> for DeviceAssignment {
    type Error = Error;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        Ok(DeviceAssignment {
            deployment_id: DeploymentId::from_uuid(row.deployment_id),
            device_id: row.device_id,
            status: row
                .status
                .parse::<AssignmentStatus>()
                .map_err(Error::Internal)?,
            progress: row.progress,
            message: row.message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    deployment_id: uuid::Uuid,
    device_id: Option<String>,
    event_type: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for DeploymentEvent {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(DeploymentEvent {
            seq: row.seq,
            deployment_id: DeploymentId::from_uuid(row.deployment_id),
            device_id: row.device_id,
            event_type: row.event_type.parse::<EventType>().map_err(Error::Internal)?,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

fn db_err(e: sqlx::Error) -> Error {
    DbError::from(e).into()
}

/// A unique violation on the deployment row means the id is already taken.
fn insert_err(id: DeploymentId, e: sqlx::Error) -> Error {
    if e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
    {
        DbError::Duplicate(format!("deployment {}", id)).into()
    } else {
        db_err(e)
    }
}

fn json_err(e: serde_json::Error) -> Error {
    Error::Internal(format!("serialization error: {}", e))
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn create_deployment(&self, deployment: &Deployment, devices: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO deployment
                (id, name, namespace, manifest, strategy, selector, status,
                 created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(deployment.id.as_uuid())
        .bind(&deployment.name)
        .bind(&deployment.namespace)
        .bind(serde_json::to_value(&deployment.manifest).map_err(json_err)?)
        .bind(serde_json::to_value(&deployment.strategy).map_err(json_err)?)
        .bind(serde_json::to_value(&deployment.selector).map_err(json_err)?)
        .bind(deployment.status.to_string())
        .bind(&deployment.created_by)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_err(deployment.id, e))?;

        for device_id in devices {
            sqlx::query(
                r#"
                INSERT INTO device_deployment (deployment_id, device_id, status, progress, message)
                VALUES ($1, $2, 'pending', 0, '')
                "#,
            )
            .bind(deployment.id.as_uuid())
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployment WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| DbError::NotFound(format!("deployment {}", id)))?;
        row.try_into()
    }

    async fn list_deployments(
        &self,
        filter: &ListFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(
            r#"
            SELECT * FROM deployment
            WHERE ($1::text IS NULL OR namespace = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.namespace.as_deref())
        .bind(filter.status.map(|s| s.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Deployment::try_from).collect()
    }

    async fn update_status(&self, id: DeploymentId, status: DeploymentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE deployment SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("deployment {}", id)).into());
        }
        Ok(())
    }

    async fn list_target_devices(&self, id: DeploymentId) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT device_id FROM device_deployment WHERE deployment_id = $1 ORDER BY device_id",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(device_id,)| device_id).collect())
    }

    async fn update_assignment(
        &self,
        id: DeploymentId,
        device_id: &str,
        status: AssignmentStatus,
        progress: i32,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE device_deployment
            SET status = $3,
                progress = $4,
                message = $5,
                started_at = COALESCE(started_at, CASE WHEN $3 <> 'pending' THEN NOW() END),
                completed_at = COALESCE(completed_at,
                                        CASE WHEN $3 IN ('succeeded', 'failed') THEN NOW() END)
            WHERE deployment_id = $1 AND device_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(device_id)
        .bind(status.to_string())
        .bind(progress)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_assignments(&self, id: DeploymentId) -> Result<Vec<DeviceAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "SELECT * FROM device_deployment WHERE deployment_id = $1 ORDER BY device_id",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(DeviceAssignment::try_from).collect()
    }

    async fn aggregate_progress(&self, id: DeploymentId) -> Result<DeploymentProgress> {
        let (total, pending, running, succeeded, failed): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COUNT(*) FILTER (WHERE status = 'pending'),
                       COUNT(*) FILTER (WHERE status = 'running'),
                       COUNT(*) FILTER (WHERE status = 'succeeded'),
                       COUNT(*) FILTER (WHERE status = 'failed')
                FROM device_deployment
                WHERE deployment_id = $1
                "#,
            )
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(DeploymentProgress::from_counts(
            total, pending, running, succeeded, failed,
        ))
    }

    async fn append_event(
        &self,
        id: DeploymentId,
        device_id: Option<&str>,
        event_type: EventType,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_event (deployment_id, device_id, event_type, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(device_id)
        .bind(event_type.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn events_after(
        &self,
        id: DeploymentId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM deployment_event
            WHERE deployment_id = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(DeploymentEvent::try_from).collect()
    }
}
