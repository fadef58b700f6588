use crate::error::CatalogError;
use crate::models::{OwnerUser, ProfileKind, SensorSnapshot};
use async_trait::async_trait;
use sqlx::PgPool;

/// Read-only view of the CRUD database.
#[async_trait]
pub trait RelationalCatalog: Send + Sync {
    /// Sensors attached to the task named after `profile`, ordered by id.
    async fn sensors_for_profile(
        &self,
        profile: ProfileKind,
    ) -> Result<Vec<SensorSnapshot>, CatalogError>;

    /// Owner reached through sensor -> workspace -> user; `None` when any hop is missing.
    async fn user_for_sensor(&self, sensor_id: i32) -> Result<Option<OwnerUser>, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    db: PgPool,
}

impl PgCatalog {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RelationalCatalog for PgCatalog {
    async fn sensors_for_profile(
        &self,
        profile: ProfileKind,
    ) -> Result<Vec<SensorSnapshot>, CatalogError> {
        let rows: Vec<SensorSnapshot> = sqlx::query_as(
            r#"
            SELECT DISTINCT
                s.id,
                s.name,
                s.source_id AS source_address,
                s.workspace_id
            FROM sensors s
            JOIN sensor_task st ON st.sensor_id = s.id
            JOIN tasks t ON t.id = st.task_id
            WHERE t.name = $1
            ORDER BY s.id
            "#,
        )
        .bind(profile.as_str())
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn user_for_sensor(&self, sensor_id: i32) -> Result<Option<OwnerUser>, CatalogError> {
        let row: Option<OwnerUser> = sqlx::query_as(
            r#"
            SELECT u.id, u.username, u.email
            FROM sensors s
            JOIN workspaces w ON w.id = s.workspace_id
            JOIN users u ON u.id = w.user_id
            WHERE s.id = $1
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }
}
