//! Project directory and activity log collaborators.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use kwgroup_core::{new_v7, ActivityLog, Error, ProjectDirectory, Result};

/// Projects table access.
pub struct PgProjectDirectory {
    pool: Pool<Postgres>,
}

impl PgProjectDirectory {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Create a project and return its id.
    pub async fn create(&self, name: &str) -> Result<Uuid> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("project name is required".to_string()));
        }
        let id = new_v7();
        sqlx::query("INSERT INTO projects (id, name) VALUES ($1, $2)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        info!(subsystem = "projects", project_id = %id, name, "Project created");
        Ok(id)
    }

    /// Delete a project; jobs, leases, keywords and merges cascade.
    pub async fn delete(&self, project_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn name(&self, project_id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query("SELECT name FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(|r| r.get("name")))
    }
}

#[async_trait]
impl ProjectDirectory for PgProjectDirectory {
    async fn exists(&self, project_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM projects WHERE id = $1)")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(exists)
    }
}

/// Activity log that writes audit entries as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn log(
        &self,
        project_id: Uuid,
        action: &str,
        details: serde_json::Value,
        user: Option<&str>,
    ) {
        info!(
            subsystem = "activity",
            project_id = %project_id,
            action,
            user = user.unwrap_or("system"),
            details = %details,
            "Activity"
        );
    }
}
