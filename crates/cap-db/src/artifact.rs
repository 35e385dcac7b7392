// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact repository: metadata rows for objects sitting in object
//! storage, plus the retention sweep query.

use crate::DbError;
use cap_core::Artifact;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct ArtifactRow {
    id: Uuid,
    job_id: Uuid,
    tenant_id: Uuid,
    storage_key: String,
    content_type: String,
    byte_size: i64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            id: row.id,
            job_id: row.job_id,
            tenant_id: row.tenant_id,
            storage_key: row.storage_key,
            content_type: row.content_type,
            byte_size: row.byte_size as u64,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// Repository for the `artifacts` table.
pub struct ArtifactRepository {
    pool: PgPool,
}

impl ArtifactRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record metadata for an object already written to the store.
    pub async fn create(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        storage_key: &str,
        content_type: &str,
        byte_size: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<Artifact, DbError> {
        let row: ArtifactRow = sqlx::query_as(
            "INSERT INTO artifacts (job_id, tenant_id, storage_key, content_type, byte_size, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(storage_key)
        .bind(content_type)
        .bind(byte_size as i64)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Fetch an artifact, scoped to its owning tenant.
    pub async fn get_owned(
        &self,
        artifact_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Option<Artifact>, DbError> {
        let row: Option<ArtifactRow> =
            sqlx::query_as("SELECT * FROM artifacts WHERE id = $1 AND tenant_id = $2")
                .bind(artifact_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    /// Fetch the artifact produced by a given job, scoped to its owning
    /// tenant.
    pub async fn get_by_job(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Option<Artifact>, DbError> {
        let row: Option<ArtifactRow> =
            sqlx::query_as("SELECT * FROM artifacts WHERE job_id = $1 AND tenant_id = $2")
                .bind(job_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    /// List artifacts whose `expires_at` has passed, for the retention
    /// sweep to delete from object storage and from this table.
    pub async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Artifact>, DbError> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            "SELECT * FROM artifacts WHERE expires_at <= $1 ORDER BY expires_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Delete an artifact's metadata row after its object has been removed
    /// from storage.
    pub async fn delete(&self, artifact_id: Uuid) -> Result<(), DbError> {
        sqlx::query("DELETE FROM artifacts WHERE id = $1")
            .bind(artifact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
