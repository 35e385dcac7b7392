// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job repository: the durable `Pending -> Processing -> {Completed,
//! Failed}` state machine, with every lookup scoped by tenant.

use crate::{DbError, job_status_str, parse_job_kind, parse_job_status, parse_source_kind};
use cap_core::{Job, JobKind, JobStatus, SourceKind};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: Uuid,
    kind: String,
    status: String,
    source_kind: String,
    source_url: Option<String>,
    format: String,
    options: serde_json::Value,
    storage_key: Option<String>,
    download_url: Option<String>,
    file_size: Option<i64>,
    page_count: Option<i32>,
    error: Option<String>,
    url_hash: Option<String>,
    url_domain: Option<String>,
    webhook_url: Option<String>,
    credits_charged: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            tenant_id: row.tenant_id,
            kind: parse_job_kind(&row.kind)?,
            status: parse_job_status(&row.status)?,
            source_kind: parse_source_kind(&row.source_kind)?,
            source_url: row.source_url,
            format: row.format,
            options: row.options,
            storage_key: row.storage_key,
            download_url: row.download_url,
            file_size: row.file_size,
            page_count: row.page_count,
            error: row.error,
            url_hash: row.url_hash,
            url_domain: row.url_domain,
            webhook_url: row.webhook_url,
            credits_charged: row.credits_charged,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
        })
    }
}

fn job_kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Screenshot => "screenshot",
        JobKind::Pdf => "pdf",
    }
}

fn source_kind_str(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Url => "url",
        SourceKind::Html => "html",
    }
}

/// Fields needed to create a new job, already validated and privacy-filtered
/// by the caller (`cap-validate` + the repository-boundary strip function —
/// there is no `html`/`headers`/`cookies` field here to strip).
pub struct NewJob {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Screenshot or PDF.
    pub kind: JobKind,
    /// Whether the source was a URL or inline HTML.
    pub source_kind: SourceKind,
    /// The source URL, when `source_kind == Url`.
    pub source_url: Option<String>,
    /// Output format.
    pub format: String,
    /// Validated render options.
    pub options: serde_json::Value,
    /// Digest of the source URL, for dedup analytics.
    pub url_hash: Option<String>,
    /// Registrable domain of the source URL.
    pub url_domain: Option<String>,
    /// Caller-supplied completion webhook.
    pub webhook_url: Option<String>,
    /// Retention horizon for this job.
    pub expires_at: DateTime<Utc>,
}

/// Sort order for [`JobRepository::list_for_tenant`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobSortBy {
    /// Sort by creation time.
    CreatedAt,
    /// Sort by completion time.
    CompletedAt,
}

/// Repository for the `jobs` table.
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new job in the `Pending` state.
    pub async fn create(&self, fields: NewJob) -> Result<Job, DbError> {
        let row: JobRow = sqlx::query_as(
            "INSERT INTO jobs \
             (tenant_id, kind, status, source_kind, source_url, format, options, \
              url_hash, url_domain, webhook_url, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
        )
        .bind(fields.tenant_id)
        .bind(job_kind_str(fields.kind))
        .bind(job_status_str(JobStatus::Pending))
        .bind(source_kind_str(fields.source_kind))
        .bind(fields.source_url)
        .bind(fields.format)
        .bind(fields.options)
        .bind(fields.url_hash)
        .bind(fields.url_domain)
        .bind(fields.webhook_url)
        .bind(fields.expires_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// Fetch a job, scoped to its owning tenant. Returns `None` if the job
    /// doesn't exist *or* belongs to a different tenant — the two cases
    /// must be indistinguishable to the caller (BOLA prevention).
    pub async fn get_owned(&self, job_id: Uuid, tenant_id: Uuid) -> Result<Option<Job>, DbError> {
        let row: Option<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE id = $1 AND tenant_id = $2")
                .bind(job_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// List jobs for a tenant, paginated, optionally filtered by status/kind
    /// and sorted. Returns `(rows, total)`; the count query runs in the same
    /// transaction as the page query so the total can't drift between them.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_for_tenant(
        &self,
        tenant_id: Uuid,
        status: Option<JobStatus>,
        kind: Option<JobKind>,
        sort_by: JobSortBy,
        ascending: bool,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), DbError> {
        let sort_col = match sort_by {
            JobSortBy::CreatedAt => "created_at",
            JobSortBy::CompletedAt => "completed_at",
        };
        let direction = if ascending { "ASC" } else { "DESC" };
        let status_str = status.map(job_status_str);
        let kind_str = kind.map(job_kind_str);

        let mut tx = self.pool.begin().await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE tenant_id = $1 \
             AND ($2::text IS NULL OR status = $2) \
             AND ($3::text IS NULL OR kind = $3)",
        )
        .bind(tenant_id)
        .bind(&status_str)
        .bind(&kind_str)
        .fetch_one(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT * FROM jobs WHERE tenant_id = $1 \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::text IS NULL OR kind = $3) \
             ORDER BY {sort_col} {direction} NULLS LAST \
             LIMIT $4 OFFSET $5"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(&status_str)
            .bind(&kind_str)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        let jobs = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total.0))
    }

    /// Move a job from `Pending` to `Processing`.
    pub async fn mark_processing(&self, job_id: Uuid) -> Result<Job, DbError> {
        self.transition(job_id, JobStatus::Processing).await
    }

    /// Move a job to `Completed`, recording the artifact location and size.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_completed(
        &self,
        job_id: Uuid,
        storage_key: &str,
        download_url: &str,
        file_size: i64,
        page_count: Option<i32>,
        credits_charged: i64,
    ) -> Result<Job, DbError> {
        let mut tx = self.pool.begin().await?;
        let current = self.load_for_update(&mut tx, job_id).await?;
        if !current.status.can_transition_to(JobStatus::Completed) {
            return Err(DbError::InvalidTransition {
                from: current.status,
                to: JobStatus::Completed,
            });
        }
        let row: JobRow = sqlx::query_as(
            "UPDATE jobs SET status = $1, storage_key = $2, download_url = $3, file_size = $4, \
             page_count = $5, credits_charged = $6, updated_at = now(), completed_at = now() \
             WHERE id = $7 RETURNING *",
        )
        .bind(job_status_str(JobStatus::Completed))
        .bind(storage_key)
        .bind(download_url)
        .bind(file_size)
        .bind(page_count)
        .bind(credits_charged)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    /// Move a job to `Failed`, recording the error message (already
    /// truncated by the caller to a safe length — raw stack traces are not
    /// stored).
    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<Job, DbError> {
        let mut tx = self.pool.begin().await?;
        let current = self.load_for_update(&mut tx, job_id).await?;
        if !current.status.can_transition_to(JobStatus::Failed) {
            return Err(DbError::InvalidTransition {
                from: current.status,
                to: JobStatus::Failed,
            });
        }
        let row: JobRow = sqlx::query_as(
            "UPDATE jobs SET status = $1, error = $2, updated_at = now(), completed_at = now() \
             WHERE id = $3 RETURNING *",
        )
        .bind(job_status_str(JobStatus::Failed))
        .bind(error)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    /// Delete a job, scoped to its owning tenant. Returns `false` if no
    /// matching job exists for that tenant.
    pub async fn delete_owned(&self, job_id: Uuid, tenant_id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND tenant_id = $2")
            .bind(job_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Jobs still `Pending`, oldest first, for a worker to claim.
    pub async fn find_pending(&self, limit: i64) -> Result<Vec<Job>, DbError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(job_status_str(JobStatus::Pending))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Delete jobs past their retention horizon. Returns the number removed;
    /// callers are responsible for deleting the corresponding blobs first.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM jobs WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn load_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: Uuid,
    ) -> Result<Job, DbError> {
        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(DbError::NotFound)?;
        row.try_into()
    }

    async fn transition(&self, job_id: Uuid, to: JobStatus) -> Result<Job, DbError> {
        let mut tx = self.pool.begin().await?;
        let current = self.load_for_update(&mut tx, job_id).await?;
        if !current.status.can_transition_to(to) {
            return Err(DbError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        let row: JobRow = sqlx::query_as(
            "UPDATE jobs SET status = $1, updated_at = now() WHERE id = $2 RETURNING *",
        )
        .bind(job_status_str(to))
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_str_roundtrips() {
        for kind in [JobKind::Screenshot, JobKind::Pdf] {
            let s = job_kind_str(kind);
            assert_eq!(parse_job_kind(s).unwrap(), kind);
        }
    }

    #[test]
    fn source_kind_str_roundtrips() {
        for kind in [SourceKind::Url, SourceKind::Html] {
            let s = source_kind_str(kind);
            assert_eq!(parse_source_kind(s).unwrap(), kind);
        }
    }
}
