// SPDX-License-Identifier: MIT OR Apache-2.0
//! API key repository.

use crate::DbError;
use cap_core::ApiKey;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct ApiKeyRow {
    id: Uuid,
    tenant_id: Uuid,
    key_prefix: String,
    key_hash: String,
    label: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    revoked_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id,
            tenant_id: row.tenant_id,
            key_prefix: row.key_prefix,
            key_hash: row.key_hash,
            label: row.label,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            revoked_at: row.revoked_at,
        }
    }
}

/// Repository for the `api_keys` table.
pub struct ApiKeyRepository {
    pool: PgPool,
}

impl ApiKeyRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issue a new API key for `tenant_id`. `key_hash` must already be a
    /// salted hash of the raw secret — the raw secret itself is never
    /// persisted.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        key_prefix: &str,
        key_hash: &str,
        label: Option<&str>,
    ) -> Result<ApiKey, DbError> {
        let row: ApiKeyRow = sqlx::query_as(
            "INSERT INTO api_keys (tenant_id, key_prefix, key_hash, label) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(tenant_id)
        .bind(key_prefix)
        .bind(key_hash)
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Look up a key by its public prefix, for authentication. Returns
    /// `None` rather than an error when no key matches — a missing key and
    /// an invalid secret should look the same to the caller.
    pub async fn find_by_prefix(&self, key_prefix: &str) -> Result<Option<ApiKey>, DbError> {
        let row: Option<ApiKeyRow> = sqlx::query_as("SELECT * FROM api_keys WHERE key_prefix = $1")
            .bind(key_prefix)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Record that a key was just used to authenticate a request.
    pub async fn touch_last_used(&self, key_id: Uuid) -> Result<(), DbError> {
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Revoke a key, scoped to its owning tenant. Returns `false` if no
    /// matching key exists for that tenant (either it doesn't exist, or it
    /// belongs to a different tenant) — both cases are reported identically
    /// so a caller cannot distinguish "not found" from "not yours".
    pub async fn revoke(&self, key_id: Uuid, tenant_id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = now() \
             WHERE id = $1 AND tenant_id = $2 AND revoked_at IS NULL",
        )
        .bind(key_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List keys belonging to `tenant_id`.
    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, DbError> {
        let rows: Vec<ApiKeyRow> =
            sqlx::query_as("SELECT * FROM api_keys WHERE tenant_id = $1 ORDER BY created_at DESC")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
