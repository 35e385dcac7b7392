// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session repository: dashboard login sessions.

use crate::DbError;
use cap_core::Session;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    csrf_token: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            csrf_token: row.csrf_token,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// Repository for the `sessions` table.
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new session, valid until `expires_at`.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        csrf_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session, DbError> {
        let row: SessionRow = sqlx::query_as(
            "INSERT INTO sessions (tenant_id, user_id, csrf_token, expires_at) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(csrf_token)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Fetch a session by id, regardless of expiry — callers are expected
    /// to check [`cap_core::Session::is_expired`] themselves so an expired
    /// session can still be deleted/audited rather than silently vanishing.
    pub async fn get(&self, session_id: Uuid) -> Result<Option<Session>, DbError> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Push a session's expiry forward, e.g. when it's found to expire
    /// within the sliding-window threshold on a successful resolution.
    pub async fn extend_expiry(
        &self,
        session_id: Uuid,
        new_expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let result = sqlx::query("UPDATE sessions SET expires_at = $1 WHERE id = $2")
            .bind(new_expires_at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a session (logout, or expiry cleanup).
    pub async fn delete(&self, session_id: Uuid) -> Result<(), DbError> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete all sessions past their expiry. Returns the number removed.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
