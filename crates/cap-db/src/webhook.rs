// SPDX-License-Identifier: MIT OR Apache-2.0
//! Webhook event repository: idempotent ingestion of provider events so a
//! retried delivery is processed at most once.

use crate::DbError;
use cap_core::WebhookEvent;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct WebhookEventRow {
    id: Uuid,
    provider_event_id: String,
    event_type: String,
    payload: serde_json::Value,
    received_at: chrono::DateTime<chrono::Utc>,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<WebhookEventRow> for WebhookEvent {
    fn from(row: WebhookEventRow) -> Self {
        WebhookEvent {
            id: row.id,
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            payload: row.payload,
            received_at: row.received_at,
            processed_at: row.processed_at,
        }
    }
}

/// Repository for the `webhook_events` table.
pub struct WebhookEventRepository {
    pool: PgPool,
}

impl WebhookEventRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a newly received webhook event, or return the existing row
    /// untouched if `provider_event_id` has already been recorded. The
    /// returned `bool` is `true` when this call performed the insert, so
    /// callers can tell "first delivery" from "replay" without a second
    /// round trip.
    pub async fn record_if_new(
        &self,
        provider_event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(WebhookEvent, bool), DbError> {
        let inserted: Option<WebhookEventRow> = sqlx::query_as(
            "INSERT INTO webhook_events (provider_event_id, event_type, payload) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (provider_event_id) DO NOTHING \
             RETURNING *",
        )
        .bind(provider_event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing: WebhookEventRow =
            sqlx::query_as("SELECT * FROM webhook_events WHERE provider_event_id = $1")
                .bind(provider_event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((existing.into(), false))
    }

    /// Look up an event by the provider's own id.
    pub async fn find_by_provider_id(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<WebhookEvent>, DbError> {
        let row: Option<WebhookEventRow> =
            sqlx::query_as("SELECT * FROM webhook_events WHERE provider_event_id = $1")
                .bind(provider_event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    /// Mark an event as processed, after its billing action has been
    /// applied.
    pub async fn mark_processed(&self, event_id: Uuid) -> Result<(), DbError> {
        let result =
            sqlx::query("UPDATE webhook_events SET processed_at = now() WHERE id = $1")
                .bind(event_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}
