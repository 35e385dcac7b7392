// SPDX-License-Identifier: MIT OR Apache-2.0
//! Usage event repository: the append-only ledger behind quota accounting.

use crate::DbError;
use cap_core::{UsageEvent, UsageEventType};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(FromRow)]
struct UsageEventRow {
    id: Uuid,
    tenant_id: Uuid,
    job_id: Option<Uuid>,
    event_type: String,
    credits_delta: i64,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

fn parse_event_type(value: &str) -> Result<UsageEventType, DbError> {
    match value {
        "SCREENSHOT" => Ok(UsageEventType::Screenshot),
        "SCREENSHOT_FULLPAGE" => Ok(UsageEventType::ScreenshotFullpage),
        "PDF" => Ok(UsageEventType::Pdf),
        "PDF_WITH_TEMPLATE" => Ok(UsageEventType::PdfWithTemplate),
        "PLAN_GRANT" => Ok(UsageEventType::PlanGrant),
        other => Err(DbError::UnrecognizedEnumValue {
            field: "event_type",
            value: other.to_string(),
        }),
    }
}

impl TryFrom<UsageEventRow> for UsageEvent {
    type Error = DbError;

    fn try_from(row: UsageEventRow) -> Result<Self, Self::Error> {
        Ok(UsageEvent {
            id: row.id,
            tenant_id: row.tenant_id,
            job_id: row.job_id,
            event_type: parse_event_type(&row.event_type)?,
            credits_delta: row.credits_delta,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

/// Insert one usage event against an already-open transaction, so the
/// caller can commit it together with whatever balance update it
/// belongs with (see [`crate::TenantRepository::debit_credits_and_record_usage`]).
pub(crate) async fn insert_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    job_id: Option<Uuid>,
    event_type: UsageEventType,
    credits_delta: i64,
    metadata: serde_json::Value,
) -> Result<UsageEvent, DbError> {
    let row: UsageEventRow = sqlx::query_as(
        "INSERT INTO usage_events (tenant_id, job_id, event_type, credits_delta, metadata) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(tenant_id)
    .bind(event_type.as_str())
    .bind(job_id)
    .bind(credits_delta)
    .bind(metadata)
    .fetch_one(&mut **tx)
    .await?;
    row.try_into()
}

/// Repository for the `usage_events` table.
pub struct UsageRepository {
    pool: PgPool,
}

impl UsageRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a usage event. `credits_delta` is negative for a debit,
    /// positive for a grant. `metadata` must already be privacy-filtered —
    /// this repository does not strip anything itself.
    pub async fn record(
        &self,
        tenant_id: Uuid,
        job_id: Option<Uuid>,
        event_type: UsageEventType,
        credits_delta: i64,
        metadata: serde_json::Value,
    ) -> Result<UsageEvent, DbError> {
        let row: UsageEventRow = sqlx::query_as(
            "INSERT INTO usage_events (tenant_id, job_id, event_type, credits_delta, metadata) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(tenant_id)
        .bind(event_type.as_str())
        .bind(job_id)
        .bind(credits_delta)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// List usage events for a tenant within `[since, until)`, newest first.
    pub async fn list_for_tenant(
        &self,
        tenant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, DbError> {
        let rows: Vec<UsageEventRow> = sqlx::query_as(
            "SELECT * FROM usage_events \
             WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3 \
             ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Sum of `credits_delta` for a tenant within `[since, until)` — the
    /// basis for usage-dashboard and billing-cycle reporting.
    pub async fn sum_credits_delta(
        &self,
        tenant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(credits_delta) FROM usage_events \
             WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(tenant_id)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_str_roundtrips() {
        for kind in [
            UsageEventType::Screenshot,
            UsageEventType::ScreenshotFullpage,
            UsageEventType::Pdf,
            UsageEventType::PdfWithTemplate,
            UsageEventType::PlanGrant,
        ] {
            assert_eq!(parse_event_type(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_event_type_rejected() {
        assert!(parse_event_type("UNKNOWN").is_err());
    }
}
