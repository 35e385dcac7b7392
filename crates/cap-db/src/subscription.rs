// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subscription repository: the local mirror of the billing provider's
//! subscription object, upserted by the reconciler.

use crate::{DbError, parse_tier};
use cap_core::{Subscription, SubscriptionStatus, Tier};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    provider_customer_ref: String,
    provider_subscription_ref: String,
    status: String,
    tier: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn parse_status(value: &str) -> Result<SubscriptionStatus, DbError> {
    match value {
        "ACTIVE" => Ok(SubscriptionStatus::Active),
        "PAST_DUE" => Ok(SubscriptionStatus::PastDue),
        "CANCELED" => Ok(SubscriptionStatus::Canceled),
        other => Err(DbError::UnrecognizedEnumValue {
            field: "status",
            value: other.to_string(),
        }),
    }
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DbError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            provider_customer_ref: row.provider_customer_ref,
            provider_subscription_ref: row.provider_subscription_ref,
            status: parse_status(&row.status)?,
            tier: parse_tier(&row.tier)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for the `subscriptions` table.
pub struct SubscriptionRepository {
    pool: PgPool,
}

impl SubscriptionRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the subscription row keyed by `provider_customer_ref` —
    /// repeated webhook deliveries for the same customer converge on one
    /// row instead of piling up duplicates.
    pub async fn upsert_active(
        &self,
        tenant_id: Uuid,
        provider_customer_ref: &str,
        provider_subscription_ref: &str,
        tier: Tier,
    ) -> Result<Subscription, DbError> {
        let row: SubscriptionRow = sqlx::query_as(
            "INSERT INTO subscriptions \
                (tenant_id, provider_customer_ref, provider_subscription_ref, status, tier) \
             VALUES ($1, $2, $3, 'ACTIVE', $4) \
             ON CONFLICT (provider_customer_ref) DO UPDATE SET \
                provider_subscription_ref = EXCLUDED.provider_subscription_ref, \
                status = 'ACTIVE', \
                tier = EXCLUDED.tier, \
                updated_at = now() \
             RETURNING *",
        )
        .bind(tenant_id)
        .bind(provider_customer_ref)
        .bind(provider_subscription_ref)
        .bind(tier.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// Set a subscription's status by its `provider_customer_ref`, leaving
    /// its tier untouched — used for `PAST_DUE` and `CANCELED` transitions
    /// that don't themselves change plan membership.
    pub async fn set_status(
        &self,
        provider_customer_ref: &str,
        status: SubscriptionStatus,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = now() \
             WHERE provider_customer_ref = $2",
        )
        .bind(status.as_str())
        .bind(provider_customer_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Fetch a subscription by its provider customer reference.
    pub async fn get_by_provider_customer_ref(
        &self,
        provider_customer_ref: &str,
    ) -> Result<Subscription, DbError> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE provider_customer_ref = $1")
                .bind(provider_customer_ref)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(DbError::NotFound)?.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_str_roundtrips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(parse_status("TRIALING").is_err());
    }
}
