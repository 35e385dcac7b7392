// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant repository: account rows, monthly quota rollover, and atomic
//! credit debits.

use crate::{DbError, parse_tier, usage::insert_event_tx};
use cap_core::{Tenant, Tier, UsageEvent, UsageEventType};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    tier: String,
    credit_balance: i64,
    monthly_credits: i64,
    used_credits: i64,
    last_reset_at: DateTime<Utc>,
    subscription_active: bool,
    provider_customer_ref: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = DbError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            id: row.id,
            name: row.name,
            tier: parse_tier(&row.tier)?,
            credit_balance: row.credit_balance,
            monthly_credits: row.monthly_credits,
            used_credits: row.used_credits,
            last_reset_at: row.last_reset_at,
            subscription_active: row.subscription_active,
            provider_customer_ref: row.provider_customer_ref,
            created_at: row.created_at,
        })
    }
}

/// Repository for the `tenants` table.
pub struct TenantRepository {
    pool: PgPool,
}

impl TenantRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new tenant, seeded with `monthly_credits` for both its
    /// budget and its starting balance.
    pub async fn create(
        &self,
        name: &str,
        tier: Tier,
        monthly_credits: i64,
    ) -> Result<Tenant, DbError> {
        let row: TenantRow = sqlx::query_as(
            "INSERT INTO tenants (name, tier, credit_balance, monthly_credits, used_credits) \
             VALUES ($1, $2, $3, $4, 0) RETURNING *",
        )
        .bind(name)
        .bind(tier.as_str())
        .bind(monthly_credits)
        .bind(monthly_credits)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// Fetch a tenant by id.
    pub async fn get(&self, tenant_id: Uuid) -> Result<Tenant, DbError> {
        let row: Option<TenantRow> = sqlx::query_as("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(DbError::NotFound)?.try_into()
    }

    /// Fetch a tenant by its billing provider customer reference — the
    /// reconciler's way of turning a webhook's `customer` field into a
    /// tenant id before mutating anything.
    pub async fn get_by_provider_customer_ref(
        &self,
        provider_customer_ref: &str,
    ) -> Result<Tenant, DbError> {
        let row: Option<TenantRow> =
            sqlx::query_as("SELECT * FROM tenants WHERE provider_customer_ref = $1")
                .bind(provider_customer_ref)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(DbError::NotFound)?.try_into()
    }

    /// Link a tenant to its billing provider customer reference the first
    /// time a subscription is established for it.
    pub async fn link_provider_customer_ref(
        &self,
        tenant_id: Uuid,
        provider_customer_ref: &str,
    ) -> Result<(), DbError> {
        let result =
            sqlx::query("UPDATE tenants SET provider_customer_ref = $1 WHERE id = $2")
                .bind(provider_customer_ref)
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Apply the lazy monthly rollover if `tenant.last_reset_at` falls in a
    /// different calendar month than `now`: zero `used_credits`, refresh
    /// `credit_balance` to the monthly budget, and stamp `last_reset_at`.
    /// No-op (and no extra round trip) if rollover isn't due.
    pub async fn apply_rollover_if_due(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Tenant, DbError> {
        let tenant = self.get(tenant_id).await?;
        if !tenant.needs_monthly_rollover(now) {
            return Ok(tenant);
        }
        let row: TenantRow = sqlx::query_as(
            "UPDATE tenants SET used_credits = 0, credit_balance = monthly_credits, \
             last_reset_at = $1 WHERE id = $2 RETURNING *",
        )
        .bind(now)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// Atomically debit `amount` credits from `tenant_id`'s balance and
    /// advance `used_credits` by the same amount.
    ///
    /// The check-then-set is expressed as a single `WHERE` clause so a
    /// concurrent debit from another request can never drive the balance
    /// negative; if the row isn't updated it's because the balance was
    /// already too low, not a race.
    pub async fn debit_credits(&self, tenant_id: Uuid, amount: i64) -> Result<i64, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE tenants SET credit_balance = credit_balance - $1, used_credits = used_credits + $1 \
             WHERE id = $2 AND credit_balance >= $1 \
             RETURNING credit_balance",
        )
        .bind(amount)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((balance,)) => Ok(balance),
            None => {
                let current = self.get(tenant_id).await?.credit_balance;
                Err(DbError::InsufficientCredits {
                    required: amount,
                    available: current,
                })
            }
        }
    }

    /// Atomically debit `cost` credits from `tenant_id` and append the
    /// matching usage event in the same transaction, so a crash between
    /// the two can never happen and a failed insert rolls the debit back
    /// too — the debit and its ledger entry either both land or neither
    /// does.
    pub async fn debit_credits_and_record_usage(
        &self,
        tenant_id: Uuid,
        job_id: Option<Uuid>,
        event_type: UsageEventType,
        cost: i64,
        metadata: serde_json::Value,
    ) -> Result<(i64, UsageEvent), DbError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE tenants SET credit_balance = credit_balance - $1, used_credits = used_credits + $1 \
             WHERE id = $2 AND credit_balance >= $1 \
             RETURNING credit_balance",
        )
        .bind(cost)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let balance = match row {
            Some((balance,)) => balance,
            None => {
                let current = self.get(tenant_id).await?.credit_balance;
                return Err(DbError::InsufficientCredits {
                    required: cost,
                    available: current,
                });
            }
        };

        let event = insert_event_tx(&mut tx, tenant_id, job_id, event_type, -cost, metadata).await?;

        tx.commit().await?;
        Ok((balance, event))
    }

    /// Grant `amount` credits to `tenant_id`'s balance (not `used_credits`),
    /// e.g. at billing-cycle renewal or a manual top-up.
    pub async fn grant_credits(&self, tenant_id: Uuid, amount: i64) -> Result<i64, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE tenants SET credit_balance = credit_balance + $1 WHERE id = $2 \
             RETURNING credit_balance",
        )
        .bind(amount)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(balance,)| balance).ok_or(DbError::NotFound)
    }

    /// Set the tenant's tier and reset its budget/balance/usage to that
    /// tier's monthly credits, stamping `last_reset_at = now` — the
    /// reconciler's response to an activated/renewed subscription.
    pub async fn set_tier_and_reset_budget(
        &self,
        tenant_id: Uuid,
        tier: Tier,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> Result<Tenant, DbError> {
        let row: TenantRow = sqlx::query_as(
            "UPDATE tenants SET tier = $1, monthly_credits = $2, credit_balance = $2, \
             used_credits = 0, last_reset_at = $3 WHERE id = $4 RETURNING *",
        )
        .bind(tier.as_str())
        .bind(monthly_credits)
        .bind(now)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)?;
        row.try_into()
    }

    /// Flip the tenant's subscription active flag, driven by webhook
    /// reconciliation.
    pub async fn set_subscription_active(
        &self,
        tenant_id: Uuid,
        active: bool,
    ) -> Result<(), DbError> {
        let result = sqlx::query("UPDATE tenants SET subscription_active = $1 WHERE id = $2")
            .bind(active)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}
