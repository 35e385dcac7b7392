// SPDX-License-Identifier: MIT OR Apache-2.0
//! User repository: dashboard identities and the OAuth find-or-create
//! contract (§4.2).

use crate::DbError;
use cap_core::User;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    provider: String,
    external_id: String,
    email: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            tenant_id: row.tenant_id,
            provider: row.provider,
            external_id: row.external_id,
            email: row.email,
            display_name: row.display_name,
            avatar_url: row.avatar_url,
            created_at: row.created_at,
            last_login_at: row.last_login_at,
        }
    }
}

/// An OAuth provider profile presented at sign-in.
pub struct OAuthProfile<'a> {
    /// Provider name, e.g. `"google"`.
    pub provider: &'a str,
    /// The provider's own identifier for this identity.
    pub external_id: &'a str,
    /// Email address reported by the provider.
    pub email: &'a str,
    /// Display name reported by the provider, if any.
    pub display_name: Option<&'a str>,
    /// Avatar URL reported by the provider, if any.
    pub avatar_url: Option<&'a str>,
}

/// Repository for the `users` table.
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a user by id.
    pub async fn get(&self, user_id: Uuid) -> Result<User, DbError> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.ok_or(DbError::NotFound)?.into())
    }

    /// Resolve `profile` to a [`User`], creating a new Tenant and User in one
    /// transaction if neither `(provider, external_id)` nor `email` already
    /// links to one (§4.2 OAuth flow contract):
    ///
    /// 1. `(provider, external_id)` already links → that user, `last_login_at` refreshed.
    /// 2. Otherwise `email` matches an existing user → attach the new provider link.
    /// 3. Otherwise create a new Tenant (FREE tier, seeded with `monthly_credits`,
    ///    `used_credits = 0`) and User, then link.
    pub async fn find_or_create_for_oauth(
        &self,
        profile: &OAuthProfile<'_>,
        monthly_credits: i64,
        now: DateTime<Utc>,
    ) -> Result<User, DbError> {
        if let Some(row) = self.find_by_provider_external(profile).await? {
            self.touch_last_login(row.id, now).await?;
            let mut row = row;
            row.last_login_at = Some(now);
            return Ok(row.into());
        }

        let mut tx = self.pool.begin().await?;

        if let Some(existing) = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = $1 FOR UPDATE")
            .bind(profile.email)
            .fetch_optional(&mut *tx)
            .await?
        {
            let row: UserRow = sqlx::query_as(
                "UPDATE users SET provider = $1, external_id = $2, last_login_at = $3 \
                 WHERE id = $4 RETURNING *",
            )
            .bind(profile.provider)
            .bind(profile.external_id)
            .bind(now)
            .bind(existing.id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(row.into());
        }

        let tenant_row: (Uuid,) = sqlx::query_as(
            "INSERT INTO tenants (name, tier, credit_balance, monthly_credits, used_credits) \
             VALUES ($1, 'FREE', $2, $2, 0) RETURNING id",
        )
        .bind(profile.email)
        .bind(monthly_credits)
        .fetch_one(&mut *tx)
        .await?;

        let row: UserRow = sqlx::query_as(
            "INSERT INTO users (tenant_id, provider, external_id, email, display_name, avatar_url, last_login_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(tenant_row.0)
        .bind(profile.provider)
        .bind(profile.external_id)
        .bind(profile.email)
        .bind(profile.display_name)
        .bind(profile.avatar_url)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn find_by_provider_external(
        &self,
        profile: &OAuthProfile<'_>,
    ) -> Result<Option<UserRow>, DbError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT * FROM users WHERE provider = $1 AND external_id = $2",
        )
        .bind(profile.provider)
        .bind(profile.external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_last_login(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), DbError> {
        sqlx::query("UPDATE users SET last_login_at = $1 WHERE id = $2")
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
