// SPDX-License-Identifier: MIT OR Apache-2.0
//! Postgres repository layer for the capture control plane.
//!
//! Each module owns one aggregate (tenants, API keys, sessions, jobs,
//! usage events, webhook events, artifacts) and exposes a `*Repository`
//! struct wrapping a [`sqlx::PgPool`]. Queries are written with
//! `sqlx::query_as` against plain row structs rather than the `query_as!`
//! compile-time-checked macro, so the crate builds without a live database
//! connection available.
//!
//! Every lookup that takes a caller-supplied resource id also takes the
//! caller's `tenant_id` and scopes the `WHERE` clause by it — there is no
//! lookup-by-id-alone method on [`job::JobRepository`] or
//! [`artifact::ArtifactRepository`], so a handler cannot accidentally
//! return or mutate another tenant's resource.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api_key;
mod artifact;
mod job;
mod session;
mod subscription;
mod tenant;
mod usage;
mod user;
mod webhook;

pub use api_key::ApiKeyRepository;
pub use artifact::ArtifactRepository;
pub use job::{JobRepository, JobSortBy, NewJob};
pub use session::SessionRepository;
pub use subscription::SubscriptionRepository;
pub use tenant::TenantRepository;
pub use usage::UsageRepository;
pub use user::{OAuthProfile, UserRepository};
pub use webhook::WebhookEventRepository;

use cap_core::{JobKind, JobStatus, SourceKind, Tier};

/// Errors from a repository operation.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The underlying database driver returned an error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The requested row does not exist (or is not visible to the caller's
    /// tenant, which looks identical from the outside — see module docs).
    #[error("resource not found")]
    NotFound,

    /// A job state transition was attempted that the state machine does
    /// not allow.
    #[error("cannot transition job from {from:?} to {to:?}")]
    InvalidTransition {
        /// The job's status before the attempted transition.
        from: JobStatus,
        /// The status the caller attempted to transition to.
        to: JobStatus,
    },

    /// A credit debit was attempted that would take the tenant's balance
    /// negative.
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        /// Credits the operation would have cost.
        required: i64,
        /// Credits actually available at the time of the attempt.
        available: i64,
    },

    /// A row referenced an enum value this binary does not recognize —
    /// almost certainly a schema/binary version skew.
    #[error("unrecognized {field} value: {value}")]
    UnrecognizedEnumValue {
        /// Name of the column/field.
        field: &'static str,
        /// The unrecognized string value.
        value: String,
    },
}

fn parse_tier(value: &str) -> Result<Tier, DbError> {
    match value {
        "FREE" => Ok(Tier::Free),
        "PRO" => Ok(Tier::Pro),
        "BUSINESS" => Ok(Tier::Business),
        "ENTERPRISE" => Ok(Tier::Enterprise),
        other => Err(DbError::UnrecognizedEnumValue {
            field: "tier",
            value: other.to_string(),
        }),
    }
}

fn parse_job_kind(value: &str) -> Result<JobKind, DbError> {
    match value {
        "screenshot" => Ok(JobKind::Screenshot),
        "pdf" => Ok(JobKind::Pdf),
        other => Err(DbError::UnrecognizedEnumValue {
            field: "kind",
            value: other.to_string(),
        }),
    }
}

fn parse_job_status(value: &str) -> Result<JobStatus, DbError> {
    match value {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(DbError::UnrecognizedEnumValue {
            field: "status",
            value: other.to_string(),
        }),
    }
}

fn parse_source_kind(value: &str) -> Result<SourceKind, DbError> {
    match value {
        "url" => Ok(SourceKind::Url),
        "html" => Ok(SourceKind::Html),
        other => Err(DbError::UnrecognizedEnumValue {
            field: "source_kind",
            value: other.to_string(),
        }),
    }
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tier_accepts_all_known_values() {
        assert_eq!(parse_tier("FREE").unwrap(), Tier::Free);
        assert_eq!(parse_tier("PRO").unwrap(), Tier::Pro);
        assert_eq!(parse_tier("BUSINESS").unwrap(), Tier::Business);
        assert_eq!(parse_tier("ENTERPRISE").unwrap(), Tier::Enterprise);
    }

    #[test]
    fn parse_tier_rejects_unknown_value() {
        let err = parse_tier("GOLD").unwrap_err();
        assert!(matches!(err, DbError::UnrecognizedEnumValue { .. }));
    }

    #[test]
    fn job_status_roundtrips_through_its_string_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let s = job_status_str(status);
            assert_eq!(parse_job_status(s).unwrap(), status);
        }
    }

    #[test]
    fn parse_job_kind_rejects_unknown_value() {
        let err = parse_job_kind("video").unwrap_err();
        assert!(matches!(err, DbError::UnrecognizedEnumValue { .. }));
    }
}
