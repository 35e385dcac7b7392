// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the capture control plane.
//!
//! This crate defines the plain value types shared across the control plane
//! — tenants, API keys, sessions, jobs, usage events, webhook events, and
//! artifacts — along with the job lifecycle state machine. It has no I/O of
//! its own; [`cap-db`](../cap_db) persists these shapes and
//! [`cap-daemon`](../cap_daemon) serves them over HTTP.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Tenant
// ---------------------------------------------------------------------------

/// Billing tier, governing monthly credit budget and rate-limit ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Unpaid tier.
    Free,
    /// Paid individual tier.
    Pro,
    /// Paid team tier.
    Business,
    /// Custom-contracted tier.
    Enterprise,
}

impl Tier {
    /// Returns the tier's stable wire name, matching its serde rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Business => "BUSINESS",
            Self::Enterprise => "ENTERPRISE",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A paying (or trial) account. The root of all ownership checks.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Tenant {
    /// Unique tenant identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Current billing tier.
    pub tier: Tier,
    /// Remaining credits in the current billing period.
    pub credit_balance: i64,
    /// Total credits granted for the current billing period.
    pub monthly_credits: i64,
    /// Credits consumed so far in the current billing period.
    pub used_credits: i64,
    /// Anniversary timestamp the monthly rollover compares against.
    pub last_reset_at: DateTime<Utc>,
    /// Whether the tenant's billing subscription is active.
    pub subscription_active: bool,
    /// The billing provider's customer reference, once a subscription has
    /// been established. `None` for tenants that only ever use FREE-tier
    /// credits.
    pub provider_customer_ref: Option<String>,
    /// When the tenant was created.
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Returns `true` if `now` falls in a different calendar month than
    /// `last_reset_at`, meaning the monthly quota should roll over before
    /// this request's quota precheck runs.
    pub fn needs_monthly_rollover(&self, now: DateTime<Utc>) -> bool {
        use chrono::Datelike;
        (now.year(), now.month()) != (self.last_reset_at.year(), self.last_reset_at.month())
    }
}

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

/// A hashed API key belonging to a tenant.
///
/// The raw key is never stored — only `key_prefix` (shown back to the user
/// for identification) and `key_hash` (a salted hash used at verification
/// time) survive.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApiKey {
    /// Unique key identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// First characters of the key, safe to display (e.g. `cap_live_a1b2`).
    pub key_prefix: String,
    /// Salted hash of the full key.
    pub key_hash: String,
    /// Optional user-assigned label.
    pub label: Option<String>,
    /// When the key was created.
    pub created_at: DateTime<Utc>,
    /// When the key was last used to authenticate a request, if ever.
    pub last_used_at: Option<DateTime<Utc>>,
    /// When the key was revoked, if it has been.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Returns `true` if the key has been revoked and must not authenticate.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A dashboard user, linked to exactly one OAuth provider identity.
///
/// Resolved by `(provider, external_id)` first, falling back to `email` for
/// a caller signing in through a second provider with the same address —
/// see the OAuth find-or-create contract in `cap-db`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct User {
    /// Unique user identifier.
    pub id: Uuid,
    /// Tenant this user's sessions and API keys are scoped to.
    pub tenant_id: Uuid,
    /// OAuth provider name, e.g. `"google"` or `"github"`.
    pub provider: String,
    /// The provider's own identifier for this identity.
    pub external_id: String,
    /// Email address reported by the provider.
    pub email: String,
    /// Display name reported by the provider, if any.
    pub display_name: Option<String>,
    /// Avatar URL reported by the provider, if any.
    pub avatar_url: Option<String>,
    /// When this user record was first created.
    pub created_at: DateTime<Utc>,
    /// When this user last completed a successful OAuth sign-in.
    pub last_login_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A browser session established via the dashboard OAuth/login flow.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Session {
    /// Unique session identifier (also the opaque session cookie value).
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Authenticated user within the tenant.
    pub user_id: Uuid,
    /// Anti-CSRF token issued alongside the session.
    pub csrf_token: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session expires.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Returns `true` if `now` is at or past `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Job lifecycle
// ---------------------------------------------------------------------------

/// The kind of rendering work a job performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Capture a screenshot of a URL.
    Screenshot,
    /// Render a URL or raw HTML to PDF.
    Pdf,
}

/// Durable job status, persisted and exposed over the API.
///
/// Transitions are a strict DAG: `Pending -> Processing -> {Completed,
/// Failed}`. There is no `Cancelled` state — once a job leaves `Pending` it
/// runs to completion or failure; cancellation only applies to queue-level
/// scheduling (see `cap-queue`), not this durable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet picked up by a worker.
    Pending,
    /// A worker has claimed the job and is rendering it.
    Processing,
    /// Rendering succeeded; an artifact is available.
    Completed,
    /// Rendering failed; `Job::error` is populated.
    Failed,
}

impl JobStatus {
    /// Returns `true` if this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Processing, Self::Failed],
            Self::Processing => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Whether a job's source material is a URL to fetch or inline HTML to
/// render directly. Mutually exclusive by construction — unlike the source
/// system's ad-hoc intersection type, this is a real sum type end to end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Fetch and render the given URL.
    Url,
    /// Render the inline HTML fragment directly.
    Html,
}

/// A screenshot or PDF rendering job owned by exactly one tenant.
///
/// **Privacy invariant**: this struct has no field for raw HTML, request
/// headers, or cookies. Those only ever exist in the validated request the
/// handler passes to the capture engine; the repository boundary never
/// receives them, so there is no `html`/`headers`/`cookies` column to leak.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,
    /// Owning tenant — every lookup must be scoped by this field.
    pub tenant_id: Uuid,
    /// Screenshot or PDF.
    pub kind: JobKind,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Whether the source material was a URL or inline HTML.
    pub source_kind: SourceKind,
    /// The source URL, when `source_kind == Url`. Never populated for HTML
    /// jobs, and never the HTML body itself.
    pub source_url: Option<String>,
    /// Output format, e.g. `png`, `jpeg`, `webp`, or `pdf`.
    pub format: String,
    /// Validated, privacy-filtered render options (viewport, quality,
    /// margins, etc). Never contains `html`, `headers`, or `cookies` — those
    /// are stripped by the repository boundary before this value is built.
    pub options: serde_json::Value,
    /// Object-store key of the resulting artifact, once completed.
    pub storage_key: Option<String>,
    /// Public download URL, once completed.
    pub download_url: Option<String>,
    /// Size in bytes of the resulting artifact, once completed.
    pub file_size: Option<i64>,
    /// Page count, PDF jobs only.
    pub page_count: Option<i32>,
    /// Error message, truncated to a safe length, once failed.
    pub error: Option<String>,
    /// Digest of the source URL, for analytics dedup without retaining the
    /// URL itself.
    pub url_hash: Option<String>,
    /// Registrable domain of the source URL (never the full URL).
    pub url_domain: Option<String>,
    /// Caller-supplied webhook to notify on completion, if any.
    pub webhook_url: Option<String>,
    /// Credits debited for this job, set once accounting has run.
    pub credits_charged: Option<i64>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job's status last changed.
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal state, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retention horizon; the sweep deletes the job and its artifact at or
    /// after this time.
    pub expires_at: DateTime<Utc>,
}

impl Job {
    /// Returns `true` if `tenant_id` is the owner of this job.
    ///
    /// Every handler that accepts a job id from a caller must check this
    /// (or query through a tenant-scoped repository method that enforces it
    /// at the SQL layer) before returning or mutating the job.
    pub fn is_owned_by(&self, tenant_id: Uuid) -> bool {
        self.tenant_id == tenant_id
    }
}

// ---------------------------------------------------------------------------
// Usage accounting
// ---------------------------------------------------------------------------

/// The billable action a [`UsageEvent`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageEventType {
    /// A plain viewport screenshot.
    Screenshot,
    /// A full-page screenshot (more expensive: scrolling capture).
    ScreenshotFullpage,
    /// A PDF render.
    Pdf,
    /// A PDF render using a header/footer template.
    PdfWithTemplate,
    /// A non-debit event, e.g. a monthly credit grant or plan change.
    PlanGrant,
}

impl UsageEventType {
    /// Returns the event type's stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshot => "SCREENSHOT",
            Self::ScreenshotFullpage => "SCREENSHOT_FULLPAGE",
            Self::Pdf => "PDF",
            Self::PdfWithTemplate => "PDF_WITH_TEMPLATE",
            Self::PlanGrant => "PLAN_GRANT",
        }
    }
}

impl std::fmt::Display for UsageEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single credit-affecting event, recorded for audit and for monthly
/// usage reporting. Metadata is privacy-filtered before this struct is
/// constructed: only `url_domain`-shaped facts survive, never a full URL,
/// HTML, headers, or cookies.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct UsageEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Job this event is associated with, if any (some events are
    /// subscription-level, e.g. a monthly credit grant).
    pub job_id: Option<Uuid>,
    /// What kind of billable action this event records.
    pub event_type: UsageEventType,
    /// Signed credit delta (negative for debits, positive for grants).
    pub credits_delta: i64,
    /// Privacy-filtered metadata, e.g. `{"url_domain": "example.com"}`.
    pub metadata: serde_json::Value,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Webhook reconciliation
// ---------------------------------------------------------------------------

/// A received billing-provider webhook, recorded before processing so that
/// retried deliveries are idempotent.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct WebhookEvent {
    /// Unique internal identifier.
    pub id: Uuid,
    /// The provider's own event id, used as the idempotency key.
    pub provider_event_id: String,
    /// Provider event type, e.g. `"invoice.paid"`, `"subscription.deleted"`.
    pub event_type: String,
    /// Raw event payload as received (already signature-verified).
    pub payload: serde_json::Value,
    /// When the event was first received.
    pub received_at: DateTime<Utc>,
    /// When the event was successfully processed, if it has been.
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// Returns `true` if this event has already been applied and a retry
    /// delivery of the same `provider_event_id` should be a no-op.
    pub fn already_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// An object-storage-backed rendering result.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Unique artifact identifier.
    pub id: Uuid,
    /// Job that produced this artifact.
    pub job_id: Uuid,
    /// Owning tenant (denormalized from the job for ownership checks without
    /// a join).
    pub tenant_id: Uuid,
    /// Object-store key.
    pub storage_key: String,
    /// MIME type, e.g. `image/png`, `application/pdf`.
    pub content_type: String,
    /// Size in bytes.
    pub byte_size: u64,
    /// When the artifact was written.
    pub created_at: DateTime<Utc>,
    /// When the retention sweep will delete this artifact.
    pub expires_at: DateTime<Utc>,
}

impl Artifact {
    /// Returns `true` if `now` is at or past `expires_at`, i.e. this
    /// artifact is eligible for deletion by the retention sweep.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Lifecycle state of a tenant's billing-provider subscription, mirrored
/// locally so the reconciler's mutations are idempotent and queryable
/// without a round trip to the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Subscription is current and the tenant's tier reflects its plan.
    Active,
    /// Most recent invoice failed to collect; tier is unchanged pending
    /// retry or cancellation.
    PastDue,
    /// Subscription was canceled by the provider or the tenant; terminal.
    Canceled,
}

impl SubscriptionStatus {
    /// Returns the status's stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::PastDue => "PAST_DUE",
            Self::Canceled => "CANCELED",
        }
    }
}

/// A local mirror of the billing provider's subscription object, keyed by
/// `provider_customer_ref` so repeated webhook deliveries upsert the same
/// row instead of creating duplicates.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Subscription {
    /// Unique internal identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Billing provider's customer reference.
    pub provider_customer_ref: String,
    /// Billing provider's subscription reference.
    pub provider_subscription_ref: String,
    /// Current lifecycle status.
    pub status: SubscriptionStatus,
    /// Tier this subscription entitles the tenant to while active.
    pub tier: Tier,
    /// When the subscription row was first created.
    pub created_at: DateTime<Utc>,
    /// When the subscription row was last mutated by the reconciler.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn tier_display_matches_wire_name() {
        assert_eq!(Tier::Free.to_string(), "FREE");
        assert_eq!(Tier::Enterprise.to_string(), "ENTERPRISE");
    }

    #[test]
    fn tier_serde_roundtrip() {
        for tier in [Tier::Free, Tier::Pro, Tier::Business, Tier::Enterprise] {
            let json = serde_json::to_string(&tier).unwrap();
            let back: Tier = serde_json::from_str(&json).unwrap();
            assert_eq!(tier, back);
        }
    }

    #[test]
    fn api_key_revoked_iff_revoked_at_set() {
        let base = ApiKey {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            key_prefix: "cap_live_a1b2".into(),
            key_hash: "hash".into(),
            label: None,
            created_at: now(),
            last_used_at: None,
            revoked_at: None,
        };
        assert!(!base.is_revoked());
        let revoked = ApiKey {
            revoked_at: Some(now()),
            ..base
        };
        assert!(revoked.is_revoked());
    }

    #[test]
    fn session_expiry() {
        let session = Session {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            csrf_token: "tok".into(),
            created_at: now(),
            expires_at: now() + Duration::hours(1),
        };
        assert!(!session.is_expired(now()));
        assert!(session.is_expired(now() + Duration::hours(2)));
        assert!(session.is_expired(now() + Duration::hours(1)));
    }

    #[test]
    fn job_status_pending_can_move_to_processing_or_failed() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn job_status_processing_can_move_to_completed_or_failed() {
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn job_status_terminal_states_have_no_transitions() {
        for status in [JobStatus::Completed, JobStatus::Failed] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
            assert!(!status.can_transition_to(JobStatus::Processing));
        }
    }

    #[test]
    fn job_status_non_terminal_states_are_not_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    fn sample_job(tenant_id: Uuid, kind: JobKind, status: JobStatus) -> Job {
        Job {
            id: Uuid::new_v4(),
            tenant_id,
            kind,
            status,
            source_kind: SourceKind::Url,
            source_url: Some("https://example.com".into()),
            format: "png".into(),
            options: serde_json::json!({"width": 1280, "height": 720}),
            storage_key: None,
            download_url: None,
            file_size: None,
            page_count: None,
            error: None,
            url_hash: Some("deadbeef".into()),
            url_domain: Some("example.com".into()),
            webhook_url: None,
            credits_charged: None,
            created_at: now(),
            updated_at: now(),
            completed_at: None,
            expires_at: now() + Duration::hours(24),
        }
    }

    #[test]
    fn job_ownership_check() {
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let job = sample_job(tenant_a, JobKind::Screenshot, JobStatus::Pending);
        assert!(job.is_owned_by(tenant_a));
        assert!(!job.is_owned_by(tenant_b));
    }

    #[test]
    fn job_serde_roundtrip_preserves_status() {
        let mut job = sample_job(Uuid::new_v4(), JobKind::Pdf, JobStatus::Completed);
        job.storage_key = Some("pdfs/x/y.pdf".into());
        job.credits_charged = Some(-5);
        job.completed_at = Some(now());
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, JobStatus::Completed);
        assert_eq!(back.credits_charged, Some(-5));
    }

    #[test]
    fn job_never_carries_a_raw_html_headers_or_cookies_field() {
        let job = sample_job(Uuid::new_v4(), JobKind::Screenshot, JobStatus::Pending);
        let value = serde_json::to_value(&job).unwrap();
        let obj = value.as_object().unwrap();
        for forbidden in ["html", "headers", "cookies"] {
            assert!(
                !obj.contains_key(forbidden),
                "Job must never serialize a `{forbidden}` field"
            );
        }
    }

    #[test]
    fn usage_event_type_display_matches_wire_name() {
        assert_eq!(UsageEventType::Screenshot.to_string(), "SCREENSHOT");
        assert_eq!(
            UsageEventType::ScreenshotFullpage.to_string(),
            "SCREENSHOT_FULLPAGE"
        );
        assert_eq!(UsageEventType::PdfWithTemplate.to_string(), "PDF_WITH_TEMPLATE");
    }

    #[test]
    fn webhook_event_processed_flag() {
        let mut event = WebhookEvent {
            id: Uuid::new_v4(),
            provider_event_id: "evt_123".into(),
            event_type: "invoice.paid".into(),
            payload: serde_json::json!({}),
            received_at: now(),
            processed_at: None,
        };
        assert!(!event.already_processed());
        event.processed_at = Some(now());
        assert!(event.already_processed());
    }

    #[test]
    fn artifact_expiry() {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            storage_key: "artifacts/x.png".into(),
            content_type: "image/png".into(),
            byte_size: 1024,
            created_at: now(),
            expires_at: now() + Duration::hours(1),
        };
        assert!(!artifact.is_expired(now()));
        assert!(artifact.is_expired(now() + Duration::hours(2)));
    }
}
