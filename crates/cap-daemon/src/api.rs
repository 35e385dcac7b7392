// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP-facing wire types: the response envelope, request bodies, and the
//! `CapError` -> HTTP response bridge.
//!
//! Resource types (`Job`, `Tenant`, ...) live in `cap-core` and are reused
//! directly where their full shape is already API-safe; this module only
//! adds the envelope around them and the request bodies the engine itself
//! has no business knowing about.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use cap_error::{CapError, CapErrorDto, ErrorCode};
use cap_validate::{PdfOptions, ScreenshotOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current contract version, reported in every envelope's `meta.version`.
pub const API_VERSION: &str = "v1";

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// Uniform envelope wrapping every JSON response the daemon returns.
///
/// Exactly one of `data`/`error` is populated, mirroring the discriminated
/// shape callers are told to rely on rather than inferring success from the
/// HTTP status alone.
#[derive(Debug, Clone, Serialize)]
pub struct ApiEnvelope<T> {
    /// Whether the request succeeded.
    pub success: bool,
    /// Response payload, present iff `success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error payload, present iff `!success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    /// Response metadata.
    pub meta: ResponseMeta,
}

impl<T> ApiEnvelope<T> {
    /// Build a success envelope, optionally annotated with pagination.
    pub fn ok(data: T, request_id: Uuid, pagination: Option<Pagination>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: ResponseMeta::new(request_id, pagination),
        }
    }
}

/// Envelope metadata, present on both success and error responses.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    /// Server time at which the response was generated.
    pub timestamp: DateTime<Utc>,
    /// Echo of the request's correlation id (see `x-request-id`).
    pub request_id: Uuid,
    /// Contract version, currently always `"v1"`.
    pub version: &'static str,
    /// Pagination details, present only on list endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl ResponseMeta {
    fn new(request_id: Uuid, pagination: Option<Pagination>) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            version: API_VERSION,
            pagination,
        }
    }
}

/// Pagination summary attached to list responses.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pagination {
    /// Requested page, 1-indexed.
    pub page: u32,
    /// Requested page size.
    pub limit: u32,
    /// Total rows matching the query, across all pages.
    pub total: i64,
    /// Total number of pages at this `limit`.
    pub total_pages: u32,
    /// Whether a page after this one exists.
    pub has_next: bool,
    /// Whether a page before this one exists.
    pub has_prev: bool,
}

impl Pagination {
    /// Derive a pagination summary from the requested page/limit and the
    /// repository's reported total row count.
    pub fn new(page: u32, limit: u32, total: i64) -> Self {
        let total_pages = if total <= 0 {
            0
        } else {
            ((total as u64).div_ceil(limit.max(1) as u64)) as u32
        };
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: (page as u64) < total_pages as u64,
            has_prev: page > 1,
        }
    }
}

/// Public-facing shape of an error, matching the `{code, message, details}`
/// table in the response-envelope contract. Never carries the internal
/// `source_message` a [`CapErrorDto`] keeps for log correlation.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details, e.g. field-level validation failures.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl From<&CapError> for ApiErrorBody {
    fn from(err: &CapError) -> Self {
        let dto: CapErrorDto = err.into();
        Self {
            code: dto.code,
            message: dto.message,
            details: dto.context.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// CapError -> HTTP response
// ---------------------------------------------------------------------------

/// Newtype wrapping [`CapError`] so the daemon can implement
/// [`IntoResponse`] for it without violating the orphan rule.
///
/// Handlers should propagate `CapError` with `?` and only wrap at the edge
/// (axum coerces a handler's `Err(ApiError)` into a response automatically
/// via this impl, or a handler can construct one directly to return early).
#[derive(Debug)]
pub struct ApiError(pub CapError);

impl From<CapError> for ApiError {
    fn from(err: CapError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = &self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(code = err.code.as_str(), message = %err.message, "request failed");
        } else {
            tracing::warn!(code = err.code.as_str(), message = %err.message, "request rejected");
        }

        let request_id = err
            .context
            .get("request_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Uuid::new_v4);

        let envelope: ApiEnvelope<()> = ApiEnvelope {
            success: false,
            data: None,
            error: Some(ApiErrorBody::from(err)),
            meta: ResponseMeta::new(request_id, None),
        };

        let mut response = (status, Json(envelope)).into_response();

        if err.code == ErrorCode::RateLimitExceeded || err.code == ErrorCode::IpRateLimitExceeded {
            if let Some(retry_after) = err.context.get("retry_after_secs").and_then(|v| v.as_i64())
                && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
            {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Shorthand for a handler's fallible return type.
pub type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// `POST /v1/screenshots` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenshotCreateRequest {
    /// Render options, flattened into the top-level request body.
    #[serde(flatten)]
    pub options: ScreenshotOptions,
    /// Submit as a background job and return `202` immediately, instead of
    /// rendering inline.
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// Render inline and stream bytes back without ever touching the object
    /// store or the job table. Mutually exclusive with `async` (enforced at
    /// the handler, since the invariant spans two fields).
    #[serde(default, rename = "noStore")]
    pub no_store: bool,
    /// Callback to notify on completion, for async jobs only.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// `POST /v1/pdfs` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PdfCreateRequest {
    /// Render options, flattened into the top-level request body.
    #[serde(flatten)]
    pub options: PdfOptions,
    /// Submit as a background job and return `202` immediately, instead of
    /// rendering inline.
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// Render inline and stream bytes back without ever touching the object
    /// store or the job table. Mutually exclusive with `async`.
    #[serde(default, rename = "noStore")]
    pub no_store: bool,
    /// Callback to notify on completion, for async jobs only.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Query parameters accepted by the list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct JobListQuery {
    /// 1-indexed page number. Defaults to 1.
    #[serde(default)]
    pub page: Option<u32>,
    /// Page size, capped at 100. Defaults to 20.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Filter by job status, e.g. `"completed"`.
    #[serde(default)]
    pub status: Option<String>,
    /// Field to sort by: `"created_at"` (default) or `"completed_at"`.
    #[serde(default)]
    pub sort_by: Option<String>,
    /// Sort order: `"asc"` or `"desc"` (default).
    #[serde(default)]
    pub sort_order: Option<String>,
}

// ---------------------------------------------------------------------------
// Resource views
// ---------------------------------------------------------------------------

/// Public view of a [`cap_core::Job`].
///
/// Identical to the repository type field-for-field today — `cap_core::Job`
/// was already designed with the privacy invariant baked in (no `html`,
/// `headers`, or `cookies` field exists to leak) — but kept as a distinct
/// type so the wire shape and the persisted shape are free to diverge later
/// without one forcing a migration on the other.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Job identifier.
    pub id: Uuid,
    /// Screenshot or PDF.
    pub kind: cap_core::JobKind,
    /// Current lifecycle status.
    pub status: cap_core::JobStatus,
    /// Output format.
    pub format: String,
    /// Public download URL, once completed.
    pub download_url: Option<String>,
    /// Artifact size in bytes, once completed.
    pub file_size: Option<i64>,
    /// Page count, PDF jobs only.
    pub page_count: Option<i32>,
    /// Failure reason, once failed.
    pub error: Option<String>,
    /// Credits debited for this job, once accounted.
    pub credits_charged: Option<i64>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job's status last changed.
    pub updated_at: DateTime<Utc>,
    /// When the job reached a terminal state, if it has.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<cap_core::Job> for JobRecord {
    fn from(job: cap_core::Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            format: job.format,
            download_url: job.download_url,
            file_size: job.file_size,
            page_count: job.page_count,
            error: job.error,
            credits_charged: job.credits_charged,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status, the worst of the individual service checks.
    pub status: HealthState,
    /// Per-dependency health.
    pub services: HealthServices,
    /// Server time the check was performed at.
    pub timestamp: DateTime<Utc>,
}

/// Overall or per-dependency health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Everything is reachable.
    Healthy,
    /// A non-critical dependency is unreachable.
    Degraded,
    /// A critical dependency is unreachable.
    Unhealthy,
}

/// Individual dependency health flags backing [`HealthResponse::status`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthServices {
    /// Postgres connection pool.
    pub database: bool,
    /// Redis connection (rate limiting, key cache).
    pub redis: bool,
    /// Object storage reachability.
    pub storage: bool,
}

/// Response body for `GET /auth/csrf-token`.
#[derive(Debug, Clone, Serialize)]
pub struct CsrfTokenResponse {
    /// Freshly issued CSRF token, also set as a cookie.
    pub csrf_token: String,
}

/// `POST /auth/login` request body.
///
/// The daemon has no OAuth provider SDK of its own — this assumes the
/// profile has already been verified upstream (the dashboard's BFF
/// completing the provider's authorization-code exchange) and presents it
/// here for the find-or-create/session-issuance step only.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthLoginRequest {
    /// OAuth provider name, e.g. `"google"` or `"github"`.
    pub provider: String,
    /// The provider's own identifier for this identity.
    pub external_id: String,
    /// Email address reported by the provider.
    pub email: String,
    /// Display name reported by the provider, if any.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Avatar URL reported by the provider, if any.
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Response body for `POST /auth/login`.
#[derive(Debug, Clone, Serialize)]
pub struct OAuthLoginResponse {
    /// The resolved or newly created user.
    pub user: UserRecord,
    /// CSRF token for the new session, also set as a cookie alongside
    /// `cap_session`.
    pub csrf_token: String,
}

/// Public view of a [`cap_core::User`].
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    /// User identifier.
    pub id: Uuid,
    /// Tenant this user is scoped to.
    pub tenant_id: Uuid,
    /// Email address on file.
    pub email: String,
    /// Display name, if any.
    pub display_name: Option<String>,
    /// Avatar URL, if any.
    pub avatar_url: Option<String>,
}

impl From<cap_core::User> for UserRecord {
    fn from(user: cap_core::User) -> Self {
        Self {
            id: user.id,
            tenant_id: user.tenant_id,
            email: user.email,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_computes_total_pages_and_edges() {
        let p = Pagination::new(1, 20, 45);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(!p.has_prev);

        let p = Pagination::new(3, 20, 45);
        assert!(!p.has_next);
        assert!(p.has_prev);
    }

    #[test]
    fn pagination_zero_total_has_zero_pages() {
        let p = Pagination::new(1, 20, 0);
        assert_eq!(p.total_pages, 0);
        assert!(!p.has_next);
    }

    #[test]
    fn api_error_body_carries_context_as_details() {
        let err = CapError::new(ErrorCode::QuotaExceeded, "over budget")
            .with_context("used_credits", 249)
            .with_context("monthly_credits", 250);
        let body = ApiErrorBody::from(&err);
        assert_eq!(body.code, ErrorCode::QuotaExceeded);
        assert_eq!(body.details["used_credits"], serde_json::json!(249));
    }

    #[test]
    fn api_error_into_response_maps_status() {
        let err = ApiError(CapError::new(ErrorCode::ScreenshotNotFound, "gone"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn rate_limited_response_carries_retry_after_header() {
        let err = ApiError(
            CapError::new(ErrorCode::RateLimitExceeded, "slow down")
                .with_context("retry_after_secs", 30),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "30"
        );
    }

    #[test]
    fn screenshot_create_request_parses_camel_case_flags() {
        let body = serde_json::json!({
            "url": "https://example.com",
            "format": "png",
            "width": 1280,
            "height": 720,
            "async": true,
            "noStore": false
        });
        let req: ScreenshotCreateRequest = serde_json::from_value(body).unwrap();
        assert!(req.run_async);
        assert!(!req.no_store);
        assert_eq!(req.options.url, "https://example.com");
    }

    #[test]
    fn screenshot_create_request_defaults_flags_to_false() {
        let body = serde_json::json!({
            "url": "https://example.com",
            "format": "png",
            "width": 1280,
            "height": 720
        });
        let req: ScreenshotCreateRequest = serde_json::from_value(body).unwrap();
        assert!(!req.run_async);
        assert!(!req.no_store);
        assert!(req.webhook_url.is_none());
    }

    #[test]
    fn pdf_create_request_parses_html_mode() {
        let body = serde_json::json!({
            "html": "<html></html>",
            "page_size": "A4"
        });
        let req: PdfCreateRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.options.html.as_deref(), Some("<html></html>"));
        assert!(req.options.url.is_none());
    }
}
