// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP handlers: the resource endpoints (§4.11), the billing webhook
//! (§4.9/§4.10), health (§12), and CSRF-token issuance (§12).
//!
//! The create handlers implement three distinct branches per §4.11: async
//! (enqueue and return 202), sync+noStore (render inline, stream bytes,
//! never touch the database or object store), and sync+store (the
//! default: render inline, upload, debit, and return the full record).
//! The render/upload/debit/complete sequence shared by sync+store and the
//! worker loop lives in [`crate::worker::execute_and_persist`] so neither
//! path duplicates it.

use crate::api::{
    ApiEnvelope, ApiError, ApiResult, CsrfTokenResponse, HealthResponse, HealthServices,
    HealthState, JobListQuery, JobRecord, OAuthLoginRequest, OAuthLoginResponse, Pagination,
    PdfCreateRequest, ScreenshotCreateRequest, UserRecord,
};
use crate::auth::{generate_csrf_token, AuthContext, SESSION_DEFAULT_LIFETIME_SECS};
use crate::middleware::{extract_session_cookie, SESSION_COOKIE_NAME};
use crate::validation;
use crate::worker::{execute_and_persist, RenderRequest};
use crate::AppState;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cap_core::{JobKind, JobStatus};
use cap_error::{CapError, ErrorCode};
use cap_queue::QueueName;
use cap_ssrf::validate_url;
use cap_validate::RequestValidator;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) fn map_db_err(err: cap_db::DbError) -> CapError {
    match err {
        cap_db::DbError::InsufficientCredits { required, available } => {
            CapError::new(ErrorCode::QuotaExceeded, "insufficient credits for this operation")
                .with_context("required", required)
                .with_context("available", available)
        }
        cap_db::DbError::NotFound => CapError::new(ErrorCode::Internal, "expected row was missing"),
        other => CapError::new(ErrorCode::Internal, "database operation failed").with_source(other),
    }
}

pub(crate) fn map_storage_err(err: cap_storage::StorageError) -> CapError {
    CapError::new(ErrorCode::StorageError, "object storage operation failed").with_source(err)
}

pub(crate) fn map_ssrf_err(err: cap_ssrf::SsrfError) -> CapError {
    CapError::new(ErrorCode::InvalidUrl, err.to_string())
}

pub(crate) fn map_queue_err(err: cap_queue::QueueError) -> CapError {
    CapError::new(ErrorCode::Internal, "queue operation failed").with_source(err)
}

fn validation_err(errors: Vec<String>) -> CapError {
    CapError::new(ErrorCode::ValidationError, "request failed validation")
        .with_context("errors", serde_json::json!(errors))
}

fn not_found(kind: JobKind) -> CapError {
    match kind {
        JobKind::Screenshot => CapError::new(ErrorCode::ScreenshotNotFound, "no such screenshot job"),
        JobKind::Pdf => CapError::new(ErrorCode::PdfNotFound, "no such PDF job"),
    }
}

fn request_id_of(headers: &HeaderMap) -> Uuid {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn absolute_download_url(headers: &HeaderMap, kind: JobKind, id: Uuid) -> String {
    let scheme = if headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        == Some("https")
    {
        "https"
    } else {
        "http"
    };
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let plural = match kind {
        JobKind::Screenshot => "screenshots",
        JobKind::Pdf => "pdfs",
    };
    format!("{scheme}://{host}/v1/{plural}/{id}/download")
}

fn registrable_domain(url: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
}

fn url_hash(url: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Shared create-request plumbing
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn handle_create(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    auth: &AuthContext,
    kind: JobKind,
    render_req: RenderRequest,
    run_async: bool,
    no_store: bool,
    webhook_url: Option<String>,
) -> ApiResult<Response> {
    if run_async && no_store {
        return Err(CapError::new(
            ErrorCode::ValidationError,
            "'async' and 'noStore' are mutually exclusive",
        )
        .into());
    }

    let request_id = request_id_of(headers);
    let queue_name = match kind {
        JobKind::Screenshot => QueueName::Screenshot,
        JobKind::Pdf => QueueName::Pdf,
    };

    let tenant = state
        .tenants
        .apply_rollover_if_due(auth.tenant_id, Utc::now())
        .await
        .map_err(map_db_err)?;

    let event_type = render_req.event_type();
    let cost = cap_billing::cost_for(event_type);
    let quota = cap_billing::BillingQuota {
        monthly_credits: tenant.monthly_credits,
        used_credits: tenant.used_credits,
    };
    quota.precheck(cost).map_err(|err| {
        let cap_billing::BillingError::InsufficientQuota { required, remaining } = err;
        CapError::new(ErrorCode::QuotaExceeded, "monthly credit budget exhausted")
            .with_context("required", required)
            .with_context("remaining", remaining)
    })?;

    let source_url = render_req.source_url();
    let url_domain = source_url.as_deref().and_then(registrable_domain);
    let hash = source_url.as_deref().map(url_hash);
    let retention = chrono::Duration::days(state.config.retention_days as i64);

    if run_async {
        let new_job = cap_db::NewJob {
            tenant_id: auth.tenant_id,
            kind,
            source_kind: render_req.source_kind(),
            source_url: source_url.clone(),
            format: render_req.format(),
            options: render_req.persisted_options_json(),
            url_hash: hash,
            url_domain,
            webhook_url,
            expires_at: Utc::now() + retention,
        };
        let job = state.jobs.create(new_job).await.map_err(map_db_err)?;

        let payload = serde_json::to_value(crate::worker::QueuePayload {
            job_id: job.id,
            tenant_id: auth.tenant_id,
            options: render_req.options_json(),
        })
        .unwrap_or(serde_json::Value::Null);

        let mut queue = state.queue.lock().await;
        match kind {
            JobKind::Screenshot => queue.add_screenshot_job(payload, 5),
            JobKind::Pdf => queue.add_pdf_job(payload, 5),
        }
        .map_err(map_queue_err)?;
        drop(queue);

        let envelope = ApiEnvelope::ok(JobRecord::from(job), request_id, None);
        return Ok((StatusCode::ACCEPTED, Json(envelope)).into_response());
    }

    if no_store {
        let output = crate::worker::render(state.engine.as_ref(), &render_req)
            .await
            .map_err(ApiError)?;

        let metadata = serde_json::json!({ "url_domain": url_domain });
        state
            .tenants
            .debit_credits_and_record_usage(auth.tenant_id, None, event_type, cost, metadata)
            .await
            .map_err(map_db_err)?;

        let mut response = output.bytes.into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, output.content_type.parse().unwrap());
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
        return Ok(response);
    }

    let new_job = cap_db::NewJob {
        tenant_id: auth.tenant_id,
        kind,
        source_kind: render_req.source_kind(),
        source_url: source_url.clone(),
        format: render_req.format(),
        options: render_req.persisted_options_json(),
        url_hash: hash,
        url_domain,
        webhook_url: None,
        expires_at: Utc::now() + retention,
    };
    let job = state.jobs.create(new_job).await.map_err(map_db_err)?;
    let download_url = absolute_download_url(headers, kind, job.id);

    match execute_and_persist(state, job.id, auth.tenant_id, &render_req, &download_url).await {
        Ok(completed) => {
            let envelope = ApiEnvelope::ok(JobRecord::from(completed), request_id, None);
            Ok((StatusCode::CREATED, Json(envelope)).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

fn validate_ssrf_if_url(state: &AppState, url: Option<&str>) -> Result<(), CapError> {
    if let Some(url) = url {
        validate_url(url, &state.ssrf_policy).map_err(map_ssrf_err)?;
    }
    Ok(())
}

async fn list_jobs(
    state: &Arc<AppState>,
    auth: &AuthContext,
    query: &JobListQuery,
    kind: JobKind,
    request_id: Uuid,
) -> ApiResult<Response> {
    let params = validation::validate_list_query(query).map_err(ApiError)?;
    let (jobs, total) = state
        .jobs
        .list_for_tenant(
            auth.tenant_id,
            params.status,
            Some(kind),
            params.sort_by,
            params.ascending,
            params.limit as i64,
            params.offset(),
        )
        .await
        .map_err(map_db_err)?;
    let records: Vec<JobRecord> = jobs.into_iter().map(JobRecord::from).collect();
    let pagination = Pagination::new(params.page, params.limit, total);
    let envelope = ApiEnvelope::ok(records, request_id, Some(pagination));
    Ok(Json(envelope).into_response())
}

async fn get_job(
    state: &Arc<AppState>,
    auth: &AuthContext,
    id: Uuid,
    kind: JobKind,
    request_id: Uuid,
) -> ApiResult<Response> {
    let job = state
        .jobs
        .get_owned(id, auth.tenant_id)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| not_found(kind))?;
    let envelope = ApiEnvelope::ok(JobRecord::from(job), request_id, None);
    Ok(Json(envelope).into_response())
}

async fn delete_job(state: &Arc<AppState>, auth: &AuthContext, id: Uuid, kind: JobKind) -> ApiResult<Response> {
    let deleted = state.jobs.delete_owned(id, auth.tenant_id).await.map_err(map_db_err)?;
    if !deleted {
        return Err(not_found(kind).into());
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn download_job(
    state: &Arc<AppState>,
    auth: &AuthContext,
    id: Uuid,
    kind: JobKind,
) -> ApiResult<Response> {
    let job = state
        .jobs
        .get_owned(id, auth.tenant_id)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| not_found(kind))?;

    if job.status != JobStatus::Completed {
        return Err(not_found(kind).into());
    }

    let artifact = state
        .artifacts
        .get_by_job(id, auth.tenant_id)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| not_found(kind))?;

    let bytes = state.storage.get(&artifact.storage_key).await.map_err(map_storage_err)?;

    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, artifact.content_type.parse().unwrap());
    Ok(response)
}

// ---------------------------------------------------------------------------
// Screenshots
// ---------------------------------------------------------------------------

/// `POST /v1/screenshots`
pub async fn create_screenshot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Json(body): Json<ScreenshotCreateRequest>,
) -> ApiResult<Response> {
    RequestValidator::validate_screenshot(&body.options).map_err(validation_err)?;
    validate_ssrf_if_url(&state, Some(&body.options.url)).map_err(ApiError)?;

    let render_req = RenderRequest::Screenshot(body.options);
    handle_create(
        &state,
        &headers,
        &auth,
        JobKind::Screenshot,
        render_req,
        body.run_async,
        body.no_store,
        body.webhook_url,
    )
    .await
}

/// `GET /v1/screenshots`
pub async fn list_screenshots(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Response> {
    list_jobs(&state, &auth, &query, JobKind::Screenshot, request_id_of(&headers)).await
}

/// `GET /v1/screenshots/{id}`
pub async fn get_screenshot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    get_job(&state, &auth, id, JobKind::Screenshot, request_id_of(&headers)).await
}

/// `DELETE /v1/screenshots/{id}`
pub async fn delete_screenshot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    delete_job(&state, &auth, id, JobKind::Screenshot).await
}

/// `GET /v1/screenshots/{id}/download`
pub async fn download_screenshot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    download_job(&state, &auth, id, JobKind::Screenshot).await
}

// ---------------------------------------------------------------------------
// PDFs
// ---------------------------------------------------------------------------

/// `POST /v1/pdfs`
pub async fn create_pdf(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Json(body): Json<PdfCreateRequest>,
) -> ApiResult<Response> {
    RequestValidator::validate_pdf(&body.options).map_err(validation_err)?;
    validate_ssrf_if_url(&state, body.options.url.as_deref()).map_err(ApiError)?;

    let render_req = RenderRequest::Pdf(body.options);
    handle_create(
        &state,
        &headers,
        &auth,
        JobKind::Pdf,
        render_req,
        body.run_async,
        body.no_store,
        body.webhook_url,
    )
    .await
}

/// `GET /v1/pdfs`
pub async fn list_pdfs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Response> {
    list_jobs(&state, &auth, &query, JobKind::Pdf, request_id_of(&headers)).await
}

/// `GET /v1/pdfs/{id}`
pub async fn get_pdf(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    get_job(&state, &auth, id, JobKind::Pdf, request_id_of(&headers)).await
}

/// `DELETE /v1/pdfs/{id}`
pub async fn delete_pdf(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    delete_job(&state, &auth, id, JobKind::Pdf).await
}

/// `GET /v1/pdfs/{id}/download`
pub async fn download_pdf(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    download_job(&state, &auth, id, JobKind::Pdf).await
}

// ---------------------------------------------------------------------------
// Billing webhook
// ---------------------------------------------------------------------------

const SIGNATURE_HEADER: &str = "x-billing-signature";

/// `POST /v1/billing/webhook`
///
/// Provider retries are expected: the idempotency gate is
/// [`cap_db::WebhookEventRepository::record_if_new`], keyed on the
/// provider's own event id, not anything derived from the payload.
pub async fn billing_webhook(State(state): State<Arc<AppState>>, headers: HeaderMap, body: axum::body::Bytes) -> ApiResult<Response> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CapError::new(ErrorCode::ValidationError, "missing signature header"))?;

    state
        .webhook_verifier
        .verify(&body, signature, Utc::now())
        .map_err(|err| CapError::new(ErrorCode::ValidationError, err.to_string()))?;

    let envelope: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| CapError::new(ErrorCode::ValidationError, "body is not valid JSON"))?;

    let provider_event_id = envelope
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CapError::new(ErrorCode::ValidationError, "missing 'id' field"))?;
    let event_type = envelope
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CapError::new(ErrorCode::ValidationError, "missing 'type' field"))?;
    let data_object = envelope
        .get("data")
        .and_then(|d| d.get("object"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let (event, is_new) = state
        .webhook_events
        .record_if_new(provider_event_id, event_type, envelope.clone())
        .await
        .map_err(map_db_err)?;

    if is_new {
        apply_billing_event(&state, event_type, &data_object).await?;
        state.webhook_events.mark_processed(event.id).await.map_err(map_db_err)?;
    }

    Ok(StatusCode::OK.into_response())
}

async fn apply_billing_event(state: &AppState, event_type: &str, payload: &serde_json::Value) -> ApiResult<()> {
    let action = cap_reconciler::classify_event(event_type, payload)
        .map_err(|err| CapError::new(ErrorCode::ValidationError, err.to_string()))?;

    match action {
        cap_reconciler::BillingAction::ActivateSubscription {
            provider_customer_ref,
            subscription_provider_ref,
            tier,
        } => {
            let tenant = state
                .tenants
                .get_by_provider_customer_ref(&provider_customer_ref)
                .await
                .map_err(map_db_err)?;
            let monthly_credits = state
                .config
                .tiers
                .get(tier.as_str())
                .map(|t| t.monthly_credits as i64)
                .unwrap_or(0);
            state
                .subscriptions
                .upsert_active(tenant.id, &provider_customer_ref, &subscription_provider_ref, tier)
                .await
                .map_err(map_db_err)?;
            state
                .tenants
                .set_tier_and_reset_budget(tenant.id, tier, monthly_credits, Utc::now())
                .await
                .map_err(map_db_err)?;
            state.tenants.set_subscription_active(tenant.id, true).await.map_err(map_db_err)?;
        }
        cap_reconciler::BillingAction::CancelSubscription { provider_customer_ref } => {
            let tenant = state
                .tenants
                .get_by_provider_customer_ref(&provider_customer_ref)
                .await
                .map_err(map_db_err)?;
            state
                .subscriptions
                .set_status(&provider_customer_ref, cap_core::SubscriptionStatus::Canceled)
                .await
                .map_err(map_db_err)?;
            let free_credits = state
                .config
                .tiers
                .get(cap_core::Tier::Free.as_str())
                .map(|t| t.monthly_credits as i64)
                .unwrap_or(0);
            state
                .tenants
                .set_tier_and_reset_budget(tenant.id, cap_core::Tier::Free, free_credits, Utc::now())
                .await
                .map_err(map_db_err)?;
            state.tenants.set_subscription_active(tenant.id, false).await.map_err(map_db_err)?;
        }
        cap_reconciler::BillingAction::MarkPastDue { provider_customer_ref } => {
            state
                .subscriptions
                .set_status(&provider_customer_ref, cap_core::SubscriptionStatus::PastDue)
                .await
                .map_err(map_db_err)?;
        }
        cap_reconciler::BillingAction::Noop => {}
        cap_reconciler::BillingAction::Unhandled { event_type } => {
            tracing::info!(event_type, "ignoring unhandled billing webhook event type");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Health & CSRF
// ---------------------------------------------------------------------------

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = state.tenants.get(Uuid::nil()).await;
    let database_ok = !matches!(database, Err(cap_db::DbError::Sqlx(_)));

    let redis_ok = state.rate_limiter.check("health:ping", u64::MAX, 1).await.is_ok();

    let storage_ok = state.storage.exists("health/ping").await.is_ok();

    let status = if database_ok && redis_ok && storage_ok {
        HealthState::Healthy
    } else if database_ok {
        HealthState::Degraded
    } else {
        HealthState::Unhealthy
    };

    let body = HealthResponse {
        status,
        services: HealthServices {
            database: database_ok,
            redis: redis_ok,
            storage: storage_ok,
        },
        timestamp: Utc::now(),
    };

    let http_status = match status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body)).into_response()
}

/// `GET /auth/csrf-token`
pub async fn csrf_token(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let session_id = extract_session_cookie(&headers)
        .ok_or_else(|| CapError::new(ErrorCode::AuthenticationRequired, "no session cookie presented"))?;
    let session = state
        .sessions
        .get(session_id)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| CapError::new(ErrorCode::AuthenticationRequired, "session not found"))?;
    if session.is_expired(Utc::now()) {
        return Err(CapError::new(ErrorCode::AuthenticationRequired, "session expired").into());
    }
    Ok(Json(CsrfTokenResponse { csrf_token: session.csrf_token }).into_response())
}

/// `POST /auth/login`
///
/// Resolves an already-verified OAuth provider profile to a user (§4.2):
/// link by `(provider, external_id)`, fall back to `email`, or create a new
/// Tenant and User. Mints a fresh session and sets it as a cookie alongside
/// the session's CSRF token.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OAuthLoginRequest>,
) -> ApiResult<Response> {
    if body.provider.is_empty() || body.external_id.is_empty() || body.email.is_empty() {
        return Err(CapError::new(
            ErrorCode::ValidationError,
            "provider, external_id, and email are required",
        )
        .into());
    }

    let monthly_credits = state
        .config
        .tiers
        .get(cap_core::Tier::Free.as_str())
        .map(|t| t.monthly_credits as i64)
        .unwrap_or(0);

    let profile = cap_db::OAuthProfile {
        provider: &body.provider,
        external_id: &body.external_id,
        email: &body.email,
        display_name: body.display_name.as_deref(),
        avatar_url: body.avatar.as_deref(),
    };

    let user = state
        .users
        .find_or_create_for_oauth(&profile, monthly_credits, Utc::now())
        .await
        .map_err(map_db_err)?;

    let csrf_token = generate_csrf_token();
    let expires_at = Utc::now() + chrono::Duration::seconds(SESSION_DEFAULT_LIFETIME_SECS);
    let session = state
        .sessions
        .create(user.tenant_id, user.id, &csrf_token, expires_at)
        .await
        .map_err(map_db_err)?;

    let envelope = OAuthLoginResponse {
        user: UserRecord::from(user),
        csrf_token: session.csrf_token.clone(),
    };

    let mut response = Json(envelope).into_response();
    let cookie = format!(
        "{SESSION_COOKIE_NAME}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={SESSION_DEFAULT_LIFETIME_SECS}",
        session.id,
    );
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie.parse().unwrap());
    Ok(response)
}
