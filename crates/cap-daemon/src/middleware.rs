// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the capture control plane daemon: request-id
//! tagging, structured access logging, CORS, and the auth/CSRF/rate-limit
//! stages of the admission pipeline (§4.4).

use crate::AppState;
use crate::auth::{self, AuthContext, AuthSource};
use crate::api::ApiError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, Method, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use cap_error::{CapError, ErrorCode};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

/// Requests allowed per source IP within [`IP_RATE_LIMIT_WINDOW_SECS`], for
/// the unauthenticated endpoints (§4.3).
pub const IP_RATE_LIMIT_MAX: u64 = 20;
/// Fixed-window length, in seconds, for the per-IP rate limit.
pub const IP_RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// How long a source IP is locked out after exceeding
/// [`IP_RATE_LIMIT_MAX`], independent of the counter window rolling over.
pub const IP_BLOCKOUT_SECS: u64 = 300;
/// How long a tenant is locked out of its tier bucket after exceeding its
/// configured rate limit, independent of the counter window rolling over.
pub const TIER_BLOCKOUT_SECS: u64 = 60;
/// How long an identifier (email/IP) is locked out of the login endpoint
/// after repeated failed attempts.
pub const LOGIN_BLOCKOUT_SECS: u64 = 1800;
/// Requests allowed per identifier within [`LOGIN_RATE_LIMIT_WINDOW_SECS`]
/// before the login blockout engages.
pub const LOGIN_RATE_LIMIT_MAX: u64 = 5;
/// Fixed-window length, in seconds, for the login attempt limit.
pub const LOGIN_RATE_LIMIT_WINDOW_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Axum middleware that generates a [`RequestId`] for each request and sets
/// the `X-Request-Id` response header (§12 request-id propagation).
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&id.0.to_string()).unwrap(),
    );
    resp
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Axum middleware that logs method, path, status code, and duration for
/// each request using [`tracing`] structured fields. Never logs the raw
/// URL query string, headers, or body — only the path and the resolved
/// tenant id, matching the privacy invariant that binds persistence (§4.6)
/// to logging as well.
pub struct RequestLogger;

impl RequestLogger {
    /// Axum-compatible handler function.
    pub async fn layer(req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let start = std::time::Instant::now();

        let resp = next.run(req).await;

        let duration = start.elapsed();
        let status = resp.status().as_u16();
        let tenant_id = resp
            .extensions()
            .get::<AuthContext>()
            .map(|ctx| ctx.tenant_id.to_string())
            .unwrap_or_default();

        info!(
            http.method = %method,
            http.path = %path,
            http.status = status,
            http.duration_ms = duration.as_millis() as u64,
            tenant_id = %tenant_id,
            "request completed"
        );

        resp
    }
}

// ---------------------------------------------------------------------------
// Auth resolution (§4.4 step 1)
// ---------------------------------------------------------------------------

pub(crate) const SESSION_COOKIE_NAME: &str = "cap_session";
const CSRF_HEADER_NAME: &str = "x-csrf-token";

/// Resolves request credentials (trusted gateway, bearer API key, or
/// cookie session, in that order) and attaches an [`AuthContext`]
/// extension. Rejects with 401 if no source resolves.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    match resolve_auth_context(&state, &req).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => ApiError(err).into_response(),
    }
}

async fn resolve_auth_context(state: &AppState, req: &Request) -> Result<AuthContext, CapError> {
    let headers = req.headers();

    if let Some(gw) = auth::parse_gateway_headers(headers, &state.config.gateway)? {
        return auth::resolve_gateway(&gw, &state.tenants).await;
    }

    if let Some(raw_key) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::parse_bearer_credential)
    {
        return auth::resolve_api_key(raw_key, &state.api_keys, &state.tenants, &state.key_cache).await;
    }

    if let Some(session_id) = extract_session_cookie(headers) {
        return auth::resolve_session(session_id, &state.sessions, &state.tenants, Utc::now()).await;
    }

    Err(CapError::new(
        ErrorCode::AuthenticationRequired,
        "no credentials presented",
    ))
}

pub(crate) fn extract_session_cookie(headers: &axum::http::HeaderMap) -> Option<Uuid> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        if name == SESSION_COOKIE_NAME {
            value.parse::<Uuid>().ok()
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// CSRF (§4.4 step 3)
// ---------------------------------------------------------------------------

/// Enforces CSRF double-submit for cookie-session auth on unsafe methods.
/// A no-op for api-key/gateway sources and for `GET`/`HEAD`/`OPTIONS`, per
/// §4.4's allow-list.
pub async fn csrf_middleware(req: Request, next: Next) -> Response {
    let safe_method = matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS);
    if safe_method {
        return next.run(req).await;
    }

    if let Some(ctx) = req.extensions().get::<AuthContext>()
        && ctx.source == AuthSource::Session
    {
        let session_token = ctx.csrf_token.clone().unwrap_or_default();
        let presented = req
            .headers()
            .get(CSRF_HEADER_NAME)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if let Err(err) = auth::verify_csrf(&session_token, &presented) {
            return ApiError(err).into_response();
        }
    }

    next.run(req).await
}

// ---------------------------------------------------------------------------
// Tier rate limit (§4.4 step 2, §4.3)
// ---------------------------------------------------------------------------

/// Consumes one point against the caller's tier bucket and sets the
/// `X-RateLimit-*` response headers. Degrades open (lets the request
/// through, unheadered) if the rate-limit store itself is unreachable —
/// a cache-store outage should not take the whole API down.
pub async fn tier_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(ctx) = req.extensions().get::<AuthContext>().cloned() else {
        return next.run(req).await;
    };

    let tier_name = ctx.tier.as_str();
    let limits = state
        .config
        .tiers
        .get(tier_name)
        .or_else(|| state.config.tiers.get("FREE"))
        .cloned();

    let Some(limits) = limits else {
        return next.run(req).await;
    };

    let key = format!("ratelimit:tier:{}:{}", tier_name.to_lowercase(), ctx.tenant_id);
    match state
        .rate_limiter
        .check_with_blockout(
            &key,
            limits.rate_limit_points,
            limits.rate_limit_window_secs,
            TIER_BLOCKOUT_SECS,
        )
        .await
    {
        Ok(decision) => {
            let mut resp = if decision.allowed {
                next.run(req).await
            } else {
                let err = CapError::new(ErrorCode::RateLimitExceeded, "tier rate limit exceeded")
                    .with_context("retry_after_secs", serde_json::json!(decision.retry_after_secs))
                    .with_context("tier", serde_json::json!(tier_name));
                ApiError(err).into_response()
            };
            let headers = resp.headers_mut();
            insert_header(headers, "x-ratelimit-limit", decision.limit);
            insert_header(headers, "x-ratelimit-remaining", decision.remaining);
            if let Ok(v) = HeaderValue::from_str(tier_name) {
                headers.insert("x-ratelimit-tier", v);
            }
            resp
        }
        Err(err) => {
            tracing::warn!(error = %err, "rate-limit store unreachable, degrading open");
            next.run(req).await
        }
    }
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: u64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}

// ---------------------------------------------------------------------------
// IP rate limit (§4.3, unauthenticated endpoints)
// ---------------------------------------------------------------------------

/// Caps requests per source IP on endpoints that run ahead of (or without)
/// auth resolution — health, CSRF-token issuance, the billing webhook.
/// Degrades open on a store error, same as the tier limiter.
pub async fn ip_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let key = format!("ratelimit:ip:{}", addr.ip());
    match state
        .rate_limiter
        .check_with_blockout(
            &key,
            IP_RATE_LIMIT_MAX,
            IP_RATE_LIMIT_WINDOW_SECS,
            IP_BLOCKOUT_SECS,
        )
        .await
    {
        Ok(decision) if !decision.allowed => {
            let err = CapError::new(ErrorCode::IpRateLimitExceeded, "too many requests from this address")
                .with_context("retry_after_secs", serde_json::json!(decision.retry_after_secs));
            ApiError(err).into_response()
        }
        Ok(_) => next.run(req).await,
        Err(err) => {
            tracing::warn!(error = %err, "ip rate-limit store unreachable, degrading open");
            next.run(req).await
        }
    }
}

// ---------------------------------------------------------------------------
// Login rate limit (§4.2, §4.3)
// ---------------------------------------------------------------------------

/// Caps login attempts per source IP, with a long blockout once
/// [`LOGIN_RATE_LIMIT_MAX`] is exceeded — independent from the general
/// per-IP limiter since credential-stuffing against `/auth/login` warrants
/// a much longer lockout than a flood of read requests.
pub async fn login_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let key = format!("ratelimit:login:{}", addr.ip());
    match state
        .rate_limiter
        .check_with_blockout(
            &key,
            LOGIN_RATE_LIMIT_MAX,
            LOGIN_RATE_LIMIT_WINDOW_SECS,
            LOGIN_BLOCKOUT_SECS,
        )
        .await
    {
        Ok(decision) if !decision.allowed => {
            let err = CapError::new(ErrorCode::RateLimitExceeded, "too many login attempts")
                .with_context("retry_after_secs", serde_json::json!(decision.retry_after_secs));
            ApiError(err).into_response()
        }
        Ok(_) => next.run(req).await,
        Err(err) => {
            tracing::warn!(error = %err, "login rate-limit store unreachable, degrading open");
            next.run(req).await
        }
    }
}

// ---------------------------------------------------------------------------
// CorsConfig
// ---------------------------------------------------------------------------

/// Configuration for CORS headers.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Origins allowed to make cross-origin requests.
    pub allowed_origins: Vec<String>,
    /// HTTP methods allowed cross-origin.
    pub allowed_methods: Vec<String>,
    /// Request headers allowed cross-origin.
    pub allowed_headers: Vec<String>,
}

impl CorsConfig {
    /// Convert this configuration into a [`tower_http::cors::CorsLayer`].
    pub fn to_cors_layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();

        let methods: Vec<axum::http::Method> = self
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();

        let headers: Vec<axum::http::HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::list(methods))
            .allow_headers(AllowHeaders::list(headers))
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![],
            allowed_methods: vec![
                "GET".into(),
                "POST".into(),
                "DELETE".into(),
                "OPTIONS".into(),
            ],
            allowed_headers: vec![
                "authorization".into(),
                "content-type".into(),
                CSRF_HEADER_NAME.into(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_session_cookie_finds_named_cookie_among_others() {
        let mut headers = axum::http::HeaderMap::new();
        let id = Uuid::new_v4();
        headers.insert(
            header::COOKIE,
            format!("theme=dark; {SESSION_COOKIE_NAME}={id}; lang=en")
                .parse()
                .unwrap(),
        );
        assert_eq!(extract_session_cookie(&headers), Some(id));
    }

    #[test]
    fn extract_session_cookie_absent_returns_none() {
        let headers = axum::http::HeaderMap::new();
        assert_eq!(extract_session_cookie(&headers), None);
    }

    #[test]
    fn extract_session_cookie_rejects_non_uuid_value() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("{SESSION_COOKIE_NAME}=not-a-uuid").parse().unwrap(),
        );
        assert_eq!(extract_session_cookie(&headers), None);
    }

    #[test]
    fn default_cors_config_includes_csrf_header() {
        let cfg = CorsConfig::default();
        assert!(cfg.allowed_headers.iter().any(|h| h == CSRF_HEADER_NAME));
    }
}
