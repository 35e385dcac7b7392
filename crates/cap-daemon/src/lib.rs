// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane daemon for the capture control plane.
//!
//! Wires authentication, tier/IP rate limiting, CSRF, the render job
//! pipeline, and billing reconciliation into one Axum [`Router`] over the
//! shared [`AppState`]. The actual headless-browser farm and outbound
//! webhook delivery are external collaborators behind the [`engine`] and
//! [`webhook_sink`] seams respectively — this crate only owns the request
//! lifecycle around them.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod auth;
pub mod engine;
pub mod handlers;
pub mod middleware;
pub mod validation;
pub mod webhook_sink;
pub mod worker;

use axum::Router;
use axum::routing::{get, post};
use cap_config::AppConfig;
use cap_db::{
    ApiKeyRepository, ArtifactRepository, JobRepository, SessionRepository,
    SubscriptionRepository, TenantRepository, UsageRepository, UserRepository,
    WebhookEventRepository,
};
use cap_queue::QueueBridge;
use cap_ratelimit::{KeyCache, RateLimiter, RedisStore};
use cap_reconciler::SignatureVerifier;
use cap_ssrf::SsrfPolicy;
use cap_storage::ArtifactStore;
use engine::CaptureEngine;
use std::sync::Arc;
use tokio::sync::Mutex;
use webhook_sink::WebhookSink;

/// Shared state threaded through every handler and middleware.
///
/// Everything here is either cheaply `Clone`-able (the `sqlx`/`redis`
/// connection pools wrapped by each repository) or explicitly synchronised
/// (the in-process job queue), so the daemon hands out one `Arc<AppState>`
/// and never clones the struct itself.
pub struct AppState {
    /// Effective runtime configuration: tiers, retention, gateway trust.
    pub config: AppConfig,
    /// Tenant accounts, credit balances, tier membership.
    pub tenants: TenantRepository,
    /// API key records.
    pub api_keys: ApiKeyRepository,
    /// Dashboard login sessions.
    pub sessions: SessionRepository,
    /// Dashboard users and the OAuth find-or-create path.
    pub users: UserRepository,
    /// Render job state machine.
    pub jobs: JobRepository,
    /// Artifact metadata (object-store key, content type, size, expiry).
    pub artifacts: ArtifactRepository,
    /// Billable usage ledger.
    pub usage: UsageRepository,
    /// Idempotency ledger for inbound billing events.
    pub webhook_events: WebhookEventRepository,
    /// Local mirror of the billing provider's subscription objects.
    pub subscriptions: SubscriptionRepository,
    /// Redis-backed fixed-window rate limiter (tier and per-IP buckets).
    pub rate_limiter: RateLimiter<RedisStore>,
    /// Redis-backed API-key-hash to tenant-id cache.
    pub key_cache: KeyCache<RedisStore>,
    /// In-process priority queues bridging HTTP handlers to worker loops.
    /// Almost every [`QueueBridge`] method takes `&mut self`, so it's
    /// serialised behind a mutex rather than sharded per queue.
    pub queue: Mutex<QueueBridge>,
    /// Object storage for rendered artifacts.
    pub storage: ArtifactStore,
    /// SSRF policy applied to every submitted URL.
    pub ssrf_policy: SsrfPolicy,
    /// Billing webhook signature verifier.
    pub webhook_verifier: Box<dyn SignatureVerifier + Send + Sync>,
    /// Capture engine (the real headless-browser farm lives behind this
    /// seam — see [`engine`] module docs).
    pub engine: Box<dyn CaptureEngine>,
    /// Outbound completion-webhook sink.
    pub webhook_sink: Box<dyn WebhookSink>,
}

/// Build the full Axum [`Router`], with the admission pipeline (§4.4)
/// wired as middleware around the protected `/v1/*` resource routes, and
/// a lighter per-IP limit around the handful of unauthenticated endpoints.
pub fn build_app(state: Arc<AppState>) -> Router {
    let login = Router::new()
        .route("/auth/login", post(handlers::login))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::login_rate_limit_middleware,
        ));

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/csrf-token", get(handlers::csrf_token))
        .route("/v1/billing/webhook", post(handlers::billing_webhook))
        .merge(login)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::ip_rate_limit_middleware,
        ));

    let protected = Router::new()
        .route(
            "/v1/screenshots",
            post(handlers::create_screenshot).get(handlers::list_screenshots),
        )
        .route(
            "/v1/screenshots/{id}",
            get(handlers::get_screenshot).delete(handlers::delete_screenshot),
        )
        .route(
            "/v1/screenshots/{id}/download",
            get(handlers::download_screenshot),
        )
        .route(
            "/v1/pdfs",
            post(handlers::create_pdf).get(handlers::list_pdfs),
        )
        .route(
            "/v1/pdfs/{id}",
            get(handlers::get_pdf).delete(handlers::delete_pdf),
        )
        .route("/v1/pdfs/{id}/download", get(handlers::download_pdf))
        // Applied innermost-first: a request hits auth, then the tier
        // limiter, then CSRF, matching the admission order in §4.4.
        .layer(axum::middleware::from_fn(middleware::csrf_middleware))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::tier_rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum::middleware::from_fn(middleware::RequestLogger::layer))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(middleware::CorsConfig::default().to_cors_layer())
        .with_state(state)
}
