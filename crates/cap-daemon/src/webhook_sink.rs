// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound completion-webhook delivery (§4.7): fire a signed envelope at
//! the tenant's `webhook_url` once an async job reaches a terminal state.
//!
//! The daemon has no HTTP client in its dependency stack — the same
//! Non-goal boundary that keeps the real capture engine external to this
//! crate (`engine.rs`) applies to outbound delivery too. [`WebhookSink`] is
//! the seam a deployment wires a real client behind; [`NoopWebhookSink`]
//! and [`RecordingWebhookSink`] stand in for it here and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The envelope delivered to a tenant's `webhook_url` on job completion.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEnvelope {
    /// Event name, e.g. `"job.completed"` or `"job.failed"`.
    pub event: &'static str,
    /// When the envelope was generated.
    pub timestamp: DateTime<Utc>,
    /// The job record, as returned from the API.
    pub data: Value,
}

/// Delivers a [`WebhookEnvelope`] to a caller-supplied URL.
///
/// Delivery is always best-effort: a worker must not fail or retry the job
/// itself because a callback couldn't be reached, and must not let a slow
/// or hostile callback endpoint block the worker loop indefinitely.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    /// Attempt delivery once. Errors are logged by the caller, never
    /// propagated into the job's own state.
    async fn deliver(&self, webhook_url: &str, envelope: &WebhookEnvelope) -> Result<(), String>;
}

/// Discards every delivery. The default sink until a deployment wires a
/// real HTTP client behind [`WebhookSink`].
#[derive(Debug, Clone, Default)]
pub struct NoopWebhookSink;

#[async_trait]
impl WebhookSink for NoopWebhookSink {
    async fn deliver(&self, _webhook_url: &str, _envelope: &WebhookEnvelope) -> Result<(), String> {
        Ok(())
    }
}

/// Records every delivery attempt in memory instead of sending it, for
/// worker-loop integration tests that assert a webhook *would* have fired.
#[derive(Debug, Default)]
pub struct RecordingWebhookSink {
    deliveries: std::sync::Mutex<Vec<(String, WebhookEnvelope)>>,
}

impl RecordingWebhookSink {
    /// Snapshot of every `(webhook_url, envelope)` pair delivered so far.
    pub fn deliveries(&self) -> Vec<(String, WebhookEnvelope)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookSink for RecordingWebhookSink {
    async fn deliver(&self, webhook_url: &str, envelope: &WebhookEnvelope) -> Result<(), String> {
        self.deliveries
            .lock()
            .unwrap()
            .push((webhook_url.to_string(), envelope.clone()));
        Ok(())
    }
}

/// Build the envelope for a job that just reached a terminal state.
pub fn envelope_for(job: &cap_core::Job) -> WebhookEnvelope {
    let event = if job.status == cap_core::JobStatus::Completed {
        "job.completed"
    } else {
        "job.failed"
    };
    WebhookEnvelope {
        event,
        timestamp: Utc::now(),
        data: serde_json::to_value(crate::api::JobRecord::from(job.clone()))
            .unwrap_or(Value::Null),
    }
}

/// Unique delivery identifier, currently unused beyond giving the envelope
/// a stable shape to extend (e.g. a `delivery_id` header) without another
/// wire-format change.
pub fn delivery_id() -> Uuid {
    Uuid::new_v4()
}
