// SPDX-License-Identifier: MIT OR Apache-2.0
//! The render pipeline's out-of-the-request-path half (§4.7, §12):
//! in-process worker loops draining [`cap_queue::QueueBridge`], plus the
//! background retention sweep.
//!
//! [`execute_and_persist`] is the render -> upload -> debit -> complete
//! sequence shared between an async job picked up here and the "sync +
//! store" creation branch in `handlers.rs`, so the two paths can't drift.

use crate::handlers::{map_db_err, map_storage_err};
use crate::webhook_sink;
use crate::AppState;
use cap_core::{JobKind, SourceKind, UsageEventType};
use cap_error::CapError;
use cap_queue::QueueName;
use cap_storage::{pdf_key, screenshot_key};
use cap_validate::{PdfOptions, ScreenshotOptions};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long a worker loop sleeps between polls of an empty queue.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum length a stored failure message is truncated to — a hostile or
/// buggy engine could otherwise stuff the job row with arbitrary-length
/// text sourced indirectly from the page being rendered.
const MAX_ERROR_LEN: usize = 500;

/// The job payload handed to a worker through [`cap_queue::QueueEntry`].
#[derive(Debug, Serialize, Deserialize)]
pub struct QueuePayload {
    /// The durable job row this queue entry corresponds to.
    pub job_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Validated render options, as JSON — `ScreenshotOptions` or
    /// `PdfOptions` depending on which named queue this entry came from.
    pub options: serde_json::Value,
}

/// A validated render request, kind-erased so the shared render/persist
/// path doesn't need two copies.
pub enum RenderRequest {
    /// A screenshot capture.
    Screenshot(ScreenshotOptions),
    /// A PDF render.
    Pdf(PdfOptions),
}

impl RenderRequest {
    /// The job kind this request corresponds to.
    pub fn job_kind(&self) -> JobKind {
        match self {
            Self::Screenshot(_) => JobKind::Screenshot,
            Self::Pdf(_) => JobKind::Pdf,
        }
    }

    /// The output format recorded on the job row.
    pub fn format(&self) -> String {
        match self {
            Self::Screenshot(opts) => opts.format.clone(),
            Self::Pdf(_) => "pdf".to_string(),
        }
    }

    /// The billable event type, e.g. distinguishing a full-page screenshot
    /// from a plain one.
    pub fn event_type(&self) -> UsageEventType {
        match self {
            Self::Screenshot(opts) if opts.full_page => UsageEventType::ScreenshotFullpage,
            Self::Screenshot(_) => UsageEventType::Screenshot,
            Self::Pdf(_) => UsageEventType::Pdf,
        }
    }

    /// Whether this request's source material is a URL or inline HTML.
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::Screenshot(_) => SourceKind::Url,
            Self::Pdf(opts) if opts.html.is_some() => SourceKind::Html,
            Self::Pdf(_) => SourceKind::Url,
        }
    }

    /// The source URL, when this request's source is a URL (never the
    /// inline HTML body).
    pub fn source_url(&self) -> Option<String> {
        match self {
            Self::Screenshot(opts) => Some(opts.url.clone()),
            Self::Pdf(opts) => opts.url.clone(),
        }
    }

    /// Serialize the full underlying options, including `html`/`cookies`/
    /// `headers` where present. Only ever used for the in-process queue
    /// payload a worker consumes — never for persistence. See
    /// [`Self::persisted_options_json`] for the column-safe projection.
    pub fn options_json(&self) -> serde_json::Value {
        match self {
            Self::Screenshot(opts) => serde_json::to_value(opts).unwrap_or(serde_json::Value::Null),
            Self::Pdf(opts) => serde_json::to_value(opts).unwrap_or(serde_json::Value::Null),
        }
    }

    /// The privacy-filtered projection of [`Self::options_json`] safe to
    /// write to the `jobs.options` column: `html`, `cookies`, and
    /// `headers` are stripped here, at the repository boundary, per the
    /// privacy invariant on `cap_core::Job`.
    pub fn persisted_options_json(&self) -> serde_json::Value {
        let mut value = self.options_json();
        if let Some(obj) = value.as_object_mut() {
            obj.remove("html");
            obj.remove("cookies");
            obj.remove("headers");
        }
        value
    }
}

/// Dispatch a validated request to the capture engine. Shared by
/// [`execute_and_persist`] and the "sync + noStore" create-handler branch,
/// which renders inline without ever inserting a job row.
pub(crate) async fn render(
    engine: &dyn crate::engine::CaptureEngine,
    req: &RenderRequest,
) -> Result<crate::engine::CaptureOutput, CapError> {
    match req {
        RenderRequest::Screenshot(opts) => engine.screenshot(opts).await,
        RenderRequest::Pdf(opts) => {
            let source = match (&opts.url, &opts.html) {
                (Some(url), _) => crate::engine::PdfSource::Url(url.clone()),
                (None, Some(html)) => crate::engine::PdfSource::Html(html.clone()),
                (None, None) => {
                    return Err(CapError::new(
                        cap_error::ErrorCode::ValidationError,
                        "PDF request has neither url nor html",
                    ));
                }
            };
            engine.pdf(&source, opts).await
        }
    }
}

fn extension_for_content_type(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpeg",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        _ => "png",
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        format!("{}...", &message[..MAX_ERROR_LEN])
    }
}

/// Render, upload, debit, and complete a job that has already been
/// inserted as `PENDING`.
///
/// On engine failure the job is transitioned to `FAILED` with a truncated
/// error message and the original [`CapError`] is returned to the caller
/// so it can shape an appropriate HTTP response (sync path) or fire a
/// `job.failed` webhook (worker path).
pub async fn execute_and_persist(
    state: &AppState,
    job_id: Uuid,
    tenant_id: Uuid,
    render_req: &RenderRequest,
    download_url: &str,
) -> Result<cap_core::Job, CapError> {
    state
        .jobs
        .mark_processing(job_id)
        .await
        .map_err(map_db_err)?;

    let output = match render(state.engine.as_ref(), render_req).await {
        Ok(output) => output,
        Err(err) => {
            let _ = state.jobs.mark_failed(job_id, &truncate(&err.message)).await;
            return Err(err);
        }
    };

    let ext = extension_for_content_type(&output.content_type);
    let key = match render_req.job_kind() {
        JobKind::Screenshot => screenshot_key(tenant_id, &job_id.to_string(), ext),
        JobKind::Pdf => pdf_key(tenant_id, &job_id.to_string(), ext),
    };
    let byte_size = output.bytes.len() as u64;

    if let Err(err) = state.storage.put(&key, output.bytes, &output.content_type).await {
        let mapped = map_storage_err(err);
        let _ = state.jobs.mark_failed(job_id, &truncate(&mapped.message)).await;
        return Err(mapped);
    }

    let retention = chrono::Duration::days(state.config.retention_days as i64);
    let expires_at = Utc::now() + retention;

    if let Err(err) = state
        .artifacts
        .create(job_id, tenant_id, &key, &output.content_type, byte_size, expires_at)
        .await
    {
        let mapped = map_db_err(err);
        let _ = state.jobs.mark_failed(job_id, &truncate(&mapped.message)).await;
        return Err(mapped);
    }

    let event_type = render_req.event_type();
    let cost = cap_billing::cost_for(event_type);
    let metadata = serde_json::json!({ "url_domain": registrable_domain(render_req) });

    if let Err(err) = state
        .tenants
        .debit_credits_and_record_usage(tenant_id, Some(job_id), event_type, cost, metadata)
        .await
    {
        let mapped = map_db_err(err);
        let _ = state.jobs.mark_failed(job_id, &truncate(&mapped.message)).await;
        return Err(mapped);
    }

    state
        .jobs
        .mark_completed(job_id, &key, download_url, byte_size as i64, output.page_count, cost)
        .await
        .map_err(map_db_err)
}

fn registrable_domain(render_req: &RenderRequest) -> Option<String> {
    render_req
        .source_url()
        .and_then(|url| url::Url::parse(&url).ok())
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Run one of the two worker loops forever, draining `queue_name` and
/// invoking [`execute_and_persist`] for each entry, firing a completion or
/// failure webhook afterward.
///
/// Intended to be spawned once per [`QueueName`] via `tokio::spawn` at
/// startup (`main.rs`) — there is no supervisor or backoff here beyond the
/// fixed [`POLL_INTERVAL`], matching the teacher's own worker-loop shape.
pub async fn run_worker(state: Arc<AppState>, queue_name: QueueName) {
    loop {
        let entry = {
            let mut queue = state.queue.lock().await;
            queue.dequeue_next(queue_name)
        };

        let Some(entry) = entry else {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        process_entry(&state, queue_name, entry).await;
    }
}

async fn process_entry(state: &Arc<AppState>, queue_name: QueueName, entry: cap_queue::QueueEntry) {
    let payload: QueuePayload = match serde_json::from_value(entry.payload.clone()) {
        Ok(p) => p,
        Err(err) => {
            tracing::error!(error = %err, entry_id = %entry.id, "malformed queue payload, dropping");
            let mut queue = state.queue.lock().await;
            let _ = queue.mark_failed(queue_name, &entry.id, "malformed queue payload");
            return;
        }
    };

    let render_req = match queue_name {
        QueueName::Screenshot => serde_json::from_value::<ScreenshotOptions>(payload.options.clone())
            .map(RenderRequest::Screenshot),
        QueueName::Pdf => {
            serde_json::from_value::<PdfOptions>(payload.options.clone()).map(RenderRequest::Pdf)
        }
    };

    let render_req = match render_req {
        Ok(r) => r,
        Err(err) => {
            tracing::error!(error = %err, job_id = %payload.job_id, "malformed render options, dropping");
            let _ = state.jobs.mark_failed(payload.job_id, "malformed render options").await;
            let mut queue = state.queue.lock().await;
            let _ = queue.mark_failed(queue_name, &entry.id, "malformed render options");
            return;
        }
    };

    let kind_plural = match render_req.job_kind() {
        JobKind::Screenshot => "screenshots",
        JobKind::Pdf => "pdfs",
    };
    let download_url = format!("/v1/{kind_plural}/{}/download", payload.job_id);

    let result = execute_and_persist(state, payload.job_id, payload.tenant_id, &render_req, &download_url).await;

    match result {
        Ok(job) => {
            {
                let mut queue = state.queue.lock().await;
                let _ = queue.mark_completed(queue_name, &entry.id, serde_json::json!({"job_id": job.id}));
            }
            deliver_webhook(state, &job).await;
        }
        Err(err) => {
            {
                let mut queue = state.queue.lock().await;
                let _ = queue.mark_failed(queue_name, &entry.id, err.message.clone());
            }
            if let Ok(Some(job)) = state.jobs.get_owned(payload.job_id, payload.tenant_id).await {
                deliver_webhook(state, &job).await;
            }
        }
    }
}

async fn deliver_webhook(state: &Arc<AppState>, job: &cap_core::Job) {
    let Some(url) = &job.webhook_url else {
        return;
    };
    let envelope = webhook_sink::envelope_for(job);
    if let Err(err) = state.webhook_sink.deliver(url, &envelope).await {
        tracing::warn!(error = %err, job_id = %job.id, "webhook delivery failed");
    }
}

/// Periodically deletes artifacts (and their object-store blobs) and job
/// rows whose retention horizon has passed (§12 Retention sweep).
///
/// Blob deletion is best-effort: a failure to delete from object storage
/// logs a warning but does not stop the metadata row from being removed,
/// since an orphaned blob is a storage-cost concern, not a correctness one.
pub async fn run_retention_sweep(state: Arc<AppState>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let now = Utc::now();

        match state.artifacts.list_expired(now, 100).await {
            Ok(artifacts) => {
                for artifact in artifacts {
                    if let Err(err) = state.storage.delete(&artifact.storage_key).await {
                        tracing::warn!(error = %err, artifact_id = %artifact.id, "failed to delete expired blob");
                    }
                    if let Err(err) = state.artifacts.delete(artifact.id).await {
                        tracing::warn!(error = %err, artifact_id = %artifact.id, "failed to delete artifact row");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "retention sweep: listing expired artifacts failed"),
        }

        match state.jobs.cleanup_expired(now).await {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "retention sweep removed expired job rows");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "retention sweep: cleanup_expired failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screenshot_opts(full_page: bool) -> ScreenshotOptions {
        ScreenshotOptions {
            url: "https://example.com/page".into(),
            full_page,
            format: "png".into(),
            width: 1280,
            height: 720,
            quality: None,
            cookies: None,
            headers: None,
        }
    }

    #[test]
    fn full_page_screenshot_costs_more_event_type() {
        let req = RenderRequest::Screenshot(screenshot_opts(true));
        assert_eq!(req.event_type(), UsageEventType::ScreenshotFullpage);
        let req = RenderRequest::Screenshot(screenshot_opts(false));
        assert_eq!(req.event_type(), UsageEventType::Screenshot);
    }

    #[test]
    fn pdf_source_kind_depends_on_html_presence() {
        let req = RenderRequest::Pdf(PdfOptions {
            url: None,
            html: Some("<p>hi</p>".into()),
            landscape: false,
            page_size: "A4".into(),
            print_background: false,
            cookies: None,
            headers: None,
        });
        assert_eq!(req.source_kind(), SourceKind::Html);
        assert!(req.source_url().is_none());
    }

    #[test]
    fn extension_matches_content_type() {
        assert_eq!(extension_for_content_type("image/jpeg"), "jpeg");
        assert_eq!(extension_for_content_type("application/pdf"), "pdf");
        assert_eq!(extension_for_content_type("image/png"), "png");
    }

    #[test]
    fn truncate_leaves_short_messages_alone() {
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn truncate_caps_long_messages() {
        let long = "x".repeat(MAX_ERROR_LEN + 50);
        let truncated = truncate(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn registrable_domain_extracts_host() {
        let req = RenderRequest::Screenshot(screenshot_opts(false));
        assert_eq!(registrable_domain(&req).as_deref(), Some("example.com"));
    }
}
