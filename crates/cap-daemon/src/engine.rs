// SPDX-License-Identifier: MIT OR Apache-2.0
//! The capture engine seam: given validated options, produce rendered
//! bytes. The real headless-browser farm is an external collaborator
//! (§1 Non-goals) — this module defines the trait the rest of the
//! daemon programs against, plus a deterministic mock used in tests and
//! local development.

use async_trait::async_trait;
use cap_error::{CapError, ErrorCode};
use cap_validate::{PdfOptions, ScreenshotOptions};

/// Bytes produced by a capture, plus the metadata the job record and the
/// HTTP response need.
#[derive(Debug, Clone)]
pub struct CaptureOutput {
    /// Rendered bytes.
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`, one of `cap_storage::ALLOWED_CONTENT_TYPES`.
    pub content_type: String,
    /// Page count, set only for PDF output.
    pub page_count: Option<i32>,
}

/// Where a PDF render's content comes from — mirrors the `source_kind`
/// tagged union in `cap_core::Job` but carries the actual payload rather
/// than just a discriminant.
#[derive(Debug, Clone)]
pub enum PdfSource {
    /// Render a live URL.
    Url(String),
    /// Render an inline HTML fragment. Never persisted (§4.6 privacy
    /// invariant); it only ever reaches this trait and the engine behind it.
    Html(String),
}

/// Produces screenshot and PDF bytes from validated render options.
///
/// Implementations are expected to enforce their own hard render
/// deadline (§5: a 60-second ceiling for synchronous requests) and
/// return [`ErrorCode::Timeout`]/[`ErrorCode::NavigationTimeout`] rather
/// than hang.
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    /// Capture a screenshot per `options`.
    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<CaptureOutput, CapError>;

    /// Render `source` to PDF per `options`.
    async fn pdf(&self, source: &PdfSource, options: &PdfOptions) -> Result<CaptureOutput, CapError>;
}

fn screenshot_content_type(format: &str) -> &'static str {
    match format {
        "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

/// Deterministic stand-in for the real browser farm. Returns small,
/// fixed placeholder bytes tagged with the requested content type, so
/// the rest of the pipeline (upload, debit, response shaping) can be
/// exercised without a real renderer.
#[derive(Debug, Clone, Default)]
pub struct MockEngine;

#[async_trait]
impl CaptureEngine for MockEngine {
    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<CaptureOutput, CapError> {
        if options.url.contains("force-engine-failure") {
            return Err(CapError::new(ErrorCode::BrowserError, "mock engine forced failure"));
        }
        Ok(CaptureOutput {
            bytes: format!("MOCK-SCREENSHOT:{}x{}", options.width, options.height).into_bytes(),
            content_type: screenshot_content_type(&options.format).to_string(),
            page_count: None,
        })
    }

    async fn pdf(&self, source: &PdfSource, options: &PdfOptions) -> Result<CaptureOutput, CapError> {
        let marker = match source {
            PdfSource::Url(url) if url.contains("force-engine-failure") => {
                return Err(CapError::new(ErrorCode::BrowserError, "mock engine forced failure"));
            }
            PdfSource::Url(url) => format!("MOCK-PDF-URL:{url}"),
            PdfSource::Html(html) => format!("MOCK-PDF-HTML:{}bytes", html.len()),
        };
        Ok(CaptureOutput {
            bytes: format!("{marker}:{}", options.page_size).into_bytes(),
            content_type: "application/pdf".to_string(),
            page_count: Some(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screenshot_opts() -> ScreenshotOptions {
        ScreenshotOptions {
            url: "https://example.com".into(),
            full_page: false,
            format: "png".into(),
            width: 1280,
            height: 720,
            quality: None,
            cookies: None,
            headers: None,
        }
    }

    fn pdf_opts() -> PdfOptions {
        PdfOptions {
            url: Some("https://example.com".into()),
            html: None,
            landscape: false,
            page_size: "A4".into(),
            print_background: false,
            cookies: None,
            headers: None,
        }
    }

    #[tokio::test]
    async fn mock_screenshot_reports_requested_content_type() {
        let mut opts = screenshot_opts();
        opts.format = "webp".into();
        let out = MockEngine.screenshot(&opts).await.unwrap();
        assert_eq!(out.content_type, "image/webp");
        assert!(out.page_count.is_none());
    }

    #[tokio::test]
    async fn mock_pdf_reports_one_page() {
        let out = MockEngine
            .pdf(&PdfSource::Url("https://example.com".into()), &pdf_opts())
            .await
            .unwrap();
        assert_eq!(out.content_type, "application/pdf");
        assert_eq!(out.page_count, Some(1));
    }

    #[tokio::test]
    async fn mock_pdf_html_source_never_echoes_raw_html_in_error_path() {
        let out = MockEngine
            .pdf(&PdfSource::Html("<h1>secret</h1>".into()), &pdf_opts())
            .await
            .unwrap();
        assert!(!String::from_utf8_lossy(&out.bytes).contains("secret"));
    }

    #[tokio::test]
    async fn mock_engine_can_be_forced_to_fail_for_error_path_tests() {
        let mut opts = screenshot_opts();
        opts.url = "https://force-engine-failure.example".into();
        let err = MockEngine.screenshot(&opts).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BrowserError);
    }
}
