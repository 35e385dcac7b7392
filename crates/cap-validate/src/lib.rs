// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for screenshot and PDF render options.
//!
//! Validation here is purely structural (lengths, enums, ranges, mutually
//! exclusive fields) and accumulates every problem found rather than
//! failing fast, so a caller sees every field they need to fix in one
//! response. SSRF-safety of the target URL itself is a separate concern,
//! handled by `cap-ssrf`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cap_json_guard::{JsonGuardLimits, validate_json_object};
use serde::{Deserialize, Serialize};

/// Maximum allowed length of a target URL.
const MAX_URL_LENGTH: usize = 8_192;

/// Maximum allowed length of raw HTML submitted for PDF rendering.
const MAX_HTML_LENGTH: usize = 5_000_000;

/// Minimum/maximum allowed viewport dimension, in pixels.
const MIN_DIMENSION: u32 = 1;
const MAX_DIMENSION: u32 = 10_000;

/// Allowed screenshot output formats.
const VALID_SCREENSHOT_FORMATS: &[&str] = &["png", "jpeg", "webp"];

/// Allowed PDF page sizes.
const VALID_PDF_PAGE_SIZES: &[&str] = &["A4", "A3", "Letter", "Legal", "Tabloid"];

/// Depth/size limits applied to caller-supplied cookie and header maps.
const HEADER_GUARD_LIMITS: JsonGuardLimits = JsonGuardLimits::new(4, 100_000);

/// Screenshot capture options, as submitted by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotOptions {
    /// Target URL to capture.
    pub url: String,
    /// Capture the full scrollable page, not just the viewport.
    #[serde(default)]
    pub full_page: bool,
    /// Output image format.
    pub format: String,
    /// Viewport width in pixels.
    pub width: u32,
    /// Viewport height in pixels.
    pub height: u32,
    /// JPEG/WebP quality, 1-100. Ignored for PNG.
    #[serde(default)]
    pub quality: Option<u8>,
    /// Cookies to set before navigation.
    #[serde(default)]
    pub cookies: Option<serde_json::Value>,
    /// Extra HTTP headers to send with the navigation request.
    #[serde(default)]
    pub headers: Option<serde_json::Value>,
}

/// PDF render options, as submitted by a tenant.
///
/// Exactly one of `url` or `html` must be set (§4.5 mode invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfOptions {
    /// Target URL to render, mutually exclusive with `html`.
    #[serde(default)]
    pub url: Option<String>,
    /// Raw HTML to render, mutually exclusive with `url`.
    #[serde(default)]
    pub html: Option<String>,
    /// Render in landscape orientation.
    #[serde(default)]
    pub landscape: bool,
    /// Named page size.
    pub page_size: String,
    /// Whether to print background colors/images.
    #[serde(default)]
    pub print_background: bool,
    /// Cookies to set before navigation (only applies to `url` mode).
    #[serde(default)]
    pub cookies: Option<serde_json::Value>,
    /// Extra HTTP headers to send with the navigation request (only applies
    /// to `url` mode).
    #[serde(default)]
    pub headers: Option<serde_json::Value>,
}

/// Validates incoming capture requests, accumulating every error found.
pub struct RequestValidator;

impl RequestValidator {
    /// Validate a [`ScreenshotOptions`] payload.
    pub fn validate_screenshot(opts: &ScreenshotOptions) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        validate_url_field(&opts.url, &mut errors);

        if !VALID_SCREENSHOT_FORMATS.contains(&opts.format.as_str()) {
            errors.push(format!(
                "format must be one of {VALID_SCREENSHOT_FORMATS:?}, got '{}'",
                opts.format
            ));
        }

        validate_dimension("width", opts.width, &mut errors);
        validate_dimension("height", opts.height, &mut errors);

        if let Some(quality) = opts.quality
            && !(1..=100).contains(&quality)
        {
            errors.push("quality must be between 1 and 100".into());
        }

        validate_cookies_and_headers(&opts.cookies, &opts.headers, &mut errors);

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate a [`PdfOptions`] payload.
    pub fn validate_pdf(opts: &PdfOptions) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match (&opts.url, &opts.html) {
            (None, None) => errors.push("exactly one of 'url' or 'html' must be set".into()),
            (Some(_), Some(_)) => {
                errors.push("'url' and 'html' are mutually exclusive".into())
            }
            (Some(url), None) => validate_url_field(url, &mut errors),
            (None, Some(html)) => {
                if html.trim().is_empty() {
                    errors.push("html must not be empty".into());
                } else if html.len() > MAX_HTML_LENGTH {
                    errors.push(format!(
                        "html exceeds maximum length of {MAX_HTML_LENGTH} bytes"
                    ));
                }
            }
        }

        if !VALID_PDF_PAGE_SIZES.contains(&opts.page_size.as_str()) {
            errors.push(format!(
                "page_size must be one of {VALID_PDF_PAGE_SIZES:?}, got '{}'",
                opts.page_size
            ));
        }

        validate_cookies_and_headers(&opts.cookies, &opts.headers, &mut errors);

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn validate_url_field(url: &str, errors: &mut Vec<String>) {
    if url.is_empty() {
        errors.push("url must not be empty".into());
    } else if url.len() > MAX_URL_LENGTH {
        errors.push(format!("url exceeds maximum length of {MAX_URL_LENGTH} characters"));
    }
}

fn validate_dimension(field: &str, value: u32, errors: &mut Vec<String>) {
    if value < MIN_DIMENSION || value > MAX_DIMENSION {
        errors.push(format!(
            "{field} must be between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
        ));
    }
}

fn validate_cookies_and_headers(
    cookies: &Option<serde_json::Value>,
    headers: &Option<serde_json::Value>,
    errors: &mut Vec<String>,
) {
    if let Some(cookies) = cookies {
        for e in validate_json_object(cookies, HEADER_GUARD_LIMITS) {
            errors.push(format!("cookies: {e}"));
        }
    }
    if let Some(headers) = headers {
        for e in validate_json_object(headers, HEADER_GUARD_LIMITS) {
            errors.push(format!("headers: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_screenshot() -> ScreenshotOptions {
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

    fn valid_pdf() -> PdfOptions {
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

    #[test]
    fn valid_screenshot_accepted() {
        assert!(RequestValidator::validate_screenshot(&valid_screenshot()).is_ok());
    }

    #[test]
    fn empty_url_rejected() {
        let mut opts = valid_screenshot();
        opts.url = String::new();
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("url must not be empty")));
    }

    #[test]
    fn oversized_url_rejected() {
        let mut opts = valid_screenshot();
        opts.url = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("exceeds maximum length")));
    }

    #[test]
    fn unknown_format_rejected() {
        let mut opts = valid_screenshot();
        opts.format = "bmp".into();
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("format must be one of")));
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut opts = valid_screenshot();
        opts.width = 0;
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("width")));
    }

    #[test]
    fn oversized_dimension_rejected() {
        let mut opts = valid_screenshot();
        opts.height = 50_000;
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("height")));
    }

    #[test]
    fn quality_out_of_range_rejected() {
        let mut opts = valid_screenshot();
        opts.quality = Some(150);
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("quality")));
    }

    #[test]
    fn quality_in_range_accepted() {
        let mut opts = valid_screenshot();
        opts.quality = Some(85);
        assert!(RequestValidator::validate_screenshot(&opts).is_ok());
    }

    #[test]
    fn deeply_nested_cookies_rejected() {
        let mut opts = valid_screenshot();
        opts.cookies = Some(serde_json::json!({"a": {"b": {"c": {"d": {"e": 1}}}}}));
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cookies")));
    }

    #[test]
    fn valid_pdf_url_mode_accepted() {
        assert!(RequestValidator::validate_pdf(&valid_pdf()).is_ok());
    }

    #[test]
    fn valid_pdf_html_mode_accepted() {
        let mut opts = valid_pdf();
        opts.url = None;
        opts.html = Some("<html><body>hi</body></html>".into());
        assert!(RequestValidator::validate_pdf(&opts).is_ok());
    }

    #[test]
    fn pdf_with_neither_url_nor_html_rejected() {
        let mut opts = valid_pdf();
        opts.url = None;
        let errors = RequestValidator::validate_pdf(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("exactly one of")));
    }

    #[test]
    fn pdf_with_both_url_and_html_rejected() {
        let mut opts = valid_pdf();
        opts.html = Some("<html></html>".into());
        let errors = RequestValidator::validate_pdf(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn pdf_empty_html_rejected() {
        let mut opts = valid_pdf();
        opts.url = None;
        opts.html = Some("   ".into());
        let errors = RequestValidator::validate_pdf(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("html must not be empty")));
    }

    #[test]
    fn pdf_oversized_html_rejected() {
        let mut opts = valid_pdf();
        opts.url = None;
        opts.html = Some("a".repeat(MAX_HTML_LENGTH + 1));
        let errors = RequestValidator::validate_pdf(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("exceeds maximum length")));
    }

    #[test]
    fn pdf_unknown_page_size_rejected() {
        let mut opts = valid_pdf();
        opts.page_size = "A6".into();
        let errors = RequestValidator::validate_pdf(&opts).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("page_size")));
    }

    #[test]
    fn multiple_errors_all_accumulate() {
        let opts = ScreenshotOptions {
            url: String::new(),
            full_page: false,
            format: "bmp".into(),
            width: 0,
            height: 0,
            quality: Some(200),
            cookies: None,
            headers: None,
        };
        let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
        assert!(errors.len() >= 4);
    }

    proptest::proptest! {
        #[test]
        fn any_dimension_pair_within_bounds_is_accepted(
            w in MIN_DIMENSION..=MAX_DIMENSION,
            h in MIN_DIMENSION..=MAX_DIMENSION,
        ) {
            let mut opts = valid_screenshot();
            opts.width = w;
            opts.height = h;
            proptest::prop_assert!(RequestValidator::validate_screenshot(&opts).is_ok());
        }

        #[test]
        fn any_dimension_above_the_maximum_is_rejected(
            w in (MAX_DIMENSION + 1)..=(MAX_DIMENSION + 100_000),
        ) {
            let mut opts = valid_screenshot();
            opts.width = w;
            let errors = RequestValidator::validate_screenshot(&opts).unwrap_err();
            proptest::prop_assert!(errors.iter().any(|e| e.contains("width")));
        }
    }
}
