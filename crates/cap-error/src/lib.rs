//! Unified error taxonomy with stable error codes for the capture control plane.
//!
//! Every error raised by the control plane carries an [`ErrorCode`] (a
//! machine-readable, stable string tag), a human-readable message, an
//! optional cause chain, and arbitrary key-value context. Use the builder
//! returned by [`CapError::new`] to construct errors fluently. [`ErrorCode`]
//! also knows its own HTTP status via [`ErrorCode::http_status`], so the
//! daemon's handlers never hardcode a status/code pairing twice.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Request body or query failed schema/semantic validation.
    Validation,
    /// Caller presented no credential at all.
    AuthMissing,
    /// Caller presented a credential that does not resolve.
    AuthInvalid,
    /// Caller is authenticated but not permitted to act on the resource.
    Forbidden,
    /// Resource does not exist, or does not belong to the caller.
    NotFound,
    /// Caller exceeded a rate limit or quota.
    Throttled,
    /// The render pipeline itself failed.
    Rendering,
    /// A downstream call (database, cache, object store, queue) timed out.
    Timeout,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalid => "auth_invalid",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Throttled => "throttled",
            Self::Rendering => "rendering",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases, and maps to exactly one
/// HTTP status via [`ErrorCode::http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request body or query parameters failed validation.
    ValidationError,
    /// The supplied URL failed the SSRF-safety policy.
    InvalidUrl,
    /// A value had the right type but the wrong shape (e.g. bad duration string).
    InvalidFormat,
    /// No credential was presented at all.
    AuthenticationRequired,
    /// The presented API key does not resolve to an active tenant.
    InvalidApiKey,
    /// The presented API key exists but has been revoked.
    RevokedApiKey,
    /// The `Authorization` header is present but malformed.
    InvalidAuthFormat,
    /// Caller is authenticated but not permitted to perform the action.
    Forbidden,
    /// A CSRF token was required and none was presented.
    CsrfMissing,
    /// A CSRF token was presented but did not match the session's token.
    CsrfInvalid,
    /// No screenshot job matches the given id for this tenant.
    ScreenshotNotFound,
    /// No PDF job matches the given id for this tenant.
    PdfNotFound,
    /// Tenant's tier rate limit was exceeded.
    RateLimitExceeded,
    /// Unauthenticated caller's IP rate limit was exceeded.
    IpRateLimitExceeded,
    /// Tenant's monthly credit budget was exhausted.
    QuotaExceeded,
    /// The render pipeline failed for a reason other than a timeout.
    ProcessingFailed,
    /// The headless browser engine itself reported an error.
    BrowserError,
    /// The object store rejected an upload/download/delete.
    StorageError,
    /// A downstream call exceeded its deadline.
    Timeout,
    /// Page navigation specifically exceeded its deadline.
    NavigationTimeout,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationError | Self::InvalidUrl | Self::InvalidFormat => {
                ErrorCategory::Validation
            }
            Self::AuthenticationRequired => ErrorCategory::AuthMissing,
            Self::InvalidApiKey | Self::RevokedApiKey | Self::InvalidAuthFormat => {
                ErrorCategory::AuthInvalid
            }
            Self::Forbidden | Self::CsrfMissing | Self::CsrfInvalid => ErrorCategory::Forbidden,
            Self::ScreenshotNotFound | Self::PdfNotFound => ErrorCategory::NotFound,
            Self::RateLimitExceeded | Self::IpRateLimitExceeded | Self::QuotaExceeded => {
                ErrorCategory::Throttled
            }
            Self::ProcessingFailed | Self::BrowserError | Self::StorageError => {
                ErrorCategory::Rendering
            }
            Self::Timeout | Self::NavigationTimeout => ErrorCategory::Timeout,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"VALIDATION_ERROR"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::RevokedApiKey => "REVOKED_API_KEY",
            Self::InvalidAuthFormat => "INVALID_AUTH_FORMAT",
            Self::Forbidden => "FORBIDDEN",
            Self::CsrfMissing => "CSRF_MISSING",
            Self::CsrfInvalid => "CSRF_INVALID",
            Self::ScreenshotNotFound => "SCREENSHOT_NOT_FOUND",
            Self::PdfNotFound => "PDF_NOT_FOUND",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::IpRateLimitExceeded => "IP_RATE_LIMIT_EXCEEDED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ProcessingFailed => "PROCESSING_FAILED",
            Self::BrowserError => "BROWSER_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NavigationTimeout => "NAVIGATION_TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    /// The HTTP status this code renders as, per the response-envelope table.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationError | Self::InvalidUrl | Self::InvalidFormat => 400,
            Self::AuthenticationRequired
            | Self::InvalidApiKey
            | Self::RevokedApiKey
            | Self::InvalidAuthFormat => 401,
            Self::Forbidden | Self::CsrfMissing | Self::CsrfInvalid => 403,
            Self::ScreenshotNotFound | Self::PdfNotFound => 404,
            Self::RateLimitExceeded | Self::IpRateLimitExceeded | Self::QuotaExceeded => 429,
            Self::Timeout | Self::NavigationTimeout => 504,
            Self::ProcessingFailed | Self::BrowserError | Self::StorageError | Self::Internal => {
                500
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CapError
// ---------------------------------------------------------------------------

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use cap_error::{CapError, ErrorCode};
///
/// let err = CapError::new(ErrorCode::RateLimitExceeded, "too many requests")
///     .with_context("tenant_id", "ten_123")
///     .with_context("retry_after_secs", 42);
/// ```
pub struct CapError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics and the `details` field.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CapError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.http_status()`.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Debug for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CapError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`CapError`] (without the opaque source),
/// matching the `{code, message, details}` shape of the response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context, rendered as the envelope's `details` field.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any. Not part of the
    /// public envelope; kept for server-side log correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&CapError> for CapErrorDto {
    fn from(err: &CapError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<CapErrorDto> for CapError {
    fn from(dto: CapErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All error codes for exhaustive iteration in tests.
    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::ValidationError,
        ErrorCode::InvalidUrl,
        ErrorCode::InvalidFormat,
        ErrorCode::AuthenticationRequired,
        ErrorCode::InvalidApiKey,
        ErrorCode::RevokedApiKey,
        ErrorCode::InvalidAuthFormat,
        ErrorCode::Forbidden,
        ErrorCode::CsrfMissing,
        ErrorCode::CsrfInvalid,
        ErrorCode::ScreenshotNotFound,
        ErrorCode::PdfNotFound,
        ErrorCode::RateLimitExceeded,
        ErrorCode::IpRateLimitExceeded,
        ErrorCode::QuotaExceeded,
        ErrorCode::ProcessingFailed,
        ErrorCode::BrowserError,
        ErrorCode::StorageError,
        ErrorCode::Timeout,
        ErrorCode::NavigationTimeout,
        ErrorCode::Internal,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = CapError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = CapError::new(ErrorCode::ScreenshotNotFound, "no such screenshot");
        assert_eq!(err.to_string(), "[SCREENSHOT_NOT_FOUND] no such screenshot");
    }

    #[test]
    fn display_with_context() {
        let err = CapError::new(ErrorCode::RateLimitExceeded, "too many requests")
            .with_context("retry_after_secs", 42);
        let s = err.to_string();
        assert!(s.starts_with("[RATE_LIMIT_EXCEEDED] too many requests"));
        assert!(s.contains("retry_after_secs"));
        assert!(s.contains("42"));
    }

    #[test]
    fn debug_impl() {
        let err = CapError::new(ErrorCode::Forbidden, "nope");
        let dbg = format!("{err:?}");
        assert!(dbg.contains("Forbidden"));
        assert!(dbg.contains("nope"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "row missing");
        let err = CapError::new(ErrorCode::Internal, "lookup failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("row missing"));
    }

    // -- Error code categorization & HTTP mapping ------------------------

    #[test]
    fn validation_codes_categorised_and_400() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::InvalidUrl,
            ErrorCode::InvalidFormat,
        ] {
            assert_eq!(code.category(), ErrorCategory::Validation);
            assert_eq!(code.http_status(), 400);
        }
    }

    #[test]
    fn auth_missing_is_401() {
        assert_eq!(
            ErrorCode::AuthenticationRequired.category(),
            ErrorCategory::AuthMissing
        );
        assert_eq!(ErrorCode::AuthenticationRequired.http_status(), 401);
    }

    #[test]
    fn auth_invalid_codes_are_401() {
        for code in [
            ErrorCode::InvalidApiKey,
            ErrorCode::RevokedApiKey,
            ErrorCode::InvalidAuthFormat,
        ] {
            assert_eq!(code.category(), ErrorCategory::AuthInvalid);
            assert_eq!(code.http_status(), 401);
        }
    }

    #[test]
    fn forbidden_codes_are_403() {
        for code in [
            ErrorCode::Forbidden,
            ErrorCode::CsrfMissing,
            ErrorCode::CsrfInvalid,
        ] {
            assert_eq!(code.category(), ErrorCategory::Forbidden);
            assert_eq!(code.http_status(), 403);
        }
    }

    #[test]
    fn not_found_codes_are_404() {
        for code in [ErrorCode::ScreenshotNotFound, ErrorCode::PdfNotFound] {
            assert_eq!(code.category(), ErrorCategory::NotFound);
            assert_eq!(code.http_status(), 404);
        }
    }

    #[test]
    fn throttled_codes_are_429() {
        for code in [
            ErrorCode::RateLimitExceeded,
            ErrorCode::IpRateLimitExceeded,
            ErrorCode::QuotaExceeded,
        ] {
            assert_eq!(code.category(), ErrorCategory::Throttled);
            assert_eq!(code.http_status(), 429);
        }
    }

    #[test]
    fn rendering_codes_are_500() {
        for code in [
            ErrorCode::ProcessingFailed,
            ErrorCode::BrowserError,
            ErrorCode::StorageError,
        ] {
            assert_eq!(code.category(), ErrorCategory::Rendering);
            assert_eq!(code.http_status(), 500);
        }
    }

    #[test]
    fn timeout_codes_are_504() {
        for code in [ErrorCode::Timeout, ErrorCode::NavigationTimeout] {
            assert_eq!(code.category(), ErrorCategory::Timeout);
            assert_eq!(code.http_status(), 504);
        }
    }

    #[test]
    fn internal_code_categorised() {
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Internal);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    // -- Builder pattern ------------------------------------------------

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = CapError::new(ErrorCode::QuotaExceeded, "over budget")
            .with_context("used_credits", 249)
            .with_context("monthly_credits", 250)
            .with_context("cost", 2);
        assert_eq!(err.context.len(), 3);
        assert_eq!(err.context["used_credits"], serde_json::json!(249));
        assert_eq!(err.context["monthly_credits"], serde_json::json!(250));
        assert_eq!(err.context["cost"], serde_json::json!(2));
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = CapError::new(ErrorCode::Forbidden, "denied").with_source(src);
        assert!(err.source.is_some());
        let displayed = err.source.as_ref().unwrap().to_string();
        assert_eq!(displayed, "access denied");
    }

    #[test]
    fn builder_chaining_all() {
        let src = io::Error::other("underlying");
        let err = CapError::new(ErrorCode::InvalidUrl, "bad url")
            .with_context("url_domain", "169.254.169.254")
            .with_source(src);
        assert_eq!(err.code, ErrorCode::InvalidUrl);
        assert_eq!(
            err.context["url_domain"],
            serde_json::json!("169.254.169.254")
        );
        assert!(err.source.is_some());
    }

    #[test]
    fn category_shorthand() {
        let err = CapError::new(ErrorCode::PdfNotFound, "gone");
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(err.http_status(), 404);
    }

    // -- Serialization / Deserialization --------------------------------

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::ValidationError;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""VALIDATION_ERROR""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn error_category_serde_roundtrip() {
        let cat = ErrorCategory::Throttled;
        let json = serde_json::to_string(&cat).unwrap();
        assert_eq!(json, r#""throttled""#);
        let back: ErrorCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cat);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = CapError::new(ErrorCode::ValidationError, "bad field")
            .with_context("field", "viewport.width");
        let dto: CapErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: CapErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = CapError::new(ErrorCode::StorageError, "upload failed").with_source(src);
        let dto: CapErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("pipe broke"));
    }

    #[test]
    fn dto_to_cap_error() {
        let dto = CapErrorDto {
            code: ErrorCode::QuotaExceeded,
            message: "over budget".into(),
            context: BTreeMap::new(),
            source_message: Some("inner".into()),
        };
        let err: CapError = dto.into();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
        // Source is lost in DTO → CapError conversion (opaque type).
        assert!(err.source.is_none());
    }

    // -- Error chain (source) preservation ------------------------------

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = CapError::new(ErrorCode::StorageError, "download failed").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn std_error_source_none_by_default() {
        let err = CapError::new(ErrorCode::Internal, "oops");
        assert!(std::error::Error::source(&err).is_none());
    }

    // -- Unique string representations ----------------------------------

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn error_code_count() {
        // Guards against silently dropping a variant from ALL_CODES.
        assert_eq!(ALL_CODES.len(), 20);
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }

    #[test]
    fn error_category_display() {
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
        assert_eq!(ErrorCategory::Throttled.to_string(), "throttled");
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }

    #[test]
    fn context_with_nested_json() {
        let err = CapError::new(ErrorCode::Internal, "nested")
            .with_context("details", serde_json::json!({"a": 1, "b": [2, 3]}));
        assert_eq!(
            err.context["details"],
            serde_json::json!({"a": 1, "b": [2, 3]})
        );
    }
}
