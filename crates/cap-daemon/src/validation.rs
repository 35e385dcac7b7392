// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP-layer request validation: pagination bounds and sort-field enums.
//!
//! Render-option validation (viewport bounds, format enums, mutually
//! exclusive fields) is delegated entirely to `cap-validate`; this module
//! only covers the query-string parameters `cap-validate` has no opinion
//! about.

use crate::api::JobListQuery;
use cap_db::JobSortBy;
use cap_error::{CapError, ErrorCode};

/// Page size cap for list endpoints (§8 boundary cases).
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Default page size when the caller doesn't specify one.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// A validated, defaulted `JobListQuery`.
#[derive(Debug, Clone, Copy)]
pub struct ListParams {
    /// 1-indexed page number.
    pub page: u32,
    /// Page size, 1..=100.
    pub limit: u32,
    /// Parsed status filter.
    pub status: Option<cap_core::JobStatus>,
    /// Parsed sort field.
    pub sort_by: JobSortBy,
    /// Whether results are ascending.
    pub ascending: bool,
}

impl ListParams {
    /// Offset into the result set implied by `page`/`limit`.
    pub fn offset(&self) -> i64 {
        ((self.page - 1) as i64) * self.limit as i64
    }
}

/// Validate and default a [`JobListQuery`], rejecting out-of-range values
/// rather than silently clamping them.
pub fn validate_list_query(query: &JobListQuery) -> Result<ListParams, CapError> {
    let page = query.page.unwrap_or(1);
    if page < 1 {
        return Err(CapError::new(ErrorCode::ValidationError, "page must be >= 1"));
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit < 1 || limit > MAX_PAGE_LIMIT {
        return Err(CapError::new(
            ErrorCode::ValidationError,
            format!("limit must be between 1 and {MAX_PAGE_LIMIT}"),
        ));
    }

    let status = match &query.status {
        None => None,
        Some(s) => Some(parse_status(s)?),
    };

    let sort_by = match query.sort_by.as_deref() {
        None | Some("created_at") => JobSortBy::CreatedAt,
        Some("completed_at") => JobSortBy::CompletedAt,
        Some(other) => {
            return Err(CapError::new(
                ErrorCode::ValidationError,
                format!("sort_by must be 'created_at' or 'completed_at', got '{other}'"),
            ));
        }
    };

    let ascending = match query.sort_order.as_deref() {
        None | Some("desc") => false,
        Some("asc") => true,
        Some(other) => {
            return Err(CapError::new(
                ErrorCode::ValidationError,
                format!("sort_order must be 'asc' or 'desc', got '{other}'"),
            ));
        }
    };

    Ok(ListParams {
        page,
        limit,
        status,
        sort_by,
        ascending,
    })
}

fn parse_status(value: &str) -> Result<cap_core::JobStatus, CapError> {
    match value {
        "pending" => Ok(cap_core::JobStatus::Pending),
        "processing" => Ok(cap_core::JobStatus::Processing),
        "completed" => Ok(cap_core::JobStatus::Completed),
        "failed" => Ok(cap_core::JobStatus::Failed),
        other => Err(CapError::new(
            ErrorCode::ValidationError,
            format!("status must be one of pending/processing/completed/failed, got '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: Option<u32>, limit: Option<u32>) -> JobListQuery {
        JobListQuery {
            page,
            limit,
            status: None,
            sort_by: None,
            sort_order: None,
        }
    }

    #[test]
    fn defaults_page_and_limit_when_absent() {
        let params = validate_list_query(&query(None, None)).unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(params.offset(), 0);
    }

    #[test]
    fn rejects_page_zero() {
        let err = validate_list_query(&query(Some(0), None)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn accepts_limit_at_the_boundary() {
        assert!(validate_list_query(&query(Some(1), Some(MAX_PAGE_LIMIT))).is_ok());
    }

    #[test]
    fn rejects_limit_over_the_boundary() {
        let err = validate_list_query(&query(Some(1), Some(MAX_PAGE_LIMIT + 1))).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn rejects_unknown_sort_field() {
        let mut q = query(None, None);
        q.sort_by = Some("nonsense".into());
        let err = validate_list_query(&q).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn offset_accounts_for_page_number() {
        let params = validate_list_query(&query(Some(3), Some(20))).unwrap();
        assert_eq!(params.offset(), 40);
    }
}
