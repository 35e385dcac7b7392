// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credit accounting: per-event cost table and quota debits.
//!
//! Every completed job debits the owning tenant's credit balance by a fixed
//! amount that depends only on the billable event type, not on the
//! tenant's tier — the tier instead governs how many credits a tenant is
//! granted per billing cycle (`monthly_credits`) and its rate-limit
//! ceiling (see `cap-config::TierLimits`). Debits are applied atomically
//! against the database row in `cap-db`; this crate only owns the pricing
//! table and the in-memory quota arithmetic used for the admission
//! pipeline's precheck.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cap_core::UsageEventType;

/// Credits debited for a plain viewport screenshot.
pub const SCREENSHOT_COST_CREDITS: i64 = 1;

/// Credits debited for a full-page screenshot (scrolling capture costs
/// more than a single viewport).
pub const SCREENSHOT_FULLPAGE_COST_CREDITS: i64 = 2;

/// Credits debited for a plain PDF render.
pub const PDF_COST_CREDITS: i64 = 2;

/// Credits debited for a PDF render using a header/footer template.
pub const PDF_WITH_TEMPLATE_COST_CREDITS: i64 = 3;

/// Returns the credit cost of a billable event of the given type. Not
/// meaningful for [`UsageEventType::PlanGrant`], which is never a debit.
pub fn cost_for(event_type: UsageEventType) -> i64 {
    match event_type {
        UsageEventType::Screenshot => SCREENSHOT_COST_CREDITS,
        UsageEventType::ScreenshotFullpage => SCREENSHOT_FULLPAGE_COST_CREDITS,
        UsageEventType::Pdf => PDF_COST_CREDITS,
        UsageEventType::PdfWithTemplate => PDF_WITH_TEMPLATE_COST_CREDITS,
        UsageEventType::PlanGrant => 0,
    }
}

/// Errors from a billing operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// The tenant's remaining monthly quota does not cover the cost.
    #[error("insufficient quota: required {required}, remaining {remaining}")]
    InsufficientQuota {
        /// Credits the operation would have cost.
        required: i64,
        /// Credits actually remaining this cycle.
        remaining: i64,
    },
}

/// A tenant's current quota standing, as read from `cap-db` before the
/// admission pipeline's precheck runs. Mirrors `cap_core::Tenant`'s
/// `monthly_credits`/`used_credits` pair so the precheck can be evaluated
/// without a repository dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingQuota {
    /// Total credits granted for the current billing period.
    pub monthly_credits: i64,
    /// Credits consumed so far in the current billing period.
    pub used_credits: i64,
}

impl BillingQuota {
    /// Credits remaining before the monthly budget is exhausted. Never
    /// negative even if `used_credits` has somehow overshot `monthly_credits`.
    pub fn remaining(&self) -> i64 {
        (self.monthly_credits - self.used_credits).max(0)
    }

    /// Returns `true` if `cost` additional credits would exceed the monthly
    /// budget — the admission pipeline's quota precheck.
    pub fn would_exceed(&self, cost: i64) -> bool {
        self.used_credits + cost > self.monthly_credits
    }

    /// Precheck `cost` credits, returning the error the admission pipeline
    /// should surface as `429 QUOTA_EXCEEDED` without mutating `self` — the
    /// actual debit always happens against the database row, atomically
    /// with the `UsageEvent` insert, never in memory.
    pub fn precheck(&self, cost: i64) -> Result<(), BillingError> {
        if self.would_exceed(cost) {
            return Err(BillingError::InsufficientQuota {
                required: cost,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(monthly_credits: i64, used_credits: i64) -> BillingQuota {
        BillingQuota {
            monthly_credits,
            used_credits,
        }
    }

    #[test]
    fn screenshot_costs_less_than_pdf_with_template() {
        assert!(
            cost_for(UsageEventType::Screenshot) < cost_for(UsageEventType::PdfWithTemplate)
        );
    }

    #[test]
    fn fullpage_screenshot_costs_more_than_plain() {
        assert!(
            cost_for(UsageEventType::ScreenshotFullpage) > cost_for(UsageEventType::Screenshot)
        );
    }

    #[test]
    fn plan_grant_has_zero_cost() {
        assert_eq!(cost_for(UsageEventType::PlanGrant), 0);
    }

    #[test]
    fn precheck_allows_exact_remaining_budget() {
        let q = quota(250, 248);
        assert!(q.precheck(2).is_ok());
    }

    #[test]
    fn precheck_rejects_when_it_would_exceed_budget() {
        let q = quota(250, 249);
        let err = q.precheck(2).unwrap_err();
        assert_eq!(
            err,
            BillingError::InsufficientQuota {
                required: 2,
                remaining: 1
            }
        );
    }

    #[test]
    fn remaining_never_goes_negative() {
        let q = quota(10, 15);
        assert_eq!(q.remaining(), 0);
    }

    #[test]
    fn remaining_computes_budget_minus_used() {
        let q = quota(100, 30);
        assert_eq!(q.remaining(), 70);
    }

    #[test]
    fn would_exceed_is_strict_greater_than() {
        let q = quota(100, 90);
        assert!(!q.would_exceed(10));
        assert!(q.would_exceed(11));
    }
}
