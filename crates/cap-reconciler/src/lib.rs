// SPDX-License-Identifier: MIT OR Apache-2.0
//! Billing webhook signature verification and idempotent reconciliation.
//!
//! The billing provider is a boundary we do not control: its retries,
//! out-of-order delivery, and replayed requests all have to be handled
//! defensively. [`SignatureVerifier`] authenticates the payload actually
//! came from the provider; the caller is then responsible for looking up
//! `provider_event_id` against the `WebhookEvent` table (`cap-db`) before
//! calling [`classify_event`] — [`cap_core::WebhookEvent::already_processed`]
//! is the idempotency gate, not anything in this crate.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cap_core::Tier;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Errors from signature verification or event classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcilerError {
    /// The `signature` header is missing a required component (`t=` or
    /// `v1=`).
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    /// The signed timestamp is further from `now` than the allowed
    /// tolerance — either a severely delayed delivery or a replay attempt.
    #[error("signature timestamp is {skew_secs}s outside tolerance")]
    TimestampOutOfTolerance {
        /// How far outside the tolerance window the timestamp was, in
        /// seconds.
        skew_secs: i64,
    },

    /// The computed signature did not match the one presented.
    #[error("signature does not match payload")]
    SignatureMismatch,

    /// The secret could not be used to key an HMAC (e.g. empty).
    #[error("invalid signing secret")]
    InvalidSecret,

    /// The event payload was not valid JSON or was missing a required
    /// field.
    #[error("malformed event payload: {0}")]
    MalformedPayload(String),

    /// The event payload named a tier we don't recognize.
    #[error("unrecognized tier: {0}")]
    UnrecognizedTier(String),
}

/// Verifies that an inbound webhook payload genuinely originated from the
/// billing provider.
pub trait SignatureVerifier {
    /// Verify `payload` against `signature_header`, relative to `now`.
    fn verify(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError>;
}

/// Stripe-style `t=<unix_ts>,v1=<hex_hmac_sha256>` signature scheme.
///
/// The signed string is `"{timestamp}.{raw_body}"`, HMAC-SHA256 keyed by
/// the webhook signing secret, hex-encoded. Comparison against the
/// presented signature is constant-time — a prior reference implementation
/// we looked at claimed this in a comment while actually using `!=` on the
/// hex strings, which leaks timing information proportional to the number
/// of matching prefix bytes.
pub struct StripeStyleVerifier {
    /// Webhook signing secret shared with the billing provider.
    pub secret: String,
    /// Maximum allowed clock skew between `now` and the signed timestamp.
    pub tolerance_secs: i64,
}

impl SignatureVerifier for StripeStyleVerifier {
    fn verify(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError> {
        if self.secret.is_empty() {
            return Err(ReconcilerError::InvalidSecret);
        }

        let parts: HashMap<&str, &str> = signature_header
            .split(',')
            .filter_map(|part| {
                let mut split = part.splitn(2, '=');
                Some((split.next()?, split.next()?))
            })
            .collect();

        let timestamp_str = parts
            .get("t")
            .ok_or_else(|| ReconcilerError::MalformedHeader("missing 't='".into()))?;
        let expected_sig = parts
            .get("v1")
            .ok_or_else(|| ReconcilerError::MalformedHeader("missing 'v1='".into()))?;

        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| ReconcilerError::MalformedHeader("'t=' is not an integer".into()))?;

        let skew = (now.timestamp() - timestamp).abs();
        if skew > self.tolerance_secs {
            return Err(ReconcilerError::TimestampOutOfTolerance { skew_secs: skew });
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| ReconcilerError::InvalidSecret)?;
        mac.update(timestamp_str.as_bytes());
        mac.update(b".");
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed.as_bytes().ct_eq(expected_sig.as_bytes()).into() {
            Ok(())
        } else {
            Err(ReconcilerError::SignatureMismatch)
        }
    }
}

/// The internal action a reconciled webhook event should trigger. The
/// reconciler only classifies; applying the action against `cap-db` (and
/// looking up a tier's monthly credit budget from `cap-config`) is the
/// caller's job, so this crate stays free of a database dependency.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingAction {
    /// Subscription is active or trialing: upsert the subscription row,
    /// set the tenant's tier, and reset its credit budget/balance/usage to
    /// that tier's monthly credits, stamping `last_reset_at = now`. Also
    /// the response to a `checkout.session.completed` that establishes the
    /// subscription and to an `invoice.paid` re-sync.
    ActivateSubscription {
        /// Provider-side customer reference, resolved to a tenant id by
        /// the caller.
        provider_customer_ref: String,
        /// Provider-side subscription reference, for the `subscriptions`
        /// row's `provider_customer_ref` uniqueness key.
        subscription_provider_ref: String,
        /// Tier the subscription places the tenant on.
        tier: Tier,
    },
    /// Subscription was deleted or canceled (terminal): mark the
    /// subscription row `CANCELED`, downgrade the tenant to `FREE` and
    /// `FREE`'s credit budget, and zero `used_credits`.
    CancelSubscription {
        /// Provider-side customer reference.
        provider_customer_ref: String,
    },
    /// An invoice failed to collect: mark the subscription `PAST_DUE` but
    /// leave the tenant's tier and budget unchanged — access isn't revoked
    /// until the provider actually cancels.
    MarkPastDue {
        /// Provider-side customer reference.
        provider_customer_ref: String,
    },
    /// The event type is recognised but requires no state change.
    Noop,
    /// The event type is not one we act on.
    Unhandled {
        /// The raw provider event type string, for logging.
        event_type: String,
    },
}

fn parse_tier(value: &str) -> Result<Tier, ReconcilerError> {
    match value {
        "FREE" => Ok(Tier::Free),
        "PRO" => Ok(Tier::Pro),
        "BUSINESS" => Ok(Tier::Business),
        "ENTERPRISE" => Ok(Tier::Enterprise),
        other => Err(ReconcilerError::UnrecognizedTier(other.to_string())),
    }
}

fn customer_ref(payload: &serde_json::Value) -> Result<String, ReconcilerError> {
    payload
        .get("customer")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ReconcilerError::MalformedPayload("missing 'customer' field".into()))
}

fn subscription_ref(payload: &serde_json::Value) -> Result<String, ReconcilerError> {
    payload
        .get("subscription")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ReconcilerError::MalformedPayload("missing 'subscription' field".into()))
}

fn tier_from_payload(payload: &serde_json::Value) -> Result<Tier, ReconcilerError> {
    let value = payload
        .get("tier")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ReconcilerError::MalformedPayload("missing 'tier' field".into()))?;
    parse_tier(value)
}

/// Classify a verified, not-yet-processed provider event into the
/// [`BillingAction`] it should trigger.
///
/// `event_type` is the provider's event type string (e.g.
/// `"invoice.paid"`); `payload` is the provider's `data.object`, expected
/// to carry at least a `customer` field, plus `subscription`/`tier` for
/// events that establish or change plan membership.
pub fn classify_event(
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<BillingAction, ReconcilerError> {
    match event_type {
        "invoice.paid" | "checkout.session.completed" => Ok(BillingAction::ActivateSubscription {
            provider_customer_ref: customer_ref(payload)?,
            subscription_provider_ref: subscription_ref(payload)?,
            tier: tier_from_payload(payload)?,
        }),
        "invoice.payment_failed" => Ok(BillingAction::MarkPastDue {
            provider_customer_ref: customer_ref(payload)?,
        }),
        "customer.subscription.deleted" => Ok(BillingAction::CancelSubscription {
            provider_customer_ref: customer_ref(payload)?,
        }),
        "customer.subscription.updated" => {
            let status = payload.get("status").and_then(|v| v.as_str());
            match status {
                Some("active") | Some("trialing") => Ok(BillingAction::ActivateSubscription {
                    provider_customer_ref: customer_ref(payload)?,
                    subscription_provider_ref: subscription_ref(payload)?,
                    tier: tier_from_payload(payload)?,
                }),
                Some("past_due") | Some("unpaid") => Ok(BillingAction::MarkPastDue {
                    provider_customer_ref: customer_ref(payload)?,
                }),
                Some("canceled") => Ok(BillingAction::CancelSubscription {
                    provider_customer_ref: customer_ref(payload)?,
                }),
                _ => Ok(BillingAction::Noop),
            }
        }
        other => Ok(BillingAction::Unhandled {
            event_type: other.to_string(),
        }),
    }
}
