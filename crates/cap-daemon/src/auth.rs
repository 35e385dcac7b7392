// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential parsing and resolution (§4.1 Identity & Key Store, §4.2
//! Session & OAuth, §4.4 admission pipeline step 1).
//!
//! Three credential sources are accepted, in the order a handler should try
//! them: a bearer API key, a trusted-gateway header triple, or a cookie
//! session. Each resolves to the same [`AuthContext`] shape so downstream
//! admission steps (rate limiting, quota) don't need to know which source
//! authenticated the caller.

use cap_config::GatewayConfig;
use cap_core::{Session, Tenant, Tier};
use cap_db::{ApiKeyRepository, SessionRepository, TenantRepository};
use cap_error::{CapError, ErrorCode};
use cap_ratelimit::{CounterStore, KeyCache};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Number of random bytes in a raw API key secret, before hex-encoding.
const KEY_SECRET_BYTES: usize = 32;

/// How many characters of the raw key are kept as the displayable prefix.
const PREFIX_LEN: usize = 16;

/// A session is renewed (its `expires_at` pushed forward) when less than
/// this many seconds remain on it at resolution time.
pub const SESSION_RENEWAL_THRESHOLD_SECS: i64 = 24 * 3600;

/// Default lifetime granted to a freshly created session.
pub const SESSION_DEFAULT_LIFETIME_SECS: i64 = 7 * 24 * 3600;

/// Which of the three accepted credential sources authenticated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    /// A bearer API key (`Authorization: Bearer sk_...` or a bare `sk_...`).
    ApiKey,
    /// A trusted upstream gateway header triple.
    Gateway,
    /// A dashboard cookie session.
    Session,
}

/// The resolved identity behind an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The tenant this request is billed and scoped to.
    pub tenant_id: Uuid,
    /// The tenant's current billing tier, used for rate-limit/quota lookups.
    pub tier: Tier,
    /// Which credential source resolved this identity.
    pub source: AuthSource,
    /// Present only for [`AuthSource::Session`]: the session's own CSRF
    /// token, needed by the admission pipeline's CSRF check.
    pub csrf_token: Option<String>,
}

// ---------------------------------------------------------------------------
// API key minting
// ---------------------------------------------------------------------------

/// A freshly minted API key, returned once — only `prefix` and `hash` are
/// ever persisted.
pub struct GeneratedApiKey {
    /// The full secret, shown to the caller exactly once.
    pub raw: String,
    /// The public, displayable prefix.
    pub prefix: String,
    /// SHA-256 hex digest of `raw`, the only form persisted.
    pub hash: String,
}

/// Mint a new API key for the given environment (`"live"` or `"test"`).
pub fn generate_api_key(env: &str) -> GeneratedApiKey {
    let mut secret = [0u8; KEY_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut secret);
    let raw = format!("sk_{env}_{}", hex::encode(secret));
    let hash = hash_key(&raw);
    let prefix = raw.chars().take(PREFIX_LEN).collect();
    GeneratedApiKey { raw, prefix, hash }
}

/// SHA-256 hex digest of a raw API key, the only form ever persisted or
/// cached.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

/// Extract the raw API key from an `Authorization` header value.
///
/// Accepts `Bearer <key>` (case-insensitive scheme) or a bare key that
/// already starts with `sk_`, matching callers that paste the key directly
/// into tools that don't let them set a `Bearer` prefix.
pub fn parse_bearer_credential(header_value: &str) -> Option<&str> {
    let trimmed = header_value.trim();
    if let Some(rest) = trimmed.split_once(' ')
        && rest.0.eq_ignore_ascii_case("bearer")
    {
        let key = rest.1.trim();
        return if key.is_empty() { None } else { Some(key) };
    }
    if trimmed.starts_with("sk_") {
        return Some(trimmed);
    }
    None
}

/// The trusted-gateway header triple (§4.4 step 1a).
#[derive(Debug, Clone)]
pub struct GatewayHeaders {
    /// Tenant identifier, injected by the gateway on the caller's behalf.
    pub tenant_id: Uuid,
    /// Tier the gateway believes this caller is on (advisory; the tenant's
    /// own stored tier is authoritative).
    pub tier_hint: Option<String>,
    /// Shared secret proving the request really came through the gateway.
    pub proxy_secret: String,
}

/// Header names for the trusted-gateway auth source.
pub const GATEWAY_USER_HEADER: &str = "x-rapidapi-user";
/// Header carrying the gateway's view of the caller's tier.
pub const GATEWAY_TIER_HEADER: &str = "x-rapidapi-subscription";
/// Header carrying the gateway's shared proxy secret.
pub const GATEWAY_SECRET_HEADER: &str = "x-rapidapi-proxy-secret";

/// Parse and authenticate the gateway header triple against `config`.
///
/// Returns `None` if the headers are simply absent (so the caller can fall
/// through to another auth source); returns an error if they're present but
/// invalid (wrong secret, malformed tenant id, gateway disabled).
pub fn parse_gateway_headers(
    headers: &axum::http::HeaderMap,
    config: &GatewayConfig,
) -> Result<Option<GatewayHeaders>, CapError> {
    let Some(secret_header) = headers.get(GATEWAY_SECRET_HEADER) else {
        return Ok(None);
    };
    if !config.enabled {
        return Err(CapError::new(
            ErrorCode::AuthenticationRequired,
            "gateway auth source is not enabled",
        ));
    }
    let expected = config.proxy_secret.as_deref().ok_or_else(|| {
        CapError::new(
            ErrorCode::Internal,
            "gateway enabled with no proxy_secret configured",
        )
    })?;
    let presented = secret_header
        .to_str()
        .map_err(|_| CapError::new(ErrorCode::InvalidAuthFormat, "malformed gateway secret header"))?;
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(CapError::new(ErrorCode::InvalidApiKey, "gateway proxy secret mismatch"));
    }

    let tenant_id = headers
        .get(GATEWAY_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CapError::new(ErrorCode::InvalidAuthFormat, "missing gateway user header"))?
        .parse::<Uuid>()
        .map_err(|_| CapError::new(ErrorCode::InvalidAuthFormat, "gateway user header is not a valid tenant id"))?;

    let tier_hint = headers
        .get(GATEWAY_TIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(Some(GatewayHeaders {
        tenant_id,
        tier_hint,
        proxy_secret: presented.to_string(),
    }))
}

/// Constant-time byte comparison, for secrets and CSRF tokens where a
/// length- or prefix-dependent timing difference would leak information.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a bearer API key to an [`AuthContext`], consulting the key cache
/// before falling back to the database.
///
/// On a cache miss, the full lookup path is: find the key row by prefix,
/// verify its hash matches in constant time, check it hasn't been revoked,
/// load the owning tenant, then warm the cache for next time.
pub async fn resolve_api_key<S: CounterStore>(
    raw_key: &str,
    api_keys: &ApiKeyRepository,
    tenants: &TenantRepository,
    cache: &KeyCache<S>,
) -> Result<AuthContext, CapError> {
    let hash = hash_key(raw_key);

    if let Ok(Some(cached_tenant_id)) = cache.get_tenant_id(&hash).await
        && let Ok(tenant_id) = cached_tenant_id.parse::<Uuid>()
        && let Ok(tenant) = tenants.get(tenant_id).await
    {
        return Ok(AuthContext {
            tenant_id: tenant.id,
            tier: tenant.tier,
            source: AuthSource::ApiKey,
            csrf_token: None,
        });
    }

    let prefix: String = raw_key.chars().take(PREFIX_LEN).collect();
    let key = api_keys
        .find_by_prefix(&prefix)
        .await
        .map_err(|e| CapError::new(ErrorCode::Internal, "key lookup failed").with_source(e))?
        .ok_or_else(|| CapError::new(ErrorCode::InvalidApiKey, "no such API key"))?;

    if !constant_time_eq(key.key_hash.as_bytes(), hash.as_bytes()) {
        return Err(CapError::new(ErrorCode::InvalidApiKey, "no such API key"));
    }
    if key.is_revoked() {
        return Err(CapError::new(ErrorCode::RevokedApiKey, "this API key has been revoked"));
    }

    let tenant = tenants
        .get(key.tenant_id)
        .await
        .map_err(|e| CapError::new(ErrorCode::Internal, "tenant lookup failed").with_source(e))?;

    let _ = api_keys.touch_last_used(key.id).await;
    let _ = cache.put_tenant_id(&hash, &tenant.id.to_string()).await;

    Ok(AuthContext {
        tenant_id: tenant.id,
        tier: tenant.tier,
        source: AuthSource::ApiKey,
        csrf_token: None,
    })
}

/// Resolve already-parsed [`GatewayHeaders`] to an [`AuthContext`].
///
/// The gateway's tier hint is logged for drift detection but never trusted
/// over the tenant's own stored tier.
pub async fn resolve_gateway(
    gw: &GatewayHeaders,
    tenants: &TenantRepository,
) -> Result<AuthContext, CapError> {
    let tenant = tenants.get(gw.tenant_id).await.map_err(|e| {
        CapError::new(ErrorCode::InvalidApiKey, "gateway tenant does not exist").with_source(e)
    })?;
    if let Some(hint) = &gw.tier_hint
        && hint != tenant.tier.as_str()
    {
        tracing::warn!(
            tenant_id = %tenant.id,
            gateway_hint = %hint,
            actual_tier = %tenant.tier,
            "gateway tier hint disagrees with stored tenant tier"
        );
    }
    Ok(AuthContext {
        tenant_id: tenant.id,
        tier: tenant.tier,
        source: AuthSource::Gateway,
        csrf_token: None,
    })
}

/// Resolve a cookie session id to an [`AuthContext`], sliding the session's
/// expiry forward if it's within [`SESSION_RENEWAL_THRESHOLD_SECS`] of
/// expiring.
pub async fn resolve_session(
    session_id: Uuid,
    sessions: &SessionRepository,
    tenants: &TenantRepository,
    now: DateTime<Utc>,
) -> Result<AuthContext, CapError> {
    let session = sessions
        .get(session_id)
        .await
        .map_err(|e| CapError::new(ErrorCode::Internal, "session lookup failed").with_source(e))?
        .ok_or_else(|| CapError::new(ErrorCode::AuthenticationRequired, "no such session"))?;

    if session.is_expired(now) {
        return Err(CapError::new(ErrorCode::AuthenticationRequired, "session has expired"));
    }

    maybe_renew(&session, sessions, now).await;

    let tenant = tenants
        .get(session.tenant_id)
        .await
        .map_err(|e| CapError::new(ErrorCode::Internal, "tenant lookup failed").with_source(e))?;

    Ok(AuthContext {
        tenant_id: tenant.id,
        tier: tenant.tier,
        source: AuthSource::Session,
        csrf_token: Some(session.csrf_token.clone()),
    })
}

async fn maybe_renew(session: &Session, sessions: &SessionRepository, now: DateTime<Utc>) {
    let remaining = (session.expires_at - now).num_seconds();
    if remaining < SESSION_RENEWAL_THRESHOLD_SECS {
        let new_expiry = now + chrono::Duration::seconds(SESSION_DEFAULT_LIFETIME_SECS);
        let _ = sessions.extend_expiry(session.id, new_expiry).await;
    }
}

/// Verify a caller-presented CSRF token against the session's own token.
///
/// Only relevant for cookie-session auth on unsafe methods; callers
/// (api-key, gateway) and safe methods (`GET`/`HEAD`) skip this entirely.
pub fn verify_csrf(session_token: &str, presented: &str) -> Result<(), CapError> {
    if presented.is_empty() {
        return Err(CapError::new(ErrorCode::CsrfMissing, "CSRF token required"));
    }
    if !constant_time_eq(session_token.as_bytes(), presented.as_bytes()) {
        return Err(CapError::new(ErrorCode::CsrfInvalid, "CSRF token mismatch"));
    }
    Ok(())
}

/// Generate a fresh, URL-safe CSRF token.
pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns `true` if `tenant` needs its monthly quota rolled over before
/// this request's quota check runs. Thin wrapper kept here so handlers
/// import admission-pipeline concerns from one module.
pub fn needs_rollover(tenant: &Tenant, now: DateTime<Utc>) -> bool {
    tenant.needs_monthly_rollover(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn generated_key_has_expected_shape() {
        let key = generate_api_key("live");
        assert!(key.raw.starts_with("sk_live_"));
        assert_eq!(key.prefix.len(), PREFIX_LEN);
        assert_eq!(key.hash.len(), 64);
        assert_eq!(hash_key(&key.raw), key.hash);
    }

    #[test]
    fn distinct_keys_are_generated_each_time() {
        let a = generate_api_key("live");
        let b = generate_api_key("live");
        assert_ne!(a.raw, b.raw);
    }

    #[test]
    fn parses_bearer_prefix_case_insensitively() {
        assert_eq!(
            parse_bearer_credential("Bearer sk_live_abc"),
            Some("sk_live_abc")
        );
        assert_eq!(
            parse_bearer_credential("bearer sk_live_abc"),
            Some("sk_live_abc")
        );
        assert_eq!(
            parse_bearer_credential("BEARER sk_live_abc"),
            Some("sk_live_abc")
        );
    }

    #[test]
    fn parses_bare_key_without_bearer_prefix() {
        assert_eq!(parse_bearer_credential("sk_test_xyz"), Some("sk_test_xyz"));
    }

    #[test]
    fn rejects_non_bearer_non_sk_value() {
        assert_eq!(parse_bearer_credential("Basic dXNlcjpwYXNz"), None);
        assert_eq!(parse_bearer_credential(""), None);
    }

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
    }

    #[test]
    fn constant_time_eq_rejects_different_length() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn constant_time_eq_rejects_different_content() {
        assert!(!constant_time_eq(b"abc123", b"abc124"));
    }

    #[test]
    fn verify_csrf_accepts_matching_token() {
        assert!(verify_csrf("tok123", "tok123").is_ok());
    }

    #[test]
    fn verify_csrf_rejects_empty_presented_token() {
        let err = verify_csrf("tok123", "").unwrap_err();
        assert_eq!(err.code, ErrorCode::CsrfMissing);
    }

    #[test]
    fn verify_csrf_rejects_mismatched_token() {
        let err = verify_csrf("tok123", "tok124").unwrap_err();
        assert_eq!(err.code, ErrorCode::CsrfInvalid);
    }

    #[test]
    fn gateway_headers_absent_returns_none() {
        let headers = HeaderMap::new();
        let config = GatewayConfig {
            enabled: true,
            proxy_secret: Some("a".repeat(32)),
        };
        assert!(parse_gateway_headers(&headers, &config).unwrap().is_none());
    }

    #[test]
    fn gateway_headers_rejected_when_disabled() {
        let mut headers = HeaderMap::new();
        headers.insert(GATEWAY_SECRET_HEADER, "secret".parse().unwrap());
        let config = GatewayConfig::default();
        let err = parse_gateway_headers(&headers, &config).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthenticationRequired);
    }

    #[test]
    fn gateway_headers_rejects_wrong_secret() {
        let mut headers = HeaderMap::new();
        headers.insert(GATEWAY_SECRET_HEADER, "wrong".parse().unwrap());
        headers.insert(GATEWAY_USER_HEADER, Uuid::nil().to_string().parse().unwrap());
        let config = GatewayConfig {
            enabled: true,
            proxy_secret: Some("right-secret".into()),
        };
        let err = parse_gateway_headers(&headers, &config).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidApiKey);
    }

    #[test]
    fn gateway_headers_parsed_when_valid() {
        let tenant_id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(GATEWAY_SECRET_HEADER, "right-secret".parse().unwrap());
        headers.insert(GATEWAY_USER_HEADER, tenant_id.to_string().parse().unwrap());
        headers.insert(GATEWAY_TIER_HEADER, "PRO".parse().unwrap());
        let config = GatewayConfig {
            enabled: true,
            proxy_secret: Some("right-secret".into()),
        };
        let parsed = parse_gateway_headers(&headers, &config).unwrap().unwrap();
        assert_eq!(parsed.tenant_id, tenant_id);
        assert_eq!(parsed.tier_hint.as_deref(), Some("PRO"));
    }

    #[test]
    fn csrf_token_generation_is_random_and_hex() {
        let a = generate_csrf_token();
        let b = generate_csrf_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
