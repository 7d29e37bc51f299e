//! Verification of Apple-issued identity tokens.
//!
//! Tokens are verified against Apple's published JWKS: RS256 signature,
//! issuer, expiration, and audience. The service accepts several audiences
//! (one bundle id per client flavor) and tries each in order, succeeding on
//! the first match. Verification outcomes, including failures, are cached for
//! a short window keyed by the raw token to shed repeated load.

use crate::config::AppleSettings;
use crate::error::{AppError, AppResult};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use resilience::{with_retry, RetryPolicy, Retryable};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// How long a stale JWKS may keep serving after refreshes start failing.
const STALE_JWKS_WINDOW: Duration = Duration::from_secs(24 * 3600);
const RESULT_CACHE_MAX_ENTRIES: usize = 10_000;

/// Claims extracted from a verified identity token. `email` is usually only
/// present on the first sign-in.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedIdentity {
    #[serde(rename = "sub")]
    pub subject: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Default)]
struct JwksCache {
    keys: HashMap<String, Jwk>,
    fetched_at: Option<Instant>,
}

struct CachedOutcome {
    outcome: Result<VerifiedIdentity, AppError>,
    cached_at: Instant,
}

struct FetchError(String);

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        true
    }
}

pub struct AppleIdentityVerifier {
    http: reqwest::Client,
    settings: AppleSettings,
    jwks: RwLock<JwksCache>,
    results: Mutex<HashMap<String, CachedOutcome>>,
}

impl AppleIdentityVerifier {
    pub fn new(settings: AppleSettings, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            http,
            settings,
            jwks: RwLock::new(JwksCache::default()),
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Verify an identity token and return its subject and optional email.
    pub async fn verify(&self, token: &str) -> AppResult<VerifiedIdentity> {
        let cache_key = result_cache_key(token);
        if let Some(outcome) = self.cached_outcome(&cache_key).await {
            debug!("identity verification served from cache");
            return outcome;
        }

        let outcome = self.verify_uncached(token).await;
        self.store_outcome(cache_key, &outcome).await;
        outcome
    }

    async fn verify_uncached(&self, token: &str) -> AppResult<VerifiedIdentity> {
        let header = decode_header(token)
            .map_err(|_| AppError::InvalidToken("malformed identity token".to_string()))?;

        if header.alg != Algorithm::RS256 {
            return Err(AppError::InvalidToken(format!(
                "unexpected identity token algorithm {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| AppError::InvalidToken("identity token missing key id".to_string()))?;

        let jwk = self.jwk_for(&kid).await?;
        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| AppError::IdentityProvider(format!("bad provider key: {e}")))?;

        // Try each accepted audience; only an audience mismatch moves on to
        // the next candidate, any other failure short-circuits.
        let mut last_error: Option<AppError> = None;
        for audience in &self.settings.accepted_audiences {
            let mut validation = Validation::new(Algorithm::RS256);
            validation.set_issuer(&[&self.settings.issuer]);
            validation.set_audience(&[audience]);
            validation.validate_exp = true;

            match decode::<VerifiedIdentity>(token, &decoding_key, &validation) {
                Ok(data) => {
                    if data.claims.subject.is_empty() {
                        return Err(AppError::InvalidToken(
                            "identity token missing subject".to_string(),
                        ));
                    }
                    return Ok(data.claims);
                }
                Err(err) => match err.kind() {
                    jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                        last_error = Some(AppError::InvalidToken(
                            "identity token audience not accepted".to_string(),
                        ));
                        continue;
                    }
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        return Err(AppError::InvalidToken(
                            "identity token expired".to_string(),
                        ));
                    }
                    jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                        return Err(AppError::InvalidToken(
                            "identity token issuer mismatch".to_string(),
                        ));
                    }
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        return Err(AppError::InvalidToken(
                            "identity token signature invalid".to_string(),
                        ));
                    }
                    _ => {
                        return Err(AppError::InvalidToken(format!(
                            "identity token verification failed: {err}"
                        )));
                    }
                },
            }
        }

        warn!("identity token rejected: audience not in accepted list");
        Err(last_error
            .unwrap_or_else(|| AppError::InvalidToken("identity token audience not accepted".to_string())))
    }

    async fn cached_outcome(&self, cache_key: &str) -> Option<AppResult<VerifiedIdentity>> {
        let ttl = Duration::from_secs(self.settings.result_cache_ttl_secs);
        let results = self.results.lock().await;
        results
            .get(cache_key)
            .filter(|entry| entry.cached_at.elapsed() < ttl)
            .map(|entry| entry.outcome.clone())
    }

    async fn store_outcome(&self, cache_key: String, outcome: &AppResult<VerifiedIdentity>) {
        let mut results = self.results.lock().await;
        if results.len() >= RESULT_CACHE_MAX_ENTRIES {
            results.clear();
        }
        results.insert(
            cache_key,
            CachedOutcome {
                outcome: outcome.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Resolve the provider key for `kid`, refreshing the JWKS when the cache
    /// has gone stale. Refresh failures fall back to the stale cache for a
    /// bounded window.
    async fn jwk_for(&self, kid: &str) -> AppResult<Jwk> {
        let cache_ttl = Duration::from_secs(self.settings.jwks_cache_ttl_secs);

        {
            let cache = self.jwks.read().await;
            if let Some(fetched_at) = cache.fetched_at {
                if fetched_at.elapsed() < cache_ttl {
                    if let Some(jwk) = cache.keys.get(kid) {
                        return Ok(jwk.clone());
                    }
                }
            }
        }

        match self.fetch_jwks().await {
            Ok(keys) => {
                let mut cache = self.jwks.write().await;
                cache.keys = keys.into_iter().map(|k| (k.kid.clone(), k)).collect();
                cache.fetched_at = Some(Instant::now());
                cache.keys.get(kid).cloned().ok_or_else(|| {
                    AppError::InvalidToken("identity token signed by unknown key".to_string())
                })
            }
            Err(err) => {
                let cache = self.jwks.read().await;
                let stale_ok = cache
                    .fetched_at
                    .is_some_and(|at| at.elapsed() < STALE_JWKS_WINDOW);
                if stale_ok {
                    if let Some(jwk) = cache.keys.get(kid) {
                        warn!(error = %err, "serving stale provider JWKS after refresh failure");
                        return Ok(jwk.clone());
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_jwks(&self) -> AppResult<Vec<Jwk>> {
        let url = self.settings.jwks_url.clone();
        let http = self.http.clone();

        let response = with_retry(&RetryPolicy::jwks(), || {
            let http = http.clone();
            let url = url.clone();
            async move {
                let resp = http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| FetchError(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(FetchError(format!("status {}", resp.status())));
                }
                resp.json::<JwksResponse>()
                    .await
                    .map_err(|e| FetchError(e.to_string()))
            }
        })
        .await
        .map_err(|e| AppError::IdentityProvider(format!("JWKS fetch failed: {e}")))?;

        info!(count = response.keys.len(), "fetched provider JWKS");
        Ok(response.keys)
    }
}

fn result_cache_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Best-effort email claim from an UNVERIFIED token payload.
///
/// Used solely to attribute failed attempts to an email for the abuse
/// ladder. Never use this for identity: the signature has not been checked.
pub fn unverified_email_claim(token: &str) -> Option<String> {
    use base64::Engine as _;

    let payload = token.split('.').nth(1)?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value
        .get("email")
        .and_then(|e| e.as_str())
        .map(|e| e.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    fn test_settings() -> AppleSettings {
        AppleSettings {
            issuer: "https://appleid.apple.com".to_string(),
            // Unroutable on purpose: these tests must fail before any fetch.
            jwks_url: "http://127.0.0.1:1/auth/keys".to_string(),
            accepted_audiences: vec![
                "com.attune.app".to_string(),
                "com.attune.app.dev".to_string(),
            ],
            jwks_cache_ttl_secs: 3600,
            result_cache_ttl_secs: 60,
        }
    }

    fn verifier() -> AppleIdentityVerifier {
        AppleIdentityVerifier::new(test_settings(), Duration::from_millis(200))
    }

    #[derive(Serialize)]
    struct FakeClaims {
        sub: String,
        aud: String,
        iss: String,
        exp: i64,
    }

    fn hs256_token() -> String {
        // Wrong algorithm on purpose; must be rejected before any key lookup.
        encode(
            &Header::new(Algorithm::HS256),
            &FakeClaims {
                sub: "apple|abc".to_string(),
                aud: "com.attune.app".to_string(),
                iss: "https://appleid.apple.com".to_string(),
                exp: chrono::Utc::now().timestamp() + 600,
            },
            &EncodingKey::from_secret(b"test"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_tokens_are_rejected() {
        let verifier = verifier();
        assert!(matches!(
            verifier.verify("not-a-jwt").await,
            Err(AppError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn non_rs256_tokens_are_rejected_without_network() {
        let verifier = verifier();
        assert!(matches!(
            verifier.verify(&hs256_token()).await,
            Err(AppError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn failures_are_cached_by_token() {
        let verifier = verifier();
        let token = hs256_token();

        let first = verifier.verify(&token).await;
        assert!(first.is_err());

        // Second call is served from the outcome cache.
        let cached = verifier
            .cached_outcome(&result_cache_key(&token))
            .await
            .expect("outcome should be cached");
        assert!(cached.is_err());
    }

    #[test]
    fn unverified_email_claim_is_best_effort() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({"sub": "apple|abc", "email": "U@X.io"}),
            &EncodingKey::from_secret(b"test"),
        )
        .unwrap();

        assert_eq!(unverified_email_claim(&token).as_deref(), Some("u@x.io"));
        assert_eq!(unverified_email_claim("garbage"), None);
        assert_eq!(unverified_email_claim("a.b.c"), None);
    }

    #[tokio::test]
    async fn unreachable_jwks_surfaces_provider_error() {
        let verifier = verifier();
        // RS256 header with a kid, forcing a JWKS lookup against a dead host.
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("AIDOPK1".to_string());
        // A syntactically valid RS256 token cannot be produced without an RSA
        // key; hand-roll the unsigned shape instead.
        let body = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            serde_json::to_vec(&serde_json::json!({
                "sub": "apple|abc",
                "aud": "com.attune.app",
                "iss": "https://appleid.apple.com",
                "exp": chrono::Utc::now().timestamp() + 600,
            }))
            .unwrap(),
        );
        let head = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            serde_json::to_vec(&serde_json::json!({
                "alg": "RS256",
                "kid": "AIDOPK1",
            }))
            .unwrap(),
        );
        let token = format!("{head}.{body}.c2ln");

        assert!(matches!(
            verifier.verify(&token).await,
            Err(AppError::IdentityProvider(_))
        ));
    }
}
