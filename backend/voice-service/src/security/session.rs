//! Bearer session tokens signed with the key ring's current key.
//!
//! Tokens carry the signing-key id in the `kid` header; verifiers resolve the
//! key through a small local cache that is flushed whenever the ring announces
//! a rotation or revocation. Tokens without a `kid` fall back to the legacy
//! configured secret.

use crate::error::{AppError, AppResult};
use crate::security::keyring::{KeyRing, SigningKeyStatus, KEY_UPDATES_CHANNEL};
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use kv_store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const KEY_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub iat: i64,
    pub exp: i64,
}

struct CachedKey {
    secret: Vec<u8>,
    status: SigningKeyStatus,
    cached_at: Instant,
}

pub struct SessionTokenService {
    keyring: Arc<KeyRing>,
    legacy_secret: String,
    expires_in_secs: u64,
    key_cache: Mutex<HashMap<String, CachedKey>>,
}

impl SessionTokenService {
    pub fn new(keyring: Arc<KeyRing>, legacy_secret: String, expires_in_secs: u64) -> Self {
        Self {
            keyring,
            legacy_secret,
            expires_in_secs,
            key_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a session token for the user. Falls back to the legacy secret
    /// (no `kid`) when the ring has no usable signing key.
    pub async fn create(&self, user_id: Uuid) -> AppResult<String> {
        let now = Utc::now();
        let claims = SessionClaims {
            user_id: user_id.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + self.expires_in_secs as i64,
        };

        let (header, encoding_key) = match self.keyring.current_signing_key().await? {
            Some(key) => {
                let mut header = Header::new(Algorithm::HS256);
                header.kid = Some(key.id.clone());
                (header, EncodingKey::from_secret(&key.secret))
            }
            None => {
                warn!("no current signing key; issuing token with legacy secret");
                (
                    Header::new(Algorithm::HS256),
                    EncodingKey::from_secret(self.legacy_secret.as_bytes()),
                )
            }
        };

        encode(&header, &claims, &encoding_key)
            .map_err(|e| AppError::Internal(format!("sign session token: {e}")))
    }

    /// Verify a token and return the user id it was issued for.
    pub async fn verify(&self, token: &str) -> AppResult<Uuid> {
        let header = decode_header(token)
            .map_err(|_| AppError::InvalidToken("invalid payload".to_string()))?;

        let secret = match header.kid.as_deref() {
            Some(kid) => self.verification_secret(kid).await?,
            None => self.legacy_secret.as_bytes().to_vec(),
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<SessionClaims>(token, &DecodingKey::from_secret(&secret), &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::ExpiredToken,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    AppError::InvalidToken("invalid signature".to_string())
                }
                _ => AppError::InvalidToken("invalid payload".to_string()),
            })?;

        Uuid::parse_str(&data.claims.user_id)
            .map_err(|_| AppError::InvalidToken("invalid payload".to_string()))
    }

    /// Resolve the verification secret for a `kid`, via the local cache.
    /// Revoked keys are rejected even when their envelope still exists.
    async fn verification_secret(&self, kid: &str) -> AppResult<Vec<u8>> {
        {
            let cache = self.key_cache.lock().await;
            if let Some(entry) = cache.get(kid) {
                if entry.cached_at.elapsed() < KEY_CACHE_TTL {
                    if entry.status == SigningKeyStatus::Expired {
                        return Err(AppError::InvalidToken("expired".to_string()));
                    }
                    return Ok(entry.secret.clone());
                }
            }
        }

        let key = self
            .keyring
            .get_key_by_id(kid)
            .await?
            .ok_or_else(|| AppError::InvalidToken("invalid signature".to_string()))?;

        let mut cache = self.key_cache.lock().await;
        cache.insert(
            kid.to_string(),
            CachedKey {
                secret: key.secret.clone(),
                status: key.status,
                cached_at: Instant::now(),
            },
        );

        if key.status == SigningKeyStatus::Expired {
            return Err(AppError::InvalidToken("expired".to_string()));
        }
        Ok(key.secret)
    }

    pub async fn clear_key_cache(&self) {
        self.key_cache.lock().await.clear();
    }

    /// Listen on the key-updates channel and drop cached verification keys on
    /// any rotation or revocation event.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        kv: Arc<dyn KeyValueStore>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match kv.subscribe(KEY_UPDATES_CHANNEL).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(error = %err, "cannot subscribe to key updates; relying on cache TTL");
                    return;
                }
            };

            while let Some(event) = rx.recv().await {
                debug!(event = %event, "key update received; clearing verification cache");
                service.clear_key_cache().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyRotationSettings;
    use crypto_core::EncryptionService;
    use kv_store::MemoryKvStore;

    fn test_service() -> (SessionTokenService, Arc<KeyRing>) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let keyring = Arc::new(KeyRing::new(
            kv,
            Arc::new(EncryptionService::new("test-server-secret").unwrap()),
            KeyRotationSettings {
                interval_secs: 3600,
                grace_period_secs: 3600,
                max_active_keys: 3,
                check_interval_secs: 3600,
                lock_ttl_secs: 60,
            },
        ));
        (
            SessionTokenService::new(keyring.clone(), "legacy-secret".to_string(), 3600),
            keyring,
        )
    }

    #[tokio::test]
    async fn create_then_verify_round_trips_the_user_id() {
        let (service, keyring) = test_service();
        keyring.ensure_signing_key().await.unwrap();

        let user_id = Uuid::now_v7();
        let token = service.create(user_id).await.unwrap();
        assert_eq!(service.verify(&token).await.unwrap(), user_id);

        // The token advertises the ring key it was signed with.
        let header = decode_header(&token).unwrap();
        assert!(header.kid.is_some());
    }

    #[tokio::test]
    async fn legacy_tokens_verify_without_a_kid() {
        let (service, _keyring) = test_service();
        // No signing key generated: the service falls back to the legacy secret.

        let user_id = Uuid::now_v7();
        let token = service.create(user_id).await.unwrap();

        let header = decode_header(&token).unwrap();
        assert!(header.kid.is_none());
        assert_eq!(service.verify(&token).await.unwrap(), user_id);
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected() {
        let (service, keyring) = test_service();
        keyring.ensure_signing_key().await.unwrap();

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("no-such-key".to_string());
        let claims = SessionClaims {
            user_id: Uuid::now_v7().to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 60,
        };
        let token = encode(&header, &claims, &EncodingKey::from_secret(b"whatever")).unwrap();

        assert!(matches!(
            service.verify(&token).await,
            Err(AppError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn revoked_key_invalidates_outstanding_tokens() {
        let (service, keyring) = test_service();
        let key = keyring.generate_new_key().await.unwrap();

        let user_id = Uuid::now_v7();
        let token = service.create(user_id).await.unwrap();
        assert_eq!(service.verify(&token).await.unwrap(), user_id);

        keyring.revoke_key(&key.id).await.unwrap();
        // The listener would clear this; emulate the event's effect directly.
        service.clear_key_cache().await;

        assert!(matches!(
            service.verify(&token).await,
            Err(AppError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn expired_tokens_report_expiry() {
        let (service, keyring) = test_service();
        let key = keyring.generate_new_key().await.unwrap();

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(key.id.clone());
        let claims = SessionClaims {
            user_id: Uuid::now_v7().to_string(),
            iat: Utc::now().timestamp() - 7200,
            exp: Utc::now().timestamp() - 3600,
        };
        let token = encode(&header, &claims, &EncodingKey::from_secret(&key.secret)).unwrap();

        assert!(matches!(
            service.verify(&token).await,
            Err(AppError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn tampered_tokens_fail_signature_checks() {
        let (service, keyring) = test_service();
        keyring.ensure_signing_key().await.unwrap();

        let token = service.create(Uuid::now_v7()).await.unwrap();
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        parts[1] = parts[1].chars().rev().collect();
        let tampered = parts.join(".");

        assert!(service.verify(&tampered).await.is_err());
    }
}
