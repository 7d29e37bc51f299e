//! Rotating pool of session-token signing keys.
//!
//! Keys live in the shared KV store, envelope-encrypted at rest. At most one
//! key is the current signer; rotated-out keys keep verifying until their TTL.
//! Rotation across processes is coordinated with a `set-if-absent` lock, and
//! every mutation is announced on the `key-updates` channel so verifier caches
//! can drop stale material.

use crate::config::KeyRotationSettings;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crypto_core::{EncryptionService, Envelope};
use kv_store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const ALL_KEYS_SET: &str = "keys:all";
const REVOKED_SET: &str = "keys:revoked";
const CURRENT_KEY: &str = "keys:current";
const ROTATION_LOCK: &str = "keys:rotation:lock";

/// Channel carrying `{event: "key_rotated" | "key_revoked"}` notifications.
pub const KEY_UPDATES_CHANNEL: &str = "key-updates";

const SECRET_LEN: usize = 64;
const SIGNING_ALGORITHM: &str = "HS256";

fn storage_key(id: &str) -> String {
    format!("keys:{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningKeyStatus {
    Active,
    Rotating,
    Expired,
}

/// A decrypted signing key as consumed by the session token service.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub id: String,
    pub secret: Vec<u8>,
    pub algorithm: String,
    pub status: SigningKeyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SigningKey {
    pub fn usable_for_verification(&self, now: DateTime<Utc>) -> bool {
        self.status != SigningKeyStatus::Expired && self.expires_at > now
    }
}

/// At-rest form. The secret never touches the store in plaintext.
#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    id: String,
    algorithm: String,
    status: SigningKeyStatus,
    created_at: i64,
    expires_at: i64,
    secret: Envelope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyEvent {
    pub event: String,
    pub key_id: String,
    pub at: i64,
}

pub struct KeyRing {
    kv: Arc<dyn KeyValueStore>,
    crypto: Arc<EncryptionService>,
    settings: KeyRotationSettings,
    /// Identifies this process as a rotation-lock owner.
    node_nonce: String,
}

impl KeyRing {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        crypto: Arc<EncryptionService>,
        settings: KeyRotationSettings,
    ) -> Self {
        Self {
            kv,
            crypto,
            settings,
            node_nonce: Uuid::new_v4().to_string(),
        }
    }

    /// Create and persist a fresh signing key, becoming the current signer if
    /// none is set.
    pub async fn generate_new_key(&self) -> AppResult<SigningKey> {
        let now = Utc::now();
        let lifetime =
            ChronoDuration::seconds((self.settings.interval_secs + self.settings.grace_period_secs) as i64);
        let expires_at = now + lifetime;

        let secret = crypto_core::generate_secret(SECRET_LEN);
        let envelope = self
            .crypto
            .encrypt(&secret)
            .map_err(|e| AppError::Internal(format!("seal signing key: {e}")))?;

        let id = Uuid::now_v7().to_string();
        let stored = StoredKey {
            id: id.clone(),
            algorithm: SIGNING_ALGORITHM.to_string(),
            status: SigningKeyStatus::Active,
            created_at: now.timestamp(),
            expires_at: expires_at.timestamp(),
            secret: envelope,
        };
        let ttl = Duration::from_secs(lifetime.num_seconds().max(1) as u64);

        self.write_stored(&stored, ttl).await?;
        self.kv.set_add(ALL_KEYS_SET, &id).await?;
        self.kv
            .set_if_absent(CURRENT_KEY, &id, ttl)
            .await?;

        info!(key_id = %id, expires_at = %expires_at, "generated signing key");

        Ok(SigningKey {
            id,
            secret,
            algorithm: SIGNING_ALGORITHM.to_string(),
            status: SigningKeyStatus::Active,
            created_at: now,
            expires_at,
        })
    }

    /// Fetch and decrypt a key. Revoked keys are reported as `Expired`; an
    /// undecryptable envelope is logged and treated as missing.
    pub async fn get_key_by_id(&self, id: &str) -> AppResult<Option<SigningKey>> {
        let Some(raw) = self.kv.get(&storage_key(id)).await? else {
            return Ok(None);
        };

        let stored: StoredKey = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(key_id = %id, error = %err, "discarding malformed key record");
                return Ok(None);
            }
        };

        let secret = match self.crypto.decrypt(&stored.secret) {
            Ok(secret) => secret,
            Err(err) => {
                warn!(key_id = %id, error = %err, "cannot decrypt signing key envelope");
                return Ok(None);
            }
        };

        let revoked = self.kv.set_contains(REVOKED_SET, id).await?;
        let status = if revoked {
            SigningKeyStatus::Expired
        } else {
            stored.status
        };

        Ok(Some(SigningKey {
            id: stored.id,
            secret,
            algorithm: stored.algorithm,
            status,
            created_at: DateTime::from_timestamp(stored.created_at, 0).unwrap_or_else(Utc::now),
            expires_at: DateTime::from_timestamp(stored.expires_at, 0).unwrap_or_else(Utc::now),
        }))
    }

    /// All non-expired keys with status active or rotating, newest first.
    pub async fn get_active_keys(&self) -> AppResult<Vec<SigningKey>> {
        let now = Utc::now();
        let mut keys = Vec::new();

        for id in self.kv.set_members(ALL_KEYS_SET).await? {
            if let Some(key) = self.get_key_by_id(&id).await? {
                if key.status != SigningKeyStatus::Expired && key.expires_at > now {
                    keys.push(key);
                }
            }
        }

        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    pub async fn get_current_signing_key_id(&self) -> AppResult<Option<String>> {
        Ok(self.kv.get(CURRENT_KEY).await?)
    }

    /// The key tokens are signed with right now, if one is usable.
    pub async fn current_signing_key(&self) -> AppResult<Option<SigningKey>> {
        let Some(id) = self.get_current_signing_key_id().await? else {
            return Ok(None);
        };
        let key = self.get_key_by_id(&id).await?;
        Ok(key.filter(|k| k.usable_for_verification(Utc::now())))
    }

    /// Make sure a current signing key exists. Called once at startup before
    /// the first token can be issued.
    pub async fn ensure_signing_key(&self) -> AppResult<()> {
        if self.current_signing_key().await?.is_none() {
            self.generate_new_key().await?;
        }
        Ok(())
    }

    /// Rotate if the current key has reached the rotation interval. Returns
    /// whether a rotation happened.
    pub async fn rotate_keys(&self) -> AppResult<bool> {
        let now = Utc::now();

        let previous = match self.get_current_signing_key_id().await? {
            Some(id) => self.get_key_by_id(&id).await?,
            None => None,
        };

        if let Some(current) = &previous {
            let age = now - current.created_at;
            if age < ChronoDuration::seconds(self.settings.interval_secs as i64) {
                return Ok(false);
            }
        }

        let new_key = self.generate_new_key().await?;
        self.kv.set(CURRENT_KEY, &new_key.id).await?;

        if let Some(prev) = previous {
            self.update_status(&prev.id, SigningKeyStatus::Rotating)
                .await?;
        }

        self.trim_active_keys().await?;
        self.cleanup_expired_records().await?;

        self.publish_event("key_rotated", &new_key.id).await?;
        info!(key_id = %new_key.id, "signing key rotated");

        Ok(true)
    }

    /// Revoke a key immediately: it stops verifying even inside its TTL.
    pub async fn revoke_key(&self, id: &str) -> AppResult<()> {
        self.kv.set_add(REVOKED_SET, id).await?;
        if let Err(err) = self.update_status(id, SigningKeyStatus::Expired).await {
            warn!(key_id = %id, error = %err, "revoked key record could not be updated");
        }
        self.publish_event("key_revoked", id).await?;
        info!(key_id = %id, "signing key revoked");
        Ok(())
    }

    /// Scheduled entry point: one process at a time runs the rotation check.
    pub async fn check_and_rotate_keys(&self) -> AppResult<()> {
        let acquired = self
            .kv
            .set_if_absent(ROTATION_LOCK, &self.node_nonce, self.settings.lock_ttl())
            .await?;
        if !acquired {
            return Ok(());
        }

        let outcome = self.rotate_keys().await;

        // Release only a lock we still own; losing it to TTL expiry mid-run is
        // logged, not undone.
        match self.kv.get(ROTATION_LOCK).await? {
            Some(owner) if owner == self.node_nonce => {
                self.kv.delete(ROTATION_LOCK).await?;
            }
            _ => {
                warn!("rotation lock expired before release; possible overlapping rotation");
            }
        }

        outcome.map(|_| ())
    }

    async fn write_stored(&self, stored: &StoredKey, ttl: Duration) -> AppResult<()> {
        let raw = serde_json::to_string(stored)
            .map_err(|e| AppError::Internal(format!("encode key record: {e}")))?;
        self.kv.set_ex(&storage_key(&stored.id), &raw, ttl).await?;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: SigningKeyStatus) -> AppResult<()> {
        let Some(raw) = self.kv.get(&storage_key(id)).await? else {
            return Ok(());
        };
        let Ok(mut stored) = serde_json::from_str::<StoredKey>(&raw) else {
            return Ok(());
        };

        stored.status = status;
        let remaining = (stored.expires_at - Utc::now().timestamp()).max(1) as u64;
        self.write_stored(&stored, Duration::from_secs(remaining))
            .await
    }

    /// Keep only the newest `max_active_keys` non-expired keys; older ones
    /// stop signing and verifying.
    async fn trim_active_keys(&self) -> AppResult<()> {
        let active = self.get_active_keys().await?;
        for key in active.iter().skip(self.settings.max_active_keys) {
            self.update_status(&key.id, SigningKeyStatus::Expired)
                .await?;
            info!(key_id = %key.id, "expired signing key beyond active window");
        }
        Ok(())
    }

    /// Drop set members whose envelope is past TTL.
    async fn cleanup_expired_records(&self) -> AppResult<()> {
        for id in self.kv.set_members(ALL_KEYS_SET).await? {
            if self.kv.get(&storage_key(&id)).await?.is_none() {
                self.kv.set_remove(ALL_KEYS_SET, &id).await?;
                self.kv.set_remove(REVOKED_SET, &id).await?;
            }
        }
        Ok(())
    }

    async fn publish_event(&self, event: &str, key_id: &str) -> AppResult<()> {
        let payload = serde_json::to_string(&KeyEvent {
            event: event.to_string(),
            key_id: key_id.to_string(),
            at: Utc::now().timestamp(),
        })
        .map_err(|e| AppError::Internal(format!("encode key event: {e}")))?;
        self.kv.publish(KEY_UPDATES_CHANNEL, &payload).await?;
        Ok(())
    }
}
