//! Authenticated symmetric encryption for at-rest key material.
//!
//! A 256-bit key is derived from the server secret with Argon2id over a fixed
//! versioned salt. Records are sealed with AES-256-GCM under a random 96-bit
//! IV and stored as an [`Envelope`]. The salt version is recorded in the
//! envelope so readers keep accepting records sealed under older salt
//! generations after a rotation.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Known KDF salt generations, oldest first. Adding a generation bumps the
/// write version; every listed generation stays readable.
const SALT_VERSIONS: &[(u8, &[u8])] = &[(1, b"attune/keyring/kdf-salt/v1")];

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation error")]
    KeyDerivation,
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("unknown envelope version {0}")]
    UnknownVersion(u8),
    #[error("malformed envelope")]
    Malformed,
}

/// Stored form of an encrypted record. All byte fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub algo_version: u8,
}

/// Derives per-version keys once at construction; encrypt always writes the
/// newest version, decrypt accepts any known one.
pub struct EncryptionService {
    keys: HashMap<u8, [u8; 32]>,
    write_version: u8,
}

impl EncryptionService {
    pub fn new(server_secret: &str) -> Result<Self, CryptoError> {
        let mut keys = HashMap::new();
        let mut write_version = 0;

        for (version, salt) in SALT_VERSIONS {
            let mut key = [0u8; 32];
            Argon2::default()
                .hash_password_into(server_secret.as_bytes(), salt, &mut key)
                .map_err(|_| CryptoError::KeyDerivation)?;
            keys.insert(*version, key);
            write_version = (*version).max(write_version);
        }

        Ok(Self {
            keys,
            write_version,
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let key = self
            .keys
            .get(&self.write_version)
            .ok_or(CryptoError::UnknownVersion(self.write_version))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        // AES-GCM appends the tag; the envelope stores it separately.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(Envelope {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(iv),
            tag: BASE64.encode(tag),
            algo_version: self.write_version,
        })
    }

    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .keys
            .get(&envelope.algo_version)
            .ok_or(CryptoError::UnknownVersion(envelope.algo_version))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let iv = BASE64
            .decode(&envelope.iv)
            .map_err(|_| CryptoError::Malformed)?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Malformed);
        }
        let mut sealed = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| CryptoError::Malformed)?;
        let tag = BASE64
            .decode(&envelope.tag)
            .map_err(|_| CryptoError::Malformed)?;
        if tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed);
        }
        sealed.extend_from_slice(&tag);

        cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CryptoError::Decryption)
    }
}

/// Random bytes for secret material (signing keys, lock nonces).
pub fn generate_secret(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let svc = EncryptionService::new("server-secret").unwrap();
        let envelope = svc.encrypt(b"signing key material").unwrap();
        assert_eq!(svc.decrypt(&envelope).unwrap(), b"signing key material");
    }

    #[test]
    fn distinct_ivs_per_record() {
        let svc = EncryptionService::new("server-secret").unwrap();
        let a = svc.encrypt(b"same plaintext").unwrap();
        let b = svc.encrypt(b"same plaintext").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let svc = EncryptionService::new("server-secret").unwrap();
        let mut envelope = svc.encrypt(b"payload").unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = BASE64.encode(raw);
        assert!(matches!(
            svc.decrypt(&envelope),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn tampered_tag_rejected() {
        let svc = EncryptionService::new("server-secret").unwrap();
        let mut envelope = svc.encrypt(b"payload").unwrap();
        let mut tag = BASE64.decode(&envelope.tag).unwrap();
        tag[0] ^= 0x01;
        envelope.tag = BASE64.encode(tag);
        assert!(matches!(
            svc.decrypt(&envelope),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn wrong_secret_cannot_decrypt() {
        let writer = EncryptionService::new("secret-a").unwrap();
        let reader = EncryptionService::new("secret-b").unwrap();
        let envelope = writer.encrypt(b"payload").unwrap();
        assert!(reader.decrypt(&envelope).is_err());
    }

    #[test]
    fn unknown_version_rejected() {
        let svc = EncryptionService::new("server-secret").unwrap();
        let mut envelope = svc.encrypt(b"payload").unwrap();
        envelope.algo_version = 99;
        assert!(matches!(
            svc.decrypt(&envelope),
            Err(CryptoError::UnknownVersion(99))
        ));
    }

    #[test]
    fn envelope_serializes_stably() {
        let svc = EncryptionService::new("server-secret").unwrap();
        let envelope = svc.encrypt(b"payload").unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(svc.decrypt(&parsed).unwrap(), b"payload");
    }
}
