//! Configuration management for the voice service.
//!
//! Settings load from environment variables, with a `.env` file honored in
//! debug builds. Missing required variables fail startup (exit code 1 from
//! `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub jwt: JwtSettings,
    pub key_rotation: KeyRotationSettings,
    pub rate_limit: RateLimitSettings,
    pub abuse: AbuseSettings,
    pub free_tier: FreeTierSettings,
    pub apple: AppleSettings,
    pub push: PushSettings,
    pub providers: ProviderSettings,
    pub encryption: EncryptionSettings,
    pub storage: StorageSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
        }

        Ok(Settings {
            server: ServerSettings::from_env()?,
            database: DatabaseSettings::from_env()?,
            redis: RedisSettings::from_env(),
            jwt: JwtSettings::from_env()?,
            key_rotation: KeyRotationSettings::from_env()?,
            rate_limit: RateLimitSettings::from_env()?,
            abuse: AbuseSettings::from_env()?,
            free_tier: FreeTierSettings::from_env()?,
            apple: AppleSettings::from_env()?,
            push: PushSettings::from_env()?,
            providers: ProviderSettings::from_env()?,
            encryption: EncryptionSettings::from_env()?,
            storage: StorageSettings::from_env(),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env_or(name, default);
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid {name}: {e}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or("SERVER_HOST", "0.0.0.0"),
            port: parse_env("SERVER_PORT", "8080")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "20")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

impl RedisSettings {
    fn from_env() -> Self {
        Self {
            url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
        }
    }
}

/// Session token settings. `secret` is the legacy signing secret used when no
/// key-ring key exists; tokens issued with it carry no key identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    pub secret: String,
    pub expires_in_secs: u64,
}

impl JwtSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            // 7 days
            expires_in_secs: parse_env("JWT_EXPIRES_IN_SECS", "604800")?,
        })
    }

    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotationSettings {
    pub interval_secs: u64,
    pub grace_period_secs: u64,
    pub max_active_keys: usize,
    pub check_interval_secs: u64,
    pub lock_ttl_secs: u64,
}

impl KeyRotationSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            // 30 days
            interval_secs: parse_env("KEY_ROTATION_INTERVAL_SECS", "2592000")?,
            // 7 days
            grace_period_secs: parse_env("KEY_ROTATION_GRACE_SECS", "604800")?,
            max_active_keys: parse_env("KEY_ROTATION_MAX_ACTIVE", "3")?,
            check_interval_secs: parse_env("KEY_ROTATION_CHECK_SECS", "3600")?,
            lock_ttl_secs: parse_env("KEY_ROTATION_LOCK_TTL_SECS", "60")?,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_default: u32,
    pub max_auth: u32,
    pub max_conversations: u32,
    pub max_audio: u32,
    pub max_keys_per_scope: usize,
    pub sweep_interval_secs: u64,
}

impl RateLimitSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            // 15 minutes
            window_ms: parse_env("RATE_LIMIT_WINDOW_MS", "900000")?,
            max_default: parse_env("RATE_LIMIT_MAX_DEFAULT", "100")?,
            max_auth: parse_env("RATE_LIMIT_MAX_AUTH", "5")?,
            max_conversations: parse_env("RATE_LIMIT_MAX_CONVERSATIONS", "60")?,
            max_audio: parse_env("RATE_LIMIT_MAX_AUDIO", "30")?,
            max_keys_per_scope: parse_env("RATE_LIMIT_MAX_KEYS_PER_SCOPE", "10000")?,
            sweep_interval_secs: parse_env("RATE_LIMIT_SWEEP_SECS", "300")?,
        })
    }
}

/// Abuse-ladder settings for authentication endpoints. State lives in the KV
/// store so it survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseSettings {
    pub window_secs: u64,
    pub challenge_threshold: i64,
    pub lockout_threshold: i64,
    pub lockout_window_secs: u64,
    pub lockout_cooldown_secs: u64,
    pub progressive_delays_ms: Vec<u64>,
}

impl AbuseSettings {
    fn from_env() -> Result<Self> {
        let delays_raw = env_or("ABUSE_PROGRESSIVE_DELAYS_MS", "0,1000,5000,15000,30000");
        let progressive_delays_ms = delays_raw
            .split(',')
            .map(|s| s.trim().parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid ABUSE_PROGRESSIVE_DELAYS_MS")?;

        Ok(Self {
            window_secs: parse_env("ABUSE_WINDOW_SECS", "900")?,
            challenge_threshold: parse_env("ABUSE_CHALLENGE_THRESHOLD", "3")?,
            lockout_threshold: parse_env("ABUSE_LOCKOUT_THRESHOLD", "10")?,
            // 30 minutes
            lockout_window_secs: parse_env("ABUSE_LOCKOUT_WINDOW_SECS", "1800")?,
            lockout_cooldown_secs: parse_env("ABUSE_LOCKOUT_COOLDOWN_SECS", "1800")?,
            progressive_delays_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTierSettings {
    pub weekly_conversation_limit: i64,
}

impl FreeTierSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            weekly_conversation_limit: parse_env("FREE_TIER_WEEKLY_LIMIT", "100")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppleSettings {
    pub issuer: String,
    pub jwks_url: String,
    /// Ordered list of accepted identity-token audiences (app bundle ids).
    pub accepted_audiences: Vec<String>,
    pub jwks_cache_ttl_secs: u64,
    pub result_cache_ttl_secs: u64,
}

impl AppleSettings {
    fn from_env() -> Result<Self> {
        let audiences_raw = env::var("APPLE_ACCEPTED_AUDIENCES")
            .context("APPLE_ACCEPTED_AUDIENCES must be set (comma-separated bundle ids)")?;
        let accepted_audiences: Vec<String> = audiences_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if accepted_audiences.is_empty() {
            anyhow::bail!("APPLE_ACCEPTED_AUDIENCES must contain at least one audience");
        }

        Ok(Self {
            issuer: env_or("APPLE_ISSUER", "https://appleid.apple.com"),
            jwks_url: env_or("APPLE_JWKS_URL", "https://appleid.apple.com/auth/keys"),
            accepted_audiences,
            jwks_cache_ttl_secs: parse_env("APPLE_JWKS_CACHE_TTL_SECS", "3600")?,
            result_cache_ttl_secs: parse_env("APPLE_RESULT_CACHE_TTL_SECS", "60")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSettings {
    pub ping_interval_ms: u64,
    pub auth_timeout_ms: u64,
    pub inactive_timeout_ms: u64,
    pub buffer_max_len: usize,
    pub buffer_ttl_secs: u64,
    pub message_expiry_ms: u64,
}

impl PushSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            ping_interval_ms: parse_env("PUSH_PING_INTERVAL_MS", "30000")?,
            auth_timeout_ms: parse_env("PUSH_AUTH_TIMEOUT_MS", "10000")?,
            inactive_timeout_ms: parse_env("PUSH_INACTIVE_TIMEOUT_MS", "30000")?,
            buffer_max_len: parse_env("PUSH_BUFFER_MAX_LEN", "50")?,
            // 24 hours
            buffer_ttl_secs: parse_env("PUSH_BUFFER_TTL_SECS", "86400")?,
            // 5 minutes
            message_expiry_ms: parse_env("PUSH_MESSAGE_EXPIRY_MS", "300000")?,
        })
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub transcription_url: String,
    pub transcription_api_key: Option<String>,
    pub analysis_url: String,
    pub analysis_api_key: Option<String>,
    pub analysis_model: String,
    pub subscription_url: Option<String>,
    pub timeout_secs: u64,
}

impl ProviderSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            transcription_url: env_or(
                "TRANSCRIPTION_URL",
                "https://api.openai.com/v1/audio/transcriptions",
            ),
            transcription_api_key: env::var("TRANSCRIPTION_API_KEY").ok(),
            analysis_url: env_or("ANALYSIS_URL", "https://api.openai.com/v1/chat/completions"),
            analysis_api_key: env::var("ANALYSIS_API_KEY").ok(),
            analysis_model: env_or("ANALYSIS_MODEL", "gpt-4o"),
            subscription_url: env::var("SUBSCRIPTION_URL").ok(),
            timeout_secs: parse_env("PROVIDER_TIMEOUT_SECS", "30")?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub server_secret: String,
}

impl EncryptionSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            server_secret: env::var("ENCRYPTION_SECRET")
                .context("ENCRYPTION_SECRET must be set")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub audio_dir: String,
}

impl StorageSettings {
    fn from_env() -> Self {
        Self {
            audio_dir: env_or("AUDIO_STORAGE_DIR", "./data/audio"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_settings_split_audiences() {
        env::set_var(
            "APPLE_ACCEPTED_AUDIENCES",
            "com.attune.app, com.attune.app.dev",
        );

        let settings = AppleSettings::from_env().unwrap();
        assert_eq!(
            settings.accepted_audiences,
            vec!["com.attune.app", "com.attune.app.dev"]
        );
        assert_eq!(settings.issuer, "https://appleid.apple.com");

        env::remove_var("APPLE_ACCEPTED_AUDIENCES");
    }

    #[test]
    fn abuse_settings_defaults_match_ladder() {
        let settings = AbuseSettings::from_env().unwrap();
        assert_eq!(
            settings.progressive_delays_ms,
            vec![0, 1000, 5000, 15000, 30000]
        );
        assert_eq!(settings.challenge_threshold, 3);
        assert_eq!(settings.lockout_threshold, 10);
        assert_eq!(settings.lockout_window_secs, 1800);
    }

    #[test]
    fn key_rotation_defaults() {
        let settings = KeyRotationSettings::from_env().unwrap();
        assert_eq!(settings.interval_secs, 30 * 24 * 3600);
        assert_eq!(settings.grace_period_secs, 7 * 24 * 3600);
        assert_eq!(settings.max_active_keys, 3);
        assert_eq!(settings.lock_ttl_secs, 60);
    }

    #[test]
    fn push_settings_defaults() {
        let settings = PushSettings::from_env().unwrap();
        assert_eq!(settings.buffer_max_len, 50);
        assert_eq!(settings.buffer_ttl_secs, 86400);
        assert_eq!(settings.message_expiry_ms, 300000);
        assert_eq!(settings.auth_timeout(), Duration::from_secs(10));
    }
}
