//! Abuse ladder for authentication endpoints.
//!
//! Three KV-backed rungs, all surviving process restarts:
//! progressive pre-admission delay per failing IP, a challenge requirement
//! after repeated failures, and an account lockout per email. A successful
//! authentication clears the whole tuple.

use crate::config::AbuseSettings;
use crate::error::{AppError, AppResult};
use kv_store::KeyValueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn fail_key(ip: &str) -> String {
    format!("auth:fail:{ip}")
}

fn captcha_key(ip: &str) -> String {
    format!("auth:captcha:{ip}")
}

fn lockout_key(email_lower: &str) -> String {
    format!("auth:lockout:{email_lower}")
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Default)]
pub struct FailureOutcome {
    /// The email crossed the lockout threshold with this failure; the caller
    /// should flag the user record.
    pub locked_out: bool,
}

pub struct AbuseControl {
    kv: Arc<dyn KeyValueStore>,
    settings: AbuseSettings,
}

impl AbuseControl {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: AbuseSettings) -> Self {
        Self { kv, settings }
    }

    /// Delay applied before admitting the nth consecutive failing attempt.
    pub fn delay_for_attempts(&self, failed_attempts: i64) -> Duration {
        let ladder = &self.settings.progressive_delays_ms;
        let idx = (failed_attempts.max(0) as usize).min(ladder.len().saturating_sub(1));
        Duration::from_millis(ladder[idx])
    }

    /// Gate an authentication attempt by its source IP. Sleeps the
    /// progressive delay, then rejects when a challenge is pending.
    ///
    /// KV read failures are treated as a cache miss: the gate admits rather
    /// than hard-failing authentication on store degradation.
    pub async fn pre_auth_gate(&self, ip: &str) -> AppResult<()> {
        let failed = self.read_counter(&fail_key(ip)).await;
        let delay = self.delay_for_attempts(failed);
        if !delay.is_zero() {
            info!(ip, delay_ms = delay.as_millis() as u64, "progressive auth delay");
            tokio::time::sleep(delay).await;
        }

        if self.read_counter(&captcha_key(ip)).await >= self.settings.challenge_threshold {
            return Err(AppError::AuthChallengeRequired);
        }

        Ok(())
    }

    /// Reject attempts against an email that crossed the lockout threshold.
    /// Checked once the attempt can be attributed to an email.
    pub async fn check_lockout(&self, email_lower: &str) -> AppResult<()> {
        if self.read_counter(&lockout_key(email_lower)).await >= self.settings.lockout_threshold {
            return Err(AppError::AccountLocked {
                retry_after_secs: self.settings.lockout_cooldown_secs,
            });
        }
        Ok(())
    }

    /// Record a failed attempt. The email rung only advances when the attempt
    /// could be attributed to an email.
    pub async fn record_failure(
        &self,
        ip: &str,
        email_lower: Option<&str>,
    ) -> AppResult<FailureOutcome> {
        let window = Duration::from_secs(self.settings.window_secs);

        self.bump_counter(&fail_key(ip), window).await?;
        self.bump_counter(&captcha_key(ip), window).await?;

        let mut outcome = FailureOutcome::default();
        if let Some(email_lower) = email_lower {
            let lockout_count = self
                .bump_counter(
                    &lockout_key(email_lower),
                    Duration::from_secs(self.settings.lockout_window_secs),
                )
                .await?;

            if lockout_count == self.settings.lockout_threshold {
                // The lock now lasts the full cooldown, not just the counting window.
                self.kv
                    .expire(
                        &lockout_key(email_lower),
                        Duration::from_secs(self.settings.lockout_cooldown_secs),
                    )
                    .await?;
                warn!(email = email_lower, "account locked out after repeated failures");
                outcome.locked_out = true;
            }
        }

        Ok(outcome)
    }

    /// Successful authentication clears IP, challenge, and lockout state for
    /// the tuple.
    pub async fn record_success(&self, ip: &str, email_lower: &str) -> AppResult<()> {
        self.kv.delete(&fail_key(ip)).await?;
        self.kv.delete(&captcha_key(ip)).await?;
        self.kv.delete(&lockout_key(email_lower)).await?;
        Ok(())
    }

    /// A solved challenge resets the challenge counter only.
    pub async fn challenge_solved(&self, ip: &str) -> AppResult<()> {
        self.kv.delete(&captcha_key(ip)).await?;
        Ok(())
    }

    async fn read_counter(&self, key: &str) -> i64 {
        match self.kv.get(key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                warn!(key, error = %err, "abuse counter read failed; treating as zero");
                0
            }
        }
    }

    async fn bump_counter(&self, key: &str, window: Duration) -> AppResult<i64> {
        let count = self.kv.increment(key).await?;
        if count == 1 {
            self.kv.expire(key, window).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::MemoryKvStore;

    fn fast_settings() -> AbuseSettings {
        AbuseSettings {
            window_secs: 900,
            challenge_threshold: 3,
            lockout_threshold: 10,
            lockout_window_secs: 1800,
            lockout_cooldown_secs: 1800,
            // Keep the gate fast under test.
            progressive_delays_ms: vec![0, 1, 2, 3, 4],
        }
    }

    fn control() -> AbuseControl {
        AbuseControl::new(Arc::new(MemoryKvStore::new()), fast_settings())
    }

    #[test]
    fn delay_ladder_grows_then_saturates() {
        let control = AbuseControl::new(
            Arc::new(MemoryKvStore::new()),
            AbuseSettings {
                progressive_delays_ms: vec![0, 1000, 5000, 15000, 30000],
                ..fast_settings()
            },
        );

        assert_eq!(control.delay_for_attempts(0), Duration::from_millis(0));
        assert_eq!(control.delay_for_attempts(1), Duration::from_millis(1000));
        assert_eq!(control.delay_for_attempts(2), Duration::from_millis(5000));
        assert_eq!(control.delay_for_attempts(3), Duration::from_millis(15000));
        assert_eq!(control.delay_for_attempts(4), Duration::from_millis(30000));
        // Attempts past the ladder reuse the last rung.
        assert_eq!(control.delay_for_attempts(9), Duration::from_millis(30000));
    }

    #[tokio::test]
    async fn challenge_required_after_three_failures_from_one_ip() {
        let control = control();
        let ip = "198.51.100.7";

        for _ in 0..3 {
            control.record_failure(ip, Some("u@x.io")).await.unwrap();
        }

        assert!(matches!(
            control.pre_auth_gate(ip).await,
            Err(AppError::AuthChallengeRequired)
        ));

        // Solving the challenge resets that rung only.
        control.challenge_solved(ip).await.unwrap();
        assert!(control.pre_auth_gate(ip).await.is_ok());
    }

    #[tokio::test]
    async fn lockout_after_ten_failures_against_one_email() {
        let control = control();

        let mut locked = false;
        for i in 0..10 {
            // Distinct IPs: lockout is per email, not per IP.
            let ip = format!("203.0.113.{i}");
            let outcome = control
                .record_failure(&ip, Some("victim@x.io"))
                .await
                .unwrap();
            locked = outcome.locked_out;
        }
        assert!(locked, "tenth failure should trigger the lockout");

        let err = control.check_lockout("victim@x.io").await.unwrap_err();
        assert!(matches!(err, AppError::AccountLocked { .. }));
        assert!(err.retry_after_secs().unwrap() > 0);
    }

    #[tokio::test]
    async fn success_clears_the_whole_tuple() {
        let control = control();
        let ip = "198.51.100.7";

        for _ in 0..3 {
            control.record_failure(ip, Some("u@x.io")).await.unwrap();
        }
        control.record_success(ip, "u@x.io").await.unwrap();

        assert!(control.pre_auth_gate(ip).await.is_ok());
        assert!(control.check_lockout("u@x.io").await.is_ok());
        assert_eq!(control.read_counter(&fail_key(ip)).await, 0);
        assert_eq!(control.read_counter(&lockout_key("u@x.io")).await, 0);
    }

    #[tokio::test]
    async fn failures_without_an_email_skip_the_lockout_rung() {
        let control = control();

        for i in 0..12 {
            control
                .record_failure(&format!("198.51.100.{i}"), None)
                .await
                .unwrap();
        }
        assert!(control.check_lockout("victim@x.io").await.is_ok());
    }

    #[tokio::test]
    async fn lockout_is_not_triggered_twice() {
        let control = control();

        for i in 0..10 {
            control
                .record_failure(&format!("198.51.100.{i}"), Some("victim@x.io"))
                .await
                .unwrap();
        }
        // The eleventh failure is past the threshold; the flag fired already.
        let outcome = control
            .record_failure("198.51.100.11", Some("victim@x.io"))
            .await
            .unwrap();
        assert!(!outcome.locked_out);
    }
}
