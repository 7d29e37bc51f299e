//! Free-tier weekly quota, consulted before conversation creation.
//!
//! The counter is keyed by ISO week in the KV store and expires at the next
//! Sunday 00:00 UTC. Paying users bypass the limit; when the subscription
//! service cannot answer, the gate fails open for users last known to be
//! paying and closed (free-tier limits apply) for unknown status, with an
//! alerting log either way.

use crate::error::{AppError, AppResult};
use crate::services::subscription::{Entitlement, EntitlementChecker};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use kv_store::KeyValueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Remembered entitlement, so a flapping subscription service does not lock
/// paying users out.
const LAST_KNOWN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

fn quota_key(user_id: Uuid, now: DateTime<Utc>) -> String {
    let iso = now.iso_week();
    format!("quota:{}:{}-W{:02}", user_id, iso.year(), iso.week())
}

fn last_known_key(user_id: Uuid) -> String {
    format!("sub:ent:{user_id}")
}

/// The next Sunday 00:00 UTC strictly after `now`.
pub fn next_sunday_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_ahead = 7 - now.weekday().num_days_from_sunday() as i64;
    let next = now.date_naive() + ChronoDuration::days(days_ahead);
    Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

pub struct QuotaGate {
    kv: Arc<dyn KeyValueStore>,
    entitlements: Arc<dyn EntitlementChecker>,
    weekly_limit: i64,
}

impl QuotaGate {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        entitlements: Arc<dyn EntitlementChecker>,
        weekly_limit: i64,
    ) -> Self {
        Self {
            kv,
            entitlements,
            weekly_limit,
        }
    }

    /// Admit one conversation creation, counting it against the weekly quota
    /// unless the user is entitled past the free tier.
    pub async fn check_and_count(&self, user_id: Uuid) -> AppResult<()> {
        match self.entitlements.entitlement(user_id).await {
            Entitlement::Paying => {
                let _ = self
                    .kv
                    .set_ex(&last_known_key(user_id), "paying", LAST_KNOWN_TTL)
                    .await;
                return Ok(());
            }
            Entitlement::Unknown => {
                let last_known = self.kv.get(&last_known_key(user_id)).await.ok().flatten();
                if last_known.as_deref() == Some("paying") {
                    warn!(user_id = %user_id, "entitlement unknown; failing open for last-known paying user");
                    return Ok(());
                }
                warn!(user_id = %user_id, "entitlement unknown; applying free-tier quota");
            }
            Entitlement::Free => {}
        }

        let now = Utc::now();
        let key = quota_key(user_id, now);
        let reset_at = next_sunday_midnight(now);
        let until_reset = (reset_at - now).num_seconds().max(1) as u64;

        let count = self.kv.increment(&key).await?;
        if count == 1 {
            self.kv
                .expire(&key, Duration::from_secs(until_reset))
                .await?;
        }

        if count > self.weekly_limit {
            return Err(AppError::QuotaExceeded {
                retry_after_secs: until_reset,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use kv_store::MemoryKvStore;

    struct FixedEntitlement(Entitlement);

    #[async_trait]
    impl EntitlementChecker for FixedEntitlement {
        async fn entitlement(&self, _user_id: Uuid) -> Entitlement {
            self.0
        }
    }

    fn gate(entitlement: Entitlement, limit: i64) -> QuotaGate {
        QuotaGate::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(FixedEntitlement(entitlement)),
            limit,
        )
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn reset_lands_on_the_next_sunday_midnight() {
        // Wednesday 2025-03-05 → Sunday 2025-03-09.
        assert_eq!(
            next_sunday_midnight(utc(2025, 3, 5, 15)),
            utc(2025, 3, 9, 0)
        );
        // Saturday night rolls into the very next day.
        assert_eq!(
            next_sunday_midnight(utc(2025, 3, 8, 23)),
            utc(2025, 3, 9, 0)
        );
        // On a Sunday the reset is the following Sunday, never "now".
        assert_eq!(
            next_sunday_midnight(utc(2025, 3, 9, 0)),
            utc(2025, 3, 16, 0)
        );
    }

    #[tokio::test]
    async fn free_users_hit_the_weekly_limit() {
        let gate = gate(Entitlement::Free, 3);
        let user = Uuid::now_v7();

        for _ in 0..3 {
            gate.check_and_count(user).await.unwrap();
        }

        let err = gate.check_and_count(user).await.unwrap_err();
        match err {
            AppError::QuotaExceeded { retry_after_secs } => {
                assert!(retry_after_secs > 0);
                // Never more than a week away.
                assert!(retry_after_secs <= 7 * 24 * 3600);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn quotas_are_per_user() {
        let gate = gate(Entitlement::Free, 1);
        let alice = Uuid::now_v7();
        let bob = Uuid::now_v7();

        gate.check_and_count(alice).await.unwrap();
        gate.check_and_count(bob).await.unwrap();
        assert!(gate.check_and_count(alice).await.is_err());
    }

    #[tokio::test]
    async fn paying_users_are_not_limited() {
        let gate = gate(Entitlement::Paying, 1);
        let user = Uuid::now_v7();

        for _ in 0..10 {
            gate.check_and_count(user).await.unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_status_fails_closed_without_history() {
        let gate = gate(Entitlement::Unknown, 1);
        let user = Uuid::now_v7();

        gate.check_and_count(user).await.unwrap();
        assert!(matches!(
            gate.check_and_count(user).await,
            Err(AppError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_status_fails_open_for_last_known_paying() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let user = Uuid::now_v7();

        // A paying check records the entitlement...
        let paying_gate = QuotaGate::new(kv.clone(), Arc::new(FixedEntitlement(Entitlement::Paying)), 1);
        paying_gate.check_and_count(user).await.unwrap();

        // ...so a later outage does not limit the user.
        let outage_gate = QuotaGate::new(kv, Arc::new(FixedEntitlement(Entitlement::Unknown)), 1);
        for _ in 0..5 {
            outage_gate.check_and_count(user).await.unwrap();
        }
    }
}
