//! Multi-dimensional admission control.
//!
//! Fixed-window counters on the KV store: one per-chat anti-flood window
//! plus per-user burst/minute/daily windows. Each check is one atomic
//! increment-then-expire-if-new round trip. Storage errors fail open.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::warn;

use courier_core::config::LimitsConfig;
use courier_kv::{Counter, KvStore};

/// Why admission was denied (or degraded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    UserBurst,
    UserMinute,
    UserDaily,
    ChatMinute,
    /// The backing store failed; the request was admitted anyway.
    StorageError,
}

impl LimitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitReason::UserBurst => "user_burst",
            LimitReason::UserMinute => "user_minute",
            LimitReason::UserDaily => "user_daily",
            LimitReason::ChatMinute => "chat_minute",
            LimitReason::StorageError => "storage_error",
        }
    }
}

/// Daily-quota detail attached to `user_daily` denials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyUsage {
    pub used: u64,
    pub limit: u64,
    pub resets_at_utc: DateTime<Utc>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<LimitReason>,
    pub retry_after_seconds: Option<u64>,
    pub daily: Option<DailyUsage>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_seconds: None,
            daily: None,
        }
    }

    fn deny(reason: LimitReason, counter: Counter) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_seconds: Some(counter.ttl_secs.max(1)),
            daily: None,
        }
    }

    fn fail_open() -> Self {
        Self {
            allowed: true,
            reason: Some(LimitReason::StorageError),
            retry_after_seconds: None,
            daily: None,
        }
    }
}

/// Commands exempt from the user-turn quota (still subject to chat-flood).
const QUOTA_EXEMPT_COMMANDS: &[&str] = &["start", "settings", "network", "wallet", "cancel"];

pub fn is_quota_exempt_command(command: &str) -> bool {
    QUOTA_EXEMPT_COMMANDS.contains(&command)
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    cfg: LimitsConfig,
    trusted: HashSet<i64>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, cfg: LimitsConfig) -> Self {
        let trusted = cfg.trusted_ids();
        Self { kv, cfg, trusted }
    }

    /// Per-chat anti-flood window. Tier-independent: trusted users flood
    /// a chat like anyone else.
    pub async fn check_chat_flood(&self, chat_id: i64) -> Decision {
        let key = format!("rl:chat:{chat_id}");
        match self.kv.incr_with_ttl(&key, Duration::from_secs(60)).await {
            Ok(counter) if counter.count > self.cfg.chat_minute_max => {
                Decision::deny(LimitReason::ChatMinute, counter)
            }
            Ok(_) => Decision::allow(),
            Err(e) => {
                warn!(chat_id, error = %e, "rate limit storage error, failing open");
                Decision::fail_open()
            }
        }
    }

    /// Per-user turn quota: burst, then minute, then daily. The first
    /// exceeded window determines the reason.
    pub async fn check_user_turn(&self, user_id: i64) -> Decision {
        let mult = if self.trusted.contains(&user_id) {
            self.cfg.trusted_multiplier.max(1)
        } else {
            1
        };

        let burst = match self
            .kv
            .incr_with_ttl(
                &format!("rl:burst:{user_id}"),
                Duration::from_secs(self.cfg.burst_window_secs),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => return self.fail_open_logged(user_id, &e),
        };
        if burst.count > self.cfg.free_burst_max * mult {
            return Decision::deny(LimitReason::UserBurst, burst);
        }

        let minute = match self
            .kv
            .incr_with_ttl(&format!("rl:minute:{user_id}"), Duration::from_secs(60))
            .await
        {
            Ok(c) => c,
            Err(e) => return self.fail_open_logged(user_id, &e),
        };
        if minute.count > self.cfg.free_minute_max * mult {
            return Decision::deny(LimitReason::UserMinute, minute);
        }

        let now = Utc::now();
        let day_key = format!("rl:daily:{user_id}:{}", now.format("%Y%m%d"));
        let day_ttl = seconds_until_utc_midnight(now) + self.cfg.daily_grace_secs;
        let daily = match self
            .kv
            .incr_with_ttl(&day_key, Duration::from_secs(day_ttl))
            .await
        {
            Ok(c) => c,
            Err(e) => return self.fail_open_logged(user_id, &e),
        };
        let daily_limit = self.cfg.free_daily_max * mult;
        if daily.count > daily_limit {
            let mut decision = Decision::deny(LimitReason::UserDaily, daily);
            decision.daily = Some(DailyUsage {
                used: daily.count,
                limit: daily_limit,
                resets_at_utc: next_utc_midnight(now),
            });
            return decision;
        }

        Decision::allow()
    }

    /// Whether a denial notice should reach the user. One notice per
    /// (user, reason) per cooldown window, so denial storms stay quiet.
    pub async fn should_notify(&self, user_id: i64, reason: LimitReason) -> bool {
        let key = format!("rl:notice:{user_id}:{}", reason.as_str());
        match self
            .kv
            .set_nx_px(
                &key,
                "1",
                Duration::from_secs(self.cfg.notice_cooldown_secs),
            )
            .await
        {
            Ok(set) => set,
            Err(e) => {
                warn!(user_id, error = %e, "notice cooldown storage error, suppressing notice");
                false
            }
        }
    }

    fn fail_open_logged(&self, user_id: i64, e: &courier_kv::KvError) -> Decision {
        warn!(user_id, error = %e, "rate limit storage error, failing open");
        Decision::fail_open()
    }
}

/// Whole seconds from `now` to the next UTC midnight.
pub fn seconds_until_utc_midnight(now: DateTime<Utc>) -> u64 {
    (next_utc_midnight(now) - now).num_seconds().max(0) as u64
}

pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    Utc.with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_kv::{KvError, MemoryKv};

    fn cfg() -> LimitsConfig {
        LimitsConfig {
            burst_window_secs: 3,
            chat_minute_max: 20,
            free_burst_max: 3,
            free_minute_max: 100,
            free_daily_max: 1000,
            trusted_multiplier: 5,
            notice_cooldown_secs: 20,
            trusted_user_ids: String::new(),
            daily_grace_secs: 300,
        }
    }

    fn limiter(cfg: LimitsConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryKv::new()), cfg)
    }

    #[tokio::test]
    async fn burst_denies_fourth_message() {
        let rl = limiter(cfg());
        for _ in 0..3 {
            assert!(rl.check_user_turn(2001).await.allowed);
        }
        let fourth = rl.check_user_turn(2001).await;
        assert!(!fourth.allowed);
        assert_eq!(fourth.reason, Some(LimitReason::UserBurst));
        assert!(fourth.retry_after_seconds.unwrap() >= 1);
    }

    #[tokio::test]
    async fn fresh_window_first_request_allowed() {
        let mut c = cfg();
        c.burst_window_secs = 1;
        let rl = limiter(c);
        for _ in 0..4 {
            rl.check_user_turn(7).await;
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(rl.check_user_turn(7).await.allowed);
    }

    #[tokio::test]
    async fn daily_denial_reports_usage() {
        let mut c = cfg();
        c.free_burst_max = 1000;
        c.free_minute_max = 1000;
        c.free_daily_max = 300;
        let rl = limiter(c);
        for _ in 0..300 {
            assert!(rl.check_user_turn(9).await.allowed);
        }
        let last = rl.check_user_turn(9).await;
        assert!(!last.allowed);
        assert_eq!(last.reason, Some(LimitReason::UserDaily));
        let daily = last.daily.unwrap();
        assert_eq!(daily.used, 301);
        assert_eq!(daily.limit, 300);
        assert!(daily.resets_at_utc > Utc::now());
    }

    #[tokio::test]
    async fn trusted_users_get_multiplier() {
        let mut c = cfg();
        c.trusted_user_ids = "42".into();
        let rl = limiter(c);
        // 5x multiplier: 15 burst messages pass where 3 would for free tier.
        for _ in 0..15 {
            assert!(rl.check_user_turn(42).await.allowed);
        }
        assert!(!rl.check_user_turn(42).await.allowed);
    }

    #[tokio::test]
    async fn chat_flood_is_tier_independent() {
        let mut c = cfg();
        c.chat_minute_max = 2;
        c.trusted_user_ids = "42".into();
        let rl = limiter(c);
        assert!(rl.check_chat_flood(-100).await.allowed);
        assert!(rl.check_chat_flood(-100).await.allowed);
        let third = rl.check_chat_flood(-100).await;
        assert!(!third.allowed);
        assert_eq!(third.reason, Some(LimitReason::ChatMinute));
    }

    #[tokio::test]
    async fn notice_cooldown_suppresses_repeats() {
        let rl = limiter(cfg());
        assert!(rl.should_notify(5, LimitReason::UserBurst).await);
        assert!(!rl.should_notify(5, LimitReason::UserBurst).await);
        // Different reason gets its own cooldown key.
        assert!(rl.should_notify(5, LimitReason::UserDaily).await);
    }

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn incr_with_ttl(&self, _: &str, _: Duration) -> courier_kv::Result<Counter> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn set_nx_px(&self, _: &str, _: &str, _: Duration) -> courier_kv::Result<bool> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn get(&self, _: &str) -> courier_kv::Result<Option<String>> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn expire_if_eq(&self, _: &str, _: &str, _: Duration) -> courier_kv::Result<bool> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn delete_if_eq(&self, _: &str, _: &str) -> courier_kv::Result<bool> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> courier_kv::Result<()> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> courier_kv::Result<()> {
            Err(KvError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn storage_error_fails_open() {
        let rl = RateLimiter::new(Arc::new(FailingKv), cfg());
        let user = rl.check_user_turn(1).await;
        assert!(user.allowed);
        assert_eq!(user.reason, Some(LimitReason::StorageError));
        let chat = rl.check_chat_flood(1).await;
        assert!(chat.allowed);
        assert_eq!(chat.reason, Some(LimitReason::StorageError));
    }

    #[test]
    fn midnight_math_matches_utc_calendar() {
        let noon = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        assert_eq!(
            next_utc_midnight(noon),
            Utc.with_ymd_and_hms(2026, 2, 23, 0, 0, 0).unwrap()
        );
        assert_eq!(seconds_until_utc_midnight(noon), 12 * 3600);
    }

    #[test]
    fn command_exemptions() {
        for c in ["start", "settings", "network", "wallet", "cancel"] {
            assert!(is_quota_exempt_command(c));
        }
        assert!(!is_quota_exempt_command("balance"));
    }
}
