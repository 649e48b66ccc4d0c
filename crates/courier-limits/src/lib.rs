pub mod limiter;

pub use limiter::{is_quota_exempt_command, DailyUsage, Decision, LimitReason, RateLimiter};
