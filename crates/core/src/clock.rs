use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// 时间来源抽象
///
/// 所有"当前时间"都从这里获取, 存储层和调度器不直接读取系统时钟,
/// 测试中可以替换为 [`ManualClock`]。
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟, 克隆后共享同一时间
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 租约TTL对应的截止时间: 心跳早于该时间的租约视为已失效
///
/// 结果不早于 Unix 纪元, 保证能写入所有数据库的时间戳列。
pub fn lease_cutoff(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(ttl)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .max(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(other.now(), start + chrono::Duration::minutes(5));

        other.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_lease_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let cutoff = lease_cutoff(now, Duration::from_secs(1800));
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap());

        let cutoff = lease_cutoff(now, Duration::MAX);
        assert_eq!(cutoff, DateTime::<Utc>::UNIX_EPOCH);
    }
}
