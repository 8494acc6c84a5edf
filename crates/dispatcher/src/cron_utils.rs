//! CRON表达式解析和调度工具
//!
//! 接受标准的5字段Unix表达式 (分 时 日 月 周, 周日为0或7), 转换为 `cron` crate
//! 使用的带秒字段格式。6/7字段表达式按 `cron` crate 的语法原样解析。

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use cronpool_core::{SchedulerError, SchedulerResult};

/// 向前搜索最近一次触发时间时依次尝试的窗口
const LOOKBACK_WINDOWS_DAYS: [i64; 4] = [1, 31, 366, 3660];

/// CRON表达式解析和调度工具
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize_expression(cron_expr)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `after` 的下一次触发时间
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 区间 `(after, until]` 内最晚的一次触发时间
    ///
    /// `after` 为空时不设下界。错过的多次触发由此合并为一次补跑。
    pub fn latest_occurrence_between(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        for days in LOOKBACK_WINDOWS_DAYS {
            let window_start = until - Duration::days(days);
            let (start, covers_lower_bound) = match after {
                Some(after) if after >= window_start => (after, true),
                _ => (window_start, false),
            };

            let latest = self
                .schedule
                .after(&start)
                .take_while(|t| *t <= until)
                .last();

            if latest.is_some() || covers_lower_bound {
                return latest;
            }
        }

        debug!("表达式 {} 在回溯窗口内没有触发时间", self.expression);
        None
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_occurrence(now).map(|next| next - now)
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 纯函数形式的下一次触发时间计算
pub fn next_occurrence(
    cron_expr: &str,
    after: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    Ok(CronScheduler::new(cron_expr)?.next_occurrence(after))
}

/// 把5字段Unix表达式转换为带秒字段的格式
pub fn normalize_expression(cron_expr: &str) -> SchedulerResult<String> {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = translate_day_of_week(cron_expr, fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], day_of_week
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: format!("需要5、6或7个字段, 实际为{n}个"),
        }),
    }
}

/// Unix周字段 (0-7, 周日为0和7) 转为 `cron` crate 的编号 (1-7, 周日为1)
///
/// 数字项展开为显式列表, 名称 (`MON`、`Fri` 等) 和 `*`/`?` 保持不变。
fn translate_day_of_week(cron_expr: &str, field: &str) -> SchedulerResult<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let invalid = |message: String| SchedulerError::InvalidCron {
        expr: cron_expr.to_string(),
        message,
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("无效的周字段步长: {item}")))?;
                if step == 0 {
                    return Err(invalid(format!("周字段步长不能为0: {item}")));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let bounds = if range == "*" {
            Some((0, 6))
        } else if let Some((start, end)) = range.split_once('-') {
            match (start.parse::<u32>(), end.parse::<u32>()) {
                (Ok(start), Ok(end)) => Some((start, end)),
                _ => None,
            }
        } else {
            match range.parse::<u32>() {
                Ok(day) if step > 1 => Some((day, 6)),
                Ok(day) => Some((day, day)),
                Err(_) => None,
            }
        };

        // 名称形式交给 cron crate 解析
        let Some((start, end)) = bounds else {
            items.push(item.to_string());
            continue;
        };

        if start > 7 || end > 7 {
            return Err(invalid(format!("周字段取值超出0-7: {item}")));
        }
        if start > end {
            return Err(invalid(format!("周字段范围无效: {item}")));
        }

        let mut day = start;
        while day <= end {
            items.push(((day % 7) + 1).to_string());
            day += step;
        }
    }

    items.dedup();
    Ok(items.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(normalize_expression("*/10 * * * *").unwrap(), "0 */10 * * * *");
        assert_eq!(normalize_expression("0 0 * * * *").unwrap(), "0 0 * * * *");
        assert!(normalize_expression("* * *").is_err());
        assert!(normalize_expression("").is_err());
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(normalize_expression("0 9 * * 1-5").unwrap(), "0 0 9 * * 2,3,4,5,6");
        assert_eq!(normalize_expression("0 9 * * 0").unwrap(), "0 0 9 * * 1");
        assert_eq!(normalize_expression("0 9 * * 7").unwrap(), "0 0 9 * * 1");
        assert_eq!(normalize_expression("0 9 * * */2").unwrap(), "0 0 9 * * 1,3,5,7");
        assert_eq!(normalize_expression("0 9 * * MON").unwrap(), "0 0 9 * * MON");
        assert!(normalize_expression("0 9 * * 8").is_err());
        assert!(normalize_expression("0 9 * * 5-2").is_err());
    }

    #[test]
    fn test_weekday_schedule_uses_unix_numbering() {
        // 2024-01-01 是周一
        let scheduler = CronScheduler::new("30 8 * * 1-5").unwrap();
        let friday_evening = Utc.with_ymd_and_hms(2024, 1, 5, 20, 0, 0).unwrap();
        let next = scheduler.next_occurrence(friday_evening).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.day(), 8);

        let sunday = CronScheduler::new("0 0 * * 0").unwrap();
        let next = sunday.next_occurrence(at(0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronScheduler::validate_cron_expression("invalid").is_err());
        assert!(CronScheduler::validate_cron_expression("0 0 32 * *").is_err());
        assert!(CronScheduler::validate_cron_expression("").is_err());
        assert!(matches!(
            CronScheduler::new("61 * * * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_next_occurrence_is_strictly_after() {
        let scheduler = CronScheduler::new("*/10 * * * *").unwrap();
        assert_eq!(scheduler.next_occurrence(at(0, 0)), Some(at(0, 10)));
        assert_eq!(scheduler.next_occurrence(at(0, 5)), Some(at(0, 10)));
        assert_eq!(
            next_occurrence("0 * * * *", at(0, 30)).unwrap(),
            Some(at(1, 0))
        );
    }

    #[test]
    fn test_next_occurrence_is_monotonic() {
        let scheduler = CronScheduler::new("7,23 */3 * * *").unwrap();
        let mut previous = at(0, 0);
        for _ in 0..50 {
            let next = scheduler.next_occurrence(previous).unwrap();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_latest_occurrence_between() {
        let scheduler = CronScheduler::new("*/10 * * * *").unwrap();

        assert_eq!(
            scheduler.latest_occurrence_between(Some(at(0, 0)), at(0, 45)),
            Some(at(0, 40))
        );
        assert_eq!(
            scheduler.latest_occurrence_between(Some(at(0, 0)), at(0, 50)),
            Some(at(0, 50))
        );
        assert_eq!(
            scheduler.latest_occurrence_between(Some(at(0, 40)), at(0, 45)),
            None
        );
        assert_eq!(
            scheduler.latest_occurrence_between(None, at(3, 3)),
            Some(at(3, 0))
        );
    }

    #[test]
    fn test_latest_occurrence_over_long_gap() {
        let scheduler = CronScheduler::new("0 0 1 1 *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            scheduler.latest_occurrence_between(None, now),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_upcoming_times() {
        let scheduler = CronScheduler::new("0 * * * *").unwrap();
        let upcoming = scheduler.upcoming_times(at(12, 30), 3);
        assert_eq!(upcoming, vec![at(13, 0), at(14, 0), at(15, 0)]);
        assert_eq!(
            scheduler.time_until_next_execution(at(12, 30)),
            Some(Duration::minutes(30))
        );
    }
}
