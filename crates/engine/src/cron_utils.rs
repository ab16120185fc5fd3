use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use jobs_core::{JobError, JobResult};

/// 区间内计数的上限，避免高频表达式遍历过久
const MAX_COUNT_BETWEEN: usize = 100;

/// 把Quartz风格的 `?` 统一为 `*`
fn normalize(cron_expr: &str) -> String {
    cron_expr.trim().replace('?', "*")
}

/// CRON表达式解析和调度工具
///
/// 秒级精度（6或7个字段），按本地时区计算触发时间。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> JobResult<Self> {
        let schedule =
            Schedule::from_str(&normalize(cron_expr)).map_err(|e| JobError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> JobResult<()> {
        Self::new(cron_expr).map(|_| ())
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<DateTime<Local>> {
        self.schedule
            .after(&from.with_timezone(&Local))
            .next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times<Tz: TimeZone>(
        &self,
        from: &DateTime<Tz>,
        count: usize,
    ) -> Vec<DateTime<Local>> {
        self.schedule
            .after(&from.with_timezone(&Local))
            .take(count)
            .collect()
    }

    /// 统计 `(from, until]` 区间内的触发次数，最多计到100
    pub fn count_between<Tz: TimeZone>(&self, from: &DateTime<Tz>, until: &DateTime<Tz>) -> usize {
        let until = until.with_timezone(&Local);
        let count = self
            .schedule
            .after(&from.with_timezone(&Local))
            .take_while(|t| *t <= until)
            .take(MAX_COUNT_BETWEEN)
            .count();
        debug!("区间内触发次数: expr={}, count={}", self.expression, count);
        count
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};

    #[test]
    fn test_valid_and_invalid_expressions() {
        assert!(CronScheduler::validate_cron_expression("0 0 2 * * ?").is_ok());
        assert!(CronScheduler::validate_cron_expression("*/5 * * * * *").is_ok());
        assert!(CronScheduler::validate_cron_expression("0 0 12 * * * 2030").is_ok());

        let err = CronScheduler::validate_cron_expression("invalid").unwrap_err();
        match err {
            JobError::InvalidCron { expr, .. } => assert_eq!(expr, "invalid"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(CronScheduler::validate_cron_expression("").is_err());
        assert!(CronScheduler::validate_cron_expression("0 61 * * * *").is_err());
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let scheduler = CronScheduler::new("0 * * * * *").unwrap();
        let now = Local::now();
        let next = scheduler.next_after(&now).unwrap();
        assert!(next > now);
        assert_eq!(next.second(), 0);
        assert!(next - now <= Duration::seconds(60));
    }

    #[test]
    fn test_upcoming_times_are_ordered() {
        let scheduler = CronScheduler::new("*/10 * * * * *").unwrap();
        let times = scheduler.upcoming_times(&Local::now(), 3);
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - times[0], Duration::seconds(10));
        assert_eq!(times[2] - times[1], Duration::seconds(10));
    }

    #[test]
    fn test_count_between_is_capped() {
        let scheduler = CronScheduler::new("* * * * * *").unwrap();
        let from = Local::now();
        assert_eq!(scheduler.count_between(&from, &(from + Duration::seconds(5))), 5);
        assert_eq!(
            scheduler.count_between(&from, &(from + Duration::hours(1))),
            MAX_COUNT_BETWEEN
        );
    }
}
