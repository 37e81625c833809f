use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};

use crate::app::{app_state, current_timestamp};
use crate::AppSettings;

const RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// A cron-driven background job, persisted in the app settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// 类 crontab 表达式，形如 "0 3 * * *"
    pub cron: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_time: Option<String>,
    #[serde(default)]
    pub last_run_status: Option<String>,
    #[serde(default)]
    pub last_run_message: Option<String>,
}

impl ScheduledTask {
    /// Enabled, every day at 03:00.
    pub fn nightly() -> Self {
        Self {
            cron: "0 3 * * *".to_string(),
            enabled: true,
            last_run_time: None,
            last_run_status: None,
            last_run_message: None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum TaskKind {
    UpdateSubscriptions,
    UpdateRulesets,
}

impl TaskKind {
    fn name(self) -> &'static str {
        match self {
            TaskKind::UpdateSubscriptions => "subscription_auto_update",
            TaskKind::UpdateRulesets => "ruleset_auto_update",
        }
    }

    fn config(self, settings: &AppSettings) -> Option<&ScheduledTask> {
        match self {
            TaskKind::UpdateSubscriptions => settings.subscription_auto_update.as_ref(),
            TaskKind::UpdateRulesets => settings.ruleset_auto_update.as_ref(),
        }
    }

    fn config_mut(self, settings: &mut AppSettings) -> &mut ScheduledTask {
        let slot = match self {
            TaskKind::UpdateSubscriptions => &mut settings.subscription_auto_update,
            TaskKind::UpdateRulesets => &mut settings.ruleset_auto_update,
        };
        slot.get_or_insert_with(ScheduledTask::nightly)
    }

    fn running_flag(self) -> &'static AtomicBool {
        static SUBSCRIPTIONS: AtomicBool = AtomicBool::new(false);
        static RULESETS: AtomicBool = AtomicBool::new(false);
        match self {
            TaskKind::UpdateSubscriptions => &SUBSCRIPTIONS,
            TaskKind::UpdateRulesets => &RULESETS,
        }
    }
}

/// Held while a task runs; a second run of the same task is skipped.
struct RunGuard(&'static AtomicBool);

impl RunGuard {
    fn try_acquire(flag: &'static AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Allowed values of one cron field as a bit set (bit `v` = value `v`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CronField(u64);

impl CronField {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn parse(field: &str, min: u32, max: u32) -> Result<Self, String> {
        let mut bits = 0u64;
        for part in field.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step = step
                        .trim()
                        .parse::<u32>()
                        .map_err(|err| format!("invalid step '{step}' in cron field '{field}': {err}"))?;
                    (range.trim(), step.max(1))
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_value(a, field)?, parse_value(b, field)?)
            } else {
                let value = parse_value(range, field)?;
                (value, value)
            };
            if start > end {
                return Err(format!("invalid range '{start}-{end}' in cron field '{field}'"));
            }
            if start < min || end > max {
                return Err(format!("value out of range {min}-{max} in cron field '{field}'"));
            }

            for value in (start..=end).step_by(step as usize) {
                bits |= 1 << value;
            }
        }
        if bits == 0 {
            return Err(format!("empty cron field '{field}'"));
        }
        Ok(CronField(bits))
    }
}

fn parse_value(raw: &str, field: &str) -> Result<u32, String> {
    raw.trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid value '{raw}' in cron field '{field}': {err}"))
}

/// Standard five-field cron expression, evaluated in local time.
#[derive(Debug, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err("cron expression must have 5 fields".to_string());
        };

        let mut day_of_week = CronField::parse(dow, 0, 7)?;
        // 7 也表示星期日
        if day_of_week.contains(7) {
            day_of_week.0 = (day_of_week.0 & !(1 << 7)) | 1;
        }

        Ok(Self {
            minute: CronField::parse(minute, 0, 59)?,
            hour: CronField::parse(hour, 0, 23)?,
            day_of_month: CronField::parse(dom, 1, 31)?,
            month: CronField::parse(month, 1, 12)?,
            day_of_week,
        })
    }

    fn matches(&self, at: &DateTime<Local>) -> bool {
        self.minute.contains(at.minute())
            && self.hour.contains(at.hour())
            && self.day_of_month.contains(at.day())
            && self.month.contains(at.month())
            && self.day_of_week.contains(at.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `now`, searching at most a year.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = now.with_second(0)?.with_nanosecond(0)?;
        (1..=366 * 24 * 60)
            .map(|m| start + chrono::Duration::minutes(m))
            .find(|candidate| self.matches(candidate))
    }
}

enum RunResult {
    Success,
    Skipped(String),
    Failed(String),
}

async fn execute(kind: TaskKind) -> RunResult {
    let name = kind.name();
    let Some(_guard) = RunGuard::try_acquire(kind.running_flag()) else {
        return RunResult::Skipped("task already running".to_string());
    };

    let result = match kind {
        TaskKind::UpdateSubscriptions => crate::subscriptions::auto_update_subscriptions().await,
        TaskKind::UpdateRulesets => crate::rulesets::auto_update_rulesets().await,
    };

    match result {
        Ok(()) => {
            tracing::info!("scheduler task '{name}' finished successfully");
            RunResult::Success
        }
        Err(err) => {
            tracing::error!("scheduler task '{name}' failed: {err}");
            RunResult::Failed(err)
        }
    }
}

fn record_run(kind: TaskKind, result: &RunResult) {
    let (status, message) = match result {
        RunResult::Success => ("ok", None),
        RunResult::Skipped(msg) => ("skipped", Some(msg.clone())),
        RunResult::Failed(msg) => ("error", Some(msg.clone())),
    };
    let saved = crate::with_app_settings_mut(|settings| {
        let task = kind.config_mut(settings);
        task.last_run_time = Some(current_timestamp());
        task.last_run_status = Some(status.to_string());
        task.last_run_message = message;
    });
    if let Err(err) = saved {
        tracing::error!("scheduler[{}] failed to save settings after run: {err}", kind.name());
    }
}

/// Sleeps unless shutdown comes first. Returns false on shutdown.
async fn sleep_or_shutdown(duration: Duration) -> bool {
    tokio::select! {
        _ = app_state().shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run_loop(kind: TaskKind) {
    let name = kind.name();

    loop {
        let task = kind.config(&crate::get_app_settings_snapshot()).cloned();
        let Some(task) = task.filter(|t| t.enabled) else {
            if !sleep_or_shutdown(RETRY_INTERVAL).await {
                return;
            }
            continue;
        };

        let now = Local::now();
        let next = CronSchedule::parse(task.cron.trim()).and_then(|schedule| {
            schedule
                .next_after(now)
                .ok_or_else(|| "failed to compute next run time from cron expression".to_string())
        });
        let next = match next {
            Ok(next) => next,
            Err(err) => {
                tracing::error!("scheduler[{name}] invalid cron expression '{}': {err}", task.cron);
                record_run(kind, &RunResult::Failed(format!("invalid cron expression: {err}")));
                if !sleep_or_shutdown(RETRY_INTERVAL).await {
                    return;
                }
                continue;
            }
        };

        let wait = (next - now)
            .to_std()
            .ok()
            .filter(|d| *d >= Duration::from_secs(1))
            .unwrap_or(Duration::from_secs(60));
        tracing::info!("scheduler[{name}] next run at {next} (in {wait:?})");

        if !sleep_or_shutdown(wait).await {
            return;
        }
        let result = execute(kind).await;
        record_run(kind, &result);
    }
}

/// 启动所有后台定时任务（订阅与规则集自动更新）。
pub fn start_scheduler() {
    tokio::spawn(run_loop(TaskKind::UpdateSubscriptions));
    tokio::spawn(run_loop(TaskKind::UpdateRulesets));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn fields_support_lists_ranges_and_steps() {
        let field = CronField::parse("1,10-12,*/30", 0, 59).unwrap();
        for v in [0, 1, 10, 11, 12, 30] {
            assert!(field.contains(v), "{v} should match");
        }
        assert!(!field.contains(2));
        assert!(!field.contains(31));

        assert!(CronField::parse("5-1", 0, 59).is_err());
        assert!(CronField::parse("60", 0, 59).is_err());
        assert!(CronField::parse("x", 0, 59).is_err());
    }

    #[test]
    fn sunday_can_be_written_as_seven() {
        let a = CronSchedule::parse("0 3 * * 7").unwrap();
        let b = CronSchedule::parse("0 3 * * 0").unwrap();
        assert_eq!(a, b);
        assert!(CronSchedule::parse("0 3 * *").is_err());
    }

    #[test]
    fn next_run_is_strictly_after_now() {
        let schedule = CronSchedule::parse("0 3 * * *").unwrap();
        let next = schedule.next_after(local(2024, 5, 10, 3, 0)).unwrap();
        assert_eq!(next, local(2024, 5, 11, 3, 0));

        let next = schedule.next_after(local(2024, 5, 10, 1, 15)).unwrap();
        assert_eq!(next, local(2024, 5, 10, 3, 0));
    }

    #[test]
    fn impossible_date_has_no_next_run() {
        let schedule = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert!(schedule.next_after(local(2024, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn second_run_of_a_task_is_refused() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let first = RunGuard::try_acquire(&FLAG);
        assert!(first.is_some());
        assert!(RunGuard::try_acquire(&FLAG).is_none());
        drop(first);
        assert!(RunGuard::try_acquire(&FLAG).is_some());
    }
}
