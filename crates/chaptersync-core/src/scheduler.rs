//! Dispatch rules: which jobs are due at a given instant.
//!
//! Everything here is a pure function of the current time, so the ticker in
//! [`crate::orchestrator`] can be tested by passing fixed instants. All times
//! are UTC.

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc, Weekday};
use sha2::{Digest, Sha256};

use crate::Config;
use crate::model::{Frequency, IngestionJob};
use crate::store::HourFilter;

/// Tolerance on legacy intervals, so a job checked at 06:00:03 is due again at 06:00.
const LEGACY_SLACK_MINUTES: i64 = 5;

/// Deterministic hour-of-day slot for a job.
///
/// First eight bytes of SHA-256 over `"{work_id}:{job_id}"`, big-endian, mod 24.
pub fn schedule_hour(work_id: &str, job_id: &str) -> u8 {
    let digest = Sha256::digest(format!("{work_id}:{job_id}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 24) as u8
}

/// Calendar rules for the hourly dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    pub weekly_day: Weekday,
    /// Hours at which jobs without a schedule hour are considered.
    pub legacy_hours: Vec<u8>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            weekly_day: Weekday::Sun,
            legacy_hours: vec![0, 6, 12, 18],
        }
    }
}

impl DispatchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            weekly_day: config.weekly_day,
            legacy_hours: config.legacy_hours.clone(),
        }
    }
}

/// One `find_due_jobs` call to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueQuery {
    pub frequency: Frequency,
    pub hour: HourFilter,
}

/// Queries for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub at: DateTime<Utc>,
    /// Hour-matched queries for jobs with a schedule hour.
    pub queries: Vec<DueQuery>,
    /// Whether the legacy quarter-day dispatch runs this tick.
    pub legacy: bool,
}

impl TickPlan {
    /// Every query to issue, the legacy ones included.
    pub fn all_queries(&self) -> Vec<DueQuery> {
        let mut queries = self.queries.clone();
        if self.legacy {
            queries.extend(Frequency::ALL.iter().map(|frequency| DueQuery {
                frequency: *frequency,
                hour: HourFilter::Unassigned,
            }));
        }
        queries
    }
}

/// Whether `frequency`'s cadence window is open on `now`'s day.
pub fn cadence_open(frequency: Frequency, now: DateTime<Utc>, policy: &DispatchPolicy) -> bool {
    match frequency {
        Frequency::Daily => true,
        Frequency::Weekly => now.weekday() == policy.weekly_day,
        Frequency::Monthly => now.day() == 1,
    }
}

/// Plan the tick at `now`.
pub fn plan_tick(now: DateTime<Utc>, policy: &DispatchPolicy) -> TickPlan {
    let hour = now.hour() as u8;
    let queries = Frequency::ALL
        .iter()
        .filter(|f| cadence_open(**f, now, policy))
        .map(|frequency| DueQuery {
            frequency: *frequency,
            hour: HourFilter::At(hour),
        })
        .collect();
    TickPlan {
        at: now,
        queries,
        legacy: policy.legacy_hours.contains(&hour),
    }
}

/// Minimum time between two runs of a legacy job.
pub fn legacy_interval(frequency: Frequency) -> TimeDelta {
    match frequency {
        Frequency::Daily => TimeDelta::days(1),
        Frequency::Weekly => TimeDelta::days(7),
        Frequency::Monthly => TimeDelta::days(30),
    }
}

/// Whether a job without a schedule hour should run in a legacy tick at `now`.
///
/// Never-checked jobs are due; others once their frequency's interval has
/// elapsed since the last check. Jobs with a schedule hour never are.
pub fn legacy_is_due(job: &IngestionJob, now: DateTime<Utc>) -> bool {
    if !job.enabled || job.schedule_hour.is_some() {
        return false;
    }
    match job.last_checked {
        None => true,
        Some(last) => now - last >= legacy_interval(job.frequency) - TimeDelta::minutes(LEGACY_SLACK_MINUTES),
    }
}

/// The next top of the hour strictly after `now`.
pub fn next_hour_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
        + TimeDelta::hours(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn job(schedule_hour: Option<u8>, frequency: Frequency, last: Option<DateTime<Utc>>) -> IngestionJob {
        IngestionJob {
            id: "j1".into(),
            work_id: "w1".into(),
            sources: vec!["https://a.test/x".into()],
            source_url: None,
            frequency,
            enabled: true,
            schedule_hour,
            last_checked: last,
            last_success_index: None,
            last_success_source: None,
            created_at: at(2024, 1, 1, 0, 0),
        }
    }

    #[test]
    fn schedule_hour_is_stable_and_in_range() {
        let h = schedule_hour("work-42", "job-7");
        assert!(h < 24);
        for _ in 0..10 {
            assert_eq!(schedule_hour("work-42", "job-7"), h);
        }
    }

    #[test]
    fn schedule_hour_spreads_jobs() {
        let hours: std::collections::HashSet<u8> = (0..200)
            .map(|i| schedule_hour(&format!("w{i}"), &format!("j{i}")))
            .collect();
        assert!(hours.len() > 12, "only {} distinct hours", hours.len());
    }

    #[test]
    fn ordinary_weekday_runs_only_daily_jobs() {
        // 2024-03-13 is a Wednesday
        let plan = plan_tick(at(2024, 3, 13, 9, 0), &DispatchPolicy::default());
        assert_eq!(
            plan.queries,
            vec![DueQuery {
                frequency: Frequency::Daily,
                hour: HourFilter::At(9)
            }]
        );
        assert!(!plan.legacy);
    }

    #[test]
    fn weekly_day_and_first_of_month_add_queries() {
        // 2024-09-01 is a Sunday and the first of the month
        let plan = plan_tick(at(2024, 9, 1, 14, 0), &DispatchPolicy::default());
        let freqs: Vec<Frequency> = plan.queries.iter().map(|q| q.frequency).collect();
        assert_eq!(freqs, vec![Frequency::Daily, Frequency::Weekly, Frequency::Monthly]);
        assert!(plan.queries.iter().all(|q| q.hour == HourFilter::At(14)));
    }

    #[test]
    fn configured_weekly_day_is_honored() {
        let policy = DispatchPolicy {
            weekly_day: Weekday::Wed,
            ..DispatchPolicy::default()
        };
        let plan = plan_tick(at(2024, 3, 13, 9, 0), &policy);
        assert!(plan.queries.iter().any(|q| q.frequency == Frequency::Weekly));
    }

    #[test]
    fn legacy_hours_add_unassigned_queries() {
        let plan = plan_tick(at(2024, 3, 13, 12, 0), &DispatchPolicy::default());
        assert!(plan.legacy);
        let all = plan.all_queries();
        assert_eq!(all.len(), 4);
        assert_eq!(
            all.iter().filter(|q| q.hour == HourFilter::Unassigned).count(),
            3
        );
    }

    #[test]
    fn legacy_due_rules() {
        let now = at(2024, 3, 13, 12, 0);
        assert!(legacy_is_due(&job(None, Frequency::Daily, None), now));
        assert!(legacy_is_due(
            &job(None, Frequency::Daily, Some(at(2024, 3, 12, 12, 2))),
            now
        ));
        assert!(!legacy_is_due(
            &job(None, Frequency::Daily, Some(at(2024, 3, 13, 6, 0))),
            now
        ));
        assert!(!legacy_is_due(
            &job(None, Frequency::Weekly, Some(at(2024, 3, 10, 12, 0))),
            now
        ));
        assert!(legacy_is_due(
            &job(None, Frequency::Weekly, Some(at(2024, 3, 6, 12, 0))),
            now
        ));
    }

    #[test]
    fn legacy_dispatch_never_touches_assigned_jobs() {
        let now = at(2024, 3, 13, 12, 0);
        assert!(!legacy_is_due(&job(Some(12), Frequency::Daily, None), now));
    }

    #[test]
    fn disabled_jobs_are_never_legacy_due() {
        let mut j = job(None, Frequency::Daily, None);
        j.enabled = false;
        assert!(!legacy_is_due(&j, at(2024, 3, 13, 12, 0)));
    }

    #[test]
    fn next_boundary() {
        assert_eq!(next_hour_boundary(at(2024, 3, 13, 12, 34)), at(2024, 3, 13, 13, 0));
        assert_eq!(next_hour_boundary(at(2024, 3, 13, 23, 0)), at(2024, 3, 14, 0, 0));
    }
}
