//! Quota & extension arithmetic. Pure computation over records the caller
//! already fetched; no I/O happens here.

use crate::entities::{assignment, extension, grading_run};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Quota policy limiting a student's grading runs per assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// `max_runs` grading runs per day, resetting at midnight in the
    /// configured timezone. Runs do not carry over between days.
    Daily,
    /// `max_runs` grading runs over the entire assignment period.
    Total,
}

impl Quota {
    pub fn parse(s: &str) -> Option<Quota> {
        match s {
            "daily" => Some(Quota::Daily),
            "total" => Some(Quota::Total),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quota::Daily => "daily",
            Quota::Total => "total",
        }
    }
}

/// Local calendar date of a UNIX timestamp in the given zone. Day boundaries
/// for DAILY quotas are local midnight, not UTC midnight.
fn local_date(ts: i64, tz: Tz) -> NaiveDate {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .with_timezone(&tz)
        .date_naive()
}

pub fn in_grading_period(assignment: &assignment::Model, now: i64) -> bool {
    assignment.start <= now && now <= assignment.end
}

/// Remaining regular (non-extension) runs for a student at `now`, given the
/// student's full run history for this assignment.
pub fn available_runs(
    assignment: &assignment::Model,
    history: &[grading_run::Model],
    now: i64,
    tz: Tz,
) -> i64 {
    if !in_grading_period(assignment, now) {
        return 0;
    }

    match Quota::parse(&assignment.quota) {
        Some(Quota::Total) => (assignment.max_runs - history.len() as i64).max(0),
        Some(Quota::Daily) => {
            let today = local_date(now, tz);
            let today_runs = history
                .iter()
                .filter(|run| local_date(run.timestamp, tz) == today)
                .count() as i64;
            (assignment.max_runs - today_runs).max(0)
        }
        None => {
            tracing::warn!(
                course_id = %assignment.course_id,
                assignment_id = %assignment.assignment_id,
                quota = %assignment.quota,
                "Unknown quota type; treating as no runs available"
            );
            0
        }
    }
}

/// Extensions whose validity window contains `now` (both ends inclusive),
/// with the total remaining runs across them.
pub fn active_extensions(extensions: &[extension::Model], now: i64) -> (Vec<&extension::Model>, i64) {
    let active: Vec<&extension::Model> = extensions
        .iter()
        .filter(|ext| ext.start <= now && now <= ext.end)
        .collect();
    let remaining: i64 = active.iter().map(|ext| ext.remaining_runs).sum();
    (active, remaining)
}

/// The extension a run should consume when the regular quota is exhausted:
/// the soonest-expiring one, so grants about to lapse are not wasted.
pub fn pick_extension<'a>(active: &[&'a extension::Model]) -> Option<&'a extension::Model> {
    active
        .iter()
        .filter(|ext| ext.remaining_runs > 0)
        .min_by_key(|ext| ext.end)
        .copied()
}

/// Round a timestamp up to the next whole minute. Due dates handed to the
/// backend for on-demand runs are minute-aligned so a submission made in the
/// same minute as the trigger still counts.
pub fn round_up_minute(ts: i64) -> i64 {
    if ts % 60 == 0 {
        ts
    } else {
        (ts / 60 + 1) * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Chicago;

    fn assignment(quota: &str, max_runs: i64, start: i64, end: i64) -> assignment::Model {
        assignment::Model {
            course_id: "cs241".to_string(),
            assignment_id: "mp1".to_string(),
            max_runs,
            quota: quota.to_string(),
            start,
            end,
            visibility: "visible".to_string(),
        }
    }

    fn run_at(ts: i64) -> grading_run::Model {
        grading_run::Model {
            run_id: format!("run-{ts}"),
            course_id: "cs241".to_string(),
            assignment_id: "mp1".to_string(),
            netid: "alice".to_string(),
            timestamp: ts,
            extension_used: None,
        }
    }

    fn ext(start: i64, end: i64, remaining: i64) -> extension::Model {
        extension::Model {
            id: end, // unique enough for tests
            course_id: "cs241".to_string(),
            assignment_id: "mp1".to_string(),
            netid: "alice".to_string(),
            max_runs: remaining.max(1),
            remaining_runs: remaining,
            start,
            end,
            run_id: None,
            user_requested: 0,
        }
    }

    const T0: i64 = 1_700_000_000;

    #[test]
    fn test_total_quota_counts_all_history() {
        let a = assignment("total", 2, T0, T0 + 86_400);
        assert_eq!(available_runs(&a, &[], T0 + 100, Chicago), 2);
        assert_eq!(available_runs(&a, &[run_at(T0 + 200)], T0 + 300, Chicago), 1);
        assert_eq!(
            available_runs(&a, &[run_at(T0 + 200), run_at(T0 + 400)], T0 + 500, Chicago),
            0
        );
    }

    #[test]
    fn test_total_quota_never_negative() {
        let a = assignment("total", 1, T0, T0 + 86_400);
        let history = vec![run_at(T0 + 1), run_at(T0 + 2), run_at(T0 + 3)];
        assert_eq!(available_runs(&a, &history, T0 + 10, Chicago), 0);
    }

    #[test]
    fn test_total_quota_non_increasing_with_history() {
        let a = assignment("total", 5, T0, T0 + 86_400);
        let mut history = Vec::new();
        let mut last = available_runs(&a, &history, T0 + 10, Chicago);
        for i in 0..8 {
            history.push(run_at(T0 + 10 + i));
            let next = available_runs(&a, &history, T0 + 100, Chicago);
            assert!(next <= last);
            assert!(next >= 0);
            last = next;
        }
    }

    #[test]
    fn test_outside_grading_period_is_zero() {
        let a = assignment("total", 2, T0, T0 + 86_400);
        assert_eq!(available_runs(&a, &[], T0 - 1, Chicago), 0);
        assert_eq!(available_runs(&a, &[], T0 + 86_401, Chicago), 0);
        // boundaries are inclusive
        assert_eq!(available_runs(&a, &[], T0, Chicago), 2);
        assert_eq!(available_runs(&a, &[], T0 + 86_400, Chicago), 2);
    }

    #[test]
    fn test_daily_quota_resets_at_local_midnight_not_utc() {
        // 2023-11-15 02:00 UTC == 2023-11-14 20:00 in Chicago (UTC-6).
        // A run at that instant and "now" at 2023-11-15 13:00 UTC (07:00
        // Chicago) share a UTC date but fall on different local days, so
        // yesterday's run must not count against today's quota.
        let run_ts = 1_700_013_600; // 2023-11-15T02:00:00Z
        let now = 1_700_053_200; // 2023-11-15T13:00:00Z
        let a = assignment("daily", 1, run_ts - 10, now + 86_400);

        assert_eq!(available_runs(&a, &[run_at(run_ts)], now, Chicago), 1);

        // Same-local-day run does count.
        let later_same_day = now - 3_600; // 06:00 Chicago
        assert_eq!(available_runs(&a, &[run_at(later_same_day)], now, Chicago), 0);
    }

    #[test]
    fn test_daily_quota_only_counts_today() {
        let a = assignment("daily", 2, T0 - 200_000, T0 + 200_000);
        // One run two days ago, one run now.
        let history = vec![run_at(T0 - 172_800), run_at(T0)];
        assert_eq!(available_runs(&a, &history, T0 + 60, Chicago), 1);
    }

    #[test]
    fn test_unknown_quota_rejected() {
        let a = assignment("weekly", 3, T0, T0 + 86_400);
        assert_eq!(available_runs(&a, &[], T0 + 1, Chicago), 0);
    }

    #[test]
    fn test_active_extensions_window_inclusive() {
        let now = T0;
        let exts = vec![
            ext(T0 - 100, now, 2),     // end == now: active
            ext(T0 - 100, now - 1, 3), // expired one second ago: not active
            ext(now + 1, now + 100, 4), // not yet started
        ];
        let (active, remaining) = active_extensions(&exts, now);
        assert_eq!(active.len(), 1);
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_active_extensions_sums_remaining() {
        let exts = vec![ext(T0 - 10, T0 + 10, 1), ext(T0 - 10, T0 + 20, 2)];
        let (active, remaining) = active_extensions(&exts, T0);
        assert_eq!(active.len(), 2);
        assert_eq!(remaining, 3);
    }

    #[test]
    fn test_exhausted_extension_contributes_nothing() {
        let exts = vec![ext(T0 - 10, T0 + 10, 0)];
        let (active, remaining) = active_extensions(&exts, T0);
        // Still time-window-active, but no runs left to contribute.
        assert_eq!(active.len(), 1);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_pick_extension_soonest_end_first() {
        let a = ext(T0 - 10, T0 + 500, 1);
        let b = ext(T0 - 10, T0 + 100, 1);
        let c = ext(T0 - 10, T0 + 300, 1);
        let active = vec![&a, &b, &c];
        let picked = pick_extension(&active).expect("one should be picked");
        assert_eq!(picked.end, T0 + 100);
    }

    #[test]
    fn test_pick_extension_skips_exhausted() {
        let a = ext(T0 - 10, T0 + 100, 0); // soonest, but spent
        let b = ext(T0 - 10, T0 + 300, 2);
        let active = vec![&a, &b];
        let picked = pick_extension(&active).expect("one should be picked");
        assert_eq!(picked.end, T0 + 300);

        let spent = vec![&a];
        assert!(pick_extension(&spent).is_none());
    }

    #[test]
    fn test_round_up_minute() {
        assert_eq!(round_up_minute(120), 120);
        assert_eq!(round_up_minute(121), 180);
        assert_eq!(round_up_minute(179), 180);
    }
}
