use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::seconds;

/// Decides whether a refresh can be skipped because the cached record is
/// still fresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Subtracted from the interval so a trigger that fires near the end of
    /// its window still refreshes.
    flex: TimeDelta,
}

impl StalenessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flex_secs(flex_secs: u64) -> Self {
        Self {
            flex: seconds(flex_secs),
        }
    }

    /// `true` iff this is not a manual run and `now - last_update` is under
    /// the (flex-adjusted) interval.
    pub fn should_skip(
        &self,
        last_update: DateTime<Utc>,
        now: DateTime<Utc>,
        interval_secs: u64,
        manual_override: bool,
    ) -> bool {
        if manual_override {
            return false;
        }
        let interval = seconds(interval_secs);
        // Flex never eats more than half the interval.
        let flex = self.flex.min(interval / 2);
        now - last_update < interval - flex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn skips_when_fresh() {
        let policy = StalenessPolicy::new();
        let last = at(1_000_000);
        for interval in [1_u64, 60, 900, 7200, 10_800] {
            let now = last + TimeDelta::seconds(interval as i64 - 1);
            assert!(policy.should_skip(last, now, interval, false), "interval {interval}");
        }
    }

    #[test]
    fn refreshes_once_interval_elapsed() {
        let policy = StalenessPolicy::new();
        let last = at(1_000_000);
        assert!(!policy.should_skip(last, last + TimeDelta::seconds(900), 900, false));
        assert!(!policy.should_skip(last, last + TimeDelta::seconds(5000), 900, false));
    }

    #[test]
    fn manual_override_never_skips() {
        let policy = StalenessPolicy::new();
        let last = at(1_000_000);
        assert!(!policy.should_skip(last, last, 7200, true));
    }

    #[test]
    fn flex_shrinks_the_window() {
        let policy = StalenessPolicy::with_flex_secs(1800);
        let last = at(1_000_000);
        // 2h interval with 30 min flex: fresh for 90 min.
        assert!(policy.should_skip(last, last + TimeDelta::minutes(89), 7200, false));
        assert!(!policy.should_skip(last, last + TimeDelta::minutes(90), 7200, false));
    }

    #[test]
    fn flex_is_capped_at_half_the_interval() {
        let policy = StalenessPolicy::with_flex_secs(1800);
        let last = at(1_000_000);
        // 10 min interval: still fresh for 5 min, not refreshed on every trigger.
        assert!(policy.should_skip(last, last + TimeDelta::seconds(299), 600, false));
        assert!(!policy.should_skip(last, last + TimeDelta::seconds(300), 600, false));
    }

    #[test]
    fn never_refreshed_record_is_stale() {
        let policy = StalenessPolicy::new();
        let now = at(1_700_000_000);
        assert!(!policy.should_skip(DateTime::<Utc>::default(), now, 7200, false));
    }
}
