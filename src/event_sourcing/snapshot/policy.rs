use chrono::{DateTime, Duration, Utc};

// ============================================================================
// Snapshot Trigger Policies
// ============================================================================

/// What the policy gets to look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotContext {
    /// Sequence number of the last applied event
    pub version: i64,
    /// Sequence number covered by the newest known snapshot (0 if none)
    pub last_snapshot_sequence: i64,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl SnapshotContext {
    pub fn events_since_snapshot(&self) -> i64 {
        (self.version - self.last_snapshot_sequence).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SnapshotPolicy {
    #[default]
    Never,
    /// Snapshot each time the version reaches a multiple of the threshold.
    EveryNEvents(u64),
    /// Snapshot when the newest snapshot is older than the interval.
    Interval(Duration),
    /// Either condition.
    Hybrid { every: u64, interval: Duration },
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, ctx: &SnapshotContext) -> bool {
        if ctx.events_since_snapshot() == 0 {
            return false;
        }
        match self {
            SnapshotPolicy::Never => false,
            SnapshotPolicy::EveryNEvents(every) => Self::count_due(*every, ctx),
            SnapshotPolicy::Interval(interval) => Self::time_due(*interval, ctx),
            SnapshotPolicy::Hybrid { every, interval } => {
                Self::count_due(*every, ctx) || Self::time_due(*interval, ctx)
            }
        }
    }

    // A multiple of `every` lies in (last_snapshot_sequence, version]. With one
    // event per save this is exactly `version mod every == 0`; with batched
    // appends a crossed multiple is not missed.
    fn count_due(every: u64, ctx: &SnapshotContext) -> bool {
        let Ok(every) = i64::try_from(every) else {
            return false;
        };
        if every == 0 {
            return false;
        }
        ctx.version.div_euclid(every) > ctx.last_snapshot_sequence.div_euclid(every)
    }

    fn time_due(interval: Duration, ctx: &SnapshotContext) -> bool {
        match ctx.last_snapshot_at {
            Some(at) => ctx.now - at >= interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(version: i64, last: i64, last_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> SnapshotContext {
        SnapshotContext {
            version,
            last_snapshot_sequence: last,
            last_snapshot_at: last_at,
            now,
        }
    }

    #[test]
    fn test_event_count_triggers_on_multiples() {
        let now = Utc::now();
        let policy = SnapshotPolicy::EveryNEvents(100);

        assert!(!policy.should_snapshot(&ctx(99, 0, None, now)));
        assert!(policy.should_snapshot(&ctx(100, 0, None, now)));
        assert!(!policy.should_snapshot(&ctx(101, 100, Some(now), now)));
        assert!(policy.should_snapshot(&ctx(200, 100, Some(now), now)));
        assert!(!policy.should_snapshot(&ctx(250, 200, Some(now), now)));
    }

    #[test]
    fn test_event_count_catches_crossed_multiple_in_batch() {
        let now = Utc::now();
        let policy = SnapshotPolicy::EveryNEvents(10);
        assert!(policy.should_snapshot(&ctx(12, 8, Some(now), now)));
        assert!(!policy.should_snapshot(&ctx(19, 12, Some(now), now)));
    }

    #[test]
    fn test_interval_policy() {
        let now = Utc::now();
        let policy = SnapshotPolicy::Interval(Duration::minutes(5));

        assert!(policy.should_snapshot(&ctx(3, 0, None, now)));
        assert!(!policy.should_snapshot(&ctx(3, 1, Some(now - Duration::minutes(4)), now)));
        assert!(policy.should_snapshot(&ctx(3, 1, Some(now - Duration::minutes(5)), now)));
        // nothing new since the last snapshot
        assert!(!policy.should_snapshot(&ctx(3, 3, Some(now - Duration::hours(1)), now)));
    }

    #[test]
    fn test_hybrid_and_never() {
        let now = Utc::now();
        let hybrid = SnapshotPolicy::Hybrid {
            every: 50,
            interval: Duration::minutes(10),
        };
        assert!(hybrid.should_snapshot(&ctx(50, 10, Some(now), now)));
        assert!(hybrid.should_snapshot(&ctx(20, 10, Some(now - Duration::minutes(11)), now)));
        assert!(!hybrid.should_snapshot(&ctx(20, 10, Some(now), now)));

        assert!(!SnapshotPolicy::Never.should_snapshot(&ctx(1000, 0, None, now)));
        assert!(!SnapshotPolicy::EveryNEvents(0).should_snapshot(&ctx(1000, 0, None, now)));
    }
}
