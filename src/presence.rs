//! Debounced presence of a single device.
//!
//! Arrival is committed on the first positive signal. Departure is only
//! committed once negative signals persist for at least `away_delay` since the
//! device was last seen.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Minimum time between two persisted `last_seen_at` writes while a device stays present.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub normal_interval: Duration,
    pub normal_timeout: Duration,
    pub stress_interval: Duration,
    pub stress_timeout: Duration,
    pub stress_threshold: Duration,
    pub away_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    #[default]
    Normal,
    /// Faster probing close to the away-delay boundary.
    Stress,
}

impl ScanMode {
    pub fn interval(self, timing: &Timing) -> Duration {
        match self {
            ScanMode::Normal => timing.normal_interval,
            ScanMode::Stress => timing.stress_interval,
        }
    }

    pub fn timeout(self, timing: &Timing) -> Duration {
        match self {
            ScanMode::Normal => timing.normal_timeout,
            ScanMode::Stress => timing.stress_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Arrived,
    Left,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    present: bool,
    last_seen_at: Option<DateTime<Utc>>,
    last_persisted_at: Option<DateTime<Utc>>,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl PresenceState {
    /// State after a restart: the timestamp survives, presence does not.
    pub fn restored(last_seen_at: Option<DateTime<Utc>>) -> Self {
        PresenceState {
            present: false,
            last_seen_at,
            last_persisted_at: last_seen_at,
        }
    }

    pub fn present(&self) -> bool {
        self.present
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen_at
    }

    pub fn evaluate(
        &mut self,
        signal: bool,
        now: DateTime<Utc>,
        away_delay: Duration,
    ) -> Option<Transition> {
        match (signal, self.present) {
            (true, false) => {
                self.present = true;
                self.last_seen_at = Some(now);
                Some(Transition::Arrived)
            }
            (true, true) => {
                self.last_seen_at = Some(now);
                None
            }
            (false, true) => {
                let gone_long_enough = match self.last_seen_at {
                    Some(seen) => now - seen >= delta(away_delay),
                    None => true,
                };
                if gone_long_enough {
                    self.present = false;
                    Some(Transition::Left)
                } else {
                    None
                }
            }
            (false, false) => None,
        }
    }

    /// Stress mode is active while present and less than `stress_threshold`
    /// remains before the away delay would expire.
    pub fn scan_mode(&self, now: DateTime<Utc>, timing: &Timing) -> ScanMode {
        if !self.present {
            return ScanMode::Normal;
        }
        let Some(seen) = self.last_seen_at else {
            return ScanMode::Stress;
        };
        let elapsed = now - seen;
        let stressed = match delta(timing.away_delay).checked_sub(&elapsed) {
            Some(remaining) => remaining < delta(timing.stress_threshold),
            // out of range: either long overdue or seen far in the future
            None => elapsed > TimeDelta::zero(),
        };
        if stressed {
            ScanMode::Stress
        } else {
            ScanMode::Normal
        }
    }

    pub fn needs_persist(&self, now: DateTime<Utc>) -> bool {
        match (self.last_seen_at, self.last_persisted_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(seen), Some(persisted)) => {
                seen > persisted && now - persisted >= delta(PERSIST_INTERVAL)
            }
        }
    }

    pub fn mark_persisted(&mut self, now: DateTime<Utc>) {
        self.last_persisted_at = Some(now);
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += delta(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(away_delay: u64, stress_threshold: u64) -> Timing {
        Timing {
            normal_interval: Duration::from_secs(5),
            normal_timeout: Duration::from_secs(2),
            stress_interval: Duration::from_millis(1500),
            stress_timeout: Duration::from_secs(1),
            stress_threshold: Duration::from_secs(stress_threshold),
            away_delay: Duration::from_secs(away_delay),
        }
    }

    fn present_seen_secs_ago(now: DateTime<Utc>, secs: i64) -> PresenceState {
        let mut state = PresenceState::default();
        state.evaluate(true, now - TimeDelta::seconds(secs), Duration::ZERO);
        state
    }

    #[test]
    fn test_arrival_is_immediate() {
        let now = Utc::now();
        let mut state = PresenceState::default();
        assert_eq!(
            state.evaluate(true, now, Duration::from_secs(60)),
            Some(Transition::Arrived)
        );
        assert!(state.present());
        assert_eq!(state.last_seen_at(), Some(now));
    }

    #[test]
    fn test_positive_signal_while_present_only_refreshes() {
        let now = Utc::now();
        let mut state = present_seen_secs_ago(now, 30);
        assert_eq!(state.evaluate(true, now, Duration::from_secs(60)), None);
        assert_eq!(state.last_seen_at(), Some(now));
    }

    #[test]
    fn test_single_miss_within_away_delay_is_absorbed() {
        let now = Utc::now();
        let mut state = present_seen_secs_ago(now, 10);
        assert_eq!(state.evaluate(false, now, Duration::from_secs(60)), None);
        assert!(state.present());
    }

    #[test]
    fn test_miss_after_away_delay_leaves() {
        let now = Utc::now();
        let mut state = present_seen_secs_ago(now, 61);
        assert_eq!(
            state.evaluate(false, now, Duration::from_secs(60)),
            Some(Transition::Left)
        );
        assert!(!state.present());
        assert!(state.evaluate(false, now, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_stress_mode_boundary() {
        let now = Utc::now();
        let timing = timing(300, 60);

        assert_eq!(
            present_seen_secs_ago(now, 245).scan_mode(now, &timing),
            ScanMode::Stress
        );
        assert_eq!(
            present_seen_secs_ago(now, 235).scan_mode(now, &timing),
            ScanMode::Normal
        );
        // exactly at the threshold is not stress
        assert_eq!(
            present_seen_secs_ago(now, 240).scan_mode(now, &timing),
            ScanMode::Normal
        );
        assert_eq!(
            PresenceState::restored(Some(now - TimeDelta::seconds(299))).scan_mode(now, &timing),
            ScanMode::Normal
        );
    }

    #[test]
    fn test_clock_stepping_back_does_not_overflow() {
        let now = Utc::now();
        let timing = Timing {
            away_delay: Duration::MAX,
            stress_threshold: Duration::MAX,
            ..timing(300, 60)
        };
        let mut state = PresenceState::default();
        state.evaluate(true, now, timing.away_delay);

        let earlier = now - TimeDelta::seconds(1);
        assert_eq!(state.evaluate(false, earlier, timing.away_delay), None);
        assert_eq!(state.scan_mode(earlier, &timing), ScanMode::Normal);
        assert_eq!(state.scan_mode(now + TimeDelta::days(1), &timing), ScanMode::Stress);
    }

    #[test]
    fn test_restored_state_is_absent() {
        let seen = Utc::now() - TimeDelta::hours(1);
        let state = PresenceState::restored(Some(seen));
        assert!(!state.present());
        assert_eq!(state.last_seen_at(), Some(seen));
    }

    #[test]
    fn test_persist_is_coalesced() {
        let start = Utc::now();
        let mut state = PresenceState::default();
        state.evaluate(true, start, Duration::from_secs(60));
        assert!(state.needs_persist(start));
        state.mark_persisted(start);

        let soon = start + TimeDelta::seconds(30);
        state.evaluate(true, soon, Duration::from_secs(60));
        assert!(!state.needs_persist(soon));

        let later = start + TimeDelta::seconds(61);
        state.evaluate(true, later, Duration::from_secs(60));
        assert!(state.needs_persist(later));
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, TimeDelta::seconds(5));
    }
}
