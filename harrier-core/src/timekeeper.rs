//! Scan phases and pacing derived from the session time budget
//!
//! Pure computation over caller-supplied timestamps; nothing here performs
//! I/O or can fail. Agents consult the keeper before every probing action
//! and the runtime uses it to trigger graceful wind-down.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::ScanSession;

/// Discrete scan phase. Later variants mean less time remaining, so the
/// derived ordering ranks depletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plenty,
    Normal,
    Warning,
    Critical,
    Expired,
}

impl Phase {
    /// Band for a remaining-time fraction. Each band includes its lower
    /// boundary: rf of exactly 0.15 is Warning, exactly 0.50 is Normal.
    pub fn from_remaining_fraction(fraction: f64) -> Self {
        if fraction <= 0.03 {
            Phase::Expired
        } else if fraction <= 0.08 {
            Phase::Critical
        } else if fraction <= 0.15 {
            Phase::Warning
        } else if fraction <= 0.50 {
            Phase::Normal
        } else {
            Phase::Plenty
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Plenty => write!(f, "plenty"),
            Phase::Normal => write!(f, "normal"),
            Phase::Warning => write!(f, "warning"),
            Phase::Critical => write!(f, "critical"),
            Phase::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plenty" => Ok(Phase::Plenty),
            "normal" => Ok(Phase::Normal),
            "warning" => Ok(Phase::Warning),
            "critical" => Ok(Phase::Critical),
            "expired" => Ok(Phase::Expired),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Pacing and stop decisions over a session's time budget.
///
/// The delay curve spreads the budget over an estimated total action count
/// and grows as more probes are sent, so a scan never escalates its rate
/// late in the window. Both knobs are clamped between a floor and a
/// ceiling.
#[derive(Debug, Clone)]
pub struct TimeKeeper {
    estimated_total_actions: u32,
    floor: Duration,
    ceiling: Duration,
}

impl Default for TimeKeeper {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(250), Duration::from_secs(60))
    }
}

impl TimeKeeper {
    /// Create a keeper. The action estimate is raised to at least 1 and the
    /// ceiling to at least the floor, keeping the clamp well-formed.
    pub fn new(estimated_total_actions: u32, floor: Duration, ceiling: Duration) -> Self {
        Self {
            estimated_total_actions: estimated_total_actions.max(1),
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    /// Shortest delay the keeper will ever ask for
    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// Fraction of the budget left at `now`, in [0, 1]
    pub fn remaining_fraction(session: &ScanSession, now: DateTime<Utc>) -> f64 {
        if session.total_budget.is_zero() {
            return 0.0;
        }
        session.remaining(now).as_secs_f64() / session.total_budget.as_secs_f64()
    }

    /// Current phase of the session
    pub fn phase_of(&self, session: &ScanSession, now: DateTime<Utc>) -> Phase {
        Phase::from_remaining_fraction(Self::remaining_fraction(session, now))
    }

    /// Delay to respect before the next probing action.
    ///
    /// Shorter total budgets produce shorter delays; within one session the
    /// delay never shrinks as the iteration count grows.
    pub fn pace_delay(&self, session: &ScanSession, iteration_count: u32) -> Duration {
        let est = f64::from(self.estimated_total_actions);
        let base = session.total_budget.as_secs_f64() / (2.0 * est);
        let scale = 1.0 + f64::from(iteration_count) / est;
        let secs = (base * scale).clamp(self.floor.as_secs_f64(), self.ceiling.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// True once the session must wrap up (Critical or Expired)
    pub fn should_stop(&self, session: &ScanSession, now: DateTime<Utc>) -> bool {
        matches!(
            self.phase_of(session, now),
            Phase::Critical | Phase::Expired
        )
    }

    /// True once pacing should drop to the floor and low-value work should
    /// be skipped (Warning and later)
    pub fn should_accelerate(&self, session: &ScanSession, now: DateTime<Utc>) -> bool {
        self.phase_of(session, now) >= Phase::Warning
    }
}

/// Remembers which phases have been observed and reports each one the
/// first time it appears, so degradations are announced exactly once.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    seen: HashSet<Phase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the phase on its first observation, None afterwards
    pub fn observe(&mut self, phase: Phase) -> Option<Phase> {
        if self.seen.insert(phase) {
            Some(phase)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn session_with_budget(secs: u64) -> ScanSession {
        ScanSession::new("target-1", Duration::from_secs(secs))
    }

    fn at_elapsed(session: &ScanSession, elapsed_secs: i64) -> DateTime<Utc> {
        session.started_at + chrono::Duration::seconds(elapsed_secs)
    }

    #[test]
    fn test_phase_bands() {
        assert_eq!(Phase::from_remaining_fraction(1.0), Phase::Plenty);
        assert_eq!(Phase::from_remaining_fraction(0.51), Phase::Plenty);
        assert_eq!(Phase::from_remaining_fraction(0.50), Phase::Normal);
        assert_eq!(Phase::from_remaining_fraction(0.16), Phase::Normal);
        assert_eq!(Phase::from_remaining_fraction(0.15), Phase::Warning);
        assert_eq!(Phase::from_remaining_fraction(0.09), Phase::Warning);
        assert_eq!(Phase::from_remaining_fraction(0.08), Phase::Critical);
        assert_eq!(Phase::from_remaining_fraction(0.04), Phase::Critical);
        assert_eq!(Phase::from_remaining_fraction(0.03), Phase::Expired);
        assert_eq!(Phase::from_remaining_fraction(0.0), Phase::Expired);
    }

    #[test]
    fn test_phase_of_sixty_minute_budget() {
        let keeper = TimeKeeper::default();
        let session = session_with_budget(3600);

        assert_eq!(
            keeper.phase_of(&session, at_elapsed(&session, 20 * 60)),
            Phase::Plenty
        );
        // 50 of 60 minutes elapsed leaves a sixth of the budget, inside Normal
        assert_eq!(
            keeper.phase_of(&session, at_elapsed(&session, 50 * 60)),
            Phase::Normal
        );
        assert_eq!(
            keeper.phase_of(&session, at_elapsed(&session, 51 * 60)),
            Phase::Warning
        );
        assert_eq!(
            keeper.phase_of(&session, at_elapsed(&session, 56 * 60)),
            Phase::Critical
        );
        assert_eq!(
            keeper.phase_of(&session, at_elapsed(&session, 59 * 60)),
            Phase::Expired
        );
    }

    #[test]
    fn test_phase_never_regresses() {
        let mut last = Phase::Plenty;
        let mut fraction = 1.0;
        while fraction >= 0.0 {
            let phase = Phase::from_remaining_fraction(fraction);
            assert!(phase >= last, "phase regressed at fraction {}", fraction);
            last = phase;
            fraction -= 0.001;
        }
        assert_eq!(last, Phase::Expired);
    }

    #[test]
    fn test_zero_budget_is_expired() {
        let keeper = TimeKeeper::default();
        let session = session_with_budget(0);
        assert_eq!(
            keeper.phase_of(&session, session.started_at),
            Phase::Expired
        );
        assert!(keeper.should_stop(&session, session.started_at));
    }

    #[test]
    fn test_pace_delay_monotone_in_budget() {
        let keeper = TimeKeeper::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let shorter = rng.gen_range(1..86_400u64);
            let longer = shorter + rng.gen_range(1..86_400u64);
            let iterations = rng.gen_range(0..500u32);

            let short_delay =
                keeper.pace_delay(&session_with_budget(shorter), iterations);
            let long_delay = keeper.pace_delay(&session_with_budget(longer), iterations);
            assert!(
                short_delay <= long_delay,
                "budget {}s delayed {:?}, budget {}s delayed {:?}",
                shorter,
                short_delay,
                longer,
                long_delay
            );
        }
    }

    #[test]
    fn test_pace_delay_monotone_in_iterations() {
        let keeper = TimeKeeper::default();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let budget = rng.gen_range(1..86_400u64);
            let session = session_with_budget(budget);
            let earlier = rng.gen_range(0..500u32);
            let later = earlier + rng.gen_range(1..500u32);

            assert!(
                keeper.pace_delay(&session, earlier) <= keeper.pace_delay(&session, later),
                "delay shrank between iteration {} and {} for budget {}s",
                earlier,
                later,
                budget
            );
        }
    }

    #[test]
    fn test_pace_delay_clamped() {
        let keeper = TimeKeeper::default();

        // One second of budget paces at the floor
        let tiny = session_with_budget(1);
        assert_eq!(keeper.pace_delay(&tiny, 0), Duration::from_millis(250));

        // A week of budget is capped at the ceiling
        let huge = session_with_budget(7 * 24 * 3600);
        assert_eq!(keeper.pace_delay(&huge, 400), Duration::from_secs(60));
    }

    #[test]
    fn test_pace_delay_curve_midpoint() {
        let keeper = TimeKeeper::default();
        let session = session_with_budget(3600);

        // 3600s over 200 half-slots = 18s at iteration zero
        assert_eq!(keeper.pace_delay(&session, 0), Duration::from_secs(18));
        // Halfway through the estimate the delay has grown by half
        assert_eq!(keeper.pace_delay(&session, 50), Duration::from_secs(27));
    }

    #[test]
    fn test_should_stop_and_accelerate() {
        let keeper = TimeKeeper::default();
        let session = session_with_budget(3600);

        let mid = at_elapsed(&session, 30 * 60);
        assert!(!keeper.should_stop(&session, mid));
        assert!(!keeper.should_accelerate(&session, mid));

        let warning = at_elapsed(&session, 52 * 60);
        assert!(!keeper.should_stop(&session, warning));
        assert!(keeper.should_accelerate(&session, warning));

        let critical = at_elapsed(&session, 56 * 60);
        assert!(keeper.should_stop(&session, critical));
        assert!(keeper.should_accelerate(&session, critical));
    }

    #[test]
    fn test_phase_tracker_fires_once() {
        let mut tracker = PhaseTracker::new();
        assert_eq!(tracker.observe(Phase::Plenty), Some(Phase::Plenty));
        assert_eq!(tracker.observe(Phase::Plenty), None);
        assert_eq!(tracker.observe(Phase::Warning), Some(Phase::Warning));
        assert_eq!(tracker.observe(Phase::Warning), None);
        assert_eq!(tracker.observe(Phase::Critical), Some(Phase::Critical));
    }

    #[test]
    fn test_keeper_constructor_clamps() {
        // Ceiling below floor gets raised, estimate of zero becomes one
        let keeper = TimeKeeper::new(0, Duration::from_secs(5), Duration::from_secs(1));
        let session = session_with_budget(3600);
        let delay = keeper.pace_delay(&session, 0);
        assert_eq!(delay, Duration::from_secs(5));
    }
}
