//! Adaptive broadcast cadence.
//!
//! Decides when the next unsolicited broadcast goes out. The period tracks
//! the highest interaction phase across all live peers and a fresh random
//! jitter is added per cycle, so devices that booted in lock-step drift
//! apart instead of colliding forever.

use std::time::Duration;

use rand::Rng;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::core::constants::{BOOP_PERIOD, BROADCAST_PERIOD, PROX_PERIOD, RANDOM_DELAY};
use crate::protocol::PeerPhase;

/// Process-wide broadcast cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Cadence {
    /// No peer active: announce once a second.
    #[default]
    Normal,
    /// At least one proximate peer: 5 Hz.
    Proximity,
    /// At least one booped peer: 50 Hz.
    Boop,
}

impl Cadence {
    /// Base broadcast period before jitter.
    pub fn base_period(self) -> Duration {
        match self {
            Self::Normal => BROADCAST_PERIOD,
            Self::Proximity => PROX_PERIOD,
            Self::Boop => BOOP_PERIOD,
        }
    }
}

impl From<PeerPhase> for Cadence {
    fn from(phase: PeerPhase) -> Self {
        match phase {
            PeerPhase::Unknown | PeerPhase::Heard => Self::Normal,
            PeerPhase::Proximate => Self::Proximity,
            PeerPhase::Booped => Self::Boop,
        }
    }
}

/// Decides when the next unsolicited broadcast is due.
///
/// Callers re-derive the cadence from the peer registry on every fire, so a
/// de-escalation after a sweep takes effect on the very next cycle.
#[derive(Debug)]
pub struct BroadcastScheduler<R: Rng = SmallRng> {
    last_broadcast: u64,
    period_ms: u64,
    jitter_bound_ms: u64,
    rng: R,
}

impl BroadcastScheduler<SmallRng> {
    /// Entropy-seeded scheduler with the first period armed at Normal cadence.
    pub fn new(now: u64) -> Self {
        Self::with_rng(now, SmallRng::from_entropy())
    }
}

impl<R: Rng> BroadcastScheduler<R> {
    /// Scheduler with a caller-provided jitter source, for deterministic tests.
    pub fn with_rng(now: u64, rng: R) -> Self {
        let mut scheduler = Self {
            last_broadcast: now,
            period_ms: 0,
            jitter_bound_ms: RANDOM_DELAY.as_millis() as u64,
            rng,
        };
        scheduler.resample(Cadence::Normal);
        scheduler
    }

    /// Override the jitter bound. Zero disables jitter entirely.
    pub fn set_jitter_bound(&mut self, bound: Duration) {
        self.jitter_bound_ms = bound.as_millis() as u64;
    }

    /// The period currently armed, jitter included.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// True once the armed period has fully elapsed since the last broadcast.
    pub fn due(&self, now: u64) -> bool {
        now.saturating_sub(self.last_broadcast) >= self.period_ms
    }

    /// Record a broadcast at `now` and arm the next cycle for `cadence`,
    /// resampling the jitter.
    pub fn mark_fired(&mut self, now: u64, cadence: Cadence) {
        self.last_broadcast = now;
        self.resample(cadence);
    }

    fn resample(&mut self, cadence: Cadence) {
        let base = cadence.base_period().as_millis() as u64;
        let jitter = if self.jitter_bound_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..self.jitter_bound_ms)
        };
        self.period_ms = base + jitter;
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::*;

    fn zero_jitter(now: u64) -> BroadcastScheduler<StepRng> {
        let mut scheduler = BroadcastScheduler::with_rng(now, StepRng::new(0, 0));
        scheduler.set_jitter_bound(Duration::ZERO);
        scheduler
    }

    #[test]
    fn test_cadence_from_phase() {
        assert_eq!(Cadence::from(PeerPhase::Unknown), Cadence::Normal);
        assert_eq!(Cadence::from(PeerPhase::Heard), Cadence::Normal);
        assert_eq!(Cadence::from(PeerPhase::Proximate), Cadence::Proximity);
        assert_eq!(Cadence::from(PeerPhase::Booped), Cadence::Boop);
    }

    #[test]
    fn test_base_periods() {
        assert_eq!(Cadence::Normal.base_period(), Duration::from_millis(1000));
        assert_eq!(Cadence::Proximity.base_period(), Duration::from_millis(200));
        assert_eq!(Cadence::Boop.base_period(), Duration::from_millis(20));
    }

    #[test]
    fn test_exact_proximity_cadence_without_jitter() {
        let mut scheduler = zero_jitter(0);
        scheduler.mark_fired(0, Cadence::Proximity);

        let mut fired_at = Vec::new();
        for now in 1..=1000 {
            if scheduler.due(now) {
                fired_at.push(now);
                scheduler.mark_fired(now, Cadence::Proximity);
            }
        }
        assert_eq!(fired_at, vec![200, 400, 600, 800, 1000]);
    }

    #[test]
    fn test_not_due_before_period() {
        let scheduler = zero_jitter(100);
        assert!(!scheduler.due(100));
        assert!(!scheduler.due(1099));
        assert!(scheduler.due(1100));
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        let mut scheduler = BroadcastScheduler::with_rng(0, StepRng::new(0, 0x1111_1111));
        for _ in 0..100 {
            scheduler.mark_fired(0, Cadence::Boop);
            let period = scheduler.period().as_millis() as u64;
            let base = Cadence::Boop.base_period().as_millis() as u64;
            assert!(period >= base);
            assert!(period < base + RANDOM_DELAY.as_millis() as u64);
        }
    }

    #[test]
    fn test_deescalation_takes_effect_on_fire() {
        let mut scheduler = zero_jitter(0);
        scheduler.mark_fired(0, Cadence::Boop);
        assert_eq!(scheduler.period(), Duration::from_millis(20));

        // The only booped peer timed out; next fire re-derives Normal.
        scheduler.mark_fired(20, Cadence::Normal);
        assert_eq!(scheduler.period(), Duration::from_millis(1000));
        assert!(!scheduler.due(520));
        assert!(scheduler.due(1020));
    }

    #[test]
    fn test_clock_going_backwards_is_not_due() {
        let scheduler = zero_jitter(1000);
        assert!(!scheduler.due(500));
    }
}
