use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Restart backoff for a faulted changefeed.
///
/// An explicit state machine rather than a library wrapper: the interval
/// ladder, the jitter, and the give-up budget are all observable and
/// deterministic under a pinned RNG seed. Jitter only widens a delay (by up
/// to the randomization factor) and every delay is clamped to `max`, so the
/// returned sequence is non-decreasing as long as
/// `multiplier >= 1 + randomization`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    randomization: f64,
    max_elapsed: Option<Duration>,
    /// Base delay handed out by the next call to `next`.
    current: Duration,
    /// When the current failure episode began. `None` until the first
    /// `next` after construction or `reset`.
    episode_start: Option<DateTime<Utc>>,
    rng: SmallRng,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            randomization: 0.1,
            max_elapsed: None,
            current: initial,
            episode_start: None,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_randomization(mut self, randomization: f64) -> Self {
        self.randomization = randomization;
        self
    }

    /// Total failure-episode duration after which `next` returns `None`.
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Next allowed restart delay, or `None` once the elapsed budget of the
    /// current failure episode is exhausted.
    pub fn next(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let start = *self.episode_start.get_or_insert(now);
        if let Some(budget) = self.max_elapsed {
            if now - start > to_delta(budget) {
                return None;
            }
        }

        let jitter = 1.0 + self.randomization * self.rng.gen::<f64>();
        let delay = mul(self.current, jitter).min(self.max);
        self.current = mul(self.current, self.multiplier).min(self.max);
        Some(delay)
    }

    /// Restart both the interval ladder and the elapsed budget, beginning a
    /// new failure episode at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.current = self.initial;
        self.episode_start = Some(now);
    }
}

fn mul(d: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(d.as_secs_f64() * factor)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod test {
    use super::*;

    const INITIAL: Duration = Duration::from_secs(10);
    const MAX: Duration = Duration::from_secs(30 * 60);

    fn t0() -> DateTime<Utc> {
        "2024-01-01T08:00:00Z".parse().unwrap()
    }

    #[test]
    fn delays_are_monotonic_and_bounded() {
        let mut backoff = ExponentialBackoff::new(INITIAL, MAX).with_rng_seed(7);
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next(t0()).unwrap();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= MAX);
            previous = delay;
        }
        // The ladder saturates at the max interval.
        assert_eq!(previous, MAX);
    }

    #[test]
    fn first_delay_is_near_the_initial_interval() {
        let mut backoff = ExponentialBackoff::new(INITIAL, MAX).with_rng_seed(7);
        let delay = backoff.next(t0()).unwrap();
        assert!(delay >= INITIAL);
        assert!(delay < mul(INITIAL, 1.1));
    }

    #[test]
    fn pinned_seed_is_reproducible() {
        let mut a = ExponentialBackoff::new(INITIAL, MAX).with_rng_seed(42);
        let mut b = ExponentialBackoff::new(INITIAL, MAX).with_rng_seed(42);
        for _ in 0..8 {
            assert_eq!(a.next(t0()), b.next(t0()));
        }
    }

    #[test]
    fn elapsed_budget_exhausts() {
        let mut backoff = ExponentialBackoff::new(INITIAL, MAX)
            .with_max_elapsed(Duration::from_secs(90 * 60))
            .with_rng_seed(7);

        let start = t0();
        assert!(backoff.next(start).is_some());
        // Within the budget the backoff keeps producing delays.
        assert!(backoff.next(start + TimeDelta::minutes(89)).is_some());
        // Beyond it, the give-up sentinel.
        assert!(backoff.next(start + TimeDelta::minutes(91)).is_none());
        // And it stays exhausted until a reset.
        assert!(backoff.next(start + TimeDelta::minutes(92)).is_none());
    }

    #[test]
    fn reset_restarts_ladder_and_budget() {
        let mut backoff = ExponentialBackoff::new(INITIAL, MAX)
            .with_max_elapsed(Duration::from_secs(90 * 60))
            .with_rng_seed(7);

        let start = t0();
        for _ in 0..6 {
            backoff.next(start).unwrap();
        }
        let exhausted_at = start + TimeDelta::minutes(91);
        assert!(backoff.next(exhausted_at).is_none());

        backoff.reset(exhausted_at);
        let delay = backoff.next(exhausted_at).unwrap();
        assert!(delay >= INITIAL && delay < mul(INITIAL, 1.1));
    }
}
