//! Runtime balancing between chains.
//!
//! Hotter chains can be cheaper or dearer per sample than the reference chain,
//! so with equal sample counts some chains idle at the round barrier. After
//! each round the coordinator hands every heated chain its own finish time and
//! the reference chain's, and the chain rescales its internal work per sample.

use std::time::{Duration, Instant};

/// Start and finish times of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTimings {
    pub start: Instant,
    /// Finish time of each chain, indexed by rank.
    pub finish: Vec<Instant>,
}

impl RoundTimings {
    pub fn new(start: Instant, finish: Vec<Instant>) -> Self {
        Self { start, finish }
    }

    /// Finish time of the reference chain.
    pub fn reference_finish(&self) -> Option<Instant> {
        self.finish.first().copied()
    }

    /// Time the fastest chain spent waiting for the slowest at the barrier.
    pub fn barrier_idle(&self) -> Duration {
        match (self.finish.iter().min(), self.finish.iter().max()) {
            (Some(first), Some(last)) => last.saturating_duration_since(*first),
            _ => Duration::ZERO,
        }
    }

    /// `(rank, own_finish, reference_finish)` for every heated chain.
    pub fn heated(&self) -> impl Iterator<Item = (usize, Instant, Instant)> + '_ {
        let reference = self.reference_finish();
        self.finish
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(move |(rank, &own)| reference.map(|r| (rank, own, r)))
    }
}

/**
Tunes how many inner transitions a chain performs per logical sample.

The count is multiplied by the ratio of the reference chain's round time to
this chain's round time, damped towards 1 and clamped to `[min, max]`.

```rust
use coupled_mcmc::balance::WorkloadTuner;
use std::time::{Duration, Instant};

let mut tuner = WorkloadTuner::new(10).set_damping(1.0);
let start = Instant::now();
// This chain took twice as long as the reference chain.
tuner.update(start, start + Duration::from_millis(200), start + Duration::from_millis(100));
assert_eq!(tuner.steps_per_sample(), 5);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadTuner {
    steps_per_sample: usize,
    min_steps: usize,
    max_steps: usize,
    damping: f64,
}

impl WorkloadTuner {
    /// Starts at `steps_per_sample` inner transitions, allowed to range over `1..=4 * steps_per_sample`.
    pub fn new(steps_per_sample: usize) -> Self {
        let steps = steps_per_sample.max(1);
        Self {
            steps_per_sample: steps,
            min_steps: 1,
            max_steps: steps * 4,
            damping: 0.5,
        }
    }

    /// Sets the bounds for the inner transition count.
    pub fn set_bounds(mut self, min_steps: usize, max_steps: usize) -> Self {
        self.min_steps = min_steps.max(1);
        self.max_steps = max_steps.max(self.min_steps);
        self.steps_per_sample = self.steps_per_sample.clamp(self.min_steps, self.max_steps);
        self
    }

    /// Fraction of the observed correction applied per round, in `(0, 1]`.
    pub fn set_damping(mut self, damping: f64) -> Self {
        self.damping = damping.clamp(f64::EPSILON, 1.0);
        self
    }

    pub fn steps_per_sample(&self) -> usize {
        self.steps_per_sample
    }

    /// Overrides the current count, clamped to the tuner's bounds.
    pub fn set_steps_per_sample(&mut self, steps: usize) {
        self.steps_per_sample = steps.clamp(self.min_steps, self.max_steps);
    }

    /// Rescales the workload from one round's timings.
    pub fn update(&mut self, round_start: Instant, own_finish: Instant, reference_finish: Instant) {
        let own = own_finish.saturating_duration_since(round_start).as_secs_f64();
        let reference = reference_finish
            .saturating_duration_since(round_start)
            .as_secs_f64();
        if own <= 0.0 || reference <= 0.0 {
            return;
        }
        let ratio = 1.0 + self.damping * (reference / own - 1.0);
        let target = (self.steps_per_sample as f64 * ratio).round();
        let target = if target.is_finite() && target > 0.0 {
            target as usize
        } else {
            self.min_steps
        };
        self.steps_per_sample = target.clamp(self.min_steps, self.max_steps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn slow_chain_shrinks_workload() {
        let start = Instant::now();
        let mut tuner = WorkloadTuner::new(8);
        tuner.update(start, at(start, 400), at(start, 100));
        assert!(tuner.steps_per_sample() < 8);
    }

    #[test]
    fn fast_chain_grows_workload() {
        let start = Instant::now();
        let mut tuner = WorkloadTuner::new(8);
        tuner.update(start, at(start, 50), at(start, 100));
        assert!(tuner.steps_per_sample() > 8);
    }

    #[test]
    fn workload_stays_within_bounds() {
        let start = Instant::now();
        let mut tuner = WorkloadTuner::new(4).set_bounds(2, 6).set_damping(1.0);
        for _ in 0..10 {
            tuner.update(start, at(start, 1_000), at(start, 1));
        }
        assert_eq!(tuner.steps_per_sample(), 2);
        for _ in 0..10 {
            tuner.update(start, at(start, 1), at(start, 1_000));
        }
        assert_eq!(tuner.steps_per_sample(), 6);
    }

    #[test]
    fn zero_durations_leave_workload_alone() {
        let start = Instant::now();
        let mut tuner = WorkloadTuner::new(3);
        tuner.update(start, start, at(start, 10));
        assert_eq!(tuner.steps_per_sample(), 3);
    }

    #[test]
    fn timings_skip_reference_chain() {
        let start = Instant::now();
        let timings = RoundTimings::new(start, vec![at(start, 100), at(start, 80), at(start, 130)]);
        let heated: Vec<usize> = timings.heated().map(|(rank, _, _)| rank).collect();
        assert_eq!(heated, vec![1, 2]);
        assert!(timings.heated().all(|(_, _, r)| r == at(start, 100)));
        assert_eq!(timings.barrier_idle(), Duration::from_millis(50));
    }
}
