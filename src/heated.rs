/*!
# Heated Metropolis–Hastings chain

A [`HeatedChain`] built on a random-walk Metropolis–Hastings kernel. The
chain at temperature `T` targets `exp(log p(x) / T)`, so its heated
log-likelihood is `log p(x) / T` and scales multiplicatively with the
temperature, which is what the coordinator's swap test assumes.

Each logical sample runs `steps_per_sample` inner transitions. The count is
tuned between rounds by [`WorkloadTuner`] so heated chains finish their rounds
close to the reference chain.

## Example

```rust
use coupled_mcmc::core::HeatedChain;
use coupled_mcmc::distributions::{GaussianMixture, IsotropicGaussian, Proposal};
use coupled_mcmc::heated::HeatedMetropolisHastings;

let target = GaussianMixture::new(vec![-3.0, 3.0], 1.0, 2);
let proposal = IsotropicGaussian::new(0.5).set_seed(1);
let mut chain = HeatedMetropolisHastings::new(target, proposal, &[0.0, 0.0]).set_seed(1);
chain.configure(0, 100, 0.1);
chain.start().unwrap();
chain.run_till_resample().unwrap();
assert_eq!(chain.sample_count(), 100);
```
*/

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ndarray::Array2;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::balance::WorkloadTuner;
use crate::core::{temperature_for_rank, ChainSpawn, HeatedChain, LogPolicy, StateNode};
use crate::distributions::{Proposal, Target};

/// Errors raised by [`HeatedMetropolisHastings`].
#[derive(Error, Debug)]
pub enum ChainFault {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("persisted state has {found} parameters, chain has {expected}")]
    StateDimension { expected: usize, found: usize },

    /// The target returned NaN. `-inf` is a valid zero-density state and is not an error.
    #[error("log-likelihood evaluated to NaN")]
    NanLikelihood,

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// One scalar parameter of the chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamNode {
    pub id: String,
    pub value: f64,
}

impl StateNode for ParamNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn assign_from_without_id(&mut self, other: &Self) {
        self.value = other.value;
    }
}

/// On-disk form of a chain's state.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    rank: usize,
    sample_count: u64,
    steps_per_sample: usize,
    nodes: Vec<ParamNode>,
}

/// A Metropolis–Hastings chain at a fixed temperature.
#[derive(Debug, Clone)]
pub struct HeatedMetropolisHastings<D, Q> {
    /// The target distribution we want to sample from.
    pub target: D,
    /// The proposal distribution used to generate candidate states.
    pub proposal: Q,
    /// The chain-specific random seed.
    pub seed: u64,
    nodes: Vec<ParamNode>,
    rank: usize,
    resample_every: usize,
    temperature: f64,
    raw_log_prob: f64,
    log_likelihood: f64,
    tuner: WorkloadTuner,
    rng: SmallRng,
    log_policy: LogPolicy,
    state_file: Option<PathBuf>,
    restore: bool,
    sample_count: u64,
    samples: Vec<f64>,
    proposed: u64,
    accepted: u64,
}

impl<D, Q> HeatedMetropolisHastings<D, Q>
where
    D: Target<f64>,
    Q: Proposal<f64>,
{
    /// Creates an unconfigured chain starting at `initial_state`.
    ///
    /// The chain runs at temperature 1 with one inner transition per sample
    /// until [`HeatedChain::configure`] and [`HeatedMetropolisHastings::set_steps_per_sample`]
    /// say otherwise.
    pub fn new(target: D, proposal: Q, initial_state: &[f64]) -> Self {
        let seed = thread_rng().gen::<u64>();
        let nodes = initial_state
            .iter()
            .enumerate()
            .map(|(k, &value)| ParamNode {
                id: format!("theta{k}"),
                value,
            })
            .collect();
        Self {
            target,
            proposal,
            seed,
            nodes,
            rank: 0,
            resample_every: 1,
            temperature: 1.0,
            raw_log_prob: f64::NAN,
            log_likelihood: f64::NAN,
            tuner: WorkloadTuner::new(1),
            rng: SmallRng::seed_from_u64(seed),
            log_policy: LogPolicy::for_rank(0, false),
            state_file: None,
            restore: false,
            sample_count: 0,
            samples: Vec::new(),
            proposed: 0,
            accepted: 0,
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn set_log_policy(mut self, log_policy: LogPolicy) -> Self {
        self.log_policy = log_policy;
        self
    }

    /// Applies the seed and logging policy the coordinator chose for this rank.
    pub fn for_spawn(self, spawn: &ChainSpawn) -> Self {
        self.set_seed(spawn.seed).set_log_policy(spawn.log_policy)
    }

    /// Sets the initial number of inner transitions per sample; tuning may move
    /// it anywhere in `1..=4 * steps`.
    pub fn set_steps_per_sample(mut self, steps: usize) -> Self {
        self.tuner = WorkloadTuner::new(steps);
        self
    }

    pub fn set_tuner(mut self, tuner: WorkloadTuner) -> Self {
        self.tuner = tuner;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Logical samples taken so far, including any restored from a state file.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn steps_per_sample(&self) -> usize {
        self.tuner.steps_per_sample()
    }

    /// Current parameter values.
    pub fn values(&self) -> Vec<f64> {
        self.nodes.iter().map(|n| n.value).collect()
    }

    /// Fraction of accepted inner transitions; NaN before the first one.
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            f64::NAN
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Recorded samples as a `[n_samples, dim]` array. Empty unless the
    /// chain's log policy records samples.
    pub fn samples(&self) -> Result<Array2<f64>, ChainFault> {
        let dim = self.nodes.len();
        let rows = if dim == 0 { 0 } else { self.samples.len() / dim };
        Ok(Array2::from_shape_vec((rows, dim), self.samples.clone())?)
    }

    /// One Metropolis–Hastings transition on the heated target.
    fn mh_step(&mut self) {
        let current = self.values();
        let proposed = self.proposal.sample(&current);
        let proposed_lp = self.target.unnorm_log_prob(&proposed);
        let log_q_forward = self.proposal.log_prob(&current, &proposed);
        let log_q_backward = self.proposal.log_prob(&proposed, &current);
        let log_accept_ratio =
            (proposed_lp - self.raw_log_prob) / self.temperature + log_q_backward - log_q_forward;

        self.proposed += 1;
        let u: f64 = self.rng.gen();
        if log_accept_ratio > u.ln() {
            for (node, value) in self.nodes.iter_mut().zip(proposed) {
                node.value = value;
            }
            self.raw_log_prob = proposed_lp;
            self.log_likelihood = proposed_lp / self.temperature;
            self.accepted += 1;
        }
    }

    fn write_state(&self) -> Result<(), ChainFault> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let persisted = PersistedState {
            rank: self.rank,
            sample_count: self.sample_count,
            steps_per_sample: self.tuner.steps_per_sample(),
            nodes: self.nodes.clone(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;
        fs::write(path, json).map_err(|source| ChainFault::Io {
            path: path.clone(),
            source,
        })
    }

    fn read_state(&mut self, path: &Path) -> Result<(), ChainFault> {
        let text = fs::read_to_string(path).map_err(|source| ChainFault::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let persisted: PersistedState = serde_json::from_str(&text)?;
        if persisted.nodes.len() != self.nodes.len() {
            return Err(ChainFault::StateDimension {
                expected: self.nodes.len(),
                found: persisted.nodes.len(),
            });
        }
        for (node, stored) in self.nodes.iter_mut().zip(&persisted.nodes) {
            node.assign_from_without_id(stored);
        }
        self.sample_count = persisted.sample_count;
        self.tuner.set_steps_per_sample(persisted.steps_per_sample);
        Ok(())
    }
}

impl<D, Q> HeatedChain for HeatedMetropolisHastings<D, Q>
where
    D: Target<f64>,
    Q: Proposal<f64>,
{
    type Node = ParamNode;
    type Error = ChainFault;

    fn configure(&mut self, rank: usize, resample_every: usize, temperature_scaler: f64) {
        self.rank = rank;
        self.resample_every = resample_every;
        self.temperature = temperature_for_rank(rank, temperature_scaler);
    }

    fn set_state_file(&mut self, path: &Path, restore: bool) -> Result<(), ChainFault> {
        self.state_file = Some(path.to_path_buf());
        self.restore = restore;
        Ok(())
    }

    fn start(&mut self) -> Result<(), ChainFault> {
        if self.restore {
            if let Some(path) = self.state_file.clone() {
                self.read_state(&path)?;
            }
        }
        let lp = self.calc_log_likelihood_robustly()?;
        if self.log_policy.screen_log {
            debug!(
                rank = self.rank,
                temperature = self.temperature,
                log_likelihood = lp,
                "chain started"
            );
        }
        Ok(())
    }

    fn run_till_resample(&mut self) -> Result<Duration, ChainFault> {
        let start = Instant::now();
        for _ in 0..self.resample_every {
            for _ in 0..self.tuner.steps_per_sample() {
                self.mh_step();
            }
            self.sample_count += 1;
            if self.log_policy.record_samples {
                self.samples.extend(self.nodes.iter().map(|n| n.value));
            }
        }
        self.write_state()?;
        let elapsed = start.elapsed();
        if self.log_policy.screen_log {
            debug!(
                rank = self.rank,
                samples = self.sample_count,
                log_likelihood = self.log_likelihood,
                p_accept = self.acceptance_rate(),
                elapsed_ms = elapsed.as_millis() as u64,
                "round finished"
            );
        }
        Ok(elapsed)
    }

    fn current_log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    fn temperature(&self) -> f64 {
        self.temperature
    }

    fn calc_log_likelihood_robustly(&mut self) -> Result<f64, ChainFault> {
        let raw = self.target.unnorm_log_prob(&self.values());
        if raw.is_nan() {
            return Err(ChainFault::NanLikelihood);
        }
        self.raw_log_prob = raw;
        self.log_likelihood = raw / self.temperature;
        Ok(self.log_likelihood)
    }

    fn optimise_run_time(
        &mut self,
        round_start: Instant,
        own_finish: Instant,
        reference_finish: Instant,
    ) {
        let before = self.tuner.steps_per_sample();
        self.tuner.update(round_start, own_finish, reference_finish);
        if self.log_policy.screen_log && before != self.tuner.steps_per_sample() {
            debug!(
                rank = self.rank,
                from = before,
                to = self.tuner.steps_per_sample(),
                "rebalanced inner steps per sample"
            );
        }
    }

    fn state_nodes(&self) -> &[ParamNode] {
        &self.nodes
    }

    fn state_nodes_mut(&mut self) -> &mut [ParamNode] {
        &mut self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{GaussianMixture, IsotropicGaussian};
    use approx::assert_abs_diff_eq;

    type Chain = HeatedMetropolisHastings<GaussianMixture<f64>, IsotropicGaussian<f64>>;

    fn chain(rank: usize, seed: u64) -> Chain {
        let target = GaussianMixture::new(vec![-2.0, 2.0], 1.0, 2);
        let proposal = IsotropicGaussian::new(0.8).set_seed(seed);
        let mut chain = HeatedMetropolisHastings::new(target, proposal, &[0.5, -0.5])
            .set_seed(seed)
            .set_log_policy(LogPolicy::for_rank(0, false));
        chain.configure(rank, 50, 0.5);
        chain
    }

    #[test]
    fn heated_log_likelihood_scales_with_temperature() {
        let mut cold = chain(0, 1);
        let mut hot = chain(2, 1);
        let lp_cold = cold.calc_log_likelihood_robustly().unwrap();
        let lp_hot = hot.calc_log_likelihood_robustly().unwrap();
        assert_eq!(hot.temperature(), 2.0);
        assert_abs_diff_eq!(lp_hot, lp_cold / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn round_runs_resample_every_samples() {
        let mut c = chain(0, 3).set_steps_per_sample(2);
        c.start().unwrap();
        c.run_till_resample().unwrap();
        c.run_till_resample().unwrap();
        assert_eq!(c.sample_count(), 100);
        assert_eq!(c.samples().unwrap().dim(), (100, 2));
        assert!(c.acceptance_rate() > 0.0);
    }

    #[test]
    fn cached_log_likelihood_tracks_state() {
        let mut c = chain(1, 5);
        c.start().unwrap();
        c.run_till_resample().unwrap();
        let cached = c.current_log_likelihood();
        let robust = c.calc_log_likelihood_robustly().unwrap();
        assert_abs_diff_eq!(cached, robust, epsilon = 1e-9);
    }

    #[test]
    fn quiet_chain_records_nothing() {
        let mut c = chain(1, 5).set_log_policy(LogPolicy::for_rank(1, false));
        c.start().unwrap();
        c.run_till_resample().unwrap();
        assert_eq!(c.samples().unwrap().nrows(), 0);
    }

    #[test]
    fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.0state");

        let mut first = chain(0, 11);
        first.set_state_file(&path, false).unwrap();
        first.start().unwrap();
        first.run_till_resample().unwrap();
        let values = first.values();

        let mut resumed = chain(0, 12);
        resumed.set_state_file(&path, true).unwrap();
        resumed.start().unwrap();
        assert_eq!(resumed.values(), values);
        assert_eq!(resumed.sample_count(), 50);
        assert_abs_diff_eq!(
            resumed.current_log_likelihood(),
            first.current_log_likelihood(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn restoring_mismatched_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.0state");
        fs::write(
            &path,
            r#"{"rank":0,"sample_count":3,"steps_per_sample":1,"nodes":[{"id":"theta0","value":1.0}]}"#,
        )
        .unwrap();
        let mut c = chain(0, 1);
        c.set_state_file(&path, true).unwrap();
        assert!(matches!(
            c.start(),
            Err(ChainFault::StateDimension {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn restoring_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = chain(0, 1);
        c.set_state_file(&dir.path().join("absent.0state"), true)
            .unwrap();
        assert!(matches!(c.start(), Err(ChainFault::Io { .. })));
    }

    #[test]
    fn slow_heated_chain_reduces_inner_steps() {
        let mut c = chain(1, 1).set_steps_per_sample(8);
        let start = Instant::now();
        c.optimise_run_time(
            start,
            start + Duration::from_millis(300),
            start + Duration::from_millis(100),
        );
        assert!(c.steps_per_sample() < 8);
    }

    /// Zero density on the positive half-line, NaN at the origin.
    struct HalfLine;

    impl Target<f64> for HalfLine {
        fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
            match theta[0] {
                x if x == 0.0 => f64::NAN,
                x if x > 0.0 => f64::NEG_INFINITY,
                x => -x * x,
            }
        }
    }

    #[test]
    fn nan_likelihood_is_an_error_but_zero_density_is_not() {
        let proposal = IsotropicGaussian::new(1.0).set_seed(3);
        let mut c = HeatedMetropolisHastings::new(HalfLine, proposal, &[1.0]);
        assert_eq!(
            c.calc_log_likelihood_robustly().unwrap(),
            f64::NEG_INFINITY
        );

        c.state_nodes_mut()[0].value = 0.0;
        assert!(matches!(
            c.calc_log_likelihood_robustly(),
            Err(ChainFault::NanLikelihood)
        ));
    }
}
