/*!
# Metropolis-coupled MCMC coordinator

[`CoupledMCMC`] runs `N` heated chains in lockstep rounds. Each round:

1. every chain runs `resample_every` samples on its own worker thread;
2. once all workers are back, two chains are picked at random and a state
   exchange is proposed and accepted or rejected with a Metropolis test;
3. every heated chain is told how its round time compared to the reference
   chain's so it can rebalance its workload.

Rounds repeat until `chain_length` samples have been taken. Only the rank 0
chain samples the target itself; the others help it cross between modes.

Altekar G, Dwarkadas S, Huelsenbeck J and Ronquist F (2004). Parallel
Metropolis Coupled Markov Chain Monte Carlo For Bayesian Phylogenetic
Inference. Bioinformatics, 20(3), 407-415.

## Example

```rust
use coupled_mcmc::config::CoupledConfig;
use coupled_mcmc::core::ChainSpawn;
use coupled_mcmc::coupled::CoupledMCMC;
use coupled_mcmc::distributions::{GaussianMixture, IsotropicGaussian, Proposal};
use coupled_mcmc::heated::{ChainFault, HeatedMetropolisHastings};
use std::time::Duration;

let dir = std::env::temp_dir().join("coupled-mcmc-doc");
std::fs::create_dir_all(&dir).unwrap();

let config = CoupledConfig::default()
    .set_chains(3)
    .set_resample_every(50)
    .set_chain_length(500)
    .set_temperature_scaler(0.5)
    .set_state_file(dir.join("doc.state"), false)
    .set_shutdown_grace(Duration::ZERO)
    .set_seed(42);

let template = |spawn: &ChainSpawn| -> Result<_, ChainFault> {
    let target = GaussianMixture::new(vec![-3.0, 3.0], 1.0, 1);
    let proposal = IsotropicGaussian::new(1.0).set_seed(spawn.seed);
    Ok(HeatedMetropolisHastings::new(target, proposal, &[0.0]).for_spawn(spawn))
};

let mut mcmc = CoupledMCMC::new(config, &template).unwrap();
let summary = mcmc.run().unwrap();
assert_eq!(summary.rounds, 10);
assert_eq!(summary.samples_per_chain, 500);
assert_eq!(summary.swaps.attempts, 10);
```
*/

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::prelude::*;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::balance::RoundTimings;
use crate::config::CoupledConfig;
use crate::core::{ChainSpawn, ChainTemplate, HeatedChain, LogPolicy};
use crate::error::{CoupledError, Result};
use crate::swap::{accept_with, choose_pair, swap_states, SwapProposal, SwapStats};

/// Where the coordinator is in its round cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RunningRound,
    Swapping,
    Balancing,
    Done,
    /// A round faulted; the chains are no longer in lockstep and no further
    /// rounds are run.
    Failed,
}

/// Result of one swap attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapOutcome {
    pub proposal: SwapProposal,
    pub log_alpha: f64,
    pub accepted: bool,
}

/// Result of one completed round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub timings: RoundTimings,
    /// `None` when there is only one chain.
    pub swap: Option<SwapOutcome>,
}

/// Totals after a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub rounds: usize,
    /// Samples every chain has taken; identical across chains.
    pub samples_per_chain: usize,
    pub swaps: SwapStats,
    pub balancing_calls: u64,
}

/// Coordinator for a set of chains at increasing temperatures.
pub struct CoupledMCMC<C: HeatedChain> {
    pub config: CoupledConfig,
    /// Chains ordered by rank; rank 0 is the reference chain.
    pub chains: Vec<C>,
    /// The master seed. Chain `r` was seeded with `seed + r`.
    pub seed: u64,
    swap_buffer: Vec<C::Node>,
    rng: SmallRng,
    pool: ThreadPool,
    stats: SwapStats,
    phase: Phase,
    rounds: usize,
    balancing_calls: u64,
}

impl<C: HeatedChain> CoupledMCMC<C> {
    /**
    Builds, configures and starts one chain per rank.

    Fails with [`CoupledError::InvalidConfig`] if the configuration does not
    validate, with [`CoupledError::Chain`] if any chain fails to spawn or
    start, and with [`CoupledError::StateShape`] if the chains' states do not
    all have the same number of nodes.
    */
    pub fn new<T>(config: CoupledConfig, template: &T) -> Result<Self>
    where
        T: ChainTemplate<Chain = C>,
    {
        config.validate()?;
        if config.chains == 1 {
            warn!("coupled MCMC needs at least 2 chains to be effective, but chains=1; running plain MCMC");
        }
        let seed = config.seed.unwrap_or_else(|| thread_rng().gen::<u64>());

        let mut chains = Vec::with_capacity(config.chains);
        for rank in 0..config.chains {
            let spawn = ChainSpawn {
                rank,
                seed: seed.wrapping_add(rank as u64),
                log_policy: LogPolicy::for_rank(rank, config.log_heated_chains),
            };
            let mut chain = template
                .spawn(&spawn)
                .map_err(|e| CoupledError::chain(rank, e))?;
            chain.configure(rank, config.resample_every, config.temperature_scaler);
            chain
                .set_state_file(&config.state_file_for_rank(rank), config.restore_from_file)
                .map_err(|e| CoupledError::chain(rank, e))?;
            chain.start().map_err(|e| CoupledError::chain(rank, e))?;
            debug!(rank, temperature = chain.temperature(), "chain ready");
            chains.push(chain);
        }

        let swap_buffer = chains[0].state_nodes().to_vec();
        for chain in &chains[1..] {
            if chain.state_nodes().len() != swap_buffer.len() {
                return Err(CoupledError::StateShape {
                    expected: swap_buffer.len(),
                    found: chain.state_nodes().len(),
                });
            }
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.chains)
            .thread_name(|i| format!("chain-{i}"))
            .build()?;

        Ok(Self {
            rng: SmallRng::seed_from_u64(seed.wrapping_add(config.chains as u64)),
            config,
            chains,
            seed,
            swap_buffer,
            pool,
            stats: SwapStats::default(),
            phase: Phase::Idle,
            rounds: 0,
            balancing_calls: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> SwapStats {
        self.stats
    }

    pub fn chains_mut(&mut self) -> &mut Vec<C> {
        &mut self.chains
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            rounds: self.rounds,
            samples_per_chain: self.rounds * self.config.resample_every,
            swaps: self.stats,
            balancing_calls: self.balancing_calls,
        }
    }

    /// Runs rounds until every chain has taken at least `chain_length` samples
    /// in total, counting rounds already run through [`CoupledMCMC::step_round`].
    pub fn run(&mut self) -> Result<RunSummary> {
        while self.rounds < self.config.rounds() {
            self.step_round()?;
        }
        Ok(self.finish())
    }

    /**
    Same as [`CoupledMCMC::run`], with a progress bar over rounds.

    The bar's message shows the running swap acceptance rate and the number of
    accepted swaps that reached the reference chain.
    */
    pub fn run_progress(&mut self) -> Result<RunSummary> {
        let pb = ProgressBar::new(self.config.rounds() as u64);
        pb.set_position(self.rounds.min(self.config.rounds()) as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_prefix("MC3");

        while self.rounds < self.config.rounds() {
            if let Err(e) = self.step_round() {
                pb.abandon_with_message("Failed!");
                return Err(e);
            }
            pb.inc(1);
            pb.set_message(format!(
                "p(swap)≈{:.2} cold swaps={}",
                self.stats.acceptance_rate(),
                self.stats.accepted_with_cold
            ));
        }
        pb.finish_with_message("Done!");
        Ok(self.finish())
    }

    /**
    Runs one full round: all chains in parallel, one swap attempt, then
    workload balancing.

    If any worker fails, the remaining workers still finish their round, but
    the round is not counted and no swap or balancing happens; the error of the
    lowest failing rank is returned. The coordinator then moves to
    [`Phase::Failed`] and every later call returns [`CoupledError::Halted`].
    */
    pub fn step_round(&mut self) -> Result<RoundReport> {
        if self.phase == Phase::Failed {
            return Err(CoupledError::Halted {
                rounds: self.rounds,
            });
        }
        let report = self.run_round();
        if report.is_err() {
            self.phase = Phase::Failed;
        }
        report
    }

    fn run_round(&mut self) -> Result<RoundReport> {
        self.phase = Phase::RunningRound;
        let round_start = Instant::now();
        let chains = &mut self.chains;
        let outcomes: Vec<Result<Instant>> = self.pool.install(|| {
            chains
                .par_iter_mut()
                .enumerate()
                .map(|(rank, chain)| run_worker(rank, chain))
                .collect()
        });
        let finish = outcomes.into_iter().collect::<Result<Vec<Instant>>>()?;
        self.rounds += 1;
        let timings = RoundTimings::new(round_start, finish);
        debug!(
            round = self.rounds,
            idle_ms = timings.barrier_idle().as_millis() as u64,
            "round complete"
        );

        if self.chains.len() < 2 {
            return Ok(RoundReport {
                timings,
                swap: None,
            });
        }

        self.phase = Phase::Swapping;
        let swap = self.attempt_swap()?;

        self.phase = Phase::Balancing;
        for (rank, own_finish, reference_finish) in timings.heated() {
            self.chains[rank].optimise_run_time(timings.start, own_finish, reference_finish);
            self.balancing_calls += 1;
        }

        Ok(RoundReport {
            timings,
            swap: Some(swap),
        })
    }

    /// Picks two random chains and resolves a swap between them.
    ///
    /// Requires at least two chains.
    pub fn attempt_swap(&mut self) -> Result<SwapOutcome> {
        let n = self.chains.len();
        let Some((i, j)) = choose_pair(&mut self.rng, n) else {
            return Err(CoupledError::InvalidSwap { i: 0, j: 0, n });
        };
        let u = self.rng.gen::<f64>();
        self.resolve_swap(i, j, u)
    }

    /**
    Scores an exchange between chains `i` and `j` and accepts it iff
    `exp(log_alpha) >= u`.

    On acceptance the states are exchanged and both chains recompute their
    log-likelihood from scratch. On rejection nothing is touched.
    */
    pub fn resolve_swap(&mut self, i: usize, j: usize, u: f64) -> Result<SwapOutcome> {
        let (i, j) = if i <= j { (i, j) } else { (j, i) };
        let n = self.chains.len();
        if i == j || j >= n {
            return Err(CoupledError::InvalidSwap { i, j, n });
        }
        let proposal = SwapProposal::new(
            i,
            j,
            self.chains[i].current_log_likelihood(),
            self.chains[i].temperature(),
            self.chains[j].current_log_likelihood(),
            self.chains[j].temperature(),
        );
        let log_alpha = proposal.log_alpha();
        info!(
            target: "coupled_mcmc::swap",
            accepted_with_cold = self.stats.accepted_with_cold,
            accepted = self.stats.accepted,
            i,
            j,
            log_alpha,
            acceptance_rate = self.stats.acceptance_rate(),
            "swap attempt"
        );

        let accepted = accept_with(log_alpha, u);
        if accepted {
            self.swap_states(i, j)?;
            self.chains[i]
                .calc_log_likelihood_robustly()
                .map_err(|e| CoupledError::chain(i, e))?;
            self.chains[j]
                .calc_log_likelihood_robustly()
                .map_err(|e| CoupledError::chain(j, e))?;
            debug!(target: "coupled_mcmc::swap", i, j, "swap accepted");
        }
        self.stats.record(i, accepted);

        Ok(SwapOutcome {
            proposal,
            log_alpha,
            accepted,
        })
    }

    /// Exchanges the state values of chains `i` and `j` through the swap buffer.
    ///
    /// Cached log-likelihoods are left as they are.
    pub fn swap_states(&mut self, i: usize, j: usize) -> Result<()> {
        if i == j {
            return Ok(());
        }
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let (left, right) = self.chains.split_at_mut(hi);
        swap_states(
            left[lo].state_nodes_mut(),
            right[0].state_nodes_mut(),
            &mut self.swap_buffer,
        )
    }

    fn finish(&mut self) -> RunSummary {
        self.phase = Phase::Done;
        info!(
            successful_swaps = self.stats.accepted,
            successful_swaps_with_cold = self.stats.accepted_with_cold,
            attempts = self.stats.attempts,
            "coupled run finished"
        );
        let grace = self.config.shutdown_grace();
        if !grace.is_zero() {
            thread::sleep(grace);
        }
        self.summary()
    }
}

/// Runs one chain's round, containing any error or panic to this worker.
fn run_worker<C: HeatedChain>(rank: usize, chain: &mut C) -> Result<Instant> {
    match panic::catch_unwind(AssertUnwindSafe(|| chain.run_till_resample())) {
        Ok(Ok(elapsed)) => {
            let finish = Instant::now();
            debug!(rank, elapsed_ms = elapsed.as_millis() as u64, "worker done");
            Ok(finish)
        }
        Ok(Err(e)) => {
            let err = CoupledError::chain(rank, e);
            error!(rank, error = %err, "chain failed during round");
            Err(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(rank, message = %message, "chain panicked during round");
            Err(CoupledError::WorkerPanicked { rank, message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
