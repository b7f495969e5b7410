//! Traits the coordinator consumes from the chains it drives.
//!
//! A coupled run needs three collaborators: a [`HeatedChain`] that samples at
//! a fixed temperature, the [`StateNode`]s that make up a chain's state, and a
//! [`ChainTemplate`] that produces one chain per rank.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::ChainError;

/// One independently swappable component of a chain's state.
///
/// Swapping copies values between nodes; a node keeps its own identity.
pub trait StateNode: Clone + Send {
    /// Stable identity of this node; never changed by [`StateNode::assign_from_without_id`].
    fn id(&self) -> &str;

    /// Copies the value of `other` into `self`, leaving `self`'s identity untouched.
    fn assign_from_without_id(&mut self, other: &Self);
}

/// An MCMC sampler running at a fixed temperature.
///
/// Chains are driven in rounds: the coordinator calls
/// [`HeatedChain::run_till_resample`] on every chain in parallel, and only
/// touches a chain's state or likelihood after all of them have returned.
pub trait HeatedChain: Send {
    /// The node type of this chain's state.
    type Node: StateNode;
    /// Error type reported by the chain.
    type Error: Into<ChainError>;

    /// Sets rank, round length and temperature scaler. Called once, before [`HeatedChain::start`].
    fn configure(&mut self, rank: usize, resample_every: usize, temperature_scaler: f64);

    /// Sets where the chain persists its state, and whether to resume from it.
    fn set_state_file(&mut self, path: &Path, restore: bool) -> Result<(), Self::Error>;

    /// Initializes the chain so that rounds can be run.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Runs exactly `resample_every` samples and returns the elapsed wall time.
    fn run_till_resample(&mut self) -> Result<Duration, Self::Error>;

    /// Cached log-likelihood of the current state at this chain's temperature.
    fn current_log_likelihood(&self) -> f64;

    fn temperature(&self) -> f64;

    /// Recomputes the log-likelihood from scratch and overwrites the cached value.
    fn calc_log_likelihood_robustly(&mut self) -> Result<f64, Self::Error>;

    /// Adjusts the per-sample workload so this chain finishes closer to the reference chain.
    fn optimise_run_time(
        &mut self,
        round_start: Instant,
        own_finish: Instant,
        reference_finish: Instant,
    );

    fn state_nodes(&self) -> &[Self::Node];

    fn state_nodes_mut(&mut self) -> &mut [Self::Node];
}

/// Per-chain logging policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPolicy {
    /// Emit per-round progress events for this chain.
    pub screen_log: bool,
    /// Keep the chain's samples in memory.
    pub record_samples: bool,
}

impl LogPolicy {
    /// Policy for `rank`: the reference chain always logs, heated chains only on request.
    pub fn for_rank(rank: usize, log_heated_chains: bool) -> Self {
        let enabled = rank == 0 || log_heated_chains;
        Self {
            screen_log: enabled,
            record_samples: enabled,
        }
    }
}

/// What a [`ChainTemplate`] needs to know to build the chain for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSpawn {
    pub rank: usize,
    pub seed: u64,
    pub log_policy: LogPolicy,
}

/// Builds one chain per rank from a shared model description.
pub trait ChainTemplate {
    type Chain: HeatedChain;

    fn spawn(&self, spawn: &ChainSpawn) -> Result<Self::Chain, <Self::Chain as HeatedChain>::Error>;
}

impl<C, F> ChainTemplate for F
where
    C: HeatedChain,
    F: Fn(&ChainSpawn) -> Result<C, C::Error>,
{
    type Chain = C;

    fn spawn(&self, spawn: &ChainSpawn) -> Result<C, C::Error> {
        self(spawn)
    }
}

/// Temperature of the chain with the given rank: `1 + rank * temperature_scaler`.
///
/// Rank 0 is the reference chain at temperature 1.
pub fn temperature_for_rank(rank: usize, temperature_scaler: f64) -> f64 {
    1.0 + rank as f64 * temperature_scaler
}
