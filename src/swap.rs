//! The state-exchange step of Metropolis-coupled MCMC.
//!
//! After each round the coordinator picks two chains, scores an exchange of
//! their states with a Metropolis test, and on acceptance copies the states
//! across node by node.

use rand::Rng;

use crate::core::StateNode;
use crate::error::{CoupledError, Result};

/// Picks two distinct ranks uniformly from `0..n_chains`, returned as `(i, j)` with `i < j`.
///
/// Returns `None` when there are fewer than two chains.
pub fn choose_pair<R: Rng + ?Sized>(rng: &mut R, n_chains: usize) -> Option<(usize, usize)> {
    if n_chains < 2 {
        return None;
    }
    let i = rng.gen_range(0..n_chains);
    let mut j = i;
    while i == j {
        j = rng.gen_range(0..n_chains);
    }
    Some(if i < j { (i, j) } else { (j, i) })
}

/**
A proposed exchange between chains `i` and `j`.

The post-swap scores are not computed by re-evaluating the likelihood. They
assume the temperature scales the log-likelihood multiplicatively, so chain
`i`'s state scored at chain `j`'s temperature is `p_i * T_i / T_j`. This only
holds for chains whose heated log-likelihood is `raw / T`, as with
[`crate::heated::HeatedMetropolisHastings`].

```rust
use coupled_mcmc::swap::SwapProposal;

let proposal = SwapProposal::new(0, 1, -10.0, 1.0, -12.0, 0.5);
assert_eq!(proposal.p1_after, -20.0);
assert_eq!(proposal.p2_after, -6.0);
assert_eq!(proposal.log_alpha(), -4.0);
```
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapProposal {
    pub i: usize,
    pub j: usize,
    pub p1_before: f64,
    pub p2_before: f64,
    pub p1_after: f64,
    pub p2_after: f64,
}

impl SwapProposal {
    /// Scores an exchange between chain `i` (log-likelihood `p1`, temperature `t1`)
    /// and chain `j` (`p2`, `t2`).
    pub fn new(i: usize, j: usize, p1: f64, t1: f64, p2: f64, t2: f64) -> Self {
        Self {
            i,
            j,
            p1_before: p1,
            p2_before: p2,
            p1_after: p1 * t1 / t2,
            p2_after: p2 * t2 / t1,
        }
    }

    /// Log of the Metropolis acceptance ratio of the exchange.
    pub fn log_alpha(&self) -> f64 {
        (self.p1_after - self.p1_before) + (self.p2_after - self.p2_before)
    }

    /// Draws a uniform number and runs the Metropolis test.
    pub fn accept<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        accept_with(self.log_alpha(), rng.gen::<f64>())
    }
}

/// Metropolis test: accept iff `exp(log_alpha) >= u`. A NaN ratio never accepts.
pub fn accept_with(log_alpha: f64, u: f64) -> bool {
    log_alpha.exp() >= u
}

/// Running swap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub attempts: u64,
    pub accepted: u64,
    /// Accepted swaps that involved the reference chain (rank 0).
    pub accepted_with_cold: u64,
}

impl SwapStats {
    pub fn record(&mut self, i: usize, accepted: bool) {
        self.attempts += 1;
        if accepted {
            self.accepted += 1;
            if i == 0 {
                self.accepted_with_cold += 1;
            }
        }
    }

    /// Fraction of accepted attempts; NaN before the first attempt.
    pub fn acceptance_rate(&self) -> f64 {
        if self.attempts == 0 {
            f64::NAN
        } else {
            self.accepted as f64 / self.attempts as f64
        }
    }
}

/// Exchanges the values of two states through `buffer`, one slot at a time.
///
/// All three slices must have the same length. Node identities are preserved.
pub fn swap_states<N: StateNode>(a: &mut [N], b: &mut [N], buffer: &mut [N]) -> Result<()> {
    if a.len() != b.len() {
        return Err(CoupledError::StateShape {
            expected: a.len(),
            found: b.len(),
        });
    }
    if buffer.len() != a.len() {
        return Err(CoupledError::StateShape {
            expected: a.len(),
            found: buffer.len(),
        });
    }
    for ((node_a, node_b), tmp) in a.iter_mut().zip(b.iter_mut()).zip(buffer.iter_mut()) {
        tmp.assign_from_without_id(node_a);
        node_a.assign_from_without_id(node_b);
        node_b.assign_from_without_id(tmp);
    }
    Ok(())
}
