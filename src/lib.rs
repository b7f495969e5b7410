//! # Coupled MCMC
//!
//! Metropolis-coupled Markov chain Monte Carlo (MC³, parallel tempering).
//! Several chains sample the same model at increasing temperatures, run in
//! parallel in lockstep rounds, and after each round propose exchanging the
//! states of two random chains. Heated chains cross between modes easily;
//! accepted exchanges carry those moves down to the cold reference chain.
//!
//! ## Getting started
//!
//! You provide:
//! - a chain type implementing [`core::HeatedChain`] (or use the bundled
//!   [`heated::HeatedMetropolisHastings`] with a [`distributions::Target`]
//!   and [`distributions::Proposal`]);
//! - a [`core::ChainTemplate`], usually a closure, that builds the chain for
//!   each rank;
//! - a [`config::CoupledConfig`].
//!
//! ```rust
//! use coupled_mcmc::config::CoupledConfig;
//! use coupled_mcmc::core::ChainSpawn;
//! use coupled_mcmc::coupled::CoupledMCMC;
//! use coupled_mcmc::distributions::{GaussianMixture, IsotropicGaussian, Proposal};
//! use coupled_mcmc::heated::{ChainFault, HeatedMetropolisHastings};
//! use std::time::Duration;
//!
//! let dir = std::env::temp_dir().join("coupled-mcmc-lib-doc");
//! std::fs::create_dir_all(&dir).unwrap();
//!
//! // 4 chains, swap attempts every 100 samples, 2,000 samples in total.
//! let config = CoupledConfig::default()
//!     .set_chains(4)
//!     .set_resample_every(100)
//!     .set_chain_length(2_000)
//!     .set_temperature_scaler(1.0)
//!     .set_state_file(dir.join("lib.state"), false)
//!     .set_shutdown_grace(Duration::ZERO)
//!     .set_seed(7);
//!
//! let template = |spawn: &ChainSpawn| -> Result<_, ChainFault> {
//!     let target = GaussianMixture::new(vec![-5.0, 5.0], 1.0, 1);
//!     let proposal = IsotropicGaussian::new(1.0).set_seed(spawn.seed);
//!     Ok(HeatedMetropolisHastings::new(target, proposal, &[-5.0]).for_spawn(spawn))
//! };
//!
//! let mut mcmc = CoupledMCMC::new(config, &template).unwrap();
//! let summary = mcmc.run().unwrap();
//! println!(
//!     "{} of {} swaps accepted, {} with the cold chain",
//!     summary.swaps.accepted, summary.swaps.attempts, summary.swaps.accepted_with_cold
//! );
//!
//! // Only the reference chain records samples by default.
//! let cold = mcmc.chains[0].samples().unwrap();
//! assert_eq!(cold.nrows(), 2_000);
//! ```
//!
//! ## Features
//! - **Lockstep rounds** on a dedicated rayon pool, one worker per chain
//! - **Metropolis swap test** with running swap statistics
//! - **Runtime balancing** of heated chains against the reference chain
//! - **Progress bar** with the running swap acceptance rate
//! - **Structured logging** through `tracing`

pub mod balance;
pub mod config;
pub mod core;
pub mod coupled;
pub mod distributions;
pub mod error;
pub mod heated;
pub mod swap;

pub use config::CoupledConfig;
pub use coupled::{CoupledMCMC, RunSummary};
pub use error::{CoupledError, Result};
