//! Error type shared by the coordinator, its configuration and the bundled chain.

use thiserror::Error;

/// Boxed error returned by a chain implementation.
pub type ChainError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while setting up or running a coupled sampler.
#[derive(Error, Debug)]
pub enum CoupledError {
    /// The configuration cannot be used to start a run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A chain reported an error, either during a round or a lifecycle call.
    #[error("chain {rank} failed: {source}")]
    Chain {
        rank: usize,
        #[source]
        source: ChainError,
    },

    /// A chain panicked while running its round.
    #[error("chain {rank} panicked during a round: {message}")]
    WorkerPanicked { rank: usize, message: String },

    /// Two states (or a state and the swap buffer) have different slot counts.
    #[error("state shape mismatch: expected {expected} state nodes, found {found}")]
    StateShape { expected: usize, found: usize },

    /// A swap was requested between ranks that do not form a valid pair.
    #[error("cannot swap chains {i} and {j} out of {n}")]
    InvalidSwap { i: usize, j: usize, n: usize },

    /// A round faulted earlier, so the chains are out of lockstep.
    #[error("run halted after a faulted round; {rounds} rounds completed")]
    Halted { rounds: usize },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoupledError {
    /// Wraps an error reported by the chain with the given rank.
    pub fn chain<E>(rank: usize, source: E) -> Self
    where
        E: Into<ChainError>,
    {
        CoupledError::Chain {
            rank,
            source: source.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoupledError>;
