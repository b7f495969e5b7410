//! Run configuration for the coupled sampler.
//!
//! Every field has a serde default, so a JSON file only needs to name the
//! values it changes:
//!
//! ```rust
//! use coupled_mcmc::config::CoupledConfig;
//!
//! let config = CoupledConfig::from_json_str(r#"{ "chains": 4, "chain_length": 20000 }"#).unwrap();
//! assert_eq!(config.chains, 4);
//! assert_eq!(config.resample_every, 10_000);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoupledError, Result};

/// Parameters the coordinator needs beyond what each chain configures itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoupledConfig {
    /// Number of chains to run in parallel.
    #[serde(default = "default_chains")]
    pub chains: usize,
    /// Number of samples between swap attempts.
    #[serde(default = "default_resample_every")]
    pub resample_every: usize,
    /// The higher this value, the hotter the chains.
    #[serde(default = "default_temperature_scaler")]
    pub temperature_scaler: f64,
    /// If true, heated chains keep their screen logging and sample recording.
    #[serde(default)]
    pub log_heated_chains: bool,
    /// Total number of samples every chain must run.
    #[serde(default = "default_chain_length")]
    pub chain_length: usize,
    /// Base path for persisted chain states; each rank derives its own file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Directory where per-chain state files are written.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Resume every chain from its persisted state file.
    #[serde(default)]
    pub restore_from_file: bool,
    /// Master seed; chain `r` is seeded with `seed + r`.
    #[serde(default)]
    pub seed: Option<u64>,
    /// How long to wait after the last round so chain log writers can flush.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_chains() -> usize {
    2
}

fn default_resample_every() -> usize {
    10_000
}

fn default_temperature_scaler() -> f64 {
    0.01
}

fn default_chain_length() -> usize {
    1_000_000
}

fn default_state_file() -> PathBuf {
    PathBuf::from("mcmc.state")
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for CoupledConfig {
    fn default() -> Self {
        Self {
            chains: default_chains(),
            resample_every: default_resample_every(),
            temperature_scaler: default_temperature_scaler(),
            log_heated_chains: false,
            chain_length: default_chain_length(),
            state_file: default_state_file(),
            temp_dir: None,
            restore_from_file: false,
            seed: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl CoupledConfig {
    /// Parses a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects configurations the coordinator cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.chains < 1 {
            return Err(CoupledError::InvalidConfig(
                "chains must be at least 1".to_string(),
            ));
        }
        if self.resample_every == 0 {
            return Err(CoupledError::InvalidConfig(
                "resample_every must be positive".to_string(),
            ));
        }
        if !(self.temperature_scaler.is_finite() && self.temperature_scaler > 0.0) {
            return Err(CoupledError::InvalidConfig(format!(
                "temperature_scaler must be a positive finite number, got {}",
                self.temperature_scaler
            )));
        }
        Ok(())
    }

    /// Grace period slept after the final round.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Number of rounds needed to cover `chain_length`; the last round is never truncated.
    pub fn rounds(&self) -> usize {
        if self.resample_every == 0 {
            return 0;
        }
        self.chain_length.div_ceil(self.resample_every)
    }

    /// Persisted state path for the chain with the given rank.
    pub fn state_file_for_rank(&self, rank: usize) -> PathBuf {
        let path = state_file_for_rank(&self.state_file, rank);
        match &self.temp_dir {
            Some(dir) => match path.file_name() {
                Some(name) => dir.join(name),
                None => dir.join(path),
            },
            None => path,
        }
    }

    pub fn set_chains(mut self, chains: usize) -> Self {
        self.chains = chains;
        self
    }

    pub fn set_resample_every(mut self, resample_every: usize) -> Self {
        self.resample_every = resample_every;
        self
    }

    pub fn set_temperature_scaler(mut self, temperature_scaler: f64) -> Self {
        self.temperature_scaler = temperature_scaler;
        self
    }

    pub fn set_chain_length(mut self, chain_length: usize) -> Self {
        self.chain_length = chain_length;
        self
    }

    pub fn set_log_heated_chains(mut self, log_heated_chains: bool) -> Self {
        self.log_heated_chains = log_heated_chains;
        self
    }

    pub fn set_state_file<P: Into<PathBuf>>(mut self, state_file: P, restore: bool) -> Self {
        self.state_file = state_file.into();
        self.restore_from_file = restore;
        self
    }

    pub fn set_temp_dir<P: Into<PathBuf>>(mut self, temp_dir: P) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    /// Sets the master seed. Chain `r` receives `seed + r`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn set_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Derives the state file of chain `rank` from a base path.
///
/// `run.xml.state` becomes `run.xml.0state` for rank 0; a base name without a
/// `.state` suffix gets `.{rank}state` appended.
pub fn state_file_for_rank(base: &Path, rank: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ranked = match name.strip_suffix(".state") {
        Some(stem) => format!("{stem}.{rank}state"),
        None => format!("{name}.{rank}state"),
    };
    base.with_file_name(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoupledConfig::default();
        assert_eq!(config.chains, 2);
        assert_eq!(config.resample_every, 10_000);
        assert_eq!(config.temperature_scaler, 0.01);
        assert!(!config.log_heated_chains);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_gives_defaults() {
        let config = CoupledConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoupledConfig::default());
    }

    #[test]
    fn zero_chains_is_rejected() {
        let err = CoupledConfig::default().set_chains(0).validate().unwrap_err();
        assert!(matches!(err, CoupledError::InvalidConfig(ref m) if m.contains("at least 1")));
    }

    #[test]
    fn zero_resample_every_is_rejected() {
        let config = CoupledConfig::default().set_resample_every(0);
        assert!(matches!(
            config.validate(),
            Err(CoupledError::InvalidConfig(_))
        ));
    }

    #[test]
    fn non_positive_temperature_scaler_is_rejected() {
        for scaler in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = CoupledConfig::default().set_temperature_scaler(scaler);
            assert!(config.validate().is_err(), "scaler {scaler} accepted");
        }
    }

    #[test]
    fn rounds_round_up() {
        let config = CoupledConfig::default()
            .set_chain_length(25)
            .set_resample_every(10);
        assert_eq!(config.rounds(), 3);
        let config = config.set_chain_length(30);
        assert_eq!(config.rounds(), 3);
        let config = config.set_chain_length(0);
        assert_eq!(config.rounds(), 0);
    }

    #[test]
    fn state_files_are_ranked() {
        assert_eq!(
            state_file_for_rank(Path::new("out/run.xml.state"), 0),
            PathBuf::from("out/run.xml.0state")
        );
        assert_eq!(
            state_file_for_rank(Path::new("run.xml.state"), 3),
            PathBuf::from("run.xml.3state")
        );
        assert_eq!(
            state_file_for_rank(Path::new("chain"), 1),
            PathBuf::from("chain.1state")
        );
    }

    #[test]
    fn temp_dir_relocates_state_files() {
        let config = CoupledConfig::default()
            .set_state_file("out/run.state", false)
            .set_temp_dir("/tmp/coupled");
        assert_eq!(
            config.state_file_for_rank(2),
            PathBuf::from("/tmp/coupled/run.2state")
        );
    }

    #[test]
    fn oversized_grace_saturates() {
        let config = CoupledConfig::default().set_shutdown_grace(Duration::MAX);
        assert_eq!(config.shutdown_grace_ms, u64::MAX);
        let config = CoupledConfig::default().set_shutdown_grace(Duration::from_millis(250));
        assert_eq!(config.shutdown_grace(), Duration::from_millis(250));
    }
}
