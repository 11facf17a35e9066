//! Configuration loading and CLI argument parsing

use clap::Parser;
use serde::Deserialize;

use membrane_search::evolution::EvolutionConfig;
use membrane_search::perturb::Epsilon;
use membrane_search::population::PopulationConfig;
use membrane_search::surrogate::CascadeParams;
use membrane_search::{Algorithm, Prototype, SearchConfig};

/// Algorithm used when neither the config nor the CLI picks one
pub const DEFAULT_ALGORITHM: &str = "global";

#[derive(Parser, Debug)]
#[command(name = "search")]
#[command(about = "Stochastic global search for membrane process designs")]
pub struct Args {
    /// Path to config file
    #[arg(short = 'c', long, default_value = "search.toml")]
    pub config: String,

    /// multistart, mbh, global, evolutionary or population (overrides config)
    #[arg(short = 'a', long)]
    pub algorithm: Option<String>,

    /// Seed for the initialization stream; perturbation uses seed + 1
    #[arg(short = 's', long)]
    pub seed: Option<u64>,

    /// Directory for the audit logs and the best-point export (overrides config)
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Search a single prototype with this many stages instead of the configured list
    #[arg(long)]
    pub stages: Option<usize>,

    /// Verbose output (stationary-point registry and best variable dump)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub population: PopulationConfig,
    /// Overrides `search.epsilon` when present
    #[serde(default)]
    pub epsilon: Option<Epsilon>,
    #[serde(default)]
    pub surrogate: CascadeParams,
    #[serde(default = "default_prototypes")]
    pub prototypes: Vec<Prototype>,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_output_dir() -> String {
    "results".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Trials of the plain multistart
    #[serde(default = "default_multistart_trials")]
    pub multistart_trials: usize,
    /// Starting points of the combined global search
    #[serde(default = "default_n_starts")]
    pub n_starts: usize,
    #[serde(default = "default_max_no_improve")]
    pub max_no_improve: u64,
}

fn default_algorithm() -> String {
    DEFAULT_ALGORITHM.to_string()
}
fn default_multistart_trials() -> usize {
    20
}
fn default_n_starts() -> usize {
    5
}
fn default_max_no_improve() -> u64 {
    20
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            multistart_trials: default_multistart_trials(),
            n_starts: default_n_starts(),
            max_no_improve: default_max_no_improve(),
        }
    }
}

fn default_prototypes() -> Vec<Prototype> {
    vec![
        Prototype::new("two-stage", 2),
        Prototype::new("three-stage", 3),
        Prototype::new("single-stage", 1),
        Prototype::new("four-stage", 4),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            search: SearchConfig::default(),
            limits: LimitsConfig::default(),
            evolution: EvolutionConfig::default(),
            population: PopulationConfig::default(),
            epsilon: None,
            surrogate: CascadeParams::default(),
            prototypes: default_prototypes(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse {}: {}", path, e);
                Config::default()
            }),
            Err(_) => {
                eprintln!("Warning: No config file at {}, using defaults", path);
                Config::default()
            }
        }
    }

    /// Fold CLI overrides and the `[epsilon]` section into the config
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(algorithm) = &args.algorithm {
            self.limits.algorithm = algorithm.clone();
        }
        if let Some(seed) = args.seed {
            self.search.init_seed = seed;
            self.search.perturb_seed = seed.wrapping_add(1);
        }
        if let Some(output) = &args.output {
            self.paths.output_dir = output.clone();
        }
        if let Some(stages) = args.stages {
            self.prototypes = vec![Prototype::new(format!("{}-stage", stages), stages)];
        }
        if let Some(epsilon) = self.epsilon.take() {
            self.search.epsilon = epsilon;
        }
    }

    pub fn algorithm(&self) -> Result<Algorithm, String> {
        let limits = &self.limits;
        match limits.algorithm.as_str() {
            "multistart" => Ok(Algorithm::Multistart {
                n: limits.multistart_trials,
            }),
            "mbh" => Ok(Algorithm::Mbh {
                max_trials_start: self.search.max_trials_start,
                max_no_improve: limits.max_no_improve,
            }),
            "global" => Ok(Algorithm::Global {
                n_starts: limits.n_starts,
                max_trials_start: self.search.max_trials_start,
                max_no_improve: limits.max_no_improve,
            }),
            "evolutionary" => Ok(Algorithm::Evolutionary(self.evolution.clone())),
            "population" => Ok(Algorithm::Population(self.population.clone())),
            other => Err(format!(
                "Unknown algorithm '{}' (expected multistart, mbh, global, evolutionary or population)",
                other
            )),
        }
    }
}
