//! Algorithm selection and the common run entry point

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::evolution::{EvolutionConfig, EvolutionarySearch};
use crate::model::{Model, ModelBuilder, Prototype};
use crate::orchestrator::GlobalOptimisation;
use crate::population::{PopulationConfig, PrototypePopulation};
use crate::snapshot::Snapshot;

/// Search algorithm and its parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    Multistart {
        n: usize,
    },
    Mbh {
        max_trials_start: usize,
        max_no_improve: u64,
    },
    Global {
        n_starts: usize,
        max_trials_start: usize,
        max_no_improve: u64,
    },
    Evolutionary(EvolutionConfig),
    Population(PopulationConfig),
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Multistart { .. } => "multistart",
            Algorithm::Mbh { .. } => "mbh",
            Algorithm::Global { .. } => "global",
            Algorithm::Evolutionary(_) => "evolutionary",
            Algorithm::Population(_) => "population",
        }
    }
}

/// Counters copied out of the orchestrator state at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Counters {
    pub trials: u64,
    pub local_searches: u64,
    pub infeasible: u64,
    pub feasible: u64,
    pub distinct_points: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub algorithm: String,
    pub feasible: bool,
    pub best_objective: Option<f64>,
    pub best_snapshot: Option<Snapshot>,
    /// Prototype label of the best point, when the run spans several models
    pub best_label: Option<String>,
    pub counters: Counters,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} in {:.2}s ({} local searches, {} infeasible, {} distinct points)",
            self.algorithm,
            self.best_objective
                .map(|b| format!("best {:.6e}", b))
                .unwrap_or_else(|| "no feasible point".to_string()),
            self.elapsed.as_secs_f64(),
            self.counters.local_searches,
            self.counters.infeasible,
            self.counters.distinct_points,
        )
    }

    /// Write the outcome as pretty JSON to `<dir>/best_<objective>_<timestamp>.json`
    ///
    /// Returns `None` when the run found no feasible point.
    pub fn save_best(&self, dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
        let Some(objective) = self.best_objective else {
            return Ok(None);
        };
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        // 12.3456 -> "12_3456"
        let objective_str = format!("{:.4}", objective).replace('.', "_");
        let path = dir.join(format!("best_{}_{}.json", objective_str, timestamp));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(Some(path))
    }
}

type Best = (bool, Option<f64>, Option<Snapshot>, Option<String>);

/// Build the first prototype's model with its fixings applied and run `search`
/// on it. `search` returns the best objective when a feasible point was found
/// and leaves that point loaded in the model.
fn run_single<B, F>(
    builder: &B,
    prototypes: &[Prototype],
    opt: &mut GlobalOptimisation,
    search: F,
) -> Result<Best>
where
    B: ModelBuilder,
    F: FnOnce(&mut GlobalOptimisation, &mut B::Model) -> Result<Option<f64>>,
{
    let prototype = prototypes.first().ok_or_else(|| {
        SearchError::InvalidConfig("at least one prototype is required".to_string())
    })?;
    let mut model = builder.build(prototype)?;
    for (name, &value) in &prototype.fixings {
        model.fix(name, value)?;
    }

    match search(opt, &mut model)? {
        Some(objective) => Ok((
            true,
            Some(objective),
            Some(Snapshot::capture(&model)?),
            Some(prototype.label.clone()),
        )),
        None => Ok((false, None, None, None)),
    }
}

/// Run `algorithm` and collect the outcome
///
/// Single-model algorithms use the first prototype; the prototype population
/// search consumes the whole list.
pub fn run_algorithm<B: ModelBuilder>(
    algorithm: &Algorithm,
    builder: B,
    prototypes: &[Prototype],
    opt: &mut GlobalOptimisation,
) -> Result<RunOutcome> {
    let start = Instant::now();
    log::info!("Running {} search", algorithm.name());

    let (feasible, best_objective, best_snapshot, best_label) = match algorithm {
        Algorithm::Multistart { n } => run_single(&builder, prototypes, opt, |opt, model| {
            Ok(opt.multistart(model, *n)?.then(|| opt.state.best_objective))
        })?,
        Algorithm::Mbh {
            max_trials_start,
            max_no_improve,
        } => run_single(&builder, prototypes, opt, |opt, model| {
            Ok(opt
                .mbh(model, *max_trials_start, *max_no_improve)?
                .then(|| opt.state.best_objective))
        })?,
        Algorithm::Global {
            n_starts,
            max_trials_start,
            max_no_improve,
        } => run_single(&builder, prototypes, opt, |opt, model| {
            Ok(opt
                .global_optimisation_algorithm(model, *n_starts, *max_trials_start, *max_no_improve)?
                .then(|| opt.state.best_objective))
        })?,
        Algorithm::Evolutionary(config) => {
            let mut search = EvolutionarySearch::new(config.clone())?;
            run_single(&builder, prototypes, opt, |opt, model| {
                let found = search.run(opt, model)?;
                Ok(search.best().and_then(|b| b.objective).filter(|_| found))
            })?
        }
        Algorithm::Population(config) => {
            let mut search =
                PrototypePopulation::new(builder, prototypes.to_vec(), config.clone())?;
            let feasible = search.run(opt)?;
            match search.best {
                Some(best) => (feasible, best.objective, best.snapshot, Some(best.label)),
                None => (feasible, None, None, None),
            }
        }
    };

    let state = &opt.state;
    let outcome = RunOutcome {
        algorithm: algorithm.name().to_string(),
        feasible,
        best_objective,
        best_snapshot,
        best_label,
        counters: Counters {
            trials: state.trial_count,
            local_searches: state.local_search_count,
            infeasible: state.infeasible_count,
            feasible: state.feasible_count,
            distinct_points: state.stationary_points.len(),
        },
        elapsed: start.elapsed(),
    };
    log::info!("{}", outcome.summary());
    Ok(outcome)
}
