//! Search orchestrator: multistart, monotonic basin hopping and the combined
//! global search, built on randomized initialization, perturbation and the
//! model's local solve.
//!
//! The orchestrator owns all run state ([`SearchState`]) and the audit logs.
//! Models are passed in per call, so the same bookkeeping can serve a single
//! shared model or a population of independently built ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::init;
use crate::logs::SearchLogs;
use crate::model::{Model, SolveStatus};
use crate::perturb::{self, Epsilon};
use crate::snapshot::Snapshot;

/// Configuration shared by every search algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Absolute improvement threshold on the objective
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,
    #[serde(default = "default_perturb_seed")]
    pub perturb_seed: u64,
    /// Construct+solve attempts allowed when looking for a starting point
    #[serde(default = "default_max_trials_start")]
    pub max_trials_start: usize,
    /// Seed cell-level variables from the reduced model after each draw
    #[serde(default)]
    pub use_presolve: bool,
    #[serde(default)]
    pub epsilon: Epsilon,
}

fn default_tol() -> f64 {
    1e-4
}
fn default_init_seed() -> u64 {
    1
}
fn default_perturb_seed() -> u64 {
    2
}
fn default_max_trials_start() -> usize {
    50
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            tol: default_tol(),
            init_seed: default_init_seed(),
            perturb_seed: default_perturb_seed(),
            max_trials_start: default_max_trials_start(),
            use_presolve: false,
            epsilon: Epsilon::default(),
        }
    }
}

/// A distinct feasible objective value seen during the run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationaryPoint {
    pub objective: f64,
    pub hits: u64,
}

/// Mutable state of one optimisation run
#[derive(Debug)]
pub struct SearchState {
    /// Putative optimum, set by the first feasible solve
    pub best_snapshot: Option<Snapshot>,
    pub best_objective: f64,
    pub current_snapshot: Option<Snapshot>,
    pub feasible_count: u64,
    pub local_search_count: u64,
    pub infeasible_count: u64,
    /// Consecutive feasible or infeasible outcomes without a strict improvement
    pub no_improve_count: u64,
    pub trial_count: u64,
    pub feasible_found: bool,
    pub stationary_points: Vec<StationaryPoint>,
    init_stream: StdRng,
    perturb_stream: StdRng,
}

impl SearchState {
    pub fn new(init_seed: u64, perturb_seed: u64) -> Self {
        Self {
            best_snapshot: None,
            best_objective: f64::INFINITY,
            current_snapshot: None,
            feasible_count: 0,
            local_search_count: 0,
            infeasible_count: 0,
            no_improve_count: 0,
            trial_count: 0,
            feasible_found: false,
            stationary_points: Vec::new(),
            init_stream: StdRng::seed_from_u64(init_seed),
            perturb_stream: StdRng::seed_from_u64(perturb_seed),
        }
    }

    pub fn best_objective(&self) -> Option<f64> {
        self.best_snapshot.as_ref().map(|_| self.best_objective)
    }

    pub fn summary(&self) -> String {
        format!(
            "trials={} local_searches={} infeasible={} feasible={} distinct_points={} best={}",
            self.trial_count,
            self.local_search_count,
            self.infeasible_count,
            self.feasible_count,
            self.stationary_points.len(),
            self.best_objective()
                .map(|b| format!("{:.6e}", b))
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

/// Orchestrates local solves and keeps the best-known solution
pub struct GlobalOptimisation {
    pub config: SearchConfig,
    pub state: SearchState,
    logs: SearchLogs,
    stop: Option<Arc<AtomicBool>>,
}

impl GlobalOptimisation {
    /// Orchestrator with logging disabled
    pub fn new(config: SearchConfig) -> Self {
        Self::with_logs(config, SearchLogs::disabled())
    }

    pub fn with_logs(config: SearchConfig, logs: SearchLogs) -> Self {
        let state = SearchState::new(config.init_seed, config.perturb_seed);
        Self {
            config,
            state,
            logs,
            stop: None,
        }
    }

    /// Flag polled between outer-loop iterations; set it to stop early
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop = Some(flag);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Random structurally valid point, optionally refined by the reduced model
    pub fn construct_starting_point<M: Model + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        init::randomize(model, &mut self.state.init_stream)?;
        if self.config.use_presolve {
            init::presolve(model)?;
        }
        Ok(())
    }

    /// Local solve with counter bookkeeping
    ///
    /// After `Infeasible` the model holds whatever the solver left behind and
    /// must not be snapshotted.
    pub fn run_local_search<M: Model + ?Sized>(&mut self, model: &mut M) -> SolveStatus {
        let status = model.solve();
        match status {
            SolveStatus::Feasible => self.state.local_search_count += 1,
            SolveStatus::Infeasible => self.state.infeasible_count += 1,
        }
        status
    }

    /// Construct and solve until the first feasible point, at most `max_trials` times
    pub fn find_starting_solution<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        max_trials: usize,
    ) -> Result<bool> {
        for _ in 0..max_trials {
            self.construct_starting_point(model)?;
            let status = self.run_local_search(model);
            self.log_trial(model, "start", status)?;
            if status.is_feasible() {
                self.state.current_snapshot = Some(Snapshot::capture(model)?);
                self.save_solution(model)?;
                return Ok(true);
            }
        }
        log::debug!("No feasible starting point after {} trials", max_trials);
        Ok(false)
    }

    /// Perturb the model's current point in place
    ///
    /// Returns the pre-perturbation snapshot so callers can roll back.
    pub fn perturb_solution<M: Model + ?Sized>(&mut self, model: &mut M) -> Result<Snapshot> {
        let center = Snapshot::capture(model)?;
        perturb::perturb(model, &center, &self.config.epsilon, &mut self.state.perturb_stream)?;
        if self.config.use_presolve {
            init::presolve(model)?;
        }
        Ok(center)
    }

    /// Record the model's current feasible point
    ///
    /// Returns true when it strictly improves the putative best by more than
    /// `tol`, in which case it becomes the new best.
    pub fn save_solution<M: Model + ?Sized>(&mut self, model: &M) -> Result<bool> {
        let objective = model.objective();
        let snapshot = Snapshot::capture(model)?;
        self.state.feasible_count += 1;
        self.state.feasible_found = true;

        let revisit = match self
            .state
            .stationary_points
            .iter_mut()
            .find(|p| p.objective == objective)
        {
            Some(point) => {
                point.hits += 1;
                true
            }
            None => {
                self.state.stationary_points.push(StationaryPoint { objective, hits: 1 });
                false
            }
        };
        self.logs
            .stationary_point(self.state.feasible_count, objective, revisit, &snapshot)?;

        if objective < self.state.best_objective - self.config.tol {
            log::info!(
                "New best objective {:.6e} (previous {:.6e})",
                objective,
                self.state.best_objective
            );
            self.logs
                .best_point(self.state.local_search_count, objective, &snapshot)?;
            self.state.best_objective = objective;
            self.state.best_snapshot = Some(snapshot);
            self.state.no_improve_count = 0;
            Ok(true)
        } else {
            self.state.no_improve_count += 1;
            Ok(false)
        }
    }

    /// Load the putative best into `model`; false if none exists yet
    pub fn restore_best<M: Model + ?Sized>(&self, model: &mut M) -> Result<bool> {
        match &self.state.best_snapshot {
            Some(best) => {
                best.restore(model)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `n` independent construct+solve trials; leaves the best loaded
    pub fn multistart<M: Model + ?Sized>(&mut self, model: &mut M, n: usize) -> Result<bool> {
        for trial in 0..n {
            if self.stop_requested() {
                log::info!("Stop requested, multistart ends after {} trials", trial);
                break;
            }
            self.construct_starting_point(model)?;
            let status = self.run_local_search(model);
            self.log_trial(model, "multistart", status)?;
            if status.is_feasible() {
                self.save_solution(model)?;
            }
        }
        self.restore_best(model)?;
        Ok(self.state.feasible_found)
    }

    /// Monotonic basin hopping from a fresh starting point
    pub fn mbh<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        max_trials_start: usize,
        max_no_improve: u64,
    ) -> Result<bool> {
        if !self.find_starting_solution(model, max_trials_start)? {
            return Ok(false);
        }
        self.basin_hop(model, max_no_improve)?;
        self.restore_best(model)?;
        Ok(true)
    }

    /// Multistart where every accepted starting point seeds a basin-hopping run
    pub fn global_optimisation_algorithm<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        n_starts: usize,
        max_trials_start: usize,
        max_no_improve: u64,
    ) -> Result<bool> {
        for start in 0..n_starts {
            if self.stop_requested() {
                log::info!("Stop requested, global search ends after {} starts", start);
                break;
            }
            if self.find_starting_solution(model, max_trials_start)? {
                self.basin_hop(model, max_no_improve)?;
            }
        }
        self.restore_best(model)?;
        Ok(self.state.feasible_found)
    }

    /// Perturb+solve from the model's current point until `max_no_improve`
    /// consecutive cycles fail to improve the putative best
    fn basin_hop<M: Model + ?Sized>(&mut self, model: &mut M, max_no_improve: u64) -> Result<()> {
        self.state.no_improve_count = 0;
        while self.state.no_improve_count < max_no_improve {
            if self.stop_requested() {
                break;
            }
            let center = self.perturb_solution(model)?;
            let status = self.run_local_search(model);
            self.log_trial(model, "perturb", status)?;

            let improved = if status.is_feasible() {
                self.save_solution(model)?
            } else {
                self.state.no_improve_count += 1;
                false
            };

            if improved {
                self.state.current_snapshot = Some(Snapshot::capture(model)?);
            } else {
                center.restore(model)?;
            }
        }
        Ok(())
    }

    fn log_trial<M: Model + ?Sized>(&mut self, model: &M, kind: &str, status: SolveStatus) -> Result<()> {
        self.state.trial_count += 1;
        let objective = status.is_feasible().then(|| model.objective());
        self.logs
            .trial(self.state.trial_count, kind, status.is_feasible(), objective)
    }
}
