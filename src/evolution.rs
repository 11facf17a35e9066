//! Evolutionary population search over one fixed model structure
//!
//! Each generation:
//! 1. Reproduce: every individual is loaded, perturbed and locally solved,
//!    giving one child per parent
//! 2. Rank: parents and children are clustered on their split-fraction
//!    variables (PCA then k-means); the cluster id is the rank
//! 3. Replace: a child competes only with population members of its rank

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cluster::{kmeans, pca_project};
use crate::error::{Result, SearchError};
use crate::model::Model;
use crate::orchestrator::GlobalOptimisation;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default = "default_pop_size")]
    pub pop_size: usize,
    #[serde(default = "default_generations")]
    pub generations: usize,
    /// Number of k-means clusters used as ranks
    #[serde(default = "default_clusters")]
    pub clusters: usize,
    /// Share of feature variance kept by the projection
    #[serde(default = "default_variance_retained")]
    pub variance_retained: f64,
    /// Score given to infeasible individuals
    #[serde(default = "default_infeasible_penalty")]
    pub infeasible_penalty: f64,
    #[serde(default = "default_cluster_seed")]
    pub cluster_seed: u64,
    /// Families used as ranking features; empty means every simplex family
    #[serde(default)]
    pub feature_families: Vec<String>,
}

fn default_pop_size() -> usize {
    10
}
fn default_generations() -> usize {
    20
}
fn default_clusters() -> usize {
    3
}
fn default_variance_retained() -> f64 {
    0.95
}
fn default_infeasible_penalty() -> f64 {
    1e20
}
fn default_cluster_seed() -> u64 {
    3
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            pop_size: default_pop_size(),
            generations: default_generations(),
            clusters: default_clusters(),
            variance_retained: default_variance_retained(),
            infeasible_penalty: default_infeasible_penalty(),
            cluster_seed: default_cluster_seed(),
            feature_families: Vec::new(),
        }
    }
}

/// One solved (or failed) point of the population
#[derive(Debug, Clone)]
pub struct Individual {
    pub snapshot: Snapshot,
    /// `None` when the local solve was infeasible
    pub objective: Option<f64>,
    pub active: bool,
    /// Cluster id from the last ranking
    pub rank: Option<usize>,
    /// Variables to fix again whenever this individual is loaded
    pub refix: Option<BTreeMap<String, f64>>,
}

impl Individual {
    pub fn feasible(snapshot: Snapshot, objective: f64) -> Self {
        Self {
            snapshot,
            objective: Some(objective),
            active: true,
            rank: None,
            refix: None,
        }
    }

    pub fn inactive(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            objective: None,
            active: false,
            rank: None,
            refix: None,
        }
    }

    /// Objective for comparisons; infeasible individuals get `penalty`
    pub fn score(&self, penalty: f64) -> f64 {
        match (self.active, self.objective) {
            (true, Some(obj)) => obj,
            _ => penalty,
        }
    }

    /// Restore the snapshot into `model` and reapply pinned variables
    pub fn load<M: Model + ?Sized>(&self, model: &mut M) -> Result<()> {
        self.snapshot.restore(model)?;
        if let Some(refix) = &self.refix {
            for (name, &value) in refix {
                model.fix(name, value)?;
            }
        }
        Ok(())
    }
}

/// Per-generation summary
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub population: usize,
    pub active: usize,
    pub best_objective: Option<f64>,
    pub avg_objective: Option<f64>,
    pub children_accepted: usize,
}

pub struct EvolutionarySearch {
    pub config: EvolutionConfig,
    pub population: Vec<Individual>,
    pub generation: usize,
    pub history: Vec<GenerationStats>,
    cluster_rng: StdRng,
}

impl EvolutionarySearch {
    pub fn new(config: EvolutionConfig) -> Result<Self> {
        if config.pop_size == 0 {
            return Err(SearchError::InvalidConfig(
                "evolution pop_size must be at least 1".to_string(),
            ));
        }
        if config.clusters == 0 {
            return Err(SearchError::InvalidConfig(
                "evolution clusters must be at least 1".to_string(),
            ));
        }
        let cluster_rng = StdRng::seed_from_u64(config.cluster_seed);
        Ok(Self {
            config,
            population: Vec::new(),
            generation: 0,
            history: Vec::new(),
            cluster_rng,
        })
    }

    /// `pop_size` independent starts from the model's current point
    ///
    /// Infeasible starts are kept as inactive individuals.
    pub fn initialize<M: Model + ?Sized>(
        &mut self,
        opt: &mut GlobalOptimisation,
        model: &mut M,
    ) -> Result<()> {
        let reference = Snapshot::capture(model)?;
        let pinned: BTreeMap<String, f64> = model
            .all_variables()
            .into_iter()
            .filter(|name| model.is_fixed(name))
            .filter_map(|name| model.value(&name).map(|v| (name, v)))
            .collect();
        let refix = (!pinned.is_empty()).then_some(pinned);

        self.population.clear();
        for _ in 0..self.config.pop_size {
            reference.restore(model)?;
            let mut individual = if opt.find_starting_solution(model, 1)? {
                Individual::feasible(Snapshot::capture(model)?, model.objective())
            } else {
                Individual::inactive(reference.clone())
            };
            individual.refix = refix.clone();
            self.population.push(individual);
        }

        let active = self.population.iter().filter(|i| i.active).count();
        log::info!(
            "Initial population: {} individuals, {} feasible",
            self.population.len(),
            active
        );
        Ok(())
    }

    /// Drop inactive individuals; fixes the working population for the run
    pub fn select_individual(&mut self) {
        let before = self.population.len();
        self.population.retain(|i| i.active);
        let dropped = before - self.population.len();
        if dropped > 0 {
            log::debug!("Dropped {} inactive individuals", dropped);
        }
    }

    /// One perturbed, locally solved child per individual, same index
    pub fn reproduce<M: Model + ?Sized>(
        &mut self,
        opt: &mut GlobalOptimisation,
        model: &mut M,
    ) -> Result<Vec<Individual>> {
        let mut children = Vec::with_capacity(self.population.len());
        for parent in &self.population {
            parent.load(model)?;
            opt.perturb_solution(model)?;
            let mut child = if opt.run_local_search(model).is_feasible() {
                opt.save_solution(model)?;
                Individual::feasible(Snapshot::capture(model)?, model.objective())
            } else {
                Individual::inactive(parent.snapshot.clone())
            };
            child.refix = parent.refix.clone();
            children.push(child);
        }
        Ok(children)
    }

    /// Cluster parents and children together; the cluster id becomes the rank
    pub fn rank(&mut self, children: &mut [Individual], features: &[String]) {
        let names = || features.iter().map(String::as_str);
        let rows: Vec<Vec<f64>> = self
            .population
            .iter()
            .chain(children.iter())
            .map(|i| i.snapshot.feature_vector(names()))
            .collect();

        let projected = pca_project(&rows, self.config.variance_retained);
        let labels = kmeans(&projected, self.config.clusters, &mut self.cluster_rng);

        let (parent_labels, child_labels) = labels.split_at(self.population.len());
        for (ind, &label) in self.population.iter_mut().zip(parent_labels) {
            ind.rank = Some(label);
        }
        for (ind, &label) in children.iter_mut().zip(child_labels) {
            ind.rank = Some(label);
        }
    }

    /// Rank-local replacement; returns how many children were accepted
    ///
    /// A child with an unseen rank joins the population. Otherwise it
    /// replaces the worst member of its rank if strictly better than it.
    pub fn replace(&mut self, children: Vec<Individual>) -> usize {
        let penalty = self.config.infeasible_penalty;
        let mut accepted = 0;

        for child in children.into_iter().filter(|c| c.active) {
            let same_rank: Vec<usize> = self
                .population
                .iter()
                .enumerate()
                .filter(|(_, ind)| ind.rank == child.rank)
                .map(|(idx, _)| idx)
                .collect();

            let worst = same_rank.into_iter().max_by(|&a, &b| {
                self.population[a]
                    .score(penalty)
                    .partial_cmp(&self.population[b].score(penalty))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            match worst {
                None => {
                    self.population.push(child);
                    accepted += 1;
                }
                Some(idx) if child.score(penalty) < self.population[idx].score(penalty) => {
                    self.population[idx] = child;
                    accepted += 1;
                }
                Some(_) => {}
            }
        }
        accepted
    }

    /// Minimum-objective active individual
    pub fn best(&self) -> Option<&Individual> {
        self.population
            .iter()
            .filter(|i| i.active && i.objective.is_some())
            .min_by(|a, b| {
                a.objective
                    .partial_cmp(&b.objective)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Run the configured number of generations; leaves the best loaded
    pub fn run<M: Model + ?Sized>(
        &mut self,
        opt: &mut GlobalOptimisation,
        model: &mut M,
    ) -> Result<bool> {
        if self.population.is_empty() {
            self.initialize(opt, model)?;
        }
        self.select_individual();
        if self.population.is_empty() {
            log::warn!("No feasible individual in the initial population");
            return Ok(false);
        }

        let features = self.feature_names(model);
        for _ in 0..self.config.generations {
            if opt.stop_requested() {
                log::info!("Stop requested after {} generations", self.generation);
                break;
            }
            let mut children = self.reproduce(opt, model)?;
            self.rank(&mut children, &features);
            let accepted = self.replace(children);
            self.generation += 1;

            let stats = self.compute_stats(accepted);
            log::info!(
                "Generation {}: population {} best {:?} accepted {}",
                stats.generation,
                stats.population,
                stats.best_objective,
                stats.children_accepted
            );
            self.history.push(stats);
        }

        match self.best() {
            Some(best) => {
                best.load(model)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn feature_names<M: Model + ?Sized>(&self, model: &M) -> Vec<String> {
        model
            .families()
            .into_iter()
            .filter(|f| {
                if self.config.feature_families.is_empty() {
                    f.is_simplex()
                } else {
                    self.config.feature_families.contains(&f.name)
                }
            })
            .flat_map(|f| f.members.into_iter().map(|m| m.name))
            .collect()
    }

    fn compute_stats(&self, children_accepted: usize) -> GenerationStats {
        let objectives: Vec<f64> = self
            .population
            .iter()
            .filter(|i| i.active)
            .filter_map(|i| i.objective)
            .collect();
        let avg = (!objectives.is_empty())
            .then(|| objectives.iter().sum::<f64>() / objectives.len() as f64);
        GenerationStats {
            generation: self.generation,
            population: self.population.len(),
            active: objectives.len(),
            best_objective: self.best().and_then(|b| b.objective),
            avg_objective: avg,
            children_accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SearchConfig;
    use crate::testing::{Fallback, Scripted, ScriptedModel};

    fn ranked(objective: f64, rank: usize) -> Individual {
        let mut snap = Snapshot::default();
        snap.insert("x", objective);
        let mut ind = Individual::feasible(snap, objective);
        ind.rank = Some(rank);
        ind
    }

    fn search_with(population: Vec<Individual>) -> EvolutionarySearch {
        let mut search = EvolutionarySearch::new(EvolutionConfig::default()).unwrap();
        search.population = population;
        search
    }

    // =========================================================================
    // Replacement
    // =========================================================================

    #[test]
    fn test_child_with_new_rank_is_appended() {
        let mut search = search_with(vec![ranked(5.0, 0), ranked(6.0, 1)]);
        let accepted = search.replace(vec![ranked(9.0, 2)]);
        assert_eq!(accepted, 1);
        assert_eq!(search.population.len(), 3);
    }

    #[test]
    fn test_better_child_replaces_same_rank_parent() {
        let mut search = search_with(vec![ranked(5.0, 0), ranked(6.0, 1)]);
        search.replace(vec![ranked(4.0, 1)]);
        assert_eq!(search.population.len(), 2);
        assert_eq!(search.population[1].objective, Some(4.0));
    }

    #[test]
    fn test_worse_child_is_discarded() {
        let mut search = search_with(vec![ranked(5.0, 0), ranked(6.0, 1)]);
        let accepted = search.replace(vec![ranked(7.0, 0)]);
        assert_eq!(accepted, 0);
        assert_eq!(search.population[0].objective, Some(5.0));
    }

    #[test]
    fn test_rank_collision_replaces_worst_duplicate() {
        let mut search = search_with(vec![ranked(3.0, 0), ranked(8.0, 0), ranked(6.0, 0)]);
        search.replace(vec![ranked(5.0, 0)]);
        let objectives: Vec<f64> = search.population.iter().filter_map(|i| i.objective).collect();
        assert_eq!(objectives, vec![3.0, 5.0, 6.0]);
    }

    #[test]
    fn test_inactive_children_never_enter() {
        let mut search = search_with(vec![ranked(5.0, 0)]);
        let mut child = Individual::inactive(Snapshot::default());
        child.rank = Some(3);
        assert_eq!(search.replace(vec![child]), 0);
        assert_eq!(search.population.len(), 1);
    }

    // =========================================================================
    // Population lifecycle
    // =========================================================================

    #[test]
    fn test_select_drops_inactive() {
        let mut model = ScriptedModel::simplex3().scripted(&[
            Scripted::Feasible(1.0),
            Scripted::Infeasible,
            Scripted::Feasible(2.0),
        ]);
        let mut opt = GlobalOptimisation::new(SearchConfig::default());
        let config = EvolutionConfig {
            pop_size: 3,
            ..EvolutionConfig::default()
        };
        let mut search = EvolutionarySearch::new(config).unwrap();
        search.initialize(&mut opt, &mut model).unwrap();
        assert_eq!(search.population.len(), 3);
        assert!(!search.population[1].active);

        search.select_individual();
        assert_eq!(search.population.len(), 2);
    }

    #[test]
    fn test_best_survives_generation_without_improvement() {
        let mut script: Vec<Scripted> = [10.0, 8.0, 12.0, 7.0, 9.0]
            .iter()
            .map(|&o| Scripted::Feasible(o))
            .collect();
        script.extend((0..5).map(|i| Scripted::Feasible(20.0 + i as f64)));
        let mut model = ScriptedModel::simplex3()
            .scripted(&script)
            .fallback(Fallback::Infeasible);
        let mut opt = GlobalOptimisation::new(SearchConfig::default());
        let config = EvolutionConfig {
            pop_size: 5,
            generations: 1,
            clusters: 2,
            ..EvolutionConfig::default()
        };
        let mut search = EvolutionarySearch::new(config).unwrap();

        assert!(search.run(&mut opt, &mut model).unwrap());

        assert_eq!(search.generation, 1);
        assert_eq!(search.best().unwrap().objective, Some(7.0));
        assert_eq!(search.history.last().unwrap().best_objective, Some(7.0));
        assert_eq!(model.value("x"), Some(7.0));
        assert_eq!(opt.state.best_objective, 7.0);
    }

    #[test]
    fn test_refix_reapplied_on_load() {
        let mut model = ScriptedModel::simplex3();
        model.fix("split[0]", 0.25).unwrap();
        let mut opt = GlobalOptimisation::new(SearchConfig::default());
        let config = EvolutionConfig {
            pop_size: 2,
            ..EvolutionConfig::default()
        };
        let mut search = EvolutionarySearch::new(config).unwrap();
        search.initialize(&mut opt, &mut model).unwrap();

        model.unfix("split[0]").unwrap();
        search.population[0].load(&mut model).unwrap();
        assert!(model.is_fixed("split[0]"));
        assert_eq!(model.value("split[0]"), Some(0.25));
    }

    #[test]
    fn test_zero_population_rejected() {
        let config = EvolutionConfig {
            pop_size: 0,
            ..EvolutionConfig::default()
        };
        assert!(matches!(
            EvolutionarySearch::new(config),
            Err(SearchError::InvalidConfig(_))
        ));
    }
}
