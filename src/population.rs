//! Prototype population search
//!
//! Every individual owns its own model, built from an entry of an ordered
//! prototype list, so members may differ structurally (number of stages,
//! pinned variables). Each generation every member runs a short internal
//! local search; old and below-average members are culled and the
//! population is topped up from the unused prototypes. The run ends when the
//! prototype list is exhausted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::model::{Model, ModelBuilder, Prototype};
use crate::orchestrator::GlobalOptimisation;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Population size maintained from the prototype list
    #[serde(default = "default_extraction_target")]
    pub extraction_target: usize,
    /// Internal local-search iterations per member and generation
    #[serde(default = "default_k_iterations")]
    pub k_iterations: usize,
    /// Members reaching this age are dropped
    #[serde(default = "default_beta_one")]
    pub beta_one: u32,
    /// Period, in generations, of the below-average culls
    #[serde(default = "default_beta_two")]
    pub beta_two: usize,
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
}

fn default_extraction_target() -> usize {
    3
}
fn default_k_iterations() -> usize {
    5
}
fn default_beta_one() -> u32 {
    5
}
fn default_beta_two() -> usize {
    3
}
fn default_max_generations() -> usize {
    1000
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            extraction_target: default_extraction_target(),
            k_iterations: default_k_iterations(),
            beta_one: default_beta_one(),
            beta_two: default_beta_two(),
            max_generations: default_max_generations(),
        }
    }
}

/// Population member owning its model instance
#[derive(Debug, Clone)]
pub struct Individu<M> {
    pub model: M,
    /// Variables held constant for this member
    pub fixings: BTreeMap<String, f64>,
    /// Index of the prototype this member was built from
    pub family_id: usize,
    pub label: String,
    pub active: bool,
    /// Generations survived since creation or last replacement
    pub age: u32,
    /// Best feasible point of this member
    pub snapshot: Option<Snapshot>,
    pub objective: Option<f64>,
}

impl<M: Model> Individu<M> {
    fn is_better_than(&self, other: &Individu<M>) -> bool {
        match (self.active, self.objective, other.active, other.objective) {
            (true, Some(_), false, _) => true,
            (true, Some(_), true, None) => true,
            (true, Some(a), true, Some(b)) => a < b,
            _ => false,
        }
    }
}

/// Per-generation summary of the prototype population
#[derive(Debug, Clone, Serialize)]
pub struct PopulationStats {
    pub generation: usize,
    pub population: usize,
    pub active: usize,
    pub avg_objective: Option<f64>,
    pub replaced: usize,
    pub culled: usize,
    pub prototypes_used: usize,
    pub best_objective: Option<f64>,
}

pub struct PrototypePopulation<B: ModelBuilder> {
    pub config: PopulationConfig,
    pub population: Vec<Individu<B::Model>>,
    pub generation: usize,
    /// Best member ever observed
    pub best: Option<Individu<B::Model>>,
    pub history: Vec<PopulationStats>,
    builder: B,
    prototypes: Vec<Prototype>,
    next_prototype: usize,
}

impl<B: ModelBuilder> PrototypePopulation<B> {
    pub fn new(builder: B, prototypes: Vec<Prototype>, config: PopulationConfig) -> Result<Self> {
        if config.extraction_target == 0 {
            return Err(SearchError::InvalidConfig(
                "population extraction_target must be at least 1".to_string(),
            ));
        }
        if config.beta_one == 0 || config.beta_two == 0 {
            return Err(SearchError::InvalidConfig(
                "population beta_one and beta_two must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            population: Vec::new(),
            generation: 0,
            best: None,
            history: Vec::new(),
            builder,
            prototypes,
            next_prototype: 0,
        })
    }

    pub fn prototypes_used(&self) -> usize {
        self.next_prototype
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_prototype >= self.prototypes.len()
    }

    /// Build the next prototype's model, apply its fixings and look for a
    /// feasible starting point. `None` once the list is exhausted.
    pub fn spawn(&mut self, opt: &mut GlobalOptimisation) -> Result<Option<Individu<B::Model>>> {
        let Some(prototype) = self.prototypes.get(self.next_prototype) else {
            return Ok(None);
        };
        let family_id = self.next_prototype;
        self.next_prototype += 1;

        let mut model = self.builder.build(prototype)?;
        for (name, &value) in &prototype.fixings {
            model.fix(name, value)?;
        }

        let mut individu = Individu {
            model,
            fixings: prototype.fixings.clone(),
            family_id,
            label: prototype.label.clone(),
            active: false,
            age: 0,
            snapshot: None,
            objective: None,
        };

        let max_trials = opt.config.max_trials_start;
        if opt.find_starting_solution(&mut individu.model, max_trials)? {
            individu.snapshot = Some(Snapshot::capture(&individu.model)?);
            individu.objective = Some(individu.model.objective());
            individu.active = true;
        }
        log::debug!(
            "Spawned '{}' (family {}): {}",
            individu.label,
            family_id,
            individu
                .objective
                .map(|o| format!("objective {:.6e}", o))
                .unwrap_or_else(|| "infeasible".to_string())
        );
        self.track_best(&individu);
        Ok(Some(individu))
    }

    /// Top the population back up to the extraction target
    pub fn replenish(&mut self, opt: &mut GlobalOptimisation) -> Result<usize> {
        let mut added = 0;
        while self.population.len() < self.config.extraction_target {
            match self.spawn(opt)? {
                Some(individu) => {
                    self.population.push(individu);
                    added += 1;
                }
                None => break,
            }
        }
        Ok(added)
    }

    /// Internal local search on a deep copy of `individual`
    ///
    /// Active members are perturbed around their best point, inactive ones
    /// cold-started. The copy keeps the best feasible point it sees.
    pub fn evolve_population(
        opt: &mut GlobalOptimisation,
        individual: &Individu<B::Model>,
        k_iterations: usize,
    ) -> Result<Individu<B::Model>> {
        let mut child = individual.clone();
        for _ in 0..k_iterations {
            match &child.snapshot {
                Some(best) if child.active => {
                    best.restore(&mut child.model)?;
                    opt.perturb_solution(&mut child.model)?;
                }
                _ => opt.construct_starting_point(&mut child.model)?,
            }

            if !opt.run_local_search(&mut child.model).is_feasible() {
                continue;
            }
            opt.save_solution(&child.model)?;
            let objective = child.model.objective();
            if child.objective.map_or(true, |best| objective < best) || !child.active {
                child.snapshot = Some(Snapshot::capture(&child.model)?);
                child.objective = Some(objective);
                child.active = true;
            }
        }
        if let Some(best) = &child.snapshot {
            best.restore(&mut child.model)?;
        }
        Ok(child)
    }

    /// Evolve every member; a child replaces its parent when it is active
    /// and the parent is inactive or worse. Returns the replacement count.
    pub fn update_population(&mut self, opt: &mut GlobalOptimisation) -> Result<usize> {
        let mut replaced = 0;
        for idx in 0..self.population.len() {
            let mut child =
                Self::evolve_population(opt, &self.population[idx], self.config.k_iterations)?;
            if child.is_better_than(&self.population[idx]) {
                child.age = 0;
                self.track_best(&child);
                self.population[idx] = child;
                replaced += 1;
            }
        }
        Ok(replaced)
    }

    /// Age- and quality-based culling; returns how many members were dropped
    pub fn check_population_quality(&mut self, beta_one: u32, beta_two: usize) -> usize {
        let before = self.population.len();

        self.population.retain(|i| i.active && i.objective.is_some());
        for individu in &mut self.population {
            individu.age += 1;
        }
        self.population.retain(|i| i.age < beta_one);

        if beta_two > 0 && self.generation % beta_two == 0 {
            let mut cohorts: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
            for individu in &self.population {
                let entry = cohorts.entry(individu.age).or_insert((0.0, 0));
                entry.0 += individu.objective.unwrap_or(f64::INFINITY);
                entry.1 += 1;
            }
            self.population.retain(|i| {
                let (sum, count) = cohorts[&i.age];
                i.objective.unwrap_or(f64::INFINITY) < sum / count as f64
            });

            if !self.population.is_empty() {
                let avg = self
                    .population
                    .iter()
                    .map(|i| i.objective.unwrap_or(f64::INFINITY))
                    .sum::<f64>()
                    / self.population.len() as f64;
                self.population
                    .retain(|i| i.objective.unwrap_or(f64::INFINITY) < avg);
            }
        }

        before - self.population.len()
    }

    /// Evolve until the prototype list runs out; true if any feasible member was seen
    pub fn run(&mut self, opt: &mut GlobalOptimisation) -> Result<bool> {
        self.replenish(opt)?;

        while !self.population.is_empty() && self.generation < self.config.max_generations {
            if opt.stop_requested() {
                log::info!("Stop requested after {} generations", self.generation);
                break;
            }
            self.generation += 1;
            let replaced = self.update_population(opt)?;
            let culled = self.check_population_quality(self.config.beta_one, self.config.beta_two);

            let objectives: Vec<f64> =
                self.population.iter().filter_map(|i| i.objective).collect();
            let stats = PopulationStats {
                generation: self.generation,
                population: self.population.len(),
                active: self.population.iter().filter(|i| i.active).count(),
                avg_objective: (!objectives.is_empty())
                    .then(|| objectives.iter().sum::<f64>() / objectives.len() as f64),
                replaced,
                culled,
                prototypes_used: self.next_prototype,
                best_objective: self.best.as_ref().and_then(|b| b.objective),
            };
            log::info!(
                "Generation {}: population {} replaced {} culled {} prototypes {}/{}",
                stats.generation,
                stats.population,
                stats.replaced,
                stats.culled,
                stats.prototypes_used,
                self.prototypes.len()
            );
            self.history.push(stats);

            if self.population.len() < self.config.extraction_target {
                if self.is_exhausted() {
                    break;
                }
                self.replenish(opt)?;
            }
        }

        Ok(self.best.is_some())
    }

    fn track_best(&mut self, individu: &Individu<B::Model>) {
        let better = match &self.best {
            Some(best) => individu.is_better_than(best),
            None => individu.active && individu.objective.is_some(),
        };
        if better {
            self.best = Some(individu.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SearchConfig;
    use crate::testing::{Fallback, Scripted, ScriptedBuilder, ScriptedModel};

    fn builder(script: &[Scripted], fallback: Fallback) -> ScriptedBuilder {
        ScriptedBuilder {
            script: script.to_vec(),
            fallback,
        }
    }

    fn member(active: bool, age: u32, objective: Option<f64>) -> Individu<ScriptedModel> {
        Individu {
            model: ScriptedModel::simplex3(),
            fixings: BTreeMap::new(),
            family_id: 0,
            label: String::new(),
            active,
            age,
            snapshot: None,
            objective,
        }
    }

    fn orchestrator() -> GlobalOptimisation {
        GlobalOptimisation::new(SearchConfig::default())
    }

    // =========================================================================
    // Spawning
    // =========================================================================

    #[test]
    fn test_spawn_applies_fixings_and_evaluates() {
        let prototypes = vec![Prototype::new("two-stage", 2).with_fixing("split[0]", 0.6)];
        let mut pop = PrototypePopulation::new(
            builder(&[Scripted::Feasible(4.0)], Fallback::Infeasible),
            prototypes,
            PopulationConfig::default(),
        )
        .unwrap();
        let mut opt = orchestrator();

        let individu = pop.spawn(&mut opt).unwrap().unwrap();
        assert!(individu.active);
        assert_eq!(individu.objective, Some(4.0));
        assert!(individu.model.is_fixed("split[0]"));
        assert_eq!(individu.model.value("split[0]"), Some(0.6));
        assert!((individu.model.value("split[1]").unwrap() - 0.4).abs() < 1e-12);
        assert!(pop.spawn(&mut opt).unwrap().is_none());
        assert!(pop.is_exhausted());
    }

    #[test]
    fn test_builder_failure_propagates() {
        let mut pop = PrototypePopulation::new(
            builder(&[], Fallback::Quadratic),
            vec![Prototype::new("empty", 0)],
            PopulationConfig::default(),
        )
        .unwrap();
        let mut opt = orchestrator();
        assert!(matches!(pop.spawn(&mut opt), Err(SearchError::Build { .. })));
    }

    #[test]
    fn test_replenish_stops_at_target() {
        let prototypes = (0..6).map(|i| Prototype::new(format!("p{}", i), 2)).collect();
        let config = PopulationConfig {
            extraction_target: 4,
            ..PopulationConfig::default()
        };
        let mut pop =
            PrototypePopulation::new(builder(&[], Fallback::Quadratic), prototypes, config).unwrap();
        let mut opt = orchestrator();
        assert_eq!(pop.replenish(&mut opt).unwrap(), 4);
        assert_eq!(pop.prototypes_used(), 4);
        assert_eq!(pop.replenish(&mut opt).unwrap(), 0);
    }

    // =========================================================================
    // Evolution and replacement
    // =========================================================================

    #[test]
    fn test_better_child_replaces_parent_and_resets_age() {
        let script = [
            Scripted::Feasible(5.0),
            Scripted::Feasible(3.0),
            Scripted::Feasible(9.0),
        ];
        let config = PopulationConfig {
            extraction_target: 1,
            k_iterations: 2,
            ..PopulationConfig::default()
        };
        let mut pop = PrototypePopulation::new(
            builder(&script, Fallback::Infeasible),
            vec![Prototype::new("p", 3)],
            config,
        )
        .unwrap();
        let mut opt = orchestrator();
        pop.replenish(&mut opt).unwrap();
        pop.population[0].age = 2;

        assert_eq!(pop.update_population(&mut opt).unwrap(), 1);
        let member = &pop.population[0];
        assert_eq!(member.objective, Some(3.0));
        assert_eq!(member.age, 0);
        assert_eq!(member.model.value("x"), Some(3.0));
        assert_eq!(pop.best.as_ref().unwrap().objective, Some(3.0));
    }

    #[test]
    fn test_worse_child_keeps_parent() {
        let script = [Scripted::Feasible(2.0), Scripted::Feasible(6.0)];
        let config = PopulationConfig {
            extraction_target: 1,
            k_iterations: 3,
            ..PopulationConfig::default()
        };
        let mut pop = PrototypePopulation::new(
            builder(&script, Fallback::Infeasible),
            vec![Prototype::new("p", 2)],
            config,
        )
        .unwrap();
        let mut opt = orchestrator();
        pop.replenish(&mut opt).unwrap();
        pop.population[0].age = 1;

        assert_eq!(pop.update_population(&mut opt).unwrap(), 0);
        assert_eq!(pop.population[0].objective, Some(2.0));
        assert_eq!(pop.population[0].age, 1);
    }

    #[test]
    fn test_inactive_member_is_cold_started() {
        let config = PopulationConfig {
            extraction_target: 1,
            k_iterations: 2,
            ..PopulationConfig::default()
        };
        let mut pop = PrototypePopulation::new(
            builder(&[], Fallback::Quadratic),
            vec![Prototype::new("p", 2)],
            config,
        )
        .unwrap();
        let mut opt = orchestrator();
        let parent = member(false, 0, None);
        let child = PrototypePopulation::<ScriptedBuilder>::evolve_population(&mut opt, &parent, 2)
            .unwrap();
        assert!(child.active);
        assert!(child.objective.is_some());
        assert!(!parent.active);
        pop.population.push(parent);
        assert_eq!(pop.update_population(&mut opt).unwrap(), 1);
    }

    // =========================================================================
    // Quality control
    // =========================================================================

    fn quality_population(generation: usize) -> PrototypePopulation<ScriptedBuilder> {
        let mut pop = PrototypePopulation::new(
            builder(&[], Fallback::Quadratic),
            Vec::new(),
            PopulationConfig::default(),
        )
        .unwrap();
        pop.generation = generation;
        pop.population = vec![
            member(true, 0, Some(1.0)),
            member(true, 0, Some(3.0)),
            member(true, 2, Some(2.0)),
            member(false, 0, None),
            member(true, 1, Some(4.0)),
            member(true, 1, Some(2.0)),
        ];
        pop
    }

    #[test]
    fn test_quality_check_age_only() {
        let mut pop = quality_population(1);
        let culled = pop.check_population_quality(3, 2);
        assert_eq!(culled, 2);
        let objectives: Vec<f64> = pop.population.iter().filter_map(|i| i.objective).collect();
        assert_eq!(objectives, vec![1.0, 3.0, 4.0, 2.0]);
        assert!(pop.population.iter().all(|i| i.age >= 1));
    }

    #[test]
    fn test_quality_check_cohort_and_population_averages() {
        let mut pop = quality_population(2);
        let culled = pop.check_population_quality(3, 2);
        assert_eq!(culled, 5);
        assert_eq!(pop.population.len(), 1);
        assert_eq!(pop.population[0].objective, Some(1.0));
    }

    // =========================================================================
    // Full run
    // =========================================================================

    #[test]
    fn test_run_consumes_all_prototypes() {
        let prototypes = vec![
            Prototype::new("a", 2),
            Prototype::new("b", 3),
            Prototype::new("c", 4),
            Prototype::new("d", 2).with_fixing("split[0]", 0.5),
        ];
        let config = PopulationConfig {
            extraction_target: 2,
            k_iterations: 2,
            beta_one: 2,
            beta_two: 1,
            max_generations: 50,
        };
        let mut pop =
            PrototypePopulation::new(builder(&[], Fallback::Quadratic), prototypes, config).unwrap();
        let mut opt = orchestrator();

        assert!(pop.run(&mut opt).unwrap());
        assert!(pop.is_exhausted());
        assert!(pop.generation <= 50);
        let best = pop.best.as_ref().unwrap();
        let overall = pop
            .history
            .iter()
            .filter_map(|s| s.best_objective)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(best.objective, Some(overall));
        assert!(opt.state.feasible_found);
    }

    #[test]
    fn test_zero_target_rejected() {
        let config = PopulationConfig {
            extraction_target: 0,
            ..PopulationConfig::default()
        };
        assert!(PrototypePopulation::new(builder(&[], Fallback::Quadratic), Vec::new(), config).is_err());
    }
}
