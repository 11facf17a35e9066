//! End-to-end searches on the analytical membrane cascade

use membrane_search::evolution::EvolutionConfig;
use membrane_search::logs::{SearchLogs, BEST_LOG, STATIONARY_LOG, TRIAL_LOG};
use membrane_search::population::PopulationConfig;
use membrane_search::surrogate::{CascadeBuilder, MembraneCascade};
use membrane_search::{
    run_algorithm, Algorithm, GlobalOptimisation, Model, ModelBuilder, Prototype, RunOutcome,
    SearchConfig, Snapshot,
};

fn run(algorithm: Algorithm, prototypes: &[Prototype], config: SearchConfig) -> RunOutcome {
    let mut opt = GlobalOptimisation::new(config);
    run_algorithm(&algorithm, CascadeBuilder::default(), prototypes, &mut opt).unwrap()
}

/// Load `best` into a fresh model of the given width
fn reload(stages: usize, best: &Snapshot) -> MembraneCascade {
    let mut model = CascadeBuilder::default()
        .build(&Prototype::new("check", stages))
        .unwrap();
    best.restore(&mut model).unwrap();
    model
}

fn assert_structurally_valid(model: &MembraneCascade) {
    let split: f64 = (0..model.stages())
        .map(|s| model.value(&format!("feed_split[{}]", s)).unwrap())
        .sum();
    assert!((split - 1.0).abs() < 1e-9, "feed split sums to {}", split);

    let feed = model.value("feed_pressure").unwrap();
    for s in 0..model.stages() {
        let permeate = model.value(&format!("permeate_pressure[{}]", s)).unwrap();
        assert!(permeate <= feed + 1e-12);
    }
    assert!(model.recovery() >= model.params().target_recovery - 1e-9);
}

// =============================================================================
// Single-model algorithms
// =============================================================================

#[test]
fn test_multistart_best_is_consistent() {
    let outcome = run(
        Algorithm::Multistart { n: 5 },
        &[Prototype::new("two-stage", 2)],
        SearchConfig::default(),
    );
    assert!(outcome.feasible);
    assert_eq!(outcome.counters.trials, 5);

    let best = outcome.best_snapshot.as_ref().unwrap();
    let model = reload(2, best);
    assert_structurally_valid(&model);
    assert!((model.cost() - outcome.best_objective.unwrap()).abs() < 1e-9);
}

#[test]
fn test_same_seeds_same_result() {
    let algorithm = Algorithm::Mbh {
        max_trials_start: 10,
        max_no_improve: 5,
    };
    let prototypes = [Prototype::new("three-stage", 3)];
    let a = run(algorithm.clone(), &prototypes, SearchConfig::default());
    let b = run(algorithm, &prototypes, SearchConfig::default());

    assert_eq!(a.best_objective, b.best_objective);
    assert_eq!(a.best_snapshot, b.best_snapshot);
    assert_eq!(a.counters, b.counters);
}

#[test]
fn test_global_never_worse_than_its_first_start() {
    let prototypes = [Prototype::new("two-stage", 2)];
    let first = run(
        Algorithm::Multistart { n: 1 },
        &prototypes,
        SearchConfig::default(),
    );
    let global = run(
        Algorithm::Global {
            n_starts: 3,
            max_trials_start: 10,
            max_no_improve: 5,
        },
        &prototypes,
        SearchConfig::default(),
    );

    assert!(global.feasible);
    if let Some(first_objective) = first.best_objective {
        assert!(global.best_objective.unwrap() <= first_objective);
    }
}

#[test]
fn test_presolve_and_fixings() {
    let config = SearchConfig {
        use_presolve: true,
        ..SearchConfig::default()
    };
    let prototype = Prototype::new("pinned", 2).with_fixing("feed_split[0]", 0.3);
    let outcome = run(Algorithm::Multistart { n: 4 }, &[prototype], config);

    assert!(outcome.feasible);
    let best = outcome.best_snapshot.unwrap();
    assert_eq!(best.get("feed_split[0]"), Some(0.3));
    assert_structurally_valid(&reload(2, &best));
}

#[test]
fn test_evolutionary_search() {
    let config = EvolutionConfig {
        pop_size: 4,
        generations: 3,
        clusters: 2,
        ..EvolutionConfig::default()
    };
    let outcome = run(
        Algorithm::Evolutionary(config),
        &[Prototype::new("three-stage", 3)],
        SearchConfig::default(),
    );
    assert!(outcome.feasible);
    let best = outcome.best_snapshot.as_ref().unwrap();
    let model = reload(3, best);
    assert_structurally_valid(&model);
    assert!((model.cost() - outcome.best_objective.unwrap()).abs() < 1e-9);
}

// =============================================================================
// Multi-model population
// =============================================================================

#[test]
fn test_population_over_structural_variants() {
    let prototypes = vec![
        Prototype::new("one", 1),
        Prototype::new("two", 2),
        Prototype::new("three", 3),
        Prototype::new("two-pinned", 2).with_fixing("area[0]", 20.0),
    ];
    let config = PopulationConfig {
        extraction_target: 2,
        k_iterations: 2,
        beta_one: 3,
        beta_two: 2,
        max_generations: 30,
    };
    let outcome = run(
        Algorithm::Population(config),
        &prototypes,
        SearchConfig::default(),
    );

    assert!(outcome.feasible);
    let label = outcome.best_label.clone().unwrap();
    let stages = prototypes.iter().find(|p| p.label == label).unwrap().stages;
    let best = outcome.best_snapshot.as_ref().unwrap();
    assert_eq!(best.len(), 1 + 3 * stages + 5 * stages);
    assert_structurally_valid(&reload(stages, best));
}

// =============================================================================
// Audit logs
// =============================================================================

#[test]
fn test_audit_logs_match_counters() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = {
        let logs = SearchLogs::open(dir.path()).unwrap();
        let mut opt = GlobalOptimisation::with_logs(SearchConfig::default(), logs);
        run_algorithm(
            &Algorithm::Multistart { n: 6 },
            CascadeBuilder::default(),
            &[Prototype::new("two-stage", 2)],
            &mut opt,
        )
        .unwrap()
    };

    let lines = |name: &str| {
        std::fs::read_to_string(dir.path().join(name))
            .unwrap()
            .lines()
            .count() as u64
    };
    assert_eq!(lines(TRIAL_LOG), outcome.counters.trials);
    assert_eq!(lines(STATIONARY_LOG), outcome.counters.feasible);
    assert!(lines(BEST_LOG) >= 1);
    assert!(lines(BEST_LOG) <= outcome.counters.feasible);
}
