//! Membrane Process Search - CLI
//!
//! This binary:
//! 1. Loads `search.toml` (or defaults) and applies CLI overrides
//! 2. Opens the three audit logs in the output directory
//! 3. Runs the selected algorithm on the analytical membrane cascade
//! 4. Prints the run summary and exports the best point as JSON

mod config;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;

use membrane_search::logs::SearchLogs;
use membrane_search::surrogate::CascadeBuilder;
use membrane_search::{run_algorithm, Algorithm, GlobalOptimisation, RunOutcome};

use config::{Args, Config};

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config);
    config.apply_args(&args);

    let algorithm = match config.algorithm() {
        Ok(algorithm) => algorithm,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    print_banner(&config, &algorithm);

    let output_dir = Path::new(&config.paths.output_dir);
    let logs = match SearchLogs::open(output_dir) {
        Ok(logs) => {
            println!("Audit logs in {}", output_dir.display());
            logs
        }
        Err(e) => {
            eprintln!(
                "Warning: Failed to open logs in {}: {}, logging disabled",
                output_dir.display(),
                e
            );
            SearchLogs::disabled()
        }
    };
    println!();

    let mut opt = GlobalOptimisation::with_logs(config.search.clone(), logs);

    // Set up Ctrl+C handler
    let interrupt_flag = Arc::new(AtomicBool::new(false));
    setup_interrupt_handler(interrupt_flag.clone());
    opt.set_stop_flag(interrupt_flag);

    let builder = CascadeBuilder::new(config.surrogate.clone());
    let outcome = match run_algorithm(&algorithm, builder, &config.prototypes, &mut opt) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Search failed: {}", e);
            std::process::exit(1);
        }
    };

    print_outcome(&outcome, &opt, args.verbose);

    match outcome.save_best(output_dir) {
        Ok(Some(path)) => println!("Best point saved to {}", path.display()),
        Ok(None) => println!("No feasible point found, nothing saved"),
        Err(e) => eprintln!("Warning: Failed to save best point: {}", e),
    }
}

fn print_banner(config: &Config, algorithm: &Algorithm) {
    println!("═══════════════════════════════════════════════════════════════");
    println!("  MEMBRANE PROCESS SEARCH - {}", algorithm.name());
    println!(
        "  Seeds: init={} perturb={}  tol={:.1e}",
        config.search.init_seed, config.search.perturb_seed, config.search.tol
    );
    println!(
        "  Prototypes: {}",
        config
            .prototypes
            .iter()
            .map(|p| format!("{} ({} stages)", p.label, p.stages))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("═══════════════════════════════════════════════════════════════");
    println!();
}

fn print_outcome(outcome: &RunOutcome, opt: &GlobalOptimisation, verbose: bool) {
    println!();
    println!("═══════════════════════════════════════════════════════════════");
    println!("  {}", outcome.summary());
    println!("  {}", opt.state.summary());
    if let Some(label) = &outcome.best_label {
        println!("  Best prototype: {}", label);
    }
    println!("═══════════════════════════════════════════════════════════════");

    if verbose {
        println!();
        println!("Stationary points (objective x hits):");
        for point in &opt.state.stationary_points {
            println!("  {:>16.6e} x{}", point.objective, point.hits);
        }
        if let Some(best) = &outcome.best_snapshot {
            println!();
            println!("Best point:");
            for (name, value) in best.iter() {
                println!("  {:<28} {:.6e}", name, value);
            }
        }
    }
    println!();
}

fn setup_interrupt_handler(interrupt_flag: Arc<AtomicBool>) {
    let interrupt_count = Arc::new(AtomicUsize::new(0));
    let ic = interrupt_count.clone();
    let if_clone = interrupt_flag.clone();

    ctrlc::set_handler(move || {
        let count = ic.fetch_add(1, Ordering::SeqCst);
        if_clone.store(true, Ordering::SeqCst);
        if count == 0 {
            eprintln!("\nInterrupt received, stopping after the current iteration...");
        } else {
            eprintln!("\nForce quit.");
            std::process::exit(1);
        }
    })
    .expect("Error setting Ctrl-C handler");
}
