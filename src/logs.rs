//! Append-only plain-text audit logs
//!
//! Three files per run: every attempted starting point (`trials.log`), every
//! accepted feasible local solve (`stationary_points.log`) and every strict
//! improvement of the putative best (`best_points.log`).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::snapshot::Snapshot;

pub const TRIAL_LOG: &str = "trials.log";
pub const STATIONARY_LOG: &str = "stationary_points.log";
pub const BEST_LOG: &str = "best_points.log";

type Sink = BufWriter<Box<dyn Write + Send>>;

pub struct SearchLogs {
    trials: Sink,
    stationary: Sink,
    best: Sink,
}

impl SearchLogs {
    /// Open (append) the three logs inside `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let open = |name: &str| -> io::Result<Sink> {
            let file: File = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?;
            Ok(BufWriter::new(Box::new(file) as Box<dyn Write + Send>))
        };
        Ok(Self {
            trials: open(TRIAL_LOG)?,
            stationary: open(STATIONARY_LOG)?,
            best: open(BEST_LOG)?,
        })
    }

    /// Discard all records
    pub fn disabled() -> Self {
        let sink = || BufWriter::new(Box::new(io::sink()) as Box<dyn Write + Send>);
        Self {
            trials: sink(),
            stationary: sink(),
            best: sink(),
        }
    }

    pub fn trial(&mut self, trial: u64, label: &str, feasible: bool, objective: Option<f64>) -> Result<()> {
        let outcome = match objective {
            Some(obj) if feasible => format!("feasible objective={:.10e}", obj),
            _ => "infeasible".to_string(),
        };
        write_record(&mut self.trials, &format!("trial={} kind={} {}", trial, label, outcome))
    }

    pub fn stationary_point(
        &mut self,
        index: u64,
        objective: f64,
        revisit: bool,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let tag = if revisit { "revisit" } else { "new" };
        write_record(
            &mut self.stationary,
            &format!("point={} {} objective={:.10e} | {}", index, tag, objective, snapshot),
        )
    }

    pub fn best_point(&mut self, local_search: u64, objective: f64, snapshot: &Snapshot) -> Result<()> {
        write_record(
            &mut self.best,
            &format!("local_search={} objective={:.10e} | {}", local_search, objective, snapshot),
        )
    }

    pub fn flush(&mut self) -> Result<()> {
        self.trials.flush()?;
        self.stationary.flush()?;
        self.best.flush()?;
        Ok(())
    }
}

fn write_record(sink: &mut Sink, line: &str) -> Result<()> {
    writeln!(sink, "{} {}", chrono::Utc::now().to_rfc3339(), line)?;
    sink.flush()?;
    Ok(())
}

impl Drop for SearchLogs {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("Failed to flush search logs: {}", e);
        }
    }
}
