//! Analytical membrane cascade
//!
//! A cheap stand-in for the full NLP superstructure: `n` membrane stages fed
//! in parallel from a compressed feed. Each stage has an area, a permeate
//! pressure (never above the feed pressure) and a share of the feed. The
//! retentate fraction along every module is tracked as a cell profile.
//!
//! Cost is membrane area plus feed compression plus permeate vacuum plus a
//! concave per-stage installation term, which makes the landscape
//! multimodal in the feed split. The single constraint is an overall
//! recovery target. The local solve is a projected gradient descent on the
//! penalised cost, followed by an area scale-up when the penalty left the
//! recovery just short.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::model::{
    CellProfile, FamilyMember, Model, ModelBuilder, PresolveOutcome, Prototype, SolveStatus,
    VariableFamily,
};

const FEED_PRESSURE: &str = "feed_pressure";

/// Flow offset keeping the stage Damköhler number finite for empty stages
const FLOW_EPS: f64 = 0.01;
/// Smoothing of the per-stage installation term near zero flow
const STAGE_EPS: f64 = 1e-3;
const SIMPLEX_TOL: f64 = 1e-9;
/// Area multiplier per repair step
const AREA_GROWTH: f64 = 1.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeParams {
    /// Cells per module profile (at least 2)
    #[serde(default = "default_cells")]
    pub cells: usize,
    #[serde(default = "default_feed_flow")]
    pub feed_flow: f64,
    #[serde(default = "default_permeance")]
    pub permeance: f64,
    #[serde(default = "default_target_recovery")]
    pub target_recovery: f64,
    #[serde(default = "default_area_cost")]
    pub area_cost: f64,
    #[serde(default = "default_compression_cost")]
    pub compression_cost: f64,
    #[serde(default = "default_vacuum_cost")]
    pub vacuum_cost: f64,
    #[serde(default = "default_stage_cost")]
    pub stage_cost: f64,
    /// Quadratic penalty weight on the recovery shortfall
    #[serde(default = "default_penalty")]
    pub penalty: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
}

fn default_cells() -> usize {
    5
}
fn default_feed_flow() -> f64 {
    1.0
}
fn default_permeance() -> f64 {
    0.05
}
fn default_target_recovery() -> f64 {
    0.9
}
fn default_area_cost() -> f64 {
    1.0
}
fn default_compression_cost() -> f64 {
    5.0
}
fn default_vacuum_cost() -> f64 {
    2.0
}
fn default_stage_cost() -> f64 {
    1.5
}
fn default_penalty() -> f64 {
    1e3
}
fn default_max_iter() -> usize {
    500
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            cells: default_cells(),
            feed_flow: default_feed_flow(),
            permeance: default_permeance(),
            target_recovery: default_target_recovery(),
            area_cost: default_area_cost(),
            compression_cost: default_compression_cost(),
            vacuum_cost: default_vacuum_cost(),
            stage_cost: default_stage_cost(),
            penalty: default_penalty(),
            max_iter: default_max_iter(),
        }
    }
}

/// Cost and recovery of one design point
#[derive(Debug, Clone, Copy)]
struct Evaluation {
    cost: f64,
    recovery: f64,
}

#[derive(Debug, Clone)]
pub struct MembraneCascade {
    params: CascadeParams,
    stages: usize,
    names: Vec<String>,
    index: BTreeMap<String, usize>,
    values: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    fixed: Vec<bool>,
    objective: f64,
}

impl MembraneCascade {
    pub fn new(stages: usize, params: CascadeParams) -> Result<Self> {
        if stages == 0 {
            return Err(SearchError::InvalidConfig(
                "membrane cascade needs at least one stage".to_string(),
            ));
        }
        if params.cells < 2 {
            return Err(SearchError::InvalidConfig(
                "membrane profiles need at least two cells".to_string(),
            ));
        }

        let mut names = vec![FEED_PRESSURE.to_string()];
        let mut lower = vec![2.0];
        let mut upper = vec![20.0];
        let mut values = vec![10.0];
        let mut push = |name: String, lb: f64, ub: f64, v: f64| {
            names.push(name);
            lower.push(lb);
            upper.push(ub);
            values.push(v);
        };
        for s in 0..stages {
            push(format!("area[{}]", s), 1.0, 100.0, 10.0);
        }
        for s in 0..stages {
            push(format!("permeate_pressure[{}]", s), 0.2, 20.0, 1.0);
        }
        for s in 0..stages {
            push(format!("feed_split[{}]", s), 0.0, 1.0, 1.0 / stages as f64);
        }
        for s in 0..stages {
            for c in 0..params.cells {
                push(format!("cell_x[{}][{}]", s, c), 0.0, 1.0, 1.0);
            }
        }

        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        let n = names.len();
        Ok(Self {
            params,
            stages,
            names,
            index,
            values,
            lower,
            upper,
            fixed: vec![false; n],
            objective: f64::NAN,
        })
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn params(&self) -> &CascadeParams {
        &self.params
    }

    fn area(&self, s: usize) -> usize {
        1 + s
    }

    fn permeate(&self, s: usize) -> usize {
        1 + self.stages + s
    }

    fn split(&self, s: usize) -> usize {
        1 + 2 * self.stages + s
    }

    fn cell(&self, s: usize, c: usize) -> usize {
        1 + 3 * self.stages + s * self.params.cells + c
    }

    /// Number of design variables; they precede the cell profiles
    fn decision_len(&self) -> usize {
        1 + 3 * self.stages
    }

    /// Exponent of the retentate decay along stage `s`
    fn stage_decay(&self, x: &[f64], s: usize) -> f64 {
        let dp = (x[0] - x[self.permeate(s)]).max(0.0);
        let flow = self.params.feed_flow * x[self.split(s)].max(0.0) + FLOW_EPS;
        self.params.permeance * x[self.area(s)] * dp / flow
    }

    fn evaluate(&self, x: &[f64]) -> Evaluation {
        let p = &self.params;
        let mut cost = p.compression_cost * p.feed_flow * x[0].ln();
        let mut recovery = 0.0;
        for s in 0..self.stages {
            let split = x[self.split(s)];
            let stage_recovery = 1.0 - (-self.stage_decay(x, s)).exp();
            recovery += split * stage_recovery;
            cost += p.area_cost * x[self.area(s)];
            cost += p.vacuum_cost * p.feed_flow * split / x[self.permeate(s)];
            cost += p.stage_cost * (split.max(0.0) + STAGE_EPS).sqrt();
        }
        Evaluation { cost, recovery }
    }

    fn penalised(&self, x: &[f64]) -> f64 {
        let eval = self.evaluate(x);
        let shortfall = (self.params.target_recovery - eval.recovery).max(0.0);
        eval.cost + self.params.penalty * shortfall * shortfall
    }

    /// Overall recovery at the current values
    pub fn recovery(&self) -> f64 {
        self.evaluate(&self.values).recovery
    }

    /// Cost at the current values, whether or not they were solved
    pub fn cost(&self) -> f64 {
        self.evaluate(&self.values).cost
    }

    /// Pull `x` back into bounds, under the feed-pressure cap and onto the
    /// feed-split simplex. False when the fixed splits leave no room.
    fn project(&self, x: &mut [f64]) -> bool {
        for i in 0..self.decision_len() {
            if !self.fixed[i] {
                x[i] = x[i].clamp(self.lower[i], self.upper[i]);
            }
        }
        for s in 0..self.stages {
            let i = self.permeate(s);
            if !self.fixed[i] {
                x[i] = x[i].min(x[0]).max(self.lower[i]);
            }
        }

        let (fixed, free): (Vec<usize>, Vec<usize>) =
            (0..self.stages).map(|s| self.split(s)).partition(|&i| self.fixed[i]);
        let remaining = 1.0 - fixed.iter().map(|&i| x[i]).sum::<f64>();
        if remaining < -SIMPLEX_TOL || (free.is_empty() && remaining.abs() > SIMPLEX_TOL) {
            return false;
        }
        let projected = project_simplex(
            &free.iter().map(|&i| x[i]).collect::<Vec<_>>(),
            remaining.max(0.0),
        );
        for (&i, v) in free.iter().zip(projected) {
            x[i] = v;
        }
        true
    }

    fn free_decisions(&self) -> Vec<usize> {
        (0..self.decision_len()).filter(|&i| !self.fixed[i]).collect()
    }

    /// Projected gradient descent in range-normalised coordinates
    fn descend(&self, x: &mut Vec<f64>) {
        let free = self.free_decisions();
        let mut step = 1.0;
        let mut f = self.penalised(x);

        for _ in 0..self.params.max_iter {
            let grad: Vec<f64> = free
                .iter()
                .map(|&i| {
                    let range = self.upper[i] - self.lower[i];
                    let h = 1e-6 * range;
                    let mut shifted = x.clone();
                    shifted[i] = x[i] + h;
                    let up = self.penalised(&shifted);
                    shifted[i] = x[i] - h;
                    let down = self.penalised(&shifted);
                    (up - down) / 2e-6
                })
                .collect();

            let mut accepted = false;
            while step > 1e-12 {
                let mut trial = x.clone();
                for (&i, g) in free.iter().zip(&grad) {
                    trial[i] -= step * g * (self.upper[i] - self.lower[i]);
                }
                if !self.project(&mut trial) {
                    return;
                }
                let moved: f64 = free
                    .iter()
                    .map(|&i| ((trial[i] - x[i]) / (self.upper[i] - self.lower[i])).powi(2))
                    .sum();
                let f_trial = self.penalised(&trial);
                if f_trial <= f - 1e-4 * moved / step {
                    let converged = moved < 1e-18;
                    *x = trial;
                    f = f_trial;
                    accepted = !converged;
                    break;
                }
                step *= 0.5;
            }
            if !accepted {
                break;
            }
            step = (step * 2.0).min(1.0);
        }
    }

    /// Grow the free areas until the recovery target is met
    fn repair_recovery(&self, x: &mut [f64]) -> bool {
        let free: Vec<usize> = (0..self.stages)
            .map(|s| self.area(s))
            .filter(|&i| !self.fixed[i])
            .collect();
        while self.evaluate(x).recovery < self.params.target_recovery {
            if free.iter().all(|&i| x[i] >= self.upper[i]) {
                return false;
            }
            for &i in &free {
                x[i] = (x[i] * AREA_GROWTH).min(self.upper[i]);
            }
        }
        true
    }

    /// Closed-form retentate profile of every stage
    fn fill_profiles(&self, x: &mut [f64]) {
        let last = (self.params.cells - 1) as f64;
        for s in 0..self.stages {
            let decay = self.stage_decay(x, s);
            for c in 0..self.params.cells {
                let i = self.cell(s, c);
                if !self.fixed[i] {
                    x[i] = (-decay * c as f64 / last).exp();
                }
            }
        }
    }
}

/// Euclidean projection of `v` onto { y >= 0, sum(y) = target }
fn project_simplex(v: &[f64], target: f64) -> Vec<f64> {
    if v.is_empty() {
        return Vec::new();
    }
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut theta = 0.0;
    for (j, u) in sorted.iter().enumerate() {
        cumsum += u;
        let candidate = (cumsum - target) / (j + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    v.iter().map(|x| (x - theta).max(0.0)).collect()
}

impl Model for MembraneCascade {
    fn all_variables(&self) -> Vec<String> {
        self.names.clone()
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn value(&self, name: &str) -> Option<f64> {
        self.index.get(name).map(|&i| self.values[i])
    }

    fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| SearchError::unknown_variable(name))?;
        self.values[i] = value;
        Ok(())
    }

    fn is_fixed(&self, name: &str) -> bool {
        self.index.get(name).map(|&i| self.fixed[i]).unwrap_or(false)
    }

    fn fix(&mut self, name: &str, value: f64) -> Result<()> {
        self.set_value(name, value)?;
        let i = self.index[name];
        self.fixed[i] = true;
        Ok(())
    }

    fn unfix(&mut self, name: &str) -> Result<()> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| SearchError::unknown_variable(name))?;
        self.fixed[i] = false;
        Ok(())
    }

    fn bounds(&self, name: &str) -> (f64, f64) {
        self.index
            .get(name)
            .map(|&i| (self.lower[i], self.upper[i]))
            .unwrap_or((f64::NEG_INFINITY, f64::INFINITY))
    }

    fn families(&self) -> Vec<VariableFamily> {
        let stage_names =
            |prefix: &'static str| (0..self.stages).map(move |s| format!("{}[{}]", prefix, s));

        let mut pressure = vec![FamilyMember::new(FEED_PRESSURE)];
        pressure.extend(
            stage_names("permeate_pressure").map(|n| FamilyMember::capped(n, FEED_PRESSURE)),
        );

        vec![
            VariableFamily::bounded("pressure", pressure),
            VariableFamily::bounded("area", stage_names("area").map(FamilyMember::new).collect()),
            VariableFamily::simplex("feed_split", 1.0, stage_names("feed_split").collect()),
            VariableFamily::bounded(
                "cell",
                (0..self.stages)
                    .flat_map(|s| (0..self.params.cells).map(move |c| (s, c)))
                    .map(|(s, c)| FamilyMember::new(format!("cell_x[{}][{}]", s, c)))
                    .collect(),
            ),
        ]
    }

    fn solve(&mut self) -> SolveStatus {
        let mut x = self.values.clone();
        if !self.project(&mut x) {
            return SolveStatus::Infeasible;
        }
        self.descend(&mut x);
        if !self.repair_recovery(&mut x) {
            return SolveStatus::Infeasible;
        }
        self.fill_profiles(&mut x);

        let eval = self.evaluate(&x);
        if !eval.cost.is_finite() || eval.recovery < self.params.target_recovery - SIMPLEX_TOL {
            return SolveStatus::Infeasible;
        }
        self.values = x;
        self.objective = eval.cost;
        SolveStatus::Feasible
    }

    fn objective(&self) -> f64 {
        self.objective
    }

    /// End cells of every profile from the design variables alone
    fn presolve_reduced_model(&mut self) -> PresolveOutcome {
        let last = self.params.cells - 1;
        for s in 0..self.stages {
            let decay = self.stage_decay(&self.values, s);
            if !decay.is_finite() {
                return PresolveOutcome::Failed;
            }
            for (c, v) in [(0, 1.0), (last, (-decay).exp())] {
                let i = self.cell(s, c);
                if !self.fixed[i] {
                    self.values[i] = v;
                }
            }
        }
        PresolveOutcome::Solved
    }

    fn cell_profiles(&self) -> Vec<CellProfile> {
        (0..self.stages)
            .map(|s| CellProfile {
                cells: (0..self.params.cells)
                    .map(|c| self.names[self.cell(s, c)].clone())
                    .collect(),
            })
            .collect()
    }
}

/// Builds one cascade per prototype, `stages` wide
#[derive(Debug, Clone, Default)]
pub struct CascadeBuilder {
    pub params: CascadeParams,
}

impl CascadeBuilder {
    pub fn new(params: CascadeParams) -> Self {
        Self { params }
    }
}

impl ModelBuilder for CascadeBuilder {
    type Model = MembraneCascade;

    fn build(&self, prototype: &Prototype) -> Result<MembraneCascade> {
        MembraneCascade::new(prototype.stages, self.params.clone()).map_err(|e| {
            SearchError::Build {
                prototype: prototype.label.clone(),
                reason: e.to_string(),
            }
        })
    }
}
