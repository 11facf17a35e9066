//! Scripted in-memory model for unit tests

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Result, SearchError};
use crate::model::{
    FamilyMember, Model, ModelBuilder, Prototype, SolveStatus, VariableFamily,
};

/// Queued outcome for the next `solve()` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Scripted {
    Infeasible,
    /// Feasible with this objective; `x` is set to the objective so every
    /// scripted optimum has a distinguishable snapshot
    Feasible(f64),
}

/// What `solve()` does once the script is exhausted
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Fallback {
    Infeasible,
    /// Feasible, values unchanged, objective = (x - 1)^2
    Quadratic,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedModel {
    values: BTreeMap<String, f64>,
    bounds: BTreeMap<String, (f64, f64)>,
    fixed: BTreeSet<String>,
    families: Vec<VariableFamily>,
    script: VecDeque<Scripted>,
    fallback: Fallback,
    objective: f64,
    pub solves: usize,
}

impl ScriptedModel {
    /// `x` in [-5, 5] plus an `n`-member split family summing to 1
    pub fn with_splits(n: usize) -> Self {
        let mut values = BTreeMap::new();
        let mut bounds = BTreeMap::new();
        values.insert("x".to_string(), 0.0);
        bounds.insert("x".to_string(), (-5.0, 5.0));
        let splits: Vec<String> = (0..n).map(|i| format!("split[{}]", i)).collect();
        for s in &splits {
            values.insert(s.clone(), 1.0 / n as f64);
            bounds.insert(s.clone(), (0.0, 1.0));
        }
        let families = vec![
            VariableFamily::bounded("x", vec![FamilyMember::new("x")]),
            VariableFamily::simplex("split", 1.0, splits),
        ];
        Self {
            values,
            bounds,
            fixed: BTreeSet::new(),
            families,
            script: VecDeque::new(),
            fallback: Fallback::Quadratic,
            objective: f64::NAN,
            solves: 0,
        }
    }

    pub fn simplex3() -> Self {
        Self::with_splits(3)
    }

    pub fn scripted(mut self, outcomes: &[Scripted]) -> Self {
        self.script.extend(outcomes.iter().copied());
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn add_variable(&mut self, name: &str, value: f64, bounds: (f64, f64)) {
        self.values.insert(name.to_string(), value);
        self.bounds.insert(name.to_string(), bounds);
    }

    pub fn set_bounds(&mut self, name: &str, bounds: (f64, f64)) {
        self.bounds.insert(name.to_string(), bounds);
    }

    pub fn push_family(&mut self, family: VariableFamily) {
        self.families.push(family);
    }
}

impl Model for ScriptedModel {
    fn all_variables(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        match self.values.get_mut(name) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => Err(SearchError::unknown_variable(name)),
        }
    }

    fn is_fixed(&self, name: &str) -> bool {
        self.fixed.contains(name)
    }

    fn fix(&mut self, name: &str, value: f64) -> Result<()> {
        self.set_value(name, value)?;
        self.fixed.insert(name.to_string());
        Ok(())
    }

    fn unfix(&mut self, name: &str) -> Result<()> {
        if !self.values.contains_key(name) {
            return Err(SearchError::unknown_variable(name));
        }
        self.fixed.remove(name);
        Ok(())
    }

    fn bounds(&self, name: &str) -> (f64, f64) {
        self.bounds
            .get(name)
            .copied()
            .unwrap_or((f64::NEG_INFINITY, f64::INFINITY))
    }

    fn families(&self) -> Vec<VariableFamily> {
        self.families.clone()
    }

    fn solve(&mut self) -> SolveStatus {
        self.solves += 1;
        match self.script.pop_front() {
            Some(Scripted::Feasible(obj)) => {
                if !self.fixed.contains("x") {
                    self.values.insert("x".to_string(), obj);
                }
                self.objective = obj;
                SolveStatus::Feasible
            }
            Some(Scripted::Infeasible) => SolveStatus::Infeasible,
            None => match self.fallback {
                Fallback::Infeasible => SolveStatus::Infeasible,
                Fallback::Quadratic => {
                    let x = self.values["x"];
                    self.objective = (x - 1.0).powi(2);
                    SolveStatus::Feasible
                }
            },
        }
    }

    fn objective(&self) -> f64 {
        self.objective
    }
}

/// Builds one scripted model per prototype; `stages` sets the split count
pub(crate) struct ScriptedBuilder {
    pub script: Vec<Scripted>,
    pub fallback: Fallback,
}

impl ModelBuilder for ScriptedBuilder {
    type Model = ScriptedModel;

    fn build(&self, prototype: &Prototype) -> Result<ScriptedModel> {
        if prototype.stages == 0 {
            return Err(SearchError::Build {
                prototype: prototype.label.clone(),
                reason: "at least one stage required".to_string(),
            });
        }
        Ok(ScriptedModel::with_splits(prototype.stages)
            .scripted(&self.script)
            .fallback(self.fallback))
    }
}
