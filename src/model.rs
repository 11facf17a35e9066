//! Model boundary
//!
//! The search layer never looks inside the NLP model. Everything it needs is
//! expressed through the [`Model`] capability trait: named scalar variables
//! with bounds and a fixed flag, a structural description of variable
//! families, a local `solve()` and the objective of the last feasible solve.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of a local nonlinear solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Feasible,
    Infeasible,
}

impl SolveStatus {
    pub fn is_feasible(self) -> bool {
        self == SolveStatus::Feasible
    }
}

/// Outcome of the optional reduced-model presolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresolveOutcome {
    /// The model has no reduced form
    Unsupported,
    /// The reduced model solved and seeded the full model
    Solved,
    /// The reduced model was attempted and failed
    Failed,
}

/// How the members of a family relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FamilyKind {
    /// Independent scalars drawn within their own bounds
    Bounded,
    /// Members must sum to `target`
    Simplex { target: f64 },
}

/// One member of a variable family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub name: String,
    /// Upper bound is additionally capped by this (earlier drawn) variable
    pub capped_by: Option<String>,
}

impl FamilyMember {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capped_by: None,
        }
    }

    pub fn capped(name: impl Into<String>, cap: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capped_by: Some(cap.into()),
        }
    }
}

/// A group of variables sharing one noise budget and one structural rule
///
/// Families are reported by the model in dependency order: a member capped
/// by another variable always appears after the family holding the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableFamily {
    pub name: String,
    pub kind: FamilyKind,
    pub members: Vec<FamilyMember>,
}

impl VariableFamily {
    pub fn bounded(name: impl Into<String>, members: Vec<FamilyMember>) -> Self {
        Self {
            name: name.into(),
            kind: FamilyKind::Bounded,
            members,
        }
    }

    pub fn simplex(name: impl Into<String>, target: f64, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: FamilyKind::Simplex { target },
            members: members.into_iter().map(FamilyMember::new).collect(),
        }
    }

    pub fn is_simplex(&self) -> bool {
        matches!(self.kind, FamilyKind::Simplex { .. })
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }
}

/// An ordered chain of cell-level variables (e.g. a concentration profile
/// along a membrane module). After a reduced-model presolve only the two end
/// cells carry meaningful values; the interior is interpolated.
#[derive(Debug, Clone, PartialEq)]
pub struct CellProfile {
    pub cells: Vec<String>,
}

/// Mutable optimisation-model instance
pub trait Model {
    /// Every scalar variable, including indexed instances, in a stable order
    fn all_variables(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool {
        self.value(name).is_some()
    }

    fn value(&self, name: &str) -> Option<f64>;

    fn set_value(&mut self, name: &str, value: f64) -> Result<()>;

    fn is_fixed(&self, name: &str) -> bool;

    /// Set the value and hold it constant during solves and perturbation
    fn fix(&mut self, name: &str, value: f64) -> Result<()>;

    fn unfix(&mut self, name: &str) -> Result<()>;

    fn bounds(&self, name: &str) -> (f64, f64);

    fn families(&self) -> Vec<VariableFamily>;

    /// Attempt a local solve. Solved values are loaded only on `Feasible`.
    fn solve(&mut self) -> SolveStatus;

    /// Objective of the last feasible solve
    fn objective(&self) -> f64;

    fn presolve_reduced_model(&mut self) -> PresolveOutcome {
        PresolveOutcome::Unsupported
    }

    fn cell_profiles(&self) -> Vec<CellProfile> {
        Vec::new()
    }

    fn restore_full_model(&mut self) {}
}

/// Structural description of one model instance to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    #[serde(default)]
    pub label: String,
    pub stages: usize,
    /// Variables to hold constant at the given value
    #[serde(default)]
    pub fixings: BTreeMap<String, f64>,
}

impl Prototype {
    pub fn new(label: impl Into<String>, stages: usize) -> Self {
        Self {
            label: label.into(),
            stages,
            fixings: BTreeMap::new(),
        }
    }

    pub fn with_fixing(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fixings.insert(name.into(), value);
        self
    }
}

/// Builds independent model instances from prototypes
pub trait ModelBuilder {
    type Model: Model + Clone;

    fn build(&self, prototype: &Prototype) -> Result<Self::Model>;
}
