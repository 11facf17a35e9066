//! Perturbation around a feasible reference point
//!
//! Bounded families take a clamped step of up to `epsilon * range` from the
//! center. Simplex families take a signed step of up to `epsilon` per free
//! member, redistributing the budget so the family sum stays on target.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::init::{effective_bounds, simplex_budget, uniform};
use crate::model::{FamilyKind, Model, VariableFamily};
use crate::snapshot::Snapshot;

/// Per-family noise budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epsilon {
    #[serde(default = "default_epsilon")]
    pub default: f64,
    /// Overrides keyed by family name
    #[serde(flatten)]
    pub per_family: BTreeMap<String, f64>,
}

fn default_epsilon() -> f64 {
    0.1
}

impl Default for Epsilon {
    fn default() -> Self {
        let per_family = [("area", 0.1), ("pressure", 0.1), ("feed_split", 0.1)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            default: default_epsilon(),
            per_family,
        }
    }
}

impl Epsilon {
    pub fn uniform(value: f64) -> Self {
        Self {
            default: value,
            per_family: BTreeMap::new(),
        }
    }

    pub fn with(mut self, family: impl Into<String>, value: f64) -> Self {
        self.per_family.insert(family.into(), value);
        self
    }

    pub fn for_family(&self, family: &str) -> f64 {
        self.per_family.get(family).copied().unwrap_or(self.default)
    }
}

/// Write a perturbed copy of `center` into `model`
///
/// Fixed variables are left untouched. Variables outside every family keep
/// the model's current value.
pub fn perturb<M: Model + ?Sized, R: Rng>(
    model: &mut M,
    center: &Snapshot,
    epsilon: &Epsilon,
    rng: &mut R,
) -> Result<()> {
    for family in model.families() {
        let eps = epsilon.for_family(&family.name);
        match family.kind {
            FamilyKind::Bounded => {
                for member in &family.members {
                    if model.is_fixed(&member.name) {
                        continue;
                    }
                    let (lb, ub) = effective_bounds(model, member)?;
                    let c = center_value(model, center, &member.name);
                    let step = uniform(rng, 0.0, eps * (ub - lb));
                    model.set_value(&member.name, (c + step).clamp(lb, ub))?;
                }
            }
            FamilyKind::Simplex { target } => {
                perturb_simplex(model, &family, target, center, eps, rng)?
            }
        }
    }
    Ok(())
}

fn center_value<M: Model + ?Sized>(model: &M, center: &Snapshot, name: &str) -> f64 {
    center
        .get(name)
        .or_else(|| model.value(name))
        .unwrap_or(0.0)
}

fn perturb_simplex<M: Model + ?Sized, R: Rng>(
    model: &mut M,
    family: &VariableFamily,
    target: f64,
    center: &Snapshot,
    eps: f64,
    rng: &mut R,
) -> Result<()> {
    let budget = simplex_budget(model, family, target)?;
    let mut remaining = budget.remaining;
    let head = budget.members.len().saturating_sub(1);

    for i in 0..head {
        let name = &budget.members[i].0;
        let (lo, hi) = budget.window(i, remaining);
        let c = center_value(model, center, name);
        let mut value = c + uniform(rng, -eps, eps);
        if !(lo..=hi).contains(&value) {
            let (a, b) = feasible_slice(c, eps, lo, hi);
            value = uniform(rng, a, b);
        }
        model.set_value(name, value)?;
        remaining -= value;
    }
    if let Some((last, value)) = budget.last_value(remaining) {
        model.set_value(last, value)?;
    }
    Ok(())
}

/// Part of `[c - eps, c + eps]` inside the member's window `[lo, hi]`
///
/// When the two miss each other entirely, the `eps`-wide strip of the
/// window nearest to the center is used instead.
fn feasible_slice(c: f64, eps: f64, lo: f64, hi: f64) -> (f64, f64) {
    let a = (c - eps).max(lo);
    let b = (c + eps).min(hi);
    if a <= b {
        (a, b)
    } else if c > hi {
        ((hi - eps).max(lo), hi)
    } else {
        (lo, (lo + eps).min(hi))
    }
}
