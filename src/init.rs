//! Randomized initialization of starting points
//!
//! Produces a structurally valid assignment for every free variable:
//! bounds respected, capped members drawn below their cap, simplex
//! families summing exactly to their target. Feasibility of the full
//! nonlinear system is not attempted here.

use rand::Rng;

use crate::error::{Result, SearchError};
use crate::model::{CellProfile, FamilyKind, FamilyMember, Model, PresolveOutcome, VariableFamily};

/// Absolute tolerance on simplex sums
pub const SIMPLEX_TOL: f64 = 1e-9;

/// Draw every free variable of every family, in the model's family order
pub fn randomize<M: Model + ?Sized, R: Rng>(model: &mut M, rng: &mut R) -> Result<()> {
    for family in model.families() {
        match family.kind {
            FamilyKind::Bounded => {
                for member in &family.members {
                    if model.is_fixed(&member.name) {
                        continue;
                    }
                    let (lb, ub) = effective_bounds(model, member)?;
                    let value = uniform(rng, lb, ub);
                    model.set_value(&member.name, value)?;
                }
            }
            FamilyKind::Simplex { target } => fill_simplex(model, &family, target, rng)?,
        }
    }
    Ok(())
}

/// Member bounds, with the upper bound lowered to the current value of its cap
///
/// Free bounded members must have a finite range to be drawn from.
pub(crate) fn effective_bounds<M: Model + ?Sized>(
    model: &M,
    member: &FamilyMember,
) -> Result<(f64, f64)> {
    let (lb, mut ub) = model.bounds(&member.name);
    if let Some(cap) = member.capped_by.as_deref().and_then(|c| model.value(c)) {
        ub = ub.min(cap);
    }
    let ub = ub.max(lb);
    if !(ub - lb).is_finite() {
        return Err(SearchError::InvalidConfig(format!(
            "variable '{}' has unbounded range [{}, {}] and cannot be drawn",
            member.name, lb, ub
        )));
    }
    Ok((lb, ub))
}

/// One draw from U(lb, ub); degenerate ranges still consume a draw
pub(crate) fn uniform<R: Rng>(rng: &mut R, lb: f64, ub: f64) -> f64 {
    if ub > lb {
        rng.gen_range(lb..ub)
    } else {
        let _: f64 = rng.gen();
        lb
    }
}

/// Free members of a simplex family and the budget left for them
pub(crate) struct SimplexBudget {
    /// Name, lower and upper bound of each free member, bounds within `[0, target]`
    pub members: Vec<(String, f64, f64)>,
    pub remaining: f64,
    /// Sums of the lower and upper bounds of the members after each index
    rest: Vec<(f64, f64)>,
}

impl SimplexBudget {
    /// Values member `i` may take while the later members can still absorb
    /// whatever is left of `remaining`
    pub fn window(&self, i: usize, remaining: f64) -> (f64, f64) {
        let (_, lb, ub) = &self.members[i];
        let (rest_lo, rest_hi) = self.rest[i];
        let lo = lb.max(remaining - rest_hi);
        let hi = ub.min(remaining - rest_lo);
        (lo, hi.max(lo))
    }

    /// Remainder for the last free member, clamped into its bounds
    pub fn last_value(&self, remaining: f64) -> Option<(&str, f64)> {
        self.members
            .last()
            .map(|(name, lb, ub)| (name.as_str(), remaining.clamp(*lb, *ub)))
    }
}

/// Free members and the budget left for them after the fixed members
///
/// Fails when the fixed members overshoot the target, or when the free
/// members' bounds cannot add up to what is left.
pub(crate) fn simplex_budget<M: Model + ?Sized>(
    model: &M,
    family: &VariableFamily,
    target: f64,
) -> Result<SimplexBudget> {
    let mut fixed_sum = 0.0;
    let mut members = Vec::new();
    for name in family.member_names() {
        if model.is_fixed(name) {
            fixed_sum += model
                .value(name)
                .ok_or_else(|| SearchError::unknown_variable(name))?;
        } else {
            let (lb, ub) = model.bounds(name);
            let lb = lb.max(0.0);
            members.push((name.to_string(), lb, ub.min(target).max(lb)));
        }
    }

    let remaining = target - fixed_sum;
    let overflow =
        remaining < -SIMPLEX_TOL || (members.is_empty() && remaining.abs() > SIMPLEX_TOL);
    if overflow {
        return Err(SearchError::SimplexOverflow {
            family: family.name.clone(),
            fixed_sum,
            target,
        });
    }
    let remaining = remaining.max(0.0);

    let mut rest = vec![(0.0, 0.0); members.len()];
    let (mut lo, mut hi) = (0.0, 0.0);
    for (i, (_, lb, ub)) in members.iter().enumerate().rev() {
        rest[i] = (lo, hi);
        lo += lb;
        hi += ub;
    }
    if !members.is_empty() && (remaining < lo - SIMPLEX_TOL || remaining > hi + SIMPLEX_TOL) {
        return Err(SearchError::SimplexBounds {
            family: family.name.clone(),
            remaining,
            lower_sum: lo,
            upper_sum: hi,
        });
    }

    Ok(SimplexBudget {
        members,
        remaining,
        rest,
    })
}

fn fill_simplex<M: Model + ?Sized, R: Rng>(
    model: &mut M,
    family: &VariableFamily,
    target: f64,
    rng: &mut R,
) -> Result<()> {
    let budget = simplex_budget(model, family, target)?;
    let mut remaining = budget.remaining;
    let head = budget.members.len().saturating_sub(1);

    for i in 0..head {
        let (lo, hi) = budget.window(i, remaining);
        let value = uniform(rng, lo, hi);
        model.set_value(&budget.members[i].0, value)?;
        remaining -= value;
    }
    if let Some((last, value)) = budget.last_value(remaining) {
        model.set_value(last, value)?;
    }
    Ok(())
}

/// Solve the reduced model and interpolate the cell-level profiles from it
///
/// Returns whether the reduced model seeded the full model. The full model is
/// always reinstated afterwards.
pub fn presolve<M: Model + ?Sized>(model: &mut M) -> Result<bool> {
    let seeded = match model.presolve_reduced_model() {
        PresolveOutcome::Unsupported => return Ok(false),
        PresolveOutcome::Solved => {
            for profile in model.cell_profiles() {
                backfill_profile(model, &profile)?;
            }
            true
        }
        PresolveOutcome::Failed => {
            log::debug!("Reduced model failed to solve, keeping random cell values");
            false
        }
    };
    model.restore_full_model();
    Ok(seeded)
}

/// Linear interpolation of interior cells between the two end cells
fn backfill_profile<M: Model + ?Sized>(model: &mut M, profile: &CellProfile) -> Result<()> {
    let n = profile.cells.len();
    if n < 3 {
        return Ok(());
    }
    let first = model
        .value(&profile.cells[0])
        .ok_or_else(|| SearchError::unknown_variable(&profile.cells[0]))?;
    let last = model
        .value(&profile.cells[n - 1])
        .ok_or_else(|| SearchError::unknown_variable(&profile.cells[n - 1]))?;

    for (i, cell) in profile.cells.iter().enumerate().take(n - 1).skip(1) {
        if model.is_fixed(cell) {
            continue;
        }
        let t = i as f64 / (n - 1) as f64;
        model.set_value(cell, first + (last - first) * t)?;
    }
    Ok(())
}
