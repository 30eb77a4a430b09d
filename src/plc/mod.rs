//! Piecewise-linear constraint library.
//!
//! Each activation kind is a state machine over the bounds of its
//! participating variables:
//!
//! 1. **Watching**: the constraint registers with the bound store (by arena
//!    index) and caches the last seen bound of each participant.
//! 2. **Notification**: `notify_lower_bound` / `notify_upper_bound` refine
//!    the cache only when strictly tighter, may fix the phase, and may emit
//!    derived tightenings for the store.
//! 3. **Splitting**: an unfixed constraint enumerates disjoint case splits;
//!    a fixed one exposes its single valid split.
//! 4. **Costing**: `cost_component(phase)` yields the non-negative affine
//!    cost used by the sum-of-infeasibilities search.

mod absval;
mod disjunction;
mod leaky_relu;
mod max;
mod relu;
mod sign;

pub use absval::AbsConstraint;
pub use disjunction::DisjunctionConstraint;
pub use leaky_relu::LeakyReluConstraint;
pub use max::MaxConstraint;
pub use relu::ReluConstraint;
pub use sign::SignConstraint;

use std::collections::BTreeMap;

use crate::bounds::Tightening;
use crate::equation::{AffineForm, Equation};
use crate::error::{Error, Result};
use crate::num;
use crate::tableau::Assignment;

/// The phase a piecewise-linear constraint is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    NotFixed,
    /// ReLU / LeakyReLU identity piece.
    Active,
    /// ReLU zero piece / LeakyReLU scaled piece.
    Inactive,
    /// Abs / Sign non-negative piece.
    Positive,
    /// Abs / Sign negative piece.
    Negative,
    /// Max: the element with this variable index wins.
    MaxInput(usize),
    /// Max whose every element was eliminated, or a constraint eliminated
    /// outright by preprocessing.
    Eliminated,
    /// One disjunct of a disjunction.
    CaseIndex(usize),
}

/// A `(variable, value)` repair that would locally satisfy a constraint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fix {
    pub variable: usize,
    pub value: f64,
}

/// One branch of a piecewise constraint: bound refinements plus optional
/// defining equations.
#[derive(Clone, Debug, Default)]
pub struct CaseSplit {
    pub bounds: Vec<Tightening>,
    pub equations: Vec<Equation>,
    pub phase: PhaseStatus,
}

impl Default for PhaseStatus {
    fn default() -> Self {
        PhaseStatus::NotFixed
    }
}

impl CaseSplit {
    pub fn new(phase: PhaseStatus) -> Self {
        Self {
            bounds: Vec::new(),
            equations: Vec::new(),
            phase,
        }
    }

    pub fn store_bound_tightening(&mut self, tightening: Tightening) {
        self.bounds.push(tightening);
    }

    pub fn add_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }
}

// ─── Watched Bounds ────────────────────────────────────────────────

/// Cached last-seen bounds of a constraint's participating variables.
/// Missing entries mean the constraint has not heard about the variable.
#[derive(Clone, Debug, Default)]
pub(crate) struct WatchedBounds {
    lower: BTreeMap<usize, f64>,
    upper: BTreeMap<usize, f64>,
}

impl WatchedBounds {
    pub fn lb(&self, variable: usize) -> f64 {
        self.lower
            .get(&variable)
            .copied()
            .unwrap_or(num::negative_infinity())
    }

    pub fn ub(&self, variable: usize) -> f64 {
        self.upper.get(&variable).copied().unwrap_or(num::infinity())
    }

    pub fn has_lb(&self, variable: usize) -> bool {
        self.lower.contains_key(&variable)
    }

    pub fn has_ub(&self, variable: usize) -> bool {
        self.upper.contains_key(&variable)
    }

    /// Record a lower bound if strictly tighter. Returns whether it moved.
    pub fn refine_lb(&mut self, variable: usize, value: f64) -> bool {
        if self.has_lb(variable) && !num::gt(value, self.lb(variable)) {
            return false;
        }
        self.lower.insert(variable, value);
        true
    }

    pub fn refine_ub(&mut self, variable: usize, value: f64) -> bool {
        if self.has_ub(variable) && !num::lt(value, self.ub(variable)) {
            return false;
        }
        self.upper.insert(variable, value);
        true
    }

    pub fn check_feasible(&self, variable: usize) -> Result<()> {
        if self.lb(variable) > self.ub(variable) + num::EPSILON {
            return Err(Error::InfeasibleBounds {
                variable,
                lower: self.lb(variable),
                upper: self.ub(variable),
            });
        }
        Ok(())
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        if let Some(v) = self.lower.remove(&old) {
            self.lower.insert(new, v);
        }
        if let Some(v) = self.upper.remove(&old) {
            self.upper.insert(new, v);
        }
    }

    pub fn forget(&mut self, variable: usize) {
        self.lower.remove(&variable);
        self.upper.remove(&variable);
    }
}

// ─── The Constraint Sum Type ───────────────────────────────────────

/// A piecewise-linear constraint. Behaviour is dispatched by match; each
/// variant owns its participating variables, cached bounds and phase.
#[derive(Clone, Debug)]
pub enum PlConstraint {
    Relu(ReluConstraint),
    Abs(AbsConstraint),
    Sign(SignConstraint),
    LeakyRelu(LeakyReluConstraint),
    Max(MaxConstraint),
    Disjunction(DisjunctionConstraint),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            PlConstraint::Relu($c) => $body,
            PlConstraint::Abs($c) => $body,
            PlConstraint::Sign($c) => $body,
            PlConstraint::LeakyRelu($c) => $body,
            PlConstraint::Max($c) => $body,
            PlConstraint::Disjunction($c) => $body,
        }
    };
}

impl PlConstraint {
    /// Ordered list of variables this constraint participates in.
    pub fn participating_variables(&self) -> Vec<usize> {
        dispatch!(self, c => c.participating_variables())
    }

    pub fn participates(&self, variable: usize) -> bool {
        self.participating_variables().contains(&variable)
    }

    /// A bound-store notification: the lower bound of `variable` is now at
    /// least `value`. Derived tightenings are appended to `out`.
    pub fn notify_lower_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        dispatch!(self, c => c.notify_lower_bound(variable, value, out))
    }

    pub fn notify_upper_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        dispatch!(self, c => c.notify_upper_bound(variable, value, out))
    }

    /// Whether the assignment satisfies the constraint, with ε tolerance.
    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        dispatch!(self, c => c.satisfied(assignment))
    }

    /// Local repairs that would satisfy the constraint.
    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        dispatch!(self, c => c.possible_fixes(assignment))
    }

    /// Disjoint case splits. Must not be called once the phase is fixed.
    pub fn case_splits(&self) -> Vec<CaseSplit> {
        debug_assert!(!self.phase_fixed(), "case splits requested from fixed constraint");
        dispatch!(self, c => c.case_splits())
    }

    pub fn phase_fixed(&self) -> bool {
        dispatch!(self, c => c.phase_fixed())
    }

    /// The single split implied by a fixed phase.
    pub fn valid_case_split(&self) -> CaseSplit {
        dispatch!(self, c => c.valid_case_split())
    }

    pub fn phase_status(&self) -> PhaseStatus {
        dispatch!(self, c => c.phase_status())
    }

    /// Force a phase, as when the engine applies a case split.
    pub fn set_phase_status(&mut self, phase: PhaseStatus) {
        match self {
            PlConstraint::Relu(c) => c.set_phase_status(phase),
            PlConstraint::Abs(c) => c.set_phase_status(phase),
            PlConstraint::Sign(c) => c.set_phase_status(phase),
            PlConstraint::LeakyRelu(c) => c.set_phase_status(phase),
            PlConstraint::Max(c) => c.set_phase_status(phase),
            PlConstraint::Disjunction(_) => {}
        }
    }

    /// All phases this constraint can take, in a stable order.
    pub fn get_all_cases(&self) -> Vec<PhaseStatus> {
        dispatch!(self, c => c.get_all_cases())
    }

    /// Bounds implied by the currently cached bounds.
    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        dispatch!(self, c => c.entailed_tightenings(out))
    }

    /// The phase consistent with a satisfying assignment.
    pub fn phase_of_assignment(&self, assignment: &Assignment) -> PhaseStatus {
        dispatch!(self, c => c.phase_of_assignment(assignment))
    }

    /// Whether the SoI search can build a cost term for this constraint.
    pub fn supports_soi(&self) -> bool {
        !matches!(self, PlConstraint::Disjunction(_))
    }

    /// Non-negative affine cost, exactly zero when the constraint is
    /// satisfied in `phase` under the current assignment.
    pub fn cost_component(&self, phase: PhaseStatus) -> AffineForm {
        dispatch!(self, c => c.cost_component(phase))
    }

    pub fn eliminate(&mut self, variable: usize, fixed_value: f64) {
        dispatch!(self, c => c.eliminate(variable, fixed_value))
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        dispatch!(self, c => c.update_index(old, new))
    }

    /// Obsoleted by variable elimination or permanent fixing.
    pub fn is_obsolete(&self) -> bool {
        dispatch!(self, c => c.is_obsolete())
    }

    pub fn is_active(&self) -> bool {
        dispatch!(self, c => c.is_active())
    }

    pub fn set_active(&mut self, active: bool) {
        dispatch!(self, c => c.set_active(active))
    }

    /// Introduce the auxiliary slack variables / equations this constraint
    /// needs for bound-only case splits and non-negative SoI costs.
    pub fn transform_to_use_aux_variables(&mut self, query: &mut crate::query::Query) {
        match self {
            PlConstraint::Relu(c) => c.transform_to_use_aux_variables(query),
            PlConstraint::Abs(c) => c.transform_to_use_aux_variables(query),
            PlConstraint::LeakyRelu(c) => c.transform_to_use_aux_variables(query),
            PlConstraint::Max(c) => c.transform_to_use_aux_variables(query),
            PlConstraint::Sign(_) | PlConstraint::Disjunction(_) => {}
        }
    }

    /// Auxiliary variables introduced by `transform_to_use_aux_variables`.
    pub fn aux_variables(&self) -> Vec<usize> {
        match self {
            PlConstraint::Relu(c) => c.aux_variables(),
            PlConstraint::Abs(c) => c.aux_variables(),
            PlConstraint::LeakyRelu(c) => c.aux_variables(),
            PlConstraint::Max(c) => c.aux_variables(),
            PlConstraint::Sign(_) | PlConstraint::Disjunction(_) => Vec::new(),
        }
    }

    /// One-line serialization; the leading token identifies the kind.
    pub fn serialize(&self) -> String {
        dispatch!(self, c => c.serialize())
    }

    /// Parse one serialized constraint line.
    pub fn deserialize(line: &str) -> Result<Self> {
        let kind = line.split(',').next().unwrap_or("");
        match kind {
            "Relu" => Ok(PlConstraint::Relu(ReluConstraint::deserialize(line)?)),
            "Abs" => Ok(PlConstraint::Abs(AbsConstraint::deserialize(line)?)),
            "Sign" => Ok(PlConstraint::Sign(SignConstraint::deserialize(line)?)),
            "LeakyRelu" => Ok(PlConstraint::LeakyRelu(LeakyReluConstraint::deserialize(
                line,
            )?)),
            "Max" => Ok(PlConstraint::Max(MaxConstraint::deserialize(line)?)),
            "Disjunction" => Ok(PlConstraint::Disjunction(
                DisjunctionConstraint::deserialize(line)?,
            )),
            other => Err(Error::UnsupportedConstraint(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_rejects_unknown_kind() {
        let err = PlConstraint::deserialize("Clip,1,2").unwrap_err();
        assert!(matches!(err, Error::UnsupportedConstraint(_)));
    }

    #[test]
    fn test_watched_bounds_strictness() {
        let mut cache = WatchedBounds::default();
        assert!(cache.refine_lb(3, 1.0));
        assert!(!cache.refine_lb(3, 1.0));
        assert!(!cache.refine_lb(3, 0.5));
        assert!(cache.refine_lb(3, 2.0));
        assert!(cache.refine_ub(3, 5.0));
        assert!(cache.check_feasible(3).is_ok());
        assert!(cache.refine_ub(3, 1.0));
        assert!(cache.check_feasible(3).is_err());
    }

    #[test]
    fn test_watched_bounds_update_index() {
        let mut cache = WatchedBounds::default();
        cache.refine_lb(0, 1.0);
        cache.refine_ub(0, 2.0);
        cache.update_index(0, 9);
        assert!(!cache.has_lb(0));
        assert_eq!(cache.lb(9), 1.0);
        assert_eq!(cache.ub(9), 2.0);
    }
}
