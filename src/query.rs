//! The verification query: variables, bounds, equations, constraints, and
//! input/output markings. A query is the unit of work handed to the
//! preprocessor and then to the engine; it exclusively owns its constraint
//! objects and, after preprocessing, its network-level reasoner.

use std::collections::BTreeMap;

use crate::equation::Equation;
use crate::nlr::NetworkLevelReasoner;
use crate::nonlinear::NonlinearConstraint;
use crate::num;
use crate::plc::{PlConstraint, ReluConstraint};

#[derive(Clone, Debug, Default)]
pub struct Query {
    num_variables: usize,
    lower_bounds: BTreeMap<usize, f64>,
    upper_bounds: BTreeMap<usize, f64>,
    equations: Vec<Equation>,
    pl_constraints: Vec<PlConstraint>,
    nl_constraints: Vec<NonlinearConstraint>,
    solution: BTreeMap<usize, f64>,
    pub(crate) variable_to_input_index: BTreeMap<usize, usize>,
    pub(crate) input_index_to_variable: BTreeMap<usize, usize>,
    pub(crate) variable_to_output_index: BTreeMap<usize, usize>,
    pub(crate) output_index_to_variable: BTreeMap<usize, usize>,
    pub(crate) network: Option<NetworkLevelReasoner>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Variables and Bounds ──────────────────────────────────────

    pub fn set_number_of_variables(&mut self, n: usize) {
        self.num_variables = n;
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// Allocate a fresh variable index.
    pub fn new_variable(&mut self) -> usize {
        let v = self.num_variables;
        self.num_variables += 1;
        v
    }

    pub fn set_lower_bound(&mut self, variable: usize, bound: f64) {
        self.lower_bounds.insert(variable, bound);
    }

    pub fn set_upper_bound(&mut self, variable: usize, bound: f64) {
        self.upper_bounds.insert(variable, bound);
    }

    /// Raise the lower bound if strictly tighter; returns whether it moved.
    pub fn tighten_lower_bound(&mut self, variable: usize, bound: f64) -> bool {
        if bound > self.lower_bound(variable) {
            self.lower_bounds.insert(variable, bound);
            true
        } else {
            false
        }
    }

    pub fn tighten_upper_bound(&mut self, variable: usize, bound: f64) -> bool {
        if bound < self.upper_bound(variable) {
            self.upper_bounds.insert(variable, bound);
            true
        } else {
            false
        }
    }

    /// Missing lower bounds read as −∞.
    pub fn lower_bound(&self, variable: usize) -> f64 {
        self.lower_bounds
            .get(&variable)
            .copied()
            .unwrap_or(num::negative_infinity())
    }

    pub fn upper_bound(&self, variable: usize) -> f64 {
        self.upper_bounds
            .get(&variable)
            .copied()
            .unwrap_or(num::infinity())
    }

    pub fn has_lower_bound(&self, variable: usize) -> bool {
        self.lower_bounds.contains_key(&variable)
    }

    pub fn has_upper_bound(&self, variable: usize) -> bool {
        self.upper_bounds.contains_key(&variable)
    }

    pub fn explicit_lower_bounds(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.lower_bounds.iter().map(|(&v, &b)| (v, b))
    }

    pub fn explicit_upper_bounds(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.upper_bounds.iter().map(|(&v, &b)| (v, b))
    }

    pub fn remove_bounds(&mut self, variable: usize) {
        self.lower_bounds.remove(&variable);
        self.upper_bounds.remove(&variable);
    }

    pub fn count_infinite_bounds(&self) -> usize {
        (0..self.num_variables)
            .map(|v| {
                usize::from(!num::is_finite(self.lower_bound(v)))
                    + usize::from(!num::is_finite(self.upper_bound(v)))
            })
            .sum()
    }

    // ─── Equations ─────────────────────────────────────────────────

    pub fn add_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn equations_mut(&mut self) -> &mut Vec<Equation> {
        &mut self.equations
    }

    pub fn num_equations(&self) -> usize {
        self.equations.len()
    }

    pub fn remove_equation(&mut self, equation: &Equation) {
        if let Some(pos) = self.equations.iter().position(|e| e == equation) {
            self.equations.remove(pos);
        }
    }

    // ─── Constraints ───────────────────────────────────────────────

    pub fn add_pl_constraint(&mut self, constraint: PlConstraint) {
        self.pl_constraints.push(constraint);
    }

    pub fn pl_constraints(&self) -> &[PlConstraint] {
        &self.pl_constraints
    }

    pub fn pl_constraints_mut(&mut self) -> &mut Vec<PlConstraint> {
        &mut self.pl_constraints
    }

    pub fn add_nonlinear_constraint(&mut self, constraint: NonlinearConstraint) {
        self.nl_constraints.push(constraint);
    }

    pub fn nonlinear_constraints(&self) -> &[NonlinearConstraint] {
        &self.nl_constraints
    }

    pub fn nonlinear_constraints_mut(&mut self) -> &mut Vec<NonlinearConstraint> {
        &mut self.nl_constraints
    }

    /// Encode `f = min(max(b, floor), ceiling)` with two ReLUs.
    pub fn add_clip_constraint(&mut self, b: usize, f: usize, floor: f64, ceiling: f64) {
        debug_assert!(floor < ceiling);
        let shifted = self.new_variable();
        let clipped_low = self.new_variable();
        let overshoot = self.new_variable();
        let clipped_high = self.new_variable();

        // shifted = b - floor
        let mut eq = Equation::equality();
        eq.add_addend(1.0, b);
        eq.add_addend(-1.0, shifted);
        eq.set_scalar(floor);
        self.add_equation(eq);

        // clipped_low = relu(shifted)
        self.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(shifted, clipped_low)));

        // overshoot = clipped_low - (ceiling - floor)
        let mut eq = Equation::equality();
        eq.add_addend(1.0, clipped_low);
        eq.add_addend(-1.0, overshoot);
        eq.set_scalar(ceiling - floor);
        self.add_equation(eq);

        // clipped_high = relu(overshoot)
        self.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(
            overshoot,
            clipped_high,
        )));

        // f = clipped_low - clipped_high + floor
        let mut eq = Equation::equality();
        eq.add_addend(1.0, clipped_low);
        eq.add_addend(-1.0, clipped_high);
        eq.add_addend(-1.0, f);
        eq.set_scalar(-floor);
        self.add_equation(eq);
    }

    // ─── Input / Output Marking ────────────────────────────────────

    pub fn mark_input_variable(&mut self, variable: usize, input_index: usize) {
        self.variable_to_input_index.insert(variable, input_index);
        self.input_index_to_variable.insert(input_index, variable);
    }

    pub fn mark_output_variable(&mut self, variable: usize, output_index: usize) {
        self.variable_to_output_index.insert(variable, output_index);
        self.output_index_to_variable.insert(output_index, variable);
    }

    pub fn input_variable_by_index(&self, index: usize) -> Option<usize> {
        self.input_index_to_variable.get(&index).copied()
    }

    pub fn output_variable_by_index(&self, index: usize) -> Option<usize> {
        self.output_index_to_variable.get(&index).copied()
    }

    pub fn num_input_variables(&self) -> usize {
        self.input_index_to_variable.len()
    }

    pub fn num_output_variables(&self) -> usize {
        self.output_index_to_variable.len()
    }

    /// Input variables ordered by input index.
    pub fn input_variables(&self) -> Vec<usize> {
        self.input_index_to_variable.values().copied().collect()
    }

    pub fn output_variables(&self) -> Vec<usize> {
        self.output_index_to_variable.values().copied().collect()
    }

    pub fn is_input_or_output(&self, variable: usize) -> bool {
        self.variable_to_input_index.contains_key(&variable)
            || self.variable_to_output_index.contains_key(&variable)
    }

    // ─── Solution ──────────────────────────────────────────────────

    pub fn set_solution_value(&mut self, variable: usize, value: f64) {
        self.solution.insert(variable, value);
    }

    pub fn solution_value(&self, variable: usize) -> f64 {
        self.solution.get(&variable).copied().unwrap_or(0.0)
    }

    pub fn solution(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.solution.iter().map(|(&v, &x)| (v, x))
    }

    // ─── Structural Edits ──────────────────────────────────────────

    /// Merge `v1` into `v2`: every occurrence of `v1` is rewritten to `v2`
    /// and the bounds are intersected onto the survivor.
    pub fn merge_identical_variables(&mut self, v1: usize, v2: usize) {
        for eq in &mut self.equations {
            eq.update_index(v1, v2);
        }
        for c in &mut self.pl_constraints {
            c.update_index(v1, v2);
        }
        for c in &mut self.nl_constraints {
            c.update_index(v1, v2);
        }
        if self.has_lower_bound(v1) {
            let b = self.lower_bound(v1);
            self.tighten_lower_bound(v2, b);
        }
        if self.has_upper_bound(v1) {
            let b = self.upper_bound(v1);
            self.tighten_upper_bound(v2, b);
        }
        self.remove_bounds(v1);
        if let Some(idx) = self.variable_to_input_index.remove(&v1) {
            self.mark_input_variable(v2, idx);
        }
        if let Some(idx) = self.variable_to_output_index.remove(&v1) {
            self.mark_output_variable(v2, idx);
        }
    }

    /// Rewrite the input/output maps after renumbering and merging.
    pub fn adjust_input_output_mapping(
        &mut self,
        old_to_new: &BTreeMap<usize, usize>,
        merged: &BTreeMap<usize, usize>,
    ) {
        let resolve = |mut v: usize| -> usize {
            while let Some(&m) = merged.get(&v) {
                v = m;
            }
            old_to_new.get(&v).copied().unwrap_or(v)
        };
        let inputs: Vec<(usize, usize)> = self
            .input_index_to_variable
            .iter()
            .map(|(&i, &v)| (i, resolve(v)))
            .collect();
        let outputs: Vec<(usize, usize)> = self
            .output_index_to_variable
            .iter()
            .map(|(&i, &v)| (i, resolve(v)))
            .collect();
        self.variable_to_input_index.clear();
        self.input_index_to_variable.clear();
        self.variable_to_output_index.clear();
        self.output_index_to_variable.clear();
        for (i, v) in inputs {
            self.mark_input_variable(v, i);
        }
        for (i, v) in outputs {
            self.mark_output_variable(v, i);
        }
    }

    // ─── Network-Level Reasoner ────────────────────────────────────

    pub fn network(&self) -> Option<&NetworkLevelReasoner> {
        self.network.as_ref()
    }

    pub fn network_mut(&mut self) -> Option<&mut NetworkLevelReasoner> {
        self.network.as_mut()
    }

    pub fn set_network(&mut self, network: NetworkLevelReasoner) {
        self.network = Some(network);
    }

    /// Try to recognise the network topology behind the flat equation and
    /// constraint lists. Returns whether a reasoner covering every variable
    /// was built; on partial success the unmatched equations stay in place
    /// and no reasoner is installed.
    pub fn construct_network_level_reasoner(&mut self) -> bool {
        crate::preprocess::construct_network(self)
    }
}
