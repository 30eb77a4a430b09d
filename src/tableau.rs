//! The narrow tableau interface the reasoning kernel consumes.
//!
//! The simplex engine itself is an external collaborator: the kernel only
//! ever asks for the current value of a variable, pushes a value, and
//! requests either a feasible assignment or the minimum of a linear cost
//! over the current linear relaxation. `LpTableau` answers those requests
//! by encoding the equations and bounds with good_lp and solving with
//! Clarabel.

use std::collections::BTreeMap;

use good_lp::solvers::clarabel::clarabel;
use good_lp::{
    constraint, variable, variables, Expression, ResolutionError, Solution, SolverModel, Variable,
};
use tracing::debug;

use crate::bounds::BoundStore;
use crate::equation::{AffineForm, Equation, Relation};
use crate::error::{Error, Result};
use crate::num;

// ─── Assignment ────────────────────────────────────────────────────

/// A concrete valuation of the solver variables. Unset variables read 0.
#[derive(Clone, Debug, Default)]
pub struct Assignment {
    values: BTreeMap<usize, f64>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, variable: usize, value: f64) {
        self.values.insert(variable, value);
    }

    pub fn value(&self, variable: usize) -> f64 {
        self.values.get(&variable).copied().unwrap_or(0.0)
    }

    pub fn has(&self, variable: usize) -> bool {
        self.values.contains_key(&variable)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values.iter().map(|(&v, &x)| (v, x))
    }
}

// ─── Tableau Interface ─────────────────────────────────────────────

/// Read/write access to the current variable assignment.
pub trait Tableau {
    fn value(&self, variable: usize) -> f64;
    fn set_value(&mut self, variable: usize, value: f64);
    /// Snapshot of the whole assignment.
    fn assignment(&self) -> Assignment;
}

// ─── LP-Backed Tableau ─────────────────────────────────────────────

/// Tableau backed by an external LP solver. Holds the query's equations
/// plus a stack of equations contributed by applied case splits.
pub struct LpTableau {
    num_variables: usize,
    equations: Vec<Equation>,
    split_equations: Vec<Equation>,
    values: BTreeMap<usize, f64>,
}

impl LpTableau {
    pub fn new(num_variables: usize, equations: Vec<Equation>) -> Self {
        Self {
            num_variables,
            equations,
            split_equations: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn grow(&mut self, num_variables: usize) {
        self.num_variables = self.num_variables.max(num_variables);
    }

    pub fn add_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }

    /// Stack mark for the split-equation journal.
    pub fn split_mark(&self) -> usize {
        self.split_equations.len()
    }

    pub fn push_split_equations(&mut self, equations: &[Equation]) {
        self.split_equations.extend_from_slice(equations);
    }

    pub fn pop_splits_to(&mut self, mark: usize) {
        self.split_equations.truncate(mark);
    }

    fn encode(
        &self,
        store: &BoundStore,
    ) -> (good_lp::ProblemVariables, Vec<Variable>) {
        let mut vars = variables!();
        let mut handles = Vec::with_capacity(self.num_variables);
        for v in 0..self.num_variables {
            let mut spec = variable();
            let lb = store.lb(v);
            let ub = store.ub(v);
            if num::is_finite(lb) {
                spec = spec.min(lb);
            }
            if num::is_finite(ub) {
                spec = spec.max(ub);
            }
            handles.push(vars.add(spec));
        }
        (vars, handles)
    }

    fn equation_expression(equation: &Equation, handles: &[Variable]) -> Expression {
        let mut expr = Expression::from(0.0);
        for addend in &equation.addends {
            expr += addend.coefficient * handles[addend.variable];
        }
        expr
    }

    fn solve_with_objective(
        &mut self,
        objective: &AffineForm,
        store: &BoundStore,
    ) -> Result<Option<f64>> {
        // A fully preprocessed query may have nothing left to solve.
        if self.num_variables == 0 {
            return Ok(Some(objective.constant));
        }
        let (vars, handles) = self.encode(store);

        let mut objective_expr = Expression::from(objective.constant);
        for (v, c) in objective.terms() {
            objective_expr += c * handles[v];
        }

        let mut problem = vars.minimise(objective_expr).using(clarabel);
        for equation in self.equations.iter().chain(self.split_equations.iter()) {
            let expr = Self::equation_expression(equation, &handles);
            let scalar = Expression::from(equation.scalar);
            let c = match equation.relation {
                Relation::Eq => constraint::eq(expr, scalar),
                Relation::Le => constraint::leq(expr, scalar),
                Relation::Ge => constraint::geq(expr, scalar),
            };
            problem = problem.with(c);
        }

        match problem.solve() {
            Ok(solution) => {
                let mut cost = objective.constant;
                for (v, handle) in handles.iter().enumerate() {
                    let value = solution.value(*handle);
                    self.values.insert(v, value);
                    cost += objective.coefficient(v) * value;
                }
                Ok(Some(cost))
            }
            Err(ResolutionError::Infeasible) => Ok(None),
            Err(e) => Err(Error::ExternalSolver(format!("{e:?}"))),
        }
    }

    /// Pivot toward any simplex-feasible assignment. `Ok(false)` means the
    /// current relaxation is infeasible.
    pub fn pivot_to_feasible(&mut self, store: &BoundStore) -> Result<bool> {
        debug!(
            equations = self.equations.len() + self.split_equations.len(),
            "probing LP feasibility"
        );
        Ok(self
            .solve_with_objective(&AffineForm::new(), store)?
            .is_some())
    }

    /// Minimize a linear cost over the relaxation; `None` means infeasible.
    pub fn minimize(&mut self, cost: &AffineForm, store: &BoundStore) -> Result<Option<f64>> {
        self.solve_with_objective(cost, store)
    }
}

impl Tableau for LpTableau {
    fn value(&self, variable: usize) -> f64 {
        self.values.get(&variable).copied().unwrap_or(0.0)
    }

    fn set_value(&mut self, variable: usize, value: f64) {
        self.values.insert(variable, value);
    }

    fn assignment(&self) -> Assignment {
        let mut assignment = Assignment::new();
        for (&v, &x) in &self.values {
            assignment.set(v, x);
        }
        assignment
    }
}

// ─── Test Tableau ──────────────────────────────────────────────────

/// In-memory tableau with scripted values, mirroring the two channels the
/// SoI tests drive: directly set values and "next" pivot results.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub struct MockTableau {
    pub values: BTreeMap<usize, f64>,
    pub next_values: BTreeMap<usize, f64>,
}

#[cfg(test)]
impl MockTableau {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl Tableau for MockTableau {
    fn value(&self, variable: usize) -> f64 {
        self.values
            .get(&variable)
            .or_else(|| self.next_values.get(&variable))
            .copied()
            .unwrap_or(0.0)
    }

    fn set_value(&mut self, variable: usize, value: f64) {
        self.values.insert(variable, value);
    }

    fn assignment(&self) -> Assignment {
        let mut assignment = Assignment::new();
        for v in self.next_values.keys().chain(self.values.keys()) {
            assignment.set(*v, self.value(*v));
        }
        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_defaults_to_zero() {
        let mut a = Assignment::new();
        assert_eq!(a.value(3), 0.0);
        a.set(3, 1.5);
        assert_eq!(a.value(3), 1.5);
        assert!(a.has(3));
        assert!(!a.has(4));
    }

    #[test]
    fn test_mock_tableau_prefers_set_values() {
        let mut t = MockTableau::new();
        t.next_values.insert(0, 2.0);
        assert_eq!(t.value(0), 2.0);
        t.set_value(0, 5.0);
        assert_eq!(t.value(0), 5.0);
    }

    #[test]
    fn test_split_equation_stack() {
        let mut t = LpTableau::new(2, Vec::new());
        let mark = t.split_mark();
        let mut eq = Equation::equality();
        eq.add_addend(1.0, 0);
        t.push_split_equations(&[eq]);
        assert_eq!(t.split_mark(), 1);
        t.pop_splits_to(mark);
        assert_eq!(t.split_mark(), 0);
    }
}
