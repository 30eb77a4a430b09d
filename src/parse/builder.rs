//! The query builder network front-ends target.
//!
//! A parser for a concrete network format (ONNX or otherwise) walks the
//! model, allocates variables, registers equations and per-kind
//! activation constraints here, and finally calls `generate_query`. The
//! builder tracks state a parser may still rewrite mid-walk, notably
//! equations looked up by their output variable.

use std::collections::BTreeMap;

use crate::equation::Equation;
use crate::nonlinear::NonlinearConstraint;
use crate::plc::{
    AbsConstraint, LeakyReluConstraint, MaxConstraint, PlConstraint, ReluConstraint,
    SignConstraint,
};
use crate::query::Query;

#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    num_vars: usize,
    input_vars: Vec<usize>,
    output_vars: Vec<usize>,
    equations: Vec<Equation>,
    pl_constraints: Vec<PlConstraint>,
    nl_constraints: Vec<NonlinearConstraint>,
    lower_bounds: BTreeMap<usize, f64>,
    upper_bounds: BTreeMap<usize, f64>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_variable(&mut self) -> usize {
        let v = self.num_vars;
        self.num_vars += 1;
        v
    }

    pub fn num_variables(&self) -> usize {
        self.num_vars
    }

    pub fn mark_input_variable(&mut self, variable: usize) {
        self.input_vars.push(variable);
    }

    pub fn mark_output_variable(&mut self, variable: usize) {
        self.output_vars.push(variable);
    }

    pub fn add_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }

    pub fn set_lower_bound(&mut self, variable: usize, value: f64) {
        self.lower_bounds.insert(variable, value);
    }

    pub fn set_upper_bound(&mut self, variable: usize, value: f64) {
        self.upper_bounds.insert(variable, value);
    }

    pub fn add_relu(&mut self, b: usize, f: usize) {
        self.pl_constraints
            .push(PlConstraint::Relu(ReluConstraint::new(b, f)));
    }

    pub fn add_leaky_relu(&mut self, b: usize, f: usize, alpha: f64) {
        self.pl_constraints
            .push(PlConstraint::LeakyRelu(LeakyReluConstraint::new(b, f, alpha)));
    }

    pub fn add_abs(&mut self, b: usize, f: usize) {
        self.pl_constraints
            .push(PlConstraint::Abs(AbsConstraint::new(b, f)));
    }

    pub fn add_sign(&mut self, b: usize, f: usize) {
        self.pl_constraints
            .push(PlConstraint::Sign(SignConstraint::new(b, f)));
    }

    pub fn add_max(&mut self, f: usize, elements: Vec<usize>) {
        self.pl_constraints
            .push(PlConstraint::Max(MaxConstraint::new(f, elements)));
    }

    pub fn add_sigmoid(&mut self, b: usize, f: usize) {
        self.nl_constraints.push(NonlinearConstraint::sigmoid(b, f));
    }

    pub fn add_tanh(&mut self, b: usize, f: usize) {
        self.nl_constraints.push(NonlinearConstraint::tanh(b, f));
    }

    /// The equation whose last addend defines `variable`, if any. Parsers
    /// use this to fold constant folding and reshapes into an existing
    /// definition instead of allocating another variable.
    pub fn find_equation_with_output_variable(&mut self, variable: usize) -> Option<&mut Equation> {
        self.equations.iter_mut().find(|eq| {
            eq.addends
                .last()
                .map(|a| a.variable == variable && a.coefficient == -1.0)
                .unwrap_or(false)
        })
    }

    /// Assemble everything into a `Query`.
    pub fn generate_query(self) -> Query {
        let mut query = Query::new();
        query.set_number_of_variables(self.num_vars);
        for (index, variable) in self.input_vars.iter().enumerate() {
            query.mark_input_variable(*variable, index);
        }
        for (index, variable) in self.output_vars.iter().enumerate() {
            query.mark_output_variable(*variable, index);
        }
        for (variable, value) in self.lower_bounds {
            query.set_lower_bound(variable, value);
        }
        for (variable, value) in self.upper_bounds {
            query.set_upper_bound(variable, value);
        }
        for equation in self.equations {
            query.add_equation(equation);
        }
        for constraint in self.pl_constraints {
            query.add_pl_constraint(constraint);
        }
        for constraint in self.nl_constraints {
            query.add_nonlinear_constraint(constraint);
        }
        query
    }
}
