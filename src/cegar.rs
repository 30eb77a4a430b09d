//! Incremental linearization: the CEGAR outer loop for transcendental
//! constraints.
//!
//! Loop invariant at the top of a round: the stored query is the
//! abstraction the engine attempted last, and it carries that attempt's
//! counter-example assignment and bounds. Each round asks up to `k`
//! nonlinear constraints to emit linear cuts excluding the
//! counter-example, rebuilds a fresh engine on the refined abstraction,
//! and forwards the shrinking time budget.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::{Engine, ExitCode};
use crate::query::Query;
use crate::tableau::Assignment;

pub struct IncrementalLinearization {
    query: Query,
    engine: Option<Engine>,
    config: EngineConfig,
    /// Remaining budget in microseconds; `None` means unbounded.
    remaining_micros: Option<u128>,
    round: usize,
    constraints_to_refine: usize,
    refinement_scaling_factor: f64,
    num_additional_equations: usize,
}

impl IncrementalLinearization {
    /// Takes ownership of the query and of the engine whose spurious
    /// counter-example seeds the first refinement.
    pub fn new(query: Query, engine: Engine, config: EngineConfig) -> Self {
        let constraints_to_refine = config
            .constraints_to_refine
            .min(query.nonlinear_constraints().len().max(1));
        Self {
            remaining_micros: config.timeout.map(|t| t.as_micros()),
            constraints_to_refine,
            refinement_scaling_factor: config.refinement_scaling_factor,
            query,
            engine: Some(engine),
            config,
            round: 0,
            num_additional_equations: 0,
        }
    }

    pub fn solve(&mut self) -> ExitCode {
        loop {
            let round_started = Instant::now();
            self.round += 1;

            // Pull the counter-example and the tightened bounds out of the
            // previous attempt.
            if let Some(engine) = &self.engine {
                engine.extract_solution_into(&mut self.query);
                engine.extract_bounds_into(&mut self.query);
            }

            let counter_example = self.counter_example();
            let refined = self.refine(&counter_example);
            info!(
                round = self.round,
                refined,
                additional_equations = self.num_additional_equations,
                "incremental linearization round"
            );
            if refined == 0 {
                // Nothing excludes the counter-example: saturated.
                return self
                    .engine
                    .as_ref()
                    .and_then(|e| e.exit_code())
                    .unwrap_or(ExitCode::Unknown);
            }

            // A drained budget forces the next attempt to give up at once.
            let mut round_config = self.config.clone();
            round_config.timeout = match self.remaining_micros {
                Some(0) => Some(Duration::from_micros(1)),
                Some(micros) => Some(Duration::from_micros(micros.min(u64::MAX as u128) as u64)),
                None => None,
            };

            let code = match Engine::process_input_query(self.query.clone(), round_config) {
                Ok(mut engine) => {
                    let code = engine.solve();
                    self.engine = Some(engine);
                    code
                }
                Err(e) => {
                    debug!(error = %e, "refined query rejected");
                    return ExitCode::Error;
                }
            };

            match code {
                ExitCode::Unknown => {
                    if let Some(remaining) = &mut self.remaining_micros {
                        let spent = round_started.elapsed().as_micros();
                        *remaining = remaining.saturating_sub(spent);
                        if *remaining == 0 {
                            return ExitCode::Unknown;
                        }
                    }
                    let total = self.query.nonlinear_constraints().len();
                    self.constraints_to_refine = total.min(
                        ((self.constraints_to_refine as f64) * self.refinement_scaling_factor)
                            .ceil() as usize,
                    );
                }
                verdict => return verdict,
            }
        }
    }

    /// Hand the final engine (and its solution) back to the caller.
    pub fn release_engine(self) -> Option<Engine> {
        self.engine
    }

    pub fn rounds(&self) -> usize {
        self.round
    }

    pub fn num_additional_equations(&self) -> usize {
        self.num_additional_equations
    }

    fn counter_example(&self) -> Assignment {
        let mut assignment = Assignment::new();
        for (v, x) in self.query.solution() {
            assignment.set(v, x);
        }
        assignment
    }

    /// Ask each nonlinear constraint in turn for cuts until `k` succeed.
    fn refine(&mut self, counter_example: &Assignment) -> usize {
        self.sync_constraint_bounds();
        let mut refined = 0;
        let mut new_equations = Vec::new();
        for constraint in self.query.nonlinear_constraints() {
            if constraint.is_obsolete() {
                continue;
            }
            let refinement = constraint.attempt_to_refine(counter_example);
            if refinement.is_empty() {
                continue;
            }
            new_equations.extend(refinement.equations);
            refined += 1;
            if refined >= self.constraints_to_refine {
                break;
            }
        }
        self.num_additional_equations += new_equations.len();
        for eq in new_equations {
            self.query.add_equation(eq);
        }
        refined
    }

    /// Push the query's current bounds into the constraints' caches; the
    /// cut shapes depend on which curvature region the bounds pin down.
    fn sync_constraint_bounds(&mut self) {
        let mut sink = Vec::new();
        let mut constraints = std::mem::take(self.query.nonlinear_constraints_mut());
        for constraint in constraints.iter_mut() {
            for v in constraint.participating_variables() {
                let lb = self.query.lower_bound(v);
                let ub = self.query.upper_bound(v);
                let _ = constraint.notify_lower_bound(v, lb, &mut sink);
                let _ = constraint.notify_upper_bound(v, ub, &mut sink);
            }
        }
        *self.query.nonlinear_constraints_mut() = constraints;
        sink.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonlinear::NonlinearConstraint;

    fn sigmoid_query() -> Query {
        let mut q = Query::new();
        q.set_number_of_variables(2);
        q.set_lower_bound(0, 0.0);
        q.set_upper_bound(0, 1.0);
        q.set_lower_bound(1, crate::nonlinear::sigmoid(0.0));
        q.set_upper_bound(1, crate::nonlinear::sigmoid(1.0));
        q.mark_input_variable(0, 0);
        q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(0, 1));
        q
    }

    #[test]
    fn test_refine_adds_cut_for_spurious_point() {
        let q = sigmoid_query();
        let engine = Engine::process_input_query(q.clone(), EngineConfig::default()).unwrap();
        let mut cegar = IncrementalLinearization::new(q, engine, EngineConfig::default());

        // A point clearly above the curve.
        let mut ce = Assignment::new();
        ce.set(0, 0.5);
        ce.set(1, 0.9);
        let refined = cegar.refine(&ce);
        assert_eq!(refined, 1);
        assert!(cegar.num_additional_equations() > 0);
    }

    #[test]
    fn test_refine_stops_at_consistent_point() {
        let q = sigmoid_query();
        let engine = Engine::process_input_query(q.clone(), EngineConfig::default()).unwrap();
        let mut cegar = IncrementalLinearization::new(q, engine, EngineConfig::default());

        let mut ce = Assignment::new();
        ce.set(0, 0.5);
        ce.set(1, crate::nonlinear::sigmoid(0.5));
        assert_eq!(cegar.refine(&ce), 0);
    }

    #[test]
    fn test_refinement_budget_grows() {
        let mut q = Query::new();
        q.set_number_of_variables(8);
        for i in 0..4 {
            q.set_lower_bound(2 * i, -1.0);
            q.set_upper_bound(2 * i, 1.0);
            q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(2 * i, 2 * i + 1));
        }
        let mut config = EngineConfig::default();
        config.constraints_to_refine = 1;
        let engine = Engine::process_input_query(q.clone(), config.clone()).unwrap();
        let mut cegar = IncrementalLinearization::new(q, engine, config);

        // Every output is pinned at a spurious value.
        let mut ce = Assignment::new();
        for i in 0..4 {
            ce.set(2 * i, 0.5);
            ce.set(2 * i + 1, 0.99);
        }
        // k = 1: only one constraint refined per round.
        assert_eq!(cegar.refine(&ce), 1);
    }
}
