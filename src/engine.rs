//! The search driver.
//!
//! One iteration: drain bound tightenings to a fixed point (constraints
//! react through their watcher registrations), ask the tableau for a
//! feasible assignment, and then either declare SAT, descend with the
//! sum-of-infeasibilities search, or case-split on a violated constraint.
//! Decision records stash the constraint states, the bound journal mark
//! and the tableau's split mark, so backtracking is a straight restore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bounds::{BoundStore, BoundType, ConstraintId, Tightening};
use crate::config::{BoundTighteningMode, EngineConfig, Rng, SymbolicTighteningMode};
use crate::error::{Error, Result};
use crate::num;
use crate::plc::CaseSplit;
use crate::preprocess::Preprocessor;
use crate::query::Query;
use crate::soi::SoiManager;
use crate::tableau::{Assignment, LpTableau, Tableau};

/// Terminal states of a solve call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Sat,
    Unsat,
    Timeout,
    QuitRequested,
    Unknown,
    Error,
}

impl ExitCode {
    pub fn process_exit_code(self) -> i32 {
        match self {
            ExitCode::Sat => 0,
            ExitCode::Unsat => 10,
            ExitCode::Timeout | ExitCode::QuitRequested | ExitCode::Unknown => 20,
            ExitCode::Error => 2,
        }
    }
}

struct DecisionRecord {
    constraint: ConstraintId,
    splits: Vec<CaseSplit>,
    next_split: usize,
    store_mark: usize,
    tableau_mark: usize,
    stashed_constraints: Vec<crate::plc::PlConstraint>,
}

pub struct Engine {
    config: EngineConfig,
    /// The query as the caller posed it; receives the solution.
    original: Query,
    /// The preprocessed query the search runs on.
    query: Query,
    preprocessor: Preprocessor,
    store: BoundStore,
    tableau: LpTableau,
    rng: Rng,
    quit_requested: Arc<AtomicBool>,
    started: Instant,
    stack: Vec<DecisionRecord>,
    decisions_since_propagation: usize,
    exit_code: Option<ExitCode>,
}

impl Engine {
    /// Preprocess a query and set up the search state. An infeasibility
    /// discovered here is already a verdict.
    pub fn process_input_query(query: Query, config: EngineConfig) -> Result<Engine> {
        let original = query.clone();
        let mut preprocessor = Preprocessor::new();
        let processed = match preprocessor.preprocess(query) {
            Ok(q) => q,
            Err(Error::InfeasibleQuery) => {
                return Ok(Engine::unsat_stub(original, config));
            }
            Err(e) => return Err(e),
        };

        let n = processed.num_variables();
        let mut store = BoundStore::new(n);
        for (v, b) in processed.explicit_lower_bounds() {
            store.set_lb(v, b);
        }
        for (v, b) in processed.explicit_upper_bounds() {
            store.set_ub(v, b);
        }
        for (id, constraint) in processed.pl_constraints().iter().enumerate() {
            for v in constraint.participating_variables() {
                if v < n {
                    store.register_watcher(v, id);
                }
            }
        }

        let tableau = LpTableau::new(n, processed.equations().to_vec());
        let rng = Rng::new(config.seed);

        Ok(Engine {
            config,
            original,
            query: processed,
            preprocessor,
            store,
            tableau,
            rng,
            quit_requested: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            stack: Vec::new(),
            decisions_since_propagation: 0,
            exit_code: None,
        })
    }

    fn unsat_stub(original: Query, config: EngineConfig) -> Engine {
        Engine {
            config,
            query: Query::new(),
            original,
            preprocessor: Preprocessor::new(),
            store: BoundStore::new(0),
            tableau: LpTableau::new(0, Vec::new()),
            rng: Rng::new(0),
            quit_requested: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            stack: Vec::new(),
            decisions_since_propagation: 0,
            exit_code: Some(ExitCode::Unsat),
        }
    }

    /// Handle the host can use to request a cooperative stop.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit_requested)
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exit_code
    }

    pub fn processed_query(&self) -> &Query {
        &self.query
    }

    // ─── Main Loop ─────────────────────────────────────────────────

    pub fn solve(&mut self) -> ExitCode {
        if let Some(code) = self.exit_code {
            return code;
        }
        self.started = Instant::now();
        let code = match self.search() {
            Ok(code) => code,
            Err(Error::Timeout) => ExitCode::Timeout,
            Err(Error::QuitRequested) => ExitCode::QuitRequested,
            Err(Error::InfeasibleQuery) => ExitCode::Unsat,
            Err(e) => {
                warn!(error = %e, "engine aborted");
                ExitCode::Error
            }
        };
        self.exit_code = Some(code);
        info!(?code, decisions = self.stack.len(), "solve finished");
        code
    }

    fn search(&mut self) -> Result<ExitCode> {
        // Root propagation: constraint-entailed bounds plus one pass of
        // network-level reasoning.
        if let Err(e) = self.initial_propagation() {
            return self.recover(e);
        }

        loop {
            self.check_time_budget()?;

            // A constraint whose phase became fixed through propagation is
            // enforced by its one valid split and drops out of the search.
            if let Err(e) = self.apply_fixed_constraints() {
                if let Some(code) = self.recover_inner(e)? {
                    return Ok(code);
                }
                continue;
            }

            let feasible = match self.tableau.pivot_to_feasible(&self.store) {
                Ok(feasible) => feasible,
                Err(Error::ExternalSolver(message)) => {
                    warn!(%message, "LP backend failed; giving up on this query");
                    return Ok(ExitCode::Unknown);
                }
                Err(e) => return Err(e),
            };
            if !feasible {
                if !self.backtrack()? {
                    return Ok(ExitCode::Unsat);
                }
                continue;
            }

            let assignment = self.tableau.assignment();
            let violated = self.violated_constraints(&assignment);
            if violated.is_empty() {
                self.extract_solution(&assignment);
                // Transcendental constraints are not enforced by the LP;
                // an assignment violating one is only a counter-example to
                // the current abstraction.
                let spurious = self
                    .query
                    .nonlinear_constraints()
                    .iter()
                    .any(|c| !c.is_obsolete() && !c.satisfied(&assignment));
                return Ok(if spurious {
                    ExitCode::Unknown
                } else {
                    ExitCode::Sat
                });
            }

            // Optimization mode: stochastic phase-pattern descent, when
            // every violated constraint carries a cost. Without a network
            // the pattern initializes from the current assignment.
            let soi_applicable = violated
                .iter()
                .all(|&id| self.query.pl_constraints()[id].supports_soi());
            if soi_applicable {
                if let Some(code) = self.run_soi_descent()? {
                    return Ok(code);
                }
            }

            // Branch on the first violated constraint that still splits.
            let decision = violated
                .iter()
                .copied()
                .find(|&id| !self.query.pl_constraints()[id].phase_fixed());
            match decision {
                Some(id) => {
                    if !self.decide(id)? {
                        return Ok(ExitCode::Unsat);
                    }
                }
                None => {
                    // Every violated constraint is already fixed: the
                    // relaxation admits the point but the fixed pieces
                    // reject it, so the node is a dead end.
                    if !self.backtrack()? {
                        return Ok(ExitCode::Unsat);
                    }
                }
            }

            self.decisions_since_propagation += 1;
            if self.decisions_since_propagation >= self.config.propagation_frequency {
                self.decisions_since_propagation = 0;
                if let Err(e) = self.network_propagation() {
                    if let Some(code) = self.recover_inner(e)? {
                        return Ok(code);
                    }
                }
            }
        }
    }

    fn recover(&mut self, e: Error) -> Result<ExitCode> {
        match self.recover_inner(e)? {
            Some(code) => Ok(code),
            None => self.search(),
        }
    }

    /// Fold a recoverable infeasibility back into the search.
    fn recover_inner(&mut self, e: Error) -> Result<Option<ExitCode>> {
        match e {
            Error::InfeasibleBounds { .. } | Error::InfeasibleQuery => {
                if self.backtrack()? {
                    Ok(None)
                } else {
                    Ok(Some(ExitCode::Unsat))
                }
            }
            other => Err(other),
        }
    }

    fn check_time_budget(&self) -> Result<()> {
        if self.quit_requested.load(Ordering::Relaxed) {
            return Err(Error::QuitRequested);
        }
        if let Some(budget) = self.config.timeout {
            if self.started.elapsed() >= budget {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    // ─── Propagation ───────────────────────────────────────────────

    fn initial_propagation(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for constraint in self.query.pl_constraints() {
            if constraint.is_active() && !constraint.is_obsolete() {
                constraint.entailed_tightenings(&mut pending);
            }
        }
        for constraint in self.query.nonlinear_constraints() {
            if !constraint.is_obsolete() {
                constraint.entailed_tightenings(&mut pending);
            }
        }
        self.apply_tightenings(pending)?;
        self.network_propagation()
    }

    /// Apply tightenings and dispatch watcher notifications until the
    /// queue drains. Within one iteration the order is: bound change,
    /// constraint notification, derived bound changes.
    fn apply_tightenings(&mut self, mut pending: Vec<Tightening>) -> Result<()> {
        while let Some(t) = pending.pop() {
            if !self.store.apply(&t)? {
                continue;
            }
            let watchers: Vec<ConstraintId> = self.store.watchers(t.variable).to_vec();
            for id in watchers {
                let constraint = &mut self.query.pl_constraints_mut()[id];
                if !constraint.is_active() || constraint.is_obsolete() {
                    continue;
                }
                match t.bound {
                    BoundType::Lower => {
                        constraint.notify_lower_bound(t.variable, t.value, &mut pending)?
                    }
                    BoundType::Upper => {
                        constraint.notify_upper_bound(t.variable, t.value, &mut pending)?
                    }
                }
            }
            let mut nl = std::mem::take(self.query.nonlinear_constraints_mut());
            for constraint in nl.iter_mut() {
                if constraint.is_obsolete() || !constraint.participates(t.variable) {
                    continue;
                }
                let outcome = match t.bound {
                    BoundType::Lower => {
                        constraint.notify_lower_bound(t.variable, t.value, &mut pending)
                    }
                    BoundType::Upper => {
                        constraint.notify_upper_bound(t.variable, t.value, &mut pending)
                    }
                };
                if let Err(e) = outcome {
                    *self.query.nonlinear_constraints_mut() = nl;
                    return Err(e);
                }
            }
            *self.query.nonlinear_constraints_mut() = nl;
        }
        Ok(())
    }

    /// Network-wide bound tightening per the configured modes.
    fn network_propagation(&mut self) -> Result<()> {
        if self.query.network().is_none() {
            return Ok(());
        }
        {
            let store = &self.store;
            let network = self.query.network_mut().expect("checked above");
            network.obtain_current_bounds(store);
            network.interval_arithmetic_propagation()?;
            match self.config.symbolic_tightening {
                SymbolicTighteningMode::None => {}
                SymbolicTighteningMode::Sbt => network.symbolic_bound_propagation()?,
                SymbolicTighteningMode::DeepPoly => network.deep_poly_propagation()?,
            }
            let lp_outcome = match self.config.bound_tightening {
                BoundTighteningMode::None => Ok(false),
                BoundTighteningMode::BackwardConverge => {
                    network.lp_relaxation_converge().map(|()| true)
                }
                _ => network.lp_relaxation_propagation(),
            };
            if let Err(Error::ExternalSolver(message)) = lp_outcome {
                // The relaxation solver is best-effort: keep the symbolic
                // bounds and move on.
                warn!(%message, "LP tightening pass failed");
            }
        }
        let mut tightenings = Vec::new();
        self.query
            .network()
            .expect("checked above")
            .get_constraint_tightenings(&mut tightenings);
        debug!(count = tightenings.len(), "network propagation produced tightenings");
        self.apply_tightenings(tightenings)
    }

    // ─── Assignment Checks ─────────────────────────────────────────

    fn violated_constraints(&self, assignment: &Assignment) -> Vec<ConstraintId> {
        self.query
            .pl_constraints()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active() && !c.is_obsolete() && !c.satisfied(assignment))
            .map(|(id, _)| id)
            .collect()
    }

    // ─── SoI Descent ───────────────────────────────────────────────

    fn run_soi_descent(&mut self) -> Result<Option<ExitCode>> {
        let mut soi = SoiManager::new(&self.config);
        soi.initialize_phase_pattern(
            self.query.pl_constraints(),
            self.query.network(),
            &self.tableau,
        )?;
        if soi.pattern_size() == 0 {
            return Ok(None);
        }

        let cost_form = soi.get_current_soi_phase_pattern(self.query.pl_constraints());
        let Some(mut accepted_cost) = self.tableau.minimize(&cost_form, &self.store)? else {
            // The relaxation itself is infeasible here.
            return match self.backtrack()? {
                true => Ok(None),
                false => Ok(Some(ExitCode::Unsat)),
            };
        };
        soi.accept_current_phase_pattern();
        soi.obtain_current_assignment(&self.tableau);
        if let Some(code) = self.check_soi_solution(accepted_cost)? {
            return Ok(Some(code));
        }

        for _ in 0..self.config.soi_proposal_budget {
            self.check_time_budget()?;
            soi.propose_phase_pattern_update(
                self.query.pl_constraints(),
                &self.tableau,
                &mut self.rng,
            );
            let cost_form = soi.get_current_soi_phase_pattern(self.query.pl_constraints());
            let Some(proposed_cost) = self.tableau.minimize(&cost_form, &self.store)? else {
                return match self.backtrack()? {
                    true => Ok(None),
                    false => Ok(Some(ExitCode::Unsat)),
                };
            };
            soi.obtain_current_assignment(&self.tableau);
            if let Some(code) = self.check_soi_solution(proposed_cost)? {
                return Ok(Some(code));
            }
            if soi.decide_to_accept_current_proposal(accepted_cost, proposed_cost, &mut self.rng)
            {
                soi.update_current_phase_pattern_for_satisfied_pl_constraints(
                    self.query.pl_constraints(),
                );
                soi.accept_current_phase_pattern();
                accepted_cost = proposed_cost;
            } else {
                soi.revert_current_phase_pattern();
            }
        }
        debug!("SoI descent exhausted its proposal budget");
        Ok(None)
    }

    /// Zero SoI cost means the minimizing assignment realises the chosen
    /// phases; confirm against the full constraint set.
    fn check_soi_solution(&mut self, cost: f64) -> Result<Option<ExitCode>> {
        if !num::is_zero(cost) {
            return Ok(None);
        }
        let assignment = self.tableau.assignment();
        if self.violated_constraints(&assignment).is_empty() {
            self.extract_solution(&assignment);
            Ok(Some(ExitCode::Sat))
        } else {
            Ok(None)
        }
    }

    // ─── Decisions and Backtracking ────────────────────────────────

    /// Open a decision on `constraint` and apply its first viable split.
    fn decide(&mut self, constraint: ConstraintId) -> Result<bool> {
        let splits = self.query.pl_constraints()[constraint].case_splits();
        if splits.is_empty() {
            return self.backtrack();
        }
        debug!(constraint, options = splits.len(), "branching");
        let record = DecisionRecord {
            constraint,
            splits,
            next_split: 0,
            store_mark: self.store.checkpoint(),
            tableau_mark: self.tableau.split_mark(),
            stashed_constraints: self.query.pl_constraints().to_vec(),
        };
        self.stack.push(record);
        self.advance_top_decision()
    }

    /// Try the next sibling of the top decision, restoring state first.
    /// Pops exhausted decisions; returns false when the stack empties.
    fn backtrack(&mut self) -> Result<bool> {
        while !self.stack.is_empty() {
            if self.advance_top_decision()? {
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }

    fn advance_top_decision(&mut self) -> Result<bool> {
        loop {
            let Some(record) = self.stack.last_mut() else {
                return Ok(false);
            };
            if record.next_split >= record.splits.len() {
                return Ok(false);
            }
            // Restore the node state before applying the sibling.
            self.store.rollback_to(record.store_mark);
            self.tableau.pop_splits_to(record.tableau_mark);
            let stash = record.stashed_constraints.clone();
            let split = record.splits[record.next_split].clone();
            record.next_split += 1;
            let constraint = record.constraint;
            *self.query.pl_constraints_mut() = stash;

            match self.apply_split(constraint, &split) {
                Ok(()) => return Ok(true),
                Err(Error::InfeasibleBounds { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Enforce every active constraint with a fixed phase.
    fn apply_fixed_constraints(&mut self) -> Result<()> {
        loop {
            let next = self
                .query
                .pl_constraints()
                .iter()
                .enumerate()
                .find(|(_, c)| c.is_active() && !c.is_obsolete() && c.phase_fixed())
                .map(|(id, _)| id);
            let Some(id) = next else { return Ok(()) };
            let split = self.query.pl_constraints()[id].valid_case_split();
            self.apply_split(id, &split)?;
        }
    }

    fn apply_split(&mut self, constraint: ConstraintId, split: &CaseSplit) -> Result<()> {
        {
            let c = &mut self.query.pl_constraints_mut()[constraint];
            c.set_phase_status(split.phase);
            c.set_active(false);
        }
        self.tableau.push_split_equations(&split.equations);
        self.apply_tightenings(split.bounds.clone())
    }

    // ─── Solution Extraction ───────────────────────────────────────

    fn extract_solution(&mut self, assignment: &Assignment) {
        for v in 0..self.query.num_variables() {
            self.query.set_solution_value(v, assignment.value(v));
        }
        self.preprocessor
            .reconstruct_solution(&self.query, &mut self.original);
    }

    /// Solution value of a variable of the *original* query.
    pub fn solution_value(&self, variable: usize) -> f64 {
        self.original.solution_value(variable)
    }

    /// Copy the solution into another query (typically the caller's).
    pub fn extract_solution_into(&self, target: &mut Query) {
        for (v, x) in self.original.solution() {
            target.set_solution_value(v, x);
        }
    }

    /// Current bounds of the original query's variables, for refinement.
    pub fn extract_bounds_into(&self, target: &mut Query) {
        for v in 0..target.num_variables() {
            if let Some(value) = self.preprocessor.fixed_value(v) {
                target.set_lower_bound(v, value);
                target.set_upper_bound(v, value);
            } else if let Some(new) = self.preprocessor.new_index(v) {
                if new < self.store.num_variables() {
                    let lb = self.store.lb(new);
                    let ub = self.store.ub(new);
                    if num::is_finite(lb) {
                        target.set_lower_bound(v, lb);
                    }
                    if num::is_finite(ub) {
                        target.set_upper_bound(v, ub);
                    }
                }
            }
        }
    }
}
