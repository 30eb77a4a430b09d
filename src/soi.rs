//! Sum-of-infeasibilities manager: stochastic local search over phase
//! patterns.
//!
//! The manager keeps two patterns: `current`, mutated by the running
//! proposal, and `last_accepted`, the state of the Markov chain. A
//! proposal always starts from the accepted pattern, flips one
//! constraint's phase (uniformly at random for MCMC, by best one-step
//! cost reduction for WalkSAT) and is accepted by the Metropolis rule
//! `min(1, exp(-β·Δcost))`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::bounds::ConstraintId;
use crate::config::{EngineConfig, Rng, SoiInitializationStrategy, SoiSearchStrategy};
use crate::equation::AffineForm;
use crate::error::Result;
use crate::nlr::NetworkLevelReasoner;
use crate::num;
use crate::plc::{PhaseStatus, PlConstraint};
use crate::tableau::{Assignment, Tableau};

pub struct SoiManager {
    initialization: SoiInitializationStrategy,
    search: SoiSearchStrategy,
    /// β in the acceptance rule.
    probability_density_parameter: f64,
    current: BTreeMap<ConstraintId, PhaseStatus>,
    last_accepted: BTreeMap<ConstraintId, PhaseStatus>,
    /// Pattern members in stable order, for random indexing.
    in_pattern: Vec<ConstraintId>,
    current_assignment: Assignment,
    updated_in_last_proposal: Vec<ConstraintId>,
}

impl SoiManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            initialization: config.soi_initialization,
            search: config.soi_search,
            probability_density_parameter: config.probability_density_parameter,
            current: BTreeMap::new(),
            last_accepted: BTreeMap::new(),
            in_pattern: Vec::new(),
            current_assignment: Assignment::new(),
            updated_in_last_proposal: Vec::new(),
        }
    }

    pub fn constraints_updated_in_last_proposal(&self) -> &[ConstraintId] {
        &self.updated_in_last_proposal
    }

    pub fn current_assignment(&self) -> &Assignment {
        &self.current_assignment
    }

    pub fn pattern_size(&self) -> usize {
        self.in_pattern.len()
    }

    /// Refresh the local copy of the variable assignment.
    pub fn obtain_current_assignment(&mut self, tableau: &dyn Tableau) {
        self.current_assignment = tableau.assignment();
    }

    // ─── Initialization ────────────────────────────────────────────

    /// Choose the first phase pattern: one cost term per unfixed
    /// constraint, read off either the forward-simulated input assignment
    /// or the current assignment.
    pub fn initialize_phase_pattern(
        &mut self,
        constraints: &[PlConstraint],
        network: Option<&NetworkLevelReasoner>,
        tableau: &dyn Tableau,
    ) -> Result<()> {
        self.current.clear();
        self.last_accepted.clear();
        self.in_pattern.clear();
        self.updated_in_last_proposal.clear();
        self.obtain_current_assignment(tableau);

        let reference = match (self.initialization, network) {
            (SoiInitializationStrategy::InputAssignment, Some(network)) => {
                let simulated = network.concretize_input_assignment(&self.current_assignment)?;
                let mut assignment = Assignment::new();
                for (v, x) in simulated {
                    assignment.set(v, x);
                }
                assignment
            }
            _ => self.current_assignment.clone(),
        };

        for (id, constraint) in constraints.iter().enumerate() {
            if !constraint.is_active() || constraint.phase_fixed() || !constraint.supports_soi() {
                continue;
            }
            let phase = constraint.phase_of_assignment(&reference);
            self.current.insert(id, phase);
            self.last_accepted.insert(id, phase);
            self.in_pattern.push(id);
        }
        debug!(size = self.in_pattern.len(), "initialized SoI phase pattern");
        Ok(())
    }

    // ─── Proposals ─────────────────────────────────────────────────

    pub fn propose_phase_pattern_update(
        &mut self,
        constraints: &[PlConstraint],
        tableau: &dyn Tableau,
        rng: &mut Rng,
    ) {
        self.obtain_current_assignment(tableau);
        match self.search {
            SoiSearchStrategy::Mcmc => {
                let r = rng.next_rand();
                self.propose_randomly(constraints, r);
            }
            SoiSearchStrategy::Walksat => self.propose_walksat(constraints, rng),
        }
    }

    /// Flip the constraint at `r mod N` to phase `(r / N) mod cases`.
    fn propose_randomly(&mut self, constraints: &[PlConstraint], r: u64) {
        self.current = self.last_accepted.clone();
        self.updated_in_last_proposal.clear();
        if self.in_pattern.is_empty() {
            return;
        }
        let n = self.in_pattern.len() as u64;
        let id = self.in_pattern[(r % n) as usize];
        let cases = constraints[id].get_all_cases();
        let phase = cases[((r / n) as usize) % cases.len()];
        self.current.insert(id, phase);
        self.updated_in_last_proposal.push(id);
    }

    /// Flip the member with the largest positive one-step cost reduction;
    /// on a plateau fall back to a random flip.
    fn propose_walksat(&mut self, constraints: &[PlConstraint], rng: &mut Rng) {
        let mut best: Option<(ConstraintId, f64, PhaseStatus)> = None;
        for &id in &self.in_pattern {
            let current_phase = self.last_accepted[&id];
            let (reduction, phase) = self.cost_reduction(&constraints[id], current_phase);
            if best.map(|(_, r, _)| reduction > r).unwrap_or(true) {
                best = Some((id, reduction, phase));
            }
        }
        match best {
            Some((id, reduction, phase)) if num::is_positive(reduction) => {
                self.current = self.last_accepted.clone();
                self.updated_in_last_proposal.clear();
                self.current.insert(id, phase);
                self.updated_in_last_proposal.push(id);
            }
            _ => {
                let r = rng.next_rand();
                self.propose_randomly(constraints, r);
            }
        }
    }

    /// Largest decrease of this constraint's cost achievable by moving it
    /// to another phase, under the current assignment. Negative when the
    /// current phase is locally optimal.
    fn cost_reduction(
        &self,
        constraint: &PlConstraint,
        current_phase: PhaseStatus,
    ) -> (f64, PhaseStatus) {
        let assignment = &self.current_assignment;
        let evaluate = |phase: PhaseStatus| {
            constraint
                .cost_component(phase)
                .evaluate(|v| assignment.value(v))
        };
        let current_cost = evaluate(current_phase);
        let mut best = (num::negative_infinity(), current_phase);
        for phase in constraint.get_all_cases() {
            if phase == current_phase {
                continue;
            }
            let reduction = current_cost - evaluate(phase);
            if reduction > best.0 {
                best = (reduction, phase);
            }
        }
        best
    }

    // ─── Acceptance ────────────────────────────────────────────────

    /// Metropolis rule: always accept an improvement, otherwise accept
    /// with probability `exp(-β·(new - old))` against a uniform draw.
    pub fn decide_to_accept_current_proposal(
        &self,
        cost_of_last_accepted: f64,
        cost_of_proposed: f64,
        rng: &mut Rng,
    ) -> bool {
        if cost_of_proposed <= cost_of_last_accepted {
            return true;
        }
        self.accept_with_draw(cost_of_last_accepted, cost_of_proposed, rng.next_f64())
    }

    fn accept_with_draw(&self, old_cost: f64, new_cost: f64, draw: f64) -> bool {
        let probability =
            (-self.probability_density_parameter * (new_cost - old_cost)).exp();
        probability > draw
    }

    pub fn accept_current_phase_pattern(&mut self) {
        self.last_accepted = self.current.clone();
        self.updated_in_last_proposal.clear();
    }

    /// Roll a rejected proposal back to the accepted pattern.
    pub fn revert_current_phase_pattern(&mut self) {
        self.current = self.last_accepted.clone();
        self.updated_in_last_proposal.clear();
    }

    // ─── Pattern Maintenance ───────────────────────────────────────

    /// Re-align the cost term of every constraint the current assignment
    /// already satisfies; their contribution drops to zero for free.
    pub fn update_current_phase_pattern_for_satisfied_pl_constraints(
        &mut self,
        constraints: &[PlConstraint],
    ) {
        for &id in &self.in_pattern {
            let constraint = &constraints[id];
            if constraint.satisfied(&self.current_assignment) {
                let phase = constraint.phase_of_assignment(&self.current_assignment);
                self.current.insert(id, phase);
            }
        }
    }

    /// Drop a constraint whose phase became permanently fixed outside the
    /// search.
    pub fn remove_cost_component(&mut self, id: ConstraintId) {
        self.current.remove(&id);
        self.last_accepted.remove(&id);
        self.in_pattern.retain(|&c| c != id);
        self.updated_in_last_proposal.retain(|&c| c != id);
    }

    // ─── Concretisation ────────────────────────────────────────────

    /// The current pattern as one linear cost expression.
    pub fn get_current_soi_phase_pattern(&self, constraints: &[PlConstraint]) -> AffineForm {
        self.concretize(&self.current, constraints)
    }

    pub fn get_last_accepted_soi_phase_pattern(&self, constraints: &[PlConstraint]) -> AffineForm {
        self.concretize(&self.last_accepted, constraints)
    }

    fn concretize(
        &self,
        pattern: &BTreeMap<ConstraintId, PhaseStatus>,
        constraints: &[PlConstraint],
    ) -> AffineForm {
        let mut cost = AffineForm::new();
        for &id in &self.in_pattern {
            if let Some(&phase) = pattern.get(&id) {
                cost.add_scaled(&constraints[id].cost_component(phase), 1.0);
            }
        }
        cost
    }

    /// Evaluate a pattern's cost under the current assignment.
    pub fn cost_of_pattern(&self, constraints: &[PlConstraint], accepted: bool) -> f64 {
        let pattern = if accepted {
            &self.last_accepted
        } else {
            &self.current
        };
        let assignment = &self.current_assignment;
        self.in_pattern
            .iter()
            .filter_map(|id| pattern.get(id).map(|&phase| (id, phase)))
            .map(|(&id, phase)| {
                constraints[id]
                    .cost_component(phase)
                    .evaluate(|v| assignment.value(v))
            })
            .sum()
    }

    // ─── Test Hooks ────────────────────────────────────────────────

    pub fn set_phase_status_in_current_phase_pattern(
        &mut self,
        id: ConstraintId,
        phase: PhaseStatus,
    ) {
        self.current.insert(id, phase);
    }

    pub fn set_phase_status_in_last_accepted_phase_pattern(
        &mut self,
        id: ConstraintId,
        phase: PhaseStatus,
    ) {
        self.last_accepted.insert(id, phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::{MaxConstraint, ReluConstraint};
    use crate::query::Query;
    use crate::tableau::MockTableau;

    /// Three relus feeding a max:
    ///
    /// ```text
    ///     R
    ///   0 -- 1
    ///     R      \
    ///   2 -- 3 ---  6
    ///     R      /
    ///   4 -- 5
    /// ```
    fn create_query() -> Query {
        let mut q = Query::new();
        q.set_number_of_variables(7);
        q.add_pl_constraint(crate::plc::PlConstraint::Relu(ReluConstraint::new(0, 1)));
        q.add_pl_constraint(crate::plc::PlConstraint::Relu(ReluConstraint::new(2, 3)));
        q.add_pl_constraint(crate::plc::PlConstraint::Relu(ReluConstraint::new(4, 5)));
        let mut max = MaxConstraint::new(6, vec![1, 3, 5]);
        max.transform_to_use_aux_variables(&mut q);
        q.add_pl_constraint(crate::plc::PlConstraint::Max(max));

        for v in 0..7 {
            q.set_lower_bound(v, -3.0);
            q.set_upper_bound(v, 3.0);
        }
        for v in [1, 3, 5] {
            q.set_lower_bound(v, 0.0);
        }
        for aux in 7..10 {
            q.set_lower_bound(aux, 0.0);
            q.set_upper_bound(aux, 3.0);
        }
        q.mark_input_variable(0, 0);
        q.mark_input_variable(2, 1);
        q.mark_input_variable(4, 2);

        assert!(q.construct_network_level_reasoner());
        q
    }

    fn config(init: SoiInitializationStrategy, search: SoiSearchStrategy) -> EngineConfig {
        EngineConfig {
            soi_initialization: init,
            soi_search: search,
            ..EngineConfig::default()
        }
    }

    fn tableau_with(values: &[(usize, f64)]) -> MockTableau {
        let mut t = MockTableau::new();
        for &(v, x) in values {
            t.next_values.insert(v, x);
        }
        t
    }

    #[test]
    fn test_initialize_phase_pattern_with_input_assignment() {
        let q = create_query();
        let tableau = tableau_with(&[
            (0, -1.0),
            (1, 0.0),
            (2, 1.0),
            (3, 1.0),
            (4, 2.0),
            (5, 2.0),
            (6, 2.0),
            (7, 2.0),
            (8, 1.0),
            (9, 0.0),
        ]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();

        // Input assignment [-1, 1, 2]: relu1 inactive, relu2 and relu3
        // active, and the third max input wins.
        let mut expected = AffineForm::new();
        expected.add_scaled(
            &q.pl_constraints()[0].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[1].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[2].cost_component(PhaseStatus::Active),
            1.0,
        );
        let third_case = q.pl_constraints()[3].get_all_cases()[2];
        assert_eq!(third_case, PhaseStatus::MaxInput(5));
        expected.add_scaled(&q.pl_constraints()[3].cost_component(third_case), 1.0);

        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected);
        assert_eq!(
            soi.get_last_accepted_soi_phase_pattern(q.pl_constraints()),
            expected
        );
        assert!(soi.constraints_updated_in_last_proposal().is_empty());
    }

    #[test]
    fn test_initialize_skips_fixed_and_maps_eliminated_to_constant_term() {
        let mut q = create_query();
        let tableau = tableau_with(&[
            (0, 1.0),
            (1, 1.0),
            (2, 2.0),
            (3, 2.0),
            (4, -1.0),
            (5, 0.0),
            (6, 2.0),
            (7, 1.0),
            (9, 0.0),
        ]);
        // Fix the second relu's phase and eliminate the second max input.
        {
            let derived = &mut Vec::new();
            q.pl_constraints_mut()[1]
                .notify_lower_bound(2, 2.0, derived)
                .unwrap();
        }
        q.pl_constraints_mut()[3].eliminate(3, 2.0);
        q.network_mut().unwrap().eliminate_variable(3, 2.0);

        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();

        // relu2 is fixed: out of the pattern. The max's winner is the
        // eliminated value 2, so its cost term is the eliminated constant.
        let mut expected = AffineForm::new();
        expected.add_scaled(
            &q.pl_constraints()[0].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[2].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[3].cost_component(PhaseStatus::Eliminated),
            1.0,
        );
        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected);
    }

    #[test]
    fn test_initialize_phase_pattern_with_current_assignment() {
        let q = create_query();
        let tableau = tableau_with(&[
            (0, -1.0),
            (1, 0.0),
            (2, 1.0),
            (3, 2.0),
            (4, 2.0),
            (5, 2.0),
            (6, 2.0),
            (7, 2.0),
            (8, 1.0),
            (9, 0.0),
        ]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::CurrentAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();

        // Read directly from the assignment: x3 = x5 = 2 tie; the earlier
        // element wins the max.
        let mut expected = AffineForm::new();
        expected.add_scaled(
            &q.pl_constraints()[0].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[1].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[2].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[3].cost_component(PhaseStatus::MaxInput(3)),
            1.0,
        );
        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected);
    }

    #[test]
    fn test_propose_phase_pattern_update_randomly() {
        let q = create_query();
        let tableau = tableau_with(&[(0, -1.0), (2, 1.0), (4, 2.0)]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();
        for id in 0..4 {
            let first = q.pl_constraints()[id].get_all_cases()[0];
            soi.set_phase_status_in_last_accepted_phase_pattern(id, first);
        }

        // r = 1: index 1 % 4 selects relu2, phase (1/4) % 2 = 0 = Active.
        soi.propose_randomly(q.pl_constraints(), 1);
        assert_eq!(soi.constraints_updated_in_last_proposal(), &[1]);

        // r = 7: index 3 selects the max; phase (7/4) % 3 = 1, the second
        // winner case.
        soi.propose_randomly(q.pl_constraints(), 7);
        assert_eq!(soi.constraints_updated_in_last_proposal(), &[3]);
        let mut expected = AffineForm::new();
        for id in 0..3 {
            expected.add_scaled(
                &q.pl_constraints()[id]
                    .cost_component(q.pl_constraints()[id].get_all_cases()[0]),
                1.0,
            );
        }
        expected.add_scaled(
            &q.pl_constraints()[3].cost_component(PhaseStatus::MaxInput(3)),
            1.0,
        );
        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected);

        soi.accept_current_phase_pattern();
        assert_eq!(
            soi.get_last_accepted_soi_phase_pattern(q.pl_constraints()),
            expected
        );
        assert!(soi.constraints_updated_in_last_proposal().is_empty());
    }

    #[test]
    fn test_propose_phase_pattern_update_walksat() {
        let q = create_query();
        let tableau = tableau_with(&[
            (0, -2.0),
            (1, 0.5),
            (2, 1.0),
            (3, 2.0),
            (4, 2.0),
            (5, 2.0),
            (6, 2.5),
            (7, 2.0),
            (8, 0.5),
            (9, 0.5),
        ]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Walksat,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();
        soi.obtain_current_assignment(&tableau);

        soi.set_phase_status_in_last_accepted_phase_pattern(0, PhaseStatus::Active);
        soi.set_phase_status_in_last_accepted_phase_pattern(1, PhaseStatus::Inactive);
        soi.set_phase_status_in_last_accepted_phase_pattern(2, PhaseStatus::Active);
        soi.set_phase_status_in_last_accepted_phase_pattern(3, PhaseStatus::MaxInput(1));

        // Reduced costs: relu1 = 2, relu2 = 1, relu3 = -2, max = 1.5, so
        // relu1 flips first.
        let mut rng = Rng::new(1);
        soi.propose_phase_pattern_update(q.pl_constraints(), &tableau, &mut rng);
        assert_eq!(soi.constraints_updated_in_last_proposal(), &[0]);
        let mut expected = AffineForm::new();
        expected.add_scaled(
            &q.pl_constraints()[0].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[1].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[2].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[3].cost_component(PhaseStatus::MaxInput(1)),
            1.0,
        );
        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected);

        // With x0 at 0 relu1's reduction vanishes and the max's 1.5 wins:
        // its second input takes over.
        let mut tableau = tableau;
        tableau.set_value(0, 0.0);
        soi.propose_phase_pattern_update(q.pl_constraints(), &tableau, &mut rng);
        assert_eq!(soi.constraints_updated_in_last_proposal(), &[3]);
        let mut expected2 = AffineForm::new();
        expected2.add_scaled(
            &q.pl_constraints()[0].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected2.add_scaled(
            &q.pl_constraints()[1].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected2.add_scaled(
            &q.pl_constraints()[2].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected2.add_scaled(
            &q.pl_constraints()[3].cost_component(PhaseStatus::MaxInput(3)),
            1.0,
        );
        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected2);
    }

    #[test]
    fn test_decide_to_accept_current_proposal() {
        let mut config = config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        );
        config.probability_density_parameter = 5.0;
        let soi = SoiManager::new(&config);

        // Improvements are always accepted, no draw needed.
        assert!(soi.accept_with_draw(10.0, 10.0, 0.999));
        let mut rng = Rng::new(3);
        assert!(soi.decide_to_accept_current_proposal(10.0, 9.0, &mut rng));

        // Δ = 0.1 at β = 5: acceptance probability ~ 0.6065.
        assert!(!soi.accept_with_draw(10.0, 10.1, 0.8));
        assert!(soi.accept_with_draw(10.0, 10.1, 0.4));

        // Δ = 0.5: probability ~ 0.082.
        assert!(!soi.accept_with_draw(10.0, 10.5, 0.4));
    }

    #[test]
    fn test_update_current_phase_pattern_for_satisfied_constraints() {
        let q = create_query();
        // relu1 and relu2 satisfied, relu3 and max not.
        let tableau = tableau_with(&[
            (0, -1.0),
            (1, 0.0),
            (2, 1.0),
            (3, 1.0),
            (4, 1.0),
            (5, 1.5),
            (6, 2.5),
            (7, 2.5),
            (8, 1.5),
            (9, 1.0),
        ]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();
        for id in 0..4 {
            let first = q.pl_constraints()[id].get_all_cases()[0];
            soi.set_phase_status_in_current_phase_pattern(id, first);
        }
        soi.update_current_phase_pattern_for_satisfied_pl_constraints(q.pl_constraints());

        let mut expected = AffineForm::new();
        expected.add_scaled(
            &q.pl_constraints()[0].cost_component(PhaseStatus::Inactive),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[1].cost_component(PhaseStatus::Active),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[2]
                .cost_component(q.pl_constraints()[2].get_all_cases()[0]),
            1.0,
        );
        expected.add_scaled(
            &q.pl_constraints()[3]
                .cost_component(q.pl_constraints()[3].get_all_cases()[0]),
            1.0,
        );
        assert_eq!(soi.get_current_soi_phase_pattern(q.pl_constraints()), expected);
    }

    #[test]
    fn test_remove_cost_component() {
        let q = create_query();
        let tableau = tableau_with(&[(0, 1.0), (2, 1.0), (4, 1.0)]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();
        assert_eq!(soi.pattern_size(), 4);
        soi.remove_cost_component(2);
        assert_eq!(soi.pattern_size(), 3);
        let cost = soi.get_current_soi_phase_pattern(q.pl_constraints());
        assert!(!cost.variables().any(|v| v == 4));
    }

    /// SoI cost is zero exactly when every pattern member is satisfied.
    #[test]
    fn test_soi_zero_iff_satisfied() {
        let q = create_query();
        let tableau = tableau_with(&[
            (0, -1.0),
            (1, 0.0),
            (2, 1.0),
            (3, 1.0),
            (4, 2.0),
            (5, 2.0),
            (6, 2.0),
            (7, 2.0),
            (8, 1.0),
            (9, 0.0),
        ]);
        let mut soi = SoiManager::new(&config(
            SoiInitializationStrategy::InputAssignment,
            SoiSearchStrategy::Mcmc,
        ));
        soi.initialize_phase_pattern(q.pl_constraints(), q.network(), &tableau)
            .unwrap();

        let cost = soi.cost_of_pattern(q.pl_constraints(), false);
        let all_satisfied = q
            .pl_constraints()
            .iter()
            .all(|c| c.satisfied(soi.current_assignment()));
        assert!(all_satisfied);
        assert!(num::is_zero(cost));
    }
}
