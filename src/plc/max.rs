//! Max constraint: `f = max(elements)`.
//!
//! Every element carries one auxiliary slack `aux_e = f - e >= 0` once the
//! constraint has been transformed; a case split "element e wins" is then
//! the single bound `aux_e <= 0`. Elements whose upper bound falls below
//! the output's lower bound cannot win and are pruned; elements eliminated
//! by preprocessing fold into a running `max_eliminated` value, and a
//! constraint whose every element is gone degenerates into
//! `f = max_eliminated`.

use std::collections::BTreeMap;

use crate::bounds::Tightening;
use crate::equation::{AffineForm, Equation};
use crate::error::{Error, Result};
use crate::num;
use crate::query::Query;
use crate::tableau::Assignment;

use super::relu::parse_var;
use super::{CaseSplit, Fix, PhaseStatus, WatchedBounds};

#[derive(Clone, Debug)]
pub struct MaxConstraint {
    f: usize,
    elements: Vec<usize>,
    /// Element variable -> its slack variable.
    aux: BTreeMap<usize, usize>,
    phase: PhaseStatus,
    active: bool,
    obsolete: bool,
    bounds: WatchedBounds,
    /// Largest value among eliminated elements.
    max_eliminated: f64,
    have_eliminated: bool,
}

impl MaxConstraint {
    pub fn new(f: usize, elements: Vec<usize>) -> Self {
        Self {
            f,
            elements,
            aux: BTreeMap::new(),
            phase: PhaseStatus::NotFixed,
            active: true,
            obsolete: false,
            bounds: WatchedBounds::default(),
            max_eliminated: num::negative_infinity(),
            have_eliminated: false,
        }
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn elements(&self) -> &[usize] {
        &self.elements
    }

    pub fn max_eliminated_value(&self) -> f64 {
        self.max_eliminated
    }

    fn fix_phase(&mut self, phase: PhaseStatus) {
        if self.phase == PhaseStatus::NotFixed {
            self.phase = phase;
        }
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        let mut vars = vec![self.f];
        vars.extend(self.elements.iter().copied());
        vars.extend(self.aux.values().copied());
        vars
    }

    /// Drop an element that can no longer be the maximum.
    fn prune_element(&mut self, element: usize) {
        self.elements.retain(|&e| e != element);
        self.aux.remove(&element);
        self.bounds.forget(element);
    }

    /// Re-derive the phase after the element set shrank.
    fn maybe_fix_after_pruning(&mut self) {
        if self.phase != PhaseStatus::NotFixed {
            return;
        }
        if self.elements.is_empty() {
            self.phase = PhaseStatus::Eliminated;
        } else if self.elements.len() == 1 {
            let last = self.elements[0];
            if !self.have_eliminated || num::gte(self.bounds.lb(last), self.max_eliminated) {
                self.phase = PhaseStatus::MaxInput(last);
            }
        }
    }

    pub fn notify_lower_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        if !self.bounds.refine_lb(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;

        if variable == self.f {
            // Anything bounded strictly below the output cannot win.
            let doomed: Vec<usize> = self
                .elements
                .iter()
                .copied()
                .filter(|&e| self.bounds.has_ub(e) && num::lt(self.bounds.ub(e), value))
                .collect();
            for e in doomed {
                self.prune_element(e);
            }
            self.maybe_fix_after_pruning();
            if self.elements.is_empty() {
                // Only the eliminated pool remains: f is pinned.
                if self.have_eliminated {
                    out.push(Tightening::upper(self.f, self.max_eliminated));
                } else {
                    return Err(Error::InfeasibleBounds {
                        variable: self.f,
                        lower: value,
                        upper: self.bounds.ub(self.f),
                    });
                }
            }
        } else if self.elements.contains(&variable) {
            // f >= element.
            out.push(Tightening::lower(self.f, value));
        }
        Ok(())
    }

    pub fn notify_upper_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        if !self.bounds.refine_ub(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;

        if variable == self.f {
            for &e in &self.elements {
                out.push(Tightening::upper(e, value));
            }
        } else if self.elements.contains(&variable) {
            let f_lb = self.bounds.lb(self.f);
            if self.bounds.has_lb(self.f) && num::lt(value, f_lb) {
                self.prune_element(variable);
                self.maybe_fix_after_pruning();
            }
            // The output cannot exceed the largest element bound.
            let mut sup = self.max_eliminated;
            let mut all_bounded = self.have_eliminated || !self.elements.is_empty();
            for &e in &self.elements {
                if self.bounds.has_ub(e) {
                    sup = sup.max(self.bounds.ub(e));
                } else {
                    all_bounded = false;
                }
            }
            if all_bounded && num::is_finite(sup) {
                out.push(Tightening::upper(self.f, sup));
            }
        }
        Ok(())
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        let fv = assignment.value(self.f);
        let mut target = self.max_eliminated;
        for &e in &self.elements {
            target = target.max(assignment.value(e));
        }
        num::are_equal(fv, target)
    }

    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        let mut fixes = Vec::new();
        let mut target = self.max_eliminated;
        let mut witness = None;
        for &e in &self.elements {
            let v = assignment.value(e);
            if v > target {
                target = v;
                witness = Some(e);
            }
        }
        fixes.push(Fix {
            variable: self.f,
            value: target,
        });
        if let Some(e) = witness {
            fixes.push(Fix {
                variable: e,
                value: assignment.value(self.f),
            });
        }
        fixes
    }

    pub fn phase_of_assignment(&self, assignment: &Assignment) -> PhaseStatus {
        let mut best = self.max_eliminated;
        let mut phase = PhaseStatus::Eliminated;
        for &e in &self.elements {
            let v = assignment.value(e);
            if v > best {
                best = v;
                phase = PhaseStatus::MaxInput(e);
            }
        }
        if phase == PhaseStatus::Eliminated && !self.have_eliminated {
            // No eliminated pool to fall back on; pick the first element.
            self.elements
                .first()
                .map(|&e| PhaseStatus::MaxInput(e))
                .unwrap_or(PhaseStatus::Eliminated)
        } else {
            phase
        }
    }

    fn winner_split(&self, element: usize) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::MaxInput(element));
        if let Some(&aux) = self.aux.get(&element) {
            split.store_bound_tightening(Tightening::upper(aux, 0.0));
        } else {
            // f = element, and element dominates every other element.
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.f);
            eq.add_addend(-1.0, element);
            split.add_equation(eq);
            for &other in &self.elements {
                if other != element {
                    let mut ge = Equation::new(crate::equation::Relation::Ge);
                    ge.add_addend(1.0, element);
                    ge.add_addend(-1.0, other);
                    split.add_equation(ge);
                }
            }
        }
        if self.have_eliminated {
            split.store_bound_tightening(Tightening::lower(element, self.max_eliminated));
        }
        split
    }

    fn eliminated_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Eliminated);
        split.store_bound_tightening(Tightening::lower(self.f, self.max_eliminated));
        split.store_bound_tightening(Tightening::upper(self.f, self.max_eliminated));
        for &e in &self.elements {
            split.store_bound_tightening(Tightening::upper(e, self.max_eliminated));
        }
        split
    }

    pub fn case_splits(&self) -> Vec<CaseSplit> {
        let mut splits: Vec<CaseSplit> = self
            .elements
            .iter()
            .map(|&e| self.winner_split(e))
            .collect();
        if self.have_eliminated {
            splits.push(self.eliminated_split());
        }
        splits
    }

    pub fn phase_fixed(&self) -> bool {
        self.phase != PhaseStatus::NotFixed
    }

    pub fn valid_case_split(&self) -> CaseSplit {
        debug_assert!(self.phase_fixed());
        match self.phase {
            PhaseStatus::MaxInput(e) => self.winner_split(e),
            _ => self.eliminated_split(),
        }
    }

    pub fn phase_status(&self) -> PhaseStatus {
        self.phase
    }

    pub(crate) fn set_phase_status(&mut self, phase: PhaseStatus) {
        self.phase = phase;
    }

    pub fn get_all_cases(&self) -> Vec<PhaseStatus> {
        let mut cases: Vec<PhaseStatus> = self
            .elements
            .iter()
            .map(|&e| PhaseStatus::MaxInput(e))
            .collect();
        if self.have_eliminated {
            cases.push(PhaseStatus::Eliminated);
        }
        cases
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let f_ub = self.bounds.ub(self.f);

        let mut lb_sup = self.max_eliminated;
        let mut ub_sup = self.max_eliminated;
        let mut every_element_bounded = true;
        for &e in &self.elements {
            lb_sup = lb_sup.max(self.bounds.lb(e));
            if self.bounds.has_ub(e) {
                ub_sup = ub_sup.max(self.bounds.ub(e));
            } else {
                every_element_bounded = false;
            }
            // No element exceeds the output.
            if num::is_finite(f_ub) {
                out.push(Tightening::upper(e, f_ub));
            }
        }
        if num::is_finite(lb_sup) {
            out.push(Tightening::lower(self.f, lb_sup));
        }
        if every_element_bounded && num::is_finite(ub_sup) {
            out.push(Tightening::upper(self.f, ub_sup));
        }
    }

    pub fn cost_component(&self, phase: PhaseStatus) -> AffineForm {
        let mut cost = AffineForm::new();
        cost.add_term(1.0, self.f);
        match phase {
            PhaseStatus::MaxInput(e) => cost.add_term(-1.0, e),
            _ => cost.constant = -self.max_eliminated,
        }
        cost
    }

    pub fn eliminate(&mut self, variable: usize, fixed_value: f64) {
        if variable == self.f {
            self.obsolete = true;
            return;
        }
        if self.elements.contains(&variable) {
            self.max_eliminated = self.max_eliminated.max(fixed_value);
            self.have_eliminated = true;
            self.prune_element(variable);
            self.maybe_fix_after_pruning();
        }
        let slack_of = self
            .aux
            .iter()
            .find(|(_, &a)| a == variable)
            .map(|(&e, _)| e);
        if let Some(element) = slack_of {
            // The slack was fixed: zero pins its element as the winner.
            if num::is_zero(fixed_value) {
                self.fix_phase(PhaseStatus::MaxInput(element));
            }
            self.aux.remove(&element);
        }
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        self.bounds.update_index(old, new);
        if self.f == old {
            self.f = new;
        }
        for e in &mut self.elements {
            if *e == old {
                *e = new;
            }
        }
        let mut renamed = BTreeMap::new();
        for (element, aux) in std::mem::take(&mut self.aux) {
            let element = if element == old { new } else { element };
            let aux = if aux == old { new } else { aux };
            renamed.insert(element, aux);
        }
        self.aux = renamed;
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// One slack per element; an element equal to the output makes the
    /// whole constraint redundant once the slacks are in place.
    pub fn transform_to_use_aux_variables(&mut self, query: &mut Query) {
        if !self.aux.is_empty() {
            return;
        }
        let mut output_among_elements = false;
        for &e in &self.elements.clone() {
            if e == self.f {
                output_among_elements = true;
                continue;
            }
            let aux = query.new_variable();
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.f);
            eq.add_addend(-1.0, e);
            eq.add_addend(-1.0, aux);
            query.add_equation(eq);
            query.set_lower_bound(aux, 0.0);
            self.aux.insert(e, aux);
        }
        if output_among_elements {
            // f = max(f, ...) reduces to f >= every other element, which the
            // slacks now say on their own.
            self.obsolete = true;
        }
    }

    pub fn aux_variables(&self) -> Vec<usize> {
        self.aux.values().copied().collect()
    }

    pub fn serialize(&self) -> String {
        let elements: Vec<String> = self.elements.iter().map(|e| e.to_string()).collect();
        format!(
            "Max,{},{},{}",
            self.f,
            self.elements.len(),
            elements.join(",")
        )
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 3 || fields[0] != "Max" {
            return Err(Error::MalformedQuery(format!("bad max line: {line}")));
        }
        let f = parse_var(fields[1])?;
        let count: usize = fields[2]
            .parse()
            .map_err(|_| Error::MalformedQuery(format!("bad max count: {line}")))?;
        if fields.len() != 3 + count {
            return Err(Error::MalformedQuery(format!(
                "max element count mismatch: {line}"
            )));
        }
        let elements = fields[3..]
            .iter()
            .map(|t| parse_var(t))
            .collect::<Result<Vec<usize>>>()?;
        Ok(Self::new(f, elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(pairs: &[(usize, f64)]) -> Assignment {
        let mut a = Assignment::new();
        for &(v, x) in pairs {
            a.set(v, x);
        }
        a
    }

    #[test]
    fn test_satisfied() {
        let max = MaxConstraint::new(3, vec![0, 1, 2]);
        assert!(max.satisfied(&assignment(&[(0, 1.0), (1, 5.0), (2, -1.0), (3, 5.0)])));
        assert!(!max.satisfied(&assignment(&[(0, 1.0), (1, 5.0), (2, -1.0), (3, 1.0)])));
    }

    #[test]
    fn test_entailed_bounds() {
        let mut max = MaxConstraint::new(2, vec![0, 1]);
        let mut out = Vec::new();
        max.notify_lower_bound(0, 4.0, &mut out).unwrap();
        max.notify_upper_bound(0, 9.0, &mut out).unwrap();
        max.notify_lower_bound(1, -1.0, &mut out).unwrap();
        max.notify_upper_bound(1, 2.0, &mut out).unwrap();
        out.clear();
        max.entailed_tightenings(&mut out);
        assert!(out.contains(&Tightening::lower(2, 4.0)));
        assert!(out.contains(&Tightening::upper(2, 9.0)));
    }

    #[test]
    fn test_element_pruned_when_below_output() {
        let mut max = MaxConstraint::new(2, vec![0, 1]);
        let mut out = Vec::new();
        max.notify_upper_bound(1, 2.0, &mut out).unwrap();
        max.notify_lower_bound(2, 5.0, &mut out).unwrap();
        // Element 1 tops out at 2 < lb(f) = 5: it cannot win.
        assert_eq!(max.elements(), &[0]);
        // A single remaining element fixes the phase.
        assert_eq!(max.phase_status(), PhaseStatus::MaxInput(0));
    }

    #[test]
    fn test_eliminate_element_folds_into_constant() {
        let mut max = MaxConstraint::new(3, vec![0, 1, 2]);
        max.eliminate(1, 7.0);
        assert_eq!(max.elements(), &[0, 2]);
        assert!(num::are_equal(max.max_eliminated_value(), 7.0));
        let cases = max.get_all_cases();
        assert_eq!(
            cases,
            vec![
                PhaseStatus::MaxInput(0),
                PhaseStatus::MaxInput(2),
                PhaseStatus::Eliminated
            ]
        );
        let cost = max.cost_component(PhaseStatus::Eliminated);
        assert!(num::is_zero(cost.evaluate(|_| 7.0)));
    }

    #[test]
    fn test_eliminate_output_makes_obsolete() {
        let mut max = MaxConstraint::new(3, vec![0, 1]);
        max.eliminate(3, 1.0);
        assert!(max.is_obsolete());
    }

    #[test]
    fn test_case_splits_enumerate_winners() {
        let max = MaxConstraint::new(3, vec![0, 1, 2]);
        let splits = max.case_splits();
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].phase, PhaseStatus::MaxInput(0));
        // Without aux slacks the winner split pins f = element and
        // dominates the other two.
        assert_eq!(splits[0].equations.len(), 3);
    }

    #[test]
    fn test_update_index_then_eliminate_stays_consistent() {
        // Regression for the merge/eliminate interaction: renaming an
        // element and then eliminating the renamed variable must leave the
        // participant list in terms of the new index map.
        let mut max = MaxConstraint::new(4, vec![0, 1, 2]);
        max.update_index(1, 9);
        assert!(max.participating_variables().contains(&9));
        max.eliminate(9, 3.0);
        let vars = max.participating_variables();
        assert!(!vars.contains(&9));
        assert!(!vars.contains(&1));
        assert!(num::are_equal(max.max_eliminated_value(), 3.0));
    }

    #[test]
    fn test_serialize_round_trip() {
        let max = MaxConstraint::new(6, vec![1, 3, 5]);
        let line = max.serialize();
        assert_eq!(line, "Max,6,3,1,3,5");
        let parsed = MaxConstraint::deserialize(&line).unwrap();
        assert_eq!(parsed.f(), 6);
        assert_eq!(parsed.elements(), &[1, 3, 5]);
    }
}
