//! Leaky ReLU constraint: `f = b` if `b >= 0`, else `f = α·b`, `α ∈ (0, 1)`.
//!
//! The map is strictly increasing, so bound propagation in both directions
//! is a monotone image: `map(x) = x >= 0 ? x : α·x`, inverse
//! `x >= 0 ? x : x/α`.

use crate::bounds::Tightening;
use crate::equation::{AffineForm, Equation};
use crate::error::{Error, Result};
use crate::num;
use crate::query::Query;
use crate::tableau::Assignment;

use super::relu::{parse_value, parse_var};
use super::{CaseSplit, Fix, PhaseStatus, WatchedBounds};

#[derive(Clone, Debug)]
pub struct LeakyReluConstraint {
    b: usize,
    f: usize,
    alpha: f64,
    phase: PhaseStatus,
    active: bool,
    obsolete: bool,
    bounds: WatchedBounds,
    /// Slacks `f - b >= 0` and `f - α·b >= 0`.
    aux: Option<(usize, usize)>,
}

impl LeakyReluConstraint {
    pub fn new(b: usize, f: usize, alpha: f64) -> Self {
        debug_assert!(alpha > 0.0 && alpha < 1.0);
        Self {
            b,
            f,
            alpha,
            phase: PhaseStatus::NotFixed,
            active: true,
            obsolete: false,
            bounds: WatchedBounds::default(),
            aux: None,
        }
    }

    pub fn b(&self) -> usize {
        self.b
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    fn map(&self, x: f64) -> f64 {
        if x >= 0.0 {
            x
        } else {
            self.alpha * x
        }
    }

    fn inverse_map(&self, y: f64) -> f64 {
        if y >= 0.0 {
            y
        } else {
            y / self.alpha
        }
    }

    fn fix_phase(&mut self, phase: PhaseStatus) {
        if self.phase == PhaseStatus::NotFixed {
            self.phase = phase;
        }
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        let mut vars = vec![self.b, self.f];
        if let Some((p, n)) = self.aux {
            vars.push(p);
            vars.push(n);
        }
        vars
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

        if variable == self.b {
            if !num::is_negative(value) {
                self.fix_phase(PhaseStatus::Active);
            }
            out.push(Tightening::lower(self.f, self.map(value)));
        } else {
            if num::is_positive(value) {
                self.fix_phase(PhaseStatus::Active);
            }
            out.push(Tightening::lower(self.b, self.inverse_map(value)));
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

        if variable == self.b {
            if !num::is_positive(value) {
                self.fix_phase(PhaseStatus::Inactive);
            }
            out.push(Tightening::upper(self.f, self.map(value)));
        } else {
            if num::is_negative(value) {
                self.fix_phase(PhaseStatus::Inactive);
            }
            out.push(Tightening::upper(self.b, self.inverse_map(value)));
        }
        Ok(())
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        num::are_equal(fv, self.map(bv))
    }

    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        vec![
            Fix {
                variable: self.f,
                value: self.map(bv),
            },
            Fix {
                variable: self.b,
                value: self.inverse_map(fv),
            },
        ]
    }

    pub fn phase_of_assignment(&self, assignment: &Assignment) -> PhaseStatus {
        if num::is_negative(assignment.value(self.b)) {
            PhaseStatus::Inactive
        } else {
            PhaseStatus::Active
        }
    }

    fn active_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Active);
        split.store_bound_tightening(Tightening::lower(self.b, 0.0));
        if let Some((aux_active, _)) = self.aux {
            split.store_bound_tightening(Tightening::upper(aux_active, 0.0));
        } else {
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.f);
            eq.add_addend(-1.0, self.b);
            split.add_equation(eq);
        }
        split
    }

    fn inactive_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Inactive);
        split.store_bound_tightening(Tightening::upper(self.b, 0.0));
        if let Some((_, aux_inactive)) = self.aux {
            split.store_bound_tightening(Tightening::upper(aux_inactive, 0.0));
        } else {
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.f);
            eq.add_addend(-self.alpha, self.b);
            split.add_equation(eq);
        }
        split
    }

    pub fn case_splits(&self) -> Vec<CaseSplit> {
        vec![self.active_split(), self.inactive_split()]
    }

    pub fn phase_fixed(&self) -> bool {
        self.phase != PhaseStatus::NotFixed
    }

    pub fn valid_case_split(&self) -> CaseSplit {
        debug_assert!(self.phase_fixed());
        if self.phase == PhaseStatus::Active {
            self.active_split()
        } else {
            self.inactive_split()
        }
    }

    pub fn phase_status(&self) -> PhaseStatus {
        self.phase
    }

    pub(crate) fn set_phase_status(&mut self, phase: PhaseStatus) {
        self.phase = phase;
    }

    pub fn get_all_cases(&self) -> Vec<PhaseStatus> {
        vec![PhaseStatus::Active, PhaseStatus::Inactive]
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let b_lb = self.bounds.lb(self.b);
        let b_ub = self.bounds.ub(self.b);
        let f_lb = self.bounds.lb(self.f);
        let f_ub = self.bounds.ub(self.f);

        if num::is_finite(b_lb) {
            out.push(Tightening::lower(self.f, self.map(b_lb)));
        }
        if num::is_finite(b_ub) {
            out.push(Tightening::upper(self.f, self.map(b_ub)));
        }
        if num::is_finite(f_lb) {
            out.push(Tightening::lower(self.b, self.inverse_map(f_lb)));
        }
        if num::is_finite(f_ub) {
            out.push(Tightening::upper(self.b, self.inverse_map(f_ub)));
        }
    }

    pub fn cost_component(&self, phase: PhaseStatus) -> AffineForm {
        let mut cost = AffineForm::new();
        cost.add_term(1.0, self.f);
        match phase {
            PhaseStatus::Inactive => cost.add_term(-self.alpha, self.b),
            _ => cost.add_term(-1.0, self.b),
        }
        cost
    }

    pub fn eliminate(&mut self, _variable: usize, _fixed_value: f64) {
        self.obsolete = true;
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        self.bounds.update_index(old, new);
        if self.b == old {
            self.b = new;
        }
        if self.f == old {
            self.f = new;
        }
        if let Some((p, n)) = self.aux {
            self.aux = Some((
                if p == old { new } else { p },
                if n == old { new } else { n },
            ));
        }
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

    pub fn transform_to_use_aux_variables(&mut self, query: &mut Query) {
        if self.aux.is_some() {
            return;
        }
        let aux_active = query.new_variable();
        let mut eq = Equation::equality();
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, self.b);
        eq.add_addend(-1.0, aux_active);
        query.add_equation(eq);
        query.set_lower_bound(aux_active, 0.0);

        let aux_inactive = query.new_variable();
        let mut eq = Equation::equality();
        eq.add_addend(1.0, self.f);
        eq.add_addend(-self.alpha, self.b);
        eq.add_addend(-1.0, aux_inactive);
        query.add_equation(eq);
        query.set_lower_bound(aux_inactive, 0.0);

        self.aux = Some((aux_active, aux_inactive));
    }

    pub fn aux_variables(&self) -> Vec<usize> {
        match self.aux {
            Some((p, n)) => vec![p, n],
            None => Vec::new(),
        }
    }

    pub fn serialize(&self) -> String {
        format!("LeakyRelu,{},{},{}", self.f, self.b, self.alpha)
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 4 || fields[0] != "LeakyRelu" {
            return Err(Error::MalformedQuery(format!(
                "bad leaky relu line: {line}"
            )));
        }
        Ok(Self::new(
            parse_var(fields[2])?,
            parse_var(fields[1])?,
            parse_value(fields[3])?,
        ))
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
        let leaky = LeakyReluConstraint::new(0, 1, 0.1);
        assert!(leaky.satisfied(&assignment(&[(0, 2.0), (1, 2.0)])));
        assert!(leaky.satisfied(&assignment(&[(0, -2.0), (1, -0.2)])));
        assert!(!leaky.satisfied(&assignment(&[(0, -2.0), (1, 0.0)])));
    }

    #[test]
    fn test_bounds_map_through_slope() {
        let mut leaky = LeakyReluConstraint::new(0, 1, 0.2);
        let mut out = Vec::new();
        leaky.notify_lower_bound(0, -10.0, &mut out).unwrap();
        leaky.notify_upper_bound(0, 5.0, &mut out).unwrap();
        assert!(out.contains(&Tightening::lower(1, -2.0)));
        assert!(out.contains(&Tightening::upper(1, 5.0)));
    }

    #[test]
    fn test_inverse_map_from_output() {
        let mut leaky = LeakyReluConstraint::new(0, 1, 0.5);
        let mut out = Vec::new();
        leaky.notify_upper_bound(1, -1.0, &mut out).unwrap();
        assert_eq!(leaky.phase_status(), PhaseStatus::Inactive);
        assert!(out.contains(&Tightening::upper(0, -2.0)));
    }

    #[test]
    fn test_cost_components() {
        let leaky = LeakyReluConstraint::new(0, 1, 0.1);
        let inactive = leaky.cost_component(PhaseStatus::Inactive);
        // b = -2, f = -0.2 is exactly the inactive piece.
        assert!(num::is_zero(
            inactive.evaluate(|v| [-2.0, -0.2][v])
        ));
    }

    #[test]
    fn test_serialize_round_trip() {
        let leaky = LeakyReluConstraint::new(3, 4, 0.01);
        let parsed = LeakyReluConstraint::deserialize(&leaky.serialize()).unwrap();
        assert_eq!(parsed.b(), 3);
        assert_eq!(parsed.f(), 4);
        assert!(num::are_equal(parsed.alpha(), 0.01));
    }
}
