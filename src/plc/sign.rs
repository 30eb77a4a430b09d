//! Sign constraint: `f = 1` if `b >= 0`, else `f = -1`.

use crate::bounds::Tightening;
use crate::equation::AffineForm;
use crate::error::{Error, Result};
use crate::num;
use crate::tableau::Assignment;

use super::relu::parse_var;
use super::{CaseSplit, Fix, PhaseStatus, WatchedBounds};

#[derive(Clone, Debug)]
pub struct SignConstraint {
    b: usize,
    f: usize,
    phase: PhaseStatus,
    active: bool,
    obsolete: bool,
    bounds: WatchedBounds,
}

impl SignConstraint {
    pub fn new(b: usize, f: usize) -> Self {
        Self {
            b,
            f,
            phase: PhaseStatus::NotFixed,
            active: true,
            obsolete: false,
            bounds: WatchedBounds::default(),
        }
    }

    pub fn b(&self) -> usize {
        self.b
    }

    pub fn f(&self) -> usize {
        self.f
    }

    fn fix_phase(&mut self, phase: PhaseStatus) {
        if self.phase == PhaseStatus::NotFixed {
            self.phase = phase;
        }
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        vec![self.b, self.f]
    }

    pub fn notify_lower_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        let value = if variable == self.f { value.max(-1.0) } else { value };
        if !self.bounds.refine_lb(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;

        if variable == self.b {
            if !num::is_negative(value) {
                self.fix_phase(PhaseStatus::Positive);
                out.push(Tightening::lower(self.f, 1.0));
                out.push(Tightening::upper(self.f, 1.0));
            }
        } else if num::gt(value, -1.0) {
            // The output only takes values in {-1, 1}.
            self.fix_phase(PhaseStatus::Positive);
            out.push(Tightening::lower(self.f, 1.0));
            out.push(Tightening::lower(self.b, 0.0));
        }
        Ok(())
    }

    pub fn notify_upper_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        let value = if variable == self.f { value.min(1.0) } else { value };
        if !self.bounds.refine_ub(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;

        if variable == self.b {
            if num::is_negative(value) {
                self.fix_phase(PhaseStatus::Negative);
                out.push(Tightening::lower(self.f, -1.0));
                out.push(Tightening::upper(self.f, -1.0));
            }
        } else if num::lt(value, 1.0) {
            self.fix_phase(PhaseStatus::Negative);
            out.push(Tightening::upper(self.f, -1.0));
            out.push(Tightening::upper(self.b, 0.0));
        }
        Ok(())
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        if num::is_negative(bv) {
            num::are_equal(fv, -1.0)
        } else {
            num::are_equal(fv, 1.0)
        }
    }

    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        let bv = assignment.value(self.b);
        let target = if num::is_negative(bv) { -1.0 } else { 1.0 };
        vec![Fix {
            variable: self.f,
            value: target,
        }]
    }

    pub fn phase_of_assignment(&self, assignment: &Assignment) -> PhaseStatus {
        if num::is_negative(assignment.value(self.b)) {
            PhaseStatus::Negative
        } else {
            PhaseStatus::Positive
        }
    }

    fn positive_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Positive);
        split.store_bound_tightening(Tightening::lower(self.b, 0.0));
        split.store_bound_tightening(Tightening::lower(self.f, 1.0));
        split.store_bound_tightening(Tightening::upper(self.f, 1.0));
        split
    }

    fn negative_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Negative);
        split.store_bound_tightening(Tightening::upper(self.b, 0.0));
        split.store_bound_tightening(Tightening::lower(self.f, -1.0));
        split.store_bound_tightening(Tightening::upper(self.f, -1.0));
        split
    }

    pub fn case_splits(&self) -> Vec<CaseSplit> {
        vec![self.negative_split(), self.positive_split()]
    }

    pub fn phase_fixed(&self) -> bool {
        self.phase != PhaseStatus::NotFixed
    }

    pub fn valid_case_split(&self) -> CaseSplit {
        debug_assert!(self.phase_fixed());
        if self.phase == PhaseStatus::Positive {
            self.positive_split()
        } else {
            self.negative_split()
        }
    }

    pub fn phase_status(&self) -> PhaseStatus {
        self.phase
    }

    pub(crate) fn set_phase_status(&mut self, phase: PhaseStatus) {
        self.phase = phase;
    }

    pub fn get_all_cases(&self) -> Vec<PhaseStatus> {
        vec![PhaseStatus::Positive, PhaseStatus::Negative]
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        out.push(Tightening::lower(self.f, -1.0));
        out.push(Tightening::upper(self.f, 1.0));
        match self.phase {
            PhaseStatus::Positive => {
                out.push(Tightening::lower(self.f, 1.0));
                out.push(Tightening::lower(self.b, 0.0));
            }
            PhaseStatus::Negative => {
                out.push(Tightening::upper(self.f, -1.0));
                out.push(Tightening::upper(self.b, 0.0));
            }
            _ => {}
        }
    }

    pub fn cost_component(&self, phase: PhaseStatus) -> AffineForm {
        let mut cost = AffineForm::new();
        match phase {
            PhaseStatus::Negative => {
                // f + 1: zero exactly when f = -1.
                cost.add_term(1.0, self.f);
                cost.constant = 1.0;
            }
            _ => {
                // 1 - f: zero exactly when f = 1.
                cost.add_term(-1.0, self.f);
                cost.constant = 1.0;
            }
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

    pub fn serialize(&self) -> String {
        format!("Sign,{},{}", self.f, self.b)
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 || fields[0] != "Sign" {
            return Err(Error::MalformedQuery(format!("bad sign line: {line}")));
        }
        Ok(Self::new(parse_var(fields[2])?, parse_var(fields[1])?))
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
        let sign = SignConstraint::new(0, 1);
        assert!(sign.satisfied(&assignment(&[(0, 3.0), (1, 1.0)])));
        assert!(sign.satisfied(&assignment(&[(0, 0.0), (1, 1.0)])));
        assert!(sign.satisfied(&assignment(&[(0, -3.0), (1, -1.0)])));
        assert!(!sign.satisfied(&assignment(&[(0, 3.0), (1, -1.0)])));
        assert!(!sign.satisfied(&assignment(&[(0, 3.0), (1, 0.5)])));
    }

    #[test]
    fn test_output_lb_above_minus_one_forces_positive() {
        let mut sign = SignConstraint::new(0, 1);
        let mut out = Vec::new();
        sign.notify_lower_bound(1, -0.5, &mut out).unwrap();
        assert_eq!(sign.phase_status(), PhaseStatus::Positive);
        assert!(out.contains(&Tightening::lower(1, 1.0)));
        assert!(out.contains(&Tightening::lower(0, 0.0)));
    }

    #[test]
    fn test_output_ub_below_one_forces_negative() {
        let mut sign = SignConstraint::new(0, 1);
        let mut out = Vec::new();
        sign.notify_upper_bound(1, 0.5, &mut out).unwrap();
        assert_eq!(sign.phase_status(), PhaseStatus::Negative);
        assert!(out.contains(&Tightening::upper(0, 0.0)));
    }

    #[test]
    fn test_negative_b_ub_forces_negative() {
        let mut sign = SignConstraint::new(0, 1);
        let mut out = Vec::new();
        sign.notify_upper_bound(0, -0.1, &mut out).unwrap();
        assert_eq!(sign.phase_status(), PhaseStatus::Negative);
        assert!(out.contains(&Tightening::upper(1, -1.0)));
    }

    #[test]
    fn test_entailed_keeps_output_in_unit_box() {
        let sign = SignConstraint::new(0, 1);
        let mut out = Vec::new();
        sign.entailed_tightenings(&mut out);
        assert!(out.contains(&Tightening::lower(1, -1.0)));
        assert!(out.contains(&Tightening::upper(1, 1.0)));
    }

    #[test]
    fn test_cost_components() {
        let sign = SignConstraint::new(0, 1);
        let pos = sign.cost_component(PhaseStatus::Positive);
        let neg = sign.cost_component(PhaseStatus::Negative);
        assert_eq!(pos.evaluate(|_| 1.0), 0.0);
        assert_eq!(pos.evaluate(|_| -1.0), 2.0);
        assert_eq!(neg.evaluate(|_| -1.0), 0.0);
    }

    #[test]
    fn test_serialize_round_trip() {
        let sign = SignConstraint::new(2, 5);
        assert_eq!(sign.serialize(), "Sign,5,2");
        let parsed = SignConstraint::deserialize("Sign,5,2").unwrap();
        assert_eq!(parsed.b(), 2);
        assert_eq!(parsed.f(), 5);
    }
}
