//! ReLU constraint: `f = max(b, 0)`.

use crate::bounds::Tightening;
use crate::equation::{AffineForm, Equation};
use crate::error::{Error, Result};
use crate::num;
use crate::query::Query;
use crate::tableau::Assignment;

use super::{CaseSplit, Fix, PhaseStatus, WatchedBounds};

#[derive(Clone, Debug)]
pub struct ReluConstraint {
    b: usize,
    f: usize,
    phase: PhaseStatus,
    active: bool,
    obsolete: bool,
    bounds: WatchedBounds,
    /// Slack `aux = f - b >= 0` once transformed.
    aux: Option<usize>,
}

impl ReluConstraint {
    pub fn new(b: usize, f: usize) -> Self {
        Self {
            b,
            f,
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

    /// Phase is fixed at most once; later notifications cannot move it.
    fn fix_phase(&mut self, phase: PhaseStatus) {
        if self.phase == PhaseStatus::NotFixed {
            self.phase = phase;
        }
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        let mut vars = vec![self.b, self.f];
        if let Some(aux) = self.aux {
            vars.push(aux);
        }
        vars
    }

    pub fn notify_lower_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        // The forward value is non-negative regardless of what we heard.
        let value = if variable == self.f { value.max(0.0) } else { value };
        if !self.bounds.refine_lb(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;

        if variable == self.b {
            if !num::is_negative(value) {
                self.fix_phase(PhaseStatus::Active);
            }
            out.push(Tightening::lower(self.f, value.max(0.0)));
        } else if variable == self.f && num::is_positive(value) {
            // f > 0 forces the active piece, so b = f.
            self.fix_phase(PhaseStatus::Active);
            out.push(Tightening::lower(self.b, value));
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
                out.push(Tightening::upper(self.f, 0.0));
            } else {
                out.push(Tightening::upper(self.f, value));
            }
        } else if variable == self.f {
            if !num::is_positive(value) {
                // ub(f) = 0 pins the output to zero and b below zero.
                self.fix_phase(PhaseStatus::Inactive);
                out.push(Tightening::upper(self.b, 0.0));
            } else {
                // b <= max(b, 0) = f.
                out.push(Tightening::upper(self.b, value));
            }
        }
        Ok(())
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        num::are_equal(fv, bv.max(0.0))
    }

    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        vec![
            Fix {
                variable: self.f,
                value: bv.max(0.0),
            },
            Fix {
                variable: self.b,
                value: fv,
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
        if let Some(aux) = self.aux {
            split.store_bound_tightening(Tightening::upper(aux, 0.0));
        } else {
            // b - f = 0
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.b);
            eq.add_addend(-1.0, self.f);
            split.add_equation(eq);
        }
        split
    }

    fn inactive_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Inactive);
        split.store_bound_tightening(Tightening::upper(self.b, 0.0));
        split.store_bound_tightening(Tightening::upper(self.f, 0.0));
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

        out.push(Tightening::lower(self.f, 0.0));
        out.push(Tightening::lower(self.f, b_lb.max(0.0)));
        if num::is_finite(b_ub) {
            out.push(Tightening::upper(self.f, b_ub.max(0.0)));
        }
        if num::is_finite(f_ub) {
            out.push(Tightening::upper(self.b, f_ub));
        }
        if num::is_positive(f_lb) {
            out.push(Tightening::lower(self.b, f_lb));
        }
        match self.phase {
            PhaseStatus::Active => {
                out.push(Tightening::lower(self.b, 0.0_f64.max(f_lb)));
                if num::is_finite(b_lb) {
                    out.push(Tightening::lower(self.f, b_lb));
                }
            }
            PhaseStatus::Inactive => {
                out.push(Tightening::upper(self.b, 0.0));
                out.push(Tightening::upper(self.f, 0.0));
            }
            _ => {}
        }
    }

    pub fn cost_component(&self, phase: PhaseStatus) -> AffineForm {
        let mut cost = AffineForm::new();
        match phase {
            PhaseStatus::Active => {
                // f - b: zero exactly when the identity piece holds.
                cost.add_term(1.0, self.f);
                cost.add_term(-1.0, self.b);
            }
            _ => {
                // f: zero exactly when the output is pinned at zero.
                cost.add_term(1.0, self.f);
            }
        }
        cost
    }

    pub fn eliminate(&mut self, _variable: usize, _fixed_value: f64) {
        // Once any participant is gone the whole constraint is meaningless.
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
        if self.aux == Some(old) {
            self.aux = Some(new);
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
        let aux = query.new_variable();
        let mut eq = Equation::equality();
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, self.b);
        eq.add_addend(-1.0, aux);
        query.add_equation(eq);
        query.set_lower_bound(aux, 0.0);
        self.aux = Some(aux);
    }

    pub fn aux_variables(&self) -> Vec<usize> {
        self.aux.into_iter().collect()
    }

    pub fn serialize(&self) -> String {
        format!("Relu,{},{}", self.f, self.b)
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 || fields[0] != "Relu" {
            return Err(Error::MalformedQuery(format!("bad relu line: {line}")));
        }
        let f = parse_var(fields[1])?;
        let b = parse_var(fields[2])?;
        Ok(Self::new(b, f))
    }
}

pub(super) fn parse_var(token: &str) -> Result<usize> {
    token
        .trim()
        .parse()
        .map_err(|_| Error::MalformedQuery(format!("bad variable index: {token}")))
}

pub(super) fn parse_value(token: &str) -> Result<f64> {
    token
        .trim()
        .parse()
        .map_err(|_| Error::MalformedQuery(format!("bad numeric literal: {token}")))
}
