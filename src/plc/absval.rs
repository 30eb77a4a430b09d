//! Absolute value constraint: `f = |b|`.
//!
//! Tightening follows the case table over the signs of `lb(b)`, `ub(b)`
//! and `lb(f)`:
//!   - both-positive: the `b` and `f` ranges intersect directly;
//!   - straddling zero with `lb(f) = 0`: `lb(b) >= -ub(f)` and
//!     `ub(f) <= max(|lb(b)|, ub(b))`;
//!   - straddling with `lb(f) > 0`: the open interval `(-lb(f), lb(f))`
//!     is forbidden for `b`, expressible once one side drops out;
//!   - both-negative: the ranges intersect after flipping `b`.

use crate::bounds::Tightening;
use crate::equation::{AffineForm, Equation};
use crate::error::{Error, Result};
use crate::num;
use crate::query::Query;
use crate::tableau::Assignment;

use super::relu::parse_var;
use super::{CaseSplit, Fix, PhaseStatus, WatchedBounds};

#[derive(Clone, Debug)]
pub struct AbsConstraint {
    b: usize,
    f: usize,
    phase: PhaseStatus,
    active: bool,
    obsolete: bool,
    bounds: WatchedBounds,
    /// Slacks `aux_pos = f - b >= 0` and `aux_neg = f + b >= 0`.
    aux: Option<(usize, usize)>,
}

impl AbsConstraint {
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
        let value = if variable == self.f { value.max(0.0) } else { value };
        if !self.bounds.refine_lb(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;

        if variable == self.b {
            if !num::is_negative(value) {
                self.fix_phase(PhaseStatus::Positive);
                out.push(Tightening::lower(self.f, value.max(0.0)));
            } else {
                // f = |b| <= max(|lb|, ub); only |lb| is known from here.
                out.push(Tightening::lower(self.f, 0.0));
            }
        } else if variable == self.f {
            // |b| >= lb(f) is disjunctive; only a fixed phase turns it
            // into a single bound.
            match self.phase {
                PhaseStatus::Positive => out.push(Tightening::lower(self.b, value)),
                PhaseStatus::Negative => out.push(Tightening::upper(self.b, -value)),
                _ => {}
            }
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
                self.fix_phase(PhaseStatus::Negative);
                out.push(Tightening::lower(self.f, -value));
                let b_lb = self.bounds.lb(self.b);
                if num::is_finite(b_lb) {
                    out.push(Tightening::upper(self.f, -b_lb));
                }
            } else {
                let b_lb = self.bounds.lb(self.b);
                if num::is_finite(b_lb) {
                    out.push(Tightening::upper(self.f, value.max(-b_lb)));
                }
            }
        } else if variable == self.f {
            if num::is_zero(value) {
                // |b| = 0 pins b; by convention this counts as the
                // non-negative piece.
                self.fix_phase(PhaseStatus::Positive);
                out.push(Tightening::lower(self.b, 0.0));
                out.push(Tightening::upper(self.b, 0.0));
            } else {
                out.push(Tightening::upper(self.b, value));
                out.push(Tightening::lower(self.b, -value));
            }
        }
        Ok(())
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        if num::is_negative(fv) {
            return false;
        }
        num::are_equal(bv.abs(), fv)
    }

    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        let bv = assignment.value(self.b);
        let fv = assignment.value(self.f);
        vec![
            Fix {
                variable: self.b,
                value: fv,
            },
            Fix {
                variable: self.b,
                value: -fv,
            },
            Fix {
                variable: self.f,
                value: bv.abs(),
            },
        ]
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
        if let Some((aux_pos, _)) = self.aux {
            split.store_bound_tightening(Tightening::upper(aux_pos, 0.0));
        } else {
            // b - f = 0
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.b);
            eq.add_addend(-1.0, self.f);
            split.add_equation(eq);
        }
        split
    }

    fn negative_split(&self) -> CaseSplit {
        let mut split = CaseSplit::new(PhaseStatus::Negative);
        split.store_bound_tightening(Tightening::upper(self.b, 0.0));
        if let Some((_, aux_neg)) = self.aux {
            split.store_bound_tightening(Tightening::upper(aux_neg, 0.0));
        } else {
            // b + f = 0
            let mut eq = Equation::equality();
            eq.add_addend(1.0, self.b);
            eq.add_addend(1.0, self.f);
            split.add_equation(eq);
        }
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
        let a = self.bounds.lb(self.b);
        let b = self.bounds.ub(self.b);
        let c = self.bounds.lb(self.f).max(0.0);
        let d = self.bounds.ub(self.f);

        out.push(Tightening::lower(self.f, 0.0));

        if !num::is_negative(a) {
            // Both-positive: ranges intersect directly.
            out.push(Tightening::lower(self.f, a));
            out.push(Tightening::lower(self.b, c));
            if num::is_finite(b) {
                out.push(Tightening::upper(self.f, b));
            }
            if num::is_finite(d) {
                out.push(Tightening::upper(self.b, d));
            }
        } else if !num::is_positive(b) {
            // Both-negative: flip b.
            out.push(Tightening::lower(self.f, -b));
            if num::is_finite(a) {
                out.push(Tightening::upper(self.f, -a));
            }
            if num::is_finite(d) {
                out.push(Tightening::lower(self.b, -d));
            }
            out.push(Tightening::upper(self.b, -c));
        } else {
            // Straddling zero.
            if num::is_finite(d) {
                out.push(Tightening::lower(self.b, -d));
                out.push(Tightening::upper(self.b, d));
            }
            if num::is_finite(a) && num::is_finite(b) {
                out.push(Tightening::upper(self.f, (-a).max(b)));
            }
            if num::is_positive(c) {
                // The interval (-c, c) is forbidden; if one side is already
                // out of reach the other becomes a bound.
                if num::lt(-a, c) {
                    out.push(Tightening::lower(self.b, c));
                }
                if num::lt(b, c) {
                    out.push(Tightening::upper(self.b, -c));
                }
            }
        }
    }

    pub fn cost_component(&self, phase: PhaseStatus) -> AffineForm {
        let mut cost = AffineForm::new();
        cost.add_term(1.0, self.f);
        match phase {
            PhaseStatus::Negative => cost.add_term(1.0, self.b),
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
        let aux_pos = query.new_variable();
        let mut eq = Equation::equality();
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, self.b);
        eq.add_addend(-1.0, aux_pos);
        query.add_equation(eq);
        query.set_lower_bound(aux_pos, 0.0);

        let aux_neg = query.new_variable();
        let mut eq = Equation::equality();
        eq.add_addend(1.0, self.f);
        eq.add_addend(1.0, self.b);
        eq.add_addend(-1.0, aux_neg);
        query.add_equation(eq);
        query.set_lower_bound(aux_neg, 0.0);

        self.aux = Some((aux_pos, aux_neg));
    }

    pub fn aux_variables(&self) -> Vec<usize> {
        match self.aux {
            Some((p, n)) => vec![p, n],
            None => Vec::new(),
        }
    }

    pub fn serialize(&self) -> String {
        format!("Abs,{},{}", self.f, self.b)
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 || fields[0] != "Abs" {
            return Err(Error::MalformedQuery(format!("bad abs line: {line}")));
        }
        Ok(Self::new(parse_var(fields[2])?, parse_var(fields[1])?))
    }
}
