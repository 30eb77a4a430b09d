//! Disjunction over bound-only case splits.
//!
//! The disjuncts are supplied at construction and never change; bound
//! notifications only prune disjuncts that have become unreachable. The
//! constraint never fixes a phase through propagation, so `case_splits`
//! stays legal for its whole lifetime.

use crate::bounds::{BoundType, Tightening};
use crate::equation::AffineForm;
use crate::error::{Error, Result};
use crate::num;
use crate::tableau::Assignment;

use super::relu::{parse_value, parse_var};
use super::{CaseSplit, Fix, PhaseStatus, WatchedBounds};

#[derive(Clone, Debug)]
pub struct DisjunctionConstraint {
    cases: Vec<CaseSplit>,
    active: bool,
    obsolete: bool,
    bounds: WatchedBounds,
}

impl DisjunctionConstraint {
    pub fn new(mut cases: Vec<CaseSplit>) -> Self {
        for (i, case) in cases.iter_mut().enumerate() {
            case.phase = PhaseStatus::CaseIndex(i);
        }
        Self {
            cases,
            active: true,
            obsolete: false,
            bounds: WatchedBounds::default(),
        }
    }

    pub fn cases(&self) -> &[CaseSplit] {
        &self.cases
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        let mut vars = Vec::new();
        for case in &self.cases {
            for t in &case.bounds {
                if !vars.contains(&t.variable) {
                    vars.push(t.variable);
                }
            }
        }
        vars
    }

    /// A disjunct is unreachable when one of its bounds contradicts the
    /// variable's current interval.
    fn case_reachable(&self, case: &CaseSplit) -> bool {
        case.bounds.iter().all(|t| match t.bound {
            BoundType::Lower => !num::gt(t.value, self.bounds.ub(t.variable)),
            BoundType::Upper => !num::lt(t.value, self.bounds.lb(t.variable)),
        })
    }

    pub fn notify_lower_bound(
        &mut self,
        variable: usize,
        value: f64,
        _out: &mut Vec<Tightening>,
    ) -> Result<()> {
        if self.bounds.refine_lb(variable, value) {
            self.bounds.check_feasible(variable)?;
        }
        Ok(())
    }

    pub fn notify_upper_bound(
        &mut self,
        variable: usize,
        value: f64,
        _out: &mut Vec<Tightening>,
    ) -> Result<()> {
        if self.bounds.refine_ub(variable, value) {
            self.bounds.check_feasible(variable)?;
        }
        Ok(())
    }

    fn case_holds(case: &CaseSplit, assignment: &Assignment) -> bool {
        case.bounds.iter().all(|t| match t.bound {
            BoundType::Lower => num::gte(assignment.value(t.variable), t.value),
            BoundType::Upper => num::lte(assignment.value(t.variable), t.value),
        })
    }

    /// Satisfied iff any disjunct's bounds all hold.
    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        self.cases.iter().any(|c| Self::case_holds(c, assignment))
    }

    pub fn possible_fixes(&self, assignment: &Assignment) -> Vec<Fix> {
        // Repair toward the disjunct with the fewest violated bounds.
        let mut best: Option<(usize, &CaseSplit)> = None;
        for case in &self.cases {
            let violated = case
                .bounds
                .iter()
                .filter(|t| match t.bound {
                    BoundType::Lower => !num::gte(assignment.value(t.variable), t.value),
                    BoundType::Upper => !num::lte(assignment.value(t.variable), t.value),
                })
                .count();
            if best.map(|(v, _)| violated < v).unwrap_or(true) {
                best = Some((violated, case));
            }
        }
        let Some((_, case)) = best else {
            return Vec::new();
        };
        case.bounds
            .iter()
            .filter(|t| match t.bound {
                BoundType::Lower => !num::gte(assignment.value(t.variable), t.value),
                BoundType::Upper => !num::lte(assignment.value(t.variable), t.value),
            })
            .map(|t| Fix {
                variable: t.variable,
                value: t.value,
            })
            .collect()
    }

    pub fn phase_of_assignment(&self, assignment: &Assignment) -> PhaseStatus {
        for (i, case) in self.cases.iter().enumerate() {
            if Self::case_holds(case, assignment) {
                return PhaseStatus::CaseIndex(i);
            }
        }
        PhaseStatus::NotFixed
    }

    pub fn case_splits(&self) -> Vec<CaseSplit> {
        self.cases
            .iter()
            .filter(|c| self.case_reachable(c))
            .cloned()
            .collect()
    }

    /// Bound propagation never fixes a disjunction.
    pub fn phase_fixed(&self) -> bool {
        false
    }

    pub fn valid_case_split(&self) -> CaseSplit {
        debug_assert!(false, "disjunction has no fixed phase");
        CaseSplit::new(PhaseStatus::NotFixed)
    }

    pub fn phase_status(&self) -> PhaseStatus {
        PhaseStatus::NotFixed
    }

    pub fn get_all_cases(&self) -> Vec<PhaseStatus> {
        (0..self.cases.len()).map(PhaseStatus::CaseIndex).collect()
    }

    /// The hull of the disjuncts: a variable bounded the same way in every
    /// disjunct is bounded by the loosest of those bounds.
    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        for v in self.participating_variables() {
            let mut hull_lb = num::infinity();
            let mut hull_ub = num::negative_infinity();
            let mut lb_everywhere = true;
            let mut ub_everywhere = true;
            for case in &self.cases {
                let lb = case
                    .bounds
                    .iter()
                    .filter(|t| t.variable == v && t.bound == BoundType::Lower)
                    .map(|t| t.value)
                    .fold(num::negative_infinity(), f64::max);
                let ub = case
                    .bounds
                    .iter()
                    .filter(|t| t.variable == v && t.bound == BoundType::Upper)
                    .map(|t| t.value)
                    .fold(num::infinity(), f64::min);
                if num::is_finite(lb) {
                    hull_lb = hull_lb.min(lb);
                } else {
                    lb_everywhere = false;
                }
                if num::is_finite(ub) {
                    hull_ub = hull_ub.max(ub);
                } else {
                    ub_everywhere = false;
                }
            }
            if lb_everywhere && num::is_finite(hull_lb) {
                out.push(Tightening::lower(v, hull_lb));
            }
            if ub_everywhere && num::is_finite(hull_ub) {
                out.push(Tightening::upper(v, hull_ub));
            }
        }
    }

    /// Disjunctions carry no SoI cost; the search never selects them.
    pub fn cost_component(&self, _phase: PhaseStatus) -> AffineForm {
        AffineForm::new()
    }

    pub fn eliminate(&mut self, variable: usize, fixed_value: f64) {
        // Disjuncts contradicting the fixed value drop out; surviving ones
        // stop mentioning the variable.
        self.cases.retain(|case| {
            case.bounds.iter().all(|t| {
                t.variable != variable
                    || match t.bound {
                        BoundType::Lower => num::gte(fixed_value, t.value),
                        BoundType::Upper => num::lte(fixed_value, t.value),
                    }
            })
        });
        for case in &mut self.cases {
            case.bounds.retain(|t| t.variable != variable);
        }
        self.cases.retain(|case| !case.bounds.is_empty());
        if self.cases.is_empty() {
            self.obsolete = true;
        }
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        self.bounds.update_index(old, new);
        for case in &mut self.cases {
            for t in &mut case.bounds {
                if t.variable == old {
                    t.variable = new;
                }
            }
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

    /// `Disjunction,<n>` then per case `,<k>` and `k` times `,l|u,var,value`.
    pub fn serialize(&self) -> String {
        let mut line = format!("Disjunction,{}", self.cases.len());
        for case in &self.cases {
            line.push_str(&format!(",{}", case.bounds.len()));
            for t in &case.bounds {
                let side = match t.bound {
                    BoundType::Lower => "l",
                    BoundType::Upper => "u",
                };
                line.push_str(&format!(",{},{},{}", side, t.variable, t.value));
            }
        }
        line
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 2 || fields[0] != "Disjunction" {
            return Err(Error::MalformedQuery(format!(
                "bad disjunction line: {line}"
            )));
        }
        let ncases: usize = fields[1]
            .parse()
            .map_err(|_| Error::MalformedQuery(format!("bad disjunct count: {line}")))?;
        let mut cases = Vec::with_capacity(ncases);
        let mut cursor = 2;
        for _ in 0..ncases {
            let nbounds: usize = fields
                .get(cursor)
                .ok_or_else(|| Error::MalformedQuery(format!("truncated disjunction: {line}")))?
                .parse()
                .map_err(|_| Error::MalformedQuery(format!("bad bound count: {line}")))?;
            cursor += 1;
            let mut case = CaseSplit::new(PhaseStatus::NotFixed);
            for _ in 0..nbounds {
                let side = *fields.get(cursor).ok_or_else(|| {
                    Error::MalformedQuery(format!("truncated disjunction: {line}"))
                })?;
                let variable = parse_var(fields.get(cursor + 1).ok_or_else(|| {
                    Error::MalformedQuery(format!("truncated disjunction: {line}"))
                })?)?;
                let value = parse_value(fields.get(cursor + 2).ok_or_else(|| {
                    Error::MalformedQuery(format!("truncated disjunction: {line}"))
                })?)?;
                cursor += 3;
                let bound = match side {
                    "l" => Tightening::lower(variable, value),
                    "u" => Tightening::upper(variable, value),
                    other => {
                        return Err(Error::MalformedQuery(format!(
                            "bad bound side {other}: {line}"
                        )))
                    }
                };
                case.store_bound_tightening(bound);
            }
            cases.push(case);
        }
        Ok(Self::new(cases))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_case_disjunction() -> DisjunctionConstraint {
        let mut c1 = CaseSplit::new(PhaseStatus::NotFixed);
        c1.store_bound_tightening(Tightening::lower(0, -1.0));
        c1.store_bound_tightening(Tightening::upper(0, 3.0));
        let mut c2 = CaseSplit::new(PhaseStatus::NotFixed);
        c2.store_bound_tightening(Tightening::lower(0, -4.0));
        c2.store_bound_tightening(Tightening::upper(0, 2.0));
        DisjunctionConstraint::new(vec![c1, c2])
    }

    fn assignment(v: usize, x: f64) -> Assignment {
        let mut a = Assignment::new();
        a.set(v, x);
        a
    }

    #[test]
    fn test_satisfied_by_any_case() {
        let disj = two_case_disjunction();
        assert!(disj.satisfied(&assignment(0, 2.5))); // case 1 only
        assert!(disj.satisfied(&assignment(0, -3.0))); // case 2 only
        assert!(disj.satisfied(&assignment(0, 0.0))); // both
        assert!(!disj.satisfied(&assignment(0, 5.0)));
    }

    #[test]
    fn test_hull_tightenings() {
        let disj = two_case_disjunction();
        let mut out = Vec::new();
        disj.entailed_tightenings(&mut out);
        assert!(out.contains(&Tightening::lower(0, -4.0)));
        assert!(out.contains(&Tightening::upper(0, 3.0)));
    }

    #[test]
    fn test_unreachable_case_is_pruned_from_splits() {
        let mut disj = two_case_disjunction();
        let mut sink = Vec::new();
        // lb(x0) = 2.5 contradicts case 2's upper bound of 2.
        disj.notify_lower_bound(0, 2.5, &mut sink).unwrap();
        let splits = disj.case_splits();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].phase, PhaseStatus::CaseIndex(0));
    }

    #[test]
    fn test_never_phase_fixed() {
        let mut disj = two_case_disjunction();
        let mut sink = Vec::new();
        disj.notify_lower_bound(0, 2.5, &mut sink).unwrap();
        assert!(!disj.phase_fixed());
    }

    #[test]
    fn test_serialize_round_trip() {
        let disj = two_case_disjunction();
        let line = disj.serialize();
        let parsed = DisjunctionConstraint::deserialize(&line).unwrap();
        assert_eq!(parsed.cases().len(), 2);
        assert_eq!(parsed.serialize(), line);
    }
}
