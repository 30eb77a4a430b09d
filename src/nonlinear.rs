//! Nonlinear (transcendental and polynomial) activation constraints.
//!
//! These never case-split; the engine treats them through two channels:
//!
//! 1. Bound propagation: monotone image/preimage tightenings (sigmoid,
//!    tanh, round) or envelope bounds (softmax, bilinear).
//! 2. Incremental linearization: `attempt_to_refine` inspects a spurious
//!    counter-example and emits linear cuts (tangent, secant, McCormick,
//!    simplex) that exclude it from the next abstraction.

use crate::bounds::Tightening;
use crate::equation::{Equation, Relation};
use crate::error::{Error, Result};
use crate::num;
use crate::plc::WatchedBounds;
use crate::tableau::Assignment;

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid_derivative(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

pub fn tanh_derivative(x: f64) -> f64 {
    1.0 - x.tanh() * x.tanh()
}

/// Linear cuts produced by one refinement step.
#[derive(Clone, Debug, Default)]
pub struct Refinement {
    pub equations: Vec<Equation>,
}

impl Refinement {
    pub fn is_empty(&self) -> bool {
        self.equations.is_empty()
    }
}

// ─── S-Shaped Curves (sigmoid / tanh) ──────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Curve {
    Sigmoid,
    Tanh,
}

impl Curve {
    pub fn value(self, x: f64) -> f64 {
        match self {
            Curve::Sigmoid => sigmoid(x),
            Curve::Tanh => x.tanh(),
        }
    }

    pub fn derivative(self, x: f64) -> f64 {
        match self {
            Curve::Sigmoid => sigmoid_derivative(x),
            Curve::Tanh => tanh_derivative(x),
        }
    }

    pub fn range(self) -> (f64, f64) {
        match self {
            Curve::Sigmoid => (0.0, 1.0),
            Curve::Tanh => (-1.0, 1.0),
        }
    }
}

/// `f = curve(b)` for an s-shaped curve: convex below zero, concave above.
#[derive(Clone, Debug)]
pub struct SCurveConstraint {
    curve: Curve,
    b: usize,
    f: usize,
    bounds: WatchedBounds,
    obsolete: bool,
}

impl SCurveConstraint {
    pub fn new(curve: Curve, b: usize, f: usize) -> Self {
        Self {
            curve,
            b,
            f,
            bounds: WatchedBounds::default(),
            obsolete: false,
        }
    }

    pub fn b(&self) -> usize {
        self.b
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        vec![self.b, self.f]
    }

    /// Inverse of the curve, clamped away from the asymptotes.
    fn inverse(&self, y: f64) -> Option<f64> {
        let (lo, hi) = self.curve.range();
        if y <= lo || y >= hi {
            return None;
        }
        match self.curve {
            Curve::Sigmoid => Some((y / (1.0 - y)).ln()),
            Curve::Tanh => Some(y.atanh()),
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
        if variable == self.b {
            out.push(Tightening::lower(self.f, self.curve.value(value)));
        } else if let Some(x) = self.inverse(value) {
            out.push(Tightening::lower(self.b, x));
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
            out.push(Tightening::upper(self.f, self.curve.value(value)));
        } else if let Some(x) = self.inverse(value) {
            out.push(Tightening::upper(self.b, x));
        }
        Ok(())
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let (lo, hi) = self.curve.range();
        out.push(Tightening::lower(self.f, lo));
        out.push(Tightening::upper(self.f, hi));
        let b_lb = self.bounds.lb(self.b);
        let b_ub = self.bounds.ub(self.b);
        if num::is_finite(b_lb) {
            out.push(Tightening::lower(self.f, self.curve.value(b_lb)));
        }
        if num::is_finite(b_ub) {
            out.push(Tightening::upper(self.f, self.curve.value(b_ub)));
        }
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        num::are_equal_eps(
            assignment.value(self.f),
            self.curve.value(assignment.value(self.b)),
            1e-4,
        )
    }

    /// Cut away a spurious point. Above the curve gets an upper cut, below
    /// gets a lower cut; the cut shape depends on which curvature region
    /// the current bounds confine `b` to.
    pub fn attempt_to_refine(&self, counter_example: &Assignment) -> Refinement {
        let b_hat = counter_example.value(self.b);
        let f_hat = counter_example.value(self.f);
        let truth = self.curve.value(b_hat);
        let mut refinement = Refinement::default();
        if num::are_equal_eps(f_hat, truth, 1e-5) {
            return refinement;
        }

        let l = self.bounds.lb(self.b);
        let u = self.bounds.ub(self.b);
        let above = f_hat > truth;

        if above {
            if let Some(cut) = self.upper_cut(b_hat, l, u) {
                if cut_violated(&cut, counter_example) {
                    refinement.equations.push(cut);
                }
            }
        } else if let Some(cut) = self.lower_cut(b_hat, l, u) {
            if cut_violated(&cut, counter_example) {
                refinement.equations.push(cut);
            }
        }
        refinement
    }

    /// `f <= slope·b + offset` as `f - slope·b <= offset`.
    fn line_cut(&self, slope: f64, offset: f64, relation: Relation) -> Equation {
        let mut eq = Equation::new(relation);
        eq.add_addend(1.0, self.f);
        eq.add_addend(-slope, self.b);
        eq.set_scalar(offset);
        eq
    }

    fn upper_cut(&self, b_hat: f64, l: f64, u: f64) -> Option<Equation> {
        if num::gte(l, 0.0) {
            // Concave region: the tangent at the counter-example majorizes.
            let slope = self.curve.derivative(b_hat);
            let offset = self.curve.value(b_hat) - slope * b_hat;
            Some(self.line_cut(slope, offset, Relation::Le))
        } else if num::lte(u, 0.0) && num::is_finite(l) {
            // Convex region: the secant majorizes.
            let slope = (self.curve.value(u) - self.curve.value(l)) / (u - l);
            let offset = self.curve.value(l) - slope * l;
            Some(self.line_cut(slope, offset, Relation::Le))
        } else if num::is_finite(l) && num::is_finite(u) {
            // Straddling: parallel line at the flatter endpoint slope.
            let slope = self.curve.derivative(l).min(self.curve.derivative(u));
            let offset = self.curve.value(u) - slope * u;
            Some(self.line_cut(slope, offset, Relation::Le))
        } else {
            None
        }
    }

    fn lower_cut(&self, b_hat: f64, l: f64, u: f64) -> Option<Equation> {
        if num::lte(u, 0.0) {
            // Convex region: tangent minorizes.
            let slope = self.curve.derivative(b_hat);
            let offset = self.curve.value(b_hat) - slope * b_hat;
            Some(self.line_cut(slope, offset, Relation::Ge))
        } else if num::gte(l, 0.0) && num::is_finite(u) {
            // Concave region: secant minorizes.
            let slope = (self.curve.value(u) - self.curve.value(l)) / (u - l);
            let offset = self.curve.value(l) - slope * l;
            Some(self.line_cut(slope, offset, Relation::Ge))
        } else if num::is_finite(l) && num::is_finite(u) {
            let slope = self.curve.derivative(l).min(self.curve.derivative(u));
            let offset = self.curve.value(l) - slope * l;
            Some(self.line_cut(slope, offset, Relation::Ge))
        } else {
            None
        }
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

    pub fn serialize(&self) -> String {
        let kind = match self.curve {
            Curve::Sigmoid => "Sigmoid",
            Curve::Tanh => "Tanh",
        };
        format!("{kind},{},{}", self.f, self.b)
    }
}

fn cut_violated(cut: &Equation, point: &Assignment) -> bool {
    !cut.satisfied(|v| point.value(v))
}

// ─── Round ─────────────────────────────────────────────────────────

/// `f = round(b)`, ties to even. No case splits; `|f - b| <= 0.5` plus the
/// rounded images of `b`'s bounds.
#[derive(Clone, Debug)]
pub struct RoundConstraint {
    b: usize,
    f: usize,
    bounds: WatchedBounds,
    obsolete: bool,
}

impl RoundConstraint {
    pub fn new(b: usize, f: usize) -> Self {
        Self {
            b,
            f,
            bounds: WatchedBounds::default(),
            obsolete: false,
        }
    }

    pub fn b(&self) -> usize {
        self.b
    }

    pub fn f(&self) -> usize {
        self.f
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
        if !self.bounds.refine_lb(variable, value) {
            return Ok(());
        }
        self.bounds.check_feasible(variable)?;
        if variable == self.b {
            out.push(Tightening::lower(self.f, num::round(value)));
        } else {
            out.push(Tightening::lower(self.b, value - 0.5));
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
            out.push(Tightening::upper(self.f, num::round(value)));
        } else {
            out.push(Tightening::upper(self.b, value + 0.5));
        }
        Ok(())
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let b_lb = self.bounds.lb(self.b);
        let b_ub = self.bounds.ub(self.b);
        if num::is_finite(b_lb) {
            out.push(Tightening::lower(self.f, num::round(b_lb)));
        }
        if num::is_finite(b_ub) {
            out.push(Tightening::upper(self.f, num::round(b_ub)));
        }
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        num::are_equal_eps(
            assignment.value(self.f),
            num::round(assignment.value(self.b)),
            1e-4,
        )
    }

    /// Refinement is the identity-with-slack band `|f - b| <= 0.5`.
    pub fn attempt_to_refine(&self, counter_example: &Assignment) -> Refinement {
        let mut refinement = Refinement::default();
        let mut upper = Equation::new(Relation::Le);
        upper.add_addend(1.0, self.f);
        upper.add_addend(-1.0, self.b);
        upper.set_scalar(0.5);
        let mut lower = Equation::new(Relation::Ge);
        lower.add_addend(1.0, self.f);
        lower.add_addend(-1.0, self.b);
        lower.set_scalar(-0.5);
        for cut in [upper, lower] {
            if cut_violated(&cut, counter_example) {
                refinement.equations.push(cut);
            }
        }
        refinement
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

    pub fn serialize(&self) -> String {
        format!("Round,{},{}", self.f, self.b)
    }
}

// ─── Bilinear ──────────────────────────────────────────────────────

/// `f = x · y`. Bounds come from the four corner products; refinement adds
/// the violated McCormick inequalities under the current box.
#[derive(Clone, Debug)]
pub struct BilinearConstraint {
    x: usize,
    y: usize,
    f: usize,
    bounds: WatchedBounds,
    obsolete: bool,
}

impl BilinearConstraint {
    pub fn new(x: usize, y: usize, f: usize) -> Self {
        Self {
            x,
            y,
            f,
            bounds: WatchedBounds::default(),
            obsolete: false,
        }
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn inputs(&self) -> (usize, usize) {
        (self.x, self.y)
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        vec![self.x, self.y, self.f]
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
        self.push_product_bounds(out);
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
        self.push_product_bounds(out);
        Ok(())
    }

    fn push_product_bounds(&self, out: &mut Vec<Tightening>) {
        let (xl, xu) = (self.bounds.lb(self.x), self.bounds.ub(self.x));
        let (yl, yu) = (self.bounds.lb(self.y), self.bounds.ub(self.y));
        if !(num::is_finite(xl) && num::is_finite(xu) && num::is_finite(yl) && num::is_finite(yu)) {
            return;
        }
        let corners = [xl * yl, xl * yu, xu * yl, xu * yu];
        let lo = corners.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = corners.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        out.push(Tightening::lower(self.f, lo));
        out.push(Tightening::upper(self.f, hi));
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        self.push_product_bounds(out);
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        num::are_equal_eps(
            assignment.value(self.f),
            assignment.value(self.x) * assignment.value(self.y),
            1e-4,
        )
    }

    pub fn attempt_to_refine(&self, counter_example: &Assignment) -> Refinement {
        let mut refinement = Refinement::default();
        let (xl, xu) = (self.bounds.lb(self.x), self.bounds.ub(self.x));
        let (yl, yu) = (self.bounds.lb(self.y), self.bounds.ub(self.y));
        if !(num::is_finite(xl) && num::is_finite(xu) && num::is_finite(yl) && num::is_finite(yu)) {
            return refinement;
        }
        // f >= yl·x + xl·y - xl·yl ; f >= yu·x + xu·y - xu·yu
        // f <= yu·x + xl·y - xl·yu ; f <= yl·x + xu·y - xu·yl
        let cuts = [
            (yl, xl, xl * yl, Relation::Ge),
            (yu, xu, xu * yu, Relation::Ge),
            (yu, xl, xl * yu, Relation::Le),
            (yl, xu, xu * yl, Relation::Le),
        ];
        for (cx, cy, constant, relation) in cuts {
            let mut eq = Equation::new(relation);
            eq.add_addend(1.0, self.f);
            eq.add_addend(-cx, self.x);
            eq.add_addend(-cy, self.y);
            eq.set_scalar(-constant);
            if cut_violated(&eq, counter_example) {
                refinement.equations.push(eq);
            }
        }
        refinement
    }

    pub fn eliminate(&mut self, _variable: usize, _fixed_value: f64) {
        self.obsolete = true;
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        self.bounds.update_index(old, new);
        for v in [&mut self.x, &mut self.y, &mut self.f] {
            if *v == old {
                *v = new;
            }
        }
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub fn serialize(&self) -> String {
        format!("Bilinear,{},{},{}", self.f, self.x, self.y)
    }
}

// ─── Softmax ───────────────────────────────────────────────────────

/// `f_i = exp(b_i) / Σ_j exp(b_j)` over parallel input/output vectors.
#[derive(Clone, Debug)]
pub struct SoftmaxConstraint {
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    bounds: WatchedBounds,
    obsolete: bool,
}

impl SoftmaxConstraint {
    pub fn new(inputs: Vec<usize>, outputs: Vec<usize>) -> Self {
        debug_assert_eq!(inputs.len(), outputs.len());
        Self {
            inputs,
            outputs,
            bounds: WatchedBounds::default(),
            obsolete: false,
        }
    }

    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .copied()
            .collect()
    }

    pub fn evaluate(inputs: &[f64]) -> Vec<f64> {
        // Shift by the max for numerical stability.
        let shift = inputs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = inputs.iter().map(|&x| (x - shift).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
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
        self.push_output_bounds(out);
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
        self.push_output_bounds(out);
        Ok(())
    }

    /// `f_i` is smallest with `b_i` at its lower bound and every rival at
    /// its upper bound, and symmetrically for the largest.
    fn push_output_bounds(&self, out: &mut Vec<Tightening>) {
        let all_bounded = self
            .inputs
            .iter()
            .all(|&b| num::is_finite(self.bounds.lb(b)) && num::is_finite(self.bounds.ub(b)));
        if !all_bounded {
            return;
        }
        for (i, (&_b, &f)) in self.inputs.iter().zip(self.outputs.iter()).enumerate() {
            let mut worst = Vec::with_capacity(self.inputs.len());
            let mut best = Vec::with_capacity(self.inputs.len());
            for (j, &bj) in self.inputs.iter().enumerate() {
                if i == j {
                    worst.push(self.bounds.lb(bj));
                    best.push(self.bounds.ub(bj));
                } else {
                    worst.push(self.bounds.ub(bj));
                    best.push(self.bounds.lb(bj));
                }
            }
            out.push(Tightening::lower(f, Self::evaluate(&worst)[i]));
            out.push(Tightening::upper(f, Self::evaluate(&best)[i]));
        }
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        for &f in &self.outputs {
            out.push(Tightening::lower(f, 0.0));
            out.push(Tightening::upper(f, 1.0));
        }
        self.push_output_bounds(out);
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        let inputs: Vec<f64> = self.inputs.iter().map(|&b| assignment.value(b)).collect();
        let expected = Self::evaluate(&inputs);
        self.outputs
            .iter()
            .zip(expected.iter())
            .all(|(&f, &e)| num::are_equal_eps(assignment.value(f), e, 1e-4))
    }

    /// The simplex face `Σ f_i = 1` is the one exact linear consequence;
    /// add it when the counter-example drifts off it.
    pub fn attempt_to_refine(&self, counter_example: &Assignment) -> Refinement {
        let mut refinement = Refinement::default();
        let mut eq = Equation::equality();
        for &f in &self.outputs {
            eq.add_addend(1.0, f);
        }
        eq.set_scalar(1.0);
        if cut_violated(&eq, counter_example) {
            refinement.equations.push(eq);
        }
        refinement
    }

    pub fn eliminate(&mut self, _variable: usize, _fixed_value: f64) {
        self.obsolete = true;
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        self.bounds.update_index(old, new);
        for v in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if *v == old {
                *v = new;
            }
        }
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    pub fn serialize(&self) -> String {
        let mut line = format!("Softmax,{}", self.inputs.len());
        for v in self.inputs.iter().chain(self.outputs.iter()) {
            line.push_str(&format!(",{v}"));
        }
        line
    }
}

// ─── The Sum Type ──────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum NonlinearConstraint {
    Sigmoid(SCurveConstraint),
    Tanh(SCurveConstraint),
    Round(RoundConstraint),
    Bilinear(BilinearConstraint),
    Softmax(SoftmaxConstraint),
}

macro_rules! nl_dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            NonlinearConstraint::Sigmoid($c) => $body,
            NonlinearConstraint::Tanh($c) => $body,
            NonlinearConstraint::Round($c) => $body,
            NonlinearConstraint::Bilinear($c) => $body,
            NonlinearConstraint::Softmax($c) => $body,
        }
    };
}

impl NonlinearConstraint {
    pub fn sigmoid(b: usize, f: usize) -> Self {
        NonlinearConstraint::Sigmoid(SCurveConstraint::new(Curve::Sigmoid, b, f))
    }

    pub fn tanh(b: usize, f: usize) -> Self {
        NonlinearConstraint::Tanh(SCurveConstraint::new(Curve::Tanh, b, f))
    }

    pub fn participating_variables(&self) -> Vec<usize> {
        nl_dispatch!(self, c => c.participating_variables())
    }

    pub fn participates(&self, variable: usize) -> bool {
        self.participating_variables().contains(&variable)
    }

    pub fn notify_lower_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        nl_dispatch!(self, c => c.notify_lower_bound(variable, value, out))
    }

    pub fn notify_upper_bound(
        &mut self,
        variable: usize,
        value: f64,
        out: &mut Vec<Tightening>,
    ) -> Result<()> {
        nl_dispatch!(self, c => c.notify_upper_bound(variable, value, out))
    }

    pub fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        nl_dispatch!(self, c => c.entailed_tightenings(out))
    }

    pub fn satisfied(&self, assignment: &Assignment) -> bool {
        nl_dispatch!(self, c => c.satisfied(assignment))
    }

    /// Returns the linear cuts that exclude the counter-example; empty when
    /// the point already satisfies this constraint.
    pub fn attempt_to_refine(&self, counter_example: &Assignment) -> Refinement {
        nl_dispatch!(self, c => c.attempt_to_refine(counter_example))
    }

    pub fn eliminate(&mut self, variable: usize, fixed_value: f64) {
        nl_dispatch!(self, c => c.eliminate(variable, fixed_value))
    }

    pub fn update_index(&mut self, old: usize, new: usize) {
        nl_dispatch!(self, c => c.update_index(old, new))
    }

    pub fn is_obsolete(&self) -> bool {
        nl_dispatch!(self, c => c.is_obsolete())
    }

    pub fn serialize(&self) -> String {
        nl_dispatch!(self, c => c.serialize())
    }

    pub fn deserialize(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        let parse = |t: &str| -> Result<usize> {
            t.trim()
                .parse()
                .map_err(|_| Error::MalformedQuery(format!("bad variable index: {t}")))
        };
        match fields.first().copied() {
            Some("Sigmoid") if fields.len() == 3 => {
                Ok(Self::sigmoid(parse(fields[2])?, parse(fields[1])?))
            }
            Some("Tanh") if fields.len() == 3 => {
                Ok(Self::tanh(parse(fields[2])?, parse(fields[1])?))
            }
            Some("Round") if fields.len() == 3 => Ok(NonlinearConstraint::Round(
                RoundConstraint::new(parse(fields[2])?, parse(fields[1])?),
            )),
            Some("Bilinear") if fields.len() == 4 => Ok(NonlinearConstraint::Bilinear(
                BilinearConstraint::new(parse(fields[2])?, parse(fields[3])?, parse(fields[1])?),
            )),
            Some("Softmax") if fields.len() >= 2 => {
                let k: usize = fields[1]
                    .parse()
                    .map_err(|_| Error::MalformedQuery(format!("bad softmax size: {line}")))?;
                if fields.len() != 2 + 2 * k {
                    return Err(Error::MalformedQuery(format!(
                        "softmax arity mismatch: {line}"
                    )));
                }
                let inputs = fields[2..2 + k]
                    .iter()
                    .map(|t| parse(t))
                    .collect::<Result<Vec<_>>>()?;
                let outputs = fields[2 + k..]
                    .iter()
                    .map(|t| parse(t))
                    .collect::<Result<Vec<_>>>()?;
                Ok(NonlinearConstraint::Softmax(SoftmaxConstraint::new(
                    inputs, outputs,
                )))
            }
            Some(other) => Err(Error::UnsupportedConstraint(other.to_string())),
            None => Err(Error::MalformedQuery("empty constraint line".into())),
        }
    }
}
