//! DeepPoly-style backward polyhedral bound propagation.
//!
//! Every activation neuron gets one lower and one upper relaxation line
//! over its source neuron; the tighter of the two admissible ReLU triangle
//! relaxations is chosen by area. A layer's bounds are then computed by
//! substituting its definition backwards through every predecessor, line
//! by line and weight block by weight block, until only the input layer
//! remains, and concretising on the input box.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::nonlinear::{sigmoid, sigmoid_derivative, tanh_derivative};
use crate::num;

use super::{LayerKind, NetworkLevelReasoner, NeuronIndex};

/// An affine bound `slope · source + offset` on one neuron.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Line {
    pub source: NeuronIndex,
    pub slope: f64,
    pub offset: f64,
}

impl Line {
    fn constant(source: NeuronIndex, value: f64) -> Self {
        Self {
            source,
            slope: 0.0,
            offset: value,
        }
    }
}

/// Per-neuron relaxation lines of one activation layer.
#[derive(Clone, Debug)]
pub(crate) struct Relaxation {
    pub lower: Vec<Line>,
    pub upper: Vec<Line>,
}

/// A linear form over several layers: per layer a dense coefficient block
/// (`rows × layer_size`) plus a shared bias per row.
struct Running {
    rows: usize,
    coeffs: BTreeMap<usize, Vec<f64>>,
    bias: Vec<f64>,
}

impl Running {
    fn new(rows: usize) -> Self {
        Self {
            rows,
            coeffs: BTreeMap::new(),
            bias: vec![0.0; rows],
        }
    }

    fn block(&mut self, layer: usize, size: usize) -> &mut Vec<f64> {
        self.coeffs
            .entry(layer)
            .or_insert_with(|| vec![0.0; self.rows * size])
    }

    fn deepest_unresolved(&self, input_layer: usize) -> Option<usize> {
        self.coeffs
            .keys()
            .copied()
            .filter(|&l| l != input_layer)
            .max()
    }
}

impl NetworkLevelReasoner {
    pub fn deep_poly_propagation(&mut self) -> Result<()> {
        let input_layer = self.input_layer()?;
        let mut relaxations: BTreeMap<usize, Relaxation> = BTreeMap::new();

        for index in self.topological_order()? {
            if index == input_layer {
                continue;
            }
            if self.layer(index).kind.is_activation() {
                let relaxation = self.build_relaxation(index);
                relaxations.insert(index, relaxation);
            }
            let (lbs, ubs) = self.deep_poly_layer_bounds(index, input_layer, &relaxations)?;
            let layer = self.layer_mut(index);
            for neuron in 0..layer.size {
                if layer.eliminated.contains_key(&neuron) {
                    continue;
                }
                layer.refine(neuron, lbs[neuron], ubs[neuron]);
            }
        }
        Ok(())
    }

    /// Relaxation lines from the (already finalized) source bounds.
    pub(crate) fn build_relaxation(&self, index: usize) -> Relaxation {
        let layer = self.layer(index);
        let mut lower = Vec::with_capacity(layer.size);
        let mut upper = Vec::with_capacity(layer.size);
        for t in 0..layer.size {
            let sources = &layer.activation_sources[t];
            let fallback = NeuronIndex::new(index, t);
            if sources.is_empty() {
                let value = layer.eliminated.get(&t).copied().unwrap_or(0.0);
                lower.push(Line::constant(fallback, value));
                upper.push(Line::constant(fallback, value));
                continue;
            }
            let (lo, up) = self.relaxation_lines(layer.kind, layer.alpha, t, sources);
            lower.push(lo);
            upper.push(up);
        }
        Relaxation { lower, upper }
    }

    fn relaxation_lines(
        &self,
        kind: LayerKind,
        alpha: f64,
        neuron: usize,
        sources: &[NeuronIndex],
    ) -> (Line, Line) {
        let source = sources[0];
        let (l, u) = self.source_interval(&source);
        let line = |slope: f64, offset: f64| Line {
            source,
            slope,
            offset,
        };
        match kind {
            LayerKind::Relu => {
                if !num::is_negative(l) {
                    (line(1.0, 0.0), line(1.0, 0.0))
                } else if !num::is_positive(u) {
                    (line(0.0, 0.0), line(0.0, 0.0))
                } else if !num::is_finite(l) || !num::is_finite(u) {
                    (line(0.0, 0.0), Line::constant(source, num::infinity()))
                } else {
                    let lambda = u / (u - l);
                    // The two admissible triangle undersides; pick by area.
                    let lower_slope = if u > -l { 1.0 } else { 0.0 };
                    (line(lower_slope, 0.0), line(lambda, -lambda * l))
                }
            }
            LayerKind::LeakyRelu => {
                if !num::is_negative(l) {
                    (line(1.0, 0.0), line(1.0, 0.0))
                } else if !num::is_positive(u) {
                    (line(alpha, 0.0), line(alpha, 0.0))
                } else if !num::is_finite(l) || !num::is_finite(u) {
                    (line(alpha, 0.0), Line::constant(source, num::infinity()))
                } else {
                    let slope = (u - alpha * l) / (u - l);
                    let lower_slope = if u > -l { 1.0 } else { alpha };
                    (line(lower_slope, 0.0), line(slope, alpha * l - slope * l))
                }
            }
            LayerKind::AbsoluteValue => {
                if !num::is_negative(l) {
                    (line(1.0, 0.0), line(1.0, 0.0))
                } else if !num::is_positive(u) {
                    (line(-1.0, 0.0), line(-1.0, 0.0))
                } else if !num::is_finite(l) || !num::is_finite(u) {
                    (line(0.0, 0.0), Line::constant(source, num::infinity()))
                } else {
                    let slope = (u + l) / (u - l);
                    let lower_slope = if u > -l { 1.0 } else { -1.0 };
                    (line(lower_slope, 0.0), line(slope, -l - slope * l))
                }
            }
            LayerKind::Sign => {
                if !num::is_negative(l) {
                    (line(0.0, 1.0), line(0.0, 1.0))
                } else if num::is_negative(u) {
                    (line(0.0, -1.0), line(0.0, -1.0))
                } else {
                    (line(0.0, -1.0), line(0.0, 1.0))
                }
            }
            LayerKind::Round => (line(1.0, -0.5), line(1.0, 0.5)),
            LayerKind::Sigmoid | LayerKind::Tanh => {
                let g: fn(f64) -> f64 = if kind == LayerKind::Sigmoid {
                    sigmoid
                } else {
                    f64::tanh
                };
                let dg: fn(f64) -> f64 = if kind == LayerKind::Sigmoid {
                    sigmoid_derivative
                } else {
                    tanh_derivative
                };
                let range = if kind == LayerKind::Sigmoid {
                    (0.0, 1.0)
                } else {
                    (-1.0, 1.0)
                };
                if !num::is_finite(l) || !num::is_finite(u) {
                    return (
                        Line::constant(source, range.0),
                        Line::constant(source, range.1),
                    );
                }
                if num::are_equal(l, u) {
                    return (Line::constant(source, g(l)), Line::constant(source, g(l)));
                }
                let chord = (g(u) - g(l)) / (u - l);
                let tangent = dg(l).min(dg(u));
                if !num::is_negative(l) {
                    (
                        line(chord, g(l) - chord * l),
                        line(tangent, g(u) - tangent * u),
                    )
                } else if !num::is_positive(u) {
                    (
                        line(tangent, g(l) - tangent * l),
                        line(chord, g(u) - chord * u),
                    )
                } else {
                    (
                        line(tangent, g(l) - tangent * l),
                        line(tangent, g(u) - tangent * u),
                    )
                }
            }
            LayerKind::Max => {
                let mut best_lb = num::negative_infinity();
                let mut lower_source = source;
                let mut max_ub = num::negative_infinity();
                let mut runner_up_ub = num::negative_infinity();
                let mut ub_source = source;
                for s in sources {
                    let (sl, su) = self.source_interval(s);
                    if sl > best_lb {
                        best_lb = sl;
                        lower_source = *s;
                    }
                    if su > max_ub {
                        runner_up_ub = max_ub;
                        max_ub = su;
                        ub_source = *s;
                    } else if su > runner_up_ub {
                        runner_up_ub = su;
                    }
                }
                let lower = Line {
                    source: lower_source,
                    slope: 1.0,
                    offset: 0.0,
                };
                // One source dominating every rival makes the max exact.
                let upper = if best_lb >= runner_up_ub && lower_source == ub_source {
                    Line {
                        source: ub_source,
                        slope: 1.0,
                        offset: 0.0,
                    }
                } else {
                    Line::constant(ub_source, max_ub)
                };
                (lower, upper)
            }
            LayerKind::Softmax => {
                let position = neuron.min(sources.len() - 1);
                let intervals: Vec<(f64, f64)> = sources
                    .iter()
                    .map(|s| self.source_interval(s))
                    .collect();
                let (lo, hi) = super::interval::softmax_box(&intervals, position);
                (Line::constant(source, lo), Line::constant(source, hi))
            }
            LayerKind::Bilinear => {
                let (xl, xu) = self.source_interval(&sources[0]);
                let (yl, yu) = self.source_interval(&sources[1]);
                if num::is_finite(xl)
                    && num::is_finite(xu)
                    && num::is_finite(yl)
                    && num::is_finite(yu)
                {
                    let corners = [xl * yl, xl * yu, xu * yl, xu * yu];
                    (
                        Line::constant(
                            source,
                            corners.iter().copied().fold(f64::INFINITY, f64::min),
                        ),
                        Line::constant(
                            source,
                            corners.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        ),
                    )
                } else {
                    (
                        Line::constant(source, num::negative_infinity()),
                        Line::constant(source, num::infinity()),
                    )
                }
            }
            LayerKind::Input | LayerKind::WeightedSum => unreachable!(),
        }
    }

    fn deep_poly_layer_bounds(
        &self,
        index: usize,
        input_layer: usize,
        relaxations: &BTreeMap<usize, Relaxation>,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let layer = self.layer(index);
        let size = layer.size;

        let mut lower = Running::new(size);
        let mut upper = Running::new(size);

        // Seed with the layer's own definition.
        if layer.kind == LayerKind::WeightedSum {
            for running in [&mut lower, &mut upper] {
                running.bias.copy_from_slice(&layer.biases);
                for (&source, block) in &layer.weights {
                    let source_size = layer.source_sizes[&source];
                    let dest = running.block(source, source_size);
                    for s in 0..source_size {
                        for t in 0..size {
                            dest[t * source_size + s] += block[s * size + t];
                        }
                    }
                }
            }
        } else {
            let relaxation = &relaxations[&index];
            for t in 0..size {
                for (running, line) in [
                    (&mut lower, relaxation.lower[t]),
                    (&mut upper, relaxation.upper[t]),
                ] {
                    let source_size = self.layer(line.source.layer).size;
                    if line.slope != 0.0 {
                        running.block(line.source.layer, source_size)
                            [t * source_size + line.source.neuron] += line.slope;
                    }
                    running.bias[t] += line.offset;
                }
            }
        }

        // Substitute the deepest unresolved layer until only inputs remain.
        loop {
            let next = lower
                .deepest_unresolved(input_layer)
                .into_iter()
                .chain(upper.deepest_unresolved(input_layer))
                .max();
            let Some(p) = next else { break };
            self.substitute_layer(p, &mut lower, true, relaxations);
            self.substitute_layer(p, &mut upper, false, relaxations);
        }

        // Concretise on the input box.
        let input = self.layer(input_layer);
        let mut lbs = vec![0.0; size];
        let mut ubs = vec![0.0; size];
        for t in 0..size {
            lbs[t] = lower.bias[t];
            ubs[t] = upper.bias[t];
        }
        for (form, out, maximize) in [(&lower, &mut lbs, false), (&upper, &mut ubs, true)] {
            if let Some(block) = form.coeffs.get(&input_layer) {
                for t in 0..size {
                    for s in 0..input.size {
                        let c = block[t * input.size + s];
                        if c == 0.0 {
                            continue;
                        }
                        let (sl, su) = self.neuron_interval(input, s);
                        let pick_upper = (c > 0.0) == maximize;
                        out[t] += c * if pick_upper { su } else { sl };
                    }
                }
            }
        }
        Ok((lbs, ubs))
    }

    /// Replace every reference to layer `p` by its definition (weights) or
    /// its relaxation lines, folding eliminated neurons into the bias.
    fn substitute_layer(
        &self,
        p: usize,
        running: &mut Running,
        is_lower: bool,
        relaxations: &BTreeMap<usize, Relaxation>,
    ) {
        let Some(matrix) = running.coeffs.remove(&p) else {
            return;
        };
        let layer = self.layer(p);
        let p_size = layer.size;

        for t in 0..running.rows {
            for j in 0..p_size {
                let a = matrix[t * p_size + j];
                if a == 0.0 {
                    continue;
                }
                if let Some(&value) = layer.eliminated.get(&j) {
                    running.bias[t] += a * value;
                    continue;
                }
                match layer.kind {
                    LayerKind::WeightedSum => {
                        running.bias[t] += a * layer.biases[j];
                        for (&source, block) in &layer.weights {
                            let source_size = layer.source_sizes[&source];
                            let dest = running.block(source, source_size);
                            for s in 0..source_size {
                                dest[t * source_size + s] += a * block[s * p_size + j];
                            }
                        }
                    }
                    _ => {
                        let relaxation = &relaxations[&p];
                        // A positive coefficient keeps the bound's own side;
                        // a negative one crosses over.
                        let line = if (a >= 0.0) == is_lower {
                            relaxation.lower[j]
                        } else {
                            relaxation.upper[j]
                        };
                        if line.slope != 0.0 {
                            let source_size = self.layer(line.source.layer).size;
                            running.block(line.source.layer, source_size)
                                [t * source_size + line.source.neuron] += a * line.slope;
                        }
                        running.bias[t] += a * line.offset;
                    }
                }
            }
        }
    }
}
