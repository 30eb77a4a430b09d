//! Forward symbolic bound propagation.
//!
//! Each neuron carries two affine expressions over the *input* layer: a
//! symbolic lower and upper bound. Weighted sums push the expressions
//! through with sign splitting; activations concretise the source
//! expression into a single admissible envelope:
//!
//! - ReLU: zero, identity, or the chord `f <= λ(b - l)` paired with the
//!   lower slope `λ = u/(u - l)` when the neuron is undecided.
//! - Sigmoid / Tanh: chord on the concave side, tangent-slope lines
//!   elsewhere.
//! - Max / Softmax / Bilinear: interval box over the source bounds.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::nonlinear::{sigmoid, sigmoid_derivative, tanh_derivative};
use crate::num;

use super::{LayerKind, NetworkLevelReasoner, NeuronIndex};

/// Symbolic bounds of one layer over the input layer.
#[derive(Clone, Debug)]
pub(crate) struct SymbolicBounds {
    pub input_size: usize,
    pub lb_coeffs: Vec<f64>,
    pub ub_coeffs: Vec<f64>,
    pub lb_bias: Vec<f64>,
    pub ub_bias: Vec<f64>,
}

impl SymbolicBounds {
    fn zeros(size: usize, input_size: usize) -> Self {
        Self {
            input_size,
            lb_coeffs: vec![0.0; size * input_size],
            ub_coeffs: vec![0.0; size * input_size],
            lb_bias: vec![0.0; size],
            ub_bias: vec![0.0; size],
        }
    }

    fn lb_row(&self, neuron: usize) -> &[f64] {
        &self.lb_coeffs[neuron * self.input_size..(neuron + 1) * self.input_size]
    }

    fn ub_row(&self, neuron: usize) -> &[f64] {
        &self.ub_coeffs[neuron * self.input_size..(neuron + 1) * self.input_size]
    }
}

/// One neuron's symbolic bound pair, detached from the layer blocks.
#[derive(Clone, Debug)]
struct SymbolicRow {
    lb: Vec<f64>,
    ub: Vec<f64>,
    lb_bias: f64,
    ub_bias: f64,
}

impl SymbolicRow {
    fn constant(input_size: usize, value: f64) -> Self {
        Self {
            lb: vec![0.0; input_size],
            ub: vec![0.0; input_size],
            lb_bias: value,
            ub_bias: value,
        }
    }

    fn boxed(input_size: usize, lo: f64, hi: f64) -> Self {
        Self {
            lb: vec![0.0; input_size],
            ub: vec![0.0; input_size],
            lb_bias: lo,
            ub_bias: hi,
        }
    }

    /// `lower' = a_l·lower + c_l`, `upper' = a_u·upper + c_u`, with slopes
    /// assumed non-negative.
    fn scaled(&self, a_l: f64, c_l: f64, a_u: f64, c_u: f64) -> Self {
        debug_assert!(a_l >= 0.0 && a_u >= 0.0);
        Self {
            lb: self.lb.iter().map(|&c| a_l * c).collect(),
            ub: self.ub.iter().map(|&c| a_u * c).collect(),
            lb_bias: a_l * self.lb_bias + c_l,
            ub_bias: a_u * self.ub_bias + c_u,
        }
    }

    fn negated(&self) -> Self {
        Self {
            lb: self.ub.iter().map(|&c| -c).collect(),
            ub: self.lb.iter().map(|&c| -c).collect(),
            lb_bias: -self.ub_bias,
            ub_bias: -self.lb_bias,
        }
    }
}

impl NetworkLevelReasoner {
    pub fn symbolic_bound_propagation(&mut self) -> Result<()> {
        let input_layer = self.input_layer()?;
        let input_size = self.layer(input_layer).size();
        let input_lb = self.layer(input_layer).lb.clone();
        let input_ub = self.layer(input_layer).ub.clone();

        let mut symbolics: BTreeMap<usize, SymbolicBounds> = BTreeMap::new();

        for index in self.topological_order()? {
            let layer = self.layer(index);
            let size = layer.size();

            let symbolic = if index == input_layer {
                let mut sym = SymbolicBounds::zeros(size, input_size);
                for n in 0..size {
                    sym.lb_coeffs[n * input_size + n] = 1.0;
                    sym.ub_coeffs[n * input_size + n] = 1.0;
                }
                sym
            } else if layer.kind == LayerKind::WeightedSum {
                self.weighted_sum_symbolic(index, input_size, &symbolics)
            } else {
                self.activation_symbolic(index, input_size, &symbolics)
            };

            // Concretise on the input box and refine the stored bounds.
            if index != input_layer {
                let image = |n: usize| -> (f64, f64) {
                    let lo = concretize(
                        symbolic.lb_row(n),
                        symbolic.lb_bias[n],
                        &input_lb,
                        &input_ub,
                        false,
                    );
                    let hi = concretize(
                        symbolic.ub_row(n),
                        symbolic.ub_bias[n],
                        &input_lb,
                        &input_ub,
                        true,
                    );
                    (lo, hi)
                };
                let computed: Vec<(f64, f64)> = (0..size).map(image).collect();
                // An activation's output also lies in the interval image of
                // its sources; intersect with it.
                let image_bounds = if layer.kind.is_activation() {
                    Some(self.interval_pass_layer(index)?)
                } else {
                    None
                };
                let layer = self.layer_mut(index);
                for (n, &(lo, hi)) in computed.iter().enumerate() {
                    if layer.eliminated.contains_key(&n) {
                        continue;
                    }
                    layer.refine(n, lo, hi);
                    if let Some((ref ilb, ref iub)) = image_bounds {
                        layer.refine(n, ilb[n], iub[n]);
                    }
                }
            }

            symbolics.insert(index, symbolic);
        }
        Ok(())
    }

    fn weighted_sum_symbolic(
        &self,
        index: usize,
        input_size: usize,
        symbolics: &BTreeMap<usize, SymbolicBounds>,
    ) -> SymbolicBounds {
        let layer = self.layer(index);
        let size = layer.size();
        let mut sym = SymbolicBounds::zeros(size, input_size);
        sym.lb_bias.copy_from_slice(&layer.biases);
        sym.ub_bias.copy_from_slice(&layer.biases);

        for (&source, block) in &layer.weights {
            let source_layer = self.layer(source);
            let source_sym = &symbolics[&source];
            for s in 0..layer.source_sizes[&source] {
                if let Some(&value) = source_layer.eliminated.get(&s) {
                    for t in 0..size {
                        let w = block[s * size + t];
                        sym.lb_bias[t] += w * value;
                        sym.ub_bias[t] += w * value;
                    }
                    continue;
                }
                for t in 0..size {
                    let w = block[s * size + t];
                    if w == 0.0 {
                        continue;
                    }
                    let (src_lb, src_ub, src_lb_bias, src_ub_bias) = (
                        source_sym.lb_row(s),
                        source_sym.ub_row(s),
                        source_sym.lb_bias[s],
                        source_sym.ub_bias[s],
                    );
                    let (row, bias) = if w >= 0.0 {
                        ((src_lb, src_lb_bias), (src_ub, src_ub_bias))
                    } else {
                        ((src_ub, src_ub_bias), (src_lb, src_lb_bias))
                    };
                    for i in 0..input_size {
                        sym.lb_coeffs[t * input_size + i] += w * row.0[i];
                        sym.ub_coeffs[t * input_size + i] += w * bias.0[i];
                    }
                    sym.lb_bias[t] += w * row.1;
                    sym.ub_bias[t] += w * bias.1;
                }
            }
        }
        sym
    }

    fn activation_symbolic(
        &self,
        index: usize,
        input_size: usize,
        symbolics: &BTreeMap<usize, SymbolicBounds>,
    ) -> SymbolicBounds {
        let layer = self.layer(index);
        let size = layer.size();
        let mut sym = SymbolicBounds::zeros(size, input_size);

        for t in 0..size {
            if layer.eliminated.contains_key(&t) {
                continue;
            }
            let sources = &layer.activation_sources[t];
            if sources.is_empty() {
                sym.lb_bias[t] = num::negative_infinity();
                sym.ub_bias[t] = num::infinity();
                continue;
            }
            let row = match layer.kind {
                LayerKind::Max => {
                    let (mut lo, mut hi) = (num::negative_infinity(), num::negative_infinity());
                    for s in sources {
                        let (sl, su) = self.source_interval(s);
                        lo = lo.max(sl);
                        hi = hi.max(su);
                    }
                    SymbolicRow::boxed(input_size, lo, hi)
                }
                LayerKind::Softmax => SymbolicRow::boxed(input_size, 0.0, 1.0),
                LayerKind::Bilinear => {
                    let (xl, xu) = self.source_interval(&sources[0]);
                    let (yl, yu) = self.source_interval(&sources[1]);
                    if num::is_finite(xl)
                        && num::is_finite(xu)
                        && num::is_finite(yl)
                        && num::is_finite(yu)
                    {
                        let corners = [xl * yl, xl * yu, xu * yl, xu * yu];
                        SymbolicRow::boxed(
                            input_size,
                            corners.iter().copied().fold(f64::INFINITY, f64::min),
                            corners.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        )
                    } else {
                        SymbolicRow::boxed(input_size, num::negative_infinity(), num::infinity())
                    }
                }
                _ => {
                    let source = &sources[0];
                    let (l, u) = self.source_interval(source);
                    let source_row = if let Some(value) =
                        self.layer(source.layer).eliminated_value(source.neuron)
                    {
                        SymbolicRow::constant(input_size, value)
                    } else {
                        extract_row(symbolics, source)
                            .unwrap_or_else(|| SymbolicRow::boxed(input_size, l, u))
                    };
                    self.unary_activation_symbolic(
                        layer.kind,
                        layer.alpha,
                        &source_row,
                        l,
                        u,
                        input_size,
                    )
                }
            };
            sym.lb_bias[t] = row.lb_bias;
            sym.ub_bias[t] = row.ub_bias;
            sym.lb_coeffs[t * input_size..(t + 1) * input_size].copy_from_slice(&row.lb);
            sym.ub_coeffs[t * input_size..(t + 1) * input_size].copy_from_slice(&row.ub);
        }
        sym
    }

    fn unary_activation_symbolic(
        &self,
        kind: LayerKind,
        alpha: f64,
        source: &SymbolicRow,
        l: f64,
        u: f64,
        input_size: usize,
    ) -> SymbolicRow {
        match kind {
            LayerKind::Relu => {
                if !num::is_negative(l) {
                    source.clone()
                } else if !num::is_positive(u) {
                    SymbolicRow::constant(input_size, 0.0)
                } else {
                    let lambda = u / (u - l);
                    source.scaled(lambda, 0.0, lambda, -lambda * l)
                }
            }
            LayerKind::AbsoluteValue => {
                if !num::is_negative(l) {
                    source.clone()
                } else if !num::is_positive(u) {
                    source.negated()
                } else {
                    SymbolicRow::boxed(input_size, 0.0, (-l).max(u))
                }
            }
            LayerKind::Sign => {
                if !num::is_negative(l) {
                    SymbolicRow::constant(input_size, 1.0)
                } else if num::is_negative(u) {
                    SymbolicRow::constant(input_size, -1.0)
                } else {
                    SymbolicRow::boxed(input_size, -1.0, 1.0)
                }
            }
            LayerKind::Round => source.scaled(1.0, -0.5, 1.0, 0.5),
            LayerKind::LeakyRelu => {
                if !num::is_negative(l) {
                    source.clone()
                } else if !num::is_positive(u) {
                    source.scaled(alpha, 0.0, alpha, 0.0)
                } else {
                    // Lower: slope α through the origin. Upper: the chord
                    // through (l, αl) and (u, u).
                    let slope = (u - alpha * l) / (u - l);
                    source.scaled(alpha, 0.0, slope, alpha * l - slope * l)
                }
            }
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
                if !num::is_finite(l) || !num::is_finite(u) {
                    let (lo, hi) = if kind == LayerKind::Sigmoid {
                        (0.0, 1.0)
                    } else {
                        (-1.0, 1.0)
                    };
                    return SymbolicRow::boxed(input_size, lo, hi);
                }
                if num::are_equal(l, u) {
                    return SymbolicRow::constant(input_size, g(l));
                }
                let chord = (g(u) - g(l)) / (u - l);
                let tangent = dg(l).min(dg(u));
                if !num::is_negative(l) {
                    // Concave: chord below, tangent-slope line above.
                    source.scaled(chord, g(l) - chord * l, tangent, g(u) - tangent * u)
                } else if !num::is_positive(u) {
                    // Convex: tangent-slope line below, chord above.
                    source.scaled(tangent, g(l) - tangent * l, chord, g(u) - chord * u)
                } else {
                    source.scaled(tangent, g(l) - tangent * l, tangent, g(u) - tangent * u)
                }
            }
            _ => unreachable!("unary activation expected"),
        }
    }
}

fn extract_row(
    symbolics: &BTreeMap<usize, SymbolicBounds>,
    source: &NeuronIndex,
) -> Option<SymbolicRow> {
    let sym = symbolics.get(&source.layer)?;
    Some(SymbolicRow {
        lb: sym.lb_row(source.neuron).to_vec(),
        ub: sym.ub_row(source.neuron).to_vec(),
        lb_bias: sym.lb_bias[source.neuron],
        ub_bias: sym.ub_bias[source.neuron],
    })
}

/// Extremal value of an affine row over the input box.
fn concretize(coeffs: &[f64], bias: f64, input_lb: &[f64], input_ub: &[f64], maximize: bool) -> f64 {
    let mut value = bias;
    for (i, &c) in coeffs.iter().enumerate() {
        if c == 0.0 {
            continue;
        }
        let pick_upper = (c > 0.0) == maximize;
        value += c * if pick_upper { input_ub[i] } else { input_lb[i] };
    }
    value
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::*;
    use crate::bounds::Tightening;

    /// 2-2-1 network: x2 = 2x0 + 3x1 + bias, x3 = x0 + x1, relus x4/x5,
    /// x6 = x4 - x5.
    fn populate_sbt_network(nlr: &mut NetworkLevelReasoner, bias: f64) {
        nlr.add_layer(0, LayerKind::Input, 2);
        nlr.add_layer(1, LayerKind::WeightedSum, 2);
        nlr.add_layer(2, LayerKind::Relu, 2);
        nlr.add_layer(3, LayerKind::WeightedSum, 1);
        for i in 1..=3 {
            nlr.add_layer_dependency(i - 1, i);
        }
        nlr.set_weight(0, 0, 1, 0, 2.0);
        nlr.set_weight(0, 1, 1, 0, 3.0);
        nlr.set_weight(0, 0, 1, 1, 1.0);
        nlr.set_weight(0, 1, 1, 1, 1.0);
        nlr.set_bias(1, 0, bias);
        nlr.set_weight(2, 0, 3, 0, 1.0);
        nlr.set_weight(2, 1, 3, 0, -1.0);
        nlr.add_activation_source(1, 0, 2, 0);
        nlr.add_activation_source(1, 1, 2, 1);
        for (layer, neuron, variable) in [
            (0, 0, 0),
            (0, 1, 1),
            (1, 0, 2),
            (1, 1, 3),
            (2, 0, 4),
            (2, 1, 5),
            (3, 0, 6),
        ] {
            nlr.set_neuron_variable(NeuronIndex::new(layer, neuron), variable);
        }
    }

    fn run(nlr: &mut NetworkLevelReasoner) -> Vec<Tightening> {
        let large = 1000.0;
        let mut spec = vec![(0, 4.0, 6.0), (1, 1.0, 5.0)];
        for v in 2..7 {
            spec.push((v, -large, large));
        }
        let store = bound_store_with(7, &spec);
        nlr.obtain_current_bounds(&store);
        nlr.symbolic_bound_propagation().unwrap();
        let mut bounds = Vec::new();
        nlr.get_constraint_tightenings(&mut bounds);
        bounds
    }

    #[test]
    fn test_sbt_relus_active_and_inactive() {
        let mut nlr = NetworkLevelReasoner::new();
        // Strong negative bias: first relu inactive, second active.
        populate_sbt_network(&mut nlr, -30.0);
        let bounds = run(&mut nlr);
        let expected = [
            Tightening::lower(2, -19.0),
            Tightening::upper(2, -3.0),
            Tightening::lower(3, 5.0),
            Tightening::upper(3, 11.0),
            Tightening::lower(4, 0.0),
            Tightening::upper(4, 0.0),
            Tightening::lower(5, 5.0),
            Tightening::upper(5, 11.0),
            Tightening::lower(6, -11.0),
            Tightening::upper(6, -5.0),
        ];
        assert_eq!(bounds.len(), expected.len());
        for t in &expected {
            assert!(bounds.contains(t), "missing {t:?}");
        }
    }

    #[test]
    fn test_sbt_relus_active_and_not_fixed() {
        let mut nlr = NetworkLevelReasoner::new();
        // Milder bias: first relu undecided, concretised with slope 0.75.
        populate_sbt_network(&mut nlr, -15.0);
        let bounds = run(&mut nlr);
        let expected = [
            Tightening::lower(2, -4.0),
            Tightening::upper(2, 12.0),
            Tightening::lower(3, 5.0),
            Tightening::upper(3, 11.0),
            Tightening::lower(4, 0.0),
            Tightening::upper(4, 12.0),
            Tightening::lower(5, 5.0),
            Tightening::upper(5, 11.0),
            Tightening::lower(6, -8.0),
            Tightening::upper(6, 1.0),
        ];
        assert_eq!(bounds.len(), expected.len());
        for t in &expected {
            assert!(bounds.contains(t), "missing {t:?}");
        }
    }
}
