//! Interval-arithmetic bound propagation: one forward sweep through the
//! layer DAG, transforming bounds per activation monotonicity.

use crate::error::Result;
use crate::nonlinear::{sigmoid, SoftmaxConstraint};
use crate::num;

use super::{Layer, LayerKind, NetworkLevelReasoner, NeuronIndex};

impl NetworkLevelReasoner {
    pub fn interval_arithmetic_propagation(&mut self) -> Result<()> {
        let input_layer = self.input_layer()?;
        for index in self.topological_order()? {
            if index == input_layer {
                continue;
            }
            let (lbs, ubs) = self.interval_pass_layer(index)?;
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

    pub(crate) fn interval_pass_layer(&self, index: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        let layer = self.layer(index);
        let mut lbs = vec![num::negative_infinity(); layer.size];
        let mut ubs = vec![num::infinity(); layer.size];

        match layer.kind {
            LayerKind::Input => {
                lbs.copy_from_slice(&layer.lb);
                ubs.copy_from_slice(&layer.ub);
            }
            LayerKind::WeightedSum => {
                for t in 0..layer.size {
                    lbs[t] = layer.biases[t];
                    ubs[t] = layer.biases[t];
                }
                for (&source, block) in &layer.weights {
                    let source_layer = self.layer(source);
                    for s in 0..layer.source_sizes[&source] {
                        let (sl, su) = self.neuron_interval(source_layer, s);
                        for t in 0..layer.size {
                            let w = block[s * layer.size + t];
                            if w >= 0.0 {
                                lbs[t] += w * sl;
                                ubs[t] += w * su;
                            } else {
                                lbs[t] += w * su;
                                ubs[t] += w * sl;
                            }
                        }
                    }
                }
            }
            _ => {
                for t in 0..layer.size {
                    if layer.eliminated.contains_key(&t) {
                        continue;
                    }
                    let sources = &layer.activation_sources[t];
                    let intervals: Vec<(f64, f64)> = sources
                        .iter()
                        .map(|n| self.neuron_interval(self.layer(n.layer), n.neuron))
                        .collect();
                    let Some(&(l, u)) = intervals.first() else {
                        continue;
                    };
                    let (lo, hi) = match layer.kind {
                        LayerKind::Relu => (l.max(0.0), u.max(0.0)),
                        LayerKind::AbsoluteValue => {
                            if l >= 0.0 {
                                (l, u)
                            } else if u <= 0.0 {
                                (-u, -l)
                            } else {
                                (0.0, (-l).max(u))
                            }
                        }
                        LayerKind::Sign => (
                            if num::is_negative(l) { -1.0 } else { 1.0 },
                            if num::is_negative(u) { -1.0 } else { 1.0 },
                        ),
                        LayerKind::Round => (num::round(l), num::round(u)),
                        LayerKind::LeakyRelu => {
                            let map = |x: f64| if x >= 0.0 { x } else { layer.alpha * x };
                            (map(l), map(u))
                        }
                        LayerKind::Sigmoid => (sigmoid(l), sigmoid(u)),
                        LayerKind::Tanh => (l.tanh(), u.tanh()),
                        LayerKind::Max => intervals.iter().fold(
                            (num::negative_infinity(), num::negative_infinity()),
                            |(alo, ahi), &(sl, su)| (alo.max(sl), ahi.max(su)),
                        ),
                        LayerKind::Softmax => {
                            let position = t.min(intervals.len() - 1);
                            softmax_box(&intervals, position)
                        }
                        LayerKind::Bilinear => {
                            let (xl, xu) = intervals[0];
                            let (yl, yu) = intervals[1];
                            let corners = [xl * yl, xl * yu, xu * yl, xu * yu];
                            (
                                corners.iter().copied().fold(f64::INFINITY, f64::min),
                                corners.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                            )
                        }
                        LayerKind::Input | LayerKind::WeightedSum => unreachable!(),
                    };
                    lbs[t] = lo;
                    ubs[t] = hi;
                }
            }
        }
        Ok((lbs, ubs))
    }

    pub(crate) fn neuron_interval(&self, layer: &Layer, neuron: usize) -> (f64, f64) {
        match layer.eliminated.get(&neuron) {
            Some(&x) => (x, x),
            None => (layer.lb[neuron], layer.ub[neuron]),
        }
    }

    pub(crate) fn source_interval(&self, index: &NeuronIndex) -> (f64, f64) {
        self.neuron_interval(self.layer(index.layer), index.neuron)
    }
}

/// Extremal softmax outputs over a box of logits: smallest with the own
/// logit low and rivals high, largest the other way around.
pub(crate) fn softmax_box(intervals: &[(f64, f64)], position: usize) -> (f64, f64) {
    if intervals
        .iter()
        .any(|&(l, u)| !num::is_finite(l) || !num::is_finite(u))
    {
        return (0.0, 1.0);
    }
    let worst: Vec<f64> = intervals
        .iter()
        .enumerate()
        .map(|(j, &(l, u))| if j == position { l } else { u })
        .collect();
    let best: Vec<f64> = intervals
        .iter()
        .enumerate()
        .map(|(j, &(l, u))| if j == position { u } else { l })
        .collect();
    (
        SoftmaxConstraint::evaluate(&worst)[position],
        SoftmaxConstraint::evaluate(&best)[position],
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::*;
    use crate::bounds::Tightening;

    /// Expected values mirror the interval pass over the shared 2-3-2
    /// network with inputs in [-1, 1]².
    #[test]
    fn test_interval_propagation_relu_network() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);

        let large = 1000.0;
        let mut spec = vec![(0, -1.0, 1.0), (1, -1.0, 1.0)];
        for v in 2..14 {
            spec.push((v, -large, large));
        }
        let store = bound_store_with(14, &spec);

        nlr.obtain_current_bounds(&store);
        nlr.interval_arithmetic_propagation().unwrap();

        let mut bounds = Vec::new();
        nlr.get_constraint_tightenings(&mut bounds);

        let expected = [
            Tightening::lower(2, 0.0),
            Tightening::upper(2, 2.0),
            Tightening::lower(3, 0.0),
            Tightening::upper(3, 2.0),
            Tightening::lower(4, -5.0),
            Tightening::upper(4, 5.0),
            Tightening::lower(5, 0.0),
            Tightening::upper(5, 5.0),
            Tightening::lower(6, -1.0),
            Tightening::upper(6, 1.0),
            Tightening::lower(7, 0.0),
            Tightening::upper(7, 1.0),
            Tightening::lower(8, -1.0),
            Tightening::upper(8, 7.0),
            Tightening::lower(9, 0.0),
            Tightening::upper(9, 7.0),
            Tightening::lower(10, -1.0),
            Tightening::upper(10, 7.0),
            Tightening::lower(11, 0.0),
            Tightening::upper(11, 7.0),
            Tightening::lower(12, 0.0),
            Tightening::upper(12, 7.0),
            Tightening::lower(13, 0.0),
            Tightening::upper(13, 28.0),
        ];
        assert_eq!(bounds.len(), expected.len());
        for tightening in &expected {
            assert!(bounds.contains(tightening), "missing {tightening:?}");
        }
    }

    #[test]
    fn test_interval_propagation_wider_inputs() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);

        let large = 1000.0;
        let mut spec = vec![(0, -3.0, 1.0), (1, -1.0, 2.0)];
        for v in 2..14 {
            spec.push((v, -large, large));
        }
        let store = bound_store_with(14, &spec);

        nlr.obtain_current_bounds(&store);
        nlr.interval_arithmetic_propagation().unwrap();

        let mut bounds = Vec::new();
        nlr.get_constraint_tightenings(&mut bounds);

        let expected = [
            Tightening::lower(2, -2.0),
            Tightening::upper(2, 2.0),
            Tightening::lower(3, 0.0),
            Tightening::upper(3, 2.0),
            Tightening::lower(4, -12.0),
            Tightening::upper(4, 5.0),
            Tightening::lower(5, 0.0),
            Tightening::upper(5, 5.0),
            Tightening::lower(6, -1.0),
            Tightening::upper(6, 2.0),
            Tightening::lower(7, 0.0),
            Tightening::upper(7, 2.0),
            Tightening::lower(8, -2.0),
            Tightening::upper(8, 7.0),
            Tightening::lower(9, 0.0),
            Tightening::upper(9, 7.0),
            Tightening::lower(10, -2.0),
            Tightening::upper(10, 7.0),
            Tightening::lower(11, 0.0),
            Tightening::upper(11, 7.0),
            Tightening::lower(12, 0.0),
            Tightening::upper(12, 7.0),
            Tightening::lower(13, 0.0),
            Tightening::upper(13, 28.0),
        ];
        assert_eq!(bounds.len(), expected.len());
        for tightening in &expected {
            assert!(bounds.contains(tightening), "missing {tightening:?}");
        }
    }

    #[test]
    fn test_interval_pass_never_widens() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);
        let mut spec = vec![(0, -1.0, 1.0), (1, -1.0, 1.0)];
        for v in 2..14 {
            spec.push((v, -1000.0, 1000.0));
        }
        // Variable 4 already has a tight bound; the pass must keep it.
        spec[4] = (4, -1.0, 1.0);
        let store = bound_store_with(14, &spec);
        nlr.obtain_current_bounds(&store);
        nlr.interval_arithmetic_propagation().unwrap();
        assert!(nlr.layer(1).lb(1) >= -1.0);
        assert!(nlr.layer(1).ub(1) <= 1.0);
    }
}
