//! LP-relaxation bound tightening over the layered network.
//!
//! Builds one LP whose constraints are the union of every weighted-sum
//! layer's exact equation, every activation neuron's lower and upper
//! relaxation lines under its current bounds, and the current variable
//! boxes. For each neuron whose interval has positive width it solves
//! `min x` and `max x` and keeps any strictly better bound. In
//! backward-converge mode the pass repeats until a full round stops
//! improving anything beyond the tolerance.

use std::collections::BTreeMap;

use good_lp::solvers::clarabel::clarabel;
use good_lp::{
    constraint, variable, variables, Expression, ResolutionError, Solution, SolverModel, Variable,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::num;

use super::{LayerKind, NetworkLevelReasoner, NeuronIndex};

impl NetworkLevelReasoner {
    /// One LP tightening round. Returns whether any bound strictly moved.
    pub fn lp_relaxation_propagation(&mut self) -> Result<bool> {
        let input_layer = self.input_layer()?;
        let order = self.topological_order()?;
        let mut improved_any = false;

        // Work layer by layer from the output backwards; each solved bound
        // feeds the LPs of the layers before it.
        for &index in order.iter().rev() {
            if index == input_layer {
                continue;
            }
            let layer_size = self.layer(index).size;
            for neuron in 0..layer_size {
                if self.layer(index).eliminated.contains_key(&neuron) {
                    continue;
                }
                let lb = self.layer(index).lb[neuron];
                let ub = self.layer(index).ub[neuron];
                if num::are_equal(lb, ub) {
                    continue;
                }
                let target = NeuronIndex::new(index, neuron);
                let lo = self.solve_neuron_bound(target, false)?;
                let hi = self.solve_neuron_bound(target, true)?;
                let layer = self.layer_mut(index);
                if let Some(lo) = lo {
                    if num::gt(lo, layer.lb[neuron]) {
                        layer.lb[neuron] = lo;
                        improved_any = true;
                    }
                }
                if let Some(hi) = hi {
                    if num::lt(hi, layer.ub[neuron]) {
                        layer.ub[neuron] = hi;
                        improved_any = true;
                    }
                }
            }
        }
        Ok(improved_any)
    }

    /// Iterate LP rounds to a fixed point.
    pub fn lp_relaxation_converge(&mut self) -> Result<()> {
        while self.lp_relaxation_propagation()? {}
        Ok(())
    }

    fn solve_neuron_bound(&self, target: NeuronIndex, maximize: bool) -> Result<Option<f64>> {
        let mut vars = variables!();
        let mut handles: BTreeMap<NeuronIndex, Variable> = BTreeMap::new();

        for index in self.layer_indices() {
            let layer = self.layer(index);
            for neuron in 0..layer.size {
                let (lb, ub) = self.neuron_interval(layer, neuron);
                let mut spec = variable();
                if num::is_finite(lb) {
                    spec = spec.min(lb);
                }
                if num::is_finite(ub) {
                    spec = spec.max(ub);
                }
                handles.insert(NeuronIndex::new(index, neuron), vars.add(spec));
            }
        }

        let objective = if maximize {
            -1.0 * handles[&target]
        } else {
            1.0 * handles[&target]
        };
        let mut problem = vars.minimise(objective).using(clarabel);

        for index in self.layer_indices() {
            let layer = self.layer(index);
            match layer.kind {
                LayerKind::Input => {}
                LayerKind::WeightedSum => {
                    for t in 0..layer.size {
                        if layer.eliminated.contains_key(&t) {
                            continue;
                        }
                        let mut expr = Expression::from(layer.biases[t]);
                        for (&source, block) in &layer.weights {
                            for s in 0..layer.source_sizes[&source] {
                                let w = block[s * layer.size + t];
                                if w == 0.0 {
                                    continue;
                                }
                                let source_index = NeuronIndex::new(source, s);
                                match self.layer(source).eliminated.get(&s) {
                                    Some(&value) => expr += w * value,
                                    None => expr += w * handles[&source_index],
                                }
                            }
                        }
                        problem =
                            problem.with(constraint::eq(expr, handles[&NeuronIndex::new(index, t)]));
                    }
                }
                _ => {
                    let relaxation = self.build_relaxation(index);
                    for t in 0..layer.size {
                        if layer.eliminated.contains_key(&t) {
                            continue;
                        }
                        let out = handles[&NeuronIndex::new(index, t)];
                        for (line, is_lower) in [
                            (relaxation.lower[t], true),
                            (relaxation.upper[t], false),
                        ] {
                            if !num::is_finite(line.offset) {
                                continue;
                            }
                            let mut rhs = Expression::from(line.offset);
                            if line.slope != 0.0 {
                                rhs += line.slope * handles[&line.source];
                            }
                            problem = problem.with(if is_lower {
                                constraint::geq(1.0 * out, rhs)
                            } else {
                                constraint::leq(1.0 * out, rhs)
                            });
                        }
                        // ReLU-family outputs keep both triangle undersides.
                        if matches!(layer.kind, LayerKind::Relu) {
                            let source = layer.activation_sources[t][0];
                            problem = problem.with(constraint::geq(1.0 * out, 0.0));
                            problem =
                                problem.with(constraint::geq(1.0 * out, 1.0 * handles[&source]));
                        }
                        if matches!(layer.kind, LayerKind::AbsoluteValue) {
                            let source = layer.activation_sources[t][0];
                            problem = problem.with(constraint::geq(1.0 * out, 1.0 * handles[&source]));
                            problem =
                                problem.with(constraint::geq(1.0 * out, -1.0 * handles[&source]));
                        }
                        if matches!(layer.kind, LayerKind::LeakyRelu) {
                            let source = layer.activation_sources[t][0];
                            problem = problem.with(constraint::geq(1.0 * out, 1.0 * handles[&source]));
                            problem = problem
                                .with(constraint::geq(1.0 * out, layer.alpha * handles[&source]));
                        }
                    }
                }
            }
        }

        match problem.solve() {
            Ok(solution) => {
                let value = solution.value(handles[&target]);
                Ok(Some(value))
            }
            Err(ResolutionError::Infeasible) => {
                debug!("LP relaxation infeasible while bounding a neuron");
                Ok(None)
            }
            Err(e) => Err(Error::ExternalSolver(format!("{e:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::*;
    use crate::bounds::Tightening;
    use crate::num;

    /// After DeepPoly on the fig-2 network, the LP pass recovers exactly
    /// the one bound DeepPoly's single-line choice lost: lb(x8) = 0.
    #[test]
    fn test_backward_lp_after_deep_poly() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_backward_relu_network(&mut nlr);

        let large = 1_000_000.0;
        let mut spec = vec![(0, 0.0, 1.0), (1, 0.0, 1.0)];
        for v in 2..12 {
            spec.push((v, -large, large));
        }
        let mut store = bound_store_with(12, &spec);
        nlr.obtain_current_bounds(&store);
        nlr.deep_poly_propagation().unwrap();

        // Feed the DeepPoly results back and run the LP pass.
        let mut bounds = Vec::new();
        nlr.get_constraint_tightenings(&mut bounds);
        for t in &bounds {
            match t.bound {
                crate::bounds::BoundType::Lower => store.set_lb(t.variable, t.value),
                crate::bounds::BoundType::Upper => store.set_ub(t.variable, t.value),
            }
        }
        nlr.obtain_current_bounds(&store);
        nlr.lp_relaxation_propagation().unwrap();

        let mut lp_bounds = Vec::new();
        nlr.get_constraint_tightenings(&mut lp_bounds);
        assert!(lp_bounds.contains(&Tightening::lower(8, 0.0)));

        // The LP pass must not widen anything DeepPoly established.
        for t in &lp_bounds {
            match t.bound {
                crate::bounds::BoundType::Lower => assert!(num::gte(t.value, store.lb(t.variable))),
                crate::bounds::BoundType::Upper => assert!(num::lte(t.value, store.ub(t.variable))),
            }
        }
    }

    #[test]
    fn test_bound_on_output_includes_published_interval() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_backward_relu_network(&mut nlr);
        let large = 1_000_000.0;
        let mut spec = vec![(0, 0.0, 1.0), (1, 0.0, 1.0)];
        for v in 2..12 {
            spec.push((v, -large, large));
        }
        let store = bound_store_with(12, &spec);
        nlr.obtain_current_bounds(&store);
        nlr.deep_poly_propagation().unwrap();
        // x11 lands exactly on [1.5, 4.4].
        assert!(num::are_equal_eps(nlr.layer(5).lb(1), 1.5, 1e-4));
        assert!(num::are_equal_eps(nlr.layer(5).ub(1), 4.4, 1e-4));
    }
}
