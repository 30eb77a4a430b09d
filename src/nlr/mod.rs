//! Network-level reasoner: a layered intermediate representation of the
//! query used for whole-network reasoning.
//!
//! Layers are created by index, then dependency edges are declared,
//! yielding a DAG (residual and otherwise non-consecutive connections are
//! allowed). Weighted-sum layers carry dense weight blocks per source
//! layer; activation layers carry per-neuron source lists. Every neuron
//! may be mapped to a solver variable, and each layer tracks its current
//! concrete bounds alongside the snapshot taken at `obtain_current_bounds`
//! so that `get_constraint_tightenings` can report exactly the bounds a
//! propagation pass improved.

mod deep_poly;
mod evaluate;
mod interval;
mod lp_relax;
mod symbolic;

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::bounds::{BoundStore, Tightening};
use crate::error::{Error, Result};
use crate::num;
use crate::query::Query;

/// Position of one neuron: `(layer, neuron)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NeuronIndex {
    pub layer: usize,
    pub neuron: usize,
}

impl NeuronIndex {
    pub fn new(layer: usize, neuron: usize) -> Self {
        Self { layer, neuron }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Input,
    WeightedSum,
    Relu,
    AbsoluteValue,
    Sign,
    Round,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Max,
    Softmax,
    Bilinear,
}

impl LayerKind {
    pub fn is_activation(self) -> bool {
        !matches!(self, LayerKind::Input | LayerKind::WeightedSum)
    }
}

#[derive(Clone, Debug)]
pub struct Layer {
    pub(crate) kind: LayerKind,
    pub(crate) size: usize,
    /// Source layer -> its size, for weighted-sum layers.
    pub(crate) source_sizes: BTreeMap<usize, usize>,
    /// Source layer -> dense block, laid out `[source_neuron * size + target]`.
    pub(crate) weights: BTreeMap<usize, Vec<f64>>,
    pub(crate) biases: Vec<f64>,
    /// Per target neuron, ordered activation sources.
    pub(crate) activation_sources: Vec<Vec<NeuronIndex>>,
    pub(crate) neuron_to_variable: Vec<Option<usize>>,
    /// LeakyReLU slope.
    pub(crate) alpha: f64,
    /// Neurons fixed by preprocessing, with their values.
    pub(crate) eliminated: BTreeMap<usize, f64>,
    pub(crate) lb: Vec<f64>,
    pub(crate) ub: Vec<f64>,
    obtained_lb: Vec<f64>,
    obtained_ub: Vec<f64>,
}

impl Layer {
    fn new(kind: LayerKind, size: usize) -> Self {
        Self {
            kind,
            size,
            source_sizes: BTreeMap::new(),
            weights: BTreeMap::new(),
            biases: vec![0.0; size],
            activation_sources: vec![Vec::new(); size],
            neuron_to_variable: vec![None; size],
            alpha: 0.0,
            eliminated: BTreeMap::new(),
            lb: vec![num::negative_infinity(); size],
            ub: vec![num::infinity(); size],
            obtained_lb: vec![num::negative_infinity(); size],
            obtained_ub: vec![num::infinity(); size],
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn lb(&self, neuron: usize) -> f64 {
        self.lb[neuron]
    }

    pub fn ub(&self, neuron: usize) -> f64 {
        self.ub[neuron]
    }

    pub fn neuron_variable(&self, neuron: usize) -> Option<usize> {
        self.neuron_to_variable[neuron]
    }

    pub fn is_eliminated(&self, neuron: usize) -> bool {
        self.eliminated.contains_key(&neuron)
    }

    pub fn eliminated_value(&self, neuron: usize) -> Option<f64> {
        self.eliminated.get(&neuron).copied()
    }

    /// Intersect a freshly computed interval into the stored bounds.
    pub(crate) fn refine(&mut self, neuron: usize, lb: f64, ub: f64) {
        self.lb[neuron] = self.lb[neuron].max(lb);
        self.ub[neuron] = self.ub[neuron].min(ub);
    }
}

#[derive(Clone, Debug, Default)]
pub struct NetworkLevelReasoner {
    layers: BTreeMap<usize, Layer>,
    predecessors: BTreeMap<usize, BTreeSet<usize>>,
    variable_to_neuron: BTreeMap<usize, NeuronIndex>,
}

impl NetworkLevelReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Construction ──────────────────────────────────────────────

    pub fn add_layer(&mut self, index: usize, kind: LayerKind, size: usize) {
        self.layers.insert(index, Layer::new(kind, size));
        self.predecessors.entry(index).or_default();
    }

    pub fn add_layer_dependency(&mut self, source: usize, target: usize) {
        self.predecessors.entry(target).or_default().insert(source);
    }

    pub fn set_weight(
        &mut self,
        source_layer: usize,
        source_neuron: usize,
        target_layer: usize,
        target_neuron: usize,
        weight: f64,
    ) {
        let source_size = self.layers[&source_layer].size;
        let target = self
            .layers
            .get_mut(&target_layer)
            .expect("target layer exists");
        let size = target.size;
        target.source_sizes.insert(source_layer, source_size);
        let block = target
            .weights
            .entry(source_layer)
            .or_insert_with(|| vec![0.0; source_size * size]);
        block[source_neuron * size + target_neuron] = weight;
    }

    pub fn set_bias(&mut self, layer: usize, neuron: usize, bias: f64) {
        self.layers.get_mut(&layer).expect("layer exists").biases[neuron] = bias;
    }

    pub fn add_activation_source(
        &mut self,
        source_layer: usize,
        source_neuron: usize,
        target_layer: usize,
        target_neuron: usize,
    ) {
        let target = self
            .layers
            .get_mut(&target_layer)
            .expect("target layer exists");
        target.activation_sources[target_neuron].push(NeuronIndex::new(source_layer, source_neuron));
    }

    pub fn set_neuron_variable(&mut self, index: NeuronIndex, variable: usize) {
        self.layers
            .get_mut(&index.layer)
            .expect("layer exists")
            .neuron_to_variable[index.neuron] = Some(variable);
        self.variable_to_neuron.insert(variable, index);
    }

    pub fn set_layer_alpha(&mut self, layer: usize, alpha: f64) {
        self.layers.get_mut(&layer).expect("layer exists").alpha = alpha;
    }

    // ─── Access ────────────────────────────────────────────────────

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[&index]
    }

    pub(crate) fn layer_mut(&mut self, index: usize) -> &mut Layer {
        self.layers.get_mut(&index).expect("layer exists")
    }

    pub fn layer_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers.keys().copied()
    }

    pub fn predecessors(&self, layer: usize) -> impl Iterator<Item = usize> + '_ {
        self.predecessors
            .get(&layer)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    pub fn variable_to_neuron(&self, variable: usize) -> Option<NeuronIndex> {
        self.variable_to_neuron.get(&variable).copied()
    }

    pub fn input_layer(&self) -> Result<usize> {
        self.layers
            .iter()
            .find(|(_, l)| l.kind == LayerKind::Input)
            .map(|(&i, _)| i)
            .ok_or_else(|| Error::Internal("network has no input layer".into()))
    }

    pub fn output_layer(&self) -> Result<usize> {
        self.topological_order()?
            .last()
            .copied()
            .ok_or_else(|| Error::Internal("network has no layers".into()))
    }

    /// Topological order of the layer DAG.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut graph = DiGraph::<usize, ()>::new();
        let mut nodes = BTreeMap::new();
        for &index in self.layers.keys() {
            nodes.insert(index, graph.add_node(index));
        }
        for (&target, sources) in &self.predecessors {
            for &source in sources {
                graph.add_edge(nodes[&source], nodes[&target], ());
            }
        }
        let order = toposort(&graph, None)
            .map_err(|_| Error::Internal("cycle in network layer graph".into()))?;
        Ok(order.into_iter().map(|n| graph[n]).collect())
    }

    // ─── Bounds Plumbing ───────────────────────────────────────────

    /// Copy every mapped variable's bounds from the bound store into the
    /// layers, and remember the snapshot.
    pub fn obtain_current_bounds(&mut self, store: &BoundStore) {
        self.obtain_bounds_with(|v| (store.lb(v), store.ub(v)));
    }

    /// Same, but reading a query's bound maps.
    pub fn obtain_current_bounds_from_query(&mut self, query: &Query) {
        self.obtain_bounds_with(|v| (query.lower_bound(v), query.upper_bound(v)));
    }

    fn obtain_bounds_with(&mut self, bounds_of: impl Fn(usize) -> (f64, f64)) {
        for layer in self.layers.values_mut() {
            for neuron in 0..layer.size {
                let (lb, ub) = match layer.neuron_to_variable[neuron] {
                    Some(v) => bounds_of(v),
                    None => match layer.eliminated.get(&neuron) {
                        Some(&x) => (x, x),
                        None => (num::negative_infinity(), num::infinity()),
                    },
                };
                layer.lb[neuron] = lb;
                layer.ub[neuron] = ub;
                layer.obtained_lb[neuron] = lb;
                layer.obtained_ub[neuron] = ub;
            }
        }
    }

    /// Flush every bound a propagation pass strictly improved.
    pub fn get_constraint_tightenings(&self, out: &mut Vec<Tightening>) {
        for layer in self.layers.values() {
            for neuron in 0..layer.size {
                let Some(variable) = layer.neuron_to_variable[neuron] else {
                    continue;
                };
                if num::gt(layer.lb[neuron], layer.obtained_lb[neuron]) {
                    out.push(Tightening::lower(variable, layer.lb[neuron]));
                }
                if num::lt(layer.ub[neuron], layer.obtained_ub[neuron]) {
                    out.push(Tightening::upper(variable, layer.ub[neuron]));
                }
            }
        }
    }

    // ─── Preprocessor Hooks ────────────────────────────────────────

    /// A variable became fixed: pin its neuron to the value.
    pub fn eliminate_variable(&mut self, variable: usize, value: f64) {
        if let Some(index) = self.variable_to_neuron.remove(&variable) {
            let layer = self.layers.get_mut(&index.layer).expect("layer exists");
            layer.neuron_to_variable[index.neuron] = None;
            layer.eliminated.insert(index.neuron, value);
        }
    }

    /// Renumber variables after elimination and merging.
    pub fn update_variable_indices(
        &mut self,
        old_to_new: &BTreeMap<usize, usize>,
        merged: &BTreeMap<usize, usize>,
    ) {
        let resolve = |mut v: usize| -> usize {
            while let Some(&m) = merged.get(&v) {
                v = m;
            }
            old_to_new.get(&v).copied().unwrap_or(v)
        };
        let mut renamed = BTreeMap::new();
        for (old, index) in std::mem::take(&mut self.variable_to_neuron) {
            let new = resolve(old);
            let layer = self.layers.get_mut(&index.layer).expect("layer exists");
            layer.neuron_to_variable[index.neuron] = Some(new);
            renamed.insert(new, index);
        }
        self.variable_to_neuron = renamed;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// The 2-3-2 ReLU network shared by the propagation tests:
    ///
    /// ```text
    ///         a
    ///   x           d    f
    ///         b
    ///   y           e    g
    ///         c
    /// ```
    pub fn populate_network(nlr: &mut NetworkLevelReasoner) {
        nlr.add_layer(0, LayerKind::Input, 2);
        nlr.add_layer(1, LayerKind::WeightedSum, 3);
        nlr.add_layer(2, LayerKind::Relu, 3);
        nlr.add_layer(3, LayerKind::WeightedSum, 2);
        nlr.add_layer(4, LayerKind::Relu, 2);
        nlr.add_layer(5, LayerKind::WeightedSum, 2);

        for i in 1..=5 {
            nlr.add_layer_dependency(i - 1, i);
        }

        nlr.set_weight(0, 0, 1, 0, 1.0);
        nlr.set_weight(0, 0, 1, 1, 2.0);
        nlr.set_weight(0, 1, 1, 1, -3.0);
        nlr.set_weight(0, 1, 1, 2, 1.0);

        nlr.set_weight(2, 0, 3, 0, 1.0);
        nlr.set_weight(2, 0, 3, 1, -1.0);
        nlr.set_weight(2, 1, 3, 0, 1.0);
        nlr.set_weight(2, 1, 3, 1, 1.0);
        nlr.set_weight(2, 2, 3, 0, -1.0);
        nlr.set_weight(2, 2, 3, 1, -1.0);

        nlr.set_weight(4, 0, 5, 0, 1.0);
        nlr.set_weight(4, 0, 5, 1, 1.0);
        nlr.set_weight(4, 1, 5, 1, 3.0);

        nlr.set_bias(1, 0, 1.0);
        nlr.set_bias(3, 1, 2.0);

        nlr.add_activation_source(1, 0, 2, 0);
        nlr.add_activation_source(1, 1, 2, 1);
        nlr.add_activation_source(1, 2, 2, 2);
        nlr.add_activation_source(3, 0, 4, 0);
        nlr.add_activation_source(3, 1, 4, 1);

        nlr.set_neuron_variable(NeuronIndex::new(0, 0), 0);
        nlr.set_neuron_variable(NeuronIndex::new(0, 1), 1);
        nlr.set_neuron_variable(NeuronIndex::new(1, 0), 2);
        nlr.set_neuron_variable(NeuronIndex::new(1, 1), 4);
        nlr.set_neuron_variable(NeuronIndex::new(1, 2), 6);
        nlr.set_neuron_variable(NeuronIndex::new(2, 0), 3);
        nlr.set_neuron_variable(NeuronIndex::new(2, 1), 5);
        nlr.set_neuron_variable(NeuronIndex::new(2, 2), 7);
        nlr.set_neuron_variable(NeuronIndex::new(3, 0), 8);
        nlr.set_neuron_variable(NeuronIndex::new(3, 1), 10);
        nlr.set_neuron_variable(NeuronIndex::new(4, 0), 9);
        nlr.set_neuron_variable(NeuronIndex::new(4, 1), 11);
        nlr.set_neuron_variable(NeuronIndex::new(5, 0), 12);
        nlr.set_neuron_variable(NeuronIndex::new(5, 1), 13);
    }

    /// The 2-2-2-2 ReLU network from the DeepPoly literature (fig. 2 of
    /// the 3563325 paper, with ReLU activations).
    pub fn populate_backward_relu_network(nlr: &mut NetworkLevelReasoner) {
        nlr.add_layer(0, LayerKind::Input, 2);
        nlr.add_layer(1, LayerKind::WeightedSum, 2);
        nlr.add_layer(2, LayerKind::Relu, 2);
        nlr.add_layer(3, LayerKind::WeightedSum, 2);
        nlr.add_layer(4, LayerKind::Relu, 2);
        nlr.add_layer(5, LayerKind::WeightedSum, 2);

        for i in 1..=5 {
            nlr.add_layer_dependency(i - 1, i);
        }

        nlr.set_weight(0, 0, 1, 0, 1.0);
        nlr.set_weight(0, 0, 1, 1, 1.0);
        nlr.set_weight(0, 1, 1, 0, -1.0);
        nlr.set_weight(0, 1, 1, 1, 1.0);

        nlr.set_weight(2, 0, 3, 0, -1.0);
        nlr.set_weight(2, 0, 3, 1, 2.0);
        nlr.set_weight(2, 1, 3, 0, 1.0);
        nlr.set_weight(2, 1, 3, 1, -1.0);

        nlr.set_weight(4, 0, 5, 0, -1.0);
        nlr.set_weight(4, 0, 5, 1, 1.0);
        nlr.set_weight(4, 1, 5, 0, -1.0);
        nlr.set_weight(4, 1, 5, 1, 2.0);

        nlr.set_bias(5, 1, 2.0);

        nlr.add_activation_source(1, 0, 2, 0);
        nlr.add_activation_source(1, 1, 2, 1);
        nlr.add_activation_source(3, 0, 4, 0);
        nlr.add_activation_source(3, 1, 4, 1);

        for (layer, neuron, variable) in [
            (0, 0, 0),
            (0, 1, 1),
            (1, 0, 2),
            (1, 1, 3),
            (2, 0, 4),
            (2, 1, 5),
            (3, 0, 6),
            (3, 1, 7),
            (4, 0, 8),
            (4, 1, 9),
            (5, 0, 10),
            (5, 1, 11),
        ] {
            nlr.set_neuron_variable(NeuronIndex::new(layer, neuron), variable);
        }
    }

    pub fn bound_store_with(nlr_vars: usize, bounds: &[(usize, f64, f64)]) -> BoundStore {
        let mut store = BoundStore::new(nlr_vars);
        for &(v, lb, ub) in bounds {
            store.set_lb(v, lb);
            store.set_ub(v, ub);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_topological_order_respects_dependencies() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);
        let order = nlr.topological_order().unwrap();
        assert_eq!(order.len(), 6);
        let pos = |l: usize| order.iter().position(|&x| x == l).unwrap();
        for i in 1..=5 {
            assert!(pos(i - 1) < pos(i));
        }
    }

    #[test]
    fn test_obtain_and_flush_bounds() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);
        let mut store = BoundStore::new(14);
        for v in 0..14 {
            store.set_lb(v, -10.0);
            store.set_ub(v, 10.0);
        }
        nlr.obtain_current_bounds(&store);
        assert_eq!(nlr.layer(1).lb(0), -10.0);

        // Nothing improved: no tightenings.
        let mut out = Vec::new();
        nlr.get_constraint_tightenings(&mut out);
        assert!(out.is_empty());

        // Refine one neuron and flush.
        nlr.layer_mut(1).refine(0, -2.0, 3.0);
        nlr.get_constraint_tightenings(&mut out);
        assert_eq!(out.len(), 2);
        assert!(out.contains(&Tightening::lower(2, -2.0)));
        assert!(out.contains(&Tightening::upper(2, 3.0)));
    }

    #[test]
    fn test_eliminate_variable_pins_neuron() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);
        nlr.eliminate_variable(3, 2.0);
        assert!(nlr.layer(2).is_eliminated(0));
        assert_eq!(nlr.layer(2).eliminated_value(0), Some(2.0));
        assert!(nlr.variable_to_neuron(3).is_none());
    }

    #[test]
    fn test_update_variable_indices() {
        let mut nlr = NetworkLevelReasoner::new();
        populate_network(&mut nlr);
        let old_to_new: BTreeMap<usize, usize> = [(13, 14)].into_iter().collect();
        let merged = BTreeMap::new();
        nlr.update_variable_indices(&old_to_new, &merged);
        assert_eq!(nlr.variable_to_neuron(14), Some(NeuronIndex::new(5, 1)));
        assert!(nlr.variable_to_neuron(13).is_none());
        assert_eq!(nlr.layer(5).neuron_variable(1), Some(14));
    }
}
