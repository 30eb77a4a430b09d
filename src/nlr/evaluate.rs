//! Concrete forward evaluation of the network.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::nonlinear::{sigmoid, SoftmaxConstraint};
use crate::num;
use crate::tableau::Assignment;

use super::{LayerKind, NetworkLevelReasoner};

impl NetworkLevelReasoner {
    /// One forward pass; `input` follows the input layer's neuron order.
    pub fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>> {
        let values = self.forward(input)?;
        let output_layer = self.output_layer()?;
        Ok(values[&output_layer].clone())
    }

    /// Vectorized evaluate over many samples. Workers share the network
    /// read-only and write disjoint rows.
    pub fn simulate(&self, inputs: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        inputs.par_iter().map(|row| self.evaluate(row)).collect()
    }

    /// Forward-simulate from a variable assignment of the input layer and
    /// read back a value for every mapped neuron.
    pub fn concretize_input_assignment(
        &self,
        assignment: &Assignment,
    ) -> Result<BTreeMap<usize, f64>> {
        let input_layer = self.input_layer()?;
        let layer = self.layer(input_layer);
        let mut input = vec![0.0; layer.size()];
        for (neuron, slot) in input.iter_mut().enumerate() {
            if let Some(v) = layer.neuron_variable(neuron) {
                *slot = assignment.value(v);
            }
        }
        let values = self.forward(&input)?;
        let mut result = BTreeMap::new();
        for index in self.layer_indices() {
            let layer = self.layer(index);
            for neuron in 0..layer.size() {
                if let Some(v) = layer.neuron_variable(neuron) {
                    result.insert(v, values[&index][neuron]);
                }
            }
        }
        Ok(result)
    }

    pub(crate) fn forward(&self, input: &[f64]) -> Result<BTreeMap<usize, Vec<f64>>> {
        let input_layer = self.input_layer()?;
        if input.len() != self.layer(input_layer).size() {
            return Err(Error::Internal(format!(
                "evaluate: expected {} inputs, got {}",
                self.layer(input_layer).size(),
                input.len()
            )));
        }

        let mut values: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for index in self.topological_order()? {
            let layer = self.layer(index);
            let mut row = if index == input_layer {
                input.to_vec()
            } else {
                match layer.kind() {
                    LayerKind::WeightedSum => {
                        let mut row = layer.biases.clone();
                        for (&source, block) in &layer.weights {
                            let source_values = &values[&source];
                            let source_size = layer.source_sizes[&source];
                            for s in 0..source_size {
                                let x = source_values[s];
                                for t in 0..layer.size() {
                                    row[t] += block[s * layer.size() + t] * x;
                                }
                            }
                        }
                        row
                    }
                    _ => self.evaluate_activation(layer, &values)?,
                }
            };
            for (&neuron, &value) in &layer.eliminated {
                row[neuron] = value;
            }
            values.insert(index, row);
        }
        Ok(values)
    }

    fn evaluate_activation(
        &self,
        layer: &super::Layer,
        values: &BTreeMap<usize, Vec<f64>>,
    ) -> Result<Vec<f64>> {
        let source_value = |n: &super::NeuronIndex| values[&n.layer][n.neuron];
        let mut row = vec![0.0; layer.size()];
        for (t, slot) in row.iter_mut().enumerate() {
            let sources = &layer.activation_sources[t];
            if sources.is_empty() {
                if layer.eliminated.contains_key(&t) {
                    continue;
                }
                return Err(Error::Internal(format!(
                    "activation neuron {t} has no sources"
                )));
            }
            let x = source_value(&sources[0]);
            *slot = match layer.kind() {
                LayerKind::Relu => x.max(0.0),
                LayerKind::AbsoluteValue => x.abs(),
                LayerKind::Sign => {
                    if num::is_negative(x) {
                        -1.0
                    } else {
                        1.0
                    }
                }
                LayerKind::Round => num::round(x),
                LayerKind::LeakyRelu => {
                    if x >= 0.0 {
                        x
                    } else {
                        layer.alpha * x
                    }
                }
                LayerKind::Sigmoid => sigmoid(x),
                LayerKind::Tanh => x.tanh(),
                LayerKind::Max => sources
                    .iter()
                    .map(source_value)
                    .fold(f64::NEG_INFINITY, f64::max),
                LayerKind::Softmax => {
                    let logits: Vec<f64> = sources.iter().map(source_value).collect();
                    let position = t.min(logits.len() - 1);
                    SoftmaxConstraint::evaluate(&logits)[position]
                }
                LayerKind::Bilinear => {
                    if sources.len() != 2 {
                        return Err(Error::Internal(
                            "bilinear neuron needs exactly two sources".into(),
                        ));
                    }
                    x * source_value(&sources[1])
                }
                LayerKind::Input | LayerKind::WeightedSum => unreachable!(),
            };
        }
        Ok(row)
    }
}
