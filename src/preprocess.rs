//! Query preprocessing.
//!
//! Runs to a fixed point:
//!
//! 1. Auxiliary-variable transforms for the constraints that want slacks.
//! 2. GE/LE equations normalised to EQ with a slack variable.
//! 3. Interval tightening from equations (isolate each variable in turn).
//! 4. Tightening from PL and nonlinear constraints.
//! 5. Elimination of fixed and unused variables, with substitution through
//!    equations and constraints.
//! 6. Merging of identical variables (`c·xᵢ - c·xⱼ = 0`).
//!
//! Afterwards the surviving variables are renumbered compactly, the
//! old→new and merged maps are kept for solution reconstruction, and an
//! attempt is made to recognise the network topology.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::bounds::{BoundType, Tightening};
use crate::equation::{Equation, Relation};
use crate::error::{Error, Result};
use crate::nlr::{LayerKind, NetworkLevelReasoner, NeuronIndex};
use crate::nonlinear::NonlinearConstraint;
use crate::num;
use crate::plc::PlConstraint;
use crate::query::Query;

#[derive(Clone, Debug, Default)]
pub struct Preprocessor {
    /// Old index -> fixed value, for variables eliminated as constants.
    eliminated: BTreeMap<usize, f64>,
    /// Old index -> old index it was merged into.
    merged: BTreeMap<usize, usize>,
    /// Old surviving index -> new compact index.
    old_to_new: BTreeMap<usize, usize>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preprocess(&mut self, query: Query) -> Result<Query> {
        self.preprocess_with(query, true)
    }

    /// `eliminate = false` keeps every variable in place (no renumbering),
    /// which the bound-analysis tests rely on.
    pub fn preprocess_with(&mut self, mut query: Query, eliminate: bool) -> Result<Query> {
        self.transform_constraints(&mut query);
        self.make_all_equations_equalities(&mut query);

        loop {
            let mut changed = self.tighten_bounds_to_fixed_point(&mut query)?;
            if eliminate {
                changed |= self.eliminate_fixed_and_unused(&mut query)?;
                changed |= self.merge_identical_variables(&mut query)?;
            }
            if !changed {
                break;
            }
        }

        if eliminate {
            self.renumber(&mut query);
        }

        if construct_network(&mut query) {
            info!(
                layers = query.network().map(|n| n.num_layers()).unwrap_or(0),
                "network-level reasoner constructed"
            );
        }

        Ok(query)
    }

    // ─── Accessors for Downstream Callers ──────────────────────────

    pub fn variable_is_merged(&self, variable: usize) -> bool {
        self.merged.contains_key(&variable)
    }

    pub fn merged_index(&self, variable: usize) -> usize {
        let mut v = variable;
        while let Some(&m) = self.merged.get(&v) {
            v = m;
        }
        v
    }

    pub fn variable_is_fixed(&self, variable: usize) -> bool {
        self.eliminated.contains_key(&variable)
    }

    pub fn fixed_value(&self, variable: usize) -> Option<f64> {
        self.eliminated.get(&variable).copied()
    }

    /// New compact index of a surviving old variable.
    pub fn new_index(&self, variable: usize) -> Option<usize> {
        self.old_to_new.get(&self.merged_index(variable)).copied()
    }

    /// Write solution values for every original variable, resolving
    /// eliminated and merged ones through the recorded maps.
    pub fn reconstruct_solution(&self, processed: &Query, original: &mut Query) {
        for v in 0..original.num_variables() {
            let value = if let Some(&x) = self.eliminated.get(&v) {
                x
            } else if let Some(new) = self.new_index(v) {
                processed.solution_value(new)
            } else {
                0.0
            };
            original.set_solution_value(v, value);
        }
    }

    // ─── Pass 1: Aux Transforms ────────────────────────────────────

    fn transform_constraints(&mut self, query: &mut Query) {
        let mut constraints = std::mem::take(query.pl_constraints_mut());
        for constraint in &mut constraints {
            constraint.transform_to_use_aux_variables(query);
        }
        *query.pl_constraints_mut() = constraints;
    }

    // ─── Pass 2: Equalities ────────────────────────────────────────

    fn make_all_equations_equalities(&mut self, query: &mut Query) {
        let mut equations = std::mem::take(query.equations_mut());
        for eq in &mut equations {
            match eq.relation {
                Relation::Eq => {}
                Relation::Le => {
                    let slack = query.new_variable();
                    query.set_lower_bound(slack, 0.0);
                    eq.add_addend(1.0, slack);
                    eq.relation = Relation::Eq;
                }
                Relation::Ge => {
                    let slack = query.new_variable();
                    query.set_upper_bound(slack, 0.0);
                    eq.add_addend(1.0, slack);
                    eq.relation = Relation::Eq;
                }
            }
        }
        *query.equations_mut() = equations;
    }

    // ─── Passes 3 & 4: Bound Tightening ────────────────────────────

    fn tighten_bounds_to_fixed_point(&mut self, query: &mut Query) -> Result<bool> {
        let mut ever_changed = false;
        loop {
            let mut changed = self.tighten_from_equations(query)?;
            changed |= self.tighten_from_constraints(query)?;
            if !changed {
                return Ok(ever_changed);
            }
            ever_changed = true;
        }
    }

    fn check_feasible(query: &Query, variable: usize) -> Result<()> {
        if query.lower_bound(variable) > query.upper_bound(variable) + num::EPSILON {
            return Err(Error::InfeasibleQuery);
        }
        Ok(())
    }

    fn tighten_from_equations(&mut self, query: &mut Query) -> Result<bool> {
        let mut changed = false;
        let equations = query.equations().to_vec();
        for eq in &equations {
            let mut normalized = eq.clone();
            normalized.normalize();
            for target in normalized.variables().collect::<Vec<_>>() {
                let c = normalized.coefficient(target);
                if num::is_zero(c) {
                    continue;
                }
                // target = (scalar - Σ others) / c
                let mut rest_lb = 0.0;
                let mut rest_ub = 0.0;
                let mut lb_finite = true;
                let mut ub_finite = true;
                for (v, cv) in normalized
                    .addends
                    .iter()
                    .map(|a| (a.variable, a.coefficient))
                {
                    if v == target {
                        continue;
                    }
                    let (lo, hi) = if cv >= 0.0 {
                        (cv * query.lower_bound(v), cv * query.upper_bound(v))
                    } else {
                        (cv * query.upper_bound(v), cv * query.lower_bound(v))
                    };
                    if num::is_finite(lo) {
                        rest_lb += lo;
                    } else {
                        lb_finite = false;
                    }
                    if num::is_finite(hi) {
                        rest_ub += hi;
                    } else {
                        ub_finite = false;
                    }
                }
                let (numerator_lo, numerator_lo_ok) =
                    (normalized.scalar - rest_ub, ub_finite);
                let (numerator_hi, numerator_hi_ok) =
                    (normalized.scalar - rest_lb, lb_finite);
                let (target_lb, target_lb_ok, target_ub, target_ub_ok) = if c > 0.0 {
                    (
                        numerator_lo / c,
                        numerator_lo_ok,
                        numerator_hi / c,
                        numerator_hi_ok,
                    )
                } else {
                    (
                        numerator_hi / c,
                        numerator_hi_ok,
                        numerator_lo / c,
                        numerator_lo_ok,
                    )
                };
                if target_lb_ok && query.tighten_lower_bound(target, target_lb) {
                    changed = true;
                }
                if target_ub_ok && query.tighten_upper_bound(target, target_ub) {
                    changed = true;
                }
                Self::check_feasible(query, target)?;
            }
        }
        Ok(changed)
    }

    fn tighten_from_constraints(&mut self, query: &mut Query) -> Result<bool> {
        let mut derived: Vec<Tightening> = Vec::new();

        let mut pl = std::mem::take(query.pl_constraints_mut());
        for constraint in pl.iter_mut().filter(|c| !c.is_obsolete()) {
            for v in constraint.participating_variables() {
                let lb = query.lower_bound(v);
                let ub = query.upper_bound(v);
                constraint
                    .notify_lower_bound(v, lb, &mut derived)
                    .map_err(|_| Error::InfeasibleQuery)?;
                constraint
                    .notify_upper_bound(v, ub, &mut derived)
                    .map_err(|_| Error::InfeasibleQuery)?;
            }
            constraint.entailed_tightenings(&mut derived);
        }
        *query.pl_constraints_mut() = pl;

        let mut nl = std::mem::take(query.nonlinear_constraints_mut());
        for constraint in nl.iter_mut().filter(|c| !c.is_obsolete()) {
            for v in constraint.participating_variables() {
                let lb = query.lower_bound(v);
                let ub = query.upper_bound(v);
                constraint
                    .notify_lower_bound(v, lb, &mut derived)
                    .map_err(|_| Error::InfeasibleQuery)?;
                constraint
                    .notify_upper_bound(v, ub, &mut derived)
                    .map_err(|_| Error::InfeasibleQuery)?;
            }
            constraint.entailed_tightenings(&mut derived);
        }
        *query.nonlinear_constraints_mut() = nl;

        let mut changed = false;
        for t in derived {
            let moved = match t.bound {
                BoundType::Lower => query.tighten_lower_bound(t.variable, t.value),
                BoundType::Upper => query.tighten_upper_bound(t.variable, t.value),
            };
            if moved {
                changed = true;
                Self::check_feasible(query, t.variable)?;
            }
        }
        Ok(changed)
    }

    // ─── Pass 5: Variable Elimination ──────────────────────────────

    fn eliminate_fixed_and_unused(&mut self, query: &mut Query) -> Result<bool> {
        let mut used: BTreeSet<usize> = BTreeSet::new();
        for eq in query.equations() {
            used.extend(eq.variables());
        }
        for c in query.pl_constraints().iter().filter(|c| !c.is_obsolete()) {
            used.extend(c.participating_variables());
        }
        for c in query.nonlinear_constraints().iter().filter(|c| !c.is_obsolete()) {
            used.extend(c.participating_variables());
        }

        let mut fixed: Vec<(usize, f64)> = Vec::new();
        let mut unused: Vec<usize> = Vec::new();
        for v in 0..query.num_variables() {
            if self.eliminated.contains_key(&v) || self.merged.contains_key(&v) {
                continue;
            }
            if query.is_input_or_output(v) {
                continue;
            }
            if !used.contains(&v) {
                unused.push(v);
                continue;
            }
            // A fixed variable inside a live piecewise constraint must
            // stay: substituting it away would silently drop the
            // constraint's remaining disjunctive content.
            let pinned_by_pl = query
                .pl_constraints()
                .iter()
                .any(|c| !c.is_obsolete() && c.participates(v));
            if pinned_by_pl {
                continue;
            }
            let lb = query.lower_bound(v);
            let ub = query.upper_bound(v);
            if num::is_finite(lb) && num::are_equal(lb, ub) {
                fixed.push((v, lb));
            }
        }

        if fixed.is_empty() && unused.is_empty() {
            return Ok(false);
        }
        debug!(fixed = fixed.len(), unused = unused.len(), "eliminating variables");

        for &(v, value) in &fixed {
            self.eliminated.insert(v, value);
            query.remove_bounds(v);

            let mut equations = std::mem::take(query.equations_mut());
            for eq in &mut equations {
                eq.substitute_value(v, value);
            }
            // Degenerate leftovers: contradictions and empties.
            let mut kept = Vec::with_capacity(equations.len());
            for mut eq in equations {
                eq.normalize();
                if eq.addends.is_empty() {
                    if !num::are_equal(eq.scalar, 0.0) {
                        return Err(Error::InfeasibleQuery);
                    }
                    continue;
                }
                kept.push(eq);
            }
            *query.equations_mut() = kept;

            for c in query.pl_constraints_mut() {
                if c.participates(v) {
                    c.eliminate(v, value);
                }
            }
            for c in query.nonlinear_constraints_mut() {
                if c.participates(v) {
                    c.eliminate(v, value);
                }
            }
            if let Some(network) = query.network_mut() {
                network.eliminate_variable(v, value);
            }
        }

        for &v in &unused {
            // An unused variable takes any value inside its old interval.
            let lb = query.lower_bound(v);
            let ub = query.upper_bound(v);
            let value = if num::is_finite(lb) && lb > 0.0 {
                lb
            } else if num::is_finite(ub) && ub < 0.0 {
                ub
            } else {
                0.0
            };
            self.eliminated.insert(v, value);
            query.remove_bounds(v);
        }

        query.pl_constraints_mut().retain(|c| !c.is_obsolete());
        query.nonlinear_constraints_mut().retain(|c| !c.is_obsolete());
        Ok(true)
    }

    // ─── Pass 6: Identical-Variable Merging ────────────────────────

    fn merge_identical_variables(&mut self, query: &mut Query) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut merge: Option<(usize, usize, Equation)> = None;
            for eq in query.equations() {
                if let Some((a, b)) = eq.identifies_identical_pair() {
                    let a_free = Self::mergeable(query, a);
                    let b_free = Self::mergeable(query, b);
                    if a_free {
                        merge = Some((a, b, eq.clone()));
                    } else if b_free {
                        merge = Some((b, a, eq.clone()));
                    }
                    if merge.is_some() {
                        break;
                    }
                }
            }
            let Some((victim, survivor, equation)) = merge else {
                return Ok(changed);
            };
            debug!(victim, survivor, "merging identical variables");
            query.remove_equation(&equation);
            query.merge_identical_variables(victim, survivor);
            if query.lower_bound(survivor) > query.upper_bound(survivor) + num::EPSILON {
                return Err(Error::InfeasibleQuery);
            }
            self.merged.insert(victim, survivor);
            changed = true;
        }
    }

    /// A merge victim must not be pinned by anything except equations.
    fn mergeable(query: &Query, variable: usize) -> bool {
        if query.is_input_or_output(variable) {
            return false;
        }
        !query
            .pl_constraints()
            .iter()
            .any(|c| c.participates(variable))
            && !query
                .nonlinear_constraints()
                .iter()
                .any(|c| c.participates(variable))
    }

    // ─── Renumbering ───────────────────────────────────────────────

    fn renumber(&mut self, query: &mut Query) {
        let gone: BTreeSet<usize> = self
            .eliminated
            .keys()
            .chain(self.merged.keys())
            .copied()
            .collect();
        let mut old_to_new = BTreeMap::new();
        let mut next = 0;
        for v in 0..query.num_variables() {
            if gone.contains(&v) {
                continue;
            }
            old_to_new.insert(v, next);
            next += 1;
        }
        if old_to_new.len() == query.num_variables() {
            self.old_to_new = old_to_new;
            return;
        }

        for (&old, &new) in &old_to_new {
            if old == new {
                continue;
            }
            for eq in query.equations_mut() {
                eq.update_index(old, new);
            }
            for c in query.pl_constraints_mut() {
                if c.participates(old) {
                    c.update_index(old, new);
                }
            }
            for c in query.nonlinear_constraints_mut() {
                if c.participates(old) {
                    c.update_index(old, new);
                }
            }
            if query.has_lower_bound(old) {
                let b = query.lower_bound(old);
                query.set_lower_bound(new, b);
            }
            if query.has_upper_bound(old) {
                let b = query.upper_bound(old);
                query.set_upper_bound(new, b);
            }
            query.remove_bounds(old);
        }

        query.adjust_input_output_mapping(&old_to_new, &self.merged);
        if let Some(network) = query.network_mut() {
            network.update_variable_indices(&old_to_new, &self.merged);
        }
        query.set_number_of_variables(next);
        self.old_to_new = old_to_new;
    }
}

// ─── Network Construction ──────────────────────────────────────────

/// Recognise the layered network behind the flat representation. Builds
/// an input layer from the marked inputs, then alternately absorbs dense
/// weighted-sum equation groups and activation-constraint groups, skipping
/// the auxiliary slack equations the constraints introduced. Installs the
/// reasoner and returns true only when everything was absorbed.
pub fn construct_network(query: &mut Query) -> bool {
    if query.num_input_variables() == 0 {
        return false;
    }

    let aux_vars: BTreeSet<usize> = query
        .pl_constraints()
        .iter()
        .flat_map(|c| c.aux_variables())
        .collect();

    let mut handled_equations: BTreeSet<usize> = query
        .equations()
        .iter()
        .enumerate()
        .filter(|(_, eq)| eq.variables().any(|v| aux_vars.contains(&v)))
        .map(|(i, _)| i)
        .collect();

    let mut nlr = NetworkLevelReasoner::new();
    let mut var_to_neuron: BTreeMap<usize, NeuronIndex> = BTreeMap::new();

    // Layer 0: the marked inputs, ordered by input index.
    let inputs = query.input_variables();
    nlr.add_layer(0, LayerKind::Input, inputs.len());
    for (n, &v) in inputs.iter().enumerate() {
        let index = NeuronIndex::new(0, n);
        nlr.set_neuron_variable(index, v);
        var_to_neuron.insert(v, index);
    }

    let mut handled_pl: BTreeSet<usize> = BTreeSet::new();
    let mut handled_nl: BTreeSet<usize> = BTreeSet::new();
    let mut next_layer = 1;

    loop {
        if try_weighted_sum_layer(
            query,
            &mut nlr,
            &mut var_to_neuron,
            &mut handled_equations,
            next_layer,
        ) || try_activation_layer(
            query,
            &mut nlr,
            &mut var_to_neuron,
            &mut handled_pl,
            &mut handled_nl,
            next_layer,
        ) {
            next_layer += 1;
        } else {
            break;
        }
    }

    let all_vars_handled = (0..query.num_variables())
        .all(|v| var_to_neuron.contains_key(&v) || aux_vars.contains(&v));
    let all_equations_handled = handled_equations.len() == query.num_equations();
    let all_constraints_handled = handled_pl.len() == query.pl_constraints().len()
        && handled_nl.len() == query.nonlinear_constraints().len();

    if next_layer > 1 && all_vars_handled && all_equations_handled && all_constraints_handled {
        query.set_network(nlr);
        true
    } else {
        false
    }
}

/// Absorb every equation defining exactly one new variable from handled
/// ones into a single weighted-sum layer.
fn try_weighted_sum_layer(
    query: &Query,
    nlr: &mut NetworkLevelReasoner,
    var_to_neuron: &mut BTreeMap<usize, NeuronIndex>,
    handled_equations: &mut BTreeSet<usize>,
    layer_index: usize,
) -> bool {
    struct Neuron {
        output: usize,
        weights: Vec<(NeuronIndex, f64)>,
        bias: f64,
        equation: usize,
    }

    let mut neurons: Vec<Neuron> = Vec::new();
    for (i, eq) in query.equations().iter().enumerate() {
        if handled_equations.contains(&i) || eq.relation != Relation::Eq {
            continue;
        }
        let mut normalized = eq.clone();
        normalized.normalize();
        let unhandled: Vec<usize> = normalized
            .variables()
            .filter(|v| !var_to_neuron.contains_key(v))
            .collect();
        if unhandled.len() != 1 {
            continue;
        }
        let output = unhandled[0];
        if neurons.iter().any(|n| n.output == output) {
            continue;
        }
        let c_out = normalized.coefficient(output);
        if num::is_zero(c_out) {
            continue;
        }
        // c_out·x_out + Σ c_j·x_j = s  =>  x_out = (s - Σ c_j·x_j) / c_out
        let weights = normalized
            .addends
            .iter()
            .filter(|a| a.variable != output)
            .map(|a| (var_to_neuron[&a.variable], -a.coefficient / c_out))
            .collect();
        neurons.push(Neuron {
            output,
            weights,
            bias: normalized.scalar / c_out,
            equation: i,
        });
    }

    if neurons.is_empty() {
        return false;
    }
    neurons.sort_by_key(|n| n.output);

    nlr.add_layer(layer_index, LayerKind::WeightedSum, neurons.len());
    let mut source_layers = BTreeSet::new();
    for (t, neuron) in neurons.iter().enumerate() {
        nlr.set_bias(layer_index, t, neuron.bias);
        for &(source, w) in &neuron.weights {
            nlr.set_weight(source.layer, source.neuron, layer_index, t, w);
            source_layers.insert(source.layer);
        }
        let index = NeuronIndex::new(layer_index, t);
        nlr.set_neuron_variable(index, neuron.output);
        var_to_neuron.insert(neuron.output, index);
        handled_equations.insert(neuron.equation);
    }
    for source in source_layers {
        nlr.add_layer_dependency(source, layer_index);
    }
    true
}

/// Absorb a group of same-kind activation constraints whose inputs are all
/// recognised and whose outputs are new.
fn try_activation_layer(
    query: &Query,
    nlr: &mut NetworkLevelReasoner,
    var_to_neuron: &mut BTreeMap<usize, NeuronIndex>,
    handled_pl: &mut BTreeSet<usize>,
    handled_nl: &mut BTreeSet<usize>,
    layer_index: usize,
) -> bool {
    struct Neuron {
        output: usize,
        sources: Vec<NeuronIndex>,
        constraint: usize,
        from_pl: bool,
    }

    // Gather candidates per kind; the first kind with any candidate wins.
    let mut grouped: BTreeMap<u8, (LayerKind, f64, Vec<Neuron>)> = BTreeMap::new();

    for (i, c) in query.pl_constraints().iter().enumerate() {
        if handled_pl.contains(&i) || c.is_obsolete() {
            continue;
        }
        let (rank, kind, alpha, output, inputs): (u8, LayerKind, f64, usize, Vec<usize>) = match c {
            PlConstraint::Relu(r) => (0, LayerKind::Relu, 0.0, r.f(), vec![r.b()]),
            PlConstraint::Abs(a) => (1, LayerKind::AbsoluteValue, 0.0, a.f(), vec![a.b()]),
            PlConstraint::Sign(s) => (2, LayerKind::Sign, 0.0, s.f(), vec![s.b()]),
            PlConstraint::LeakyRelu(l) => {
                (3, LayerKind::LeakyRelu, l.alpha(), l.f(), vec![l.b()])
            }
            PlConstraint::Max(m) => (4, LayerKind::Max, 0.0, m.f(), m.elements().to_vec()),
            PlConstraint::Disjunction(_) => continue,
        };
        if var_to_neuron.contains_key(&output) || !inputs.iter().all(|v| var_to_neuron.contains_key(v))
        {
            continue;
        }
        let entry = grouped.entry(rank).or_insert((kind, alpha, Vec::new()));
        if entry.0 == LayerKind::LeakyRelu && !num::are_equal(entry.1, alpha) {
            continue;
        }
        entry.2.push(Neuron {
            output,
            sources: inputs.iter().map(|v| var_to_neuron[v]).collect(),
            constraint: i,
            from_pl: true,
        });
    }

    for (i, c) in query.nonlinear_constraints().iter().enumerate() {
        if handled_nl.contains(&i) || c.is_obsolete() {
            continue;
        }
        let (rank, kind, outputs_inputs): (u8, LayerKind, Vec<(usize, Vec<usize>)>) = match c {
            NonlinearConstraint::Sigmoid(s) => {
                (5, LayerKind::Sigmoid, vec![(s.f(), vec![s.b()])])
            }
            NonlinearConstraint::Tanh(s) => (6, LayerKind::Tanh, vec![(s.f(), vec![s.b()])]),
            NonlinearConstraint::Round(r) => (7, LayerKind::Round, vec![(r.f(), vec![r.b()])]),
            NonlinearConstraint::Bilinear(b) => {
                let (x, y) = b.inputs();
                (8, LayerKind::Bilinear, vec![(b.f(), vec![x, y])])
            }
            NonlinearConstraint::Softmax(s) => (
                9,
                LayerKind::Softmax,
                s.outputs()
                    .iter()
                    .map(|&f| (f, s.inputs().to_vec()))
                    .collect(),
            ),
        };
        let ok = outputs_inputs.iter().all(|(f, inputs)| {
            !var_to_neuron.contains_key(f) && inputs.iter().all(|v| var_to_neuron.contains_key(v))
        });
        if !ok {
            continue;
        }
        let entry = grouped.entry(rank).or_insert((kind, 0.0, Vec::new()));
        for (f, inputs) in outputs_inputs {
            entry.2.push(Neuron {
                output: f,
                sources: inputs.iter().map(|v| var_to_neuron[v]).collect(),
                constraint: i,
                from_pl: false,
            });
        }
    }

    let Some((_, (kind, alpha, mut neurons))) = grouped.into_iter().next() else {
        return false;
    };
    if neurons.is_empty() {
        return false;
    }
    neurons.sort_by_key(|n| n.output);

    nlr.add_layer(layer_index, kind, neurons.len());
    if kind == LayerKind::LeakyRelu {
        nlr.set_layer_alpha(layer_index, alpha);
    }
    let mut source_layers = BTreeSet::new();
    for (t, neuron) in neurons.iter().enumerate() {
        for source in &neuron.sources {
            nlr.add_activation_source(source.layer, source.neuron, layer_index, t);
            source_layers.insert(source.layer);
        }
        let index = NeuronIndex::new(layer_index, t);
        nlr.set_neuron_variable(index, neuron.output);
        var_to_neuron.insert(neuron.output, index);
        if neuron.from_pl {
            handled_pl.insert(neuron.constraint);
        } else {
            handled_nl.insert(neuron.constraint);
        }
    }
    for source in source_layers {
        nlr.add_layer_dependency(source, layer_index);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::{AbsConstraint, MaxConstraint, ReluConstraint, SignConstraint};

    fn eq(terms: &[(f64, usize)], scalar: f64) -> Equation {
        let mut e = Equation::equality();
        for &(c, v) in terms {
            e.add_addend(c, v);
        }
        e.set_scalar(scalar);
        e
    }

    /// x0 + x1 - x2 = 10 with x1 in [0, 1], x2 in [2, 3], x3 = 0 pins
    /// x0 to [11, 13].
    #[test]
    fn test_tighten_equation_bounds() {
        let mut q = Query::new();
        q.set_number_of_variables(4);
        q.set_lower_bound(1, 0.0);
        q.set_upper_bound(1, 1.0);
        q.set_lower_bound(2, 2.0);
        q.set_upper_bound(2, 3.0);
        q.set_lower_bound(3, 0.0);
        q.set_upper_bound(3, 0.0);
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (-1.0, 2)], 10.0));

        let processed = Preprocessor::new().preprocess_with(q, false).unwrap();
        assert_eq!(processed.lower_bound(0), 11.0);
        assert_eq!(processed.upper_bound(0), 13.0);
    }

    #[test]
    fn test_tighten_equation_bounds_with_infinities() {
        let mut q = Query::new();
        q.set_number_of_variables(4);
        q.set_lower_bound(0, 0.0);
        q.set_lower_bound(1, 0.0);
        q.set_upper_bound(1, 1.0);
        q.set_upper_bound(2, 3.0);
        q.set_lower_bound(3, 0.0);
        q.set_upper_bound(3, 0.0);
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (-1.0, 2)], 10.0));

        let processed = Preprocessor::new().preprocess_with(q, false).unwrap();
        // x0.ub = 10 - lb(x1) + ub(x2) = 13; x2.lb = -10 + 0 + 0 = -10.
        assert_eq!(processed.lower_bound(0), 0.0);
        assert_eq!(processed.upper_bound(0), 13.0);
        assert_eq!(processed.lower_bound(2), -10.0);
        assert_eq!(processed.upper_bound(2), 3.0);
    }

    #[test]
    fn test_tighten_with_scaled_output_coefficient() {
        // 2x0 + x1 - x2 = 10: x0 in [5.5, 6.5].
        let mut q = Query::new();
        q.set_number_of_variables(5);
        q.set_lower_bound(1, 0.0);
        q.set_upper_bound(1, 1.0);
        q.set_lower_bound(2, 2.0);
        q.set_upper_bound(2, 3.0);
        q.add_equation(eq(&[(2.0, 0), (1.0, 1), (-1.0, 2)], 10.0));
        let processed = Preprocessor::new().preprocess_with(q, false).unwrap();
        assert_eq!(processed.lower_bound(0), 5.5);
        assert_eq!(processed.upper_bound(0), 6.5);
    }

    #[test]
    fn test_contradictory_bounds_are_infeasible() {
        let mut q = Query::new();
        q.set_number_of_variables(3);
        q.set_lower_bound(0, 1.0);
        q.set_upper_bound(0, 1.0);
        q.set_lower_bound(1, 5.0);
        q.set_upper_bound(1, 5.0);
        // x0 + x1 = 2 cannot hold with x0 = 1, x1 = 5.
        q.add_equation(eq(&[(1.0, 0), (1.0, 1)], 2.0));
        let err = Preprocessor::new().preprocess(q).unwrap_err();
        assert_eq!(err, Error::InfeasibleQuery);
    }

    #[test]
    fn test_all_equations_become_equalities() {
        let mut q = Query::new();
        q.set_number_of_variables(3);
        q.set_lower_bound(0, 1.0);
        q.set_upper_bound(0, 1.0);
        q.set_lower_bound(1, 0.0);
        q.set_upper_bound(1, 5.0);
        q.set_lower_bound(2, 2.0);
        q.set_upper_bound(2, 3.0);
        let mut ge = Equation::new(Relation::Ge);
        ge.add_addend(1.0, 0);
        ge.add_addend(-3.0, 1);
        ge.add_addend(4.0, 2);
        ge.set_scalar(10.0);
        q.add_equation(ge);

        let processed = Preprocessor::new().preprocess_with(q, false).unwrap();
        assert_eq!(processed.num_variables(), 4);
        let eq0 = &processed.equations()[0];
        assert_eq!(eq0.relation, Relation::Eq);
        assert_eq!(eq0.scalar, 10.0);
        assert_eq!(eq0.addends.len(), 4);
        assert_eq!(eq0.addends[3].coefficient, 1.0);
        assert_eq!(eq0.addends[3].variable, 3);
        // GE slack is non-positive.
        assert_eq!(processed.upper_bound(3), 0.0);
    }

    #[test]
    fn test_variable_elimination() {
        let mut q = Query::new();
        q.set_number_of_variables(10);
        let bounds = [
            (0, 1.0, 1.0),
            (1, 0.0, 5.0),
            (2, 2.0, 3.0),
            (3, 5.0, 5.0),
            (4, 0.0, 10.0),
            (5, 0.0, 10.0),
            (6, 5.0, 5.0),
            (7, 0.0, 9.0),
            (8, 0.0, 9.0),
            (9, 0.0, 9.0),
        ];
        for (v, lb, ub) in bounds {
            q.set_lower_bound(v, lb);
            q.set_upper_bound(v, ub);
        }
        // x0 + x1 + x3 = 10 fixes x1 = 4; x7 + x8 = 12 survives.
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (1.0, 3)], 10.0));
        q.add_equation(eq(&[(1.0, 7), (1.0, 8)], 12.0));

        let mut pp = Preprocessor::new();
        let processed = pp.preprocess(q).unwrap();

        assert_eq!(processed.num_variables(), 2);
        assert_eq!(processed.num_equations(), 1);
        let survivor = &processed.equations()[0];
        assert_eq!(survivor.addends[0].coefficient, 1.0);
        assert_eq!(survivor.addends[0].variable, 0);
        assert_eq!(survivor.addends[1].coefficient, 1.0);
        assert_eq!(survivor.addends[1].variable, 1);
        assert_eq!(survivor.scalar, 12.0);

        assert!(pp.variable_is_fixed(1));
        assert_eq!(pp.fixed_value(1), Some(4.0));
        assert_eq!(pp.new_index(7), Some(0));
        assert_eq!(pp.new_index(8), Some(1));
    }

    #[test]
    fn test_identical_variable_elimination() {
        let mut q = Query::new();
        q.set_number_of_variables(4);
        for v in 0..4 {
            q.set_lower_bound(v, -3.0);
            q.set_upper_bound(v, 5.0);
        }
        // 2x0 - 2x1 = 0 merges x0 into x1 (x1 feeds the relu).
        q.add_equation(eq(&[(2.0, 0), (-2.0, 1)], 0.0));
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (1.0, 2)], 1.0));
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(1, 3)));

        let mut pp = Preprocessor::new();
        let processed = pp.preprocess(q).unwrap();

        assert!(pp.variable_is_merged(0));
        assert_eq!(pp.merged_index(0), 1);
        assert_eq!(pp.new_index(1), Some(0));
        assert_eq!(pp.new_index(2), Some(1));
        assert_eq!(pp.new_index(3), Some(2));

        // The merged equation reads 2x0' + x1' = 1 after renumbering.
        let merged_eq = processed
            .equations()
            .iter()
            .find(|e| e.mentions(1))
            .expect("surviving equation");
        assert_eq!(merged_eq.coefficient(0), 2.0);
        assert_eq!(merged_eq.coefficient(1), 1.0);
        assert_eq!(merged_eq.scalar, 1.0);

        for c in processed.pl_constraints() {
            assert!(c.participates(0));
            assert!(c.participates(2));
        }
    }

    #[test]
    fn test_sigmoid_chain_collapses_when_inputs_fixed() {
        let mut q = Query::new();
        q.set_number_of_variables(8);
        q.set_lower_bound(0, 0.1);
        q.set_upper_bound(0, 0.1);
        q.set_lower_bound(1, 2.0);
        q.set_upper_bound(1, 2.0);
        q.add_equation(eq(&[(1.2, 0), (-0.2, 1), (-1.0, 2)], 0.12));
        q.add_equation(eq(&[(1.01, 0), (0.04, 1), (-1.0, 3)], 2.0));
        q.add_equation(eq(&[(0.8, 4), (4.12, 5), (-1.0, 6)], -0.44));
        q.add_equation(eq(&[(0.18, 4), (0.17, 5), (-1.0, 7)], -0.341));
        q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(2, 4));
        q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(3, 5));

        let processed = Preprocessor::new().preprocess(q).unwrap();
        assert_eq!(processed.num_equations(), 0);
        assert_eq!(processed.nonlinear_constraints().len(), 0);
        assert_eq!(processed.num_variables(), 0);
    }

    #[test]
    fn test_obsolete_max_leaves_aux_equations() {
        let mut q = Query::new();
        q.set_number_of_variables(3);
        for v in 0..3 {
            q.set_lower_bound(v, -2.0);
            q.set_upper_bound(v, 2.0);
        }
        q.add_pl_constraint(PlConstraint::Max(MaxConstraint::new(0, vec![1, 2])));
        // The second max lists its own output among the elements and
        // becomes redundant once slacks exist.
        q.add_pl_constraint(PlConstraint::Max(MaxConstraint::new(0, vec![0, 1, 2])));

        let processed = Preprocessor::new().preprocess(q).unwrap();
        // 3 original + 2 slacks for max1 + 2 slacks for max2.
        assert_eq!(processed.num_variables(), 7);
        assert_eq!(processed.pl_constraints().len(), 1);
        // max2's slack equations survive as plain equations.
        let expected1 = eq(&[(1.0, 0), (-1.0, 1), (-1.0, 5)], 0.0);
        let expected2 = eq(&[(1.0, 0), (-1.0, 2), (-1.0, 6)], 0.0);
        assert!(processed.equations().iter().any(|e| e == &expected1));
        assert!(processed.equations().iter().any(|e| e == &expected2));
    }

    #[test]
    fn test_disjunction_bounds_widen_to_hull() {
        use crate::plc::{CaseSplit, DisjunctionConstraint, PhaseStatus};

        let mut q = Query::new();
        q.set_number_of_variables(1);
        q.mark_input_variable(0, 0);

        let mut c1 = CaseSplit::new(PhaseStatus::NotFixed);
        c1.store_bound_tightening(Tightening::lower(0, -1.0));
        c1.store_bound_tightening(Tightening::upper(0, 3.0));
        let mut c2 = CaseSplit::new(PhaseStatus::NotFixed);
        c2.store_bound_tightening(Tightening::lower(0, -4.0));
        c2.store_bound_tightening(Tightening::upper(0, 2.0));
        q.add_pl_constraint(PlConstraint::Disjunction(DisjunctionConstraint::new(vec![
            c1, c2,
        ])));

        let processed = Preprocessor::new().preprocess(q).unwrap();
        assert_eq!(processed.lower_bound(0), -4.0);
        assert_eq!(processed.upper_bound(0), 3.0);
    }

    /// The 2-2-1 network from the construction suite: recognised layers
    /// must evaluate exactly like the flat equations.
    #[test]
    fn test_construction_of_network_level_reasoner() {
        let mut q = Query::new();
        q.set_number_of_variables(7);
        q.mark_input_variable(0, 0);
        q.mark_input_variable(1, 1);
        q.mark_output_variable(6, 0);
        for v in 0..7 {
            q.set_lower_bound(v, -10.0);
            q.set_upper_bound(v, 10.0);
        }
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(2, 4)));
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(3, 5)));
        q.add_equation(eq(&[(2.0, 0), (3.0, 1), (-1.0, 2)], 0.0));
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (-1.0, 3)], 0.0));
        q.add_equation(eq(&[(1.0, 4), (-1.0, 5), (-1.0, 6)], 0.0));

        assert!(q.network().is_none());
        assert!(q.construct_network_level_reasoner());
        let nlr = q.network().expect("network built");

        let out1 = nlr.evaluate(&[1.0, -2.0]).unwrap();
        assert!(num::are_equal_eps(out1[0], 0.0, 1e-9));
        let out2 = nlr.evaluate(&[-4.0, 3.0]).unwrap();
        assert!(num::are_equal_eps(out2[0], 1.0, 1e-9));
    }

    #[test]
    fn test_construction_with_sigmoids() {
        let mut q = Query::new();
        q.set_number_of_variables(7);
        q.mark_input_variable(0, 0);
        q.mark_input_variable(1, 1);
        q.mark_output_variable(6, 0);
        for v in 0..7 {
            q.set_lower_bound(v, -10.0);
            q.set_upper_bound(v, 10.0);
        }
        q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(2, 4));
        q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(3, 5));
        q.add_equation(eq(&[(2.0, 0), (3.0, 1), (-1.0, 2)], 0.0));
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (-1.0, 3)], 0.0));
        q.add_equation(eq(&[(1.0, 4), (-1.0, 5), (-1.0, 6)], 0.0));

        assert!(q.construct_network_level_reasoner());
        let nlr = q.network().expect("network built");
        let out1 = nlr.evaluate(&[0.0, 0.0]).unwrap();
        assert!(num::are_equal_eps(out1[0], 0.0, 1e-9));
        let out2 = nlr.evaluate(&[1.0, -1.0]).unwrap();
        assert!(num::are_equal_eps(out2[0], -0.2310586, 1e-4));
    }

    #[test]
    fn test_construction_with_relu_and_max_mix() {
        // Inputs feed three relus whose outputs feed a max.
        let mut q = Query::new();
        q.set_number_of_variables(7);
        q.mark_input_variable(0, 0);
        q.mark_input_variable(2, 1);
        q.mark_input_variable(4, 2);
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(0, 1)));
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(2, 3)));
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(4, 5)));
        let mut max = MaxConstraint::new(6, vec![1, 3, 5]);
        max.transform_to_use_aux_variables(&mut q);
        q.add_pl_constraint(PlConstraint::Max(max));

        assert!(q.construct_network_level_reasoner());
        let nlr = q.network().expect("network built");
        let out = nlr.evaluate(&[-1.0, 1.0, 2.0]).unwrap();
        assert!(num::are_equal_eps(out[0], 2.0, 1e-9));
    }

    #[test]
    fn test_construction_fails_without_marked_inputs() {
        let mut q = Query::new();
        q.set_number_of_variables(2);
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(0, 1)));
        assert!(!q.construct_network_level_reasoner());
        assert!(q.network().is_none());
    }

    #[test]
    fn test_reconstruct_solution_for_eliminated_variables() {
        let mut q = Query::new();
        q.set_number_of_variables(4);
        q.set_lower_bound(0, 2.0);
        q.set_upper_bound(0, 2.0);
        q.add_equation(eq(&[(1.0, 0), (1.0, 1), (-1.0, 2)], 0.0));
        q.set_lower_bound(1, 0.0);
        q.set_upper_bound(1, 5.0);
        q.set_lower_bound(2, 0.0);
        q.set_upper_bound(2, 5.0);
        q.set_lower_bound(3, -1.0);
        q.set_upper_bound(3, 1.0);
        q.add_equation(eq(&[(1.0, 2), (-1.0, 3)], 0.0));
        let original = q.clone();

        let mut pp = Preprocessor::new();
        let mut processed = pp.preprocess(q).unwrap();
        // Record a solution on the processed query and pull it back.
        for v in 0..processed.num_variables() {
            processed.set_solution_value(v, 1.0);
        }
        let mut original = original;
        pp.reconstruct_solution(&processed, &mut original);
        assert_eq!(original.solution_value(0), 2.0);
    }

    #[test]
    fn test_abs_and_sign_survive_preprocessing() {
        let mut q = Query::new();
        q.set_number_of_variables(4);
        q.set_lower_bound(0, -5.0);
        q.set_upper_bound(0, 5.0);
        q.add_pl_constraint(PlConstraint::Abs(AbsConstraint::new(0, 1)));
        q.add_pl_constraint(PlConstraint::Sign(SignConstraint::new(0, 2)));
        q.set_lower_bound(3, 0.0);
        q.set_upper_bound(3, 1.0);
        q.add_equation(eq(&[(1.0, 1), (1.0, 3)], 3.0));

        let processed = Preprocessor::new().preprocess(q).unwrap();
        // abs output picks up [0, 5]; sign output the unit box.
        let abs_f = processed
            .pl_constraints()
            .iter()
            .find_map(|c| match c {
                PlConstraint::Abs(a) => Some(a.f()),
                _ => None,
            })
            .expect("abs kept");
        assert!(processed.lower_bound(abs_f) >= 0.0);
        assert!(processed.upper_bound(abs_f) <= 5.0 + num::EPSILON);
    }
}
