//! VNN-LIB property parser.
//!
//! Supports the subset exercised by verification benchmarks:
//! `(declare-const X_i Real)` / `(declare-const Y_i Real)`, and `assert`
//! over `<=`, `>=`, `and`, `or` with affine terms built from `+`, `-`,
//! `*` and constants. `X_i` / `Y_i` resolve against the query's marked
//! input and output variables; disjunctions of bound-only conjunctions
//! become `Disjunction` constraints.

use std::path::Path;

use crate::bounds::Tightening;
use crate::equation::{AffineForm, Equation, Relation};
use crate::error::{Error, Result};
use crate::num;
use crate::plc::{CaseSplit, DisjunctionConstraint, PhaseStatus, PlConstraint};
use crate::query::Query;

use super::ParseDiagnostic;

/// Apply a property file on top of a loaded query.
pub fn load_vnnlib_property(path: &Path, query: &mut Query) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Error::MalformedQuery(format!("cannot read {}: {e}", path.display())))?;
    apply_vnnlib_property(&source, query).map_err(|diag| {
        diag.render(&path.display().to_string(), &source);
        Error::MalformedQuery(diag.message)
    })
}

pub fn apply_vnnlib_property(
    source: &str,
    query: &mut Query,
) -> std::result::Result<(), ParseDiagnostic> {
    let tokens = tokenize(source);
    let mut parser = Parser {
        tokens,
        position: 0,
        source_len: source.len(),
    };
    while !parser.at_end() {
        let expr = parser.expression()?;
        apply_command(&expr, query)?;
    }
    Ok(())
}

// ─── Tokenizer ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Token {
    text: String,
    start: usize,
    end: usize,
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            ';' => {
                // Comment to end of line.
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' | ')' => tokens.push(Token {
                text: c.to_string(),
                start: i,
                end: i + 1,
            }),
            c if c.is_whitespace() => {}
            _ => {
                let start = i;
                let mut end = i + c.len_utf8();
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == ';' {
                        break;
                    }
                    end = j + c.len_utf8();
                    chars.next();
                }
                tokens.push(Token {
                    text: source[start..end].to_string(),
                    start,
                    end,
                });
            }
        }
    }
    tokens
}

// ─── S-Expressions ─────────────────────────────────────────────────

#[derive(Clone, Debug)]
enum Expr {
    Atom(Token),
    List(Vec<Expr>, usize, usize),
}

impl Expr {
    fn span(&self) -> (usize, usize) {
        match self {
            Expr::Atom(t) => (t.start, t.end),
            Expr::List(_, start, end) => (*start, *end),
        }
    }

    fn atom_text(&self) -> Option<&str> {
        match self {
            Expr::Atom(t) => Some(&t.text),
            Expr::List(..) => None,
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    source_len: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.position >= self.tokens.len()
    }

    fn expression(&mut self) -> std::result::Result<Expr, ParseDiagnostic> {
        let token = self.tokens.get(self.position).cloned().ok_or_else(|| {
            ParseDiagnostic::new("unexpected end of input", self.source_len, self.source_len)
        })?;
        self.position += 1;
        match token.text.as_str() {
            "(" => {
                let start = token.start;
                let mut items = Vec::new();
                loop {
                    let next = self.tokens.get(self.position).ok_or_else(|| {
                        ParseDiagnostic::new("unbalanced parenthesis", start, self.source_len)
                    })?;
                    if next.text == ")" {
                        let end = next.end;
                        self.position += 1;
                        return Ok(Expr::List(items, start, end));
                    }
                    items.push(self.expression()?);
                }
            }
            ")" => Err(ParseDiagnostic::new(
                "unexpected closing parenthesis",
                token.start,
                token.end,
            )),
            _ => Ok(Expr::Atom(token)),
        }
    }
}

// ─── Interpretation ────────────────────────────────────────────────

fn apply_command(expr: &Expr, query: &mut Query) -> std::result::Result<(), ParseDiagnostic> {
    let (start, end) = expr.span();
    let Expr::List(items, ..) = expr else {
        return Err(ParseDiagnostic::new("expected a command list", start, end));
    };
    match items.first().and_then(Expr::atom_text) {
        Some("declare-const") => {
            // Sanity-check the name resolves; declarations carry no body.
            let name = items
                .get(1)
                .and_then(Expr::atom_text)
                .ok_or_else(|| ParseDiagnostic::new("declare-const expects a name", start, end))?;
            resolve_variable(name, query, start, end)?;
            Ok(())
        }
        Some("assert") => {
            let body = items
                .get(1)
                .ok_or_else(|| ParseDiagnostic::new("assert expects a condition", start, end))?;
            let constraints = parse_condition(body, query)?;
            apply_parsed(constraints, query, start, end)
        }
        Some(other) => Err(ParseDiagnostic::new(
            format!("unsupported command: {other}"),
            start,
            end,
        )),
        None => Err(ParseDiagnostic::new("empty command", start, end)),
    }
}

/// One comparison, reduced to `form (relation) 0`.
#[derive(Clone, Debug)]
struct Comparison {
    form: AffineForm,
    relation: Relation,
}

/// A condition is a disjunction of conjunctions of comparisons.
type Condition = Vec<Vec<Comparison>>;

fn parse_condition(expr: &Expr, query: &Query) -> std::result::Result<Condition, ParseDiagnostic> {
    let (start, end) = expr.span();
    let Expr::List(items, ..) = expr else {
        return Err(ParseDiagnostic::new("expected a condition", start, end));
    };
    match items.first().and_then(Expr::atom_text) {
        Some("and") => {
            let mut conjuncts = Vec::new();
            for item in &items[1..] {
                let sub = parse_condition(item, query)?;
                // Disjunctions nested under `and` are out of scope.
                if sub.len() != 1 {
                    return Err(ParseDiagnostic::new(
                        "or nested under and is not supported",
                        start,
                        end,
                    ));
                }
                conjuncts.extend(sub.into_iter().next().expect("checked length"));
            }
            Ok(vec![conjuncts])
        }
        Some("or") => {
            let mut cases = Vec::new();
            for item in &items[1..] {
                cases.extend(parse_condition(item, query)?);
            }
            Ok(cases)
        }
        Some("<=") | Some(">=") => {
            let relation = if items[0].atom_text() == Some("<=") {
                Relation::Le
            } else {
                Relation::Ge
            };
            if items.len() != 3 {
                return Err(ParseDiagnostic::new(
                    "comparison expects two operands",
                    start,
                    end,
                ));
            }
            let lhs = parse_term(&items[1], query)?;
            let rhs = parse_term(&items[2], query)?;
            let mut form = lhs;
            form.add_scaled(&rhs, -1.0);
            Ok(vec![vec![Comparison { form, relation }]])
        }
        Some(other) => Err(ParseDiagnostic::new(
            format!("unsupported operator: {other}"),
            start,
            end,
        )),
        None => Err(ParseDiagnostic::new("empty condition", start, end)),
    }
}

fn parse_term(expr: &Expr, query: &Query) -> std::result::Result<AffineForm, ParseDiagnostic> {
    let (start, end) = expr.span();
    match expr {
        Expr::Atom(token) => {
            let mut form = AffineForm::new();
            if let Ok(value) = token.text.parse::<f64>() {
                form.constant = value;
            } else {
                let variable = resolve_variable(&token.text, query, start, end)?;
                form.add_term(1.0, variable);
            }
            Ok(form)
        }
        Expr::List(items, ..) => {
            let op = items.first().and_then(Expr::atom_text).ok_or_else(|| {
                ParseDiagnostic::new("expected an arithmetic operator", start, end)
            })?;
            let args: Vec<AffineForm> = items[1..]
                .iter()
                .map(|e| parse_term(e, query))
                .collect::<std::result::Result<_, _>>()?;
            match op {
                "+" => {
                    let mut form = AffineForm::new();
                    for arg in &args {
                        form.add_scaled(arg, 1.0);
                    }
                    Ok(form)
                }
                "-" => {
                    let mut form = AffineForm::new();
                    match args.split_first() {
                        Some((first, rest)) if !rest.is_empty() => {
                            form.add_scaled(first, 1.0);
                            for arg in rest {
                                form.add_scaled(arg, -1.0);
                            }
                        }
                        Some((only, _)) => form.add_scaled(only, -1.0),
                        None => {
                            return Err(ParseDiagnostic::new("minus needs operands", start, end))
                        }
                    }
                    Ok(form)
                }
                "*" => {
                    let mut scale = 1.0;
                    let mut variable_part: Option<AffineForm> = None;
                    for arg in args {
                        if arg.is_constant() {
                            scale *= arg.constant;
                        } else if variable_part.is_none() {
                            variable_part = Some(arg);
                        } else {
                            return Err(ParseDiagnostic::new(
                                "nonlinear product in property",
                                start,
                                end,
                            ));
                        }
                    }
                    let mut form = AffineForm::new();
                    match variable_part {
                        Some(part) => form.add_scaled(&part, scale),
                        None => form.constant = scale,
                    }
                    Ok(form)
                }
                other => Err(ParseDiagnostic::new(
                    format!("unsupported arithmetic operator: {other}"),
                    start,
                    end,
                )),
            }
        }
    }
}

/// `X_i` names input `i`, `Y_i` names output `i`.
fn resolve_variable(
    name: &str,
    query: &Query,
    start: usize,
    end: usize,
) -> std::result::Result<usize, ParseDiagnostic> {
    let (prefix, index) = name
        .split_once('_')
        .ok_or_else(|| ParseDiagnostic::new(format!("unknown symbol: {name}"), start, end))?;
    let index: usize = index
        .parse()
        .map_err(|_| ParseDiagnostic::new(format!("bad variable name: {name}"), start, end))?;
    let resolved = match prefix {
        "X" => query.input_variable_by_index(index),
        "Y" => query.output_variable_by_index(index),
        _ => None,
    };
    resolved.ok_or_else(|| {
        ParseDiagnostic::new(format!("{name} does not name a network variable"), start, end)
            .with_help("inputs are X_<i>, outputs Y_<i>, indexed from 0")
    })
}

/// A comparison with a single variable is a plain bound; anything else
/// becomes an equation. A multi-case condition becomes a disjunction of
/// bound-only case splits.
fn apply_parsed(
    condition: Condition,
    query: &mut Query,
    start: usize,
    end: usize,
) -> std::result::Result<(), ParseDiagnostic> {
    if condition.len() == 1 {
        for comparison in &condition[0] {
            apply_comparison(comparison, query);
        }
        return Ok(());
    }

    let mut cases = Vec::with_capacity(condition.len());
    for conjuncts in condition {
        let mut case = CaseSplit::new(PhaseStatus::NotFixed);
        for comparison in conjuncts {
            match as_bound(&comparison) {
                Some(t) => case.store_bound_tightening(t),
                None => {
                    return Err(ParseDiagnostic::new(
                        "disjuncts must be variable bounds",
                        start,
                        end,
                    )
                    .with_help("rewrite each or-branch as bounds on single variables"))
                }
            }
        }
        cases.push(case);
    }
    cases.retain(|c| !c.bounds.is_empty());
    if !cases.is_empty() {
        query.add_pl_constraint(PlConstraint::Disjunction(DisjunctionConstraint::new(cases)));
    }
    Ok(())
}

fn apply_comparison(comparison: &Comparison, query: &mut Query) {
    if let Some(t) = as_bound(comparison) {
        match t.bound {
            crate::bounds::BoundType::Lower => {
                query.tighten_lower_bound(t.variable, t.value);
            }
            crate::bounds::BoundType::Upper => {
                query.tighten_upper_bound(t.variable, t.value);
            }
        }
        return;
    }
    let mut equation = Equation::new(comparison.relation);
    for (v, c) in comparison.form.terms() {
        equation.add_addend(c, v);
    }
    equation.set_scalar(-comparison.form.constant);
    query.add_equation(equation);
}

/// `c·x + k <= 0` is the bound `x <= -k/c` (direction by sign of `c`).
fn as_bound(comparison: &Comparison) -> Option<Tightening> {
    let terms: Vec<(usize, f64)> = comparison.form.terms().collect();
    if terms.len() != 1 {
        return None;
    }
    let (variable, coefficient) = terms[0];
    if num::is_zero(coefficient) {
        return None;
    }
    let value = -comparison.form.constant / coefficient;
    let upper = match comparison.relation {
        Relation::Le => coefficient > 0.0,
        Relation::Ge => coefficient < 0.0,
        Relation::Eq => return None,
    };
    Some(if upper {
        Tightening::upper(variable, value)
    } else {
        Tightening::lower(variable, value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_query() -> Query {
        let mut q = Query::new();
        q.set_number_of_variables(4);
        q.mark_input_variable(0, 0);
        q.mark_input_variable(1, 1);
        q.mark_output_variable(2, 0);
        q.mark_output_variable(3, 1);
        q
    }

    #[test]
    fn test_simple_bounds() {
        let mut q = network_query();
        let property = "\
(declare-const X_0 Real)
(declare-const X_1 Real)
(assert (<= X_0 0.5))
(assert (>= X_0 -0.5))
(assert (<= X_1 1.0))
";
        apply_vnnlib_property(property, &mut q).unwrap();
        assert_eq!(q.lower_bound(0), -0.5);
        assert_eq!(q.upper_bound(0), 0.5);
        assert_eq!(q.upper_bound(1), 1.0);
    }

    #[test]
    fn test_affine_assertion_becomes_equation() {
        let mut q = network_query();
        let property = "(assert (<= (- Y_0 Y_1) 0.25))";
        apply_vnnlib_property(property, &mut q).unwrap();
        assert_eq!(q.num_equations(), 1);
        let eq = &q.equations()[0];
        assert_eq!(eq.relation, Relation::Le);
        assert_eq!(eq.coefficient(2), 1.0);
        assert_eq!(eq.coefficient(3), -1.0);
        assert_eq!(eq.scalar, 0.25);
    }

    #[test]
    fn test_scaled_term() {
        let mut q = network_query();
        let property = "(assert (>= (+ (* 2.0 X_0) X_1) 1.0))";
        apply_vnnlib_property(property, &mut q).unwrap();
        let eq = &q.equations()[0];
        assert_eq!(eq.relation, Relation::Ge);
        assert_eq!(eq.coefficient(0), 2.0);
        assert_eq!(eq.coefficient(1), 1.0);
        assert_eq!(eq.scalar, 1.0);
    }

    #[test]
    fn test_disjunction_of_boxes() {
        let mut q = network_query();
        let property = "\
(assert (or (and (<= X_0 0.0) (>= X_1 0.5)) (and (>= X_0 1.0))))
";
        apply_vnnlib_property(property, &mut q).unwrap();
        assert_eq!(q.pl_constraints().len(), 1);
        match &q.pl_constraints()[0] {
            PlConstraint::Disjunction(d) => assert_eq!(d.cases().len(), 2),
            other => panic!("expected disjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_symbol_is_rejected() {
        let mut q = network_query();
        let err = apply_vnnlib_property("(assert (<= Z_0 1.0))", &mut q).unwrap_err();
        assert!(err.message.contains("Z_0"));
    }

    #[test]
    fn test_unbalanced_parens_rejected() {
        let mut q = network_query();
        let err = apply_vnnlib_property("(assert (<= X_0 1.0)", &mut q).unwrap_err();
        assert!(err.message.contains("unbalanced"));
    }

    #[test]
    fn test_comments_are_ignored() {
        let mut q = network_query();
        let property = "; robustness box\n(assert (<= X_0 0.1)) ; upper\n";
        apply_vnnlib_property(property, &mut q).unwrap();
        assert_eq!(q.upper_bound(0), 0.1);
    }
}
