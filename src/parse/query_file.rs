//! The line-oriented query text format.
//!
//! ```text
//! num_variables N
//! input_index k var            (repeated)
//! output_index k var           (repeated)
//! lower_bound var value        (repeated; missing means -inf)
//! upper_bound var value        (repeated; missing means +inf)
//! equation TYPE c1 v1 c2 v2 ... scalar     (TYPE in {EQ, LE, GE})
//! Relu,f,b                                 (one constraint per line)
//! ...
//! ```
//!
//! Ordering is deterministic so saved queries are byte-stable, and
//! `query_to_text` / `parse_query_text` round-trip.

use std::fmt::Write as _;
use std::path::Path;

use crate::equation::{Equation, Relation};
use crate::error::{Error, Result};
use crate::nonlinear::NonlinearConstraint;
use crate::plc::PlConstraint;
use crate::query::Query;

use super::{line_span, ParseDiagnostic};

pub fn query_to_text(query: &Query) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "num_variables {}", query.num_variables());

    for (index, variable) in query
        .input_variables()
        .iter()
        .enumerate()
        .map(|(i, &v)| (i, v))
    {
        let _ = writeln!(out, "input_index {index} {variable}");
    }
    for (index, variable) in query
        .output_variables()
        .iter()
        .enumerate()
        .map(|(i, &v)| (i, v))
    {
        let _ = writeln!(out, "output_index {index} {variable}");
    }
    for (variable, bound) in query.explicit_lower_bounds() {
        let _ = writeln!(out, "lower_bound {variable} {bound}");
    }
    for (variable, bound) in query.explicit_upper_bounds() {
        let _ = writeln!(out, "upper_bound {variable} {bound}");
    }
    for equation in query.equations() {
        let relation = match equation.relation {
            Relation::Eq => "EQ",
            Relation::Le => "LE",
            Relation::Ge => "GE",
        };
        let _ = write!(out, "equation {relation}");
        for addend in &equation.addends {
            let _ = write!(out, " {} {}", addend.coefficient, addend.variable);
        }
        let _ = writeln!(out, " {}", equation.scalar);
    }
    for constraint in query.pl_constraints() {
        let _ = writeln!(out, "{}", constraint.serialize());
    }
    for constraint in query.nonlinear_constraints() {
        let _ = writeln!(out, "{}", constraint.serialize());
    }
    out
}

pub fn save_query(query: &Query, path: &Path) -> Result<()> {
    std::fs::write(path, query_to_text(query))
        .map_err(|e| Error::MalformedQuery(format!("cannot write {}: {e}", path.display())))
}

pub fn parse_query_text(source: &str) -> std::result::Result<Query, ParseDiagnostic> {
    let mut query = Query::new();
    let mut saw_header = false;

    for (index, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (start, end) = line_span(source, index);
        let fail = |message: String| ParseDiagnostic::new(message, start, end);

        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or("");
        match keyword {
            "num_variables" => {
                let n = parse_usize(words.next(), &fail)?;
                query.set_number_of_variables(n);
                saw_header = true;
            }
            "input_index" => {
                let index = parse_usize(words.next(), &fail)?;
                let variable = parse_usize(words.next(), &fail)?;
                query.mark_input_variable(variable, index);
            }
            "output_index" => {
                let index = parse_usize(words.next(), &fail)?;
                let variable = parse_usize(words.next(), &fail)?;
                query.mark_output_variable(variable, index);
            }
            "lower_bound" => {
                let variable = parse_usize(words.next(), &fail)?;
                let value = parse_f64(words.next(), &fail)?;
                query.set_lower_bound(variable, value);
            }
            "upper_bound" => {
                let variable = parse_usize(words.next(), &fail)?;
                let value = parse_f64(words.next(), &fail)?;
                query.set_upper_bound(variable, value);
            }
            "equation" => {
                let relation = match words.next() {
                    Some("EQ") => Relation::Eq,
                    Some("LE") => Relation::Le,
                    Some("GE") => Relation::Ge,
                    other => {
                        return Err(fail(format!(
                            "expected equation type EQ, LE or GE, found {other:?}"
                        )))
                    }
                };
                let rest: Vec<&str> = words.collect();
                if rest.len() % 2 != 1 {
                    return Err(fail(
                        "equation expects coefficient/variable pairs then a scalar".into(),
                    )
                    .with_help("equation EQ 1 0 -1 1 0"));
                }
                let mut equation = Equation::new(relation);
                for pair in rest[..rest.len() - 1].chunks(2) {
                    let coefficient = parse_f64(Some(pair[0]), &fail)?;
                    let variable = parse_usize(Some(pair[1]), &fail)?;
                    equation.add_addend(coefficient, variable);
                }
                equation.set_scalar(parse_f64(Some(rest[rest.len() - 1]), &fail)?);
                query.add_equation(equation);
            }
            _ => {
                // A constraint line; the leading token names the kind.
                match PlConstraint::deserialize(line) {
                    Ok(constraint) => query.add_pl_constraint(constraint),
                    Err(Error::UnsupportedConstraint(_)) => {
                        match NonlinearConstraint::deserialize(line) {
                            Ok(constraint) => query.add_nonlinear_constraint(constraint),
                            Err(Error::UnsupportedConstraint(kind)) => {
                                return Err(fail(format!("unsupported constraint: {kind}")))
                            }
                            Err(e) => return Err(fail(e.to_string())),
                        }
                    }
                    Err(e) => return Err(fail(e.to_string())),
                }
            }
        }
    }

    if !saw_header {
        return Err(ParseDiagnostic::new(
            "missing num_variables header",
            0,
            source.lines().next().map(|l| l.len()).unwrap_or(0),
        ));
    }

    // Every referenced variable must exist.
    let n = query.num_variables();
    let mut referenced: Vec<usize> = Vec::new();
    referenced.extend(query.equations().iter().flat_map(|e| e.variables()));
    for c in query.pl_constraints() {
        referenced.extend(c.participating_variables());
    }
    for c in query.nonlinear_constraints() {
        referenced.extend(c.participating_variables());
    }
    if let Some(&bad) = referenced.iter().find(|&&v| v >= n) {
        return Err(ParseDiagnostic::new(
            format!("variable x{bad} out of range (num_variables = {n})"),
            0,
            source.lines().next().map(|l| l.len()).unwrap_or(0),
        ));
    }

    Ok(query)
}

pub fn load_query(path: &Path) -> Result<Query> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Error::MalformedQuery(format!("cannot read {}: {e}", path.display())))?;
    parse_query_text(&source).map_err(|diag| {
        diag.render(&path.display().to_string(), &source);
        Error::MalformedQuery(diag.message)
    })
}

fn parse_usize(
    token: Option<&str>,
    fail: &impl Fn(String) -> ParseDiagnostic,
) -> std::result::Result<usize, ParseDiagnostic> {
    let token = token.ok_or_else(|| fail("unexpected end of line".into()))?;
    token
        .parse()
        .map_err(|_| fail(format!("expected an index, found {token:?}")))
}

fn parse_f64(
    token: Option<&str>,
    fail: &impl Fn(String) -> ParseDiagnostic,
) -> std::result::Result<f64, ParseDiagnostic> {
    let token = token.ok_or_else(|| fail("unexpected end of line".into()))?;
    token
        .parse()
        .map_err(|_| fail(format!("expected a number, found {token:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::num;
    use crate::plc::{MaxConstraint, ReluConstraint};

    fn sample_query() -> Query {
        let mut q = Query::new();
        q.set_number_of_variables(7);
        q.mark_input_variable(0, 0);
        q.mark_output_variable(6, 0);
        q.set_lower_bound(0, -1.0);
        q.set_upper_bound(0, 1.5);
        q.set_lower_bound(5, 0.25);
        let mut eq = Equation::equality();
        eq.add_addend(1.0, 0);
        eq.add_addend(-2.5, 1);
        eq.set_scalar(0.5);
        q.add_equation(eq);
        q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(1, 2)));
        q.add_pl_constraint(PlConstraint::Max(MaxConstraint::new(6, vec![2, 5])));
        q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(2, 3));
        q
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let q = sample_query();
        let text = query_to_text(&q);
        let reloaded = parse_query_text(&text).unwrap();

        assert_eq!(reloaded.num_variables(), q.num_variables());
        assert_eq!(reloaded.input_variables(), q.input_variables());
        assert_eq!(reloaded.output_variables(), q.output_variables());
        for v in 0..q.num_variables() {
            assert!(num::are_equal(reloaded.lower_bound(v), q.lower_bound(v)));
            assert!(num::are_equal(reloaded.upper_bound(v), q.upper_bound(v)));
        }
        assert_eq!(reloaded.num_equations(), q.num_equations());
        assert_eq!(reloaded.equations()[0], q.equations()[0]);
        assert_eq!(reloaded.pl_constraints().len(), q.pl_constraints().len());
        for (a, b) in reloaded
            .pl_constraints()
            .iter()
            .zip(q.pl_constraints().iter())
        {
            assert_eq!(a.serialize(), b.serialize());
            assert_eq!(a.participating_variables(), b.participating_variables());
        }
        assert_eq!(
            reloaded.nonlinear_constraints()[0].serialize(),
            q.nonlinear_constraints()[0].serialize()
        );
    }

    #[test]
    fn test_serialization_is_byte_stable() {
        let q = sample_query();
        let text = query_to_text(&q);
        let reloaded = parse_query_text(&text).unwrap();
        assert_eq!(query_to_text(&reloaded), text);
    }

    #[test]
    fn test_missing_header_is_rejected() {
        let err = parse_query_text("lower_bound 0 1.0\n").unwrap_err();
        assert!(err.message.contains("num_variables"));
    }

    #[test]
    fn test_out_of_range_variable_is_rejected() {
        let err = parse_query_text("num_variables 2\nRelu,5,0\n").unwrap_err();
        assert!(err.message.contains("out of range"));
    }

    #[test]
    fn test_unknown_constraint_kind_is_rejected() {
        let err = parse_query_text("num_variables 2\nClip,0,1\n").unwrap_err();
        assert!(err.message.contains("unsupported"));
    }

    #[test]
    fn test_bad_equation_arity_is_rejected() {
        let err = parse_query_text("num_variables 2\nequation EQ 1 0 5 1\n").unwrap_err();
        assert!(err.message.contains("scalar"));
    }

    #[test]
    fn test_infinite_bounds_stay_implicit() {
        let mut q = Query::new();
        q.set_number_of_variables(3);
        q.set_lower_bound(1, 0.0);
        let text = query_to_text(&q);
        assert_eq!(text.matches("lower_bound").count(), 1);
        assert_eq!(text.matches("upper_bound").count(), 0);
        let reloaded = parse_query_text(&text).unwrap();
        assert_eq!(reloaded.upper_bound(1), num::infinity());
    }
}
