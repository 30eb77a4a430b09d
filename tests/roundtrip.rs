//! Save/load round-trip for the query text format.

use marabou::equation::Equation;
use marabou::nonlinear::NonlinearConstraint;
use marabou::num;
use marabou::parse::{load_query, query_to_text, save_query};
use marabou::plc::{AbsConstraint, MaxConstraint, PlConstraint, ReluConstraint, SignConstraint};
use marabou::Query;

fn build_query() -> Query {
    let mut q = Query::new();
    q.set_number_of_variables(10);
    q.mark_input_variable(0, 0);
    q.mark_input_variable(1, 1);
    q.mark_output_variable(9, 0);

    q.set_lower_bound(0, -1.0);
    q.set_upper_bound(0, 1.0);
    q.set_lower_bound(1, 0.125);
    q.set_upper_bound(1, 2.5);
    q.set_lower_bound(5, 0.0);

    let mut eq1 = Equation::equality();
    eq1.add_addend(0.5, 0);
    eq1.add_addend(-1.5, 1);
    eq1.add_addend(-1.0, 2);
    eq1.set_scalar(0.25);
    q.add_equation(eq1);

    let mut eq2 = Equation::new(marabou::equation::Relation::Le);
    eq2.add_addend(1.0, 3);
    eq2.add_addend(1.0, 4);
    eq2.set_scalar(7.0);
    q.add_equation(eq2);

    q.add_pl_constraint(PlConstraint::Relu(ReluConstraint::new(2, 3)));
    q.add_pl_constraint(PlConstraint::Abs(AbsConstraint::new(2, 4)));
    q.add_pl_constraint(PlConstraint::Sign(SignConstraint::new(2, 5)));
    q.add_pl_constraint(PlConstraint::Max(MaxConstraint::new(6, vec![3, 4, 5])));
    q.add_nonlinear_constraint(NonlinearConstraint::sigmoid(3, 7));
    q.add_nonlinear_constraint(NonlinearConstraint::tanh(4, 8));
    q
}

#[test]
fn test_save_load_round_trip_through_file() {
    let query = build_query();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("query.txt");

    save_query(&query, &path).unwrap();
    let reloaded = load_query(&path).unwrap();

    assert_eq!(reloaded.num_variables(), query.num_variables());
    for v in 0..query.num_variables() {
        assert!(num::are_equal(reloaded.lower_bound(v), query.lower_bound(v)));
        assert!(num::are_equal(reloaded.upper_bound(v), query.upper_bound(v)));
    }
    assert_eq!(reloaded.num_equations(), query.num_equations());
    for (a, b) in reloaded.equations().iter().zip(query.equations().iter()) {
        assert_eq!(a, b);
    }
    assert_eq!(reloaded.pl_constraints().len(), query.pl_constraints().len());
    for (a, b) in reloaded
        .pl_constraints()
        .iter()
        .zip(query.pl_constraints().iter())
    {
        assert_eq!(a.serialize(), b.serialize());
        assert_eq!(a.participating_variables(), b.participating_variables());
    }
    assert_eq!(
        reloaded.nonlinear_constraints().len(),
        query.nonlinear_constraints().len()
    );
    assert_eq!(reloaded.input_variables(), query.input_variables());
    assert_eq!(reloaded.output_variables(), query.output_variables());
}

#[test]
fn test_second_save_is_byte_identical() {
    let query = build_query();
    let text = query_to_text(&query);
    let reloaded = marabou::parse::parse_query_text(&text).unwrap();
    assert_eq!(query_to_text(&reloaded), text);
}

#[test]
fn test_saved_format_snapshot() {
    insta::assert_snapshot!(query_to_text(&build_query()));
}
