//! Tolerance-aware floating point comparisons.
//!
//! Every comparison in the solver goes through these helpers so that the
//! tolerance lives in exactly one place. `EPSILON` is the default; callers
//! that need a caller-chosen tolerance use the `_eps` variants.

/// Default comparison tolerance.
pub const EPSILON: f64 = 1e-6;

pub fn infinity() -> f64 {
    f64::INFINITY
}

pub fn negative_infinity() -> f64 {
    f64::NEG_INFINITY
}

pub fn are_equal_eps(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps
}

pub fn are_equal(a: f64, b: f64) -> bool {
    are_equal_eps(a, b, EPSILON)
}

/// Strictly less, beyond tolerance.
pub fn lt(a: f64, b: f64) -> bool {
    a < b - EPSILON
}

pub fn lte(a: f64, b: f64) -> bool {
    a <= b + EPSILON
}

/// Strictly greater, beyond tolerance.
pub fn gt(a: f64, b: f64) -> bool {
    a > b + EPSILON
}

pub fn gte(a: f64, b: f64) -> bool {
    a >= b - EPSILON
}

pub fn is_zero(a: f64) -> bool {
    a.abs() <= EPSILON
}

pub fn is_positive(a: f64) -> bool {
    a > EPSILON
}

pub fn is_negative(a: f64) -> bool {
    a < -EPSILON
}

pub fn is_finite(a: f64) -> bool {
    a.is_finite()
}

/// Round to nearest, ties to even (the semantics of the Round activation).
pub fn round(a: f64) -> f64 {
    a.round_ties_even()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_within_tolerance() {
        assert!(are_equal(1.0, 1.0 + EPSILON / 2.0));
        assert!(!are_equal(1.0, 1.0 + EPSILON * 10.0));
        assert!(are_equal_eps(1.0, 1.001, 1e-2));
    }

    #[test]
    fn test_strict_comparisons() {
        assert!(lt(1.0, 2.0));
        assert!(!lt(1.0, 1.0 + EPSILON / 2.0));
        assert!(gt(2.0, 1.0));
        assert!(!gt(1.0 + EPSILON / 2.0, 1.0));
    }

    #[test]
    fn test_sign_predicates() {
        assert!(is_zero(0.0));
        assert!(is_zero(EPSILON / 2.0));
        assert!(is_positive(1e-3));
        assert!(is_negative(-1e-3));
        assert!(!is_positive(EPSILON / 2.0));
    }

    #[test]
    fn test_round_ties_to_even() {
        assert_eq!(round(0.5), 0.0);
        assert_eq!(round(1.5), 2.0);
        assert_eq!(round(2.3), 2.0);
        assert_eq!(round(-0.5), -0.0);
    }
}
