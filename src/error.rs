//! Solver error type and process exit codes.
//!
//! No exceptions escape the core: every bound-touching operation returns
//! `Result<_, Error>` and the engine's main loop folds the recoverable
//! variants (`InfeasibleBounds`) back into the search.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Local contradiction during tightening; recovered by backtracking.
    #[error("infeasible bounds for x{variable}: [{lower}, {upper}]")]
    InfeasibleBounds {
        variable: usize,
        lower: f64,
        upper: f64,
    },

    /// The preprocessed query has no solution at the root; surfaced as UNSAT.
    #[error("query is infeasible")]
    InfeasibleQuery,

    /// A constraint kind the core does not implement.
    #[error("unsupported constraint: {0}")]
    UnsupportedConstraint(String),

    /// Structural violation in the input (missing variable, bad token, ...).
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// The LP backend reported a non-recoverable fault; the current
    /// tightening pass aborts and the caller falls back to symbolic bounds.
    #[error("external solver: {0}")]
    ExternalSolver(String),

    #[error("time budget exceeded")]
    Timeout,

    #[error("quit requested by host")]
    QuitRequested,

    /// An invariant violation inside the solver.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for errors that abort the run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnsupportedConstraint(_) | Error::MalformedQuery(_) => 1,
            Error::Timeout | Error::QuitRequested => 20,
            _ => 2,
        }
    }
}
