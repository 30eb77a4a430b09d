//! marabou — a decision procedure for neural-network verification
//! queries.
//!
//! A query is a conjunction of linear equalities, variable bounds, and
//! piecewise-linear / nonlinear activation constraints over real-valued
//! variables. The solver either returns a concrete satisfying assignment
//! or proves unsatisfiability:
//!
//! 1. The preprocessor tightens bounds, eliminates variables, and
//!    recognises the layered network behind the flat representation.
//! 2. The network-level reasoner propagates bounds with interval
//!    arithmetic, forward symbolic bounds, DeepPoly and LP relaxation.
//! 3. The engine drives a DPLL-style case-split search, consulting the
//!    sum-of-infeasibilities local search for phase patterns.
//! 4. Transcendental constraints go through an incremental-linearization
//!    CEGAR loop around the engine.

pub mod bounds;
pub mod cegar;
pub mod config;
pub mod engine;
pub mod equation;
pub mod error;
pub mod nlr;
pub mod nonlinear;
pub mod num;
pub mod parse;
pub mod plc;
pub mod preprocess;
pub mod query;
pub mod soi;
pub mod tableau;

pub use cegar::IncrementalLinearization;
pub use config::{
    BoundTighteningMode, EngineConfig, SoiInitializationStrategy, SoiSearchStrategy,
    SymbolicTighteningMode,
};
pub use engine::{Engine, ExitCode};
pub use error::{Error, Result};
pub use preprocess::Preprocessor;
pub use query::Query;
