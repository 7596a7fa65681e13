//! Algebraic simplification of a functional, DAG-shaped tensor IR.
//!
//! A [`language::Graph`] holds call, constant and parameter nodes grouped
//! into nested scopes, with a use-def index. Rules in
//! [`language::rewrites`] match a single anchor node and propose a
//! replacement; an [`optimizer::Pass`] applies an ordered list of them until
//! nothing changes. [`config::PassConfig`] describes passes as data.

pub mod config;
pub mod error;
pub mod language;
pub mod optimizer;

pub use error::{Error, Result};
