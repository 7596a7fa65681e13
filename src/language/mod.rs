// Re-export everything in language.rs
mod language;
pub use language::*;

pub mod interpreter;
pub mod literal;
pub mod pattern;
pub mod rewrites;
mod sexpr;
