//! Pattern-driven rewriting of tensor programs.
//!
//! A [`program::Program`] is an ordered list of instructions over named
//! variables. [`graph::ProgramGraphBuilder`] turns a program into a dataflow
//! graph, a [`pattern::PatternBuilder`] describes a template subgraph with
//! predicates on its nodes, and [`matcher::PatternMatcher`] finds disjoint
//! occurrences of the template. Passes in [`pass`] use the matches to splice
//! cheaper instruction sequences into the program; [`pass::DotMergerPass`]
//! merges two matrix multiplications that share an operand.

pub mod error;
pub mod graph;
pub mod matcher;
pub mod pass;
pub mod pattern;
pub mod program;

pub use error::{Error, Result};
