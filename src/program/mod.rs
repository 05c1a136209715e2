// Re-export everything in program.rs
mod program;
pub use program::*;

pub mod ops;
pub use ops::ProgramBuilder;

pub mod interpreter;
