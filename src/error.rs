use snafu::Snafu;

use crate::pass::PassState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that abort the current pass invocation.
///
/// Precondition mismatches inside a pass (e.g. two matched multiplications
/// disagreeing on a transpose flag) are not errors: the pass logs them and
/// skips the match.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A variable is produced by more than one instruction.
    #[snafu(display("variable {var:?} is defined by instruction {first} and again by instruction {second}"))]
    DuplicateDefinition { var: String, first: usize, second: usize },

    /// An instruction refers to a variable index outside the arena.
    #[snafu(display("instruction {instr} ({op_type}) refers to unknown variable index {index}"))]
    UnknownVariable { instr: usize, op_type: String, index: usize },

    /// An instruction reads a variable that is defined later in the list.
    #[snafu(display("instruction {instr} ({op_type}) reads {var:?} before it is defined"))]
    UseBeforeDefinition { instr: usize, op_type: String, var: String },

    #[snafu(display("variable name {name:?} is used by more than one variable"))]
    DuplicateName { name: String },

    /// The program graph builder was asked to intern the same variable twice.
    #[snafu(display("repeated addition of variable {var:?} to the program graph"))]
    RepeatedVariable { var: String },

    #[snafu(display("no instruction defines variable {var:?}"))]
    MissingProducer { var: String },

    #[snafu(display("{op_type} instruction has no attribute {key:?}"))]
    MissingAttr { op_type: String, key: String },

    #[snafu(display("attribute {key:?} of {op_type} instruction is not of type {expected}"))]
    AttrType { op_type: String, key: String, expected: &'static str },

    #[snafu(display("shape mismatch in {op_type}: {message}"))]
    ShapeMismatch { op_type: String, message: String },

    /// Returned by ndarray while interpreting a program.
    #[snafu(display("ndarray rejected {op_type}: {source}"))]
    Ndarray { op_type: String, source: ndarray::ShapeError },

    #[snafu(display("no value was supplied for program input {name:?}"))]
    MissingInput { name: String },

    #[snafu(display("operator {op_type:?} is not supported by the interpreter"))]
    UnsupportedOp { op_type: String },

    #[snafu(display("instruction list contains a dependency cycle"))]
    CyclicProgram,

    /// A pattern without instructions has no edges to drive the matcher.
    #[snafu(display("pattern has no instructions"))]
    EmptyPattern,

    #[snafu(display("pattern node {node} is not connected to any instruction"))]
    DisconnectedPatternNode { node: usize },

    #[snafu(display("pattern label {label:?} is used twice"))]
    DuplicateLabel { label: String },

    #[snafu(display("pattern has no node labelled {label:?}"))]
    UnknownLabel { label: String },

    #[snafu(display("pattern node labelled {label:?} is not bound to a {expected} in the match"))]
    LabelKind { label: String, expected: &'static str },

    #[snafu(display("no pass named {name:?} is registered"))]
    UnknownPass { name: String },

    #[snafu(display("pass {pass} cannot {operation} in state {state:?}"))]
    InvalidPassState { pass: String, state: PassState, operation: &'static str },

    #[snafu(display("could not read or write program JSON: {source}"))]
    Json { source: serde_json::Error },
}
