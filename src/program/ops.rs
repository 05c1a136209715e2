//! The operator kinds the optimizer knows about, their shape rules and a
//! builder for assembling programs out of them.

use super::{DType, Instruction, Program, VarId, Variable};
use crate::error::*;
use itertools::izip;
use snafu::ensure;
use std::convert::TryFrom;

pub const MATMUL: &str = "matmul";
pub const CONCAT: &str = "concat";
pub const SLICE: &str = "slice";
pub const ADD: &str = "elementwise_add";

fn mismatch(op_type: &str, message: String) -> Error {
    Error::ShapeMismatch {
        op_type: op_type.to_string(),
        message,
    }
}

fn to_usize(instr: &Instruction, key: &str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        mismatch(
            &instr.op_type,
            format!("attribute {} holds negative value {}", key, value),
        )
    })
}

fn usize_list(instr: &Instruction, key: &str) -> Result<Vec<usize>> {
    instr
        .attr::<Vec<i64>>(key)?
        .into_iter()
        .map(|v| to_usize(instr, key, v))
        .collect()
}

/// Returns `(rows, cols)` of a 2-D operand after applying the transpose flag.
fn matrix_dims(program: &Program, op_type: &str, var: VarId, transpose: bool) -> Result<(usize, usize)> {
    let shape = &program.var(var).shape;
    ensure!(
        shape.len() == 2,
        ShapeMismatchSnafu {
            op_type,
            message: format!("operand {:?} has rank {}, expected 2", program.var(var).id, shape.len()),
        }
    );
    Ok(if transpose {
        (shape[1], shape[0])
    } else {
        (shape[0], shape[1])
    })
}

pub(crate) fn slice_params(instr: &Instruction) -> Result<Vec<(usize, usize, usize)>> {
    let axes = usize_list(instr, "axes")?;
    let starts = usize_list(instr, "starts")?;
    let ends = usize_list(instr, "ends")?;
    ensure!(
        axes.len() == starts.len() && axes.len() == ends.len(),
        ShapeMismatchSnafu {
            op_type: &instr.op_type,
            message: "axes, starts and ends differ in length",
        }
    );
    Ok(izip!(axes, starts, ends).collect())
}

/// Computes the output shape of `instr` from the declared shapes of its
/// inputs, checking the operator's shape rules along the way.
pub fn infer_shape(program: &Program, instr: &Instruction) -> Result<Vec<usize>> {
    let op_type = instr.op_type.as_str();
    match op_type {
        MATMUL => {
            ensure!(
                instr.inputs.len() == 2,
                ShapeMismatchSnafu {
                    op_type,
                    message: format!("expected 2 inputs, found {}", instr.inputs.len()),
                }
            );
            let (m, k) = matrix_dims(program, op_type, instr.inputs[0], instr.attr_or("trans_a", false))?;
            let (k2, n) = matrix_dims(program, op_type, instr.inputs[1], instr.attr_or("trans_b", false))?;
            ensure!(
                k == k2,
                ShapeMismatchSnafu {
                    op_type,
                    message: format!("contraction dimensions {} and {} differ", k, k2),
                }
            );
            Ok(vec![m, n])
        }
        CONCAT => {
            let axis = to_usize(instr, "axis", instr.attr::<i64>("axis")?)?;
            let first = instr
                .inputs
                .first()
                .ok_or_else(|| mismatch(op_type, "no inputs".to_string()))?;
            let mut shape = program.var(*first).shape.clone();
            ensure!(
                axis < shape.len(),
                ShapeMismatchSnafu {
                    op_type,
                    message: format!("axis {} out of range for rank {}", axis, shape.len()),
                }
            );
            for &input in &instr.inputs[1..] {
                let other = &program.var(input).shape;
                let compatible = other.len() == shape.len()
                    && (0..shape.len()).all(|i| i == axis || other[i] == shape[i]);
                ensure!(
                    compatible,
                    ShapeMismatchSnafu {
                        op_type,
                        message: format!("cannot concatenate {:?} and {:?} along axis {}", shape, other, axis),
                    }
                );
                shape[axis] += other[axis];
            }
            Ok(shape)
        }
        SLICE => {
            ensure!(
                instr.inputs.len() == 1,
                ShapeMismatchSnafu {
                    op_type,
                    message: format!("expected 1 input, found {}", instr.inputs.len()),
                }
            );
            let mut shape = program.var(instr.inputs[0]).shape.clone();
            for (axis, start, end) in slice_params(instr)? {
                ensure!(
                    axis < shape.len() && start <= end && end <= shape[axis],
                    ShapeMismatchSnafu {
                        op_type,
                        message: format!("range {}..{} on axis {} is outside {:?}", start, end, axis, shape),
                    }
                );
                shape[axis] = end - start;
            }
            Ok(shape)
        }
        ADD => {
            ensure!(
                instr.inputs.len() == 2,
                ShapeMismatchSnafu {
                    op_type,
                    message: format!("expected 2 inputs, found {}", instr.inputs.len()),
                }
            );
            let a = &program.var(instr.inputs[0]).shape;
            let b = &program.var(instr.inputs[1]).shape;
            ensure!(
                a == b,
                ShapeMismatchSnafu {
                    op_type,
                    message: format!("operand shapes {:?} and {:?} differ", a, b),
                }
            );
            Ok(a.clone())
        }
        _ => UnsupportedOpSnafu { op_type }.fail(),
    }
}

/// Gives `instr` a freshly named output variable of the inferred shape.
/// The instruction is returned, not appended: the caller decides where it
/// goes in the instruction list.
fn with_fresh_output(program: &mut Program, mut instr: Instruction) -> Result<Instruction> {
    let shape = infer_shape(program, &instr)?;
    let dtype = program.var(instr.inputs[0]).dtype;
    let id = program.fresh_name("var");
    let out = program.add_var(Variable { id, shape, dtype });
    instr.outputs = vec![out];
    Ok(instr)
}

pub fn matmul(program: &mut Program, a: VarId, b: VarId, trans_a: bool, trans_b: bool) -> Result<Instruction> {
    let instr = Instruction::new(MATMUL, vec![a, b], vec![])
        .with_attr("trans_a", trans_a)
        .with_attr("trans_b", trans_b);
    with_fresh_output(program, instr)
}

pub fn concat(program: &mut Program, inputs: &[VarId], axis: usize) -> Result<Instruction> {
    let instr = Instruction::new(CONCAT, inputs.to_vec(), vec![]).with_attr("axis", axis as i64);
    with_fresh_output(program, instr)
}

pub fn slice(
    program: &mut Program,
    input: VarId,
    axes: &[usize],
    starts: &[usize],
    ends: &[usize],
) -> Result<Instruction> {
    let instr = Instruction::new(SLICE, vec![input], vec![])
        .with_attr("axes", axes)
        .with_attr("starts", starts)
        .with_attr("ends", ends);
    with_fresh_output(program, instr)
}

pub fn elementwise_add(program: &mut Program, a: VarId, b: VarId) -> Result<Instruction> {
    with_fresh_output(program, Instruction::new(ADD, vec![a, b], vec![]))
}

/// Assembles a program one operation at a time, in dataflow order.
///
/// ```
/// use subgraph_rewrite::program::{DType, ProgramBuilder};
///
/// let mut builder = ProgramBuilder::new();
/// let a = builder.create_input(DType::Fp32, &[2, 3], "A").unwrap();
/// let b = builder.create_input(DType::Fp32, &[3, 4], "B").unwrap();
/// let c = builder.matmul(a, b, false, false).unwrap();
/// let program = builder.build().unwrap();
/// assert_eq!(program.var(c).shape, vec![2, 4]);
/// ```
#[derive(Default)]
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder::default()
    }

    pub fn create_input(&mut self, dtype: DType, shape: &[usize], name: &str) -> Result<VarId> {
        ensure!(
            self.program.find_var(name).is_none(),
            DuplicateNameSnafu { name }
        );
        Ok(self.program.add_var(Variable {
            id: name.to_string(),
            shape: shape.to_vec(),
            dtype,
        }))
    }

    fn push(&mut self, instr: Instruction) -> VarId {
        let out = instr.outputs[0];
        self.program.push_instruction(instr);
        out
    }

    pub fn matmul(&mut self, a: VarId, b: VarId, trans_a: bool, trans_b: bool) -> Result<VarId> {
        let instr = matmul(&mut self.program, a, b, trans_a, trans_b)?;
        Ok(self.push(instr))
    }

    pub fn concat(&mut self, inputs: &[VarId], axis: usize) -> Result<VarId> {
        let instr = concat(&mut self.program, inputs, axis)?;
        Ok(self.push(instr))
    }

    pub fn slice(&mut self, input: VarId, axes: &[usize], starts: &[usize], ends: &[usize]) -> Result<VarId> {
        let instr = slice(&mut self.program, input, axes, starts, ends)?;
        Ok(self.push(instr))
    }

    pub fn elementwise_add(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        let instr = elementwise_add(&mut self.program, a, b)?;
        Ok(self.push(instr))
    }

    /// Gives a generated variable a caller-chosen name, e.g. to fetch it.
    pub fn set_name(&mut self, var: VarId, name: &str) -> Result<()> {
        self.program.rename_var(var, name)
    }

    /// Appends a hand-made instruction whose operands already exist.
    pub fn append_instruction(&mut self, instr: Instruction) {
        self.program.push_instruction(instr);
    }

    /// Declares a variable without a producer, for use with
    /// [`append_instruction`](Self::append_instruction).
    pub fn add_var(&mut self, var: Variable) -> Result<VarId> {
        ensure!(
            self.program.find_var(&var.id).is_none(),
            DuplicateNameSnafu { name: &var.id }
        );
        Ok(self.program.add_var(var))
    }

    pub fn build(self) -> Result<Program> {
        self.program.validate()?;
        Ok(self.program)
    }
}
