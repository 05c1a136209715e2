use super::ops::{self, ADD, CONCAT, MATMUL, SLICE};
use super::{Instruction, Program};
use crate::error::*;
use approx::AbsDiffEq;
use log::debug;
use ndarray::{ArrayD, ArrayViewD, Axis, Ix2, LinalgScalar, Slice};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;

/// Maps program input names to their values.
pub type Environment<'a, DataType> = HashMap<&'a str, ArrayD<DataType>>;

fn input<'v, DataType>(
    values: &'v HashMap<String, ArrayD<DataType>>,
    program: &Program,
    instr: &Instruction,
    index: usize,
) -> Result<ArrayViewD<'v, DataType>> {
    let name = &program.var(instr.inputs[index]).id;
    values
        .get(name)
        .map(|value| value.view())
        .context(MissingInputSnafu { name })
}

fn run_instruction<DataType: LinalgScalar>(
    values: &HashMap<String, ArrayD<DataType>>,
    program: &Program,
    instr: &Instruction,
) -> Result<ArrayD<DataType>> {
    let op_type = instr.op_type.as_str();
    match op_type {
        MATMUL => {
            let mut a = input(values, program, instr, 0)?
                .into_dimensionality::<Ix2>()
                .context(NdarraySnafu { op_type })?;
            let mut b = input(values, program, instr, 1)?
                .into_dimensionality::<Ix2>()
                .context(NdarraySnafu { op_type })?;
            if instr.attr_or("trans_a", false) {
                a = a.reversed_axes();
            }
            if instr.attr_or("trans_b", false) {
                b = b.reversed_axes();
            }
            Ok(a.dot(&b).into_dyn())
        }
        CONCAT => {
            let axis = instr.attr::<i64>("axis")? as usize;
            let views = (0..instr.inputs.len())
                .map(|i| input(values, program, instr, i))
                .collect::<Result<Vec<_>>>()?;
            ndarray::stack(Axis(axis), &views).context(NdarraySnafu { op_type })
        }
        SLICE => {
            let mut view = input(values, program, instr, 0)?;
            for (axis, start, end) in ops::slice_params(instr)? {
                view.slice_axis_inplace(Axis(axis), Slice::from(start..end));
            }
            Ok(view.to_owned())
        }
        ADD => {
            let a = input(values, program, instr, 0)?;
            let b = input(values, program, instr, 1)?;
            Ok(&a + &b)
        }
        _ => UnsupportedOpSnafu { op_type }.fail(),
    }
}

/// Runs `program` on the tensors in `env` and returns the value of every
/// variable, keyed by name.
///
/// Each instruction is shape-checked against the declared variable shapes
/// before it runs, and input tensors must match their declared shapes, so
/// ndarray never sees operands it would panic on.
pub fn interpret<DataType: LinalgScalar>(
    program: &Program,
    env: &Environment<DataType>,
) -> Result<HashMap<String, ArrayD<DataType>>> {
    program.validate()?;

    let mut values = HashMap::new();
    for var in program.inputs() {
        let var = program.var(var);
        let value = env
            .get(var.id.as_str())
            .context(MissingInputSnafu { name: &var.id })?;
        ensure!(
            value.shape() == var.shape.as_slice(),
            ShapeMismatchSnafu {
                op_type: "input",
                message: format!(
                    "{:?} is declared {:?} but was given {:?}",
                    var.id,
                    var.shape,
                    value.shape()
                ),
            }
        );
        values.insert(var.id.clone(), value.clone());
    }

    for instr in program.instructions() {
        let shape = ops::infer_shape(program, instr)?;
        let result = run_instruction(&values, program, instr)?;
        debug_assert_eq!(result.shape(), shape.as_slice());
        debug!("{} -> {:?}", instr.op_type, result.shape());
        for &out in &instr.outputs {
            values.insert(program.var(out).id.clone(), result.clone());
        }
    }

    Ok(values)
}

/// True when every tensor in `expected` has a counterpart of the same name
/// and shape in `actual` that agrees to within `tolerance`.
pub fn outputs_close<DataType>(
    expected: &HashMap<String, ArrayD<DataType>>,
    actual: &HashMap<String, ArrayD<DataType>>,
    tolerance: DataType,
) -> bool
where
    DataType: AbsDiffEq<Epsilon = DataType> + Clone,
{
    expected.iter().all(|(name, value)| {
        actual
            .get(name)
            .map_or(false, |other| value.abs_diff_eq(other, tolerance.clone()))
    })
}
