//! Fuses two matrix multiplications that share an operand.
//!
//! ```text
//! (m, k) x (k, n1) -> (m, n1)
//! (m, k) x (k, n2) -> (m, n2)
//! ```
//!
//! becomes
//!
//! ```text
//! (k, n1) concat (k, n2)  -> (k, n1 + n2)
//! (m, k) x (k, n1 + n2)   -> (m, n1 + n2)
//! slice [:, 0:n1], [:, n1:n1 + n2]
//! ```
//!
//! and likewise when the shared operand is on the right, in which case the
//! other operands are stacked row-wise and the product is split by rows.

use super::{PassState, ProgramPass, Target};
use crate::error::*;
use crate::graph::{ProgramGraph, ProgramGraphBuilder, VarView};
use crate::matcher::{Match, PatternMatcher};
use crate::pattern::{Pattern, PatternBuilder};
use crate::program::ops::{self, MATMUL};
use crate::program::{stable_topological_sort, Program, VarId};
use log::{debug, info};
use snafu::{ensure, OptionExt};
use std::collections::BTreeSet;

pub const NAME: &str = "DotMerger";

fn has_2d_shape(var: &VarView<'_>) -> bool {
    var.variable().shape.len() == 2
}

fn in_matmul(var: &VarView<'_>) -> bool {
    var.consumers().any(|instr| instr.op_type() == MATMUL)
}

fn out_matmul(var: &VarView<'_>) -> bool {
    var.producers().any(|instr| instr.op_type() == MATMUL)
}

/// `matmul_0(in_0, in_1) -> out_0` and `matmul_1(in_0, in_2) -> out_1`.
///
/// Every variable is external: operands may come from anywhere and results
/// may be read by anything. Edges carry no operand order, so `in_0` may sit
/// on either side of the multiplications.
pub fn generate_pattern() -> Result<Pattern> {
    let mut builder = PatternBuilder::new();
    let mut operand = |label: &str| {
        builder
            .add_var()
            .assert(has_2d_shape)
            .assert(in_matmul)
            .label(label)
            .external()
            .id()
    };
    let in_0 = operand("in_0");
    let in_1 = operand("in_1");
    let in_2 = operand("in_2");
    let mut result = |label: &str| {
        builder
            .add_var()
            .assert(has_2d_shape)
            .assert(out_matmul)
            .label(label)
            .external()
            .id()
    };
    let out_0 = result("out_0");
    let out_1 = result("out_1");
    builder
        .add_instr(MATMUL, &[in_0, in_1], &[out_0])
        .label("matmul_0");
    builder
        .add_instr(MATMUL, &[in_0, in_2], &[out_1])
        .label("matmul_1");
    builder.release()
}

/// Axis along which the two non-shared operands are concatenated.
///
/// `lhs` is true when the shared operand is the left factor of both
/// multiplications. The non-shared operands then contribute columns, which
/// live on axis 1 unless `trans_b` has them stored as rows. On the right,
/// they contribute rows, which live on axis 0 unless `trans_a` flips them.
pub fn merge_axis(lhs: bool, trans_a: bool, trans_b: bool) -> usize {
    match (lhs, trans_a, trans_b) {
        (false, false, _) => 0,
        (true, _, true) => 0,
        _ => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatchedPair {
    in_0: VarId,
    in_1: VarId,
    in_2: VarId,
    out_0: VarId,
    out_1: VarId,
}

impl MatchedPair {
    fn resolve(pattern: &Pattern, graph: &ProgramGraph<'_>, m: &Match) -> Result<Self> {
        let var = |label| pattern.mapped_var(m, graph, label).map(|view| view.id());
        Ok(MatchedPair {
            in_0: var("in_0")?,
            in_1: var("in_1")?,
            in_2: var("in_2")?,
            out_0: var("out_0")?,
            out_1: var("out_1")?,
        })
    }
}

/// A match that passed every precondition, with the instruction positions
/// it occupies in the current program.
#[derive(Debug)]
struct Fusion {
    pair: MatchedPair,
    matmul_0: usize,
    matmul_1: usize,
    lhs: bool,
    trans_a: bool,
    trans_b: bool,
    axis: usize,
}

/// Checks that fusing `pair` in the current `program` is sound. `Ok(None)`
/// means the match is skipped; errors mean the program is malformed.
fn plan_fusion(program: &Program, pair: MatchedPair) -> Result<Option<Fusion>> {
    let producer = |var: VarId| {
        program.producer(var).context(MissingProducerSnafu {
            var: &program.var(var).id,
        })
    };
    let matmul_0 = producer(pair.out_0)?;
    let matmul_1 = producer(pair.out_1)?;
    let instr_0 = &program.instructions()[matmul_0];
    let instr_1 = &program.instructions()[matmul_1];
    let name = |var: VarId| program.var(var).id.as_str();

    // Fusing would create a cycle if either result feeds the other
    // multiplication.
    let graph = ProgramGraphBuilder::new(program)?.release();
    let reaches = |from: VarId, to: VarId| match (graph.var_node(from), graph.var_node(to)) {
        (Some(from), Some(to)) => graph.accessible(from, to),
        _ => false,
    };
    if reaches(pair.out_0, pair.in_2) || reaches(pair.out_1, pair.in_1) {
        info!(
            "skipping {} and {}: one result feeds the other multiplication",
            name(pair.out_0),
            name(pair.out_1)
        );
        return Ok(None);
    }

    let trans_a: bool = instr_0.attr("trans_a")?;
    let trans_b: bool = instr_0.attr("trans_b")?;
    if trans_a != instr_1.attr::<bool>("trans_a")? || trans_b != instr_1.attr::<bool>("trans_b")? {
        info!(
            "skipping {} and {}: transpose flags differ",
            name(pair.out_0),
            name(pair.out_1)
        );
        return Ok(None);
    }

    let shared_0 = instr_0.input_index(pair.in_0);
    let shared_1 = instr_1.input_index(pair.in_0);
    if shared_0 != shared_1 || instr_0.input_index(pair.in_1) != instr_1.input_index(pair.in_2) {
        info!(
            "skipping {} and {}: {} is not in the same position in both",
            name(pair.out_0),
            name(pair.out_1),
            name(pair.in_0)
        );
        return Ok(None);
    }
    let lhs = shared_0 == Some(0);
    let axis = merge_axis(lhs, trans_a, trans_b);

    let (in_1, in_2) = (program.var(pair.in_1), program.var(pair.in_2));
    if in_1.shape[1 - axis] != in_2.shape[1 - axis] {
        info!(
            "skipping {} and {}: shapes {:?} and {:?} cannot be concatenated on axis {}",
            name(pair.in_1),
            name(pair.in_2),
            in_1.shape,
            in_2.shape,
            axis
        );
        return Ok(None);
    }
    if in_1.dtype != in_2.dtype {
        info!(
            "skipping {} and {}: element types {:?} and {:?} differ",
            name(pair.in_1),
            name(pair.in_2),
            in_1.dtype,
            in_2.dtype
        );
        return Ok(None);
    }

    Ok(Some(Fusion {
        pair,
        matmul_0,
        matmul_1,
        lhs,
        trans_a,
        trans_b,
        axis,
    }))
}

/// Picks a name for a retired result that is not taken yet.
fn retired_name(program: &Program, name: &str) -> String {
    let retired = format!("{}@unfused", name);
    if program.find_var(&retired).is_none() {
        retired
    } else {
        program.fresh_name(&retired)
    }
}

/// Replaces the two multiplications by concat, one wide multiplication and
/// two slices. The new list is built aside and installed in one step.
fn splice(program: &mut Program, fusion: &Fusion, fetch_ids: &BTreeSet<String>) -> Result<()> {
    let pair = fusion.pair;
    let concat = ops::concat(program, &[pair.in_1, pair.in_2], fusion.axis)?;
    let stacked = concat.outputs[0];
    let matmul = if fusion.lhs {
        ops::matmul(program, pair.in_0, stacked, fusion.trans_a, fusion.trans_b)?
    } else {
        ops::matmul(program, stacked, pair.in_0, fusion.trans_a, fusion.trans_b)?
    };
    let product = matmul.outputs[0];

    // The concatenated operands show up along the product's column axis when
    // shared on the left and along its row axis otherwise.
    let out_axis = if fusion.lhs { 1 } else { 0 };
    let split = program.var(pair.in_1).shape[fusion.axis];
    let total = split + program.var(pair.in_2).shape[fusion.axis];
    let slice_0 = ops::slice(program, product, &[out_axis], &[0], &[split])?;
    let slice_1 = ops::slice(program, product, &[out_axis], &[split], &[total])?;
    let (new_0, new_1) = (slice_0.outputs[0], slice_1.outputs[0]);
    ensure!(
        program.var(new_0).shape == program.var(pair.out_0).shape
            && program.var(new_1).shape == program.var(pair.out_1).shape,
        ShapeMismatchSnafu {
            op_type: MATMUL,
            message: format!(
                "fused results {:?}/{:?} do not replace {:?}/{:?}",
                program.var(new_0).shape,
                program.var(new_1).shape,
                program.var(pair.out_0).shape,
                program.var(pair.out_1).shape
            ),
        }
    );

    let earlier = fusion.matmul_0.min(fusion.matmul_1);
    let later = fusion.matmul_0.max(fusion.matmul_1);
    let mut block = Some(vec![concat, matmul, slice_0, slice_1]);
    let mut instructions = Vec::with_capacity(program.len() + 2);
    for (i, instr) in program.instructions().iter().enumerate() {
        if i == earlier {
            continue;
        }
        if i == later {
            instructions.extend(block.take().into_iter().flatten());
            continue;
        }
        let mut instr = instr.clone();
        for input in instr.inputs.iter_mut() {
            if *input == pair.out_0 {
                *input = new_0;
            } else if *input == pair.out_1 {
                *input = new_1;
            }
        }
        instructions.push(instr);
    }
    // Readers of the first result that sat between the two multiplications
    // now precede the slices and have to move down.
    let instructions = stable_topological_sort(instructions)?;
    program.replace_instructions(instructions);

    for &(old, new) in &[(pair.out_0, new_0), (pair.out_1, new_1)] {
        let name = program.var(old).id.clone();
        if fetch_ids.contains(&name) {
            let retired = retired_name(program, &name);
            program.rename_var(old, &retired)?;
            program.rename_var(new, &name)?;
            debug!("{} now names the slice of the fused product", name);
        }
    }

    program.validate()
}

/// One run of the fusion on one program snapshot. Create a fresh instance
/// to run again on the rewritten program.
pub struct DotMergerPass {
    state: PassState,
    matches: Vec<MatchedPair>,
}

impl Default for DotMergerPass {
    fn default() -> Self {
        DotMergerPass::new()
    }
}

impl DotMergerPass {
    pub fn new() -> Self {
        DotMergerPass {
            state: PassState::Unstarted,
            matches: Vec::new(),
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn num_matches(&self) -> usize {
        self.matches.len()
    }

    /// Searches `program` for fusable pairs. Returns whether any was found.
    pub fn match_program(&mut self, program: &Program) -> Result<bool> {
        ensure!(
            self.state == PassState::Unstarted,
            InvalidPassStateSnafu {
                pass: NAME,
                state: self.state,
                operation: "match",
            }
        );
        let graph = ProgramGraphBuilder::new(program)?.release();
        let pattern = generate_pattern()?;
        let matches = PatternMatcher::new(&pattern, &graph).detect_patterns();
        self.matches = matches
            .iter()
            .map(|m| MatchedPair::resolve(&pattern, &graph, m))
            .collect::<Result<_>>()?;
        debug!("{} candidate pair(s)", self.matches.len());

        self.state = if self.matches.is_empty() {
            PassState::NoOp
        } else {
            PassState::Matched
        };
        Ok(!self.matches.is_empty())
    }

    /// Fuses every match whose preconditions hold, one after another, and
    /// returns how many were fused. Matches that fail a precondition are
    /// left exactly as they were.
    ///
    /// The splices run on a copy of `program`, which is installed only once
    /// every match has been handled. On error `program` is left untouched.
    /// Either way the pass ends up `Rewritten`.
    pub fn rewrite(&mut self, program: &mut Program, fetch_ids: &BTreeSet<String>, target: Target) -> Result<usize> {
        ensure!(
            self.state == PassState::Matched,
            InvalidPassStateSnafu {
                pass: NAME,
                state: self.state,
                operation: "rewrite",
            }
        );
        debug!("rewriting {} match(es) for {:?}", self.matches.len(), target);

        let matches = std::mem::take(&mut self.matches);
        self.state = PassState::Rewritten;

        let mut working = program.clone();
        let mut fused = 0;
        for pair in matches {
            if let Some(fusion) = plan_fusion(&working, pair)? {
                debug!(
                    "fusing instructions {} and {} on axis {}",
                    fusion.matmul_0, fusion.matmul_1, fusion.axis
                );
                splice(&mut working, &fusion, fetch_ids)?;
                fused += 1;
            }
        }
        *program = working;
        info!("fused {} pair(s) of multiplications", fused);
        Ok(fused)
    }
}

impl ProgramPass for DotMergerPass {
    fn name(&self) -> &str {
        NAME
    }

    fn apply_impl(&mut self, program: &mut Program, fetch_ids: &BTreeSet<String>, target: Target) -> Result<()> {
        if self.match_program(program)? {
            self.rewrite(program, fetch_ids, target)?;
        }
        Ok(())
    }
}
