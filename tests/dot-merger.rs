mod common;

use common::*;
use std::collections::BTreeSet;
use subgraph_rewrite::pass::{DotMergerPass, PassRegistry, PassState, ProgramPass, Target};
use subgraph_rewrite::program::ops::{ADD, CONCAT, MATMUL, SLICE};
use subgraph_rewrite::program::{DType, Instruction, Program, ProgramBuilder, VarId, Variable};
use subgraph_rewrite::Error;

fn concat_of(program: &Program, inputs: &[VarId]) -> Instruction {
    program
        .instructions()
        .iter()
        .find(|instr| instr.op_type == CONCAT && instr.inputs == inputs)
        .cloned()
        .unwrap()
}

fn slices(program: &Program) -> Vec<(Vec<i64>, Vec<i64>, Vec<i64>)> {
    program
        .instructions()
        .iter()
        .filter(|instr| instr.op_type == SLICE)
        .map(|instr| {
            (
                instr.attr::<Vec<i64>>("axes").unwrap(),
                instr.attr::<Vec<i64>>("starts").unwrap(),
                instr.attr::<Vec<i64>>("ends").unwrap(),
            )
        })
        .collect()
}

/// D = A.B, E = A.C, out = concat([D, E], 1), with A 2x10201 and B, C
/// 10201x50.
#[test]
fn merged_product_matches_separate_products() {
    test_logger::ensure_env_logger_initialized();

    let (m, k, n1, n2) = (2, 10201, 50, 50);
    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[m, k], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[k, n1], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[k, n2], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    let e = builder.matmul(a, c, false, false).unwrap();
    let out = builder.concat(&[d, e], 1).unwrap();
    builder.set_name(out, "out").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["out"]);

    assert_eq!(count_op(&merged, MATMUL), 1);
    assert_eq!(count_op(&merged, CONCAT), 2);
    assert_eq!(count_op(&merged, SLICE), 2);

    // The later multiplication's operand comes first.
    let stacked = concat_of(&merged, &[c, b]);
    assert_eq!(stacked.attr::<i64>("axis").unwrap(), 1);
    assert_eq!(merged.var(stacked.outputs[0]).shape, vec![k, n1 + n2]);
    assert_eq!(
        slices(&merged),
        vec![
            (vec![1], vec![0], vec![50]),
            (vec![1], vec![50], vec![100])
        ]
    );

    assert_fetched_equivalent(&program, &merged, &["out"]);
}

#[test]
fn consumers_read_the_slices() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[2, 64], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[64, 50], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[64, 50], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    let e = builder.matmul(a, c, false, false).unwrap();
    let f = builder.create_input(DType::Fp32, &[2, 50], "D").unwrap();
    let g = builder.elementwise_add(d, f).unwrap();
    let h = builder.elementwise_add(e, g).unwrap();
    builder.set_name(h, "h").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["h"]);

    assert_eq!(count_op(&merged, MATMUL), 1);
    for instr in merged.instructions() {
        assert!(!instr.inputs.contains(&d) && !instr.inputs.contains(&e));
        assert!(!instr.outputs.contains(&d) && !instr.outputs.contains(&e));
    }
    let slice_outputs: Vec<VarId> = merged
        .instructions()
        .iter()
        .filter(|instr| instr.op_type == SLICE)
        .map(|instr| instr.outputs[0])
        .collect();
    let adds: Vec<&Instruction> = merged
        .instructions()
        .iter()
        .filter(|instr| instr.op_type == ADD)
        .collect();
    assert_eq!(adds[0].inputs, vec![slice_outputs[1], f]);
    assert_eq!(adds[1].inputs, vec![slice_outputs[0], g]);

    assert_fetched_equivalent(&program, &merged, &["h"]);
}

#[test]
fn shared_right_operand_concatenates_rows() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[50, 128], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[30, 128], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[128, 2], "C").unwrap();
    let d = builder.matmul(a, c, false, false).unwrap();
    let e = builder.matmul(b, c, false, false).unwrap();
    let f = builder.concat(&[d, e], 0).unwrap();
    builder.set_name(f, "f").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["f"]);

    let stacked = concat_of(&merged, &[b, a]);
    assert_eq!(stacked.attr::<i64>("axis").unwrap(), 0);
    let fused = merged
        .instructions()
        .iter()
        .find(|instr| instr.op_type == MATMUL)
        .unwrap();
    assert_eq!(fused.inputs, vec![stacked.outputs[0], c]);
    assert_eq!(
        slices(&merged),
        vec![(vec![0], vec![0], vec![30]), (vec![0], vec![30], vec![80])]
    );

    assert_fetched_equivalent(&program, &merged, &["f"]);
}

#[test]
fn transposed_right_factors_split_columns() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[3, 40], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[7, 40], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[5, 40], "C").unwrap();
    let d = builder.matmul(a, b, false, true).unwrap();
    let e = builder.matmul(a, c, false, true).unwrap();
    builder.set_name(d, "d").unwrap();
    builder.set_name(e, "e").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["d", "e"]);

    assert_eq!(concat_of(&merged, &[c, b]).attr::<i64>("axis").unwrap(), 0);
    assert_eq!(
        slices(&merged),
        vec![(vec![1], vec![0], vec![5]), (vec![1], vec![5], vec![12])]
    );
    assert_fetched_equivalent(&program, &merged, &["d", "e"]);
}

#[test]
fn transposed_left_factors_split_rows() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[40, 6], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[40, 4], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[40, 3], "C").unwrap();
    let d = builder.matmul(a, c, true, false).unwrap();
    let e = builder.matmul(b, c, true, false).unwrap();
    builder.set_name(d, "d").unwrap();
    builder.set_name(e, "e").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["d", "e"]);

    assert_eq!(concat_of(&merged, &[b, a]).attr::<i64>("axis").unwrap(), 1);
    assert_eq!(
        slices(&merged),
        vec![(vec![0], vec![0], vec![4]), (vec![0], vec![4], vec![10])]
    );
    assert_fetched_equivalent(&program, &merged, &["d", "e"]);
}

#[test]
fn differing_transpose_flags_are_not_merged() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[8, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 8], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[8, 8], "C").unwrap();
    builder.matmul(a, b, false, false).unwrap();
    builder.matmul(a, c, false, true).unwrap();
    let program = builder.build().unwrap();

    let mut rewritten = program.clone();
    let mut pass = DotMergerPass::new();
    assert!(pass.match_program(&rewritten).unwrap());
    assert_eq!(
        pass.rewrite(&mut rewritten, &BTreeSet::new(), Target::Host)
            .unwrap(),
        0
    );
    assert_eq!(pass.state(), PassState::Rewritten);
    assert_eq!(rewritten, program);
}

#[test]
fn shared_operand_on_different_sides_is_not_merged() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[8, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 8], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[8, 8], "C").unwrap();
    builder.matmul(a, b, false, false).unwrap();
    builder.matmul(c, a, false, false).unwrap();
    let program = builder.build().unwrap();

    assert_eq!(merge(&program, &[]), program);
}

#[test]
fn mixed_element_types_are_not_merged() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[4, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 3], "B").unwrap();
    let c = builder.create_input(DType::Fp64, &[8, 3], "C").unwrap();
    builder.matmul(a, b, false, false).unwrap();
    builder.matmul(a, c, false, false).unwrap();
    let program = builder.build().unwrap();

    assert_eq!(merge(&program, &[]), program);
}

#[test]
fn program_without_pairs_is_unchanged() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[4, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 3], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[4, 3], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    builder.elementwise_add(d, c).unwrap();
    let program = builder.build().unwrap();

    let mut pass = DotMergerPass::new();
    let mut rewritten = program.clone();
    pass.apply_impl(&mut rewritten, &BTreeSet::new(), Target::Host)
        .unwrap();
    assert_eq!(pass.state(), PassState::NoOp);
    assert_eq!(rewritten.len(), program.len());
    assert_eq!(rewritten, program);
}

#[test]
fn reader_between_the_products_moves_after_the_slices() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[4, 16], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[16, 6], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[16, 6], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    let x = builder.elementwise_add(d, d).unwrap();
    let e = builder.matmul(a, c, false, false).unwrap();
    let y = builder.elementwise_add(x, e).unwrap();
    builder.set_name(y, "y").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["y"]);

    merged.validate().unwrap();
    let ops: Vec<&str> = merged
        .instructions()
        .iter()
        .map(|instr| instr.op_type.as_str())
        .collect();
    assert_eq!(ops, vec![CONCAT, MATMUL, SLICE, SLICE, ADD, ADD]);
    assert_fetched_equivalent(&program, &merged, &["y"]);
}

#[test]
fn products_feeding_each_other_are_not_merged() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[8, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 8], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[8, 8], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    let shifted = builder.elementwise_add(d, c).unwrap();
    builder.matmul(a, shifted, false, false).unwrap();
    let program = builder.build().unwrap();

    assert_eq!(merge(&program, &[]), program);
}

#[test]
fn repeated_runs_reach_a_fixpoint() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[3, 32], "A").unwrap();
    let mut fetched = Vec::new();
    for (name, n) in &[("B", 4), ("C", 5), ("D", 6)] {
        let w = builder.create_input(DType::Fp32, &[32, *n], name).unwrap();
        let out = builder.matmul(a, w, false, false).unwrap();
        let out_name = format!("{}_out", name);
        builder.set_name(out, &out_name).unwrap();
        fetched.push(out_name);
    }
    let program = builder.build().unwrap();
    let fetch_ids: Vec<&str> = fetched.iter().map(String::as_str).collect();

    let once = merge(&program, &fetch_ids);
    assert_eq!(count_op(&once, MATMUL), 2);
    let twice = merge(&once, &fetch_ids);
    assert_eq!(count_op(&twice, MATMUL), 1);
    let thrice = merge(&twice, &fetch_ids);
    assert_eq!(thrice, twice);

    assert_fetched_equivalent(&program, &twice, &fetch_ids);
}

#[test]
fn fetched_results_keep_their_names() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[2, 16], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[16, 3], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[16, 3], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    let e = builder.matmul(a, c, false, false).unwrap();
    builder.set_name(d, "D").unwrap();
    builder.set_name(e, "E").unwrap();
    let program = builder.build().unwrap();

    let merged = merge(&program, &["D"]);

    let new_d = merged.find_var("D").unwrap();
    assert_ne!(new_d, d);
    let producer = merged.producer(new_d).unwrap();
    assert_eq!(merged.instructions()[producer].op_type, SLICE);
    assert_eq!(merged.var(d).id, "D@unfused");
    assert_eq!(merged.producer(d), None);
    // Not fetched, so not renamed.
    assert_eq!(merged.find_var("E"), Some(e));
    assert_eq!(merged.producer(e), None);

    assert_fetched_equivalent(&program, &merged, &["D"]);
}

#[test]
fn registry_runs_passes_by_name() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[2, 16], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[16, 3], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[16, 3], "C").unwrap();
    let d = builder.matmul(a, b, false, false).unwrap();
    let e = builder.matmul(a, c, false, false).unwrap();
    let out = builder.elementwise_add(d, e).unwrap();
    builder.set_name(out, "out").unwrap();
    let program = builder.build().unwrap();
    let fetch_ids: BTreeSet<String> = vec!["out".to_string()].into_iter().collect();
    let registry = PassRegistry::default();

    let mut rewritten = program.clone();
    match registry.apply_passes(
        &mut rewritten,
        &["DotMerger", "Decomposer"],
        &fetch_ids,
        Target::NvGpu,
    ) {
        Err(Error::UnknownPass { name }) => assert_eq!(name, "Decomposer"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rewritten, program);

    registry
        .apply_passes(
            &mut rewritten,
            &["DotMerger", "DotMerger"],
            &fetch_ids,
            Target::NvGpu,
        )
        .unwrap();
    assert_eq!(count_op(&rewritten, MATMUL), 1);
    assert_fetched_equivalent(&program, &rewritten, &["out"]);
}

#[test]
fn one_run_merges_every_disjoint_pair() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[2, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 3], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[8, 4], "C").unwrap();
    let x = builder.create_input(DType::Fp32, &[5, 8], "X").unwrap();
    let y = builder.create_input(DType::Fp32, &[6, 8], "Y").unwrap();
    let z = builder.create_input(DType::Fp32, &[8, 3], "Z").unwrap();
    // The two pairs are interleaved in the instruction list.
    for (name, lhs, rhs) in &[("AB", a, b), ("XZ", x, z), ("AC", a, c), ("YZ", y, z)] {
        let out = builder.matmul(*lhs, *rhs, false, false).unwrap();
        builder.set_name(out, name).unwrap();
    }
    let program = builder.build().unwrap();
    let fetch_ids = ["AB", "XZ", "AC", "YZ"];

    let mut pass = DotMergerPass::new();
    assert!(pass.match_program(&program).unwrap());
    assert_eq!(pass.num_matches(), 2);
    let mut merged = program.clone();
    let fetch_set: BTreeSet<String> = fetch_ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(pass.rewrite(&mut merged, &fetch_set, Target::Host).unwrap(), 2);

    assert_eq!(count_op(&merged, MATMUL), 2);
    assert_eq!(count_op(&merged, SLICE), 4);
    for name in &fetch_ids {
        let var = merged.find_var(name).unwrap();
        let producer = merged.producer(var).unwrap();
        assert_eq!(merged.instructions()[producer].op_type, SLICE);
    }
    assert_eq!(merge(&merged, &fetch_ids), merged);
    assert_fetched_equivalent(&program, &merged, &fetch_ids);
}

/// A `MissingAttr` on the second pair must not leave the first pair fused.
#[test]
fn malformed_pair_leaves_program_untouched() {
    test_logger::ensure_env_logger_initialized();

    let mut builder = ProgramBuilder::new();
    let a = builder.create_input(DType::Fp32, &[2, 8], "A").unwrap();
    let b = builder.create_input(DType::Fp32, &[8, 3], "B").unwrap();
    let c = builder.create_input(DType::Fp32, &[8, 3], "C").unwrap();
    builder.matmul(a, b, false, false).unwrap();
    builder.matmul(a, c, false, false).unwrap();
    let x = builder.create_input(DType::Fp32, &[4, 8], "X").unwrap();
    let y = builder.create_input(DType::Fp32, &[8, 2], "Y").unwrap();
    let w = builder.create_input(DType::Fp32, &[8, 2], "W").unwrap();
    let mut result = |name: &str| {
        builder
            .add_var(Variable {
                id: name.to_string(),
                shape: vec![4, 2],
                dtype: DType::Fp32,
            })
            .unwrap()
    };
    let p = result("P");
    let q = result("Q");
    // No transpose flags.
    builder.append_instruction(Instruction::new(MATMUL, vec![x, y], vec![p]));
    builder.append_instruction(Instruction::new(MATMUL, vec![x, w], vec![q]));
    let program = builder.build().unwrap();
    let fetch_ids = BTreeSet::new();

    let mut pass = DotMergerPass::new();
    assert!(pass.match_program(&program).unwrap());
    assert_eq!(pass.num_matches(), 2);
    let mut rewritten = program.clone();
    match pass.rewrite(&mut rewritten, &fetch_ids, Target::Host) {
        Err(Error::MissingAttr { key, .. }) => assert_eq!(key, "trans_a"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rewritten, program);

    // The failed run is over; it cannot be retried.
    assert_eq!(pass.state(), PassState::Rewritten);
    assert!(matches!(
        pass.rewrite(&mut rewritten, &fetch_ids, Target::Host),
        Err(Error::InvalidPassState { .. })
    ));

    assert!(PassRegistry::default()
        .apply_passes(&mut rewritten, &["DotMerger"], &fetch_ids, Target::Host)
        .is_err());
    assert_eq!(rewritten, program);
}
