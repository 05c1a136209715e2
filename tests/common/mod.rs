use ndarray::ArrayD;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rand::{rngs::SmallRng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use subgraph_rewrite::pass::{DotMergerPass, ProgramPass, Target};
use subgraph_rewrite::program::interpreter::{interpret, outputs_close, Environment};
use subgraph_rewrite::program::Program;

/// Seed for every random tensor the tests generate.
pub const SEED: u64 = 23;

/// Uniform [-1, 1) values for every input of `program`, keyed by name.
pub fn random_inputs(program: &Program) -> Vec<(String, ArrayD<f64>)> {
    let mut tensor_rng = SmallRng::seed_from_u64(SEED);
    program
        .inputs()
        .into_iter()
        .map(|var| {
            let var = program.var(var);
            (
                var.id.clone(),
                ArrayD::<f64>::random_using(var.shape.clone(), Uniform::new(-1f64, 1f64), &mut tensor_rng),
            )
        })
        .collect()
}

pub fn run(program: &Program, inputs: &[(String, ArrayD<f64>)]) -> HashMap<String, ArrayD<f64>> {
    let mut env = Environment::new();
    for (name, value) in inputs {
        env.insert(name.as_str(), value.clone());
    }
    interpret(program, &env).unwrap()
}

/// Applies one fresh DotMerger instance to a copy of `program`.
pub fn merge(program: &Program, fetch_ids: &[&str]) -> Program {
    let fetch_ids: BTreeSet<String> = fetch_ids.iter().map(|id| id.to_string()).collect();
    let mut rewritten = program.clone();
    DotMergerPass::new()
        .apply_impl(&mut rewritten, &fetch_ids, Target::Host)
        .unwrap();
    rewritten
}

/// Checks that `after` computes the same fetched values as `before`.
pub fn assert_fetched_equivalent(before: &Program, after: &Program, fetch_ids: &[&str]) {
    let inputs = random_inputs(before);
    let expected: HashMap<String, ArrayD<f64>> = run(before, &inputs)
        .into_iter()
        .filter(|(name, _)| fetch_ids.contains(&name.as_str()))
        .collect();
    assert_eq!(expected.len(), fetch_ids.len());
    let actual = run(after, &inputs);
    assert!(outputs_close(&expected, &actual, 1e-8));
}

pub fn count_op(program: &Program, op_type: &str) -> usize {
    program
        .instructions()
        .iter()
        .filter(|instr| instr.op_type == op_type)
        .count()
}
