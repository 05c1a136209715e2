use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::info;
use ndarray::{ArrayD, LinalgScalar};
use ndarray_npy::{ReadableElement, WritableElement};
use std::error::Error;
use std::path::Path;
use subgraph_rewrite::pass::{OptimizeConfig, PassRegistry, Target};
use subgraph_rewrite::program::interpreter::{interpret, Environment};
use subgraph_rewrite::program::Program;

type CliResult<T> = std::result::Result<T, Box<dyn Error>>;

fn read_program(path: &str) -> CliResult<Program> {
    Ok(Program::from_json(&std::fs::read_to_string(path)?)?)
}

fn optimize(matches: &ArgMatches) -> CliResult<()> {
    let mut config = match matches.value_of("config") {
        Some(path) => OptimizeConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => OptimizeConfig::default(),
    };
    if let Some(passes) = matches.values_of("pass") {
        config.passes = passes.map(String::from).collect();
    }
    if let Some(fetch_ids) = matches.values_of("fetch") {
        config.fetch_ids.extend(fetch_ids.map(String::from));
    }
    if let Some(target) = matches.value_of("target") {
        config.target = target.parse::<Target>()?;
    }

    let mut program = read_program(matches.value_of("PROGRAM").unwrap())?;
    let before = program.len();
    let registry = PassRegistry::default();
    config.apply(&registry, &mut program)?;
    let dropped = program.prune_unreferenced_vars();
    info!(
        "ran {:?}: {} -> {} instructions, {} retired variable(s) dropped",
        config.passes,
        before,
        program.len(),
        dropped
    );

    std::fs::write(matches.value_of("OUTPUT").unwrap(), program.to_json()?)?;
    Ok(())
}

fn run_interpreter<DataType>(matches: &ArgMatches) -> CliResult<()>
where
    DataType: LinalgScalar + ReadableElement + WritableElement + std::fmt::Display,
{
    let program = read_program(matches.value_of("PROGRAM").unwrap())?;

    // Inputs are named after their file stems: `A.npy` binds `A`.
    let mut tensors = Vec::new();
    for path in matches.values_of("INPUTS").into_iter().flatten() {
        let name = Path::new(path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| format!("cannot derive an input name from {:?}", path))?;
        let tensor: ArrayD<DataType> = ndarray_npy::read_npy(path)?;
        tensors.push((name, tensor));
    }
    let mut env = Environment::new();
    for (name, tensor) in &tensors {
        env.insert(name.as_str(), tensor.clone());
    }

    let values = interpret(&program, &env)?;
    let output_name = matches.value_of("OUTPUT_NAME").unwrap();
    let output = values
        .get(output_name)
        .ok_or_else(|| format!("program has no variable named {:?}", output_name))?;

    match matches.value_of("out") {
        Some(path) => ndarray_npy::write_npy(path, output)?,
        None => println!("{}", output),
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let matches = App::new("subgraph-rewrite")
        .about("Pattern-based rewriting of tensor programs")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("optimize")
                .about("Runs passes over a JSON program and writes the result")
                .arg(Arg::with_name("PROGRAM").required(true).index(1))
                .arg(Arg::with_name("OUTPUT").required(true).index(2))
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .takes_value(true)
                        .help("JSON file with passes, fetch_ids and target"),
                )
                .arg(
                    Arg::with_name("pass")
                        .long("pass")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help("Pass to run; repeat to run several, in order"),
                )
                .arg(
                    Arg::with_name("fetch")
                        .long("fetch")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help("Variable that must keep its name and value"),
                )
                .arg(
                    Arg::with_name("target")
                        .long("target")
                        .takes_value(true)
                        .possible_values(&["host", "nv_gpu"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("interpret")
                .about("Evaluates a JSON program on .npy inputs")
                .arg(Arg::with_name("PROGRAM").required(true).index(1))
                .arg(Arg::with_name("OUTPUT_NAME").required(true).index(2))
                .arg(Arg::with_name("INPUTS").multiple(true).index(3))
                .arg(
                    Arg::with_name("dtype")
                        .long("dtype")
                        .takes_value(true)
                        .possible_values(&["f32", "f64"])
                        .default_value("f32"),
                )
                .arg(
                    Arg::with_name("out")
                        .long("out")
                        .takes_value(true)
                        .help("Write the result to this .npy file instead of stdout"),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("optimize", Some(sub)) => optimize(sub),
        ("interpret", Some(sub)) => match sub.value_of("dtype") {
            Some("f64") => run_interpreter::<f64>(sub),
            _ => run_interpreter::<f32>(sub),
        },
        _ => unreachable!(),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
