//! Program passes and the registry that runs them by name.

use crate::error::*;
use crate::program::Program;
use log::info;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

pub mod dot_merger;

pub use dot_merger::DotMergerPass;

/// The device a program is being optimized for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Host,
    NvGpu,
}

impl Default for Target {
    fn default() -> Self {
        Target::Host
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "host" => Ok(Target::Host),
            "nv_gpu" | "nvgpu" => Ok(Target::NvGpu),
            _ => Err(format!("unknown target {:?}", s)),
        }
    }
}

/// Lifecycle of one pass instance on one program snapshot.
///
/// `Unstarted -> Matched -> Rewritten`, or `Unstarted -> NoOp` when nothing
/// matched. There is no way back; run a fresh instance to go again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Unstarted,
    Matched,
    Rewritten,
    NoOp,
}

pub trait ProgramPass {
    fn name(&self) -> &str;

    /// Rewrites `program` in place. Variables named in `fetch_ids` must still
    /// hold equivalent values afterwards.
    fn apply_impl(&mut self, program: &mut Program, fetch_ids: &BTreeSet<String>, target: Target) -> Result<()>;
}

pub type PassFactory = fn() -> Box<dyn ProgramPass>;

/// Maps pass names to constructors. Built once at start-up and only read
/// afterwards.
pub struct PassRegistry {
    factories: BTreeMap<String, PassFactory>,
}

impl PassRegistry {
    /// A registry with no passes in it.
    pub fn new() -> Self {
        PassRegistry {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: PassFactory) -> &mut Self {
        self.factories.insert(name.to_string(), factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn ProgramPass>> {
        let factory = self.factories.get(name).context(UnknownPassSnafu { name })?;
        Ok(factory())
    }

    /// Runs the named passes in order, each one a fresh instance. Every name
    /// is looked up before anything runs, so an unknown name leaves the
    /// program untouched.
    pub fn apply_passes<S: AsRef<str>>(
        &self,
        program: &mut Program,
        names: &[S],
        fetch_ids: &BTreeSet<String>,
        target: Target,
    ) -> Result<()> {
        let mut passes = names
            .iter()
            .map(|name| self.create(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        for pass in passes.iter_mut() {
            let before = program.len();
            pass.apply_impl(program, fetch_ids, target)?;
            info!(
                "{}: {} -> {} instructions",
                pass.name(),
                before,
                program.len()
            );
        }
        Ok(())
    }
}

impl Default for PassRegistry {
    fn default() -> Self {
        let mut registry = PassRegistry::new();
        registry.register(dot_merger::NAME, || {
            Box::new(DotMergerPass::new()) as Box<dyn ProgramPass>
        });
        registry
    }
}

/// Which passes to run, which variables must stay observable, and for
/// which device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct OptimizeConfig {
    pub passes: Vec<String>,
    pub fetch_ids: BTreeSet<String>,
    pub target: Target,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        OptimizeConfig {
            passes: vec![dot_merger::NAME.to_string()],
            fetch_ids: BTreeSet::new(),
            target: Target::default(),
        }
    }
}

impl OptimizeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context(JsonSnafu)
    }

    pub fn apply(&self, registry: &PassRegistry, program: &mut Program) -> Result<()> {
        registry.apply_passes(program, self.passes.as_slice(), &self.fetch_ids, self.target)
    }
}
