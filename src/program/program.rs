use crate::error::*;
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    Int64 = 3,
    Uint8 = 4,
    Uint16 = 5,
    Uint32 = 6,
    Bf16 = 7,
    Fp16 = 8,
    Fp32 = 9,
    Fp64 = 10,
}

/// Index of a variable in its program's arena.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct VarId(pub usize);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Externally visible name. Fetch lists refer to variables by this name.
    pub id: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// An attribute value. Untagged, so the JSON form is the plain value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Attr {
    Bool(bool),
    Int(i64),
    Float(NotNan<f64>),
    Str(String),
    List(Vec<Attr>),
}

impl From<bool> for Attr {
    fn from(b: bool) -> Self {
        Attr::Bool(b)
    }
}

impl From<i64> for Attr {
    fn from(i: i64) -> Self {
        Attr::Int(i)
    }
}

impl From<&str> for Attr {
    fn from(s: &str) -> Self {
        Attr::Str(s.to_string())
    }
}

impl From<&[usize]> for Attr {
    fn from(list: &[usize]) -> Self {
        Attr::List(list.iter().map(|&i| Attr::Int(i as i64)).collect())
    }
}

/// Types that can be read out of an [`Attr`].
pub trait FromAttr: Sized {
    const TYPE_NAME: &'static str;
    fn from_attr(attr: &Attr) -> Option<Self>;
}

impl FromAttr for bool {
    const TYPE_NAME: &'static str = "bool";
    fn from_attr(attr: &Attr) -> Option<Self> {
        match attr {
            Attr::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromAttr for i64 {
    const TYPE_NAME: &'static str = "int";
    fn from_attr(attr: &Attr) -> Option<Self> {
        match attr {
            Attr::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromAttr for f64 {
    const TYPE_NAME: &'static str = "float";
    fn from_attr(attr: &Attr) -> Option<Self> {
        match attr {
            Attr::Float(f) => Some(f.into_inner()),
            _ => None,
        }
    }
}

impl FromAttr for String {
    const TYPE_NAME: &'static str = "string";
    fn from_attr(attr: &Attr) -> Option<Self> {
        match attr {
            Attr::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromAttr for Vec<i64> {
    const TYPE_NAME: &'static str = "int list";
    fn from_attr(attr: &Attr) -> Option<Self> {
        match attr {
            Attr::List(list) => list.iter().map(i64::from_attr).collect(),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op_type: String,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Attr>,
}

impl Instruction {
    pub fn new(op_type: &str, inputs: Vec<VarId>, outputs: Vec<VarId>) -> Self {
        Instruction {
            op_type: op_type.to_string(),
            inputs,
            outputs,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr<A: Into<Attr>>(mut self, key: &str, value: A) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// Reads a required attribute. A missing or mistyped attribute means the
    /// instruction is malformed.
    pub fn attr<T: FromAttr>(&self, key: &str) -> Result<T> {
        let attr = self.attrs.get(key).context(MissingAttrSnafu {
            op_type: &self.op_type,
            key,
        })?;
        T::from_attr(attr).context(AttrTypeSnafu {
            op_type: &self.op_type,
            key,
            expected: T::TYPE_NAME,
        })
    }

    pub fn attr_or<T: FromAttr>(&self, key: &str, default: T) -> T {
        self.attrs
            .get(key)
            .and_then(T::from_attr)
            .unwrap_or(default)
    }

    /// Position of `var` in the input list. If the variable is used more
    /// than once, the last position wins.
    pub fn input_index(&self, var: VarId) -> Option<usize> {
        self.inputs.iter().rposition(|&input| input == var)
    }
}

/// An ordered instruction list together with the arena owning every
/// variable the instructions refer to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    vars: Vec<Variable>,
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(vars: Vec<Variable>, instructions: Vec<Instruction>) -> Result<Self> {
        let program = Program { vars, instructions };
        program.validate()?;
        Ok(program)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let program: Program = serde_json::from_str(json).context(JsonSnafu)?;
        program.validate()?;
        Ok(program)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context(JsonSnafu)
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.0]
    }

    pub fn vars(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars.iter().enumerate().map(|(i, var)| (VarId(i), var))
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.vars.iter().position(|var| var.id == name).map(VarId)
    }

    /// Index of the instruction defining `var`, if any.
    pub fn producer(&self, var: VarId) -> Option<usize> {
        self.instructions
            .iter()
            .position(|instr| instr.outputs.contains(&var))
    }

    /// Variables that are read by some instruction but defined by none.
    pub fn inputs(&self) -> Vec<VarId> {
        let defined: BTreeSet<VarId> = self
            .instructions
            .iter()
            .flat_map(|instr| instr.outputs.iter().copied())
            .collect();
        let mut inputs = Vec::new();
        for instr in &self.instructions {
            for &var in &instr.inputs {
                if !defined.contains(&var) && !inputs.contains(&var) {
                    inputs.push(var);
                }
            }
        }
        inputs
    }

    pub fn add_var(&mut self, var: Variable) -> VarId {
        self.vars.push(var);
        VarId(self.vars.len() - 1)
    }

    /// Returns `<prefix>_<n>` for the smallest `n` not yet taken.
    pub fn fresh_name(&self, prefix: &str) -> String {
        let taken: BTreeSet<&str> = self.vars.iter().map(|var| var.id.as_str()).collect();
        (0..)
            .map(|n| format!("{}_{}", prefix, n))
            .find(|name| !taken.contains(name.as_str()))
            .unwrap_or_default()
    }

    pub fn rename_var(&mut self, id: VarId, name: &str) -> Result<()> {
        ensure!(
            self.find_var(name).map_or(true, |existing| existing == id),
            DuplicateNameSnafu { name }
        );
        self.vars[id.0].id = name.to_string();
        Ok(())
    }

    /// Drops variables that no instruction reads or writes, renumbering the
    /// rest in arena order. Returns how many were dropped.
    ///
    /// Passes never call this, so `VarId`s held across a rewrite stay valid;
    /// retired results linger until the caller prunes.
    pub fn prune_unreferenced_vars(&mut self) -> usize {
        let used: BTreeSet<VarId> = self
            .instructions
            .iter()
            .flat_map(|instr| instr.inputs.iter().chain(instr.outputs.iter()).copied())
            .collect();
        let before = self.vars.len();
        let mut renumbered: HashMap<VarId, VarId> = HashMap::new();
        for (i, var) in std::mem::take(&mut self.vars).into_iter().enumerate() {
            if used.contains(&VarId(i)) {
                renumbered.insert(VarId(i), VarId(self.vars.len()));
                self.vars.push(var);
            }
        }
        for instr in self.instructions.iter_mut() {
            for var in instr.inputs.iter_mut().chain(instr.outputs.iter_mut()) {
                if let Some(&new) = renumbered.get(&*var) {
                    *var = new;
                }
            }
        }
        before - self.vars.len()
    }

    pub(crate) fn push_instruction(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    /// Installs a whole new instruction list. The old list is dropped in the
    /// same step, so no half-rewritten program is ever observable.
    pub fn replace_instructions(&mut self, instructions: Vec<Instruction>) {
        self.instructions = instructions;
    }

    /// Checks that the program is well formed: operands are inside the arena,
    /// every variable has at most one producer, every read happens after the
    /// definition (or reads a program input), and names are unique.
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for var in &self.vars {
            ensure!(
                names.insert(var.id.as_str()),
                DuplicateNameSnafu { name: &var.id }
            );
        }

        let mut defined_by: HashMap<VarId, usize> = HashMap::new();
        for (i, instr) in self.instructions.iter().enumerate() {
            for &var in instr.inputs.iter().chain(instr.outputs.iter()) {
                ensure!(
                    var.0 < self.vars.len(),
                    UnknownVariableSnafu {
                        instr: i,
                        op_type: &instr.op_type,
                        index: var.0,
                    }
                );
            }
            for &var in &instr.outputs {
                if let Some(&first) = defined_by.get(&var) {
                    return DuplicateDefinitionSnafu {
                        var: &self.var(var).id,
                        first,
                        second: i,
                    }
                    .fail();
                }
                defined_by.insert(var, i);
            }
        }

        for (i, instr) in self.instructions.iter().enumerate() {
            for &var in &instr.inputs {
                if let Some(&definition) = defined_by.get(&var) {
                    ensure!(
                        definition < i,
                        UseBeforeDefinitionSnafu {
                            instr: i,
                            op_type: &instr.op_type,
                            var: &self.var(var).id,
                        }
                    );
                }
            }
        }

        Ok(())
    }
}

/// Reorders `instructions` so that every use follows its definition.
///
/// Among the instructions whose operands are available, the one that came
/// first in the input list is always emitted next, so a list that is already
/// in dataflow order comes back unchanged and instructions only move when a
/// dependency forces them to.
pub fn stable_topological_sort(instructions: Vec<Instruction>) -> Result<Vec<Instruction>> {
    let mut producer: HashMap<VarId, usize> = HashMap::new();
    for (i, instr) in instructions.iter().enumerate() {
        for &out in &instr.outputs {
            producer.insert(out, i);
        }
    }

    let mut remaining: Vec<usize> = Vec::with_capacity(instructions.len());
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); instructions.len()];
    for (i, instr) in instructions.iter().enumerate() {
        let deps: BTreeSet<usize> = instr
            .inputs
            .iter()
            .filter_map(|var| producer.get(var).copied())
            .collect();
        for &dep in &deps {
            dependents[dep].push(i);
        }
        remaining.push(deps.len());
    }

    let mut ready: BTreeSet<usize> = (0..instructions.len())
        .filter(|&i| remaining[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(instructions.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    ensure!(order.len() == instructions.len(), CyclicProgramSnafu);

    let mut slots: Vec<Option<Instruction>> = instructions.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}
