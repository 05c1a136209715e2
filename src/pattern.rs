//! Patterns: small template graphs whose nodes carry predicates over the
//! program nodes they may stand for.

use crate::error::*;
use crate::graph::{Digraph, InstrView, NodeId, ProgramGraph, VarView};
use crate::matcher::Match;
use snafu::{ensure, OptionExt};
use std::collections::BTreeMap;

pub type VarTeller = Box<dyn Fn(&VarView<'_>) -> bool>;
pub type InstrTeller = Box<dyn Fn(&InstrView<'_>) -> bool>;

pub struct PatternVar {
    label: Option<String>,
    external: bool,
    tellers: Vec<VarTeller>,
}

impl PatternVar {
    /// External variables may be produced or consumed by instructions
    /// outside the match. All others must be closed over by the match.
    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn tell(&self, var: &VarView<'_>) -> bool {
        self.tellers.iter().all(|teller| teller(var))
    }
}

pub struct PatternInstr {
    op_type: String,
    label: Option<String>,
    num_inputs: usize,
    num_outputs: usize,
    tellers: Vec<InstrTeller>,
}

impl PatternInstr {
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Operator kind and arity must agree before any teller is consulted.
    pub fn tell(&self, instr: &InstrView<'_>) -> bool {
        let raw = instr.instruction();
        raw.op_type == self.op_type
            && raw.inputs.len() == self.num_inputs
            && raw.outputs.len() == self.num_outputs
            && self.tellers.iter().all(|teller| teller(instr))
    }
}

pub enum PatternNode {
    Var(PatternVar),
    Instr(PatternInstr),
}

impl PatternNode {
    pub fn label(&self) -> Option<&str> {
        match self {
            PatternNode::Var(var) => var.label.as_deref(),
            PatternNode::Instr(instr) => instr.label.as_deref(),
        }
    }

    /// Whether `node` of `program` may stand in for this pattern node. A
    /// variable never stands in for an instruction or vice versa.
    pub fn tell(&self, program: &ProgramGraph<'_>, node: NodeId) -> bool {
        match self {
            PatternNode::Var(var) => program.var_view(node).map_or(false, |view| var.tell(&view)),
            PatternNode::Instr(instr) => program
                .instr_view(node)
                .map_or(false, |view| instr.tell(&view)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternVarId(pub NodeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternInstrId(pub NodeId);

/// Chained configuration of a freshly added pattern variable.
pub struct VarBuilder<'b> {
    var: &'b mut PatternVar,
    id: PatternVarId,
}

impl<'b> VarBuilder<'b> {
    pub fn assert<F>(self, teller: F) -> Self
    where
        F: Fn(&VarView<'_>) -> bool + 'static,
    {
        self.var.tellers.push(Box::new(teller));
        self
    }

    pub fn label(self, label: &str) -> Self {
        self.var.label = Some(label.to_string());
        self
    }

    pub fn external(self) -> Self {
        self.var.external = true;
        self
    }

    pub fn id(self) -> PatternVarId {
        self.id
    }
}

/// Chained configuration of a freshly added pattern instruction.
pub struct InstrBuilder<'b> {
    instr: &'b mut PatternInstr,
    id: PatternInstrId,
}

impl<'b> InstrBuilder<'b> {
    pub fn assert<F>(self, teller: F) -> Self
    where
        F: Fn(&InstrView<'_>) -> bool + 'static,
    {
        self.instr.tellers.push(Box::new(teller));
        self
    }

    pub fn label(self, label: &str) -> Self {
        self.instr.label = Some(label.to_string());
        self
    }

    pub fn id(self) -> PatternInstrId {
        self.id
    }
}

#[derive(Default)]
pub struct PatternBuilder {
    graph: Digraph<PatternNode>,
}

impl PatternBuilder {
    pub fn new() -> Self {
        PatternBuilder::default()
    }

    pub fn add_var(&mut self) -> VarBuilder<'_> {
        let id = self.graph.add_node(PatternNode::Var(PatternVar {
            label: None,
            external: false,
            tellers: Vec::new(),
        }));
        match self.graph.node_mut(id) {
            PatternNode::Var(var) => VarBuilder {
                var,
                id: PatternVarId(id),
            },
            PatternNode::Instr(_) => unreachable!(),
        }
    }

    /// Adds an instruction node with an edge from each input (operand index
    /// = position in `inputs`) and an edge to each output.
    pub fn add_instr(
        &mut self,
        op_type: &str,
        inputs: &[PatternVarId],
        outputs: &[PatternVarId],
    ) -> InstrBuilder<'_> {
        let id = self.graph.add_node(PatternNode::Instr(PatternInstr {
            op_type: op_type.to_string(),
            label: None,
            num_inputs: inputs.len(),
            num_outputs: outputs.len(),
            tellers: Vec::new(),
        }));
        for (i, input) in inputs.iter().enumerate() {
            self.graph.add_edge(input.0, id, i);
        }
        for (i, output) in outputs.iter().enumerate() {
            self.graph.add_edge(id, output.0, i);
        }
        match self.graph.node_mut(id) {
            PatternNode::Instr(instr) => InstrBuilder {
                instr,
                id: PatternInstrId(id),
            },
            PatternNode::Var(_) => unreachable!(),
        }
    }

    /// Finishes the pattern. It must have at least one edge, every node must
    /// touch an edge and labels must be unique.
    pub fn release(self) -> Result<Pattern> {
        let graph = self.graph;
        ensure!(!graph.adj().has_no_edges(), EmptyPatternSnafu);

        let mut labels = BTreeMap::new();
        for (id, node) in graph.nodes() {
            let connected = graph.adj().targets(id).next().is_some()
                || graph.adj().sources(id).next().is_some();
            ensure!(connected, DisconnectedPatternNodeSnafu { node: id.0 });
            if let Some(label) = node.label() {
                ensure!(
                    labels.insert(label.to_string(), id).is_none(),
                    DuplicateLabelSnafu { label }
                );
            }
        }

        Ok(Pattern { graph, labels })
    }
}

pub struct Pattern {
    graph: Digraph<PatternNode>,
    labels: BTreeMap<String, NodeId>,
}

impl Pattern {
    pub fn graph(&self) -> &Digraph<PatternNode> {
        &self.graph
    }

    pub fn node(&self, id: NodeId) -> &PatternNode {
        self.graph.node(id)
    }

    pub fn labelled(&self, label: &str) -> Result<NodeId> {
        self.labels
            .get(label)
            .copied()
            .context(UnknownLabelSnafu { label })
    }

    fn mapped(&self, m: &Match, label: &str) -> Result<NodeId> {
        let node = self.labelled(label)?;
        m.get(&node).copied().context(UnknownLabelSnafu { label })
    }

    /// The program variable bound to the pattern node labelled `label`.
    pub fn mapped_var<'a>(&self, m: &Match, program: &'a ProgramGraph<'_>, label: &str) -> Result<VarView<'a>> {
        let node = self.mapped(m, label)?;
        program.var_view(node).context(LabelKindSnafu {
            label,
            expected: "variable",
        })
    }

    /// The program instruction bound to the pattern node labelled `label`.
    pub fn mapped_instr<'a>(
        &self,
        m: &Match,
        program: &'a ProgramGraph<'_>,
        label: &str,
    ) -> Result<InstrView<'a>> {
        let node = self.mapped(m, label)?;
        program.instr_view(node).context(LabelKindSnafu {
            label,
            expected: "instruction",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProgramGraphBuilder;
    use crate::program::{DType, ProgramBuilder};

    fn has_2d_shape(var: &VarView<'_>) -> bool {
        var.variable().shape.len() == 2
    }

    #[test]
    fn matmul_pair_shape() {
        let mut builder = PatternBuilder::new();
        let in_0 = builder.add_var().id();
        let in_1 = builder.add_var().id();
        let in_2 = builder.add_var().id();
        let out_0 = builder.add_var().id();
        let out_1 = builder.add_var().id();
        builder.add_instr("matmul", &[in_0, in_2], &[out_0]);
        builder.add_instr("matmul", &[in_0, in_1], &[out_1]);
        let pattern = builder.release().unwrap();

        assert_eq!(pattern.graph().len(), 7);
        assert_eq!(pattern.graph().adj().num_sources(), 5);
        assert_eq!(pattern.graph().adj().edges().len(), 6);
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let mut builder = PatternBuilder::new();
        builder.add_var();
        assert!(matches!(builder.release(), Err(Error::EmptyPattern)));
    }

    #[test]
    fn disconnected_node_is_rejected() {
        let mut builder = PatternBuilder::new();
        let a = builder.add_var().id();
        let b = builder.add_var().id();
        builder.add_var();
        builder.add_instr("elementwise_add", &[a, a], &[b]);
        assert!(matches!(
            builder.release(),
            Err(Error::DisconnectedPatternNode { node: 2 })
        ));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let mut builder = PatternBuilder::new();
        let a = builder.add_var().label("x").id();
        let b = builder.add_var().label("x").id();
        builder.add_instr("elementwise_add", &[a, a], &[b]);
        match builder.release() {
            Err(Error::DuplicateLabel { label }) => assert_eq!(label, "x"),
            Err(e) => panic!("unexpected {:?}", e),
            Ok(_) => panic!("duplicate label accepted"),
        }
    }

    #[test]
    fn tell_checks_kind_arity_and_tellers() {
        let mut builder = ProgramBuilder::new();
        let a = builder.create_input(DType::Fp32, &[2, 2], "a").unwrap();
        let v = builder.create_input(DType::Fp32, &[2], "v").unwrap();
        builder.matmul(a, a, false, false).unwrap();
        builder.elementwise_add(v, v).unwrap();
        let program = builder.build().unwrap();
        let graph = ProgramGraphBuilder::new(&program).unwrap().release();

        let mut builder = PatternBuilder::new();
        let x = builder.add_var().assert(has_2d_shape).id();
        let y = builder.add_var().id();
        builder
            .add_instr("matmul", &[x, x], &[y])
            .assert(|instr| !instr.instruction().attr_or("trans_a", false));
        let pattern = builder.release().unwrap();

        let a_node = graph.var_node(a).unwrap();
        let v_node = graph.var_node(v).unwrap();
        let (x_node, instr_node) = (NodeId(0), NodeId(2));
        assert!(pattern.node(x_node).tell(&graph, a_node));
        assert!(!pattern.node(x_node).tell(&graph, v_node));
        assert!(!pattern.node(x_node).tell(&graph, graph.instr_node(0)));
        assert!(pattern.node(instr_node).tell(&graph, graph.instr_node(0)));
        assert!(!pattern.node(instr_node).tell(&graph, graph.instr_node(1)));
        assert!(!pattern.node(instr_node).tell(&graph, a_node));
    }
}
