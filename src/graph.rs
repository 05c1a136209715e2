//! Directed graphs over variables and instructions.
//!
//! The same [`Digraph`] type holds both the pattern being searched for and
//! the program being searched. Nodes live in an arena and are named by their
//! insertion index, so every container keyed by [`NodeId`] iterates in
//! insertion order.

use crate::error::*;
use crate::program::{Instruction, Program, VarId, Variable};
use snafu::ensure;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// One end of an edge, together with the operand position the edge stands
/// for. Ordered by node first, then operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub end: NodeId,
    pub operand: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    out: BTreeMap<NodeId, BTreeSet<Target>>,
    rev: BTreeMap<NodeId, BTreeSet<Target>>,
}

impl Adjacency {
    /// Registering the same `(source, dest, operand)` twice has no effect.
    pub fn add(&mut self, source: NodeId, dest: NodeId, operand: usize) {
        self.out.entry(source).or_default().insert(Target { end: dest, operand });
        self.rev.entry(dest).or_default().insert(Target { end: source, operand });
    }

    /// Number of nodes with at least one outgoing edge.
    pub fn num_sources(&self) -> usize {
        self.out.len()
    }

    /// True when no edge has been added.
    pub fn has_no_edges(&self) -> bool {
        self.out.is_empty()
    }

    pub fn has_edge(&self, source: NodeId, dest: NodeId) -> bool {
        self.out.get(&source).map_or(false, |targets| {
            targets
                .range(Target { end: dest, operand: 0 }..=Target { end: dest, operand: usize::MAX })
                .next()
                .is_some()
        })
    }

    /// All `(source, dest)` pairs, ordered by source then dest. Parallel
    /// edges with different operand positions collapse into one pair.
    pub fn edges(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.out
            .iter()
            .flat_map(|(&source, targets)| targets.iter().map(move |t| (source, t.end)))
            .collect()
    }

    /// Outgoing edges of `node`.
    pub fn targets(&self, node: NodeId) -> impl Iterator<Item = &Target> + '_ {
        self.out.get(&node).into_iter().flatten()
    }

    /// Incoming edges of `node`; `end` is the edge's source.
    pub fn sources(&self, node: NodeId) -> impl Iterator<Item = &Target> + '_ {
        self.rev.get(&node).into_iter().flatten()
    }
}

pub struct Digraph<N> {
    nodes: Vec<N>,
    adj: Adjacency,
}

impl<N> Digraph<N> {
    pub fn new() -> Self {
        Digraph {
            nodes: Vec::new(),
            adj: Adjacency::default(),
        }
    }

    pub fn add_node(&mut self, node: N) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn add_edge(&mut self, source: NodeId, dest: NodeId, operand: usize) {
        self.adj.add(source, dest, operand);
    }

    pub fn node(&self, id: NodeId) -> &N {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut N {
        &mut self.nodes[id.0]
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &N)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn adj(&self) -> &Adjacency {
        &self.adj
    }
}

impl<N> Default for Digraph<N> {
    fn default() -> Self {
        Digraph::new()
    }
}

/// Reachability queries along edge direction.
pub struct DepthFirstSearch<'g, N> {
    graph: &'g Digraph<N>,
}

impl<'g, N> DepthFirstSearch<'g, N> {
    pub fn new(graph: &'g Digraph<N>) -> Self {
        DepthFirstSearch { graph }
    }

    /// Whether a path (possibly empty) leads from `from` to `to`.
    pub fn accessible(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.extend(
                self.graph
                    .adj()
                    .targets(node)
                    .map(|t| t.end)
                    .filter(|end| !visited.contains(end)),
            );
        }
        false
    }
}

/// What a program graph node stands for: a variable in the program's arena
/// or an instruction by its position in the instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramNode {
    Var(VarId),
    Instr(usize),
}

/// A program's dataflow graph. Borrows the program it was built from, so the
/// graph can never outlive the snapshot it describes.
pub struct ProgramGraph<'p> {
    program: &'p Program,
    graph: Digraph<ProgramNode>,
    var_nodes: HashMap<VarId, NodeId>,
    instr_nodes: Vec<NodeId>,
}

impl<'p> ProgramGraph<'p> {
    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn graph(&self) -> &Digraph<ProgramNode> {
        &self.graph
    }

    pub fn var_node(&self, var: VarId) -> Option<NodeId> {
        self.var_nodes.get(&var).copied()
    }

    pub fn instr_node(&self, index: usize) -> NodeId {
        self.instr_nodes[index]
    }

    pub fn var_view(&self, node: NodeId) -> Option<VarView<'_>> {
        match *self.graph.node(node) {
            ProgramNode::Var(var) => Some(VarView {
                graph: self,
                node,
                var,
            }),
            ProgramNode::Instr(_) => None,
        }
    }

    pub fn instr_view(&self, node: NodeId) -> Option<InstrView<'_>> {
        match *self.graph.node(node) {
            ProgramNode::Instr(index) => Some(InstrView {
                graph: self,
                node,
                index,
            }),
            ProgramNode::Var(_) => None,
        }
    }

    pub fn accessible(&self, from: NodeId, to: NodeId) -> bool {
        DepthFirstSearch::new(&self.graph).accessible(from, to)
    }
}

/// A variable node as seen by pattern predicates.
#[derive(Clone, Copy)]
pub struct VarView<'a> {
    graph: &'a ProgramGraph<'a>,
    node: NodeId,
    var: VarId,
}

impl<'a> VarView<'a> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> VarId {
        self.var
    }

    pub fn variable(&self) -> &'a Variable {
        self.graph.program.var(self.var)
    }

    /// Instructions reading this variable.
    pub fn consumers(&self) -> impl Iterator<Item = InstrView<'a>> + 'a {
        let graph = self.graph;
        graph
            .graph
            .adj()
            .targets(self.node)
            .filter_map(move |t| graph.instr_view(t.end))
    }

    /// Instructions writing this variable. A valid program has at most one.
    pub fn producers(&self) -> impl Iterator<Item = InstrView<'a>> + 'a {
        let graph = self.graph;
        graph
            .graph
            .adj()
            .sources(self.node)
            .filter_map(move |t| graph.instr_view(t.end))
    }
}

/// An instruction node as seen by pattern predicates.
#[derive(Clone, Copy)]
pub struct InstrView<'a> {
    graph: &'a ProgramGraph<'a>,
    node: NodeId,
    index: usize,
}

impl<'a> InstrView<'a> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Position in the program's instruction list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn instruction(&self) -> &'a Instruction {
        &self.graph.program.instructions()[self.index]
    }

    pub fn op_type(&self) -> &'a str {
        &self.instruction().op_type
    }
}

pub struct ProgramGraphBuilder<'p> {
    graph: ProgramGraph<'p>,
}

impl<'p> ProgramGraphBuilder<'p> {
    /// Interns every instruction of `program`, in list order, together with
    /// the variables it touches. Variables are interned on first sight.
    pub fn new(program: &'p Program) -> Result<Self> {
        program.validate()?;
        let mut builder = ProgramGraphBuilder {
            graph: ProgramGraph {
                program,
                graph: Digraph::new(),
                var_nodes: HashMap::new(),
                instr_nodes: Vec::with_capacity(program.len()),
            },
        };
        for index in 0..program.len() {
            builder.add_instr(index)?;
        }
        Ok(builder)
    }

    fn add_instr(&mut self, index: usize) -> Result<()> {
        let node = self.graph.graph.add_node(ProgramNode::Instr(index));
        self.graph.instr_nodes.push(node);

        let program = self.graph.program;
        let instr = &program.instructions()[index];
        for (i, &var) in instr.inputs.iter().enumerate() {
            let var_node = self.var_node_or_add(var)?;
            self.graph.graph.add_edge(var_node, node, i);
        }
        for (i, &var) in instr.outputs.iter().enumerate() {
            let var_node = self.var_node_or_add(var)?;
            self.graph.graph.add_edge(node, var_node, i);
        }
        Ok(())
    }

    fn var_node_or_add(&mut self, var: VarId) -> Result<NodeId> {
        match self.graph.var_node(var) {
            Some(node) => Ok(node),
            None => self.add_var(var),
        }
    }

    /// Adds a node for `var`. Each variable gets exactly one node.
    pub fn add_var(&mut self, var: VarId) -> Result<NodeId> {
        ensure!(
            !self.graph.var_nodes.contains_key(&var),
            RepeatedVariableSnafu {
                var: &self.graph.program.var(var).id,
            }
        );
        let node = self.graph.graph.add_node(ProgramNode::Var(var));
        self.graph.var_nodes.insert(var, node);
        Ok(node)
    }

    pub fn release(self) -> ProgramGraph<'p> {
        self.graph
    }
}
