//! Subgraph search: finds non-overlapping occurrences of a [`Pattern`] in a
//! [`ProgramGraph`].
//!
//! Search runs in three phases:
//!
//! 1. every pattern node is tested against every program node, giving each
//!    pattern node a list of candidates;
//! 2. the pattern's edges are walked in `(source, dest)` order, and a set of
//!    partial matches ("hit groups") is extended one edge at a time using only
//!    candidate pairs that are joined by an edge in the program;
//! 3. complete matches are filtered (non-external pattern variables must not
//!    be touched by anything outside the match) and accepted first-fit, so
//!    that no program node ends up in two accepted matches.
//!
//! First-fit means the number of accepted matches can fall short of the
//! largest possible set of disjoint occurrences. Which overlapping occurrence
//! wins is an artifact of node order.

use crate::graph::{NodeId, ProgramGraph};
use crate::pattern::{Pattern, PatternNode};
use itertools::{iproduct, Itertools};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

/// Pattern node to program node, ordered by pattern node.
pub type Match = BTreeMap<NodeId, NodeId>;

#[derive(Debug, Clone, Default)]
struct HitGroup {
    roles: BTreeMap<NodeId, NodeId>,
    nodes: BTreeSet<NodeId>,
}

impl HitGroup {
    /// `pattern_node` may be bound to `program_node` if it is already bound
    /// to exactly that node, or if both are still free.
    fn can_bind(&self, program_node: NodeId, pattern_node: NodeId) -> bool {
        match self.roles.get(&pattern_node) {
            Some(&bound) => bound == program_node,
            None => !self.nodes.contains(&program_node),
        }
    }

    fn register(&mut self, program_node: NodeId, pattern_node: NodeId) {
        self.roles.insert(pattern_node, program_node);
        self.nodes.insert(program_node);
    }
}

pub struct PatternMatcher<'a> {
    pattern: &'a Pattern,
    program: &'a ProgramGraph<'a>,
    candidates: BTreeMap<NodeId, Vec<NodeId>>,
    pattern_edges: BTreeSet<(NodeId, NodeId)>,
}

impl<'a> PatternMatcher<'a> {
    pub fn new(pattern: &'a Pattern, program: &'a ProgramGraph<'a>) -> Self {
        let mut matcher = PatternMatcher {
            pattern,
            program,
            candidates: BTreeMap::new(),
            pattern_edges: pattern.graph().adj().edges(),
        };
        matcher.node_match();
        trace!(
            "program edges: {}",
            program
                .graph()
                .adj()
                .edges()
                .iter()
                .map(|(s, d)| format!("{}->{}", s.0, d.0))
                .join(" ")
        );
        trace!(
            "pattern edges: {}",
            matcher
                .pattern_edges
                .iter()
                .map(|(s, d)| format!("{}->{}", s.0, d.0))
                .join(" ")
        );
        matcher
    }

    /// The only place tellers run: each (pattern node, program node) pair
    /// is tested once.
    fn node_match(&mut self) {
        let (pattern, program) = (self.pattern, self.program);
        for (pattern_id, pattern_node) in pattern.graph().nodes() {
            let found: Vec<NodeId> = program
                .graph()
                .nodes()
                .map(|(program_id, _)| program_id)
                .filter(|&program_id| pattern_node.tell(program, program_id))
                .collect();
            debug!(
                "pattern node {} ({}) has {} candidate(s)",
                pattern_id.0,
                pattern_node.label().unwrap_or("unlabelled"),
                found.len()
            );
            self.candidates.insert(pattern_id, found);
        }
    }

    /// Program nodes accepted by every teller on `pattern_node`, in id order.
    pub fn candidates(&self, pattern_node: NodeId) -> &[NodeId] {
        self.candidates
            .get(&pattern_node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Complete, edge-consistent, injective bindings, in generation order.
    fn extend(&self) -> Vec<HitGroup> {
        let first = match self.pattern_edges.iter().next() {
            Some(&(source, _)) => source,
            None => return Vec::new(),
        };

        let mut groups: Vec<HitGroup> = self
            .candidates(first)
            .iter()
            .map(|&node| {
                let mut group = HitGroup::default();
                group.register(node, first);
                group
            })
            .collect();

        let adj = self.program.graph().adj();
        for &(pattern_source, pattern_dest) in &self.pattern_edges {
            let mut next = Vec::new();
            for (&source, &dest) in iproduct!(self.candidates(pattern_source), self.candidates(pattern_dest)) {
                if !adj.has_edge(source, dest) {
                    continue;
                }
                for group in &groups {
                    if group.can_bind(source, pattern_source) && group.can_bind(dest, pattern_dest) {
                        let mut extended = group.clone();
                        extended.register(source, pattern_source);
                        extended.register(dest, pattern_dest);
                        next.push(extended);
                    }
                }
            }
            trace!(
                "edge {}->{}: {} partial match(es)",
                pattern_source.0,
                pattern_dest.0,
                next.len()
            );
            groups = next;
            if groups.is_empty() {
                break;
            }
        }
        groups
    }

    /// Every variable bound to a non-external pattern variable must have all
    /// of its producers and consumers inside the group.
    fn is_closed(&self, group: &HitGroup) -> bool {
        let adj = self.program.graph().adj();
        group
            .roles
            .iter()
            .all(|(&pattern_node, &program_node)| match self.pattern.node(pattern_node) {
                PatternNode::Var(var) if !var.is_external() => adj
                    .targets(program_node)
                    .chain(adj.sources(program_node))
                    .all(|t| group.nodes.contains(&t.end)),
                _ => true,
            })
    }

    /// Runs the search. Repeated calls on the same pattern and program give
    /// the same matches in the same order.
    pub fn detect_patterns(&self) -> Vec<Match> {
        let mut claimed: BTreeSet<NodeId> = BTreeSet::new();
        let mut matches = Vec::new();
        for group in self.extend() {
            if !self.is_closed(&group) {
                trace!("dropping match that leaks internal variables: {:?}", group.roles);
                continue;
            }
            if group.nodes.iter().any(|node| claimed.contains(node)) {
                trace!("dropping overlapping match: {:?}", group.roles);
                continue;
            }
            claimed.extend(group.nodes.iter().copied());
            debug!(
                "matched (pattern -> program): {}",
                group
                    .roles
                    .iter()
                    .map(|(p, n)| format!("{}->{}", p.0, n.0))
                    .join(", ")
            );
            matches.push(group.roles);
        }
        debug!("{} match(es) accepted", matches.len());
        matches
    }
}
