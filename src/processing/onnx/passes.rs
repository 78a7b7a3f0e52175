//! Graph rewrites over the main ONNX graph.
//!
//! Each pass returns the number of nodes or initializers it changed. Names
//! used inside subgraphs (If/Loop/Scan bodies) count as uses of the outer
//! value, and a node producing a graph output is never removed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use serde::{Deserialize, Serialize};

use super::proto::{attribute_type, AttributeProto, GraphProto, NodeProto};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnnxPass {
    EliminateNopDropout,
    EliminateIdentity,
    FuseConsecutiveTransposes,
    EliminateNopTranspose,
    EliminateDeadend,
    EliminateUnusedInitializer,
}

impl OnnxPass {
    /// Default pipeline order
    pub const ALL: [OnnxPass; 6] = [
        Self::EliminateNopDropout,
        Self::EliminateIdentity,
        Self::FuseConsecutiveTransposes,
        Self::EliminateNopTranspose,
        Self::EliminateDeadend,
        Self::EliminateUnusedInitializer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::EliminateNopDropout => "eliminate_nop_dropout",
            Self::EliminateIdentity => "eliminate_identity",
            Self::FuseConsecutiveTransposes => "fuse_consecutive_transposes",
            Self::EliminateNopTranspose => "eliminate_nop_transpose",
            Self::EliminateDeadend => "eliminate_deadend",
            Self::EliminateUnusedInitializer => "eliminate_unused_initializer",
        }
    }

    pub fn run(&self, graph: &mut GraphProto) -> usize {
        match self {
            Self::EliminateNopDropout => eliminate_nop_dropout(graph),
            Self::EliminateIdentity => eliminate_identity(graph),
            Self::FuseConsecutiveTransposes => fuse_consecutive_transposes(graph),
            Self::EliminateNopTranspose => eliminate_nop_transpose(graph),
            Self::EliminateDeadend => eliminate_deadend(graph),
            Self::EliminateUnusedInitializer => eliminate_unused_initializer(graph),
        }
    }
}

impl fmt::Display for OnnxPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_default_domain(node: &NodeProto) -> bool {
    node.domain.is_empty() || node.domain == "ai.onnx"
}

fn is_op(node: &NodeProto, op_type: &str) -> bool {
    node.op_type == op_type && is_default_domain(node)
}

fn attribute<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn subgraphs(node: &NodeProto) -> impl Iterator<Item = &GraphProto> {
    node.attribute
        .iter()
        .flat_map(|a| a.g.iter().chain(a.graphs.iter()))
}

fn subgraphs_mut(node: &mut NodeProto) -> impl Iterator<Item = &mut GraphProto> {
    node.attribute
        .iter_mut()
        .flat_map(|a| a.g.iter_mut().chain(a.graphs.iter_mut()))
}

/// Adds every input name read by the graph's nodes, recursing into subgraphs.
fn collect_reads(graph: &GraphProto, uses: &mut HashMap<String, usize>) {
    for node in &graph.node {
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            *uses.entry(input.clone()).or_default() += 1;
        }
        for sub in subgraphs(node) {
            collect_reads(sub, uses);
            for output in &sub.output {
                *uses.entry(output.name.clone()).or_default() += 1;
            }
        }
    }
}

/// Use count per value name; graph outputs count as a use.
fn use_counts(graph: &GraphProto) -> HashMap<String, usize> {
    let mut uses = HashMap::new();
    collect_reads(graph, &mut uses);
    for output in &graph.output {
        *uses.entry(output.name.clone()).or_default() += 1;
    }
    uses
}

fn graph_outputs(graph: &GraphProto) -> HashSet<String> {
    graph.output.iter().map(|o| o.name.clone()).collect()
}

/// Replaces every read of `from` with `to`, recursing into subgraphs.
fn rename_reads(nodes: &mut [NodeProto], from: &str, to: &str) {
    for node in nodes {
        for input in node.input.iter_mut().filter(|i| *i == from) {
            *input = to.to_string();
        }
        for sub in subgraphs_mut(node) {
            rename_reads(&mut sub.node, from, to);
            for output in sub.output.iter_mut().filter(|o| o.name == from) {
                output.name = to.to_string();
            }
        }
    }
}

/// Removes nodes that forward `input[0]` to `output[0]` unchanged.
fn remove_passthrough<F>(graph: &mut GraphProto, mut is_passthrough: F) -> usize
where
    F: FnMut(&NodeProto, &HashMap<String, usize>) -> bool,
{
    let outputs = graph_outputs(graph);
    let uses = use_counts(graph);
    let mut removed = vec![false; graph.node.len()];

    for i in 0..graph.node.len() {
        let node = &graph.node[i];
        if !is_passthrough(node, &uses) {
            continue;
        }
        let (Some(src), Some(dst)) = (node.input.first(), node.output.first()) else {
            continue;
        };
        if src.is_empty() || dst.is_empty() || outputs.contains(dst) {
            continue;
        }
        let (src, dst) = (src.clone(), dst.clone());
        rename_reads(&mut graph.node, &dst, &src);
        removed[i] = true;
    }

    let count = removed.iter().filter(|r| **r).count();
    let mut flags = removed.into_iter();
    graph.node.retain(|_| !flags.next().unwrap_or(false));
    count
}

pub fn eliminate_identity(graph: &mut GraphProto) -> usize {
    remove_passthrough(graph, |node, _| is_op(node, "Identity"))
}

/// Dropout is a pass-through at inference when no training flag is wired in
/// and the mask output is not read.
pub fn eliminate_nop_dropout(graph: &mut GraphProto) -> usize {
    remove_passthrough(graph, |node, uses| {
        if !is_op(node, "Dropout") {
            return false;
        }
        let training_input = node.input.get(2).is_some_and(|t| !t.is_empty());
        let mask_read = node
            .output
            .get(1)
            .is_some_and(|m| !m.is_empty() && uses.get(m).copied().unwrap_or(0) > 0);
        !training_input && !mask_read
    })
}

fn perm(node: &NodeProto) -> Option<&[i64]> {
    attribute(node, "perm")
        .filter(|a| a.r#type == attribute_type::INTS || a.r#type == 0)
        .map(|a| a.ints.as_slice())
        .filter(|p| !p.is_empty())
}

fn is_identity_perm(perm: &[i64]) -> bool {
    perm.iter().enumerate().all(|(i, p)| *p == i as i64)
}

pub fn eliminate_nop_transpose(graph: &mut GraphProto) -> usize {
    remove_passthrough(graph, |node, _| {
        is_op(node, "Transpose") && perm(node).is_some_and(is_identity_perm)
    })
}

/// `Transpose(Transpose(x, p1), p2)` == `Transpose(x, p)` with `p[i] = p1[p2[i]]`.
pub fn compose_perms(first: &[i64], second: &[i64]) -> Option<Vec<i64>> {
    if first.len() != second.len() {
        return None;
    }
    second
        .iter()
        .map(|&axis| usize::try_from(axis).ok().and_then(|a| first.get(a).copied()))
        .collect()
}

fn fuse_one_transpose_pair(graph: &mut GraphProto) -> bool {
    let outputs = graph_outputs(graph);
    let uses = use_counts(graph);
    let producers: HashMap<&str, usize> = graph
        .node
        .iter()
        .enumerate()
        .flat_map(|(i, n)| n.output.iter().map(move |o| (o.as_str(), i)))
        .collect();

    let mut pair = None;
    for (second_idx, second) in graph.node.iter().enumerate() {
        if !is_op(second, "Transpose") {
            continue;
        }
        let Some(mid) = second.input.first() else { continue };
        let Some(&first_idx) = producers.get(mid.as_str()) else { continue };
        let first = &graph.node[first_idx];
        if !is_op(first, "Transpose") || outputs.contains(mid) || uses.get(mid) != Some(&1) {
            continue;
        }
        let (Some(p1), Some(p2)) = (perm(first), perm(second)) else { continue };
        if let Some(fused) = compose_perms(p1, p2) {
            pair = Some((first_idx, second_idx, fused));
            break;
        }
    }

    let Some((first_idx, second_idx, fused)) = pair else {
        return false;
    };

    let source = graph.node[first_idx].input.first().cloned().unwrap_or_default();
    let second = &mut graph.node[second_idx];
    second.input[0] = source;
    if let Some(attr) = second.attribute.iter_mut().find(|a| a.name == "perm") {
        attr.ints = fused;
        attr.r#type = attribute_type::INTS;
    }
    graph.node.remove(first_idx);
    true
}

pub fn fuse_consecutive_transposes(graph: &mut GraphProto) -> usize {
    let mut fused = 0;
    while fuse_one_transpose_pair(graph) {
        fused += 1;
    }
    fused
}

/// Removes nodes none of whose outputs are read, until nothing changes.
pub fn eliminate_deadend(graph: &mut GraphProto) -> usize {
    let mut total = 0;
    loop {
        let uses = use_counts(graph);
        let before = graph.node.len();
        graph.node.retain(|node| {
            node.output.is_empty()
                || node
                    .output
                    .iter()
                    .any(|o| !o.is_empty() && uses.contains_key(o))
        });
        let removed = before - graph.node.len();
        if removed == 0 {
            return total;
        }
        total += removed;
    }
}

/// Drops initializers nothing reads, and their graph input declarations.
pub fn eliminate_unused_initializer(graph: &mut GraphProto) -> usize {
    let uses = use_counts(graph);
    let unused: HashSet<String> = graph
        .initializer
        .iter()
        .filter(|t| !uses.contains_key(&t.name))
        .map(|t| t.name.clone())
        .collect();
    if unused.is_empty() {
        return 0;
    }

    graph.initializer.retain(|t| !unused.contains(&t.name));
    graph.input.retain(|i| !unused.contains(&i.name));
    unused.len()
}
