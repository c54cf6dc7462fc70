//! Partitioning the optimized graph into CTE groups.
//!
//! Seeds are collected up front and processed in execution order.
//! Multi-dependent source/join/projection/sort/limit nodes and window
//! expression nodes are strong seeds: they always anchor their own
//! group. A filter whose single parent is a projection is a weak seed —
//! absorption may pull it into its projection's group instead, which is
//! that rule's purpose (the filter lands in the same CTE as the
//! projection it reads).

use std::collections::{HashMap, HashSet};

use crate::error::CompileResult;
use crate::graph::{ComputeGraph, ComputeNode, NodeId, NodeKind};
use crate::query::{Aggregation, Expression, TimeRange};

/// One CTE: member nodes plus references to earlier groups.
#[derive(Debug, Clone)]
pub struct CteGroup {
    pub members: Vec<NodeId>,
    pub refs: Vec<usize>,
}

/// The full partition: groups in emission order, ungrouped nodes in the
/// main scope.
#[derive(Debug, Clone)]
pub struct CtePlan {
    pub groups: Vec<CteGroup>,
    pub main: Vec<NodeId>,
}

impl CtePlan {
    /// Groups no other group references; the main SELECT reads these.
    pub fn top_level(&self) -> Vec<usize> {
        let referenced: HashSet<usize> =
            self.groups.iter().flat_map(|g| g.refs.iter().copied()).collect();
        (0..self.groups.len())
            .filter(|i| !referenced.contains(i))
            .collect()
    }

    pub fn group_of(&self, id: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.members.iter().any(|m| m == id))
    }
}

/// Partition the graph.
pub fn plan(graph: &ComputeGraph) -> CompileResult<CtePlan> {
    let topo = graph.execution_order()?;

    let mut dependent_count: HashMap<&str, usize> = HashMap::new();
    for node in graph.nodes() {
        for input in &node.inputs {
            *dependent_count.entry(input.as_str()).or_insert(0) += 1;
        }
    }

    let distinct_ranges = count_distinct_ranges(graph);

    let mut strong: HashSet<NodeId> = HashSet::new();
    let mut weak: HashSet<NodeId> = HashSet::new();
    for node in graph.nodes() {
        let deps = dependent_count.get(node.id.as_str()).copied().unwrap_or(0);
        if is_strong_seed(node, deps, distinct_ranges) {
            strong.insert(node.id.clone());
        } else if is_weak_seed(graph, node) {
            weak.insert(node.id.clone());
        }
    }

    let mut grouped: HashMap<NodeId, usize> = HashMap::new();
    let mut groups: Vec<CteGroup> = Vec::new();

    for id in &topo {
        if grouped.contains_key(id) {
            continue;
        }
        if strong.contains(id) || weak.contains(id) {
            build_group(graph, id, &strong, &mut grouped, &mut groups);
        }
    }

    let main: Vec<NodeId> = graph
        .node_ids()
        .into_iter()
        .filter(|id| !grouped.contains_key(id))
        .collect();

    Ok(CtePlan { groups, main })
}

fn count_distinct_ranges(graph: &ComputeGraph) -> usize {
    let mut ranges: Vec<TimeRange> = Vec::new();
    for node in graph.nodes() {
        if let Some(agg) = node.windowed_aggregate() {
            if let Some(range) = &agg.time_range {
                if !ranges.contains(range) {
                    ranges.push(range.clone());
                }
            }
        }
    }
    ranges.len()
}

fn is_strong_seed(node: &ComputeNode, dependents: usize, distinct_ranges: usize) -> bool {
    match &node.kind {
        NodeKind::Source { .. }
        | NodeKind::Join { .. }
        | NodeKind::Projection { .. }
        | NodeKind::Sort { .. }
        | NodeKind::Limit { .. } => dependents > 1,
        NodeKind::Expression { expression, .. } => {
            if node.meta.parameter {
                return false;
            }
            match expression {
                Expression::Math(_) if node.inputs.len() >= 2 => true,
                Expression::Aggregate(agg) => {
                    node.inputs.len() >= 2
                        || matches!(agg.time_range, Some(TimeRange::Relative { .. }))
                        || (agg.time_range.is_some() && distinct_ranges >= 2)
                }
                _ => false,
            }
        }
        _ => false,
    }
}

fn is_weak_seed(graph: &ComputeGraph, node: &ComputeNode) -> bool {
    matches!(node.kind, NodeKind::Filter { .. })
        && node.inputs.len() == 1
        && graph
            .get(&node.inputs[0])
            .map(|n| n.is_projection())
            .unwrap_or(false)
}

fn build_group(
    graph: &ComputeGraph,
    seed: &str,
    strong: &HashSet<NodeId>,
    grouped: &mut HashMap<NodeId, usize>,
    groups: &mut Vec<CteGroup>,
) {
    let index = groups.len();
    let mut members: Vec<NodeId> = Vec::new();
    let mut refs: Vec<usize> = Vec::new();

    members.push(seed.to_string());
    grouped.insert(seed.to_string(), index);

    // Inputs, transitively; anything already grouped becomes a reference.
    let mut stack: Vec<NodeId> = graph
        .get(seed)
        .map(|n| n.inputs.clone())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if let Some(&g) = grouped.get(&id) {
            if g != index && !refs.contains(&g) {
                refs.push(g);
            }
            continue;
        }
        if strong.contains(&id) {
            continue;
        }
        grouped.insert(id.clone(), index);
        members.push(id.clone());
        if let Some(node) = graph.get(&id) {
            stack.extend(node.inputs.iter().cloned());
        }
    }

    // Downstream absorption to a fixpoint: plain dataflow nodes whose
    // inputs all sit in the group, filters over the group's projections
    // or its `last` windows, and composites whose children are members.
    loop {
        let mut changed = false;
        for id in graph.node_ids() {
            if grouped.contains_key(&id) || strong.contains(&id) {
                continue;
            }
            let Some(node) = graph.get(&id) else {
                continue;
            };
            if node.inputs.is_empty() {
                continue;
            }
            let all_in_group = node
                .inputs
                .iter()
                .all(|i| grouped.get(i) == Some(&index));

            let absorb = match &node.kind {
                NodeKind::Sort { .. } => false,
                NodeKind::Filter { .. } => {
                    let over_projections = all_in_group
                        && node.inputs.iter().all(|i| {
                            graph.get(i).map(|n| n.is_projection()).unwrap_or(false)
                        })
                        && graph.find_dependents(&id).iter().all(|d| {
                            !graph
                                .get(d)
                                .map(|n| is_aggregate_expression(n))
                                .unwrap_or(false)
                        });
                    let over_last_windows = all_in_group
                        && node
                            .inputs
                            .iter()
                            .all(|i| graph.get(i).map(is_last_window).unwrap_or(false));
                    over_projections || over_last_windows
                }
                NodeKind::CompositeFilter { .. } => all_in_group,
                _ => all_in_group && !node.is_metric_only_expression(),
            };

            if absorb {
                grouped.insert(id.clone(), index);
                members.push(id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Keep member order aligned with graph insertion order.
    let order = graph.node_ids();
    members.sort_by_key(|m| order.iter().position(|o| o == m).unwrap_or(usize::MAX));
    refs.sort_unstable();

    groups.push(CteGroup { members, refs });
}

fn is_aggregate_expression(node: &ComputeNode) -> bool {
    matches!(
        node.kind,
        NodeKind::Expression {
            expression: Expression::Aggregate(_),
            ..
        }
    )
}

fn is_last_window(node: &ComputeNode) -> bool {
    match &node.kind {
        NodeKind::Expression {
            expression: Expression::Aggregate(agg),
            ..
        } => agg.aggregation == Aggregation::Last,
        _ => false,
    }
}
