//! Semantics-preserving graph rewrites.
//!
//! `optimize` runs the pass sequence exactly once. Individual passes may
//! iterate internally, but the result is a fixed point: running the
//! optimizer again leaves the graph unchanged.

use std::collections::HashSet;

use crate::config::Config;
use crate::error::CompileResult;
use crate::graph::{ComputeGraph, FilterOperand, NodeId, NodeKind, ProjectionColumn, SortKey};
use crate::lowering::add_required_columns;
use crate::query::{BoolOp, Expression};

/// Apply all rewrite passes. `risky` enables the join-structure
/// simplifications, which are safe only under the conditions they check.
pub fn optimize(graph: &mut ComputeGraph, config: &Config, risky: bool) -> CompileResult<()> {
    remove_duplicate_projections(graph);
    inline_parameters(graph);
    merge_filters(graph);
    remove_useless_composites(graph);
    remove_duplicate_projection_expressions(graph);
    if risky {
        prune_cross_table_join(graph, config);
        remove_duplicate_filters(graph);
    }
    // Re-run so prior removals cannot leave a windowed aggregate without
    // its time column.
    add_required_columns(graph, config);
    Ok(())
}

// ============================================================================
// Pass 1: duplicate projections
// ============================================================================

/// Two projections are duplicates iff they share the same sorted input
/// set, the same sorted column fingerprints, and their dependents have
/// equal input sets once the candidate is substituted by the keeper.
/// Non-required projections first; required merge only with required.
fn remove_duplicate_projections(graph: &mut ComputeGraph) {
    for required in [false, true] {
        let ids: Vec<NodeId> = graph
            .nodes()
            .filter(|n| n.is_projection() && n.meta.required_projection == required)
            .map(|n| n.id.clone())
            .collect();

        for i in 0..ids.len() {
            if !graph.contains(&ids[i]) {
                continue;
            }
            for j in (i + 1)..ids.len() {
                if !graph.contains(&ids[j]) {
                    continue;
                }
                if projections_are_duplicates(graph, &ids[i], &ids[j]) {
                    graph.replace_node_id(&ids[j], &ids[i], None);
                    graph.remove_node(&ids[j]);
                }
            }
        }
    }
}

fn projections_are_duplicates(graph: &ComputeGraph, keep: &str, candidate: &str) -> bool {
    let (Some(a), Some(b)) = (graph.get(keep), graph.get(candidate)) else {
        return false;
    };

    let mut inputs_a = a.inputs.clone();
    let mut inputs_b = b.inputs.clone();
    inputs_a.sort();
    inputs_b.sort();
    if inputs_a != inputs_b {
        return false;
    }

    let mut fp_a: Vec<String> = a.projection_columns().iter().map(|c| c.fingerprint()).collect();
    let mut fp_b: Vec<String> = b.projection_columns().iter().map(|c| c.fingerprint()).collect();
    fp_a.sort();
    fp_b.sort();
    if fp_a != fp_b {
        return false;
    }

    let normalize = |id: &NodeId| -> Vec<NodeId> {
        graph
            .get(id)
            .map(|n| {
                let mut inputs: Vec<NodeId> = n
                    .inputs
                    .iter()
                    .map(|i| {
                        if i == candidate {
                            keep.to_string()
                        } else {
                            i.clone()
                        }
                    })
                    .collect();
                inputs.sort();
                inputs.dedup();
                inputs
            })
            .unwrap_or_default()
    };

    let mut deps_a: Vec<Vec<NodeId>> = graph.find_dependents(keep).iter().map(&normalize).collect();
    let mut deps_b: Vec<Vec<NodeId>> =
        graph.find_dependents(candidate).iter().map(&normalize).collect();
    deps_a.sort();
    deps_b.sort();
    deps_a == deps_b
}

// ============================================================================
// Pass 2: inline parameters
// ============================================================================

/// Fold every parameter expression node into its dependents. Both
/// condition sides are treated symmetrically: a side becomes a
/// `Parameter` operand iff its own input names the parameter node.
fn inline_parameters(graph: &mut ComputeGraph) {
    let param_ids: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.meta.parameter)
        .map(|n| n.id.clone())
        .collect();

    for param_id in param_ids {
        let Some(Expression::Sql(token)) = graph.get(&param_id).and_then(|n| n.expression())
        else {
            continue;
        };
        let token = token.clone();

        for dep_id in graph.find_dependents(&param_id) {
            let Some(dep) = graph.get_mut(&dep_id) else {
                continue;
            };
            match &mut dep.kind {
                NodeKind::Filter { condition } => {
                    for side in [&mut condition.left, &mut condition.right] {
                        if side.input_id().map(|i| i == &param_id).unwrap_or(false) {
                            *side = FilterOperand::Parameter(token.clone());
                        }
                    }
                }
                NodeKind::Sort { criteria } => {
                    for criterion in criteria {
                        if criterion.key == SortKey::Node(param_id.clone()) {
                            criterion.key = SortKey::Literal(token.clone());
                        }
                    }
                }
                _ => {}
            }
            dep.inputs.retain(|i| i != &param_id);
            dep.meta.has_parameter = true;
        }
        graph.remove_node(&param_id);
    }
}

// ============================================================================
// Pass 3: merge filters
// ============================================================================

/// Filters over an identical sorted input-id list collapse under a fresh
/// `and` composite; dependents are rewired onto the composite.
fn merge_filters(graph: &mut ComputeGraph) {
    let filter_ids: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.is_filter_like())
        .map(|n| n.id.clone())
        .collect();

    let mut handled: HashSet<NodeId> = HashSet::new();
    for id in &filter_ids {
        if handled.contains(id) || !graph.contains(id) {
            continue;
        }
        let key = sorted_inputs(graph, id);
        if key.is_empty() {
            continue;
        }

        let group: Vec<NodeId> = filter_ids
            .iter()
            .filter(|f| !handled.contains(*f) && graph.contains(f) && sorted_inputs(graph, f) == key)
            .cloned()
            .collect();
        if group.len() <= 1 {
            continue;
        }

        let composite = graph.add_node(
            NodeKind::CompositeFilter {
                operator: BoolOp::And,
            },
            group.clone(),
            Default::default(),
        );
        for member in &group {
            handled.insert(member.clone());
            graph.replace_node_id(member, &composite, None);
        }
    }
}

fn sorted_inputs(graph: &ComputeGraph, id: &str) -> Vec<NodeId> {
    let mut inputs = graph.get(id).map(|n| n.inputs.clone()).unwrap_or_default();
    inputs.sort();
    inputs
}

// ============================================================================
// Pass 4: useless composites
// ============================================================================

/// A degenerate `and`/`or` over a single child is spliced out. `not` is
/// semantic and survives.
fn remove_useless_composites(graph: &mut ComputeGraph) {
    loop {
        let degenerate = graph.nodes().find_map(|n| match &n.kind {
            NodeKind::CompositeFilter { operator }
                if *operator != BoolOp::Not && n.inputs.len() == 1 =>
            {
                Some((n.id.clone(), n.inputs[0].clone()))
            }
            _ => None,
        });
        let Some((id, child)) = degenerate else {
            break;
        };
        graph.replace_node_id(&id, &child, None);
        graph.remove_node(&id);
    }
}

// ============================================================================
// Pass 5: duplicate projection expressions
// ============================================================================

/// An expression node over a single projection, consumed exactly once,
/// folds into an earlier structurally equal expression; its projection
/// goes too when nothing else reads it.
fn remove_duplicate_projection_expressions(graph: &mut ComputeGraph) {
    let expr_ids: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.is_expression() && !n.meta.parameter)
        .map(|n| n.id.clone())
        .collect();

    for (index, dup_id) in expr_ids.iter().enumerate() {
        if !graph.contains(dup_id) {
            continue;
        }
        let (projection_id, expression) = {
            let Some(node) = graph.get(dup_id) else {
                continue;
            };
            if node.inputs.len() != 1 {
                continue;
            }
            let input = node.inputs[0].clone();
            if !graph.get(&input).map(|n| n.is_projection()).unwrap_or(false) {
                continue;
            }
            let Some(expression) = node.expression().cloned() else {
                continue;
            };
            (input, expression)
        };
        if graph.find_dependents(dup_id).len() != 1 {
            continue;
        }

        let keeper = expr_ids[..index].iter().find(|k| {
            graph
                .get(k)
                .and_then(|n| n.expression())
                .map(|e| e.structurally_equal(&expression))
                .unwrap_or(false)
        });
        let Some(keeper) = keeper.cloned() else {
            continue;
        };

        graph.replace_node_id(dup_id, &keeper, None);
        graph.remove_node(dup_id);
        if graph.find_dependents(&projection_id).is_empty()
            && !graph
                .get(&projection_id)
                .map(|n| n.meta.required_projection)
                .unwrap_or(false)
        {
            graph.remove_node(&projection_id);
        }
    }
}

// ============================================================================
// Pass 6: risky simplifications
// ============================================================================

/// With exactly two sources, when one table is only ever consulted for
/// the join key itself, the key can be read off the other table and the
/// join dropped entirely.
fn prune_cross_table_join(graph: &mut ComputeGraph, config: &Config) {
    let sources = graph.source_nodes();
    if sources.len() != 2 {
        return;
    }
    let Some(join_id) = graph.nodes().find(|n| n.is_join()).map(|n| n.id.clone()) else {
        return;
    };
    let shared_pk = match graph.get(&join_id).map(|n| &n.kind) {
        Some(NodeKind::Join { conditions, .. }) if !conditions.is_empty() => {
            conditions[0].left_column.clone()
        }
        _ => return,
    };

    for candidate in &sources {
        let Some(other) = sources.iter().find(|s| *s != candidate) else {
            continue;
        };
        let candidate_table = source_table(graph, candidate);
        let (Some(candidate_table), Some(_)) = (candidate_table, source_table(graph, other))
        else {
            continue;
        };

        // Projections owned by the candidate table: every column resolves
        // to it through the metric mappings.
        let owned: Vec<NodeId> = graph
            .nodes()
            .filter(|n| {
                n.is_projection()
                    && !n.meta.required_projection
                    && !n.projection_columns().is_empty()
                    && n.projection_columns().iter().all(|c| {
                        column_owned_by(config, c, &candidate_table)
                    })
            })
            .map(|n| n.id.clone())
            .collect();
        if owned.is_empty() {
            continue;
        }

        let key_only = owned.iter().all(|id| {
            graph
                .get(id)
                .map(|n| {
                    n.projection_columns()
                        .iter()
                        .all(|c| c.name.as_deref() == Some(shared_pk.as_str()))
                })
                .unwrap_or(false)
        });
        if !key_only {
            continue;
        }

        let filters_key_only = graph.nodes().all(|n| {
            if !n.is_filter_like() || !n.inputs.iter().any(|i| owned.contains(i)) {
                return true;
            }
            match &n.kind {
                NodeKind::Filter { condition } => {
                    [&condition.left, &condition.right].iter().all(|side| match side {
                        FilterOperand::Node { input, metric } if owned.contains(input) => metric
                            .as_deref()
                            .map(|m| {
                                config
                                    .resolve_metric(m)
                                    .map(|mapping| mapping.column == shared_pk)
                                    .unwrap_or(m == shared_pk)
                            })
                            .unwrap_or(false),
                        _ => true,
                    })
                }
                _ => true,
            }
        });
        if !filters_key_only {
            continue;
        }

        // Rebuild: key projection on the surviving table, filters rewired,
        // candidate source and join gone.
        let replacement = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column(&shared_pk, other.clone())],
            },
            vec![other.clone()],
            Default::default(),
        );
        for id in &owned {
            graph.replace_node_id(id, &replacement, None);
            graph.remove_node(id);
        }
        graph.replace_node_id(&join_id, other, None);
        graph.remove_node(&join_id);
        graph.remove_node(candidate);
        return;
    }
}

fn source_table(graph: &ComputeGraph, id: &str) -> Option<String> {
    match graph.get(id).map(|n| &n.kind) {
        Some(NodeKind::Source { table, .. }) => Some(table.clone()),
        _ => None,
    }
}

fn column_owned_by(config: &Config, column: &ProjectionColumn, table: &str) -> bool {
    let Some(name) = column.name.as_deref() else {
        return false;
    };
    config
        .column_mappings
        .values()
        .any(|m| m.table == table && m.column == name)
}

/// Risky duplicate-filter collapse: filters reading only projections,
/// with identical input lists, metadata, and condition, fold together.
fn remove_duplicate_filters(graph: &mut ComputeGraph) {
    let ids: Vec<NodeId> = graph
        .nodes()
        .filter(|n| {
            matches!(n.kind, NodeKind::Filter { .. })
                && !n.inputs.is_empty()
                && n.inputs.iter().all(|i| {
                    graph.get(i).map(|p| p.is_projection()).unwrap_or(false)
                })
        })
        .map(|n| n.id.clone())
        .collect();

    for i in 0..ids.len() {
        if !graph.contains(&ids[i]) {
            continue;
        }
        for j in (i + 1)..ids.len() {
            if !graph.contains(&ids[j]) {
                continue;
            }
            let (Some(a), Some(b)) = (graph.get(&ids[i]), graph.get(&ids[j])) else {
                continue;
            };
            if a.inputs == b.inputs && a.meta == b.meta && a.kind == b.kind {
                graph.replace_node_id(&ids[j], &ids[i], None);
                graph.remove_node(&ids[j]);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
