//! Mermaid rendering of the compute graph.
//!
//! The first line is the fixed `graph TD;` header; every following line
//! is sorted so output is stable across runs. Sources render under their
//! table name (`daily_agg`, `daily_agg_2`, ...); every other node keeps
//! its graph id. Shapes per kind: cylinder for sources, rhombus for
//! filters, circle for composite filters, subroutine for projections,
//! rounded for expressions, rectangle for sort and join, stadium for
//! limit.

use std::collections::HashMap;

use crate::graph::{ComputeGraph, ComputeNode, FilterOperand, NodeId, NodeKind};
use crate::query::Expression;

/// Render the graph as Mermaid text.
pub fn render(graph: &ComputeGraph) -> String {
    let mut render_ids: HashMap<NodeId, String> = HashMap::new();
    let mut table_counts: HashMap<String, usize> = HashMap::new();
    for node in graph.nodes() {
        let render_id = match &node.kind {
            NodeKind::Source { table, .. } => {
                let count = table_counts.entry(table.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    table.clone()
                } else {
                    format!("{}_{}", table, count)
                }
            }
            _ => node.id.clone(),
        };
        render_ids.insert(node.id.clone(), render_id);
    }

    let mut lines: Vec<String> = Vec::new();
    for node in graph.nodes() {
        let render_id = &render_ids[&node.id];
        lines.push(node_line(graph, node, render_id));
        for input in &node.inputs {
            if let Some(input_render) = render_ids.get(input) {
                lines.push(format!("{} --> {}", input_render, render_id));
            }
        }
    }
    lines.sort();

    let mut out = String::from("graph TD;\n");
    out.push_str(&lines.join("\n"));
    out
}

fn node_line(graph: &ComputeGraph, node: &ComputeNode, render_id: &str) -> String {
    let label = escape(&node_label(graph, node));
    match &node.kind {
        NodeKind::Source { .. } => format!("{}[(\"{}\")]", render_id, label),
        NodeKind::Filter { .. } => format!("{}{{\"{}\"}}", render_id, label),
        NodeKind::CompositeFilter { .. } => format!("{}((\"{}\"))", render_id, label),
        NodeKind::Projection { .. } => format!("{}[[\"{}\"]]", render_id, label),
        NodeKind::Expression { .. } => format!("{}(\"{}\")", render_id, label),
        NodeKind::Sort { .. } => format!("{}[\"{}\"]", render_id, label),
        NodeKind::Limit { .. } => format!("{}([\"{}\"])", render_id, label),
        NodeKind::Join { .. } => format!("{}[\"{}\"]", render_id, label),
    }
}

fn node_label(graph: &ComputeGraph, node: &ComputeNode) -> String {
    match &node.kind {
        NodeKind::Source { table, .. } => table.clone(),
        NodeKind::Filter { condition } => format!(
            "{} {} {}",
            operand_label(graph, &condition.left),
            condition.op.sql(),
            operand_label(graph, &condition.right)
        ),
        NodeKind::CompositeFilter { operator } => operator.sql().to_string(),
        NodeKind::Projection { columns } => {
            let names: Vec<&str> = columns
                .iter()
                .filter_map(|c| c.output_name())
                .collect();
            let prefix = if node.meta.grouping { "GROUP BY" } else { "Project" };
            format!("{}\\n{}", prefix, names.join(", "))
        }
        NodeKind::Expression { expression, alias } => match alias {
            Some(alias) => alias.clone(),
            None => expression_label(expression),
        },
        NodeKind::Sort { criteria } => {
            let parts: Vec<String> = criteria
                .iter()
                .map(|c| {
                    let key = match &c.key {
                        crate::graph::SortKey::Literal(text) => text.clone(),
                        crate::graph::SortKey::Node(id) => reference_label(graph, id),
                    };
                    format!("{} {}", key, c.direction.as_str())
                })
                .collect();
            match &node.meta.group_dimension {
                Some(dimension) => format!("Sort\\n{} BY {}", parts.join(", "), dimension),
                None => format!("Sort\\n{}", parts.join(", ")),
            }
        }
        NodeKind::Limit { limit } => match &node.meta.group_dimension {
            Some(dimension) if node.meta.grouped => format!("Limit {} BY {}", limit, dimension),
            _ => format!("Limit {}", limit),
        },
        NodeKind::Join { conditions, .. } => match conditions.first() {
            Some(c) => format!(
                "Join {} with {} on {} = {}",
                c.left_table, c.right_table, c.left_column, c.right_column
            ),
            None => "Join".to_string(),
        },
    }
}

fn operand_label(graph: &ComputeGraph, operand: &FilterOperand) -> String {
    match operand {
        FilterOperand::Parameter(token) => token.clone(),
        FilterOperand::Literal(expr) => expression_label(expr),
        FilterOperand::Node { input, metric } => match metric {
            Some(metric) => metric.clone(),
            None => reference_label(graph, input),
        },
    }
}

fn reference_label(graph: &ComputeGraph, id: &str) -> String {
    let Some(node) = graph.get(id) else {
        return id.to_string();
    };
    match &node.kind {
        NodeKind::Expression { expression, alias } => alias
            .clone()
            .unwrap_or_else(|| expression_label(expression)),
        NodeKind::Projection { columns } => columns
            .first()
            .and_then(|c| c.output_name())
            .unwrap_or(id)
            .to_string(),
        _ => id.to_string(),
    }
}

fn expression_label(expression: &Expression) -> String {
    match expression {
        Expression::Sql(token) => token.clone(),
        Expression::Metric(m) => m.metric.clone(),
        Expression::Aggregate(a) => a
            .alias
            .clone()
            .unwrap_or_else(|| a.aggregation.name().to_string()),
        Expression::Math(m) => m
            .alias
            .clone()
            .unwrap_or_else(|| format!("math {}", m.operator.infix_sql().unwrap_or("fn"))),
        Expression::Constant(_) => "const".to_string(),
    }
}

fn escape(label: &str) -> String {
    label.replace('"', "'")
}
