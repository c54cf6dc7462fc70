//! The compute graph: an id-keyed, insertion-ordered DAG of typed nodes.
//!
//! Ids are `<type>_<counter>` with per-type counters that are never
//! reused, so tests can pin against textual ids. All iteration follows
//! insertion order; that determinism is what keeps optimizer output and
//! emitted SQL stable across runs.

pub mod node;

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};

pub use node::{
    ComputeNode, FilterCondition, FilterOperand, JoinCondition, JoinType, NodeId, NodeKind,
    NodeMeta, ProjectionColumn, SortCriterion, SortKey,
};

/// Owns all nodes of one compile call.
#[derive(Debug, Clone, Default)]
pub struct ComputeGraph {
    order: Vec<NodeId>,
    nodes: HashMap<NodeId, ComputeNode>,
    counters: HashMap<&'static str, u64>,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ComputeNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ComputeNode> {
        self.nodes.get_mut(id)
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ComputeNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Source nodes in insertion order.
    pub fn source_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.is_source())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Add a node; assigns `<type>_<counter>` and updates terminal flags.
    pub fn add_node(&mut self, kind: NodeKind, inputs: Vec<NodeId>, meta: NodeMeta) -> NodeId {
        let type_name = kind.type_name();
        let counter = self.counters.entry(type_name).or_insert(0);
        *counter += 1;
        let id = format!("{}_{}", type_name, counter);

        for input in &inputs {
            if let Some(node) = self.nodes.get_mut(input) {
                node.is_terminal = false;
            }
        }

        self.nodes.insert(
            id.clone(),
            ComputeNode {
                id: id.clone(),
                inputs,
                is_terminal: true,
                meta,
                kind,
            },
        );
        self.order.push(id.clone());
        id
    }

    /// Remove a node; former inputs become terminal again iff nothing
    /// else references them.
    pub fn remove_node(&mut self, id: &str) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        self.order.retain(|n| n != id);

        for input in node.inputs {
            let referenced = self.nodes.values().any(|n| n.inputs.contains(&input));
            if let Some(former) = self.nodes.get_mut(&input) {
                former.is_terminal = !referenced;
            }
        }
    }

    /// Nodes that list `id` among their inputs, in insertion order.
    pub fn find_dependents(&self, id: &str) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.inputs.iter().any(|i| i == id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Rewrite every reference to `old` into `new`: `inputs`, filter
    /// condition sides, sort criteria, and projection `source_node`
    /// fields. A rewritten filter side that carried a metric keeps it,
    /// unless `alias` supplies a replacement.
    pub fn replace_node_id(&mut self, old: &str, new: &str, alias: Option<&str>) {
        let ids = self.order.clone();
        for id in &ids {
            if id == new {
                continue;
            }
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };

            if node.inputs.iter().any(|i| i == old) {
                let mut rewritten: Vec<NodeId> = Vec::with_capacity(node.inputs.len());
                for input in &node.inputs {
                    let target = if input == old { new.to_string() } else { input.clone() };
                    if !rewritten.contains(&target) {
                        rewritten.push(target);
                    }
                }
                node.inputs = rewritten;
            }

            match &mut node.kind {
                NodeKind::Filter { condition } => {
                    for side in [&mut condition.left, &mut condition.right] {
                        if let FilterOperand::Node { input, metric } = side {
                            if input == old {
                                *input = new.to_string();
                                if let Some(alias) = alias {
                                    *metric = Some(alias.to_string());
                                }
                            }
                        }
                    }
                }
                NodeKind::Sort { criteria } => {
                    for criterion in criteria {
                        if let SortKey::Node(input) = &mut criterion.key {
                            if input == old {
                                *input = new.to_string();
                            }
                        }
                    }
                }
                NodeKind::Projection { columns } => {
                    for column in columns {
                        if column.source_node.as_deref() == Some(old) {
                            column.source_node = Some(new.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        let has_dependents = !self.find_dependents(new).is_empty();
        if let Some(node) = self.nodes.get_mut(new) {
            node.is_terminal = !has_dependents;
        }
    }

    /// Depth-first post-order topological sort: sources first (insertion
    /// order), then a sweep over the remaining nodes. Every node appears
    /// after all of its inputs.
    pub fn execution_order(&self) -> CompileResult<Vec<NodeId>> {
        // 1 = on the active path, 2 = done.
        let mut states: HashMap<NodeId, u8> = HashMap::new();
        let mut out: Vec<NodeId> = Vec::with_capacity(self.order.len());

        let mut roots = self.source_nodes();
        roots.extend(self.order.iter().cloned());

        for root in roots {
            self.visit(&root, &mut states, &mut out)?;
        }
        Ok(out)
    }

    fn visit(
        &self,
        id: &str,
        states: &mut HashMap<NodeId, u8>,
        out: &mut Vec<NodeId>,
    ) -> CompileResult<()> {
        match states.get(id) {
            Some(2) => return Ok(()),
            Some(1) => return Err(CompileError::CycleDetected(id.to_string())),
            _ => {}
        }
        states.insert(id.to_string(), 1);

        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        for input in &node.inputs {
            if !self.nodes.contains_key(input) {
                return Err(CompileError::DanglingReference {
                    node: id.to_string(),
                    input: input.clone(),
                });
            }
            self.visit(input, states, out)?;
        }

        states.insert(id.to_string(), 2);
        out.push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CompareOp, SortDirection};

    fn source(graph: &mut ComputeGraph, table: &str) -> NodeId {
        graph.add_node(
            NodeKind::Source {
                table: table.to_string(),
                time_column: None,
            },
            vec![],
            NodeMeta::default(),
        )
    }

    #[test]
    fn test_counter_based_ids() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        let s2 = source(&mut graph, "daily_agg");
        let p1 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("sector", s1.clone())],
            },
            vec![s1.clone()],
            NodeMeta::default(),
        );

        assert_eq!(s1, "source_1");
        assert_eq!(s2, "source_2");
        assert_eq!(p1, "projection_1");
    }

    #[test]
    fn test_counters_never_reused_after_remove() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        graph.remove_node(&s1);
        let s2 = source(&mut graph, "tickers");
        assert_eq!(s2, "source_2");
    }

    #[test]
    fn test_terminal_flags() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        assert!(graph.get(&s1).unwrap().is_terminal);

        let p1 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("sector", s1.clone())],
            },
            vec![s1.clone()],
            NodeMeta::default(),
        );
        assert!(!graph.get(&s1).unwrap().is_terminal);
        assert!(graph.get(&p1).unwrap().is_terminal);

        graph.remove_node(&p1);
        assert!(graph.get(&s1).unwrap().is_terminal);
    }

    #[test]
    fn test_execution_order_inputs_first() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        let p1 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("sector", s1.clone())],
            },
            vec![s1.clone()],
            NodeMeta::default(),
        );
        let f1 = graph.add_node(
            NodeKind::Filter {
                condition: FilterCondition {
                    left: FilterOperand::node(p1.clone(), Some("sector".to_string())),
                    op: CompareOp::Eq,
                    right: FilterOperand::Parameter("{param_1: String}".to_string()),
                },
            },
            vec![p1.clone()],
            NodeMeta::default(),
        );

        let order = graph.execution_order().unwrap();
        assert_eq!(order.len(), graph.len());
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos(&s1) < pos(&p1));
        assert!(pos(&p1) < pos(&f1));
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        let p1 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("sector", s1.clone())],
            },
            vec![s1.clone()],
            NodeMeta::default(),
        );
        // Introduce a cycle by mutating inputs directly.
        graph.get_mut(&s1).unwrap().inputs = vec![p1.clone()];

        let err = graph.execution_order().unwrap_err();
        assert!(matches!(err, CompileError::CycleDetected(_)));
    }

    #[test]
    fn test_dangling_reference() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        graph.get_mut(&s1).unwrap().inputs = vec!["projection_9".to_string()];

        let err = graph.execution_order().unwrap_err();
        assert_eq!(
            err,
            CompileError::DanglingReference {
                node: s1,
                input: "projection_9".to_string(),
            }
        );
    }

    #[test]
    fn test_replace_node_id_rewrites_all_references() {
        let mut graph = ComputeGraph::new();
        let s1 = source(&mut graph, "tickers");
        let s2 = source(&mut graph, "daily_agg");
        let p1 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("close", s2.clone())],
            },
            vec![s2.clone()],
            NodeMeta::default(),
        );
        let f1 = graph.add_node(
            NodeKind::Filter {
                condition: FilterCondition {
                    left: FilterOperand::node(p1.clone(), Some("close".to_string())),
                    op: CompareOp::Gt,
                    right: FilterOperand::Parameter("100".to_string()),
                },
            },
            vec![p1.clone()],
            NodeMeta::default(),
        );
        let sort = graph.add_node(
            NodeKind::Sort {
                criteria: vec![SortCriterion {
                    key: SortKey::Node(p1.clone()),
                    direction: SortDirection::Desc,
                }],
            },
            vec![p1.clone()],
            NodeMeta::default(),
        );

        let p2 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("close", s1.clone())],
            },
            vec![s1.clone()],
            NodeMeta::default(),
        );
        graph.replace_node_id(&p1, &p2, Some("close_px"));

        assert_eq!(graph.get(&f1).unwrap().inputs, vec![p2.clone()]);
        match &graph.get(&f1).unwrap().kind {
            NodeKind::Filter { condition } => match &condition.left {
                FilterOperand::Node { input, metric } => {
                    assert_eq!(input, &p2);
                    assert_eq!(metric.as_deref(), Some("close_px"));
                }
                other => panic!("unexpected operand {:?}", other),
            },
            other => panic!("unexpected kind {:?}", other),
        }
        match &graph.get(&sort).unwrap().kind {
            NodeKind::Sort { criteria } => {
                assert_eq!(criteria[0].key, SortKey::Node(p2.clone()));
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(!graph.get(&p2).unwrap().is_terminal);
    }
}
