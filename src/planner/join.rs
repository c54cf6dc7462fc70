//! Join inference.
//!
//! When a query references more than one table, a single multi-way
//! INNER join is introduced over all source nodes, keyed by a primary
//! key shared between each pair of tables. Downstream references to the
//! individual sources are rewired onto the join node.

use crate::config::Config;
use crate::error::{CompileError, CompileResult};
use crate::graph::{ComputeGraph, JoinCondition, JoinType, NodeKind, NodeMeta};

/// Introduce the join node if two or more sources exist; no-op otherwise.
pub fn infer_join(graph: &mut ComputeGraph, config: &Config) -> CompileResult<()> {
    let sources = graph.source_nodes();
    if sources.len() <= 1 {
        return Ok(());
    }

    let tables: Vec<(String, String)> = sources
        .iter()
        .filter_map(|id| match graph.get(id).map(|n| &n.kind) {
            Some(NodeKind::Source { table, .. }) => Some((id.clone(), table.clone())),
            _ => None,
        })
        .collect();

    let mut conditions = Vec::new();
    for i in 0..tables.len() {
        for j in (i + 1)..tables.len() {
            let (_, left_table) = &tables[i];
            let (_, right_table) = &tables[j];
            let pk = config
                .shared_primary_key(left_table, right_table)
                .ok_or_else(|| {
                    CompileError::NoCommonPrimaryKey(left_table.clone(), right_table.clone())
                })?;
            conditions.push(JoinCondition {
                left_table: left_table.clone(),
                left_column: pk.clone(),
                right_table: right_table.clone(),
                right_column: pk,
            });
        }
    }

    let join_id = graph.add_node(
        NodeKind::Join {
            join_type: JoinType::Inner,
            conditions,
        },
        sources.clone(),
        NodeMeta::default(),
    );

    for source_id in &sources {
        graph.replace_node_id(source_id, &join_id, None);
        if let Some(source) = graph.get_mut(source_id) {
            source.is_terminal = false;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::graph::{ComputeGraph, NodeMeta, ProjectionColumn};

    #[test]
    fn test_two_sources_get_one_join() {
        let config = Config::market_data();
        let mut graph = ComputeGraph::new();
        let s1 = graph.add_node(
            NodeKind::Source {
                table: "tickers".to_string(),
                time_column: None,
            },
            vec![],
            NodeMeta::default(),
        );
        let s2 = graph.add_node(
            NodeKind::Source {
                table: "daily_agg".to_string(),
                time_column: Some("date".to_string()),
            },
            vec![],
            NodeMeta::default(),
        );
        let p1 = graph.add_node(
            NodeKind::Projection {
                columns: vec![ProjectionColumn::column("sector", s1.clone())],
            },
            vec![s1.clone()],
            NodeMeta::default(),
        );

        infer_join(&mut graph, &config).unwrap();

        let join = graph.nodes().find(|n| n.is_join()).unwrap();
        assert_eq!(join.inputs, vec![s1.clone(), s2.clone()]);
        match &join.kind {
            NodeKind::Join { conditions, .. } => {
                assert_eq!(conditions.len(), 1);
                assert_eq!(conditions[0].left_column, "ticker");
            }
            other => panic!("unexpected kind {:?}", other),
        }

        // The projection now consumes the join.
        let join_id = join.id.clone();
        let projection = graph.get(&p1).unwrap();
        assert_eq!(projection.inputs, vec![join_id.clone()]);
        assert_eq!(
            projection.projection_columns()[0].source_node.as_deref(),
            Some(join_id.as_str())
        );
        assert!(!graph.get(&s1).unwrap().is_terminal);
    }

    #[test]
    fn test_single_source_is_untouched() {
        let config = Config::market_data();
        let mut graph = ComputeGraph::new();
        graph.add_node(
            NodeKind::Source {
                table: "tickers".to_string(),
                time_column: None,
            },
            vec![],
            NodeMeta::default(),
        );
        infer_join(&mut graph, &config).unwrap();
        assert!(!graph.nodes().any(|n| n.is_join()));
    }

    #[test]
    fn test_no_common_primary_key_errors() {
        let mut config = Config::market_data();
        config.tables.get_mut("tickers").unwrap().primary_keys = vec!["isin".to_string()];

        let mut graph = ComputeGraph::new();
        graph.add_node(
            NodeKind::Source {
                table: "tickers".to_string(),
                time_column: None,
            },
            vec![],
            NodeMeta::default(),
        );
        graph.add_node(
            NodeKind::Source {
                table: "daily_agg".to_string(),
                time_column: Some("date".to_string()),
            },
            vec![],
            NodeMeta::default(),
        );

        let err = infer_join(&mut graph, &config).unwrap_err();
        assert!(matches!(err, CompileError::NoCommonPrimaryKey(_, _)));
    }
}
