//! Lowering a `UserQuery` into the compute graph.
//!
//! Build order: filter, grouping criteria, sort criteria, limit, then
//! join inference and the required-columns pass. Constants allocate
//! their parameter slot here and are rewritten to the resulting SQL
//! token, so translation downstream never re-allocates.

use std::collections::HashMap;

use crate::config::Config;
use crate::error::CompileResult;
use crate::graph::{
    ComputeGraph, FilterCondition, FilterOperand, NodeId, NodeKind, NodeMeta, ProjectionColumn,
    SortCriterion, SortKey,
};
use crate::planner::join;
use crate::query::{
    AggregateExpr, CompareOp, Expression, Filter, GroupBy, MathExpr, MetricExpr, SortBy,
    SortDirection, UserQuery,
};
use crate::sql::params::ParameterTable;

/// Longest auto-generated alias; longer ones are cut, not rejected.
const MAX_ALIAS_LEN: usize = 65;

/// Lowers one query into a fresh graph and parameter table.
pub struct GraphBuilder<'a> {
    config: &'a Config,
    graph: ComputeGraph,
    params: ParameterTable,
    sources: HashMap<String, NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            graph: ComputeGraph::new(),
            params: ParameterTable::new(),
            sources: HashMap::new(),
        }
    }

    /// Lower the full query. Consumes the builder; the graph and
    /// parameters live on for the rest of the compile call.
    pub fn build(mut self, query: &UserQuery) -> CompileResult<(ComputeGraph, ParameterTable)> {
        self.lower_filter(&query.filter)?;

        if let Some(group_by) = &query.group_by {
            for criterion in group_by {
                self.lower_group_by(criterion)?;
            }
        }

        let mut sort_id = None;
        if let Some(sort_by) = &query.sort_by {
            if !sort_by.is_empty() {
                sort_id = Some(self.lower_sort_by(sort_by)?);
            }
        }

        if let Some(limit) = query.limit {
            let inputs = sort_id.into_iter().collect();
            self.graph
                .add_node(NodeKind::Limit { limit }, inputs, NodeMeta::default());
        }

        join::infer_join(&mut self.graph, self.config)?;
        add_required_columns(&mut self.graph, self.config);

        Ok((self.graph, self.params))
    }

    // ========================================================================
    // Filters
    // ========================================================================

    fn lower_filter(&mut self, filter: &Filter) -> CompileResult<NodeId> {
        match filter {
            Filter::Simple(simple) => {
                let (target_id, target_expr) = self.lower_expression(&simple.target, None)?;
                let left = FilterOperand::node(target_id.clone(), target_expr.reference_label());

                let (value_id, right) = if simple.value.is_constant() {
                    let (id, _) = self.lower_expression(&simple.value, Some(simple.op))?;
                    (id.clone(), FilterOperand::node(id, None))
                } else {
                    let (id, value_expr) = self.lower_expression(&simple.value, None)?;
                    (
                        id.clone(),
                        FilterOperand::node(id, value_expr.reference_label()),
                    )
                };

                let mut inputs = vec![target_id];
                if !inputs.contains(&value_id) {
                    inputs.push(value_id);
                }

                Ok(self.graph.add_node(
                    NodeKind::Filter {
                        condition: FilterCondition {
                            left,
                            op: simple.op,
                            right,
                        },
                    },
                    inputs,
                    NodeMeta::default(),
                ))
            }
            Filter::Composite(composite) => {
                let mut children: Vec<NodeId> = Vec::with_capacity(composite.filters.len());
                for child in &composite.filters {
                    let id = self.lower_filter(child)?;
                    if !children.contains(&id) {
                        children.push(id);
                    }
                }
                Ok(self.graph.add_node(
                    NodeKind::CompositeFilter {
                        operator: composite.operator,
                    },
                    children,
                    NodeMeta::default(),
                ))
            }
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// Lower an expression subtree. Returns the node id and the
    /// expression as stored on the node, with constants rewritten to
    /// their allocated SQL token and aggregates carrying their alias.
    fn lower_expression(
        &mut self,
        expr: &Expression,
        op: Option<CompareOp>,
    ) -> CompileResult<(NodeId, Expression)> {
        match expr {
            Expression::Constant(value) => {
                let token = self.params.create(value, op)?;
                let rewritten = Expression::Sql(token);
                let id = self.graph.add_node(
                    NodeKind::Expression {
                        expression: rewritten.clone(),
                        alias: None,
                    },
                    vec![],
                    NodeMeta {
                        parameter: true,
                        ..NodeMeta::default()
                    },
                );
                Ok((id, rewritten))
            }
            Expression::Sql(token) => {
                let rewritten = Expression::Sql(token.clone());
                let id = self.graph.add_node(
                    NodeKind::Expression {
                        expression: rewritten.clone(),
                        alias: None,
                    },
                    vec![],
                    NodeMeta {
                        parameter: true,
                        ..NodeMeta::default()
                    },
                );
                Ok((id, rewritten))
            }
            Expression::Metric(metric) => self.lower_metric(metric),
            Expression::Math(math) => self.lower_math(math),
            Expression::Aggregate(agg) => self.lower_aggregate(agg),
        }
    }

    fn lower_metric(&mut self, metric: &MetricExpr) -> CompileResult<(NodeId, Expression)> {
        let mapping = self.config.resolve_metric(&metric.metric)?;
        let table = mapping.table.clone();
        let column_name = mapping.column.clone();
        let source_id = self.find_or_create_source(&table);

        let alias = metric.alias.clone().or_else(|| {
            if metric.metric != column_name {
                Some(metric.metric.clone())
            } else {
                None
            }
        });

        let column = ProjectionColumn::column(&column_name, source_id.clone()).with_alias(alias);
        let projection_id = self.graph.add_node(
            NodeKind::Projection {
                columns: vec![column],
            },
            vec![source_id],
            NodeMeta::default(),
        );

        if let Some(filter) = &metric.filter {
            let filter_id = self.lower_filter(filter)?;
            self.attach_extra_input(&filter_id, &projection_id);
        }

        let rewritten = Expression::Metric(MetricExpr {
            metric: metric.metric.clone(),
            filter: None,
            alias: metric.alias.clone(),
        });
        Ok((projection_id, rewritten))
    }

    fn lower_math(&mut self, math: &MathExpr) -> CompileResult<(NodeId, Expression)> {
        let mut inputs: Vec<NodeId> = Vec::with_capacity(math.operands.len());
        let mut operands: Vec<Expression> = Vec::with_capacity(math.operands.len());
        for operand in &math.operands {
            let (id, rewritten) = self.lower_expression(operand, None)?;
            if !inputs.contains(&id) {
                inputs.push(id);
            }
            operands.push(rewritten);
        }

        let rewritten = Expression::Math(MathExpr {
            operator: math.operator,
            operands,
            alias: math.alias.clone(),
        });
        let id = self.graph.add_node(
            NodeKind::Expression {
                expression: rewritten.clone(),
                alias: math.alias.clone(),
            },
            inputs,
            NodeMeta::default(),
        );
        Ok((id, rewritten))
    }

    fn lower_aggregate(&mut self, agg: &AggregateExpr) -> CompileResult<(NodeId, Expression)> {
        let (target_id, target_expr) = self.lower_expression(&agg.target, None)?;

        let mut inputs = vec![target_id.clone()];
        if let Some(filter) = &agg.filter {
            // Lower once here and null it out on the node, so translation
            // cannot re-lower it.
            let filter_id = self.lower_filter(filter)?;
            self.attach_extra_input(&filter_id, &target_id);
            inputs.push(filter_id);
        }

        let alias = agg
            .alias
            .clone()
            .unwrap_or_else(|| auto_alias(agg, &target_expr));

        let rewritten = AggregateExpr {
            target: Box::new(target_expr),
            aggregation: agg.aggregation,
            time_range: agg.time_range.clone(),
            params: agg.params.clone(),
            filter: None,
            alias: Some(alias.clone()),
        };
        let expression = Expression::Aggregate(Box::new(rewritten));
        let id = self.graph.add_node(
            NodeKind::Expression {
                expression: expression.clone(),
                alias: Some(alias),
            },
            inputs,
            NodeMeta::default(),
        );
        Ok((id, expression))
    }

    // ========================================================================
    // Grouping and Sorting
    // ========================================================================

    fn lower_group_by(&mut self, criterion: &GroupBy) -> CompileResult<()> {
        match criterion {
            GroupBy::Dimension(dimension) => {
                self.lower_dimension(dimension)?;
                Ok(())
            }
            GroupBy::TopN(group) => {
                let dimension_id = self.lower_dimension(&group.dimension)?;
                let order_id = match &group.expression {
                    Some(expr) => self.lower_expression(expr, None)?.0,
                    None => dimension_id,
                };
                let direction = group.direction.unwrap_or(SortDirection::Desc);
                let meta = NodeMeta {
                    grouped: true,
                    group_dimension: Some(group.dimension.clone()),
                    group_limit: Some(group.limit),
                    ..NodeMeta::default()
                };

                let sort_id = self.graph.add_node(
                    NodeKind::Sort {
                        criteria: vec![SortCriterion {
                            key: SortKey::Node(order_id.clone()),
                            direction,
                        }],
                    },
                    vec![order_id],
                    meta.clone(),
                );
                self.graph.add_node(
                    NodeKind::Limit { limit: group.limit },
                    vec![sort_id],
                    meta,
                );
                Ok(())
            }
        }
    }

    fn lower_dimension(&mut self, dimension: &str) -> CompileResult<NodeId> {
        let mapping = self.config.resolve_dimension(dimension)?;
        let table = mapping.table.clone();
        let column_name = mapping.column.clone();
        let source_id = self.find_or_create_source(&table);

        let alias = if dimension != column_name {
            Some(dimension.to_string())
        } else {
            None
        };
        let column = ProjectionColumn::column(&column_name, source_id.clone()).with_alias(alias);
        Ok(self.graph.add_node(
            NodeKind::Projection {
                columns: vec![column],
            },
            vec![source_id],
            NodeMeta {
                grouping: true,
                ..NodeMeta::default()
            },
        ))
    }

    fn lower_sort_by(&mut self, sort_by: &[SortBy]) -> CompileResult<NodeId> {
        let mut inputs: Vec<NodeId> = Vec::new();
        let mut criteria: Vec<SortCriterion> = Vec::with_capacity(sort_by.len());
        for sort in sort_by {
            let (id, _) = self.lower_expression(&sort.expression, None)?;
            criteria.push(SortCriterion {
                key: SortKey::Node(id.clone()),
                direction: sort.direction,
            });
            if !inputs.contains(&id) {
                inputs.push(id);
            }
        }
        Ok(self
            .graph
            .add_node(NodeKind::Sort { criteria }, inputs, NodeMeta::default()))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn find_or_create_source(&mut self, table: &str) -> NodeId {
        if let Some(id) = self.sources.get(table) {
            return id.clone();
        }
        let time_column = self
            .config
            .table(table)
            .and_then(|t| t.time_column.clone());
        let id = self.graph.add_node(
            NodeKind::Source {
                table: table.to_string(),
                time_column,
            },
            vec![],
            NodeMeta::default(),
        );
        self.sources.insert(table.to_string(), id.clone());
        id
    }

    fn attach_extra_input(&mut self, node: &NodeId, extra: &NodeId) {
        if let Some(n) = self.graph.get_mut(node) {
            if !n.inputs.contains(extra) {
                n.inputs.push(extra.clone());
            }
        }
        if let Some(e) = self.graph.get_mut(extra) {
            e.is_terminal = false;
        }
    }
}

/// `<agg>_<target>[_<range>]`, cut to 65 chars.
fn auto_alias(agg: &AggregateExpr, target: &Expression) -> String {
    let target_label = target
        .reference_label()
        .unwrap_or_else(|| "value".to_string());
    let mut alias = match &agg.time_range {
        Some(range) => format!(
            "{}_{}_{}",
            agg.aggregation.name(),
            target_label,
            range.alias_fragment()
        ),
        None => format!("{}_{}", agg.aggregation.name(), target_label),
    };
    if alias.len() > MAX_ALIAS_LEN {
        let mut cut = MAX_ALIAS_LEN;
        while !alias.is_char_boundary(cut) {
            cut -= 1;
        }
        alias.truncate(cut);
    }
    alias
}

// ============================================================================
// Required columns
// ============================================================================

/// For every source: project its `always_include_columns`, and its time
/// column when a windowed aggregate resolves to that table. Runs after
/// join inference and again after optimization, so removals can never
/// leave a windowed aggregate without its time column.
pub fn add_required_columns(graph: &mut ComputeGraph, config: &Config) {
    let join_id = graph.nodes().find(|n| n.is_join()).map(|n| n.id.clone());

    let mut windowed_tables: Vec<String> = Vec::new();
    for node in graph.nodes() {
        if let Some(agg) = node.windowed_aggregate() {
            if let Some(metric) = agg.target.first_metric() {
                if let Ok(mapping) = config.resolve_metric(metric) {
                    if !windowed_tables.contains(&mapping.table) {
                        windowed_tables.push(mapping.table.clone());
                    }
                }
            }
        }
    }

    for source_id in graph.source_nodes() {
        let table = match graph.get(&source_id).map(|n| &n.kind) {
            Some(NodeKind::Source { table, .. }) => table.clone(),
            _ => continue,
        };
        let Some(table_config) = config.table(&table) else {
            continue;
        };

        let mut needed: Vec<String> = table_config.always_include_columns.clone();
        if windowed_tables.contains(&table) {
            if let Some(time_column) = &table_config.time_column {
                if !needed.contains(time_column) {
                    needed.push(time_column.clone());
                }
            }
        }
        if needed.is_empty() {
            continue;
        }

        let upstream = join_id.clone().unwrap_or_else(|| source_id.clone());
        let projected: Vec<String> = graph
            .nodes()
            .filter(|n| n.inputs.contains(&upstream))
            .flat_map(|n| n.projection_columns())
            .filter_map(|c| c.name.clone())
            .collect();

        for column in needed {
            if projected.contains(&column) {
                continue;
            }
            graph.add_node(
                NodeKind::Projection {
                    columns: vec![ProjectionColumn::column(&column, upstream.clone())],
                },
                vec![upstream.clone()],
                NodeMeta {
                    required_projection: true,
                    ..NodeMeta::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::UserQuery;

    fn build(json: &str) -> (ComputeGraph, ParameterTable) {
        let query: UserQuery = serde_json::from_str(json).unwrap();
        GraphBuilder::new(crate::config::default_config())
            .build(&query)
            .unwrap()
    }

    #[test]
    fn test_simple_filter_graph_shape() {
        let (graph, params) = build(
            r#"{
                "id": "q1", "name": "sector", "status": "active",
                "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
                "limit": 100
            }"#,
        );

        // Counter-based ids are pinned behavior.
        assert!(graph.contains("source_1"));
        assert!(graph.contains("projection_1"));
        assert!(graph.contains("expression_1"));
        assert!(graph.contains("filter_1"));
        assert!(graph.contains("limit_1"));

        let filter = graph.get("filter_1").unwrap();
        assert_eq!(filter.inputs, vec!["projection_1", "expression_1"]);
        assert_eq!(params.get("param_1"), Some(&serde_json::json!("Technology")));
    }

    #[test]
    fn test_aggregate_gets_auto_alias() {
        let (graph, _) = build(
            r#"{
                "id": "q2", "name": "avg close", "status": "active",
                "filter": {
                    "target": {
                        "target": { "metric": "close" },
                        "aggregation": "avg",
                        "time_range": { "type": "relative", "duration": 30, "unit": "day" }
                    },
                    "op": "gt",
                    "value": 100
                }
            }"#,
        );

        let aggregate = graph
            .nodes()
            .find(|n| n.windowed_aggregate().is_some())
            .unwrap();
        assert_eq!(aggregate.expression_alias(), Some("avg_close_30_day"));
    }

    #[test]
    fn test_required_columns_added_for_windowed_source() {
        let (graph, _) = build(
            r#"{
                "id": "q3", "name": "returns", "status": "active",
                "filter": {
                    "target": {
                        "target": { "metric": "close" },
                        "aggregation": "diff_pct",
                        "time_range": { "type": "relative", "duration": 30, "unit": "day" },
                        "alias": "return_30d"
                    },
                    "op": "gt",
                    "value": 10
                }
            }"#,
        );

        let required: Vec<_> = graph
            .nodes()
            .filter(|n| n.meta.required_projection)
            .flat_map(|n| n.projection_columns())
            .filter_map(|c| c.name.clone())
            .collect();
        assert!(required.contains(&"ticker".to_string()));
        assert!(required.contains(&"date".to_string()));
    }

    #[test]
    fn test_top_n_grouping_emits_sort_limit_pair() {
        let (graph, _) = build(
            r#"{
                "id": "q4", "name": "top3", "status": "active",
                "filter": { "target": { "metric": "ticker" }, "op": "in", "value": ["AAPL", "MSFT"] },
                "group_by": [{
                    "dimension": "sector",
                    "limit": 3,
                    "expression": {
                        "target": { "metric": "close" },
                        "aggregation": "diff",
                        "time_range": { "type": "relative", "duration": 90, "unit": "day" }
                    }
                }],
                "limit": 100
            }"#,
        );

        let sort = graph
            .nodes()
            .find(|n| matches!(n.kind, NodeKind::Sort { .. }) && n.meta.grouped)
            .unwrap();
        assert_eq!(sort.meta.group_dimension.as_deref(), Some("sector"));
        assert_eq!(sort.meta.group_limit, Some(3));

        let grouped_limit = graph
            .nodes()
            .find(|n| matches!(n.kind, NodeKind::Limit { limit: 3 }))
            .unwrap();
        assert!(grouped_limit.meta.grouped);

        // Two tables referenced, so join inference fired.
        assert!(graph.nodes().any(|n| n.is_join()));
    }

    #[test]
    fn test_unknown_metric_errors() {
        let query: UserQuery = serde_json::from_str(
            r#"{
                "id": "q5", "name": "bad", "status": "active",
                "filter": { "target": { "metric": "pe_ratio" }, "op": "gt", "value": 1 }
            }"#,
        )
        .unwrap();
        let err = GraphBuilder::new(crate::config::default_config())
            .build(&query)
            .unwrap_err();
        assert_eq!(
            err,
            crate::error::CompileError::UnknownMetric("pe_ratio".to_string())
        );
    }
}
