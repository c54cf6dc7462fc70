//! Node taxonomy of the compute graph.
//!
//! Nodes refer to each other only by id, never by reference; rewrites
//! mutate in place and `replace_node_id` stays cheap.

use serde::Serialize;

use crate::query::{BoolOp, CompareOp, Expression, SortDirection};

/// Graph node identifier: `<type>_<counter>`, e.g. `filter_1`.
pub type NodeId = String;

// ============================================================================
// Per-kind payloads
// ============================================================================

/// One column of a projection: either a named table column or an
/// inline expression, each with an optional output alias.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionColumn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_node: Option<NodeId>,
}

impl ProjectionColumn {
    pub fn column(name: &str, source_node: NodeId) -> Self {
        Self {
            name: Some(name.to_string()),
            expression: None,
            alias: None,
            source_node: Some(source_node),
        }
    }

    pub fn with_alias(mut self, alias: Option<String>) -> Self {
        self.alias = alias;
        self
    }

    /// Name this column exposes to downstream scopes.
    pub fn output_name(&self) -> Option<&str> {
        self.alias.as_deref().or(self.name.as_deref())
    }

    /// Content fingerprint used by projection deduplication.
    pub fn fingerprint(&self) -> String {
        match (&self.name, &self.expression) {
            (Some(name), _) => format!("{}|{}", name, self.alias.as_deref().unwrap_or("")),
            (None, Some(expr)) => format!("{:?}|{}", expr, self.alias.as_deref().unwrap_or("")),
            (None, None) => String::new(),
        }
    }
}

/// One side of a filter condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FilterOperand {
    /// References another node's output column.
    Node {
        input: NodeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        metric: Option<String>,
    },
    /// An inlined literal or typed placeholder, emitted verbatim.
    Parameter(String),
    /// An inline expression, translated in alias-only mode.
    Literal(Expression),
}

impl FilterOperand {
    pub fn node(input: NodeId, metric: Option<String>) -> Self {
        FilterOperand::Node { input, metric }
    }

    pub fn input_id(&self) -> Option<&NodeId> {
        match self {
            FilterOperand::Node { input, .. } => Some(input),
            _ => None,
        }
    }
}

/// Condition of a simple filter node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterCondition {
    pub left: FilterOperand,
    pub op: CompareOp,
    pub right: FilterOperand,
}

/// Sort key: a node reference, or a literal once parameters are inlined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SortKey {
    Node(NodeId),
    Literal(String),
}

/// One criterion of a sort node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortCriterion {
    pub key: SortKey,
    pub direction: SortDirection,
}

/// Join flavor. Inference only emits `Inner`; the others exist for
/// metric-level join strategies in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL OUTER JOIN",
        }
    }
}

/// An equi-join condition between two tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinCondition {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

// ============================================================================
// Metadata
// ============================================================================

/// Typed metadata bag carried by every node.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NodeMeta {
    /// LIMIT offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Sort/limit pair encodes top-N-per-group.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub grouped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_dimension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_limit: Option<u64>,
    /// Set on dependents when a parameter node is folded into them.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub has_parameter: bool,
    /// Projection added by the required-columns pass; never pruned.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub required_projection: bool,
    /// Projection of a grouping dimension.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub grouping: bool,
    /// Expression node holding a lowered constant.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub parameter: bool,
}

// ============================================================================
// Node
// ============================================================================

/// Per-kind payload of a compute node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NodeKind {
    Source {
        table: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_column: Option<String>,
    },
    Projection {
        columns: Vec<ProjectionColumn>,
    },
    Expression {
        expression: Expression,
        #[serde(skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Filter {
        condition: FilterCondition,
    },
    CompositeFilter {
        operator: BoolOp,
    },
    Sort {
        criteria: Vec<SortCriterion>,
    },
    Limit {
        limit: u64,
    },
    Join {
        join_type: JoinType,
        conditions: Vec<JoinCondition>,
    },
}

impl NodeKind {
    /// Kind name; also the id prefix for counter-based ids.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Source { .. } => "source",
            NodeKind::Projection { .. } => "projection",
            NodeKind::Expression { .. } => "expression",
            NodeKind::Filter { .. } => "filter",
            NodeKind::CompositeFilter { .. } => "composite_filter",
            NodeKind::Sort { .. } => "sort",
            NodeKind::Limit { .. } => "limit",
            NodeKind::Join { .. } => "join",
        }
    }
}

/// A node of the compute graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeNode {
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    /// True iff no other node consumes this one.
    pub is_terminal: bool,
    pub meta: NodeMeta,
    pub kind: NodeKind,
}

impl ComputeNode {
    pub fn is_source(&self) -> bool {
        matches!(self.kind, NodeKind::Source { .. })
    }

    pub fn is_projection(&self) -> bool {
        matches!(self.kind, NodeKind::Projection { .. })
    }

    pub fn is_expression(&self) -> bool {
        matches!(self.kind, NodeKind::Expression { .. })
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, NodeKind::Join { .. })
    }

    /// Filter or composite-filter.
    pub fn is_filter_like(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Filter { .. } | NodeKind::CompositeFilter { .. }
        )
    }

    /// Expression node wrapping a bare metric reference.
    pub fn is_metric_only_expression(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Expression {
                expression: Expression::Metric(_),
                ..
            }
        )
    }

    /// The expression carried by an expression node, if any.
    pub fn expression(&self) -> Option<&Expression> {
        match &self.kind {
            NodeKind::Expression { expression, .. } => Some(expression),
            _ => None,
        }
    }

    /// Output alias of an expression node.
    pub fn expression_alias(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Expression { alias, .. } => alias.as_deref(),
            _ => None,
        }
    }

    pub fn projection_columns(&self) -> &[ProjectionColumn] {
        match &self.kind {
            NodeKind::Projection { columns } => columns,
            _ => &[],
        }
    }

    /// Aggregate expression with a time range: its alias marks window
    /// output, and predicates over it belong in QUALIFY.
    pub fn windowed_aggregate(&self) -> Option<&crate::query::AggregateExpr> {
        match &self.kind {
            NodeKind::Expression {
                expression: Expression::Aggregate(agg),
                ..
            } if agg.time_range.is_some() => Some(agg),
            _ => None,
        }
    }
}
