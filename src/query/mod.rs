//! The declarative query model.
//!
//! A [`UserQuery`] is the validated JSON input: a filter tree over
//! expressions, optional grouping (including top-N-per-group), sorting,
//! and a result limit. Expressions and filters are recursive sum types;
//! the JSON is shape-discriminated, so deserialization is untagged
//! except for [`TimeRange`], which carries an explicit `type` tag.

use serde::{Deserialize, Serialize};

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle status of a screener query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Active,
    Running,
    Completed,
    Failed,
    Stopped,
}

/// Comparison operator of a simple filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Contains,
    Ncontains,
}

impl CompareOp {
    /// SQL operator spelling.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::In => "IN",
            CompareOp::Nin => "NOT IN",
            CompareOp::Contains => "LIKE",
            CompareOp::Ncontains => "NOT LIKE",
        }
    }

    /// True for the LIKE family; string values get `%...%` wrapping.
    pub fn is_like(&self) -> bool {
        matches!(self, CompareOp::Contains | CompareOp::Ncontains)
    }
}

/// Logical connective of a composite filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolOp {
    And,
    Or,
    Not,
}

impl BoolOp {
    pub fn sql(&self) -> &'static str {
        match self {
            BoolOp::And => "AND",
            BoolOp::Or => "OR",
            BoolOp::Not => "NOT",
        }
    }
}

/// Sort direction. Emitted lowercase, as the user wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Operator of a math expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathOperator {
    #[serde(rename = "+", alias = "add")]
    Add,
    #[serde(rename = "-", alias = "subtract")]
    Subtract,
    #[serde(rename = "*", alias = "multiply")]
    Multiply,
    #[serde(rename = "/", alias = "divide")]
    Divide,
    #[serde(rename = "^", alias = "power", alias = "pow")]
    Power,
    #[serde(rename = "%", alias = "modulo", alias = "mod")]
    Modulo,
    Sqrt,
    Abs,
    Ln,
    Log10,
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl MathOperator {
    /// Unary operators render as a function call over one operand.
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            MathOperator::Sqrt | MathOperator::Abs | MathOperator::Ln | MathOperator::Log10
        )
    }

    /// Infix spelling, if the operator is emitted infix.
    pub fn infix_sql(&self) -> Option<&'static str> {
        match self {
            MathOperator::Add => Some("+"),
            MathOperator::Subtract => Some("-"),
            MathOperator::Multiply => Some("*"),
            MathOperator::Divide => Some("/"),
            MathOperator::Modulo => Some("%"),
            MathOperator::Gt => Some(">"),
            MathOperator::Gte => Some(">="),
            MathOperator::Lt => Some("<"),
            MathOperator::Lte => Some("<="),
            MathOperator::Eq => Some("="),
            MathOperator::Neq => Some("!="),
            _ => None,
        }
    }

    /// Function spelling for prefix operators (`sqrt(x)`, `pow(a, b)`).
    pub fn function_sql(&self) -> Option<&'static str> {
        match self {
            MathOperator::Power => Some("pow"),
            MathOperator::Sqrt => Some("sqrt"),
            MathOperator::Abs => Some("abs"),
            MathOperator::Ln => Some("ln"),
            MathOperator::Log10 => Some("log10"),
            _ => None,
        }
    }
}

/// Aggregation function of an aggregate expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    First,
    Last,
    Min,
    Max,
    Median,
    Percentile,
    Avg,
    Sum,
    Stddev,
    Count,
    Variance,
    Diff,
    DiffPct,
    Ema,
}

impl Aggregation {
    pub fn name(&self) -> &'static str {
        match self {
            Aggregation::First => "first",
            Aggregation::Last => "last",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Median => "median",
            Aggregation::Percentile => "percentile",
            Aggregation::Avg => "avg",
            Aggregation::Sum => "sum",
            Aggregation::Stddev => "stddev",
            Aggregation::Count => "count",
            Aggregation::Variance => "variance",
            Aggregation::Diff => "diff",
            Aggregation::DiffPct => "diff_pct",
            Aggregation::Ema => "ema",
        }
    }
}

// ============================================================================
// Time Ranges
// ============================================================================

/// Unit of a relative or trading time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// SQL `INTERVAL` unit spelling.
    pub fn sql(&self) -> &'static str {
        match self {
            TimeUnit::Minute => "MINUTE",
            TimeUnit::Hour => "HOUR",
            TimeUnit::Day => "DAY",
            TimeUnit::Week => "WEEK",
            TimeUnit::Month => "MONTH",
            TimeUnit::Year => "YEAR",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3_600,
            TimeUnit::Day => 86_400,
            TimeUnit::Week => 604_800,
            TimeUnit::Month => 2_592_000,
            TimeUnit::Year => 31_536_000,
        }
    }

    /// Over-fetch multiplier used when ranking trading (row-count) ranges
    /// against calendar ranges. Trading rows are sparser than calendar
    /// time, so the coarse date cut must reach further back.
    pub fn trading_multiplier(&self) -> f64 {
        match self {
            TimeUnit::Hour => 3.0,
            TimeUnit::Day => 1.5,
            TimeUnit::Week => 1.3,
            _ => 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        }
    }
}

/// Time window of an aggregate expression.
///
/// `Trading` means trading-calendar semantics: the window is a row count
/// over trading rows, not a calendar interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TimeRange {
    Absolute {
        /// UNIX seconds, inclusive.
        from: i64,
        /// UNIX seconds, inclusive.
        to: i64,
    },
    Relative {
        duration: u32,
        unit: TimeUnit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<i64>,
    },
    Trading {
        duration: u32,
        unit: TimeUnit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<i64>,
    },
}

impl TimeRange {
    pub fn kind(&self) -> &'static str {
        match self {
            TimeRange::Absolute { .. } => "absolute",
            TimeRange::Relative { .. } => "relative",
            TimeRange::Trading { .. } => "trading",
        }
    }

    /// Width of the range in seconds, for PREWHERE ranking. Trading
    /// durations are inflated by the unit's over-fetch multiplier.
    pub fn span_seconds(&self) -> i64 {
        match self {
            TimeRange::Absolute { from, to } => to - from,
            TimeRange::Relative { duration, unit, .. } => i64::from(*duration) * unit.seconds(),
            TimeRange::Trading { duration, unit, .. } => {
                let base = i64::from(*duration) as f64 * unit.seconds() as f64;
                (base * unit.trading_multiplier()).ceil() as i64
            }
        }
    }

    /// Fragment used in auto-generated aliases, e.g. `30_day`.
    pub fn alias_fragment(&self) -> String {
        match self {
            TimeRange::Absolute { from, to } => format!("{}_{}", from, to),
            TimeRange::Relative { duration, unit, .. }
            | TimeRange::Trading { duration, unit, .. } => {
                format!("{}_{}", duration, unit.name())
            }
        }
    }
}

// ============================================================================
// Constants
// ============================================================================

/// A scalar literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl ScalarValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarValue::Bool(_) => "Boolean",
            ScalarValue::Number(_) => "Float64",
            ScalarValue::String(_) => "String",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScalarValue::Bool(b) => serde_json::Value::Bool(*b),
            ScalarValue::Number(n) => serde_json::json!(n),
            ScalarValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// A constant expression: a scalar or a list of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstantValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

// ============================================================================
// Expressions
// ============================================================================

/// A metric reference, resolved via config to `(table, column)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricExpr {
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Box<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A math expression over one or more operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathExpr {
    pub operator: MathOperator,
    pub operands: Vec<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Extra parameters of an aggregate (`percentile`, `ema` span).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<f64>,
}

/// An aggregate over a metric, math, or nested aggregate target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub target: Box<Expression>,
    pub aggregation: Aggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<AggregateParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Box<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A recursive expression.
///
/// `Sql` never appears in user input: the IR builder rewrites lowered
/// constants to the raw SQL token allocated for them (an inlined literal
/// or a typed placeholder) so translation never re-allocates parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expression {
    Aggregate(Box<AggregateExpr>),
    Math(MathExpr),
    Metric(MetricExpr),
    Constant(ConstantValue),
    #[serde(skip)]
    Sql(String),
}

impl Expression {
    pub fn alias(&self) -> Option<&str> {
        match self {
            Expression::Aggregate(a) => a.alias.as_deref(),
            Expression::Math(m) => m.alias.as_deref(),
            Expression::Metric(m) => m.alias.as_deref(),
            _ => None,
        }
    }

    /// The name a filter side or sort criterion uses to reference this
    /// expression's output column, if it has one.
    pub fn reference_label(&self) -> Option<String> {
        match self {
            Expression::Metric(m) => Some(m.alias.clone().unwrap_or_else(|| m.metric.clone())),
            Expression::Math(m) => m.alias.clone(),
            Expression::Aggregate(a) => a.alias.clone(),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expression::Constant(_) | Expression::Sql(_))
    }

    /// First metric name reachable in this expression tree. Aggregates
    /// resolve their table (partition key, time column) through it.
    pub fn first_metric(&self) -> Option<&str> {
        match self {
            Expression::Metric(m) => Some(&m.metric),
            Expression::Math(m) => m.operands.iter().find_map(|o| o.first_metric()),
            Expression::Aggregate(a) => a.target.first_metric(),
            _ => None,
        }
    }

    /// Structural equality: same kind, same alias, and variant-specific
    /// fields compared pointwise. Time ranges compare by presence and
    /// kind only; aggregate filters by presence only.
    pub fn structurally_equal(&self, other: &Expression) -> bool {
        match (self, other) {
            (Expression::Constant(a), Expression::Constant(b)) => a == b,
            (Expression::Sql(a), Expression::Sql(b)) => a == b,
            (Expression::Metric(a), Expression::Metric(b)) => {
                a.metric == b.metric && a.alias == b.alias
            }
            (Expression::Math(a), Expression::Math(b)) => {
                a.operator == b.operator
                    && a.alias == b.alias
                    && a.operands.len() == b.operands.len()
                    && a.operands
                        .iter()
                        .zip(&b.operands)
                        .all(|(x, y)| x.structurally_equal(y))
            }
            (Expression::Aggregate(a), Expression::Aggregate(b)) => {
                a.aggregation == b.aggregation
                    && a.alias == b.alias
                    && match (&a.time_range, &b.time_range) {
                        (None, None) => true,
                        (Some(x), Some(y)) => x.kind() == y.kind(),
                        _ => false,
                    }
                    && a.filter.is_some() == b.filter.is_some()
                    && a.target.structurally_equal(&b.target)
            }
            _ => false,
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// A comparison of a target expression against a value expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleFilter {
    pub target: Expression,
    pub op: CompareOp,
    pub value: Expression,
}

/// A logical combination of filters. `not` has exactly one child by
/// convention; `and`/`or` carry at least one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeFilter {
    pub operator: BoolOp,
    pub filters: Vec<Filter>,
}

/// A filter tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Composite(CompositeFilter),
    Simple(SimpleFilter),
}

impl Filter {
    /// Structural equality, mirroring [`Expression::structurally_equal`].
    pub fn structurally_equal(&self, other: &Filter) -> bool {
        match (self, other) {
            (Filter::Simple(a), Filter::Simple(b)) => {
                a.op == b.op
                    && a.target.structurally_equal(&b.target)
                    && a.value.structurally_equal(&b.value)
            }
            (Filter::Composite(a), Filter::Composite(b)) => {
                a.operator == b.operator
                    && a.filters.len() == b.filters.len()
                    && a.filters
                        .iter()
                        .zip(&b.filters)
                        .all(|(x, y)| x.structurally_equal(y))
            }
            _ => false,
        }
    }
}

// ============================================================================
// Grouping and Sorting
// ============================================================================

/// A top-N-per-group criterion: keep `limit` rows per `dimension` value,
/// ranked by `expression` (descending unless a direction is given).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNGroup {
    pub dimension: String,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
}

/// A grouping criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupBy {
    Dimension(String),
    TopN(TopNGroup),
}

/// A sort criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    pub expression: Expression,
    #[serde(default)]
    pub direction: SortDirection,
}

// ============================================================================
// UserQuery
// ============================================================================

/// A validated screener query.
///
/// `description`, `markets`, and `schedule` are opaque pass-through
/// metadata; the compiler never inspects them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuery {
    pub id: String,
    pub name: String,
    pub status: QueryStatus,
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<GroupBy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<Vec<SortBy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<serde_json::Value>,
}

// ============================================================================
// Tests
// ============================================================================
