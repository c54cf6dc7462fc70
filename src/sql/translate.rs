//! Translating expressions and filters into SQL fragments.
//!
//! A fragment carries the column text, any WHERE predicates it drags in
//! (date cuts for windowed aggregates), and whether it is a window
//! expression. Predicates referencing a window alias — or containing an
//! inline window function — belong in QUALIFY, not WHERE; the emitter
//! partitions them using the flags reported here.

use std::collections::HashSet;

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::error::CompileResult;
use crate::graph::{ComputeGraph, FilterOperand, NodeKind};
use crate::query::{
    AggregateExpr, Aggregation, ConstantValue, Expression, MathExpr, ScalarValue, TimeRange,
};

/// Inline window function tokens; their presence forces QUALIFY.
static WINDOW_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(last_value|first_value|avg|sum|min|max|count)\(").expect("valid regex")
});

/// Translation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Emit the full formula (SELECT column position).
    Full,
    /// Collapse to the alias when one exists (filter and sort position).
    Reference,
}

/// A translated expression.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub column: String,
    pub where_parts: Vec<String>,
    pub is_window: bool,
}

/// A translated filter.
#[derive(Debug, Clone)]
pub struct FilterFragment {
    pub sql: String,
    pub touches_window: bool,
}

/// UNIX seconds to `YYYY-MM-DD` (UTC).
pub fn format_date(seconds: i64) -> String {
    DateTime::from_timestamp(seconds, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

// ============================================================================
// Expressions
// ============================================================================

pub fn translate_expression(
    config: &Config,
    expr: &Expression,
    mode: Mode,
) -> CompileResult<SqlFragment> {
    match expr {
        Expression::Sql(token) => Ok(SqlFragment {
            column: token.clone(),
            ..SqlFragment::default()
        }),
        Expression::Constant(value) => Ok(SqlFragment {
            column: render_constant(value),
            ..SqlFragment::default()
        }),
        Expression::Metric(metric) => Ok(SqlFragment {
            column: metric.alias.clone().unwrap_or_else(|| metric.metric.clone()),
            ..SqlFragment::default()
        }),
        Expression::Math(math) => translate_math(config, math, mode),
        Expression::Aggregate(agg) => translate_aggregate(config, agg, mode),
    }
}

fn translate_math(config: &Config, math: &MathExpr, mode: Mode) -> CompileResult<SqlFragment> {
    let mut columns: Vec<String> = Vec::with_capacity(math.operands.len());
    let mut where_parts: Vec<String> = Vec::new();
    let mut is_window = false;
    for operand in &math.operands {
        let fragment = translate_expression(config, operand, Mode::Reference)?;
        columns.push(fragment.column);
        where_parts.extend(fragment.where_parts);
        is_window |= fragment.is_window;
    }

    if mode == Mode::Reference {
        if let Some(alias) = &math.alias {
            return Ok(SqlFragment {
                column: alias.clone(),
                where_parts,
                is_window,
            });
        }
    }

    let column = if math.operator.is_unary() {
        let function = math.operator.function_sql().unwrap_or("abs");
        format!("{}({})", function, columns.first().cloned().unwrap_or_default())
    } else if let Some(symbol) = math.operator.infix_sql() {
        format!("({})", columns.join(&format!(" {} ", symbol)))
    } else {
        // pow and friends: fold left as nested calls.
        let function = math.operator.function_sql().unwrap_or("pow");
        let mut iter = columns.into_iter();
        let first = iter.next().unwrap_or_default();
        iter.fold(first, |acc, next| format!("{}({}, {})", function, acc, next))
    };

    Ok(SqlFragment {
        column,
        where_parts,
        is_window,
    })
}

fn translate_aggregate(
    config: &Config,
    agg: &AggregateExpr,
    mode: Mode,
) -> CompileResult<SqlFragment> {
    let is_window = agg.time_range.is_some();
    if mode == Mode::Reference {
        if let Some(alias) = &agg.alias {
            return Ok(SqlFragment {
                column: alias.clone(),
                where_parts: vec![],
                is_window,
            });
        }
    }

    let target = translate_expression(config, &agg.target, Mode::Reference)?;
    let col = target.column;
    let mut where_parts = target.where_parts;

    let (pk, time) = partition_and_time(config, agg);

    match &agg.time_range {
        Some(TimeRange::Relative { duration, unit, .. }) => {
            where_parts.push(format!(
                "{} >= date_sub(now(), INTERVAL {} {})",
                time,
                duration,
                unit.sql()
            ));
        }
        Some(TimeRange::Absolute { from, to }) => {
            where_parts.push(format!(
                "{} BETWEEN toDate('{}') AND toDate('{}')",
                time,
                format_date(*from),
                format_date(*to)
            ));
        }
        // Trading windows count rows; a date cut would starve the frame.
        Some(TimeRange::Trading { .. }) | None => {}
    }

    let trading = match &agg.time_range {
        Some(TimeRange::Trading { duration, .. }) => Some(*duration),
        _ => None,
    };
    let bounded = window_clause(&pk, &time, true, trading);
    let running = window_clause(&pk, &time, false, trading);

    let column = match agg.aggregation {
        Aggregation::First => format!("first_value({}) OVER ({})", col, bounded),
        Aggregation::Last => format!("last_value({}) OVER ({})", col, bounded),
        Aggregation::Avg => format!("avg({}) OVER ({})", col, running),
        Aggregation::Sum => format!("sum({}) OVER ({})", col, running),
        Aggregation::Min => format!("min({}) OVER ({})", col, running),
        Aggregation::Max => format!("max({}) OVER ({})", col, running),
        Aggregation::Count => format!("count({}) OVER ({})", col, running),
        Aggregation::Median => format!("quantile(0.5)({}) OVER ({})", col, running),
        Aggregation::Percentile => {
            let p = agg.params.as_ref().and_then(|p| p.percentile).unwrap_or(0.5);
            format!("quantile({})({}) OVER ({})", p, col, running)
        }
        Aggregation::Stddev => format!("stddevPopStable({}) OVER ({})", col, running),
        Aggregation::Variance => format!("varPop({}) OVER ({})", col, running),
        Aggregation::Diff => format!(
            "last_value({c}) OVER ({w}) - first_value({c}) OVER ({w})",
            c = col,
            w = bounded
        ),
        Aggregation::DiffPct => format!(
            "(last_value({c}) OVER ({w}) - first_value({c}) OVER ({w})) / nullIf(first_value({c}) OVER ({w}), 0) * 100",
            c = col,
            w = bounded
        ),
        Aggregation::Ema => {
            let span = agg.params.as_ref().and_then(|p| p.span).unwrap_or(14.0);
            let alpha = 2.0 / (span + 1.0);
            format!(
                "exponentialMovingAverage({:.4})({}, toUnixTimestamp({})) OVER ({})",
                alpha, col, time, running
            )
        }
    };

    Ok(SqlFragment {
        column,
        where_parts,
        is_window,
    })
}

/// Window partition key and time column, resolved through the target's
/// first metric.
fn partition_and_time(config: &Config, agg: &AggregateExpr) -> (String, String) {
    let table = agg
        .target
        .first_metric()
        .and_then(|m| config.resolve_metric(m).ok())
        .and_then(|mapping| config.table(&mapping.table));
    match table {
        Some(t) => (
            t.primary_keys
                .first()
                .cloned()
                .unwrap_or_else(|| "ticker".to_string()),
            t.time_column.clone().unwrap_or_else(|| "date".to_string()),
        ),
        None => ("ticker".to_string(), "date".to_string()),
    }
}

fn window_clause(pk: &str, time: &str, bounded: bool, trading: Option<u32>) -> String {
    match (trading, bounded) {
        (Some(d), true) => format!(
            "PARTITION BY {} ORDER BY {} ASC ROWS BETWEEN {} PRECEDING AND CURRENT ROW",
            pk,
            time,
            d.saturating_sub(1)
        ),
        (Some(d), false) => format!(
            "PARTITION BY {} ORDER BY {} ROWS BETWEEN {} PRECEDING AND CURRENT ROW",
            pk,
            time,
            d.saturating_sub(1)
        ),
        (None, true) => format!(
            "PARTITION BY {} ORDER BY {} ASC ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING",
            pk, time
        ),
        (None, false) => format!("PARTITION BY {} ORDER BY {}", pk, time),
    }
}

fn render_constant(value: &ConstantValue) -> String {
    match value {
        ConstantValue::Scalar(scalar) => render_scalar(scalar),
        ConstantValue::List(items) => format!(
            "[{}]",
            items.iter().map(render_scalar).collect::<Vec<_>>().join(", ")
        ),
    }
}

fn render_scalar(scalar: &ScalarValue) -> String {
    match scalar {
        ScalarValue::Number(n) => format!("{}", n),
        ScalarValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        ScalarValue::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Translate a filter or composite-filter node. `window_aliases` is the
/// scope's set of window output names.
pub fn translate_filter(
    graph: &ComputeGraph,
    config: &Config,
    id: &str,
    window_aliases: &HashSet<String>,
) -> CompileResult<FilterFragment> {
    let Some(node) = graph.get(id) else {
        return Ok(FilterFragment {
            sql: String::new(),
            touches_window: false,
        });
    };

    match &node.kind {
        NodeKind::CompositeFilter { operator } => {
            let mut parts: Vec<String> = Vec::new();
            let mut touches_window = false;
            for child in &node.inputs {
                let fragment = translate_filter(graph, config, child, window_aliases)?;
                if fragment.sql.is_empty() {
                    continue;
                }
                touches_window |= fragment.touches_window;
                parts.push(fragment.sql);
            }
            let sql = match operator {
                crate::query::BoolOp::Not => format!("NOT ({})", parts.join(" AND ")),
                op => format!("({})", parts.join(&format!(" {} ", op.sql()))),
            };
            Ok(FilterFragment {
                sql,
                touches_window,
            })
        }
        NodeKind::Filter { condition } => {
            let (left_sql, left_label) = operand_sql(graph, config, &condition.left)?;
            let (right_sql, right_label) = operand_sql(graph, config, &condition.right)?;
            let sql = format!("{} {} {}", left_sql, condition.op.sql(), right_sql);
            let touches_window = [&left_label, &right_label]
                .iter()
                .any(|l| l.as_deref().map(|l| window_aliases.contains(l)).unwrap_or(false))
                || WINDOW_FN_RE.is_match(&sql);
            Ok(FilterFragment {
                sql,
                touches_window,
            })
        }
        _ => Ok(FilterFragment {
            sql: String::new(),
            touches_window: false,
        }),
    }
}

/// SQL text and reference label of one condition side.
fn operand_sql(
    graph: &ComputeGraph,
    config: &Config,
    operand: &FilterOperand,
) -> CompileResult<(String, Option<String>)> {
    match operand {
        FilterOperand::Parameter(token) => Ok((token.clone(), None)),
        FilterOperand::Literal(expr) => {
            let fragment = translate_expression(config, expr, Mode::Reference)?;
            Ok((fragment.column, expr.reference_label()))
        }
        FilterOperand::Node { input, metric } => {
            if let Some(label) = metric {
                return Ok((label.clone(), Some(label.clone())));
            }
            let label = node_reference(graph, config, input)?;
            Ok((label.clone(), Some(label)))
        }
    }
}

/// The name (or formula) a node's output is referenced by.
fn node_reference(graph: &ComputeGraph, config: &Config, id: &str) -> CompileResult<String> {
    let Some(node) = graph.get(id) else {
        return Ok(id.to_string());
    };
    match &node.kind {
        NodeKind::Expression { expression, alias } => match alias {
            Some(alias) => Ok(alias.clone()),
            None => Ok(translate_expression(config, expression, Mode::Reference)?.column),
        },
        NodeKind::Projection { columns } => Ok(columns
            .first()
            .and_then(|c| c.output_name())
            .unwrap_or(id)
            .to_string()),
        _ => Ok(id.to_string()),
    }
}
