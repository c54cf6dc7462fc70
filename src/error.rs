//! Unified error type for the compiler core.
//!
//! None of these are recovered locally: the IR builder and optimizer
//! surface them up, and the SQL emitter raises the graph-invariant
//! variants (`CycleDetected`, `DanglingReference`) defensively.

use thiserror::Error;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Errors raised while compiling a query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Metric name not present in the column mappings.
    #[error("unknown metric: '{0}'")]
    UnknownMetric(String),

    /// Grouping dimension not present in the column mappings.
    #[error("grouping dimension not found: '{0}'")]
    GroupingDimensionNotFound(String),

    /// Join inference found no shared primary key between two tables.
    #[error("no common primary key between '{0}' and '{1}'")]
    NoCommonPrimaryKey(String, String),

    /// The graph contains a cycle. Impossible from a valid query; internal.
    #[error("cycle detected at node '{0}'")]
    CycleDetected(String),

    /// Array parameter whose elements are not all of one type.
    #[error("array parameter has mixed element types")]
    MixedTypeArray,

    /// Unreachable if the query passed schema validation; defensive.
    #[error("unsupported aggregation: '{0}'")]
    UnsupportedAggregation(String),

    /// A node names an input that is not in the graph; internal.
    #[error("dangling reference: node '{node}' names missing input '{input}'")]
    DanglingReference { node: String, input: String },
}
