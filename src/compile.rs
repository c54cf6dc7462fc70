//! End-to-end compilation from a validated query to SQL and a diagram.
//!
//! ```text
//! UserQuery → IR builder → raw graph → join inference → optimizer
//!           → SQL planner → (SQL text, parameters)
//!                         ↘ diagram renderer
//! ```
//!
//! # Example
//!
//! ```
//! use screener::compile::{compile, CompileOptions};
//! use screener::config::default_config;
//! use screener::query::UserQuery;
//!
//! let query: UserQuery = serde_json::from_str(r#"{
//!     "id": "q1",
//!     "name": "tech large caps",
//!     "status": "active",
//!     "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
//!     "limit": 100
//! }"#).unwrap();
//!
//! let output = compile(&query, default_config(), CompileOptions::default()).unwrap();
//! assert!(output.sql.contains("LIMIT 100"));
//! assert_eq!(output.parameters["param_1"], "Technology");
//! ```

use tracing::debug;

use crate::config::Config;
use crate::diagram;
use crate::error::CompileResult;
use crate::lowering::GraphBuilder;
use crate::planner::optimizer::optimize;
use crate::query::UserQuery;
use crate::sql::SqlPlanner;

/// Options for compilation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Enable the join-structure rewrites; safe only under the
    /// conditions they pattern-match.
    pub risky: bool,
}

impl CompileOptions {
    pub fn with_risky(mut self, risky: bool) -> Self {
        self.risky = risky;
        self
    }
}

/// Result of compiling a query.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The SQL statement, with `{param_<i>: <Type>}` placeholders inline.
    pub sql: String,
    /// Parameter name → value, in insertion order.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Mermaid rendering of the optimized compute graph.
    pub diagram: String,
}

/// Compile a validated query against the given configuration.
///
/// The graph, parameter table, and node counters live for this one call;
/// nothing is shared across calls except the read-only config.
pub fn compile(
    query: &UserQuery,
    config: &Config,
    options: CompileOptions,
) -> CompileResult<CompileOutput> {
    // Step 1: lower the query into the compute graph.
    let (mut graph, params) = GraphBuilder::new(config).build(query)?;
    debug!(query = %query.id, nodes = graph.len(), "graph built");

    // Step 2: rewrite passes.
    optimize(&mut graph, config, options.risky)?;
    debug!(query = %query.id, nodes = graph.len(), risky = options.risky, "graph optimized");

    // Step 3: SQL emission.
    let sql = SqlPlanner::new(&graph, config).emit()?;

    // Step 4: diagram over the same optimized graph.
    let diagram = diagram::render(&graph);

    Ok(CompileOutput {
        sql,
        parameters: params.to_map(),
        diagram,
    })
}
