//! Assembling the final SQL statement.
//!
//! Each CTE group from the planner becomes one `cte_<i>` body; the main
//! SELECT reads the top-level groups. Fragments are collected into lists
//! and joined once at the end — placement decisions (WHERE vs QUALIFY,
//! PREWHERE, LIMIT BY) never interleave with string writing.
//!
//! Clause order: `SELECT … FROM … [PREWHERE] [WHERE] [QUALIFY]
//! [GROUP BY] [ORDER BY] [LIMIT … BY …] [LIMIT …]`.

use std::collections::HashSet;

use crate::config::Config;
use crate::error::CompileResult;
use crate::graph::{ComputeGraph, ComputeNode, NodeId, NodeKind, SortKey};
use crate::planner::cte;
use crate::query::{TimeRange, TimeUnit};
use crate::sql::translate::{self, format_date, Mode};

/// Emits SQL for one optimized graph.
pub struct SqlPlanner<'a> {
    graph: &'a ComputeGraph,
    config: &'a Config,
}

impl<'a> SqlPlanner<'a> {
    pub fn new(graph: &'a ComputeGraph, config: &'a Config) -> Self {
        Self { graph, config }
    }

    /// Emit the full statement.
    pub fn emit(&self) -> CompileResult<String> {
        // Surfaces CycleDetected / DanglingReference before any text is
        // produced.
        self.graph.execution_order()?;

        let plan = cte::plan(self.graph)?;
        let window_aliases = self.window_aliases();
        let largest_range = self.largest_time_range();

        let mut bodies: Vec<String> = Vec::with_capacity(plan.groups.len());
        let mut cte_columns: Vec<Vec<String>> = Vec::with_capacity(plan.groups.len());
        for group in &plan.groups {
            let (body, exposed) = self.emit_scope(
                &group.members,
                &group.refs,
                &cte_columns,
                &window_aliases,
                largest_range.as_ref(),
                false,
            )?;
            bodies.push(body);
            cte_columns.push(exposed);
        }

        let (main, _) = self.emit_scope(
            &plan.main,
            &plan.top_level(),
            &cte_columns,
            &window_aliases,
            largest_range.as_ref(),
            true,
        )?;

        if bodies.is_empty() {
            return Ok(main);
        }

        let mut out: Vec<String> = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            let prefix = if i == 0 { "WITH " } else { ", " };
            out.push(format!("{}cte_{} AS (\n{}\n)", prefix, i, body));
        }
        Ok(format!("{}\n{}", out.join(""), main))
    }

    /// Output names of every windowed aggregate in the graph. Predicates
    /// over these names go to QUALIFY in every scope.
    fn window_aliases(&self) -> HashSet<String> {
        self.graph
            .nodes()
            .filter(|n| n.windowed_aggregate().is_some())
            .filter_map(|n| n.expression_alias().map(str::to_string))
            .collect()
    }

    /// Widest time range over all windowed aggregates; drives PREWHERE.
    fn largest_time_range(&self) -> Option<TimeRange> {
        let mut largest: Option<TimeRange> = None;
        for node in self.graph.nodes() {
            let Some(agg) = node.windowed_aggregate() else {
                continue;
            };
            let Some(range) = &agg.time_range else {
                continue;
            };
            let wider = largest
                .as_ref()
                .map(|l| range.span_seconds() > l.span_seconds())
                .unwrap_or(true);
            if wider {
                largest = Some(range.clone());
            }
        }
        largest
    }

    // ========================================================================
    // Scope emission
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn emit_scope(
        &self,
        members: &[NodeId],
        refs: &[usize],
        cte_columns: &[Vec<String>],
        window_aliases: &HashSet<String>,
        largest_range: Option<&TimeRange>,
        is_main: bool,
    ) -> CompileResult<(String, Vec<String>)> {
        let nodes: Vec<&ComputeNode> = members.iter().filter_map(|m| self.graph.get(m)).collect();

        let sources: Vec<(&str, Option<&str>)> = nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Source { table, time_column } => {
                    Some((table.as_str(), time_column.as_deref()))
                }
                _ => None,
            })
            .collect();
        let scope_tables: Vec<String> = sources.iter().map(|(t, _)| t.to_string()).collect();
        let join_node = nodes.iter().find(|n| n.is_join());

        let from_items = scope_tables.len() + refs.len();

        // --- FROM ------------------------------------------------------------
        let mut from_lines: Vec<String> = Vec::new();
        let mut emitted_tables: Vec<String> = Vec::new();
        for (table, _) in &sources {
            if emitted_tables.is_empty() {
                from_lines.push(format!("FROM {}", table));
            } else {
                from_lines.push(self.join_line(join_node, &emitted_tables, table));
            }
            emitted_tables.push(table.to_string());
        }
        for (k, r) in refs.iter().enumerate() {
            let name = cte_name(*r);
            if emitted_tables.is_empty() && k == 0 {
                from_lines.push(format!("FROM {}", name));
            } else if let Some(line) =
                self.cte_join_line(&scope_tables, &name, cte_columns.get(*r))
            {
                from_lines.push(line);
            } else {
                from_lines.push(format!("CROSS JOIN {}", name));
            }
        }

        // --- SELECT ----------------------------------------------------------
        let mut select: Vec<String> = Vec::new();
        let mut exposed: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut where_parts: Vec<String> = Vec::new();

        for r in refs {
            let name = cte_name(*r);
            for column in cte_columns.get(*r).map(|c| c.as_slice()).unwrap_or(&[]) {
                if seen.insert(column.clone()) {
                    if is_main {
                        select.push(format!("{}.{} AS {}", name, column, column));
                    } else if from_items > 1 {
                        select.push(format!("{}.{}", name, column));
                    } else {
                        select.push(column.clone());
                    }
                    exposed.push(column.clone());
                } else if is_main {
                    select.push(format!("{}.{}", name, column));
                }
            }
        }

        for node in nodes.iter().filter(|n| n.is_projection()) {
            for column in node.projection_columns() {
                if let Some(name) = column.name.as_deref() {
                    let output = column.output_name().unwrap_or(name).to_string();
                    if !seen.insert(output.clone()) {
                        continue;
                    }
                    let reference = self.qualified_column(&scope_tables, name);
                    if output == reference {
                        select.push(reference);
                    } else {
                        select.push(format!("{} AS {}", reference, output));
                    }
                    exposed.push(output);
                } else if let Some(expr) = &column.expression {
                    let fragment =
                        translate::translate_expression(self.config, expr, Mode::Full)?;
                    push_unique(&mut where_parts, fragment.where_parts);
                    match &column.alias {
                        Some(alias) => {
                            if seen.insert(alias.clone()) {
                                select.push(format!("{} AS {}", fragment.column, alias));
                                exposed.push(alias.clone());
                            }
                        }
                        None => {
                            if !select.contains(&fragment.column) {
                                select.push(fragment.column);
                            }
                        }
                    }
                }
            }
        }

        for node in nodes
            .iter()
            .filter(|n| n.is_expression() && !n.meta.parameter)
        {
            let Some(expression) = node.expression() else {
                continue;
            };
            let fragment = translate::translate_expression(self.config, expression, Mode::Full)?;
            push_unique(&mut where_parts, fragment.where_parts);
            match node.expression_alias() {
                Some(alias) => {
                    if seen.insert(alias.to_string()) {
                        select.push(format!("{} AS {}", fragment.column, alias));
                        exposed.push(alias.to_string());
                    }
                }
                None => {
                    if !select.contains(&fragment.column) {
                        select.push(fragment.column);
                    }
                }
            }
        }

        if select.is_empty() {
            select.push("*".to_string());
        }

        // --- Predicates ------------------------------------------------------
        let mut qualify_parts: Vec<String> = Vec::new();
        for node in nodes.iter().filter(|n| n.is_filter_like()) {
            let consumed_by_member_composite = nodes.iter().any(|m| {
                matches!(m.kind, NodeKind::CompositeFilter { .. })
                    && m.inputs.iter().any(|i| i == &node.id)
            });
            if consumed_by_member_composite {
                continue;
            }
            let fragment =
                translate::translate_filter(self.graph, self.config, &node.id, window_aliases)?;
            if fragment.sql.is_empty() {
                continue;
            }
            if fragment.touches_window {
                push_unique(&mut qualify_parts, vec![fragment.sql]);
            } else {
                push_unique(&mut where_parts, vec![fragment.sql]);
            }
        }

        // --- PREWHERE --------------------------------------------------------
        let prewhere = if let Some(range) = largest_range {
            sources
                .iter()
                .find_map(|(_, time)| *time)
                .map(|time| prewhere_clause(time, range))
        } else {
            None
        };

        // --- GROUP BY / ORDER BY / LIMIT -------------------------------------
        let mut group_by: Vec<String> = Vec::new();
        let mut limit_by_lines: Vec<String> = Vec::new();
        let mut limit_lines: Vec<String> = Vec::new();
        for node in &nodes {
            let NodeKind::Limit { limit } = &node.kind else {
                continue;
            };
            match node.meta.group_dimension.as_deref() {
                Some(dimension) if node.meta.grouped => {
                    limit_by_lines.push(format!("LIMIT {} BY {}", limit, dimension));
                    if !group_by.contains(&dimension.to_string()) {
                        group_by.push(dimension.to_string());
                    }
                }
                _ => {
                    let mut line = format!("LIMIT {}", limit);
                    if let Some(offset) = node.meta.offset {
                        line.push_str(&format!(" OFFSET {}", offset));
                    }
                    limit_lines.push(line);
                }
            }
        }

        let mut order_by: Vec<String> = Vec::new();
        for node in &nodes {
            let NodeKind::Sort { criteria } = &node.kind else {
                continue;
            };
            for criterion in criteria {
                let label = match &criterion.key {
                    SortKey::Literal(text) => text.clone(),
                    SortKey::Node(id) => self.sort_reference(id)?,
                };
                order_by.push(format!("{} {}", label, criterion.direction.as_str()));
            }
        }

        // --- Assembly --------------------------------------------------------
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("SELECT\n  {}", select.join(",\n  ")));
        lines.extend(from_lines);
        if let Some(prewhere) = prewhere {
            lines.push(format!("PREWHERE {}", prewhere));
        }
        if !where_parts.is_empty() {
            lines.push(format!("WHERE {}", where_parts.join(" AND ")));
        }
        if !qualify_parts.is_empty() {
            lines.push(format!("QUALIFY {}", qualify_parts.join(" AND ")));
        }
        if !group_by.is_empty() {
            lines.push(format!("GROUP BY {}", group_by.join(", ")));
        }
        if !order_by.is_empty() {
            lines.push(format!("ORDER BY {}", order_by.join(", ")));
        }
        lines.extend(limit_by_lines);
        lines.extend(limit_lines);

        Ok((lines.join("\n"), exposed))
    }

    /// JOIN line for an additional source table, using the join node's
    /// conditions against any table already in the FROM chain.
    fn join_line(
        &self,
        join_node: Option<&&ComputeNode>,
        emitted: &[String],
        table: &str,
    ) -> String {
        if let Some(node) = join_node {
            if let NodeKind::Join {
                join_type,
                conditions,
            } = &node.kind
            {
                for condition in conditions {
                    let forward = emitted.contains(&condition.left_table)
                        && condition.right_table == table;
                    let backward = emitted.contains(&condition.right_table)
                        && condition.left_table == table;
                    if forward || backward {
                        return format!(
                            "{} {} ON {}.{} = {}.{}",
                            join_type.sql(),
                            table,
                            condition.left_table,
                            condition.left_column,
                            condition.right_table,
                            condition.right_column
                        );
                    }
                }
            }
        }
        format!("CROSS JOIN {}", table)
    }

    /// JOIN line tying a referenced CTE to the scope's tables through a
    /// shared primary key the CTE exposes.
    fn cte_join_line(
        &self,
        scope_tables: &[String],
        cte: &str,
        cte_columns: Option<&Vec<String>>,
    ) -> Option<String> {
        let columns = cte_columns?;
        for table in scope_tables {
            let table_config = self.config.table(table)?;
            for pk in &table_config.primary_keys {
                if columns.contains(pk) {
                    return Some(format!(
                        "INNER JOIN {} ON {}.{} = {}.{}",
                        cte, table, pk, cte, pk
                    ));
                }
            }
        }
        None
    }

    /// Table-qualify a column when several scope tables carry it.
    fn qualified_column(&self, scope_tables: &[String], name: &str) -> String {
        if scope_tables.len() > 1 && self.config.tables_with_column(scope_tables, name) > 1 {
            let owner = self
                .config
                .column_mappings
                .values()
                .find(|m| m.column == name && scope_tables.contains(&m.table))
                .map(|m| m.table.clone())
                .unwrap_or_else(|| scope_tables[0].clone());
            format!("{}.{}", owner, name)
        } else {
            name.to_string()
        }
    }

    fn sort_reference(&self, id: &str) -> CompileResult<String> {
        let Some(node) = self.graph.get(id) else {
            return Ok(id.to_string());
        };
        match &node.kind {
            NodeKind::Expression { expression, alias } => match alias {
                Some(alias) => Ok(alias.clone()),
                None => Ok(translate::translate_expression(
                    self.config,
                    expression,
                    Mode::Reference,
                )?
                .column),
            },
            NodeKind::Projection { columns } => Ok(columns
                .first()
                .and_then(|c| c.output_name())
                .unwrap_or(id)
                .to_string()),
            _ => Ok(id.to_string()),
        }
    }
}

fn cte_name(index: usize) -> String {
    format!("cte_{}", index)
}

fn push_unique(target: &mut Vec<String>, parts: Vec<String>) {
    for part in parts {
        if !target.contains(&part) {
            target.push(part);
        }
    }
}

/// Coarse time cut on the scope's time column. The one-day leeway on
/// absolute ranges keeps `from` inclusive under date truncation.
fn prewhere_clause(time: &str, range: &TimeRange) -> String {
    match range {
        TimeRange::Relative { duration, unit, .. } => format!(
            "{} >= toDate(date_sub(now(), INTERVAL {} {}))",
            time,
            duration,
            unit.sql()
        ),
        TimeRange::Trading { duration, unit, .. } => {
            let scaled = scaled_trading_duration(*duration, *unit);
            format!(
                "{} >= toDate(date_sub(now(), INTERVAL {} {}))",
                time,
                scaled,
                unit.sql()
            )
        }
        TimeRange::Absolute { from, to } => format!(
            "{} BETWEEN toDate('{}') AND toDate('{}')",
            time,
            format_date(*from - 86_400),
            format_date(*to)
        ),
    }
}

/// Trading windows over-fetch by the ranking multiplier, rounded up, so
/// the date cut always covers the row-count frame.
fn scaled_trading_duration(duration: u32, unit: TimeUnit) -> u32 {
    (f64::from(duration) * unit.trading_multiplier()).ceil() as u32
}
