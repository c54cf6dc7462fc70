//! End-to-end scenarios for the query → SQL pipeline.
//!
//! Each test drives `compile()` with a realistic screener query and pins
//! the shape of the generated SQL through substrings, plus the parameter
//! map contents and ordering.

use screener::compile::{compile, CompileOptions};
use screener::config::default_config;
use screener::error::CompileError;
use screener::query::UserQuery;

fn parse(json: &str) -> UserQuery {
    serde_json::from_str(json).expect("query json")
}

fn run(json: &str) -> screener::compile::CompileOutput {
    compile(&parse(json), default_config(), CompileOptions::default()).expect("compile")
}

fn run_risky(json: &str) -> screener::compile::CompileOutput {
    compile(
        &parse(json),
        default_config(),
        CompileOptions::default().with_risky(true),
    )
    .expect("compile risky")
}

// ============================================================================
// Scenario: simple equality filter
// ============================================================================

#[test]
fn test_sector_filter_with_limit() {
    let output = run(r#"{
        "id": "scr-1", "name": "tech screener", "status": "active",
        "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
        "limit": 100
    }"#);

    assert!(output.sql.contains("FROM tickers"), "sql:\n{}", output.sql);
    assert!(
        output.sql.contains("sector = {param_1: String}"),
        "sql:\n{}",
        output.sql
    );
    assert!(output.sql.contains("LIMIT 100"), "sql:\n{}", output.sql);
    assert_eq!(output.parameters["param_1"], "Technology");
    assert_eq!(output.parameters.len(), 1);
}

// ============================================================================
// Scenario: 30-day return, sorted
// ============================================================================

#[test]
fn test_thirty_day_return_sorted() {
    let output = run(r#"{
        "id": "scr-2", "name": "momentum", "status": "active",
        "filter": {
            "target": {
                "target": { "metric": "close" },
                "aggregation": "diff_pct",
                "time_range": { "type": "relative", "duration": 30, "unit": "day" },
                "alias": "return_30d"
            },
            "op": "gt",
            "value": 10
        },
        "sort_by": [{
            "expression": {
                "target": { "metric": "close" },
                "aggregation": "diff_pct",
                "time_range": { "type": "relative", "duration": 30, "unit": "day" },
                "alias": "return_30d"
            },
            "direction": "desc"
        }],
        "limit": 50
    }"#);

    let sql = &output.sql;
    assert!(sql.contains("WITH"), "sql:\n{}", sql);
    assert!(sql.contains("last_value"), "sql:\n{}", sql);
    assert!(sql.contains("first_value"), "sql:\n{}", sql);
    assert!(sql.contains("nullIf("), "sql:\n{}", sql);
    assert!(sql.contains("QUALIFY"), "sql:\n{}", sql);
    assert!(sql.contains("ORDER BY return_30d desc"), "sql:\n{}", sql);
    assert!(sql.contains("LIMIT 50"), "sql:\n{}", sql);
    // Numbers inline; only strings would create parameters.
    assert!(output.parameters.is_empty());
}

// ============================================================================
// Scenario: top-3 per sector with reference-data filters
// ============================================================================

const TOP_PER_SECTOR: &str = r#"{
    "id": "scr-3", "name": "sector leaders", "status": "active",
    "filter": {
        "operator": "and",
        "filters": [
            { "target": { "metric": "country" }, "op": "eq", "value": "United States" },
            { "target": { "metric": "active" }, "op": "eq", "value": 1 }
        ]
    },
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
}"#;

#[test]
fn test_top_three_per_sector() {
    let output = run(TOP_PER_SECTOR);

    let sql = &output.sql;
    assert!(sql.contains("LIMIT 3 BY sector"), "sql:\n{}", sql);
    assert!(sql.contains("GROUP BY sector"), "sql:\n{}", sql);
    assert!(sql.contains("LIMIT 100"), "sql:\n{}", sql);
    assert!(
        sql.contains("INNER JOIN daily_agg ON tickers.ticker = daily_agg.ticker"),
        "sql:\n{}",
        sql
    );
    assert!(
        sql.contains("(country = {param_1: String} AND active = 1)"),
        "sql:\n{}",
        sql
    );
    // The join registers tickers first, but tickers has no time column;
    // the PREWHERE cut lands on daily_agg's date column.
    assert!(
        sql.contains("PREWHERE date >= toDate(date_sub(now(), INTERVAL 90 DAY))"),
        "sql:\n{}",
        sql
    );
    assert_eq!(output.parameters["param_1"], "United States");
}

#[test]
fn test_risky_prunes_join_when_only_key_is_read() {
    let query = r#"{
        "id": "scr-3b", "name": "watchlist movers", "status": "active",
        "filter": { "target": { "metric": "ticker" }, "op": "in", "value": ["AAPL", "MSFT", "NVDA"] },
        "group_by": [{
            "dimension": "date",
            "limit": 3,
            "expression": {
                "target": { "metric": "close" },
                "aggregation": "diff",
                "time_range": { "type": "relative", "duration": 90, "unit": "day" }
            }
        }],
        "limit": 100
    }"#;

    let kept = run(query);
    assert!(kept.sql.contains("INNER JOIN"), "sql:\n{}", kept.sql);

    let pruned = run_risky(query);
    assert!(!pruned.sql.contains("INNER JOIN"), "sql:\n{}", pruned.sql);
    assert!(!pruned.sql.contains("tickers"), "sql:\n{}", pruned.sql);
    assert!(pruned.sql.contains("FROM daily_agg"), "sql:\n{}", pruned.sql);
    assert!(
        pruned.sql.contains("ticker IN {param_1: Array(String)}"),
        "sql:\n{}",
        pruned.sql
    );
}

// ============================================================================
// Scenario: band filter over one aggregate
// ============================================================================

#[test]
fn test_avg_band_composite() {
    let output = run(r#"{
        "id": "scr-4", "name": "price band", "status": "active",
        "filter": {
            "operator": "and",
            "filters": [
                {
                    "target": {
                        "target": { "metric": "close" },
                        "aggregation": "avg",
                        "time_range": { "type": "relative", "duration": 30, "unit": "day" }
                    },
                    "op": "gt", "value": 100
                },
                {
                    "target": {
                        "target": { "metric": "close" },
                        "aggregation": "avg",
                        "time_range": { "type": "relative", "duration": 30, "unit": "day" }
                    },
                    "op": "lt", "value": 200
                }
            ]
        }
    }"#);

    let sql = &output.sql;
    // One aggregate feeds both sides of the band.
    assert_eq!(sql.matches("avg(close) OVER").count(), 1, "sql:\n{}", sql);
    assert!(
        sql.contains("(avg_close_30_day > 100 AND avg_close_30_day < 200)"),
        "sql:\n{}",
        sql
    );
    assert!(sql.contains("QUALIFY"), "sql:\n{}", sql);
}

// ============================================================================
// Scenario: absolute time range
// ============================================================================

#[test]
fn test_absolute_range_prewhere_leeway() {
    // 2024-01-01T00:00:00Z .. 2024-12-31T00:00:00Z
    let output = run(r#"{
        "id": "scr-5", "name": "2024 gainers", "status": "active",
        "filter": {
            "target": {
                "target": { "metric": "close" },
                "aggregation": "diff_pct",
                "time_range": { "type": "absolute", "from": 1704067200, "to": 1735603200 }
            },
            "op": "gt",
            "value": 0
        }
    }"#);

    let sql = &output.sql;
    // PREWHERE reaches one day further back so `from` stays inclusive
    // under date truncation.
    assert!(
        sql.contains("BETWEEN toDate('2023-12-31') AND toDate('2024-12-31')"),
        "sql:\n{}",
        sql
    );
    assert!(
        sql.contains("BETWEEN toDate('2024-01-01') AND toDate('2024-12-31')"),
        "sql:\n{}",
        sql
    );
}

// ============================================================================
// Scenario: math over metrics
// ============================================================================

#[test]
fn test_math_ratio_inlines_numbers() {
    let output = run(r#"{
        "id": "scr-6", "name": "turnover", "status": "active",
        "filter": {
            "target": {
                "operator": "/",
                "operands": [ { "metric": "close" }, { "metric": "volume" } ]
            },
            "op": "gt",
            "value": 0.001
        }
    }"#);

    let sql = &output.sql;
    assert!(sql.contains("(close / volume)"), "sql:\n{}", sql);
    assert!(sql.contains("(close / volume) > 0.001"), "sql:\n{}", sql);
    assert!(output.parameters.is_empty());
}

// ============================================================================
// Scenario: trading-calendar window
// ============================================================================

#[test]
fn test_trading_window_row_frame_and_scaled_prewhere() {
    let output = run(r#"{
        "id": "scr-7", "name": "trading window", "status": "active",
        "filter": {
            "target": {
                "target": { "metric": "close" },
                "aggregation": "last",
                "time_range": { "type": "trading", "duration": 10, "unit": "day" }
            },
            "op": "gt",
            "value": 50
        }
    }"#);

    let sql = &output.sql;
    assert!(
        sql.contains("ROWS BETWEEN 9 PRECEDING AND CURRENT ROW"),
        "sql:\n{}",
        sql
    );
    // 10 trading days over-fetch to 15 calendar days in the PREWHERE cut.
    assert!(
        sql.contains("PREWHERE date >= toDate(date_sub(now(), INTERVAL 15 DAY))"),
        "sql:\n{}",
        sql
    );
}

// ============================================================================
// Determinism and error channel
// ============================================================================

#[test]
fn test_same_query_compiles_byte_identical() {
    let a = run(TOP_PER_SECTOR);
    let b = run(TOP_PER_SECTOR);
    assert_eq!(a.sql, b.sql);
    assert_eq!(a.parameters, b.parameters);
    assert_eq!(a.diagram, b.diagram);
}

#[test]
fn test_unknown_metric_surfaces() {
    let err = compile(
        &parse(
            r#"{
                "id": "scr-8", "name": "bad metric", "status": "active",
                "filter": { "target": { "metric": "pe_ratio" }, "op": "gt", "value": 10 }
            }"#,
        ),
        default_config(),
        CompileOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err, CompileError::UnknownMetric("pe_ratio".to_string()));
}

#[test]
fn test_unknown_dimension_surfaces() {
    let err = compile(
        &parse(
            r#"{
                "id": "scr-9", "name": "bad dimension", "status": "active",
                "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Tech" },
                "group_by": ["region"]
            }"#,
        ),
        default_config(),
        CompileOptions::default(),
    )
    .unwrap_err();
    assert_eq!(
        err,
        CompileError::GroupingDimensionNotFound("region".to_string())
    );
}

#[test]
fn test_mixed_array_surfaces() {
    let err = compile(
        &parse(
            r#"{
                "id": "scr-10", "name": "bad array", "status": "active",
                "filter": { "target": { "metric": "sector" }, "op": "in", "value": ["Tech", 1] }
            }"#,
        ),
        default_config(),
        CompileOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err, CompileError::MixedTypeArray);
}

#[test]
fn test_parameters_keep_encounter_order() {
    let output = run(r#"{
        "id": "scr-11", "name": "ordered params", "status": "active",
        "filter": {
            "operator": "and",
            "filters": [
                { "target": { "metric": "country" }, "op": "eq", "value": "United States" },
                { "target": { "metric": "name" }, "op": "contains", "value": "Corp" },
                { "target": { "metric": "sector" }, "op": "in", "value": ["Technology", "Energy"] }
            ]
        }
    }"#);

    let names: Vec<&String> = output.parameters.keys().collect();
    assert_eq!(names, vec!["param_1", "param_2", "param_3"]);
    assert_eq!(output.parameters["param_1"], "United States");
    // LIKE values are wrapped at parameter-creation time.
    assert_eq!(output.parameters["param_2"], "%Corp%");
    assert_eq!(
        output.parameters["param_3"],
        serde_json::json!(["Technology", "Energy"])
    );
    assert!(
        output.sql.contains("name LIKE {param_2: String}"),
        "sql:\n{}",
        output.sql
    );
}

#[test]
fn test_diagram_covers_the_graph() {
    let output = run(TOP_PER_SECTOR);
    let diagram = &output.diagram;
    assert!(diagram.starts_with("graph TD;"));
    assert!(diagram.contains("tickers"), "diagram:\n{}", diagram);
    assert!(diagram.contains("daily_agg"), "diagram:\n{}", diagram);
    assert!(diagram.contains("-->"), "diagram:\n{}", diagram);
    assert!(
        diagram.contains("Join tickers with daily_agg on ticker = ticker"),
        "diagram:\n{}",
        diagram
    );
}
