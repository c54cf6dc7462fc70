//! HTTP surface: request/response payloads and schema validation.
//!
//! Thin glue over the core. The compiler itself only ever sees a
//! [`crate::query::UserQuery`] that passed [`validate_query`].

pub mod server;

use serde::Serialize;

use crate::config::Config;
use crate::query::{Filter, TimeRange, UserQuery};

/// One schema violation, `path` pointing into the request body.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetail {
    pub path: String,
    pub message: String,
}

impl ValidationDetail {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a deserialized query against the schema rules the core
/// assumes. Returns every violation, not just the first.
pub fn validate_query(query: &UserQuery, config: &Config) -> Vec<ValidationDetail> {
    let mut details = Vec::new();

    if query.id.trim().is_empty() {
        details.push(ValidationDetail::new("id", "must be a non-empty string"));
    }
    if query.name.trim().is_empty() {
        details.push(ValidationDetail::new("name", "must be a non-empty string"));
    }
    if let Some(limit) = query.limit {
        if limit == 0 {
            details.push(ValidationDetail::new("limit", "must be a positive integer"));
        } else if limit > config.max_limit {
            details.push(ValidationDetail::new(
                "limit",
                format!("must not exceed {}", config.max_limit),
            ));
        }
    }

    validate_filter(&query.filter, "filter", &mut details);

    if let Some(group_by) = &query.group_by {
        for (i, criterion) in group_by.iter().enumerate() {
            if let crate::query::GroupBy::TopN(group) = criterion {
                if group.limit == 0 {
                    details.push(ValidationDetail::new(
                        &format!("group_by[{}].limit", i),
                        "must be a positive integer",
                    ));
                }
            }
        }
    }

    details
}

fn validate_filter(filter: &Filter, path: &str, details: &mut Vec<ValidationDetail>) {
    match filter {
        Filter::Composite(composite) => {
            match composite.operator {
                crate::query::BoolOp::Not if composite.filters.len() != 1 => {
                    details.push(ValidationDetail::new(
                        path,
                        "'not' takes exactly one child filter",
                    ));
                }
                _ if composite.filters.is_empty() => {
                    details.push(ValidationDetail::new(
                        path,
                        "composite filter needs at least one child",
                    ));
                }
                _ => {}
            }
            for (i, child) in composite.filters.iter().enumerate() {
                validate_filter(child, &format!("{}.filters[{}]", path, i), details);
            }
        }
        Filter::Simple(simple) => {
            validate_time_ranges(&simple.target, &format!("{}.target", path), details);
            validate_time_ranges(&simple.value, &format!("{}.value", path), details);
        }
    }
}

fn validate_time_ranges(
    expr: &crate::query::Expression,
    path: &str,
    details: &mut Vec<ValidationDetail>,
) {
    use crate::query::Expression;
    match expr {
        Expression::Aggregate(agg) => {
            match &agg.time_range {
                Some(TimeRange::Relative { duration, .. })
                | Some(TimeRange::Trading { duration, .. })
                    if *duration == 0 =>
                {
                    details.push(ValidationDetail::new(
                        &format!("{}.time_range.duration", path),
                        "must be positive",
                    ));
                }
                Some(TimeRange::Absolute { from, to }) if from > to => {
                    details.push(ValidationDetail::new(
                        &format!("{}.time_range", path),
                        "'from' must not be after 'to'",
                    ));
                }
                _ => {}
            }
            validate_time_ranges(&agg.target, &format!("{}.target", path), details);
        }
        Expression::Math(math) => {
            for (i, operand) in math.operands.iter().enumerate() {
                validate_time_ranges(operand, &format!("{}.operands[{}]", path, i), details);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    fn query(json: &str) -> UserQuery {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_valid_query_passes() {
        let q = query(
            r#"{
                "id": "q1", "name": "tech", "status": "active",
                "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
                "limit": 100
            }"#,
        );
        assert!(validate_query(&q, default_config()).is_empty());
    }

    #[test]
    fn test_empty_id_and_oversized_limit_flagged() {
        let q = query(
            r#"{
                "id": "", "name": "tech", "status": "active",
                "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
                "limit": 99999999
            }"#,
        );
        let details = validate_query(&q, default_config());
        assert!(details.iter().any(|d| d.path == "id"));
        assert!(details.iter().any(|d| d.path == "limit"));
    }

    #[test]
    fn test_not_composite_arity() {
        let q = query(
            r#"{
                "id": "q1", "name": "tech", "status": "active",
                "filter": {
                    "operator": "not",
                    "filters": [
                        { "target": { "metric": "sector" }, "op": "eq", "value": "Tech" },
                        { "target": { "metric": "country" }, "op": "eq", "value": "US" }
                    ]
                }
            }"#,
        );
        let details = validate_query(&q, default_config());
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].path, "filter");
    }
}
