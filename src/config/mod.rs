//! Static compiler configuration: tables, metric mappings, limits.
//!
//! Loaded once at process start (TOML, `screener.toml`) or taken from the
//! built-in market-data default. Immutable after construction; each
//! compile call borrows it.
//!
//! Example configuration:
//! ```toml
//! max_limit = 1000
//!
//! [tables.daily_agg]
//! time_column = "date"
//! primary_keys = ["ticker"]
//! always_include_columns = ["ticker", "date"]
//!
//! [column_mappings.close]
//! table = "daily_agg"
//! column = "close"
//! type = "Float64"
//! timeseries = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Column data types the compiler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Float64,
    String,
    UInt8,
    Date,
    DateTime,
    #[serde(rename = "Array(String)")]
    ArrayString,
}

/// A physical table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableConfig {
    /// Column holding the row timestamp, if the table is time-series.
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    /// Columns projected into every query touching this table.
    #[serde(default)]
    pub always_include_columns: Vec<String>,
    #[serde(default)]
    pub other_columns: Vec<String>,
}

impl TableConfig {
    /// True if the table carries the named column.
    pub fn has_column(&self, name: &str) -> bool {
        self.primary_keys.iter().any(|c| c == name)
            || self.always_include_columns.iter().any(|c| c == name)
            || self.other_columns.iter().any(|c| c == name)
            || self.time_column.as_deref() == Some(name)
    }
}

/// Mapping from a metric name to a table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub table: String,
    pub column: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub timeseries: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_strategy: Option<String>,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tables: BTreeMap<String, TableConfig>,
    pub column_mappings: BTreeMap<String, ColumnMapping>,
    pub time_format: String,
    /// Largest relative window accepted for time-series aggregates, in days.
    pub max_timeseries_window: u32,
    pub max_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config::market_data()
    }
}

impl Config {
    /// The built-in market-data configuration: `tickers` (reference data)
    /// and `daily_agg` (daily bars) sharing primary key `ticker`.
    pub fn market_data() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            "tickers".to_string(),
            TableConfig {
                time_column: None,
                primary_keys: vec!["ticker".to_string()],
                always_include_columns: vec![],
                other_columns: vec![
                    "name".to_string(),
                    "sector".to_string(),
                    "industry".to_string(),
                    "country".to_string(),
                    "active".to_string(),
                ],
            },
        );
        tables.insert(
            "daily_agg".to_string(),
            TableConfig {
                time_column: Some("date".to_string()),
                primary_keys: vec!["ticker".to_string()],
                always_include_columns: vec!["ticker".to_string(), "date".to_string()],
                other_columns: vec![
                    "open".to_string(),
                    "high".to_string(),
                    "low".to_string(),
                    "close".to_string(),
                    "volume".to_string(),
                ],
            },
        );

        let mut column_mappings = BTreeMap::new();
        let mut map = |metric: &str, table: &str, column: &str, ty: ColumnType, ts: bool| {
            column_mappings.insert(
                metric.to_string(),
                ColumnMapping {
                    table: table.to_string(),
                    column: column.to_string(),
                    column_type: ty,
                    timeseries: ts,
                    join_strategy: None,
                },
            );
        };
        map("ticker", "tickers", "ticker", ColumnType::String, false);
        map("name", "tickers", "name", ColumnType::String, false);
        map("sector", "tickers", "sector", ColumnType::String, false);
        map("industry", "tickers", "industry", ColumnType::String, false);
        map("country", "tickers", "country", ColumnType::String, false);
        map("active", "tickers", "active", ColumnType::UInt8, false);
        map("date", "daily_agg", "date", ColumnType::Date, true);
        map("open", "daily_agg", "open", ColumnType::Float64, true);
        map("high", "daily_agg", "high", ColumnType::Float64, true);
        map("low", "daily_agg", "low", ColumnType::Float64, true);
        map("close", "daily_agg", "close", ColumnType::Float64, true);
        map("volume", "daily_agg", "volume", ColumnType::Float64, true);

        Config {
            tables,
            column_mappings,
            time_format: "%Y-%m-%d".to_string(),
            max_timeseries_window: 730,
            max_limit: 10_000,
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, or the market-data default if `path`
    /// is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?),
            None => Ok(Self::market_data()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (metric, mapping) in &self.column_mappings {
            if !self.tables.contains_key(&mapping.table) {
                return Err(ConfigError::InvalidConfig(format!(
                    "metric '{}' maps to unknown table '{}'",
                    metric, mapping.table
                )));
            }
        }
        Ok(())
    }

    /// Resolve a metric name to its column mapping.
    pub fn resolve_metric(&self, metric: &str) -> CompileResult<&ColumnMapping> {
        self.column_mappings
            .get(metric)
            .ok_or_else(|| CompileError::UnknownMetric(metric.to_string()))
    }

    /// Resolve a grouping dimension to its column mapping.
    pub fn resolve_dimension(&self, dimension: &str) -> CompileResult<&ColumnMapping> {
        self.column_mappings
            .get(dimension)
            .ok_or_else(|| CompileError::GroupingDimensionNotFound(dimension.to_string()))
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name)
    }

    /// A primary key shared by both tables, if any.
    pub fn shared_primary_key(&self, table_a: &str, table_b: &str) -> Option<String> {
        let a = self.tables.get(table_a)?;
        let b = self.tables.get(table_b)?;
        a.primary_keys
            .iter()
            .find(|pk| b.primary_keys.contains(pk))
            .cloned()
    }

    /// How many of the given tables carry a column of this name. Used to
    /// decide whether an emitted column must be table-qualified.
    pub fn tables_with_column(&self, tables: &[String], column: &str) -> usize {
        tables
            .iter()
            .filter(|t| {
                self.tables
                    .get(*t)
                    .map(|c| c.has_column(column))
                    .unwrap_or(false)
            })
            .count()
    }
}

static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::market_data);

/// The process-wide default configuration.
pub fn default_config() -> &'static Config {
    &DEFAULT_CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_data_defaults() {
        let config = Config::market_data();
        assert!(config.tables.contains_key("tickers"));
        assert!(config.tables.contains_key("daily_agg"));
        assert_eq!(
            config.shared_primary_key("tickers", "daily_agg").as_deref(),
            Some("ticker")
        );
        let daily = config.table("daily_agg").unwrap();
        assert_eq!(daily.time_column.as_deref(), Some("date"));
        assert_eq!(daily.always_include_columns, vec!["ticker", "date"]);
    }

    #[test]
    fn test_resolve_metric() {
        let config = Config::market_data();
        let close = config.resolve_metric("close").unwrap();
        assert_eq!(close.table, "daily_agg");
        assert!(close.timeseries);

        let err = config.resolve_metric("pe_ratio").unwrap_err();
        assert_eq!(err, CompileError::UnknownMetric("pe_ratio".to_string()));
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_text = r#"
            max_limit = 500

            [tables.tickers]
            primary_keys = ["ticker"]
            other_columns = ["sector"]

            [column_mappings.sector]
            table = "tickers"
            column = "sector"
            type = "String"
        "#;

        let config = Config::from_toml_str(toml_text).unwrap();
        assert_eq!(config.max_limit, 500);
        assert_eq!(config.resolve_metric("sector").unwrap().table, "tickers");
    }

    #[test]
    fn test_toml_rejects_unknown_table() {
        let toml_text = r#"
            [column_mappings.close]
            table = "bars"
            column = "close"
            type = "Float64"
        "#;
        assert!(Config::from_toml_str(toml_text).is_err());
    }

    #[test]
    fn test_column_ambiguity() {
        let config = Config::market_data();
        let tables = vec!["tickers".to_string(), "daily_agg".to_string()];
        assert_eq!(config.tables_with_column(&tables, "ticker"), 2);
        assert_eq!(config.tables_with_column(&tables, "sector"), 1);
    }
}
