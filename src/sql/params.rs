//! Typed query parameters.
//!
//! Numbers and booleans inline into the SQL text; strings and
//! homogeneous arrays become `{param_<i>: <Type>}` placeholders whose
//! values travel alongside the query. Names are assigned in insertion
//! order starting at `param_1`, and the outgoing map preserves it.

use serde_json::Value;

use crate::error::{CompileError, CompileResult};
use crate::query::{CompareOp, ConstantValue, ScalarValue};

/// Append-only table of parameter name → value.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    entries: Vec<(String, Value)>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    /// Insertion-ordered JSON map of the collected parameters.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        self.entries
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect()
    }

    /// Turn a constant into a SQL token: an inlined literal, or a typed
    /// placeholder backed by a parameter slot. `op` matters only for the
    /// LIKE family, which wraps string values as `%value%` here.
    pub fn create(&mut self, value: &ConstantValue, op: Option<CompareOp>) -> CompileResult<String> {
        match value {
            ConstantValue::Scalar(ScalarValue::Number(n)) => Ok(format_number(*n)),
            ConstantValue::Scalar(ScalarValue::Bool(b)) => {
                Ok(if *b { "1".to_string() } else { "0".to_string() })
            }
            ConstantValue::Scalar(ScalarValue::String(s)) => {
                let stored = if op.map(|o| o.is_like()).unwrap_or(false) {
                    format!("%{}%", s)
                } else {
                    s.clone()
                };
                Ok(self.push(Value::String(stored), "String"))
            }
            ConstantValue::List(items) if items.is_empty() => Ok("[]".to_string()),
            ConstantValue::List(items) => {
                let element_type = items[0].type_name();
                if items.iter().any(|i| i.type_name() != element_type) {
                    return Err(CompileError::MixedTypeArray);
                }
                let array_type = match element_type {
                    "String" => "Array(String)",
                    "Float64" => "Array(Float64)",
                    _ => "Array(Boolean)",
                };
                let stored = Value::Array(items.iter().map(|i| i.to_json()).collect());
                Ok(self.push(stored, array_type))
            }
        }
    }

    fn push(&mut self, value: Value, param_type: &str) -> String {
        let name = format!("param_{}", self.entries.len() + 1);
        let placeholder = format!("{{{}: {}}}", name, param_type);
        self.entries.push((name, value));
        placeholder
    }
}

/// Numbers inline verbatim, in their shortest decimal form.
fn format_number(n: f64) -> String {
    format!("{}", n)
}
