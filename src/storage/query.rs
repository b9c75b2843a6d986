//! Query model and the in-memory evaluator
//!
//! Filters are equality or IN; matching is strict, no type coercion.
//! The evaluator is shared by the file backend and by the client-side
//! fallbacks of the remote backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::record::Record;

/// Filter operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    /// value = V
    Eq(Value),
    /// value ∈ set
    In(Vec<Value>),
}

/// Equality/IN predicate over one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq(value),
        }
    }

    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In(values),
        }
    }

    /// Strict match against a record. Missing fields never match.
    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = field_value(record, &self.field) else {
            return false;
        };
        match &self.op {
            FilterOp::Eq(expected) => &actual == expected,
            FilterOp::In(set) => set.contains(&actual),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl std::str::FromStr for SortDir {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(format!("invalid sort direction '{}'", other)),
        }
    }
}

/// Sort / pagination options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub sort: Option<String>,
    pub sort_dir: SortDir,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QueryOptions {
    pub fn sorted_by(field: impl Into<String>, dir: SortDir) -> Self {
        Self {
            sort: Some(field.into()),
            sort_dir: dir,
            ..Self::default()
        }
    }
}

/// Resolve a field on a record, treating id and class_id as fields
pub fn field_value(record: &Record, field: &str) -> Option<Value> {
    match field {
        "id" => record.id.as_ref().map(|id| id.to_value()),
        "class_id" => Some(Value::from(record.class_id.clone())),
        other => record.get(other).cloned(),
    }
}

/// Apply filters, sort, offset, and limit in contract order
pub fn apply_query(
    mut records: Vec<Record>,
    filters: &[Filter],
    options: &QueryOptions,
) -> Vec<Record> {
    records.retain(|record| filters.iter().all(|f| f.matches(record)));

    if let Some(sort_field) = &options.sort {
        records.sort_by(|a, b| {
            let cmp = compare_values(
                field_value(a, sort_field).as_ref(),
                field_value(b, sort_field).as_ref(),
            );
            match options.sort_dir {
                SortDir::Asc => cmp,
                SortDir::Desc => cmp.reverse(),
            }
        });
    }

    let offset = options.offset.min(records.len());
    let mut page: Vec<Record> = records.drain(offset..).collect();
    if let Some(limit) = options.limit {
        page.truncate(limit);
    }
    page
}

/// Total order over JSON values for sorting:
/// null < bool < number < string < array < object; missing sorts first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => {
                let xf = x.as_f64().unwrap_or(f64::NAN);
                let yf = y.as_f64().unwrap_or(f64::NAN);
                xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
