//! Query-string parsing
//!
//! `GET /query/{class}?k=v&_sort=f&_order=asc|desc&_limit=N&_offset=M`
//! Plain pairs become equality filters; a comma-separated value is an
//! IN set. Values parse to booleans and numbers where they look like
//! them, strings otherwise — matching is strict afterwards.

use std::collections::HashMap;

use serde_json::Value;

use crate::core::error::{EngineError, EngineResult};
use crate::storage::{Filter, QueryOptions, SortDir};

const SORT: &str = "_sort";
const ORDER: &str = "_order";
const LIMIT: &str = "_limit";
const OFFSET: &str = "_offset";

pub fn parse_query(params: &HashMap<String, String>) -> EngineResult<(Vec<Filter>, QueryOptions)> {
    let mut filters = Vec::new();
    let mut options = QueryOptions::default();

    for (key, raw) in params {
        match key.as_str() {
            SORT => options.sort = Some(raw.clone()),
            ORDER => {
                options.sort_dir = raw
                    .parse::<SortDir>()
                    .map_err(EngineError::InvalidParams)?;
            }
            LIMIT => {
                options.limit = Some(raw.parse::<usize>().map_err(|_| {
                    EngineError::InvalidParams(format!("invalid _limit '{}'", raw))
                })?);
            }
            OFFSET => {
                options.offset = raw.parse::<usize>().map_err(|_| {
                    EngineError::InvalidParams(format!("invalid _offset '{}'", raw))
                })?;
            }
            field => {
                if raw.contains(',') {
                    let values = raw.split(',').map(parse_literal).collect();
                    filters.push(Filter::in_list(field, values));
                } else {
                    filters.push(Filter::eq(field, parse_literal(raw)));
                }
            }
        }
    }

    Ok((filters, options))
}

/// Booleans and numbers when they parse, strings otherwise.
fn parse_literal(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(f) {
            return Value::Number(number);
        }
    }
    Value::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equality_filters_with_typed_literals() {
        let (filters, _) =
            parse_query(&params(&[("age", "30"), ("active", "true"), ("name", "Al")])).unwrap();
        assert_eq!(filters.len(), 3);
        assert!(filters.contains(&Filter::eq("age", json!(30))));
        assert!(filters.contains(&Filter::eq("active", json!(true))));
        assert!(filters.contains(&Filter::eq("name", json!("Al"))));
    }

    #[test]
    fn test_comma_means_in() {
        let (filters, _) = parse_query(&params(&[("status", "open,closed")])).unwrap();
        assert_eq!(
            filters[0],
            Filter::in_list("status", vec![json!("open"), json!("closed")])
        );
    }

    #[test]
    fn test_sort_and_paging() {
        let (_, options) = parse_query(&params(&[
            ("_sort", "age"),
            ("_order", "desc"),
            ("_limit", "10"),
            ("_offset", "20"),
        ]))
        .unwrap();
        assert_eq!(options.sort.as_deref(), Some("age"));
        assert_eq!(options.sort_dir, SortDir::Desc);
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.offset, 20);
    }

    #[test]
    fn test_bad_paging_params_rejected() {
        assert!(parse_query(&params(&[("_limit", "lots")])).is_err());
        assert!(parse_query(&params(&[("_order", "sideways")])).is_err());
    }
}
