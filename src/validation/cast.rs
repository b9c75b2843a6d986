//! Input casting
//!
//! Casts are applied before validation. Numeric strings parse to
//! numbers, common truthy/falsy strings parse to booleans, and arrays
//! cast element-wise. A failed cast is a per-property type error, not
//! a panic.

use serde_json::{Number, Value};

use crate::schema::DataType;

/// Cast a raw input value to a property's declared type.
///
/// Null passes through: it clears a field rather than failing a cast.
pub fn cast_value(value: &Value, data_type: DataType) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match data_type {
        DataType::String | DataType::Unique => cast_string(value),
        DataType::Boolean => cast_boolean(value),
        DataType::Integer => cast_integer(value),
        DataType::Float => cast_float(value),
        DataType::Object => {
            if value.is_object() {
                Ok(value.clone())
            } else {
                Err(format!("expected an object, got {}", type_name(value)))
            }
        }
        DataType::Relation => cast_relation(value),
        DataType::Function => match value {
            Value::String(_) | Value::Object(_) => Ok(value.clone()),
            other => Err(format!("expected code, got {}", type_name(other))),
        },
    }
}

fn cast_string(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::from(n.to_string())),
        Value::Bool(b) => Ok(Value::from(b.to_string())),
        other => Err(format!("expected a string, got {}", type_name(other))),
    }
}

fn cast_boolean(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::from(true)),
            "false" | "0" | "no" | "off" | "" => Ok(Value::from(false)),
            other => Err(format!("'{}' is not a boolean", other)),
        },
        Value::Number(n) => Ok(Value::from(n.as_f64().map_or(false, |f| f != 0.0))),
        other => Err(format!("expected a boolean, got {}", type_name(other))),
    }
}

fn cast_integer(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i))
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    Ok(Value::from(f as i64))
                } else {
                    Err(format!("{} is not an integer", f))
                }
            } else {
                Err("number out of integer range".into())
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("'{}' is not an integer", s)),
        other => Err(format!("expected an integer, got {}", type_name(other))),
    }
}

fn cast_float(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(n) => {
            let f = n.as_f64().ok_or("number out of float range")?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| "not a finite number".into())
        }
        Value::String(s) => {
            let f = s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", s))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' is not a finite number", s))
        }
        other => Err(format!("expected a number, got {}", type_name(other))),
    }
}

/// Relations store the target id; a full record value collapses to its id.
fn cast_relation(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(_) | Value::Number(_) => Ok(value.clone()),
        Value::Object(obj) => obj
            .get("id")
            .cloned()
            .ok_or_else(|| "related object has no id".into()),
        other => Err(format!("expected a record id, got {}", type_name(other))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
