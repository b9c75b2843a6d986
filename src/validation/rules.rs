//! Per-property rule validators
//!
//! Rules are configured on a prop's `validators` sequence, either as a
//! bare name ("email") or as an object `{"type": "length", "min": 2}`.
//! Entries referencing `@function` records are forwarded opaquely and
//! never run here. The `unique` rule needs storage access and is
//! handled by the builder.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::validation::cast::type_name;

/// A rule failure: (code, message)
pub type RuleFailure = (String, String);

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap())
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://\S+$").unwrap())
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9][0-9 ()./-]{5,}$").unwrap())
}

/// Whether a configured validator entry is a `@function` reference.
pub fn is_function_rule(rule: &Value) -> bool {
    match rule {
        Value::Object(obj) => {
            obj.contains_key("function_id") || obj.contains_key("code")
        }
        Value::String(s) => s.starts_with("@function"),
        _ => false,
    }
}

/// The rule's name, for dispatch.
pub fn rule_name(rule: &Value) -> Option<String> {
    match rule {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("type")
            .or_else(|| obj.get("rule"))
            .and_then(Value::as_str)
            .map(String::from),
        _ => None,
    }
}

/// Run one inline rule against an already-cast value.
pub fn run_rule(rule: &Value, value: &Value) -> Result<(), RuleFailure> {
    // unset values are the `required` rule's concern, not ours
    if value.is_null() {
        return Ok(());
    }

    let Some(name) = rule_name(rule) else {
        return Ok(());
    };
    let params = rule.as_object();

    match name.as_str() {
        "email" => check_pattern(value, email_regex(), "email", "is not a valid email address"),
        "url" => check_pattern(value, url_regex(), "url", "is not a valid URL"),
        "phone" => check_pattern(value, phone_regex(), "phone", "is not a valid phone number"),
        "length" => {
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                other => {
                    return Err((
                        "length".into(),
                        format!("length applies to strings and arrays, got {}", type_name(other)),
                    ))
                }
            };
            let min = param_usize(params, "min");
            let max = param_usize(params, "max");
            if let Some(min) = min {
                if len < min {
                    return Err(("length".into(), format!("length {} is below minimum {}", len, min)));
                }
            }
            if let Some(max) = max {
                if len > max {
                    return Err(("length".into(), format!("length {} exceeds maximum {}", len, max)));
                }
            }
            Ok(())
        }
        "range" => {
            let Some(n) = value.as_f64() else {
                return Err(("range".into(), format!("range applies to numbers, got {}", type_name(value))));
            };
            let min = param_f64(params, "min");
            let max = param_f64(params, "max");
            if let Some(min) = min {
                if n < min {
                    return Err(("range".into(), format!("{} is below minimum {}", n, min)));
                }
            }
            if let Some(max) = max {
                if n > max {
                    return Err(("range".into(), format!("{} exceeds maximum {}", n, max)));
                }
            }
            Ok(())
        }
        "pattern" => {
            let pattern = params
                .and_then(|p| p.get("pattern"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let re = Regex::new(pattern)
                .map_err(|e| ("pattern".to_string(), format!("invalid pattern: {}", e)))?;
            let Some(s) = value.as_str() else {
                return Err(("pattern".into(), format!("pattern applies to strings, got {}", type_name(value))));
            };
            if re.is_match(s) {
                Ok(())
            } else {
                Err(("pattern".into(), format!("'{}' does not match the required pattern", s)))
            }
        }
        "enum" => {
            let allowed = params
                .and_then(|p| p.get("values"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if allowed.contains(value) {
                Ok(())
            } else {
                Err(("enum".into(), "value is not one of the allowed options".into()))
            }
        }
        "integer" => {
            if value.is_i64() || value.is_u64() {
                Ok(())
            } else {
                Err(("integer".into(), "value is not an integer".into()))
            }
        }
        "positive" => {
            let n = value.as_f64().unwrap_or(f64::NEG_INFINITY);
            if n > 0.0 {
                Ok(())
            } else {
                Err(("positive".into(), "value must be positive".into()))
            }
        }
        // storage-backed and forwarded rules are handled elsewhere
        "unique" => Ok(()),
        _ => Ok(()),
    }
}

fn check_pattern(
    value: &Value,
    re: &Regex,
    code: &str,
    message: &str,
) -> Result<(), RuleFailure> {
    let Some(s) = value.as_str() else {
        return Err((code.to_string(), format!("expected a string, got {}", type_name(value))));
    };
    if re.is_match(s) {
        Ok(())
    } else {
        Err((code.to_string(), format!("'{}' {}", s, message)))
    }
}

fn param_usize(params: Option<&serde_json::Map<String, Value>>, key: &str) -> Option<usize> {
    params?.get(key)?.as_u64().map(|n| n as usize)
}

fn param_f64(params: Option<&serde_json::Map<String, Value>>, key: &str) -> Option<f64> {
    params?.get(key)?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_rule() {
        assert!(run_rule(&json!("email"), &json!("a@b.co")).is_ok());
        assert!(run_rule(&json!("email"), &json!("not-an-email")).is_err());
        assert!(run_rule(&json!("email"), &json!("x@y")).is_err());
    }

    #[test]
    fn test_url_rule() {
        assert!(run_rule(&json!("url"), &json!("https://example.com/a")).is_ok());
        assert!(run_rule(&json!("url"), &json!("example.com")).is_err());
    }

    #[test]
    fn test_phone_rule() {
        assert!(run_rule(&json!("phone"), &json!("+1 (555) 123-4567")).is_ok());
        assert!(run_rule(&json!("phone"), &json!("hello")).is_err());
    }

    #[test]
    fn test_length_rule() {
        let rule = json!({"type": "length", "min": 2, "max": 4});
        assert!(run_rule(&rule, &json!("abc")).is_ok());
        assert!(run_rule(&rule, &json!("a")).is_err());
        assert!(run_rule(&rule, &json!("abcde")).is_err());
        assert!(run_rule(&rule, &json!(["a", "b", "c"])).is_ok());
    }

    #[test]
    fn test_range_rule() {
        let rule = json!({"type": "range", "min": 0, "max": 10});
        assert!(run_rule(&rule, &json!(5)).is_ok());
        assert!(run_rule(&rule, &json!(-1)).is_err());
        assert!(run_rule(&rule, &json!(11)).is_err());
    }

    #[test]
    fn test_pattern_rule() {
        let rule = json!({"type": "pattern", "pattern": "^[a-z]+$"});
        assert!(run_rule(&rule, &json!("abc")).is_ok());
        assert!(run_rule(&rule, &json!("ABC")).is_err());
    }

    #[test]
    fn test_enum_rule() {
        let rule = json!({"type": "enum", "values": ["draft", "live"]});
        assert!(run_rule(&rule, &json!("draft")).is_ok());
        assert!(run_rule(&rule, &json!("gone")).is_err());
    }

    #[test]
    fn test_integer_and_positive() {
        assert!(run_rule(&json!("integer"), &json!(3)).is_ok());
        assert!(run_rule(&json!("integer"), &json!(3.5)).is_err());
        assert!(run_rule(&json!("positive"), &json!(1)).is_ok());
        assert!(run_rule(&json!("positive"), &json!(0)).is_err());
    }

    #[test]
    fn test_null_skips_rules() {
        assert!(run_rule(&json!("email"), &Value::Null).is_ok());
    }

    #[test]
    fn test_function_rules_are_detected_not_run() {
        let rule = json!({"function_id": "@function/7", "params": {}});
        assert!(is_function_rule(&rule));
        assert!(run_rule(&rule, &json!("anything")).is_ok());
    }
}
