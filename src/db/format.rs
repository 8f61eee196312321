use serde_json::Value;

use crate::error::{DbError, DbResult};

/// Applies pipe-separated formatter rules in order. String rules are
/// no-ops on non-string values; unknown tokens are ignored.
pub fn format(mut value: Value, rules: &[&str]) -> DbResult<Value> {
    for rule in rules {
        let mut parts = rule.splitn(2, ':');
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();

        match name {
            "trim" => {
                if let Value::String(s) = &value {
                    value = Value::String(s.trim().to_string());
                }
            }
            "lower" => {
                if let Value::String(s) = &value {
                    value = Value::String(s.to_lowercase());
                }
            }
            "upper" => {
                if let Value::String(s) = &value {
                    value = Value::String(s.to_uppercase());
                }
            }
            "prefix" => {
                if let (Value::String(s), Some(arg)) = (&value, arg) {
                    value = Value::String(format!("{}{}", arg, s));
                }
            }
            "suffix" => {
                if let (Value::String(s), Some(arg)) = (&value, arg) {
                    value = Value::String(format!("{}{}", s, arg));
                }
            }
            "decimal" => {
                let precision: u32 = arg
                    .ok_or_else(|| {
                        DbError::InvalidInput("decimal rule requires precision".to_string())
                    })?
                    .parse()
                    .map_err(|_| {
                        DbError::InvalidInput("decimal precision must be a number".to_string())
                    })?;

                let number = match &value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.parse::<f64>().ok(),
                    _ => None,
                };
                if let Some(f) = number {
                    let factor = 10f64.powi(precision as i32);
                    let rounded = (f * factor).round() / factor;
                    value = serde_json::Number::from_f64(rounded)
                        .map(Value::Number)
                        .unwrap_or(value);
                }
            }
            _ => {}
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_rules() {
        assert_eq!(format(json!("  john  "), &["trim"]).unwrap(), json!("john"));
        assert_eq!(format(json!("John"), &["lower"]).unwrap(), json!("john"));
        assert_eq!(format(json!("john"), &["upper"]).unwrap(), json!("JOHN"));
        assert_eq!(
            format(json!("  john  "), &["trim", "upper"]).unwrap(),
            json!("JOHN")
        );
    }

    #[test]
    fn test_prefix_suffix() {
        assert_eq!(
            format(json!("100"), &["prefix:INV-"]).unwrap(),
            json!("INV-100")
        );
        assert_eq!(
            format(json!("file"), &["suffix:.txt"]).unwrap(),
            json!("file.txt")
        );
    }

    #[test]
    fn test_decimal() {
        assert_eq!(format(json!(3.14159), &["decimal:2"]).unwrap(), json!(3.14));
        assert_eq!(format(json!("2.675"), &["decimal:2"]).unwrap(), json!(2.68));
        // Not a number: rule skipped.
        assert_eq!(format(json!(true), &["decimal:2"]).unwrap(), json!(true));
    }

    #[test]
    fn test_string_rules_noop_on_non_strings() {
        assert_eq!(format(json!(42), &["trim", "upper"]).unwrap(), json!(42));
    }

    #[test]
    fn test_unknown_rule_ignored() {
        assert_eq!(format(json!("x"), &["sparkle"]).unwrap(), json!("x"));
    }
}
