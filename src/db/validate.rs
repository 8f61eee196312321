use serde_json::Value;

use crate::error::{DbError, DbResult};
use crate::store::DataType;

/// Applies pipe-separated validator rules to a value. `None` models a
/// column that is absent from the payload (only `required` can reject it).
/// Unknown rule tokens are ignored.
pub fn validate(value: Option<&Value>, rules: &[&str]) -> DbResult<()> {
    for rule in rules {
        let mut parts = rule.splitn(2, ':');
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();

        match name {
            "required" => {
                let missing = match value {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => s.is_empty(),
                    Some(_) => false,
                };
                if missing {
                    return Err(DbError::InvalidInput("field is required".to_string()));
                }
            }
            "min" => {
                let min: f64 = arg
                    .ok_or_else(|| DbError::InvalidInput("min rule requires value".to_string()))?
                    .parse()
                    .map_err(|_| DbError::InvalidInput("min rule requires a number".to_string()))?;
                match value {
                    Some(Value::String(s)) => {
                        if (s.len() as f64) < min {
                            return Err(DbError::InvalidInput(format!(
                                "length must be at least {}",
                                min
                            )));
                        }
                    }
                    Some(Value::Number(n)) => {
                        if n.as_f64().unwrap_or(0.0) < min {
                            return Err(DbError::InvalidInput(format!(
                                "value must be at least {}",
                                min
                            )));
                        }
                    }
                    _ => {}
                }
            }
            "numeric" => match value {
                Some(Value::Number(_)) => {}
                Some(Value::String(s)) => {
                    if s.parse::<f64>().is_err() {
                        return Err(DbError::InvalidInput("must be numeric".to_string()));
                    }
                }
                Some(_) | None => {
                    return Err(DbError::InvalidInput("must be numeric".to_string()));
                }
            },
            _ => {}
        }
    }
    Ok(())
}

/// Checks a value against the column's declared type. Runs after the
/// validators.
pub fn validate_type(value: &Value, data_type: DataType) -> DbResult<()> {
    match data_type {
        DataType::String => {
            if !value.is_string() {
                return Err(DbError::InvalidInput("expected string".to_string()));
            }
        }
        DataType::Number => {
            if !value.is_number() {
                return Err(DbError::InvalidInput("expected number".to_string()));
            }
        }
        DataType::Timestamp => match value {
            Value::Number(_) => {}
            Value::String(s) => {
                if chrono::DateTime::parse_from_rfc3339(s).is_err() {
                    return Err(DbError::InvalidInput(
                        "expected timestamp (RFC 3339)".to_string(),
                    ));
                }
            }
            _ => {
                return Err(DbError::InvalidInput("expected timestamp".to_string()));
            }
        },
        // Any serde_json::Value round-trips as JSON.
        DataType::Json => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required() {
        assert!(validate(None, &["required"]).is_err());
        assert!(validate(Some(&json!(null)), &["required"]).is_err());
        assert!(validate(Some(&json!("")), &["required"]).is_err());
        assert!(validate(Some(&json!("x")), &["required"]).is_ok());
        assert!(validate(Some(&json!(0)), &["required"]).is_ok());
    }

    #[test]
    fn test_min() {
        assert!(validate(Some(&json!("abc")), &["min:3"]).is_ok());
        assert!(validate(Some(&json!("ab")), &["min:3"]).is_err());
        assert!(validate(Some(&json!(18)), &["min:18"]).is_ok());
        assert!(validate(Some(&json!(17)), &["min:18"]).is_err());
    }

    #[test]
    fn test_numeric() {
        assert!(validate(Some(&json!(1.5)), &["numeric"]).is_ok());
        assert!(validate(Some(&json!("1.5")), &["numeric"]).is_ok());
        assert!(validate(Some(&json!("abc")), &["numeric"]).is_err());
        assert!(validate(Some(&json!(true)), &["numeric"]).is_err());
    }

    #[test]
    fn test_unknown_rules_ignored() {
        assert!(validate(Some(&json!("x")), &["frobnicate", "max:2"]).is_ok());
    }

    #[test]
    fn test_validate_type() {
        assert!(validate_type(&json!("s"), DataType::String).is_ok());
        assert!(validate_type(&json!(5), DataType::String).is_err());
        assert!(validate_type(&json!(5), DataType::Number).is_ok());
        assert!(validate_type(&json!("5"), DataType::Number).is_err());
        assert!(validate_type(&json!(1700000000), DataType::Timestamp).is_ok());
        assert!(validate_type(&json!("2024-01-15T10:30:00Z"), DataType::Timestamp).is_ok());
        assert!(validate_type(&json!("yesterday"), DataType::Timestamp).is_err());
        assert!(validate_type(&json!({"a": [1, 2]}), DataType::Json).is_ok());
    }
}
