use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value as Json};

use super::stmt::AggrCall;
use super::value::Value;
use crate::error::{DbError, DbResult};

/// Dispatches an aggregate by name. `input_type` is the label the parser
/// proved for the input ("TABLE", "LIST", ...), used where argument shape
/// depends on it.
pub fn apply(call: &AggrCall, input_type: &str, data: &Value) -> DbResult<Value> {
    match call.name.as_str() {
        "_sum" => sum(call, data),
        "_count" => count(data),
        "_avg" => avg(call, data),
        "_min" => min_max(call, data, true),
        "_max" => min_max(call, data, false),
        "_unique" => unique(call, data),
        "_asc" => sort(call, data, false),
        "_desc" => sort(call, data, true),
        "_date" => date(call, data),
        "_like" => like(call, input_type, data),
        other => Err(DbError::TypeMismatch(format!(
            "unknown aggregate function '{}'",
            other
        ))),
    }
}

fn json_num(value: &Json) -> Option<f64> {
    value.as_f64()
}

/// Numeric cells of a list/table input; the table form requires a column
/// argument and skips non-numeric cells.
fn numeric_inputs(call: &AggrCall, data: &Value) -> DbResult<Vec<f64>> {
    match data {
        Value::NumList(items) => Ok(items.clone()),
        Value::Table(rows) => {
            let col = call.args.first().ok_or_else(|| {
                DbError::InvalidInput(format!("{}: missing column name", call.name))
            })?;
            Ok(rows
                .iter()
                .filter_map(|row| row.get(col).and_then(json_num))
                .collect())
        }
        Value::List(items) => Ok(items.iter().filter_map(json_num).collect()),
        other => Err(DbError::TypeMismatch(format!(
            "{}: unsupported input {}",
            call.name,
            other.label()
        ))),
    }
}

fn sum(call: &AggrCall, data: &Value) -> DbResult<Value> {
    Ok(Value::Number(numeric_inputs(call, data)?.iter().sum()))
}

fn count(data: &Value) -> DbResult<Value> {
    let n = match data {
        Value::NumList(items) => items.len(),
        Value::StrList(items) => items.len(),
        Value::BoolList(items) => items.len(),
        Value::List(items) => items.len(),
        Value::Table(rows) => rows.len(),
        other => {
            return Err(DbError::TypeMismatch(format!(
                "_count: unsupported input {}",
                other.label()
            )))
        }
    };
    Ok(Value::Number(n as f64))
}

fn avg(call: &AggrCall, data: &Value) -> DbResult<Value> {
    let values = numeric_inputs(call, data)?;
    if values.is_empty() {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(values.iter().sum::<f64>() / values.len() as f64))
}

fn min_max(call: &AggrCall, data: &Value, want_min: bool) -> DbResult<Value> {
    let values = numeric_inputs(call, data)?;
    let folded = values.into_iter().reduce(|best, v| {
        if (want_min && v < best) || (!want_min && v > best) {
            v
        } else {
            best
        }
    });
    match folded {
        Some(v) => Ok(Value::Number(v)),
        None => Err(DbError::InvalidInput(format!(
            "{}: no numeric values found",
            call.name
        ))),
    }
}

fn unique(call: &AggrCall, data: &Value) -> DbResult<Value> {
    match data {
        Value::StrList(items) => {
            let mut seen = HashSet::new();
            Ok(Value::StrList(
                items
                    .iter()
                    .filter(|s| seen.insert((*s).clone()))
                    .cloned()
                    .collect(),
            ))
        }
        Value::NumList(items) => {
            let mut seen = HashSet::new();
            Ok(Value::NumList(
                items
                    .iter()
                    .copied()
                    .filter(|f| seen.insert(f.to_bits()))
                    .collect(),
            ))
        }
        Value::List(items) => {
            let mut seen = HashSet::new();
            Ok(Value::List(
                items
                    .iter()
                    .filter(|item| seen.insert(item.to_string()))
                    .cloned()
                    .collect(),
            ))
        }
        Value::Table(rows) => {
            // Dedupe on the argument column tuple, keeping the full row.
            if call.args.is_empty() {
                return Err(DbError::InvalidInput(
                    "_unique: missing column name(s)".to_string(),
                ));
            }
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for row in rows {
                let key = composite_key(row, &call.args);
                if seen.insert(key) {
                    out.push(row.clone());
                }
            }
            Ok(Value::Table(out))
        }
        other => Err(DbError::TypeMismatch(format!(
            "_unique: unsupported input {}",
            other.label()
        ))),
    }
}

/// Dedup key over the given columns: numbers and strings hash under
/// distinct prefixes so 1 and "1" stay distinct.
fn composite_key(row: &Map<String, Json>, cols: &[String]) -> String {
    let mut key = String::new();
    for (i, col) in cols.iter().enumerate() {
        if i > 0 {
            key.push('\x1f');
        }
        match row.get(col) {
            None | Some(Json::Null) => key.push_str("N:"),
            Some(value) => {
                if let Some(f) = json_num(value) {
                    key.push_str("F:");
                    key.push_str(&f.to_string());
                } else {
                    key.push_str("S:");
                    key.push_str(&cell_text(value));
                }
            }
        }
    }
    key
}

fn cell_text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Ascending comparison of two cells: nulls last, numeric pairs compare
/// numerically, everything else stringwise.
fn cmp_cells(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            if let (Some(fa), Some(fb)) = (json_num(a), json_num(b)) {
                fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
            } else {
                cell_text(a).cmp(&cell_text(b))
            }
        }
    }
}

fn sort(call: &AggrCall, data: &Value, descending: bool) -> DbResult<Value> {
    let flip = |ord: Ordering| if descending { ord.reverse() } else { ord };
    match data {
        Value::Table(rows) => {
            // Multi-key sort, left to right, like SQL ORDER BY a, b.
            if call.args.is_empty() {
                return Err(DbError::InvalidInput(format!(
                    "{}: missing sort key(s)",
                    call.name
                )));
            }
            let mut rows = rows.clone();
            rows.sort_by(|a, b| {
                for key in &call.args {
                    // Nulls sort last in both directions.
                    let (va, vb) = (a.get(key), b.get(key));
                    let null_a = va.map_or(true, Json::is_null);
                    let null_b = vb.map_or(true, Json::is_null);
                    let ord = match (null_a, null_b) {
                        (true, true) => Ordering::Equal,
                        (true, false) => return Ordering::Greater,
                        (false, true) => return Ordering::Less,
                        (false, false) => flip(cmp_cells(va, vb)),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            Ok(Value::Table(rows))
        }
        Value::NumList(items) => {
            let mut items = items.clone();
            items.sort_by(|a, b| flip(a.partial_cmp(b).unwrap_or(Ordering::Equal)));
            Ok(Value::NumList(items))
        }
        Value::StrList(items) => {
            let mut items = items.clone();
            items.sort_by(|a, b| flip(a.cmp(b)));
            Ok(Value::StrList(items))
        }
        Value::List(items) => {
            let mut items = items.clone();
            items.sort_by(|a, b| flip(cmp_cells(Some(a), Some(b))));
            Ok(Value::List(items))
        }
        other => Err(DbError::TypeMismatch(format!(
            "{}: unsupported input {}",
            call.name,
            other.label()
        ))),
    }
}

const DEFAULT_DATE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats a Unix timestamp. Values above 10^12 are treated as
/// milliseconds, otherwise seconds. Table input takes the column as first
/// argument and an optional layout second; other shapes take an optional
/// layout first.
fn date(call: &AggrCall, data: &Value) -> DbResult<Value> {
    let (col, layout) = match data {
        Value::Table(_) => {
            let col = call.args.first().filter(|c| !c.is_empty()).ok_or_else(|| {
                DbError::InvalidInput("_date: table input requires column name".to_string())
            })?;
            let layout = call
                .args
                .get(1)
                .filter(|l| !l.is_empty())
                .map(String::as_str)
                .unwrap_or(DEFAULT_DATE_LAYOUT);
            (Some(col.as_str()), layout)
        }
        _ => (
            None,
            call.args
                .first()
                .filter(|l| !l.is_empty())
                .map(String::as_str)
                .unwrap_or(DEFAULT_DATE_LAYOUT),
        ),
    };

    let parse_str = |s: &str| s.trim().parse::<f64>().ok();
    let raw: Option<f64> = match data {
        Value::Number(f) => Some(*f),
        Value::Str(s) => parse_str(s),
        Value::NumList(items) => items.first().copied(),
        Value::StrList(items) => items.first().and_then(|s| parse_str(s)),
        Value::List(items) => items.iter().find_map(|item| match item {
            Json::Number(_) => json_num(item),
            Json::String(s) => parse_str(s),
            _ => None,
        }),
        Value::Table(rows) => {
            let col = col.unwrap_or_default();
            rows.iter().find_map(|row| match row.get(col) {
                Some(Json::Number(n)) => n.as_f64(),
                Some(Json::String(s)) => parse_str(s),
                _ => None,
            })
        }
        other => {
            return Err(DbError::TypeMismatch(format!(
                "_date: unsupported input {}",
                other.label()
            )))
        }
    };

    let raw = raw.ok_or_else(|| {
        DbError::InvalidInput("_date: no convertible timestamp value found".to_string())
    })?;
    let seconds = if raw > 1e12 { (raw / 1000.0) as i64 } else { raw as i64 };

    let formatted = Utc
        .timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| DbError::InvalidInput(format!("_date: timestamp {} out of range", seconds)))?
        .format(layout)
        .to_string();
    Ok(Value::Str(formatted))
}

/// SQL LIKE: `%` matches any run, `_` any single character; the match is
/// anchored at both ends.
fn like(call: &AggrCall, input_type: &str, data: &Value) -> DbResult<Value> {
    if call.args.is_empty() {
        return Err(DbError::InvalidInput("_like: missing pattern argument".to_string()));
    }

    let (column, pattern) = if input_type == "TABLE" {
        if call.args.len() < 2 {
            return Err(DbError::InvalidInput(
                "_like: table input requires a column name and a pattern".to_string(),
            ));
        }
        (Some(call.args[0].as_str()), call.args[1].as_str())
    } else {
        (None, call.args[0].as_str())
    };

    let regex_text = format!("^{}$", pattern.replace('%', ".*").replace('_', "."));
    let regex = Regex::new(&regex_text)
        .map_err(|e| DbError::InvalidInput(format!("_like: invalid pattern: {}", e)))?;

    let found = match data {
        Value::Str(s) => regex.is_match(s),
        Value::StrList(items) => items.iter().any(|s| regex.is_match(s)),
        Value::List(items) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|s| regex.is_match(s))),
        Value::Table(rows) => {
            let column = column.unwrap_or_default();
            rows.iter().any(|row| {
                row.get(column)
                    .and_then(Json::as_str)
                    .is_some_and(|s| regex.is_match(s))
            })
        }
        other => {
            return Err(DbError::TypeMismatch(format!(
                "_like: unsupported input {}",
                other.label()
            )))
        }
    };

    Ok(Value::Bool(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: &[&str]) -> AggrCall {
        AggrCall {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn table(rows: Json) -> Value {
        Value::from_json(rows)
    }

    #[test]
    fn test_sum_and_avg() {
        let data = Value::NumList(vec![10.0, 20.0, 30.0]);
        assert_eq!(apply(&call("_sum", &[]), "LIST", &data).unwrap(), Value::Number(60.0));
        assert_eq!(apply(&call("_avg", &[]), "LIST", &data).unwrap(), Value::Number(20.0));
    }

    #[test]
    fn test_sum_on_table_requires_column() {
        let data = table(json!([{"b": 10}, {"b": 20}]));
        assert!(apply(&call("_sum", &[]), "TABLE", &data).is_err());
        assert_eq!(
            apply(&call("_sum", &["b"]), "TABLE", &data).unwrap(),
            Value::Number(30.0)
        );
    }

    #[test]
    fn test_empty_aggregates() {
        let empty = Value::NumList(vec![]);
        assert_eq!(apply(&call("_sum", &[]), "LIST", &empty).unwrap(), Value::Number(0.0));
        assert_eq!(apply(&call("_avg", &[]), "LIST", &empty).unwrap(), Value::Number(0.0));
        assert_eq!(apply(&call("_count", &[]), "LIST", &empty).unwrap(), Value::Number(0.0));
        assert!(matches!(
            apply(&call("_min", &[]), "LIST", &empty),
            Err(DbError::InvalidInput(_))
        ));
        assert!(matches!(
            apply(&call("_max", &[]), "LIST", &empty),
            Err(DbError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_min_max() {
        let data = Value::NumList(vec![5.0, -1.0, 3.0]);
        assert_eq!(apply(&call("_min", &[]), "LIST", &data).unwrap(), Value::Number(-1.0));
        assert_eq!(apply(&call("_max", &[]), "LIST", &data).unwrap(), Value::Number(5.0));
    }

    #[test]
    fn test_unique_list() {
        let data = Value::StrList(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            apply(&call("_unique", &[]), "LIST", &data).unwrap(),
            Value::StrList(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_unique_table_keeps_full_rows() {
        let data = table(json!([
            {"dept": "eng", "name": "alice"},
            {"dept": "eng", "name": "bob"},
            {"dept": "ops", "name": "carol"}
        ]));
        let result = apply(&call("_unique", &["dept"]), "TABLE", &data).unwrap();
        let rows = result.as_table().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "alice");
    }

    #[test]
    fn test_sort_table_stable_with_nulls_last() {
        let data = table(json!([
            {"k": 2, "tag": "first"},
            {"k": null, "tag": "null"},
            {"k": 1, "tag": "a"},
            {"k": 2, "tag": "second"}
        ]));
        let result = apply(&call("_asc", &["k"]), "TABLE", &data).unwrap();
        let rows = result.as_table().unwrap();
        assert_eq!(rows[0]["k"], 1);
        // Equal keys preserve original order.
        assert_eq!(rows[1]["tag"], "first");
        assert_eq!(rows[2]["tag"], "second");
        assert_eq!(rows[3]["tag"], "null");

        let result = apply(&call("_desc", &["k"]), "TABLE", &data).unwrap();
        let rows = result.as_table().unwrap();
        assert_eq!(rows[0]["k"], 2);
        assert_eq!(rows[2]["k"], 1);
        // Nulls still last when descending.
        assert_eq!(rows[3]["tag"], "null");
    }

    #[test]
    fn test_sort_multi_key() {
        let data = table(json!([
            {"a": 1, "b": 2},
            {"a": 1, "b": 1},
            {"a": 0, "b": 9}
        ]));
        let result = apply(&call("_asc", &["a", "b"]), "TABLE", &data).unwrap();
        let rows = result.as_table().unwrap();
        assert_eq!(rows[0]["b"], 9);
        assert_eq!(rows[1]["b"], 1);
        assert_eq!(rows[2]["b"], 2);
    }

    #[test]
    fn test_date_default_layout() {
        let data = Value::Number(0.0);
        assert_eq!(
            apply(&call("_date", &[]), "NUMBER", &data).unwrap(),
            Value::Str("1970-01-01 00:00:00".to_string())
        );
    }

    #[test]
    fn test_date_milliseconds_heuristic() {
        let seconds = Value::Number(1700000000.0);
        let millis = Value::Number(1700000000000.0);
        assert_eq!(
            apply(&call("_date", &[]), "NUMBER", &seconds).unwrap(),
            apply(&call("_date", &[]), "NUMBER", &millis).unwrap()
        );
    }

    #[test]
    fn test_date_custom_layout() {
        let data = Value::Number(0.0);
        assert_eq!(
            apply(&call("_date", &["%Y"]), "NUMBER", &data).unwrap(),
            Value::Str("1970".to_string())
        );
    }

    #[test]
    fn test_like() {
        let data = Value::Str("jonathan".to_string());
        assert_eq!(
            apply(&call("_like", &["jon%"]), "FIELD", &data).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            apply(&call("_like", &["jon"]), "FIELD", &data).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            apply(&call("_like", &["jon_than"]), "FIELD", &data).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            apply(&call("_like", &["jona_han"]), "FIELD", &data).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_like_on_table() {
        let data = table(json!([{"name": "alice"}, {"name": "bob"}]));
        assert_eq!(
            apply(&call("_like", &["name", "b%"]), "TABLE", &data).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            apply(&call("_like", &["name", "z%"]), "TABLE", &data).unwrap(),
            Value::Bool(false)
        );
    }
}
