use serde_json::{Map, Number, Value as Json};

/// A value in evaluator memory. The variant tag is the structural label
/// the engine dispatches on; arrays are narrowed to their most specific
/// homogeneous container when stored, and numbers normalize to f64.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    BoolList(Vec<bool>),
    NumList(Vec<f64>),
    StrList(Vec<String>),
    /// Heterogeneous array.
    List(Vec<Json>),
    Row(Map<String, Json>),
    Table(Vec<Map<String, Json>>),
}

impl Value {
    /// Converts raw JSON into a narrowed value.
    pub fn from_json(value: Json) -> Value {
        match value {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::Str(s),
            Json::Object(map) => Value::Row(map),
            Json::Array(items) => Value::from_list(items),
        }
    }

    /// Narrows a heterogeneous array: if every element is the same
    /// primitive kind (or every element is an object) the array is retyped
    /// to the homogeneous variant.
    pub fn from_list(items: Vec<Json>) -> Value {
        if !items.is_empty() {
            if items.iter().all(Json::is_string) {
                return Value::StrList(
                    items
                        .into_iter()
                        .map(|v| match v {
                            Json::String(s) => s,
                            _ => unreachable!(),
                        })
                        .collect(),
                );
            }
            if items.iter().all(Json::is_number) {
                return Value::NumList(
                    items
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0))
                        .collect(),
                );
            }
            if items.iter().all(Json::is_boolean) {
                return Value::BoolList(
                    items.iter().map(|v| v.as_bool().unwrap_or(false)).collect(),
                );
            }
            if items.iter().all(Json::is_object) {
                return Value::Table(
                    items
                        .into_iter()
                        .map(|v| match v {
                            Json::Object(map) => map,
                            _ => unreachable!(),
                        })
                        .collect(),
                );
            }
        }
        Value::List(items)
    }

    /// Structural label: TABLE, ROW, ARRAY_OF_*, STRING, NUMBER, BOOL or
    /// NULL.
    pub fn label(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOL",
            Value::Number(_) => "NUMBER",
            Value::Str(_) => "STRING",
            Value::BoolList(_) => "ARRAY_OF_BOOL",
            Value::NumList(_) => "ARRAY_OF_NUMBER",
            Value::StrList(_) => "ARRAY_OF_STRING",
            Value::List(_) => "ARRAY_OF_UNKNOWN",
            Value::Row(_) => "ROW",
            Value::Table(_) => "TABLE",
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::BoolList(items) => Json::Array(items.iter().map(|b| Json::Bool(*b)).collect()),
            Value::NumList(items) => Json::Array(
                items
                    .iter()
                    .map(|f| Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null))
                    .collect(),
            ),
            Value::StrList(items) => {
                Json::Array(items.iter().map(|s| Json::String(s.clone())).collect())
            }
            Value::List(items) => Json::Array(items.clone()),
            Value::Row(map) => Json::Object(map.clone()),
            Value::Table(rows) => {
                Json::Array(rows.iter().map(|r| Json::Object(r.clone())).collect())
            }
        }
    }

    /// Generic element view for slicing and row access.
    pub fn elements(&self) -> Option<Vec<Json>> {
        match self {
            Value::Table(rows) => Some(rows.iter().map(|r| Json::Object(r.clone())).collect()),
            Value::StrList(items) => {
                Some(items.iter().map(|s| Json::String(s.clone())).collect())
            }
            Value::NumList(items) => Some(
                items
                    .iter()
                    .map(|f| Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null))
                    .collect(),
            ),
            Value::BoolList(items) => Some(items.iter().map(|b| Json::Bool(*b)).collect()),
            Value::List(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Vec<Map<String, Json>>> {
        match self {
            Value::Table(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn as_row(&self) -> Option<&Map<String, Json>> {
        match self {
            Value::Row(map) => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_narrowing_homogeneous_arrays() {
        assert_eq!(
            Value::from_json(json!(["a", "b"])),
            Value::StrList(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            Value::from_json(json!([1, 2.5])),
            Value::NumList(vec![1.0, 2.5])
        );
        assert_eq!(
            Value::from_json(json!([true, false])),
            Value::BoolList(vec![true, false])
        );
        assert_eq!(
            Value::from_json(json!([{"a": 1}, {"b": 2}])).label(),
            "TABLE"
        );
    }

    #[test]
    fn test_mixed_array_stays_unknown() {
        let value = Value::from_json(json!([1, "a"]));
        assert_eq!(value.label(), "ARRAY_OF_UNKNOWN");
    }

    #[test]
    fn test_empty_array_is_unknown() {
        assert_eq!(Value::from_json(json!([])).label(), "ARRAY_OF_UNKNOWN");
    }

    #[test]
    fn test_labels() {
        assert_eq!(Value::from_json(json!(null)).label(), "NULL");
        assert_eq!(Value::from_json(json!(1)).label(), "NUMBER");
        assert_eq!(Value::from_json(json!("x")).label(), "STRING");
        assert_eq!(Value::from_json(json!(true)).label(), "BOOL");
        assert_eq!(Value::from_json(json!({"a": 1})).label(), "ROW");
    }

    #[test]
    fn test_json_roundtrip() {
        let original = json!([{"a": 1.0}, {"a": 2.0}]);
        let value = Value::from_json(original.clone());
        assert_eq!(value.to_json(), original);
    }
}
