use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a column, used for validation and DSL typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Timestamp,
    Json,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Timestamp => "timestamp",
            DataType::Json => "json",
        }
    }
}

/// A logical grouping of tables with a stable random ID. The ID never
/// changes after creation; only the name is user-visible and renameable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tables: HashMap<String, Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub columns: HashMap<String, Column>,
    /// Name of the primary key column; must exist in `columns`.
    pub pk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Pipe-separated formatter rules, e.g. "trim|decimal:2".
    #[serde(default)]
    pub formatter: String,
    /// Pipe-separated validator rules, e.g. "required|min:5".
    #[serde(default)]
    pub validator: String,
    #[serde(rename = "defaultValue", default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default = "default_true")]
    pub indexed: bool,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn formatter_rules(&self) -> Vec<&str> {
        split_rules(&self.formatter)
    }

    pub fn validator_rules(&self) -> Vec<&str> {
        split_rules(&self.validator)
    }
}

fn split_rules(spec: &str) -> Vec<&str> {
    spec.split('|')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .collect()
}

/// A row is a JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

// ===== Protocol types =====

/// Named query-schema mapping protocol-level database aliases to modules.
pub type QueryProtocol = HashMap<String, ProtocolModule>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolModule {
    pub database: String,
    #[serde(default)]
    pub entities: HashMap<String, Entity>,
}

/// A protocol-level alias for a physical table plus its field and relation
/// mapping. `context` holds named DSL snippets applied when a query carries
/// the matching context key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    pub table: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub relations: HashMap<String, Relation>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

/// Relationship between two entities: oto, otm, mto or mtm. `fkfield` is
/// "localCol:remoteCol", or "localCol:throughLocal:throughRemote:remoteCol"
/// for mtm, in which case `through` names the join table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(default)]
    pub prototable: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub entity: String,
    pub fkfield: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub through: String,
}
