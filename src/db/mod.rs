pub mod format;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::store::ops::stringify_value;
use crate::store::{DataType, QueryProtocol, Relation, Row, StoreManager, Table, TableChange};

/// Thin surface over the store manager consumed by the dispatcher and the
/// DSL. Owns the validator/formatter pipeline for writes and the protocol
/// resolution helpers the DSL binds names through.
#[derive(Clone)]
pub struct Db {
    sm: Arc<StoreManager>,
}

impl Db {
    pub fn new(sm: Arc<StoreManager>) -> Self {
        Self { sm }
    }

    pub fn store(&self) -> &Arc<StoreManager> {
        &self.sm
    }

    // ===== Data operations =====

    /// Inserts a record. For each declared column: fill the default if the
    /// value is missing (with `$AUTO`/`$UUID`/`$EMPTY` sentinel handling),
    /// coerce strings where the declared type demands a number or
    /// timestamp, run validators, run the type check, then apply
    /// formatters. Returns the stringified primary key.
    pub fn insert(&self, db_name: &str, table_name: &str, data: Row) -> DbResult<String> {
        let (_, table) = self.sm.table_schema(db_name, table_name)?;

        let mut processed = Row::new();

        for (col_name, col) in &table.columns {
            let mut value = data.get(col_name).cloned();
            let mut from_empty_default = false;

            // Fill default for missing values.
            if value.is_none() {
                if let Some(default) = &col.default_value {
                    value = Some(match default.as_str() {
                        Some("$AUTO") => {
                            let seq = self.sm.next_sequence(db_name, table_name, col_name)?;
                            Value::from(seq)
                        }
                        Some("$UUID") => Value::String(Uuid::new_v4().to_string()),
                        Some("$EMPTY") => {
                            from_empty_default = true;
                            Value::String(String::new())
                        }
                        _ => default.clone(),
                    });
                }
            }

            // Coerce strings where the declared type wants a number.
            if let Some(Value::String(s)) = &value {
                if matches!(col.data_type, DataType::Number | DataType::Timestamp) {
                    if let Ok(f) = s.parse::<f64>() {
                        value = serde_json::Number::from_f64(f).map(Value::Number);
                    }
                }
            }

            let rules = col.validator_rules();
            match &value {
                None => {
                    validate::validate(None, &rules)
                        .map_err(|e| DbError::InvalidInput(format!("column {}: {}", col_name, e)))?;
                }
                Some(val) => {
                    // `$EMPTY` means "allow the empty string even when
                    // required": strip `required` for this one validation.
                    let rules: Vec<&str> = if from_empty_default {
                        rules.into_iter().filter(|r| *r != "required").collect()
                    } else {
                        rules
                    };

                    validate::validate(Some(val), &rules)
                        .map_err(|e| DbError::InvalidInput(format!("column {}: {}", col_name, e)))?;
                    validate::validate_type(val, col.data_type)
                        .map_err(|e| DbError::InvalidInput(format!("column {}: {}", col_name, e)))?;
                }
            }

            if let Some(val) = value {
                let formatted = format::format(val, &col.formatter_rules())
                    .map_err(|e| DbError::InvalidInput(format!("column {}: {}", col_name, e)))?;
                processed.insert(col_name.clone(), formatted);
            }
        }

        let pk = processed
            .get(&table.pk)
            .map(stringify_value)
            .ok_or_else(|| {
                DbError::InvalidInput(format!("primary key '{}' missing", table.pk))
            })?;

        self.sm.insert(db_name, table_name, processed)?;
        Ok(pk)
    }

    /// Merge-update: validates and formats only the patch keys, overlays
    /// them on the fetched row, and rewrites it. Patch keys that name no
    /// declared column are ignored.
    pub fn update(&self, db_name: &str, table_name: &str, pk: &str, patch: Row) -> DbResult<()> {
        let (_, table) = self.sm.table_schema(db_name, table_name)?;

        let mut processed = Row::new();
        for (key, value) in patch {
            let col = match table.columns.get(&key) {
                Some(col) => col,
                None => continue,
            };
            let mut value = value;

            if let Value::String(s) = &value {
                if matches!(col.data_type, DataType::Number | DataType::Timestamp) {
                    if let Ok(f) = s.parse::<f64>() {
                        if let Some(n) = serde_json::Number::from_f64(f) {
                            value = Value::Number(n);
                        }
                    }
                }
            }

            validate::validate(Some(&value), &col.validator_rules())
                .map_err(|e| DbError::InvalidInput(format!("column {}: {}", key, e)))?;
            validate::validate_type(&value, col.data_type)
                .map_err(|e| DbError::InvalidInput(format!("column {}: {}", key, e)))?;

            let formatted = format::format(value, &col.formatter_rules())
                .map_err(|e| DbError::InvalidInput(format!("column {}: {}", key, e)))?;
            processed.insert(key, formatted);
        }

        let mut row = self.sm.get(db_name, table_name, pk)?;
        for (key, value) in processed {
            row.insert(key, value);
        }

        self.sm.update(db_name, table_name, pk, row)
    }

    pub fn delete(&self, db_name: &str, table_name: &str, pk: &str) -> DbResult<()> {
        self.sm.delete(db_name, table_name, pk)
    }

    pub fn get(&self, db_name: &str, table_name: &str, pk: &str) -> DbResult<Row> {
        self.sm.get(db_name, table_name, pk)
    }

    pub fn pks_by_index(
        &self,
        db_name: &str,
        table_name: &str,
        col_name: &str,
        value: &str,
    ) -> DbResult<Vec<String>> {
        self.sm.pks_by_index(db_name, table_name, col_name, value)
    }

    pub fn all_pks(&self, db_name: &str, table_name: &str) -> DbResult<Vec<String>> {
        self.sm.all_pks(db_name, table_name)
    }

    pub fn rows_by_pks(&self, db_name: &str, table_name: &str, pks: &[String]) -> DbResult<Vec<Row>> {
        self.sm.rows_by_pks(db_name, table_name, pks)
    }

    // ===== Schema operations =====

    pub fn create_database(&self, name: &str) -> DbResult<()> {
        self.sm.create_database(name)
    }

    pub fn create_table(&self, db_name: &str, table: Table) -> DbResult<()> {
        self.sm.create_table(db_name, table)
    }

    pub fn drop_database(&self, name: &str) -> DbResult<()> {
        self.sm.drop_database(name)
    }

    pub fn drop_table(&self, db_name: &str, table_name: &str) -> DbResult<()> {
        self.sm.drop_table(db_name, table_name)
    }

    pub fn rename_database(&self, old_name: &str, new_name: &str) -> DbResult<()> {
        self.sm.rename_database(old_name, new_name)
    }

    pub fn rename_table(&self, db_name: &str, old_name: &str, new_name: &str) -> DbResult<()> {
        self.sm.rename_table(db_name, old_name, new_name)
    }

    pub fn alter_table(&self, db_name: &str, table_name: &str, change: TableChange) -> DbResult<()> {
        self.sm.alter_table(db_name, table_name, change)
    }

    pub fn fetch_databases(&self) -> Vec<String> {
        self.sm.fetch_databases()
    }

    pub fn fetch_tables(&self, db_name: &str) -> DbResult<Vec<String>> {
        self.sm.fetch_tables(db_name)
    }

    pub fn table_schema(&self, db_name: &str, table_name: &str) -> DbResult<Table> {
        self.sm.table_schema(db_name, table_name).map(|(_, t)| t)
    }

    // ===== Protocol operations =====

    pub fn set_protocol(&self, password: &str, protocol: QueryProtocol) -> DbResult<()> {
        self.sm.set_protocol(password, protocol)
    }

    pub fn get_protocol(&self, password: &str) -> DbResult<Arc<QueryProtocol>> {
        self.sm.get_protocol(password)
    }

    pub fn all_protocols(&self) -> Vec<String> {
        self.sm.all_protocols()
    }

    pub fn delete_protocol(&self, password: &str) -> DbResult<()> {
        self.sm.delete_protocol(password)
    }

    pub fn proto_context(&self, password: &str, entity: &str, context_key: &str) -> DbResult<String> {
        self.sm.proto_context(password, entity, context_key)
    }

    // ===== DSL binding helpers =====
    //
    // The parser resolves every identifier through the protocol named by
    // the query's protocol password; these helpers answer those lookups.

    pub fn is_database(&self, password: &str, db_alias: &str) -> bool {
        self.get_protocol(password)
            .map(|p| p.contains_key(db_alias))
            .unwrap_or(false)
    }

    pub fn is_table(&self, password: &str, db_alias: &str, table_alias: &str) -> bool {
        self.get_protocol(password)
            .ok()
            .and_then(|p| p.get(db_alias).map(|m| m.entities.contains_key(table_alias)))
            .unwrap_or(false)
    }

    pub fn is_column(&self, password: &str, db_alias: &str, table_alias: &str, col_alias: &str) -> bool {
        self.get_protocol(password)
            .ok()
            .and_then(|p| {
                p.get(db_alias)
                    .and_then(|m| m.entities.get(table_alias))
                    .map(|e| e.fields.contains_key(col_alias))
            })
            .unwrap_or(false)
    }

    pub fn is_relation(&self, password: &str, db_alias: &str, table_alias: &str, name: &str) -> bool {
        self.relation(password, db_alias, table_alias, name).is_ok()
    }

    pub fn relation(
        &self,
        password: &str,
        db_alias: &str,
        table_alias: &str,
        name: &str,
    ) -> DbResult<Relation> {
        let protocol = self.get_protocol(password)?;
        let module = protocol
            .get(db_alias)
            .ok_or_else(|| DbError::NotFound(format!("database '{}' in protocol", db_alias)))?;
        let entity = module
            .entities
            .get(table_alias)
            .ok_or_else(|| DbError::NotFound(format!("entity '{}'", table_alias)))?;
        entity
            .relations
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("relation '{}'", name)))
    }

    pub fn db_name_from_proto(&self, password: &str, db_alias: &str) -> DbResult<String> {
        let protocol = self.get_protocol(password)?;
        protocol
            .get(db_alias)
            .map(|m| m.database.clone())
            .ok_or_else(|| DbError::NotFound(format!("database '{}' in protocol", db_alias)))
    }

    pub fn table_name_from_proto(
        &self,
        password: &str,
        db_alias: &str,
        table_alias: &str,
    ) -> DbResult<String> {
        let protocol = self.get_protocol(password)?;
        protocol
            .get(db_alias)
            .and_then(|m| m.entities.get(table_alias))
            .map(|e| e.table.clone())
            .ok_or_else(|| DbError::NotFound(format!("entity '{}'", table_alias)))
    }

    /// Schema metadata for a column alias: its physical name, its alias,
    /// the physical table and the declared type from the live schema.
    pub fn col_schema_from_proto(
        &self,
        password: &str,
        db_alias: &str,
        table_alias: &str,
        col_alias: &str,
    ) -> DbResult<HashMap<String, String>> {
        let protocol = self.get_protocol(password)?;
        let module = protocol
            .get(db_alias)
            .ok_or_else(|| DbError::NotFound(format!("database '{}' in protocol", db_alias)))?;
        let entity = module
            .entities
            .get(table_alias)
            .ok_or_else(|| DbError::NotFound(format!("entity '{}'", table_alias)))?;
        let physical = entity
            .fields
            .get(col_alias)
            .ok_or_else(|| {
                DbError::NotFound(format!("field '{}' in entity '{}'", col_alias, table_alias))
            })?
            .clone();

        let (_, table) = self.sm.table_schema(&module.database, &entity.table)?;
        let data_type = table
            .columns
            .get(&physical)
            .map(|c| c.data_type)
            .unwrap_or(DataType::String);

        Ok(HashMap::from([
            ("name".to_string(), physical),
            ("alias".to_string(), col_alias.to_string()),
            ("table".to_string(), entity.table.clone()),
            ("type".to_string(), data_type.as_str().to_string()),
        ]))
    }
}
