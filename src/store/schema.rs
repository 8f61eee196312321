use serde_json::Value;
use uuid::Uuid;

use super::keys;
use super::types::{Column, DataType, Database, Table};
use super::StoreManager;
use crate::engine::IterFlow;
use crate::error::{DbError, DbResult};

/// A single structural change applied by `alter_table`. Exactly one change
/// per call.
#[derive(Debug, Clone)]
pub enum TableChange {
    AddColumn(Column),
    DropColumn {
        name: String,
    },
    ModifyColumn {
        name: String,
        data_type: Option<DataType>,
        formatter: Option<String>,
        validator: Option<String>,
        default_value: Option<Value>,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
    },
}

/// 128-bit random identifier rendered as 32 lowercase hex characters.
fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl StoreManager {
    pub fn create_database(&self, name: &str) -> DbResult<()> {
        {
            let mut catalog = self.schema.write().unwrap();
            if catalog.databases.contains_key(name) {
                return Err(DbError::DatabaseExists(name.to_string()));
            }

            let db = Database {
                id: generate_id(),
                name: name.to_string(),
                tables: Default::default(),
            };

            self.engine.set(&keys::map_db_key(name), db.id.as_bytes())?;
            self.engine
                .set(&keys::meta_db_key(&db.id), &serde_json::to_vec(&db)?)?;

            catalog.databases.insert(name.to_string(), db);
        }
        self.update_default_protocol()
    }

    pub fn create_table(&self, db_name: &str, mut table: Table) -> DbResult<()> {
        {
            let mut catalog = self.schema.write().unwrap();
            let db = catalog
                .databases
                .get_mut(db_name)
                .ok_or_else(|| DbError::NotFound(format!("database '{}'", db_name)))?;

            if db.tables.contains_key(&table.name) {
                return Err(DbError::TableExists(table.name));
            }
            if !table.columns.contains_key(&table.pk) {
                return Err(DbError::InvalidInput(format!(
                    "primary key column '{}' not defined",
                    table.pk
                )));
            }

            table.id = generate_id();
            for col in table.columns.values_mut() {
                col.id = generate_id();
                col.indexed = true;
            }

            self.engine
                .set(&keys::map_table_key(&db.id, &table.name), table.id.as_bytes())?;
            self.engine.set(
                &keys::meta_table_key(&db.id, &table.id),
                &serde_json::to_vec(&table)?,
            )?;

            db.tables.insert(table.name.clone(), table);
        }
        self.update_default_protocol()
    }

    /// Rebuilds the in-memory catalog from the META key families. Called on
    /// startup.
    pub fn load_schema(&self) -> DbResult<()> {
        let mut catalog = self.schema.write().unwrap();

        self.engine.iterate_prefix(b"META:DB:", &mut |_, v| {
            let db: Database = serde_json::from_slice(v)?;
            catalog.databases.insert(db.name.clone(), db);
            Ok(IterFlow::Continue)
        })?;

        self.engine.iterate_prefix(b"META:TBL:", &mut |k, v| {
            // META:TBL:<db-id>:<tbl-id>
            let key = String::from_utf8_lossy(k);
            let db_id = match key.split(':').nth(2) {
                Some(id) => id.to_string(),
                None => return Ok(IterFlow::Continue),
            };
            let table: Table = serde_json::from_slice(v)?;
            if let Some(db) = catalog.databases.values_mut().find(|db| db.id == db_id) {
                db.tables.insert(table.name.clone(), table);
            }
            Ok(IterFlow::Continue)
        })?;

        Ok(())
    }

    pub fn fetch_databases(&self) -> Vec<String> {
        let catalog = self.schema.read().unwrap();
        catalog.databases.keys().cloned().collect()
    }

    pub fn fetch_tables(&self, db_name: &str) -> DbResult<Vec<String>> {
        let catalog = self.schema.read().unwrap();
        let db = catalog
            .databases
            .get(db_name)
            .ok_or_else(|| DbError::NotFound(format!("database '{}'", db_name)))?;
        Ok(db.tables.keys().cloned().collect())
    }

    /// Renames a database. Data keys address the immutable ID, so only the
    /// MAP and META keys are rewritten.
    pub fn rename_database(&self, old_name: &str, new_name: &str) -> DbResult<()> {
        {
            let mut catalog = self.schema.write().unwrap();
            if catalog.databases.contains_key(new_name) {
                return Err(DbError::DatabaseExists(new_name.to_string()));
            }
            let mut db = catalog
                .databases
                .remove(old_name)
                .ok_or_else(|| DbError::NotFound(format!("database '{}'", old_name)))?;

            db.name = new_name.to_string();

            self.engine.delete(&keys::map_db_key(old_name))?;
            self.engine.set(&keys::map_db_key(new_name), db.id.as_bytes())?;
            self.engine
                .set(&keys::meta_db_key(&db.id), &serde_json::to_vec(&db)?)?;

            catalog.databases.insert(new_name.to_string(), db);
        }
        self.update_default_protocol()
    }

    /// Drops a database's MAP and META keys. DATA and IDX keys are left for
    /// a future GC sweep.
    pub fn drop_database(&self, name: &str) -> DbResult<()> {
        {
            let mut catalog = self.schema.write().unwrap();
            let db = catalog
                .databases
                .remove(name)
                .ok_or_else(|| DbError::NotFound(format!("database '{}'", name)))?;

            self.engine.delete(&keys::map_db_key(name))?;
            self.engine.delete(&keys::meta_db_key(&db.id))?;
        }
        self.update_default_protocol()
    }

    pub fn rename_table(&self, db_name: &str, old_name: &str, new_name: &str) -> DbResult<()> {
        {
            let mut catalog = self.schema.write().unwrap();
            let db = catalog
                .databases
                .get_mut(db_name)
                .ok_or_else(|| DbError::NotFound(format!("database '{}'", db_name)))?;
            if db.tables.contains_key(new_name) {
                return Err(DbError::TableExists(new_name.to_string()));
            }
            let mut table = db
                .tables
                .remove(old_name)
                .ok_or_else(|| DbError::NotFound(format!("table '{}'", old_name)))?;

            table.name = new_name.to_string();

            self.engine.delete(&keys::map_table_key(&db.id, old_name))?;
            self.engine
                .set(&keys::map_table_key(&db.id, new_name), table.id.as_bytes())?;
            self.engine.set(
                &keys::meta_table_key(&db.id, &table.id),
                &serde_json::to_vec(&table)?,
            )?;

            db.tables.insert(new_name.to_string(), table);
        }
        self.update_default_protocol()
    }

    pub fn drop_table(&self, db_name: &str, table_name: &str) -> DbResult<()> {
        {
            let mut catalog = self.schema.write().unwrap();
            let db = catalog
                .databases
                .get_mut(db_name)
                .ok_or_else(|| DbError::NotFound(format!("database '{}'", db_name)))?;
            let table = db
                .tables
                .remove(table_name)
                .ok_or_else(|| DbError::NotFound(format!("table '{}'", table_name)))?;

            self.engine.delete(&keys::map_table_key(&db.id, table_name))?;
            self.engine.delete(&keys::meta_table_key(&db.id, &table.id))?;
        }
        self.update_default_protocol()
    }

    /// Applies one structural change to a table and persists the new
    /// metadata. Column IDs are immutable, so renames leave index keys
    /// valid; dropping a column sweeps its index prefix.
    pub fn alter_table(&self, db_name: &str, table_name: &str, change: TableChange) -> DbResult<()> {
        // Renaming a column may rewrite table.pk, which data operations
        // read without the catalog lock held; quiesce them first.
        let _migration_guard = match change {
            TableChange::RenameColumn { .. } => Some(self.migration_lock.write().unwrap()),
            _ => None,
        };

        {
            let mut catalog = self.schema.write().unwrap();
            let db = catalog
                .databases
                .get_mut(db_name)
                .ok_or_else(|| DbError::NotFound(format!("database '{}'", db_name)))?;
            let db_id = db.id.clone();
            let table = db
                .tables
                .get_mut(table_name)
                .ok_or_else(|| DbError::NotFound(format!("table '{}'", table_name)))?;

            match change {
                TableChange::AddColumn(mut col) => {
                    if table.columns.contains_key(&col.name) {
                        return Err(DbError::InvalidInput(format!(
                            "column '{}' already exists",
                            col.name
                        )));
                    }
                    col.id = generate_id();
                    col.indexed = true;
                    table.columns.insert(col.name.clone(), col);
                }
                TableChange::DropColumn { name } => {
                    if name == table.pk {
                        return Err(DbError::InvalidInput(
                            "cannot drop primary key column".to_string(),
                        ));
                    }
                    let col = table
                        .columns
                        .remove(&name)
                        .ok_or_else(|| DbError::NotFound(format!("column '{}'", name)))?;

                    let prefix = format!("IDX:{}:{}:{}:", db_id, table.id, col.id);
                    let mut stale = Vec::new();
                    self.engine.iterate_prefix(prefix.as_bytes(), &mut |k, _| {
                        stale.push(k.to_vec());
                        Ok(IterFlow::Continue)
                    })?;
                    for key in stale {
                        self.engine.delete(&key)?;
                    }
                }
                TableChange::ModifyColumn {
                    name,
                    data_type,
                    formatter,
                    validator,
                    default_value,
                } => {
                    let col = table
                        .columns
                        .get_mut(&name)
                        .ok_or_else(|| DbError::NotFound(format!("column '{}'", name)))?;
                    if let Some(data_type) = data_type {
                        col.data_type = data_type;
                    }
                    if let Some(formatter) = formatter {
                        col.formatter = formatter;
                    }
                    if let Some(validator) = validator {
                        col.validator = validator;
                    }
                    if let Some(default_value) = default_value {
                        col.default_value = Some(default_value);
                    }
                    col.indexed = true;
                }
                TableChange::RenameColumn { old_name, new_name } => {
                    if table.columns.contains_key(&new_name) {
                        return Err(DbError::InvalidInput(format!(
                            "column '{}' already exists",
                            new_name
                        )));
                    }
                    let mut col = table
                        .columns
                        .remove(&old_name)
                        .ok_or_else(|| DbError::NotFound(format!("column '{}'", old_name)))?;
                    col.name = new_name.clone();
                    table.columns.insert(new_name.clone(), col);
                    if table.pk == old_name {
                        table.pk = new_name;
                    }
                }
            }

            self.engine.set(
                &keys::meta_table_key(&db_id, &table.id),
                &serde_json::to_vec(&*table)?,
            )?;
        }
        self.update_default_protocol()
    }
}
