use std::collections::HashSet;

use serde_json::Value;

use super::buffer::BufferHit;
use super::keys;
use super::types::{Row, Table};
use super::StoreManager;
use crate::engine::IterFlow;
use crate::error::{DbError, DbResult};

/// Renders a column value the way index keys and FK lookups expect:
/// integral numbers without a fraction or exponent, floats trimmed.
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                format!("{}", n.as_f64().unwrap_or(0.0))
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

impl StoreManager {
    /// Returns the database ID and a snapshot of the table definition.
    pub fn table_schema(&self, db_name: &str, table_name: &str) -> DbResult<(String, Table)> {
        let catalog = self.schema.read().unwrap();
        let db = catalog
            .databases
            .get(db_name)
            .ok_or_else(|| DbError::NotFound(format!("database '{}'", db_name)))?;
        let table = db
            .tables
            .get(table_name)
            .ok_or_else(|| DbError::NotFound(format!("table '{}.{}'", db_name, table_name)))?;
        Ok((db.id.clone(), table.clone()))
    }

    /// Adds a row. The caller has already validated and formatted the data;
    /// this layer enforces PK shape, duplicate detection against the live
    /// view (buffer over engine), and index maintenance.
    pub fn insert(&self, db_name: &str, table_name: &str, row: Row) -> DbResult<()> {
        let _guard = self.migration_lock.read().unwrap();

        let (db_id, table) = self.table_schema(db_name, table_name)?;

        let pk_value = row
            .get(&table.pk)
            .ok_or_else(|| DbError::InvalidInput(format!("primary key '{}' missing", table.pk)))?;
        let pk = stringify_value(pk_value);
        if pk.contains(':') {
            return Err(DbError::InvalidInput(format!(
                "primary key value '{}' must not contain ':'",
                pk
            )));
        }

        let data_key = String::from_utf8(keys::data_key(&db_id, &table.id, &pk)).unwrap();
        match self.buffer.get(&data_key) {
            Some(BufferHit::Alive(_)) => return Err(DbError::Duplicate(pk)),
            Some(BufferHit::Deleted) => {}
            None => {
                if self.engine.get(data_key.as_bytes()).is_ok() {
                    return Err(DbError::Duplicate(pk));
                }
            }
        }

        let bytes = serde_json::to_vec(&row)?;
        self.buffer.put(data_key, bytes);

        for (col_name, col) in &table.columns {
            if !col.indexed {
                continue;
            }
            if let Some(value) = row.get(col_name) {
                let idx_key = keys::index_key(&db_id, &table.id, &col.id, &stringify_value(value), &pk);
                self.buffer
                    .put(String::from_utf8(idx_key).unwrap(), pk.clone().into_bytes());
            }
        }

        Ok(())
    }

    /// Reads a row by primary key, buffer first (a tombstone hides any
    /// engine value), then the engine.
    pub fn get(&self, db_name: &str, table_name: &str, pk: &str) -> DbResult<Row> {
        let _guard = self.migration_lock.read().unwrap();
        self.get_inner(db_name, table_name, pk)
    }

    // Body of `get` without the migration lock, for callers already
    // holding it.
    fn get_inner(&self, db_name: &str, table_name: &str, pk: &str) -> DbResult<Row> {
        let (db_id, table) = self.table_schema(db_name, table_name)?;
        let data_key = String::from_utf8(keys::data_key(&db_id, &table.id, pk)).unwrap();

        match self.buffer.get(&data_key) {
            Some(BufferHit::Alive(bytes)) => Ok(serde_json::from_slice(&bytes)?),
            Some(BufferHit::Deleted) => Err(DbError::NotFound(format!("row '{}'", pk))),
            None => {
                let bytes = self
                    .engine
                    .get(data_key.as_bytes())
                    .map_err(|_| DbError::NotFound(format!("row '{}'", pk)))?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    /// Overwrites a row. The caller supplies the fully merged row; index
    /// entries are rewritten for every column whose value changed.
    pub fn update(&self, db_name: &str, table_name: &str, pk: &str, new_row: Row) -> DbResult<()> {
        let _guard = self.migration_lock.read().unwrap();

        let old_row = self.get_inner(db_name, table_name, pk)?;
        let (db_id, table) = self.table_schema(db_name, table_name)?;

        let bytes = serde_json::to_vec(&new_row)?;
        let data_key = String::from_utf8(keys::data_key(&db_id, &table.id, pk)).unwrap();
        self.buffer.put(data_key, bytes);

        for (col_name, col) in &table.columns {
            if !col.indexed {
                continue;
            }
            let old_value = old_row.get(col_name).map(stringify_value);
            let new_value = new_row.get(col_name).map(stringify_value);
            if old_value == new_value {
                continue;
            }
            if let Some(old) = old_value {
                let key = keys::index_key(&db_id, &table.id, &col.id, &old, pk);
                self.buffer.delete(String::from_utf8(key).unwrap());
            }
            if let Some(new) = new_value {
                let key = keys::index_key(&db_id, &table.id, &col.id, &new, pk);
                self.buffer
                    .put(String::from_utf8(key).unwrap(), pk.as_bytes().to_vec());
            }
        }

        Ok(())
    }

    /// Removes a row and every index entry derived from it.
    pub fn delete(&self, db_name: &str, table_name: &str, pk: &str) -> DbResult<()> {
        let _guard = self.migration_lock.read().unwrap();

        let old_row = self.get_inner(db_name, table_name, pk)?;
        let (db_id, table) = self.table_schema(db_name, table_name)?;

        let data_key = String::from_utf8(keys::data_key(&db_id, &table.id, pk)).unwrap();
        self.buffer.delete(data_key);

        for (col_name, col) in &table.columns {
            if !col.indexed {
                continue;
            }
            if let Some(value) = old_row.get(col_name) {
                let key = keys::index_key(&db_id, &table.id, &col.id, &stringify_value(value), pk);
                self.buffer.delete(String::from_utf8(key).unwrap());
            }
        }

        Ok(())
    }

    /// Returns every PK whose index entry matches
    /// `IDX:<db>:<tbl>:<col>:<value>:`. Unions live buffer entries with the
    /// engine scan, skipping keys tombstoned in the buffer; PKs are deduped.
    pub fn pks_by_index(
        &self,
        db_name: &str,
        table_name: &str,
        col_name: &str,
        value: &str,
    ) -> DbResult<Vec<String>> {
        let (db_id, table) = self.table_schema(db_name, table_name)?;
        let col = table
            .columns
            .get(col_name)
            .ok_or_else(|| DbError::NotFound(format!("column '{}'", col_name)))?;

        let prefix = format!("IDX:{}:{}:{}:{}:", db_id, table.id, col.id, value);

        let mut pks = Vec::new();
        let mut seen = HashSet::new();

        self.buffer.for_each_with_prefix(&prefix, |_, entry| {
            if entry.tombstone {
                return;
            }
            let pk = String::from_utf8_lossy(&entry.value).into_owned();
            if seen.insert(pk.clone()) {
                pks.push(pk);
            }
        });

        self.engine.iterate_prefix(prefix.as_bytes(), &mut |k, v| {
            let key = String::from_utf8_lossy(k);
            if matches!(self.buffer.get(&key), Some(BufferHit::Deleted)) {
                return Ok(IterFlow::Continue);
            }
            let pk = String::from_utf8_lossy(v).into_owned();
            if seen.insert(pk.clone()) {
                pks.push(pk);
            }
            Ok(IterFlow::Continue)
        })?;

        Ok(pks)
    }

    /// Returns every live PK in the table.
    pub fn all_pks(&self, db_name: &str, table_name: &str) -> DbResult<Vec<String>> {
        let (db_id, table) = self.table_schema(db_name, table_name)?;
        let prefix = format!("DATA:{}:{}:", db_id, table.id);

        let mut pks = Vec::new();
        let mut seen = HashSet::new();

        self.buffer.for_each_with_prefix(&prefix, |key, entry| {
            let pk = key[prefix.len()..].to_string();
            if entry.tombstone {
                // Mark as seen so the engine scan does not resurrect it.
                seen.insert(pk);
            } else if seen.insert(pk.clone()) {
                pks.push(pk);
            }
        });

        self.engine.iterate_prefix(prefix.as_bytes(), &mut |k, _| {
            let key = String::from_utf8_lossy(k);
            let pk = key[prefix.len()..].to_string();
            if seen.insert(pk.clone()) {
                pks.push(pk);
            }
            Ok(IterFlow::Continue)
        })?;

        Ok(pks)
    }

    /// Fetches rows for the given PKs, skipping any that vanished.
    pub fn rows_by_pks(&self, db_name: &str, table_name: &str, pks: &[String]) -> DbResult<Vec<Row>> {
        let mut rows = Vec::with_capacity(pks.len());
        for pk in pks {
            match self.get(db_name, table_name, pk) {
                Ok(row) => rows.push(row),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(rows)
    }

    /// Increments and returns the sequence counter for a column. The
    /// read-modify-write cycle is serialized by a dedicated mutex; values
    /// persist as ASCII decimal directly in the engine.
    pub fn next_sequence(&self, db_name: &str, table_name: &str, col_name: &str) -> DbResult<i64> {
        let (db_id, table) = self.table_schema(db_name, table_name)?;
        let col = table
            .columns
            .get(col_name)
            .ok_or_else(|| DbError::NotFound(format!("column '{}'", col_name)))?;
        let key = keys::sequence_key(&db_id, &table.id, &col.id);

        let _guard = self.seq_lock.lock().unwrap();

        let current = match self.engine.get(&key) {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .parse::<i64>()
                .map_err(|e| DbError::Internal(format!("corrupt sequence value: {}", e)))?,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        let next = current + 1;
        self.engine.set(&key, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Drains the buffer and commits it: one batch for live entries, then
    /// per-key deletes for tombstones. At-most-once: a failed flush does
    /// not restore the drained contents.
    pub fn flush(&self) -> DbResult<()> {
        let _guard = self.flush_lock.lock().unwrap();

        let drained = self.buffer.drain();
        if drained.is_empty() {
            return Ok(());
        }

        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (key, entry) in drained {
            if entry.tombstone {
                deletes.push(key.into_bytes());
            } else {
                puts.push((key.into_bytes(), entry.value));
            }
        }

        if !puts.is_empty() {
            self.engine.batch_set(&puts)?;
        }
        for key in deletes {
            self.engine.delete(&key)?;
        }

        Ok(())
    }
}
