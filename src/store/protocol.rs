use std::sync::Arc;

use super::keys;
use super::types::{Entity, ProtocolModule, QueryProtocol};
use super::StoreManager;
use crate::engine::IterFlow;
use crate::error::{DbError, DbResult};

impl StoreManager {
    /// Validates a protocol against the current schema, caches it and
    /// persists it under `PROTO:<password>`.
    pub fn set_protocol(&self, password: &str, protocol: QueryProtocol) -> DbResult<()> {
        let mut catalog = self.schema.write().unwrap();

        validate_protocol(&catalog.databases, &protocol)?;

        let bytes = serde_json::to_vec(&protocol)?;
        self.engine.set(&keys::protocol_key(password), &bytes)?;

        catalog
            .protocols
            .insert(password.to_string(), Arc::new(protocol));
        Ok(())
    }

    /// Reads from the in-memory cache, which is authoritative.
    pub fn get_protocol(&self, password: &str) -> DbResult<Arc<QueryProtocol>> {
        let catalog = self.schema.read().unwrap();
        catalog
            .protocols
            .get(password)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("protocol '{}'", password)))
    }

    pub fn all_protocols(&self) -> Vec<String> {
        let catalog = self.schema.read().unwrap();
        catalog.protocols.keys().cloned().collect()
    }

    pub fn delete_protocol(&self, password: &str) -> DbResult<()> {
        let mut catalog = self.schema.write().unwrap();
        catalog.protocols.remove(password);
        self.engine.delete(&keys::protocol_key(password))
    }

    /// Startup scan of `PROTO:*` rebuilding the cache.
    pub fn load_protocols(&self) -> DbResult<()> {
        let mut catalog = self.schema.write().unwrap();
        self.engine.iterate_prefix(b"PROTO:", &mut |k, v| {
            let key = String::from_utf8_lossy(k);
            let password = match key.strip_prefix("PROTO:") {
                Some(p) => p.to_string(),
                None => return Ok(IterFlow::Continue),
            };
            let protocol: QueryProtocol = serde_json::from_slice(v)?;
            catalog.protocols.insert(password, Arc::new(protocol));
            Ok(IterFlow::Continue)
        })
    }

    /// Rebuilds the "default" protocol so it mirrors the physical schema
    /// with identity aliases. Called after every schema mutation; safe to
    /// call redundantly.
    pub fn update_default_protocol(&self) -> DbResult<()> {
        let protocol: QueryProtocol = {
            let catalog = self.schema.read().unwrap();
            catalog
                .databases
                .iter()
                .map(|(db_name, db)| {
                    let entities = db
                        .tables
                        .iter()
                        .map(|(table_name, table)| {
                            let entity = Entity {
                                table: table_name.clone(),
                                fields: table
                                    .columns
                                    .keys()
                                    .map(|col| (col.clone(), col.clone()))
                                    .collect(),
                                ..Default::default()
                            };
                            (table_name.clone(), entity)
                        })
                        .collect();
                    (
                        db_name.clone(),
                        ProtocolModule {
                            database: db_name.clone(),
                            entities,
                        },
                    )
                })
                .collect()
        };

        self.set_protocol("default", protocol)
    }

    /// Looks up the context query declared for an entity, if any. Entity
    /// found but key absent yields an empty string.
    pub fn proto_context(&self, password: &str, entity_alias: &str, context_key: &str) -> DbResult<String> {
        let protocol = self.get_protocol(password)?;
        for module in protocol.values() {
            if let Some(entity) = module.entities.get(entity_alias) {
                return Ok(entity
                    .context
                    .get(context_key)
                    .cloned()
                    .unwrap_or_default());
            }
        }
        Err(DbError::NotFound(format!("entity '{}'", entity_alias)))
    }

    /// Converts an entity alias to the physical (database, table) names.
    pub fn resolve_entity(&self, password: &str, entity_alias: &str) -> DbResult<(String, String)> {
        let protocol = self.get_protocol(password)?;
        for module in protocol.values() {
            if let Some(entity) = module.entities.get(entity_alias) {
                return Ok((module.database.clone(), entity.table.clone()));
            }
        }
        Err(DbError::NotFound(format!(
            "entity '{}' in protocol '{}'",
            entity_alias, password
        )))
    }

    /// Converts an alias field to the physical column name.
    pub fn resolve_field(&self, password: &str, entity_alias: &str, alias_field: &str) -> DbResult<String> {
        let protocol = self.get_protocol(password)?;
        for module in protocol.values() {
            if let Some(entity) = module.entities.get(entity_alias) {
                return entity
                    .fields
                    .get(alias_field)
                    .cloned()
                    .ok_or_else(|| {
                        DbError::NotFound(format!(
                            "field '{}' in entity '{}'",
                            alias_field, entity_alias
                        ))
                    });
            }
        }
        Err(DbError::NotFound(format!("entity '{}'", entity_alias)))
    }
}

/// Checks that every database, table, field, relation entity and mtm
/// through-table a protocol references exists.
fn validate_protocol(
    databases: &std::collections::HashMap<String, super::types::Database>,
    protocol: &QueryProtocol,
) -> DbResult<()> {
    for module in protocol.values() {
        let db = databases.get(&module.database).ok_or_else(|| {
            DbError::ProtocolViolation(format!("database '{}' does not exist", module.database))
        })?;

        for (entity_name, entity) in &module.entities {
            let table = db.tables.get(&entity.table).ok_or_else(|| {
                DbError::ProtocolViolation(format!(
                    "entity '{}': table '{}' does not exist",
                    entity_name, entity.table
                ))
            })?;

            for (alias, physical) in &entity.fields {
                if !table.columns.contains_key(physical) {
                    return Err(DbError::ProtocolViolation(format!(
                        "entity '{}': field '{}' (alias '{}') does not exist in table '{}'",
                        entity_name, physical, alias, entity.table
                    )));
                }
            }

            for (rel_name, relation) in &entity.relations {
                let target_exists = protocol
                    .values()
                    .any(|m| m.entities.contains_key(&relation.entity));
                if !target_exists {
                    return Err(DbError::ProtocolViolation(format!(
                        "entity '{}': relation '{}' references non-existent entity '{}'",
                        entity_name, rel_name, relation.entity
                    )));
                }

                let fk_parts: Vec<&str> = relation.fkfield.split(':').collect();
                if fk_parts.len() < 2 {
                    return Err(DbError::ProtocolViolation(format!(
                        "entity '{}': relation '{}' has invalid FK field format",
                        entity_name, rel_name
                    )));
                }

                if relation.kind == "mtm" && !relation.through.is_empty()
                    && !db.tables.contains_key(&relation.through)
                {
                    return Err(DbError::ProtocolViolation(format!(
                        "entity '{}': relation '{}' through table '{}' does not exist",
                        entity_name, rel_name, relation.through
                    )));
                }
            }
        }
    }
    Ok(())
}
