use serde::Deserialize;
use serde_json::{json, Value as Json};

use crate::db::Db;
use crate::dsl::{self, CancelFlag};
use crate::error::{DbError, DbResult};
use crate::store::Row;

#[derive(Deserialize)]
struct InsertPayload {
    db: String,
    table: String,
    records: Row,
}

#[derive(Deserialize)]
struct UpdatePayload {
    db: String,
    table: String,
    records: Row,
    #[serde(default)]
    query: String,
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    protopass: String,
}

#[derive(Deserialize)]
struct DeletePayload {
    db: String,
    table: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    protopass: String,
}

pub fn insert(db: &Db, payload: &str) -> DbResult<Json> {
    let req: InsertPayload = serde_json::from_str(payload)
        .map_err(|e| DbError::InvalidInput(format!("invalid payload: {}", e)))?;
    let pk = db.insert(&req.db, &req.table, req.records)?;
    Ok(json!(pk))
}

pub fn update(db: &Db, payload: &str, cancel: CancelFlag) -> DbResult<Json> {
    let req: UpdatePayload = serde_json::from_str(payload)
        .map_err(|e| DbError::InvalidInput(format!("invalid payload: {}", e)))?;

    let pks = resolve_pks(db, &req.query, &req.ids, &req.protopass, cancel)?;
    for pk in &pks {
        db.update(&req.db, &req.table, pk, req.records.clone())?;
    }
    Ok(json!("success"))
}

pub fn delete(db: &Db, payload: &str, cancel: CancelFlag) -> DbResult<Json> {
    let req: DeletePayload = serde_json::from_str(payload)
        .map_err(|e| DbError::InvalidInput(format!("invalid payload: {}", e)))?;

    let pks = resolve_pks(db, &req.query, &req.ids, &req.protopass, cancel)?;
    for pk in &pks {
        db.delete(&req.db, &req.table, pk)?;
    }
    Ok(json!("success"))
}

/// Target rows for update/delete: a DSL query that must return a list of
/// PKs, overridden by an explicit `ids` list when present.
fn resolve_pks(
    db: &Db,
    query: &str,
    ids: &[String],
    protopass: &str,
    cancel: CancelFlag,
) -> DbResult<Vec<String>> {
    let mut pks = Vec::new();

    if !query.is_empty() {
        let result = dsl::execute(db, protopass, query, "", &[], cancel)?;
        match result {
            Json::Null => {}
            Json::Array(items) => {
                for item in items {
                    match item {
                        Json::String(s) => pks.push(s),
                        _ => {
                            return Err(DbError::InvalidInput(
                                "ids not returned by query".to_string(),
                            ))
                        }
                    }
                }
            }
            _ => return Err(DbError::InvalidInput("ids not returned by query".to_string())),
        }
    }

    if !ids.is_empty() {
        pks = ids.to_vec();
    }

    Ok(pks)
}
