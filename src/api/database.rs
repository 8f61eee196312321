use serde::Deserialize;
use serde_json::{json, Value as Json};

use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::store::{Row, Table};

/// RPC-style call over the facade: `{ "function": ..., "args": [...] }`.
#[derive(Deserialize)]
struct DatabaseRequest {
    function: String,
    #[serde(default)]
    args: Vec<Json>,
}

pub fn handle(db: &Db, payload: &str) -> DbResult<Json> {
    let req: DatabaseRequest = serde_json::from_str(payload)
        .map_err(|e| DbError::InvalidInput(format!("invalid payload: {}", e)))?;
    call(db, &req.function, req.args)
}

fn call(db: &Db, function: &str, args: Vec<Json>) -> DbResult<Json> {
    match function {
        "GetDatabases" => Ok(json!(db.fetch_databases())),

        "GetTables" => {
            let [name] = take::<1>(function, args)?;
            Ok(json!(db.fetch_tables(&as_string(name)?)?))
        }

        "CreateDatabase" => {
            let [name] = take::<1>(function, args)?;
            db.create_database(&as_string(name)?)?;
            Ok(json!("success"))
        }

        "DropDatabase" => {
            let [name] = take::<1>(function, args)?;
            db.drop_database(&as_string(name)?)?;
            Ok(json!("success"))
        }

        "CreateTable" => {
            let [db_name, table] = take::<2>(function, args)?;
            let table: Table = serde_json::from_value(table)
                .map_err(|e| DbError::InvalidInput(format!("invalid table definition: {}", e)))?;
            db.create_table(&as_string(db_name)?, table)?;
            Ok(json!("success"))
        }

        "DropTable" => {
            let [db_name, table_name] = take::<2>(function, args)?;
            db.drop_table(&as_string(db_name)?, &as_string(table_name)?)?;
            Ok(json!("success"))
        }

        "Insert" => {
            let [db_name, table_name, data] = take::<3>(function, args)?;
            let row = as_row(data)?;
            let pk = db.insert(&as_string(db_name)?, &as_string(table_name)?, row)?;
            Ok(json!(pk))
        }

        "Get" => {
            let [db_name, table_name, pk] = take::<3>(function, args)?;
            let row = db.get(&as_string(db_name)?, &as_string(table_name)?, &as_string(pk)?)?;
            Ok(Json::Object(row))
        }

        "Update" => {
            let [db_name, table_name, pk, data] = take::<4>(function, args)?;
            let row = as_row(data)?;
            db.update(&as_string(db_name)?, &as_string(table_name)?, &as_string(pk)?, row)?;
            Ok(json!("success"))
        }

        "Delete" => {
            let [db_name, table_name, pk] = take::<3>(function, args)?;
            db.delete(&as_string(db_name)?, &as_string(table_name)?, &as_string(pk)?)?;
            Ok(json!("success"))
        }

        other => Err(DbError::InvalidInput(format!("function '{}' not found", other))),
    }
}

fn take<const N: usize>(function: &str, args: Vec<Json>) -> DbResult<[Json; N]> {
    args.try_into()
        .map_err(|_| DbError::InvalidInput(format!("{} expects {} arg(s)", function, N)))
}

fn as_string(value: Json) -> DbResult<String> {
    match value {
        Json::String(s) => Ok(s),
        other => Err(DbError::InvalidInput(format!("expected string, got {}", other))),
    }
}

fn as_row(value: Json) -> DbResult<Row> {
    match value {
        Json::Object(map) => Ok(map),
        other => Err(DbError::InvalidInput(format!("expected object, got {}", other))),
    }
}
