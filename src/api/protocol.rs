use serde_json::{json, Map, Value as Json};

use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::store::QueryProtocol;

/// `protocol` target: `[command, ...args]` with `desc | set | drop`.
pub fn handle(db: &Db, payload: &str) -> DbResult<Json> {
    let command: Vec<Json> = serde_json::from_str(payload)
        .map_err(|e| DbError::InvalidInput(format!("invalid payload: {}", e)))?;

    let mut parts = command.into_iter();
    let cmd = match parts.next() {
        Some(Json::String(cmd)) => cmd,
        Some(_) => return Err(DbError::InvalidInput("invalid command type".to_string())),
        None => return Err(DbError::InvalidInput("empty command".to_string())),
    };
    let args: Vec<Json> = parts.collect();

    match cmd.as_str() {
        "desc" => desc(db, &args),
        "set" => set(db, args),
        "drop" => drop_protocol(db, &args),
        other => Err(DbError::InvalidInput(format!("unknown command: {}", other))),
    }
}

/// Lists all protocols, optionally navigating into them by path keys.
fn desc(db: &Db, args: &[Json]) -> DbResult<Json> {
    let mut protocols = Map::new();
    for password in db.all_protocols() {
        if let Ok(proto) = db.get_protocol(&password) {
            protocols.insert(password, serde_json::to_value(&*proto)?);
        }
    }

    let mut current = Json::Object(protocols);
    for key in args {
        let key = key
            .as_str()
            .ok_or_else(|| DbError::InvalidInput("invalid key type".to_string()))?;
        current = match current {
            Json::Object(mut map) => map
                .remove(key)
                .ok_or_else(|| DbError::NotFound(format!("protocol path '{}'", key)))?,
            _ => return Err(DbError::NotFound(format!("protocol path '{}'", key))),
        };
    }
    Ok(current)
}

fn set(db: &Db, mut args: Vec<Json>) -> DbResult<Json> {
    if args.len() != 2 {
        return Err(DbError::InvalidInput("set expects 2 args (password, data)".to_string()));
    }
    let data = args.pop().expect("length checked");
    let password = match args.pop() {
        Some(Json::String(p)) => p,
        _ => return Err(DbError::InvalidInput("invalid password type".to_string())),
    };

    let protocol: QueryProtocol = serde_json::from_value(data)
        .map_err(|e| DbError::InvalidInput(format!("invalid protocol: {}", e)))?;
    db.set_protocol(&password, protocol)?;
    Ok(json!("success"))
}

fn drop_protocol(db: &Db, args: &[Json]) -> DbResult<Json> {
    let password = match args {
        [Json::String(p)] => p,
        _ => return Err(DbError::InvalidInput("drop expects 1 arg (password)".to_string())),
    };
    db.delete_protocol(password)?;
    Ok(json!("success"))
}
