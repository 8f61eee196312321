use std::collections::HashMap;

use serde_json::{json, Map, Value as Json};

use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::store::{Column, DataType, Table, TableChange};

/// `schema` target:
/// `[command, ...args]` with
/// `desc | databases | tables | create | set | drop | alter | rename`.
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
        "databases" => Ok(json!(db.fetch_databases())),
        "tables" => tables(db, &args),
        "create" => create(db, &args),
        "set" => set(db, &args),
        "drop" => drop_schema(db, &args),
        "alter" => alter(db, &args),
        "rename" => rename(db, &args),
        other => Err(DbError::InvalidInput(format!("unknown command: {}", other))),
    }
}

fn arg_str<'a>(args: &'a [Json], idx: usize, what: &str) -> DbResult<&'a str> {
    args.get(idx)
        .and_then(Json::as_str)
        .ok_or_else(|| DbError::InvalidInput(format!("invalid {}", what)))
}

fn desc(db: &Db, args: &[Json]) -> DbResult<Json> {
    match args.len() {
        0 => Ok(json!(db.fetch_databases())),
        1 => Ok(json!(db.fetch_tables(arg_str(args, 0, "database name")?)?)),
        _ => {
            let table = db.table_schema(
                arg_str(args, 0, "database name")?,
                arg_str(args, 1, "table name")?,
            )?;
            Ok(serde_json::to_value(table)?)
        }
    }
}

fn tables(db: &Db, args: &[Json]) -> DbResult<Json> {
    Ok(json!(db.fetch_tables(arg_str(args, 0, "database name")?)?))
}

fn create(db: &Db, args: &[Json]) -> DbResult<Json> {
    let target = arg_str(args, 0, "create type")?;
    match target {
        "db" | "database" => {
            db.create_database(arg_str(args, 1, "database name")?)?;
            Ok(json!("success"))
        }
        "table" => {
            // create table <db> <table> <def>
            if args.len() != 4 {
                return Err(DbError::InvalidInput(
                    "create table usage: create table <db> <table> <def>".to_string(),
                ));
            }
            let db_name = arg_str(args, 1, "database name")?;
            let table_name = arg_str(args, 2, "table name")?;
            let def = args[3]
                .as_object()
                .ok_or_else(|| DbError::InvalidInput("invalid column definition".to_string()))?;
            let table = parse_table_definition(table_name, def)?;
            db.create_table(db_name, table)?;
            Ok(json!("success"))
        }
        other => Err(DbError::InvalidInput(format!("unknown create target: {}", other))),
    }
}

/// Differential synchronization to a full target schema: creates missing
/// databases and tables, adds/modifies/drops columns to match, and never
/// drops databases the input does not name.
fn set(db: &Db, args: &[Json]) -> DbResult<Json> {
    let target = args
        .first()
        .and_then(Json::as_object)
        .ok_or_else(|| {
            DbError::InvalidInput("invalid schema format, expected JSON object".to_string())
        })?;
    sync_databases(db, target)?;
    Ok(json!("success"))
}

fn sync_databases(db: &Db, target: &Map<String, Json>) -> DbResult<()> {
    let existing = db.fetch_databases();

    for (db_name, tables_value) in target {
        let tables = tables_value.as_object().ok_or_else(|| {
            DbError::InvalidInput(format!("invalid format for database {}", db_name))
        })?;

        if !existing.contains(db_name) {
            db.create_database(db_name)?;
        }
        sync_tables(db, db_name, tables)?;
    }

    Ok(())
}

fn sync_tables(db: &Db, db_name: &str, target: &Map<String, Json>) -> DbResult<()> {
    let existing = db.fetch_tables(db_name)?;

    for (table_name, cols_value) in target {
        let cols = cols_value.as_object().ok_or_else(|| {
            DbError::InvalidInput(format!("invalid format for table {}.{}", db_name, table_name))
        })?;
        let target_table = parse_table_definition(table_name, cols)?;

        if existing.contains(table_name) {
            sync_columns(db, db_name, table_name, &target_table)?;
        } else {
            db.create_table(db_name, target_table)?;
        }
    }

    for table_name in existing {
        if !target.contains_key(&table_name) {
            db.drop_table(db_name, &table_name)?;
        }
    }

    Ok(())
}

fn sync_columns(db: &Db, db_name: &str, table_name: &str, target: &Table) -> DbResult<()> {
    let old_table = db.table_schema(db_name, table_name)?;

    for (col_name, new_col) in &target.columns {
        match old_table.columns.get(col_name) {
            None => {
                db.alter_table(db_name, table_name, TableChange::AddColumn(new_col.clone()))?;
            }
            Some(old_col) => {
                let changed = old_col.data_type != new_col.data_type
                    || old_col.formatter != new_col.formatter
                    || old_col.validator != new_col.validator
                    || !default_eq(&old_col.default_value, &new_col.default_value);
                if changed {
                    db.alter_table(
                        db_name,
                        table_name,
                        TableChange::ModifyColumn {
                            name: col_name.clone(),
                            data_type: Some(new_col.data_type),
                            formatter: Some(new_col.formatter.clone()),
                            validator: Some(new_col.validator.clone()),
                            default_value: new_col.default_value.clone(),
                        },
                    )?;
                }
            }
        }
    }

    for col_name in old_table.columns.keys() {
        if !target.columns.contains_key(col_name) && *col_name != old_table.pk {
            db.alter_table(
                db_name,
                table_name,
                TableChange::DropColumn {
                    name: col_name.clone(),
                },
            )?;
        }
    }

    Ok(())
}

fn default_eq(a: &Option<Json>, b: &Option<Json>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn parse_table_definition(name: &str, cols_def: &Map<String, Json>) -> DbResult<Table> {
    let mut columns = HashMap::new();

    for (col_name, def) in cols_def {
        let props = def.as_object().ok_or_else(|| {
            DbError::InvalidInput(format!("invalid column definition for {}", col_name))
        })?;

        let data_type = parse_data_type(props.get("type"))?;
        let mut validator = prop_str(props, "validator");

        // blank: "no" forces a required rule.
        if prop_str(props, "blank") == "no" && !validator.contains("required") {
            validator = if validator.is_empty() {
                "required".to_string()
            } else {
                format!("required|{}", validator)
            };
        }

        columns.insert(
            col_name.clone(),
            Column {
                id: String::new(),
                name: col_name.clone(),
                data_type,
                formatter: prop_str(props, "formatter"),
                validator,
                default_value: props.get("default").cloned(),
                indexed: true,
            },
        );
    }

    Ok(Table {
        id: String::new(),
        name: name.to_string(),
        columns,
        pk: "id".to_string(),
    })
}

fn parse_data_type(value: Option<&Json>) -> DbResult<DataType> {
    match value.and_then(Json::as_str) {
        None | Some("") => Ok(DataType::String),
        Some(s) => serde_json::from_value(json!(s))
            .map_err(|_| DbError::InvalidInput(format!("invalid column type '{}'", s))),
    }
}

fn prop_str(props: &Map<String, Json>, key: &str) -> String {
    props
        .get(key)
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

fn drop_schema(db: &Db, args: &[Json]) -> DbResult<Json> {
    match args.len() {
        0 => Err(DbError::InvalidInput("drop expects at least 1 arg".to_string())),
        1 => {
            db.drop_database(arg_str(args, 0, "database name")?)?;
            Ok(json!("success"))
        }
        _ => {
            db.drop_table(
                arg_str(args, 0, "database name")?,
                arg_str(args, 1, "table name")?,
            )?;
            Ok(json!("success"))
        }
    }
}

fn alter(db: &Db, args: &[Json]) -> DbResult<Json> {
    if args.len() != 3 {
        return Err(DbError::InvalidInput(
            "alter expects 3 args (db, table, changes)".to_string(),
        ));
    }
    let db_name = arg_str(args, 0, "database name")?;
    let table_name = arg_str(args, 1, "table name")?;
    let changes = args[2]
        .as_object()
        .ok_or_else(|| DbError::InvalidInput("invalid changes object".to_string()))?;

    db.alter_table(db_name, table_name, parse_change(changes)?)?;
    Ok(json!("success"))
}

/// Parses the change set; exactly one change per request.
fn parse_change(changes: &Map<String, Json>) -> DbResult<TableChange> {
    if changes.len() != 1 {
        return Err(DbError::InvalidInput(
            "alter expects exactly one of addColumn, dropColumn, modifyColumn, renameColumn"
                .to_string(),
        ));
    }
    let (kind, body) = changes.iter().next().expect("length checked");
    let props = body
        .as_object()
        .ok_or_else(|| DbError::InvalidInput(format!("invalid {} payload", kind)))?;

    let name_of = |key: &str| -> DbResult<String> {
        props
            .get(key)
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| DbError::InvalidInput(format!("{} requires '{}'", kind, key)))
    };

    match kind.as_str() {
        "addColumn" => {
            let name = name_of("name")?;
            Ok(TableChange::AddColumn(Column {
                id: String::new(),
                name: name.clone(),
                data_type: parse_data_type(props.get("type"))?,
                formatter: prop_str(props, "formatter"),
                validator: prop_str(props, "validator"),
                default_value: props.get("default").cloned(),
                indexed: true,
            }))
        }
        "dropColumn" => Ok(TableChange::DropColumn { name: name_of("name")? }),
        "modifyColumn" => Ok(TableChange::ModifyColumn {
            name: name_of("name")?,
            data_type: match props.get("type") {
                Some(v) => Some(parse_data_type(Some(v))?),
                None => None,
            },
            formatter: props.get("formatter").and_then(Json::as_str).map(str::to_string),
            validator: props.get("validator").and_then(Json::as_str).map(str::to_string),
            default_value: props.get("default").cloned(),
        }),
        "renameColumn" => Ok(TableChange::RenameColumn {
            old_name: name_of("oldName")?,
            new_name: name_of("newName")?,
        }),
        other => Err(DbError::InvalidInput(format!("unknown alter change '{}'", other))),
    }
}

fn rename(db: &Db, args: &[Json]) -> DbResult<Json> {
    match args.len() {
        // rename db <old> <new>
        3 => {
            db.rename_database(arg_str(args, 1, "old name")?, arg_str(args, 2, "new name")?)?;
            Ok(json!("success"))
        }
        // rename table <db> <old> <new>
        4 => {
            db.rename_table(
                arg_str(args, 1, "database name")?,
                arg_str(args, 2, "old name")?,
                arg_str(args, 3, "new name")?,
            )?;
            Ok(json!("success"))
        }
        _ => Err(DbError::InvalidInput("invalid rename arguments".to_string())),
    }
}
