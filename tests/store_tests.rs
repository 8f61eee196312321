//! Store manager and facade behavior: schema lifecycle, data operations,
//! index maintenance, buffer/flush semantics and the default protocol
//! mirror.

mod common;

use common::{column, create_test_db, row, table};
use serde_json::json;

use onql::engine::IterFlow;
use onql::store::{DataType, TableChange};

fn users_db() -> onql::Db {
    let db = create_test_db();
    db.create_database("testdb").unwrap();

    let mut name = column("name", DataType::String);
    name.formatter = "trim|upper".to_string();
    let mut age = column("age", DataType::Number);
    age.validator = "min:18".to_string();

    db.create_table(
        "testdb",
        table("users", "id", vec![column("id", DataType::String), name, age]),
    )
    .unwrap();
    db
}

#[test]
fn test_create_database_rejects_duplicates() {
    let db = create_test_db();
    db.create_database("a").unwrap();
    assert!(matches!(
        db.create_database("a"),
        Err(onql::DbError::DatabaseExists(_))
    ));
}

#[test]
fn test_create_table_requires_pk_column() {
    let db = create_test_db();
    db.create_database("a").unwrap();
    let result = db.create_table("a", table("t", "missing", vec![column("id", DataType::String)]));
    assert!(matches!(result, Err(onql::DbError::InvalidInput(_))));
}

#[test]
fn test_insert_then_get_applies_formatters_once() {
    let db = users_db();
    let pk = db
        .insert("testdb", "users", row(json!({"id": "1", "name": "  john  ", "age": 25})))
        .unwrap();
    assert_eq!(pk, "1");

    let fetched = db.get("testdb", "users", "1").unwrap();
    assert_eq!(fetched["name"], "JOHN");
    assert_eq!(fetched["age"], 25.0);
}

#[test]
fn test_indexed_lookup_sees_formatted_value() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "name": "  john  ", "age": 25})))
        .unwrap();

    let pks = db.pks_by_index("testdb", "users", "name", "JOHN").unwrap();
    assert_eq!(pks, vec!["1"]);
    assert!(db.pks_by_index("testdb", "users", "name", "john").unwrap().is_empty());
}

#[test]
fn test_validator_rejects_underage() {
    let db = users_db();
    let result = db.insert("testdb", "users", row(json!({"id": "2", "age": 17})));
    assert!(matches!(result, Err(onql::DbError::InvalidInput(_))));
}

#[test]
fn test_duplicate_pk_rejected_before_and_after_flush() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "age": 30})))
        .unwrap();
    assert!(matches!(
        db.insert("testdb", "users", row(json!({"id": "1", "age": 31}))),
        Err(onql::DbError::Duplicate(_))
    ));

    db.store().flush().unwrap();
    assert!(matches!(
        db.insert("testdb", "users", row(json!({"id": "1", "age": 31}))),
        Err(onql::DbError::Duplicate(_))
    ));
}

#[test]
fn test_pk_with_colon_rejected() {
    let db = users_db();
    let result = db.insert("testdb", "users", row(json!({"id": "a:b", "age": 20})));
    assert!(matches!(result, Err(onql::DbError::InvalidInput(_))));
}

#[test]
fn test_update_rewrites_changed_index_entries() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "name": "ana", "age": 30})))
        .unwrap();

    db.update("testdb", "users", "1", row(json!({"age": 31})))
        .unwrap();

    assert!(db.pks_by_index("testdb", "users", "age", "30").unwrap().is_empty());
    assert_eq!(db.pks_by_index("testdb", "users", "age", "31").unwrap(), vec!["1"]);
    // Unchanged column keeps its entry.
    assert_eq!(db.pks_by_index("testdb", "users", "name", "ANA").unwrap(), vec!["1"]);

    let fetched = db.get("testdb", "users", "1").unwrap();
    assert_eq!(fetched["age"], 31.0);
    assert_eq!(fetched["name"], "ANA");
}

#[test]
fn test_delete_then_get_not_found_across_flush() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "age": 30})))
        .unwrap();
    db.delete("testdb", "users", "1").unwrap();

    assert!(db.get("testdb", "users", "1").unwrap_err().is_not_found());
    db.store().flush().unwrap();
    assert!(db.get("testdb", "users", "1").unwrap_err().is_not_found());
    assert!(db.pks_by_index("testdb", "users", "age", "30").unwrap().is_empty());
}

#[test]
fn test_flush_is_idempotent() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "age": 30})))
        .unwrap();

    db.store().flush().unwrap();
    let fetched = db.get("testdb", "users", "1").unwrap();

    // Flushing an empty drain changes nothing.
    db.store().flush().unwrap();
    assert_eq!(db.get("testdb", "users", "1").unwrap(), fetched);
}

#[test]
fn test_index_integrity_after_flush() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "name": "ana", "age": 30})))
        .unwrap();
    db.insert("testdb", "users", row(json!({"id": "2", "name": "ana", "age": 40})))
        .unwrap();
    db.store().flush().unwrap();

    // Exactly one IDX key per (column value, pk) in the live view.
    let schema = db.table_schema("testdb", "users").unwrap();
    let name_col = &schema.columns["name"];
    let mut keys = Vec::new();
    db.store()
        .engine()
        .iterate_prefix(b"IDX:", &mut |k, _| {
            let key = String::from_utf8_lossy(k).into_owned();
            if key.contains(&format!(":{}:", name_col.id)) {
                keys.push(key);
            }
            Ok(IterFlow::Continue)
        })
        .unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.contains(":ana:")));
}

#[test]
fn test_rename_preserves_data() {
    let db = create_test_db();
    db.create_database("a").unwrap();
    db.create_table(
        "a",
        table("t", "id", vec![column("id", DataType::String), column("name", DataType::String)]),
    )
    .unwrap();
    db.insert("a", "t", row(json!({"id": "1", "name": "x"}))).unwrap();

    db.rename_table("a", "t", "u").unwrap();
    db.rename_database("a", "b").unwrap();

    let fetched = db.get("b", "u", "1").unwrap();
    assert_eq!(fetched["id"], "1");
    assert_eq!(fetched["name"], "x");

    // Index lookups survive the renames too.
    assert_eq!(db.pks_by_index("b", "u", "name", "x").unwrap(), vec!["1"]);
    assert!(db.get("a", "t", "1").is_err());
}

#[test]
fn test_rename_column_keeps_index_and_moves_pk() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "age": 30})))
        .unwrap();

    db.alter_table(
        "testdb",
        "users",
        TableChange::RenameColumn {
            old_name: "id".to_string(),
            new_name: "uid".to_string(),
        },
    )
    .unwrap();

    let schema = db.table_schema("testdb", "users").unwrap();
    assert_eq!(schema.pk, "uid");
    assert!(schema.columns.contains_key("uid"));

    let fetched = db.get("testdb", "users", "1").unwrap();
    assert_eq!(fetched["id"], "1");
    assert_eq!(db.pks_by_index("testdb", "users", "age", "30").unwrap(), vec!["1"]);
}

#[test]
fn test_drop_column_sweeps_indices_and_refuses_pk() {
    let db = users_db();
    db.insert("testdb", "users", row(json!({"id": "1", "age": 30})))
        .unwrap();
    db.store().flush().unwrap();

    let schema = db.table_schema("testdb", "users").unwrap();
    let age_id = schema.columns["age"].id.clone();

    assert!(db
        .alter_table("testdb", "users", TableChange::DropColumn { name: "id".to_string() })
        .is_err());

    db.alter_table("testdb", "users", TableChange::DropColumn { name: "age".to_string() })
        .unwrap();

    let mut leftover = 0;
    db.store()
        .engine()
        .iterate_prefix(b"IDX:", &mut |k, _| {
            if String::from_utf8_lossy(k).contains(&age_id) {
                leftover += 1;
            }
            Ok(IterFlow::Continue)
        })
        .unwrap();
    assert_eq!(leftover, 0);
    assert!(!db.table_schema("testdb", "users").unwrap().columns.contains_key("age"));
}

#[test]
fn test_add_and_modify_column() {
    let db = users_db();
    let mut email = column("email", DataType::String);
    email.validator = "required".to_string();
    db.alter_table("testdb", "users", TableChange::AddColumn(email))
        .unwrap();

    let schema = db.table_schema("testdb", "users").unwrap();
    assert!(schema.columns.contains_key("email"));
    assert!(!schema.columns["email"].id.is_empty());

    db.alter_table(
        "testdb",
        "users",
        TableChange::ModifyColumn {
            name: "email".to_string(),
            data_type: None,
            formatter: Some("lower".to_string()),
            validator: None,
            default_value: None,
        },
    )
    .unwrap();
    let schema = db.table_schema("testdb", "users").unwrap();
    assert_eq!(schema.columns["email"].formatter, "lower");
    assert_eq!(schema.columns["email"].validator, "required");
}

#[test]
fn test_default_protocol_mirrors_schema() {
    let db = users_db();
    let proto = db.get_protocol("default").unwrap();
    let module = &proto["testdb"];
    assert_eq!(module.database, "testdb");
    let entity = &module.entities["users"];
    assert_eq!(entity.table, "users");
    assert_eq!(entity.fields["age"], "age");
    assert_eq!(entity.fields.len(), 3);

    // Mutations rebuild the mirror before returning.
    db.alter_table(
        "testdb",
        "users",
        TableChange::AddColumn(column("city", DataType::String)),
    )
    .unwrap();
    let proto = db.get_protocol("default").unwrap();
    assert!(proto["testdb"].entities["users"].fields.contains_key("city"));

    db.drop_table("testdb", "users").unwrap();
    let proto = db.get_protocol("default").unwrap();
    assert!(proto["testdb"].entities.is_empty());
}

#[test]
fn test_sequence_and_uuid_defaults() {
    let db = create_test_db();
    db.create_database("d").unwrap();

    let mut id = column("id", DataType::Number);
    id.default_value = Some(json!("$AUTO"));
    let mut token = column("token", DataType::String);
    token.default_value = Some(json!("$UUID"));
    db.create_table("d", table("t", "id", vec![id, token])).unwrap();

    let first = db.insert("d", "t", row(json!({}))).unwrap();
    let second = db.insert("d", "t", row(json!({}))).unwrap();
    assert_eq!(first, "1");
    assert_eq!(second, "2");

    let row1 = db.get("d", "t", "1").unwrap();
    let row2 = db.get("d", "t", "2").unwrap();
    assert_ne!(row1["token"], row2["token"]);
    assert_eq!(row1["token"].as_str().unwrap().len(), 36);
}

#[test]
fn test_empty_default_bypasses_required_once() {
    let db = create_test_db();
    db.create_database("d").unwrap();

    let mut note = column("note", DataType::String);
    note.validator = "required".to_string();
    note.default_value = Some(json!("$EMPTY"));
    db.create_table(
        "d",
        table("t", "id", vec![column("id", DataType::String), note]),
    )
    .unwrap();

    // Missing note falls back to "" and passes despite `required`.
    db.insert("d", "t", row(json!({"id": "1"}))).unwrap();
    assert_eq!(db.get("d", "t", "1").unwrap()["note"], "");

    // An explicit empty string still fails.
    let result = db.insert("d", "t", row(json!({"id": "2", "note": ""})));
    assert!(matches!(result, Err(onql::DbError::InvalidInput(_))));
}

#[test]
fn test_protocol_validation() {
    let db = users_db();

    // Unknown table.
    let mut proto = common::relation_protocol();
    proto.get_mut("shop").unwrap().database = "testdb".to_string();
    let result = db.set_protocol("bad", proto);
    assert!(matches!(result, Err(onql::DbError::ProtocolViolation(_))));

    // Unknown database.
    let proto = common::relation_protocol();
    let result = db.set_protocol("bad", proto);
    assert!(matches!(result, Err(onql::DbError::ProtocolViolation(_))));
}

#[test]
fn test_schema_survives_reload() {
    use onql::engine::MemoryEngine;
    use onql::StoreManager;
    use std::sync::Arc;

    let engine = Arc::new(MemoryEngine::new());
    {
        let db = onql::Db::new(Arc::new(StoreManager::new(engine.clone()).unwrap()));
        db.create_database("d").unwrap();
        db.create_table("d", table("t", "id", vec![column("id", DataType::String)]))
            .unwrap();
        db.insert("d", "t", row(json!({"id": "1"}))).unwrap();
        db.store().flush().unwrap();
    }

    // A fresh manager over the same engine reloads schema and protocols.
    let db = onql::Db::new(Arc::new(StoreManager::new(engine).unwrap()));
    assert_eq!(db.fetch_databases(), vec!["d"]);
    assert_eq!(db.fetch_tables("d").unwrap(), vec!["t"]);
    assert_eq!(db.get("d", "t", "1").unwrap()["id"], "1");
    assert!(db.get_protocol("default").is_ok());
}
