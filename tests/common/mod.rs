//! Shared helpers for integration tests: in-memory stores and seeded
//! schemas.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use onql::engine::MemoryEngine;
use onql::store::{Column, DataType, Entity, ProtocolModule, QueryProtocol, Relation, Row, Table};
use onql::{Db, StoreManager};

pub fn create_test_db() -> Db {
    let store = StoreManager::new(Arc::new(MemoryEngine::new())).expect("store manager");
    Db::new(Arc::new(store))
}

pub fn column(name: &str, data_type: DataType) -> Column {
    Column {
        id: String::new(),
        name: name.to_string(),
        data_type,
        formatter: String::new(),
        validator: String::new(),
        default_value: None,
        indexed: true,
    }
}

pub fn table(name: &str, pk: &str, columns: Vec<Column>) -> Table {
    Table {
        id: String::new(),
        name: name.to_string(),
        columns: columns.into_iter().map(|c| (c.name.clone(), c)).collect(),
        pk: pk.to_string(),
    }
}

pub fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {}", other),
    }
}

/// `shop.items` with rows {a:1,b:10}, {a:2,b:20}, {a:3,b:30}; `price`
/// mirrors `b`.
pub fn seed_shop(db: &Db) {
    db.create_database("shop").unwrap();
    db.create_table(
        "shop",
        table(
            "items",
            "id",
            vec![
                column("id", DataType::String),
                column("a", DataType::Number),
                column("b", DataType::Number),
                column("price", DataType::Number),
            ],
        ),
    )
    .unwrap();

    for (id, a, b) in [("1", 1, 10), ("2", 2, 20), ("3", 3, 30)] {
        db.insert("shop", "items", row(json!({"id": id, "a": a, "b": b, "price": b})))
            .unwrap();
    }
}

/// `shop.users` and `shop.orders` plus a protocol "rel" declaring
/// `orders.user -> users.id` (mto).
pub fn seed_relations(db: &Db) {
    db.create_database("shop").unwrap();
    db.create_table(
        "shop",
        table(
            "users",
            "id",
            vec![column("id", DataType::String), column("name", DataType::String)],
        ),
    )
    .unwrap();
    db.create_table(
        "shop",
        table(
            "orders",
            "id",
            vec![
                column("id", DataType::String),
                column("user", DataType::String),
                column("amount", DataType::Number),
            ],
        ),
    )
    .unwrap();

    db.insert("shop", "users", row(json!({"id": "u1", "name": "alice"})))
        .unwrap();
    db.insert("shop", "users", row(json!({"id": "u2", "name": "bob"})))
        .unwrap();
    db.insert(
        "shop",
        "orders",
        row(json!({"id": "o1", "user": "u1", "amount": 100})),
    )
    .unwrap();
    db.insert(
        "shop",
        "orders",
        row(json!({"id": "o2", "user": "ghost", "amount": 50})),
    )
    .unwrap();

    db.set_protocol("rel", relation_protocol()).unwrap();
}

pub fn relation_protocol() -> QueryProtocol {
    let users = Entity {
        table: "users".to_string(),
        fields: HashMap::from([
            ("id".to_string(), "id".to_string()),
            ("name".to_string(), "name".to_string()),
        ]),
        ..Default::default()
    };
    let orders = Entity {
        table: "orders".to_string(),
        fields: HashMap::from([
            ("id".to_string(), "id".to_string()),
            ("user".to_string(), "user".to_string()),
            ("amount".to_string(), "amount".to_string()),
        ]),
        relations: HashMap::from([(
            "user".to_string(),
            Relation {
                prototable: "users".to_string(),
                kind: "mto".to_string(),
                entity: "users".to_string(),
                fkfield: "user:id".to_string(),
                through: String::new(),
            },
        )]),
        ..Default::default()
    };

    HashMap::from([(
        "shop".to_string(),
        ProtocolModule {
            database: "shop".to_string(),
            entities: HashMap::from([
                ("users".to_string(), users),
                ("orders".to_string(), orders),
            ]),
        },
    )])
}
