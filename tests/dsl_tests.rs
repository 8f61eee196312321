//! DSL behavior end to end: lowering to statement lists, filters,
//! projections, slices, relations and aggregates over a live store.

mod common;

use common::{column, create_test_db, row, seed_relations, seed_shop, table};
use serde_json::json;

use onql::dsl::{self, CancelFlag, Evaluator};
use onql::store::DataType;

fn run(db: &onql::Db, password: &str, query: &str) -> onql::DbResult<serde_json::Value> {
    dsl::execute(db, password, query, "", &[], CancelFlag::new())
}

fn sorted_rows(mut rows: Vec<serde_json::Value>, key: &str) -> Vec<serde_json::Value> {
    rows.sort_by_key(|r| r[key].as_f64().map(|f| f as i64));
    rows
}

// ===== Lowering =====

#[test]
fn test_statement_list_for_filter_projection() {
    let db = create_test_db();
    seed_shop(&db);

    let plan = dsl::parse(&db, "default", "shop.items[a > 1]{x:b}").unwrap();
    let tags: Vec<&str> = plan.statements.iter().map(|s| s.op.tag()).collect();
    assert_eq!(
        tags,
        vec!["AT", "SFT", "ATL", "LIT", "NO", "EFT", "SPJ", "SPK", "ATL", "EPK", "EPJ"]
    );

    let names: Vec<&str> = plan.statements.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C", "D", "E", "F", "G", "H", "I", "J", "K"]);

    // The operator statement captures its operand names literally.
    let no = &plan.statements[4];
    assert_eq!(no.expr.text(), Some("C > D"));

    // AT carries the physical names; ATL carries the column schema.
    assert_eq!(plan.statements[0].meta["db"], "shop");
    assert_eq!(plan.statements[0].meta["table"], "items");
    assert_eq!(plan.statements[2].meta["name"], "a");
    assert_eq!(plan.statements[2].meta["type"], "number");
}

#[test]
fn test_parse_errors_carry_position() {
    let db = create_test_db();
    seed_shop(&db);

    let err = dsl::parse(&db, "default", "nosuchdb.items").unwrap_err();
    assert!(matches!(err, onql::DbError::ParseError { .. }));

    let err = dsl::parse(&db, "default", "shop.items.nosuchcol").unwrap_err();
    assert!(matches!(err, onql::DbError::ParseError { .. }));
}

#[test]
fn test_unknown_aggregate_rejected() {
    let db = create_test_db();
    seed_shop(&db);
    assert!(dsl::parse(&db, "default", "shop.items._frobnicate").is_err());
}

// ===== Filters and projections =====

#[test]
fn test_filter_and_projection() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", "shop.items[a > 1]{x:b}").unwrap();
    let rows = sorted_rows(result.as_array().unwrap().clone(), "x");
    assert_eq!(rows, vec![json!({"x": 20.0}), json!({"x": 30.0})]);
}

#[test]
fn test_indexed_equality_filter() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", "shop.items[a = 2]").unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["b"], 20.0);

    let result = run(&db, "default", "shop.items[a = 1 or a = 3]").unwrap();
    assert_eq!(result.as_array().unwrap().len(), 2);

    let result = run(&db, "default", r#"shop.items[a = 1 and id = "1"]"#).unwrap();
    assert_eq!(result.as_array().unwrap().len(), 1);

    let result = run(&db, "default", r#"shop.items[a = 1 and id = "2"]"#).unwrap();
    assert_eq!(result.as_array().unwrap().len(), 0);
}

#[test]
fn test_filter_on_empty_table_yields_empty() {
    let db = create_test_db();
    db.create_database("d").unwrap();
    db.create_table(
        "d",
        table("t", "id", vec![column("id", DataType::String), column("n", DataType::Number)]),
    )
    .unwrap();

    let result = run(&db, "default", "d.t[n > 1]{v:n}").unwrap();
    assert_eq!(result, json!([]));
}

#[test]
fn test_filter_condition_must_be_boolean() {
    let db = create_test_db();
    seed_shop(&db);
    let err = run(&db, "default", "shop.items[b]").unwrap_err();
    assert!(matches!(err, onql::DbError::TypeMismatch(_)));
}

#[test]
fn test_projection_shorthand_key() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", "shop.items[a = 1]{b}").unwrap();
    assert_eq!(result, json!([{"b": 10.0}]));
}

#[test]
fn test_projection_multiple_keys() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", r#"shop.items[a = 1]{"x":a, "y":b}"#).unwrap();
    assert_eq!(result, json!([{"x": 1.0, "y": 10.0}]));
}

// ===== Slices and row access =====

#[test]
fn test_slices() {
    let db = create_test_db();
    seed_shop(&db);

    let all = run(&db, "default", "shop.items._asc(a)").unwrap();
    assert_eq!(all.as_array().unwrap().len(), 3);

    let result = run(&db, "default", "shop.items._asc(a)[0:2]").unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["a"], 1.0);

    let result = run(&db, "default", "shop.items._asc(a)[-1:]").unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["a"], 3.0);

    let result = run(&db, "default", "shop.items._asc(a)[::2]").unwrap();
    assert_eq!(result.as_array().unwrap().len(), 2);

    // start beyond stop yields empty.
    let result = run(&db, "default", "shop.items._asc(a)[2:1]").unwrap();
    assert_eq!(result, json!([]));
}

#[test]
fn test_row_access_and_field() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", "shop.items._asc(a)[0].b").unwrap();
    assert_eq!(result, json!(10.0));

    let err = run(&db, "default", "shop.items._asc(a)[9].b").unwrap_err();
    assert!(matches!(err, onql::DbError::InvalidInput(_)));
}

// ===== Aggregates =====

#[test]
fn test_aggregate_chain() {
    let db = create_test_db();
    seed_shop(&db);

    assert_eq!(run(&db, "default", "shop.items.price._sum").unwrap(), json!(60.0));
    assert_eq!(run(&db, "default", "shop.items.price._avg").unwrap(), json!(20.0));
    assert_eq!(run(&db, "default", "shop.items.price._min").unwrap(), json!(10.0));
    assert_eq!(run(&db, "default", "shop.items.price._max").unwrap(), json!(30.0));
    assert_eq!(run(&db, "default", "shop.items.price._count").unwrap(), json!(3.0));
    assert_eq!(run(&db, "default", "shop.items._count").unwrap(), json!(3.0));
}

#[test]
fn test_projection_then_sort() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", "shop.items{y:price}._asc(y)").unwrap();
    assert_eq!(
        result,
        json!([{"y": 10.0}, {"y": 20.0}, {"y": 30.0}])
    );

    let result = run(&db, "default", "shop.items{y:price}._desc(y)").unwrap();
    assert_eq!(result.as_array().unwrap()[0]["y"], 30.0);
}

#[test]
fn test_aggregate_after_filter() {
    let db = create_test_db();
    seed_shop(&db);

    assert_eq!(
        run(&db, "default", "shop.items[a > 1].price._sum").unwrap(),
        json!(50.0)
    );
}

#[test]
fn test_unique_on_column_list() {
    let db = create_test_db();
    seed_shop(&db);
    db.insert(
        "shop",
        "items",
        row(json!({"id": "4", "a": 4, "b": 10, "price": 10})),
    )
    .unwrap();

    let result = run(&db, "default", "shop.items.price._unique._count").unwrap();
    assert_eq!(result, json!(3.0));
}

#[test]
fn test_like_on_table() {
    let db = create_test_db();
    seed_relations(&db);

    assert_eq!(
        run(&db, "rel", r#"shop.users._like(name, "ali%")"#).unwrap(),
        json!(true)
    );
    assert_eq!(
        run(&db, "rel", r#"shop.users._like(name, "zz%")"#).unwrap(),
        json!(false)
    );
}

#[test]
fn test_date_formats_timestamp_column() {
    let db = create_test_db();
    db.create_database("d").unwrap();
    db.create_table(
        "d",
        table(
            "events",
            "id",
            vec![column("id", DataType::String), column("at", DataType::Timestamp)],
        ),
    )
    .unwrap();
    db.insert("d", "events", row(json!({"id": "1", "at": 0})))
        .unwrap();

    assert_eq!(
        run(&db, "default", "d.events._date(at)").unwrap(),
        json!("1970-01-01 00:00:00")
    );
    assert_eq!(
        run(&db, "default", r#"d.events._date(at, "%Y")"#).unwrap(),
        json!("1970")
    );
}

// ===== Operators =====

#[test]
fn test_arithmetic_in_projection() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", r#"shop.items[a = 2]{"v": b + 5}"#).unwrap();
    assert_eq!(result, json!([{"v": 25.0}]));

    let result = run(&db, "default", r#"shop.items[a = 2]{"v": b * 2}"#).unwrap();
    assert_eq!(result, json!([{"v": 40.0}]));

    let result = run(&db, "default", r#"shop.items[a = 2]{"v": b % 3}"#).unwrap();
    assert_eq!(result, json!([{"v": 2.0}]));
}

#[test]
fn test_operator_precedence() {
    let db = create_test_db();
    seed_shop(&db);

    // b - 2 * 3: multiplication binds tighter.
    let result = run(&db, "default", r#"shop.items[a = 3]{"v": b - 2 * 3}"#).unwrap();
    assert_eq!(result, json!([{"v": 24.0}]));

    // Parentheses override.
    let result = run(&db, "default", r#"shop.items[a = 3]{"v": (b - 2) * 3}"#).unwrap();
    assert_eq!(result, json!([{"v": 84.0}]));
}

#[test]
fn test_not_and_logical_operators() {
    let db = create_test_db();
    seed_shop(&db);

    let result = run(&db, "default", "shop.items[not a > 1]").unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["a"], 1.0);

    let result = run(&db, "default", "shop.items[a > 1 and b < 30]").unwrap();
    assert_eq!(result.as_array().unwrap().len(), 1);

    let result = run(&db, "default", "shop.items[a = 1 or b = 30]").unwrap();
    assert_eq!(result.as_array().unwrap().len(), 2);
}

#[test]
fn test_string_comparison() {
    let db = create_test_db();
    seed_relations(&db);

    let result = run(&db, "rel", r#"shop.users[name = "alice"]"#).unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "u1");

    let result = run(&db, "rel", r#"shop.users[name != "alice"]"#).unwrap();
    assert_eq!(result.as_array().unwrap().len(), 1);
}

// ===== Relations =====

#[test]
fn test_relation_traversal() {
    let db = create_test_db();
    seed_relations(&db);

    let result = run(&db, "rel", r#"shop.orders[id = "o1"].user.name"#).unwrap();
    assert_eq!(result, json!(["alice"]));

    // No matching order: empty, not an error.
    let result = run(&db, "rel", r#"shop.orders[id = "missing"].user.name"#).unwrap();
    assert_eq!(result, json!([]));

    // Order exists but its user does not.
    let result = run(&db, "rel", r#"shop.orders[id = "o2"].user.name"#).unwrap();
    assert_eq!(result, json!([]));
}

#[test]
fn test_relation_over_whole_table() {
    let db = create_test_db();
    seed_relations(&db);

    let result = run(&db, "rel", "shop.orders.user").unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "alice");
}

#[test]
fn test_mtm_relation_goes_through_join_table() {
    let db = create_test_db();
    db.create_database("app").unwrap();
    for (name, cols) in [
        ("students", vec!["id", "name"]),
        ("courses", vec!["id", "title"]),
        ("enrollments", vec!["id", "student", "course"]),
    ] {
        db.create_table(
            "app",
            table(
                name,
                "id",
                cols.iter().map(|c| column(c, DataType::String)).collect(),
            ),
        )
        .unwrap();
    }

    db.insert("app", "students", row(json!({"id": "s1", "name": "ann"}))).unwrap();
    db.insert("app", "courses", row(json!({"id": "c1", "title": "math"}))).unwrap();
    db.insert("app", "courses", row(json!({"id": "c2", "title": "art"}))).unwrap();
    db.insert(
        "app",
        "enrollments",
        row(json!({"id": "e1", "student": "s1", "course": "c1"})),
    )
    .unwrap();
    db.insert(
        "app",
        "enrollments",
        row(json!({"id": "e2", "student": "s1", "course": "c2"})),
    )
    .unwrap();

    let mut proto = onql::store::QueryProtocol::new();
    let mut entities = std::collections::HashMap::new();
    entities.insert(
        "students".to_string(),
        onql::store::Entity {
            table: "students".to_string(),
            fields: [("id", "id"), ("name", "name")]
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            relations: std::collections::HashMap::from([(
                "courses".to_string(),
                onql::store::Relation {
                    prototable: "courses".to_string(),
                    kind: "mtm".to_string(),
                    entity: "courses".to_string(),
                    fkfield: "id:student:course:id".to_string(),
                    through: "enrollments".to_string(),
                },
            )]),
            ..Default::default()
        },
    );
    entities.insert(
        "courses".to_string(),
        onql::store::Entity {
            table: "courses".to_string(),
            fields: [("id", "id"), ("title", "title")]
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            ..Default::default()
        },
    );
    proto.insert(
        "app".to_string(),
        onql::store::ProtocolModule {
            database: "app".to_string(),
            entities,
        },
    );
    db.set_protocol("school", proto).unwrap();

    let result = run(&db, "school", r#"app.students[id = "s1"].courses.title"#).unwrap();
    let mut titles: Vec<String> = result
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["art", "math"]);
}

// ===== Context queries =====

#[test]
fn test_entity_context_replaces_table_fetch() {
    let db = create_test_db();
    seed_relations(&db);

    let mut proto = common::relation_protocol();
    proto
        .get_mut("shop")
        .unwrap()
        .entities
        .get_mut("orders")
        .unwrap()
        .context
        .insert("mine".to_string(), "shop.orders[user = $1]".to_string());
    db.set_protocol("ctx", proto).unwrap();

    let result = dsl::execute(
        &db,
        "ctx",
        "shop.orders",
        "mine",
        &["u1".to_string()],
        CancelFlag::new(),
    )
    .unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "o1");

    // Without the key the plain fetch runs.
    let result = dsl::execute(&db, "ctx", "shop.orders", "", &[], CancelFlag::new()).unwrap();
    assert_eq!(result.as_array().unwrap().len(), 2);
}

// ===== Evaluator internals =====

#[test]
fn test_memory_values_are_narrowed() {
    let db = create_test_db();
    seed_shop(&db);

    let plan = dsl::parse(&db, "default", "shop.items.price").unwrap();
    let mut evaluator = Evaluator::new(&db, &plan, "default", "", Vec::new(), CancelFlag::new());
    evaluator.eval().unwrap();

    // A is the table, B the extracted column list.
    assert_eq!(evaluator.memory()["A"].label(), "TABLE");
    assert_eq!(evaluator.memory()["B"].label(), "ARRAY_OF_NUMBER");
}

#[test]
fn test_cancelled_query_times_out() {
    let db = create_test_db();
    seed_shop(&db);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = dsl::execute(&db, "default", "shop.items", "", &[], cancel).unwrap_err();
    assert!(matches!(err, onql::DbError::Timeout));
}

#[test]
fn test_execute_requires_password_and_query() {
    let db = create_test_db();
    assert!(run(&db, "", "shop.items").is_err());
    assert!(run(&db, "default", "").is_err());
}
