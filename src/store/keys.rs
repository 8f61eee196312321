//! Key families for the underlying key/value engine.
//!
//! All keys are ASCII; the first token disambiguates families. Structural
//! keys always use immutable IDs, never names, so renames touch only the
//! `MAP:` and `META:` families.

/// `META:DB:<db-id>` — database metadata blob (JSON).
pub fn meta_db_key(db_id: &str) -> Vec<u8> {
    format!("META:DB:{}", db_id).into_bytes()
}

/// `MAP:DB:<db-name>` — value is the database ID.
pub fn map_db_key(db_name: &str) -> Vec<u8> {
    format!("MAP:DB:{}", db_name).into_bytes()
}

/// `META:TBL:<db-id>:<tbl-id>` — table metadata blob (JSON).
pub fn meta_table_key(db_id: &str, table_id: &str) -> Vec<u8> {
    format!("META:TBL:{}:{}", db_id, table_id).into_bytes()
}

/// `MAP:TBL:<db-id>:<tbl-name>` — value is the table ID.
pub fn map_table_key(db_id: &str, table_name: &str) -> Vec<u8> {
    format!("MAP:TBL:{}:{}", db_id, table_name).into_bytes()
}

/// `DATA:<db-id>:<tbl-id>:<pk>` — row JSON.
pub fn data_key(db_id: &str, table_id: &str, pk: &str) -> Vec<u8> {
    format!("DATA:{}:{}:{}", db_id, table_id, pk).into_bytes()
}

/// `IDX:<db-id>:<tbl-id>:<col-id>:<value>:<pk>` — value is the PK.
///
/// The codec does not escape colons: `value` may contain them, so parsing
/// reads the first five fields greedily and treats the remainder as the PK.
/// The emitter guarantees PKs contain no colons (enforced at insert).
pub fn index_key(db_id: &str, table_id: &str, col_id: &str, value: &str, pk: &str) -> Vec<u8> {
    format!("IDX:{}:{}:{}:{}:{}", db_id, table_id, col_id, value, pk).into_bytes()
}

/// `SEQ:<db-id>:<tbl-id>:<col-id>` — monotonic counter, ASCII decimal.
pub fn sequence_key(db_id: &str, table_id: &str, col_id: &str) -> Vec<u8> {
    format!("SEQ:{}:{}:{}", db_id, table_id, col_id).into_bytes()
}

/// `PROTO:<password>` — protocol JSON.
pub fn protocol_key(password: &str) -> Vec<u8> {
    format!("PROTO:{}", password).into_bytes()
}

/// Splits an index key into (db_id, table_id, col_id, value, pk).
///
/// Because PKs never contain colons, the PK is everything after the last
/// colon and the value is whatever sits between the column ID and the PK,
/// colons included.
pub fn parse_index_key(key: &str) -> Option<(String, String, String, String, String)> {
    let rest = key.strip_prefix("IDX:")?;
    let mut fields = rest.splitn(3, ':');
    let db_id = fields.next()?.to_string();
    let table_id = fields.next()?.to_string();
    let rest = fields.next()?;
    let mut fields = rest.splitn(2, ':');
    let col_id = fields.next()?.to_string();
    let rest = fields.next()?;
    let (value, pk) = rest.rsplit_once(':')?;
    Some((db_id, table_id, col_id, value.to_string(), pk.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(meta_db_key("d1"), b"META:DB:d1");
        assert_eq!(map_table_key("d1", "users"), b"MAP:TBL:d1:users");
        assert_eq!(data_key("d1", "t1", "42"), b"DATA:d1:t1:42");
        assert_eq!(index_key("d1", "t1", "c1", "JOHN", "42"), b"IDX:d1:t1:c1:JOHN:42");
        assert_eq!(sequence_key("d1", "t1", "c1"), b"SEQ:d1:t1:c1");
    }

    #[test]
    fn test_parse_index_key_roundtrip() {
        let key = String::from_utf8(index_key("d1", "t1", "c1", "JOHN", "42")).unwrap();
        let (db, tbl, col, val, pk) = parse_index_key(&key).unwrap();
        assert_eq!((db.as_str(), tbl.as_str(), col.as_str()), ("d1", "t1", "c1"));
        assert_eq!(val, "JOHN");
        assert_eq!(pk, "42");
    }

    #[test]
    fn test_parse_index_key_value_with_colons() {
        let key = String::from_utf8(index_key("d1", "t1", "c1", "10:30:00", "42")).unwrap();
        let (_, _, _, val, pk) = parse_index_key(&key).unwrap();
        assert_eq!(val, "10:30:00");
        assert_eq!(pk, "42");
    }

    #[test]
    fn test_parse_index_key_rejects_malformed() {
        assert!(parse_index_key("DATA:d1:t1:42").is_none());
        assert!(parse_index_key("IDX:d1:t1").is_none());
    }
}
