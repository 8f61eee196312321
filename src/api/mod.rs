pub mod cud;
pub mod database;
pub mod protocol;
pub mod query;
pub mod schema;
pub mod stats;

use std::sync::atomic::{AtomicI64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};

use crate::db::Db;
use crate::dsl::CancelFlag;
use crate::error::{DbError, DbResult};

/// Per-request deadline for DSL execution (direct queries and the
/// query-resolution step of update/delete).
pub const QUERY_DEADLINE: Duration = Duration::from_secs(60);

/// Shared handler state: the facade plus the counters the stats target
/// reports.
#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub connections: Arc<AtomicUsize>,
    pub active_queries: Arc<AtomicI64>,
}

impl ApiState {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            connections: Arc::new(AtomicUsize::new(0)),
            active_queries: Arc::new(AtomicI64::new(0)),
        }
    }
}

/// Routes a request to its target handler and renders the response
/// envelope. Every response is `{"error": "<msg>", "data": ...}`; a
/// nonempty error implies null data.
pub async fn handle_request(state: ApiState, target: String, payload: String) -> String {
    let result = match target.as_str() {
        "database" => run_blocking(&state, payload, |db, p, _| database::handle(&db, &p)).await,
        "onql" => query::handle(&state, payload).await,
        "protocol" => run_blocking(&state, payload, |db, p, _| protocol::handle(&db, &p)).await,
        "schema" => run_blocking(&state, payload, |db, p, _| schema::handle(&db, &p)).await,
        "insert" => run_blocking(&state, payload, |db, p, _| cud::insert(&db, &p)).await,
        "update" => run_blocking(&state, payload, |db, p, cancel| cud::update(&db, &p, cancel)).await,
        "delete" => run_blocking(&state, payload, |db, p, cancel| cud::delete(&db, &p, cancel)).await,
        "stats" => stats::handle(&state),
        other => Err(DbError::InvalidInput(format!("unknown target: {}", other))),
    };
    envelope(result)
}

/// Renders the wire envelope.
pub fn envelope(result: DbResult<Json>) -> String {
    let body = match result {
        Ok(data) => json!({ "error": "", "data": data }),
        Err(e) => json!({ "error": e.to_string(), "data": Json::Null }),
    };
    body.to_string()
}

/// Runs a handler on the blocking pool under the request deadline. The
/// worker boundary: a panicking handler yields an Internal error response
/// instead of tearing down the dispatcher, and a deadline expiry trips
/// the cancellation flag so DSL execution inside the handler unwinds with
/// `Timeout`.
async fn run_blocking<F>(state: &ApiState, payload: String, f: F) -> DbResult<Json>
where
    F: FnOnce(Db, String, CancelFlag) -> DbResult<Json> + Send + 'static,
{
    let db = state.db.clone();
    let cancel = CancelFlag::new();
    let deadline_flag = cancel.clone();

    let handle = tokio::task::spawn_blocking(move || f(db, payload, cancel));
    match tokio::time::timeout(QUERY_DEADLINE, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            tracing::error!("request worker panicked");
            Err(DbError::Internal("request worker panicked".to_string()))
        }
        Ok(Err(join_err)) => Err(DbError::Internal(join_err.to_string())),
        Err(_) => {
            deadline_flag.cancel();
            Err(DbError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        assert_eq!(
            envelope(Ok(json!({"k": 1}))),
            r#"{"data":{"k":1},"error":""}"#
        );
        let err = envelope(Err(DbError::Timeout));
        let parsed: Json = serde_json::from_str(&err).unwrap();
        assert_eq!(parsed["error"], "query timed out");
        assert!(parsed["data"].is_null());
    }
}
