use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde_json::Value as Json;

use super::{ApiState, QUERY_DEADLINE};
use crate::dsl::{self, CancelFlag};
use crate::error::{DbError, DbResult};

/// `onql` target payload.
#[derive(Deserialize)]
struct DslRequest {
    #[serde(default)]
    protopass: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    ctxkey: String,
    #[serde(default)]
    ctxvalues: Vec<String>,
}

/// Executes a DSL query on the blocking pool under the request deadline,
/// tracking it in the in-flight query counter.
pub async fn handle(state: &ApiState, payload: String) -> DbResult<Json> {
    let req: DslRequest = serde_json::from_str(&payload)
        .map_err(|e| DbError::InvalidInput(format!("invalid payload: {}", e)))?;

    state.active_queries.fetch_add(1, Ordering::Relaxed);
    let result = run(state, req).await;
    state.active_queries.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn run(state: &ApiState, req: DslRequest) -> DbResult<Json> {
    let db = state.db.clone();
    let cancel = CancelFlag::new();
    let deadline_flag = cancel.clone();

    let handle = tokio::task::spawn_blocking(move || {
        dsl::execute(
            &db,
            &req.protopass,
            &req.query,
            &req.ctxkey,
            &req.ctxvalues,
            cancel,
        )
    });

    match tokio::time::timeout(QUERY_DEADLINE, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            tracing::error!("query worker panicked");
            Err(DbError::Internal("query worker panicked".to_string()))
        }
        Ok(Err(join_err)) => Err(DbError::Internal(join_err.to_string())),
        Err(_) => {
            deadline_flag.cancel();
            Err(DbError::Timeout)
        }
    }
}
