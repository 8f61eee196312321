pub mod aggr;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod stmt;
pub mod value;

pub use eval::Evaluator;
pub use parser::parse;
pub use value::Value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as Json;

use crate::db::Db;
use crate::error::{DbError, DbResult};

/// Cancellation handle observed at statement boundaries. The request
/// worker trips it when the deadline expires; the evaluator then surfaces
/// `Timeout`.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Parses and executes a query against the protocol named by `password`.
/// `ctx_key`/`ctx_values` select and parameterize entity context snippets.
pub fn execute(
    db: &Db,
    password: &str,
    query: &str,
    ctx_key: &str,
    ctx_values: &[String],
    cancel: CancelFlag,
) -> DbResult<Json> {
    if password.is_empty() {
        return Err(DbError::InvalidInput("protocol pass required".to_string()));
    }
    if query.is_empty() {
        return Err(DbError::InvalidInput("query required".to_string()));
    }

    let plan = parse(db, password, query)?;
    let mut evaluator = Evaluator::new(db, &plan, password, ctx_key, ctx_values.to_vec(), cancel);
    let result = evaluator.eval()?;
    Ok(result.to_json())
}
