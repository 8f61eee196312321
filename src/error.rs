use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database '{0}' already exists")]
    DatabaseExists(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("parse error at position {position}: {message}")]
    ParseError { position: usize, message: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("query timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        DbError::ParseError {
            position,
            message: message.into(),
        }
    }

    /// True when a read simply found nothing, as opposed to a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbError::NotFound("row '42'".to_string());
        assert_eq!(err.to_string(), "not found: row '42'");

        let err = DbError::DatabaseExists("shop".to_string());
        assert_eq!(err.to_string(), "database 'shop' already exists");

        let err = DbError::parse(3, "expect table but got 'users'");
        assert_eq!(
            err.to_string(),
            "parse error at position 3: expect table but got 'users'"
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(DbError::NotFound("x".into()).is_not_found());
        assert!(!DbError::Timeout.is_not_found());
    }
}
