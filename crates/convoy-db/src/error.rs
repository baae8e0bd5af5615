//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for convoy_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => convoy_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => convoy_core::Error::Conflict(msg),
            other => convoy_core::Error::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridges_into_the_engine_taxonomy() {
        let missing: convoy_core::Error = DbError::NotFound("deployment x".to_string()).into();
        assert!(matches!(missing, convoy_core::Error::NotFound(_)));

        let duplicate: convoy_core::Error = DbError::Duplicate("deployment x".to_string()).into();
        assert!(matches!(duplicate, convoy_core::Error::Conflict(_)));

        let io: convoy_core::Error = DbError::Database(sqlx::Error::PoolClosed).into();
        assert!(matches!(io, convoy_core::Error::Internal(_)));
    }
}
