use thiserror::Error;

/// Errors surfaced by the persistence layer. Uniqueness violations, missing
/// rows and schema problems are distinguishable so callers can map them to
/// the right client signal.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated, e.g. a second user with the
    /// same username.
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    /// The addressed row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The caller supplied a value the data model rejects.
    #[error("invalid {0}")]
    Invalid(&'static str),
    /// A referenced row does not exist.
    #[error("foreign key violation")]
    ForeignKey,
    /// The database schema is not usable.
    #[error("schema error: {0}")]
    Schema(String),
    /// Any other database failure.
    #[error("database error")]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    /// Classify a sqlx error on a write path, attributing constraint
    /// violations to `what`.
    pub(crate) fn on_write(err: sqlx::Error, what: &'static str) -> StoreError {
        if let sqlx::Error::Database(ref db) = err {
            let msg = db.message();
            if msg.contains("UNIQUE constraint failed") {
                return StoreError::Duplicate(what);
            }
            if msg.contains("FOREIGN KEY constraint failed") {
                return StoreError::ForeignKey;
            }
        }
        StoreError::Db(err)
    }
}
