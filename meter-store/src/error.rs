pub type StoreResult<T> = Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid value in {table}.{column}: {message}")]
    InvalidRow {
        table: &'static str,
        column: &'static str,
        message: String,
    },
    #[error("invalid reading value {0}: readings must be finite and non-negative")]
    InvalidReadingValue(f64),
}

impl StoreError {
    pub(crate) fn invalid_row(table: &'static str, column: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRow {
            table,
            column,
            message: message.into(),
        }
    }
}
