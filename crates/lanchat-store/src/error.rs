use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the data directory or a blocking task failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The requested room, user or attachment does not exist.
    #[error("not found")]
    NotFound,

    #[error("schema migration failed: {0}")]
    Migration(String),

    /// A stored timestamp is not RFC 3339.
    #[error("bad timestamp in database: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
