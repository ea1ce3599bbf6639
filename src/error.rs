use std::{path::PathBuf, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("index directory error: {0}")]
    TantivyDirectory(#[from] tantivy::directory::error::OpenDirectoryError),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("PDF extraction error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("EPUB extraction error: {0}")]
    Epub(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("an index already exists at {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("malformed query: {0}")]
    QuerySyntax(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },

    #[error("model '{model}' is unavailable: {hint}")]
    ModelUnavailable { model: String, hint: String },

    #[error("model error: {0}")]
    Model(String),

    #[error("index has not been created or loaded")]
    IndexNotReady,

    #[error(
        "no credentials for provider '{provider}': pass an API key or set {env_var}"
    )]
    ProviderAuth {
        provider: &'static str,
        env_var: &'static str,
    },

    #[error("completion provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("search exceeded its deadline after {elapsed:?}")]
    SearchTimeout { elapsed: Duration },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provider { transient, .. } => *transient,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::Model(format!("tensor computation error: {e}"))
    }
}
