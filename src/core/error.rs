use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxError {
    /// Raw message reported by a backend driver, displayed verbatim.
    #[error("{0}")]
    Driver(String),

    /// A driver failure wrapped by a query layer. The interesting text
    /// (e.g. "database is locked") usually only lives in `source`.
    #[error("Failed query: {statement}")]
    Query {
        statement: String,
        #[source]
        source: Box<TxError>,
    },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// The original failure wins; the failed rollback rides along.
    #[error("{source} (rollback also failed: {rollback})")]
    Rollback {
        #[source]
        source: Box<TxError>,
        rollback: Box<TxError>,
    },

    #[error("Transaction work failed and was rolled back")]
    WorkAborted,

    #[error("Native transaction finished without running its callback")]
    NativeBridge,

    #[error("Unknown backend kind: '{0}'")]
    UnknownBackendKind(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TxError>;

impl<T> From<std::sync::PoisonError<T>> for TxError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl TxError {
    /// Wraps a driver message the way a query layer would.
    pub fn query(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            statement: statement.into(),
            source: Box::new(Self::Driver(message.into())),
        }
    }
}

/// Renders an error and every `source()` ancestor, newline-joined.
///
/// Allow-list patterns are matched against this string, since some layers
/// only surface the real contention error as a cause.
pub fn failure_chain(err: &(dyn StdError + 'static)) -> String {
    let mut chain = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push('\n');
        chain.push_str(&cause.to_string());
        current = cause.source();
    }
    chain
}
