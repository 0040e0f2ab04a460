use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {

    #[error("Schema conflict on table {table}: {reason}")]
    SchemaConflict { table: String, reason: String },

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Invalid {kind} identifier: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("Key arity mismatch on table {table}: expected {expected} values, got {actual}")]
    KeyArityMismatch { table: String, expected: usize, actual: usize },

    #[error("Backend I/O error: {0}")]
    BackendIo(String),

    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("Value still loading after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Value not loaded yet")]
    NotReady,

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl PersistError {
    pub fn conflict(table: &str, reason: impl Into<String>) -> Self {
        PersistError::SchemaConflict { table: table.to_string(), reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        PersistError::BackendProtocol(reason.into())
    }

    /// Same-class copy for handing one failure to several receivers. Errors
    /// wrapping foreign sources keep only their message.
    pub(crate) fn duplicate(&self) -> PersistError {
        match self {
            PersistError::SchemaConflict { table, reason } => PersistError::conflict(table, reason.clone()),
            PersistError::SchemaNotFound(t) => PersistError::SchemaNotFound(t.clone()),
            PersistError::InvalidIdentifier { kind, value } => PersistError::InvalidIdentifier { kind, value: value.clone() },
            PersistError::KeyArityMismatch { table, expected, actual } => {
                PersistError::KeyArityMismatch { table: table.clone(), expected: *expected, actual: *actual }
            }
            PersistError::RetryExhausted { attempts } => PersistError::RetryExhausted { attempts: *attempts },
            PersistError::NotReady => PersistError::NotReady,
            PersistError::BackendIo(m) => PersistError::BackendIo(m.clone()),
            PersistError::BackendProtocol(m) => PersistError::BackendProtocol(m.clone()),
            e if e.is_io() => PersistError::BackendIo(e.to_string()),
            e => PersistError::BackendProtocol(e.to_string()),
        }
    }

    /// Storage could not be reached or the transport failed.
    pub fn is_io(&self) -> bool {
        matches!(self, PersistError::BackendIo(_) | PersistError::Io(_))
    }

    /// Storage answered, but with something that could not be stored or decoded.
    pub fn is_protocol(&self) -> bool {
        matches!(self, PersistError::BackendProtocol(_) | PersistError::SerdeError(_))
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PersistError::BackendIo(e.to_string()),
            other => PersistError::BackendProtocol(other.to_string()),
        }
    }
}
