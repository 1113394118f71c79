//! Error types for engines and the access layer

use std::fmt;

use thiserror::Error;

/// Result type for access-layer operations
pub type Result<T> = std::result::Result<T, IdbxError>;

/// Result type for native engine calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the access layer
#[derive(Debug, Error)]
pub enum IdbxError {
    /// Opening (or upgrading) the database failed
    #[error("failed to open database '{database}': {source}")]
    Connection {
        database: String,
        #[source]
        source: EngineError,
    },

    /// A native request signalled an error; the payload is passed through unchanged
    #[error("request failed: {0}")]
    Request(#[from] EngineError),

    /// Typed record conversion failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid database configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl IdbxError {
    pub(crate) fn connection(database: &str, source: EngineError) -> Self {
        IdbxError::Connection {
            database: database.to_string(),
            source,
        }
    }

    /// The engine error behind this failure, if any.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            IdbxError::Connection { source, .. } => Some(source),
            IdbxError::Request(e) => Some(e),
            _ => None,
        }
    }
}

/// Error categories reported by engines, named after their DOMException counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    Constraint,
    NotFound,
    Version,
    Data,
    ReadOnly,
    InvalidState,
    Abort,
    TransactionInactive,
    QuotaExceeded,
    Type,
    Unknown,
}

impl EngineErrorKind {
    /// DOMException name for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            EngineErrorKind::Constraint => "ConstraintError",
            EngineErrorKind::NotFound => "NotFoundError",
            EngineErrorKind::Version => "VersionError",
            EngineErrorKind::Data => "DataError",
            EngineErrorKind::ReadOnly => "ReadOnlyError",
            EngineErrorKind::InvalidState => "InvalidStateError",
            EngineErrorKind::Abort => "AbortError",
            EngineErrorKind::TransactionInactive => "TransactionInactiveError",
            EngineErrorKind::QuotaExceeded => "QuotaExceededError",
            EngineErrorKind::Type => "TypeError",
            EngineErrorKind::Unknown => "UnknownError",
        }
    }

    /// Map a DOMException name back to a kind. Unrecognised names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "ConstraintError" => EngineErrorKind::Constraint,
            "NotFoundError" => EngineErrorKind::NotFound,
            "VersionError" => EngineErrorKind::Version,
            "DataError" => EngineErrorKind::Data,
            "ReadOnlyError" => EngineErrorKind::ReadOnly,
            "InvalidStateError" => EngineErrorKind::InvalidState,
            "AbortError" => EngineErrorKind::Abort,
            "TransactionInactiveError" => EngineErrorKind::TransactionInactive,
            "QuotaExceededError" => EngineErrorKind::QuotaExceeded,
            "TypeError" => EngineErrorKind::Type,
            _ => EngineErrorKind::Unknown,
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error payload produced by a native engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Constraint, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    pub fn version(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Version, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Data, message)
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ReadOnly, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::InvalidState, message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Abort, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            EngineErrorKind::Constraint,
            EngineErrorKind::NotFound,
            EngineErrorKind::Version,
            EngineErrorKind::ReadOnly,
            EngineErrorKind::TransactionInactive,
        ] {
            assert_eq!(EngineErrorKind::from_name(kind.name()), kind);
        }
        assert_eq!(
            EngineErrorKind::from_name("SomethingElse"),
            EngineErrorKind::Unknown
        );
    }

    #[test]
    fn test_connection_error_keeps_source() {
        let err = IdbxError::connection("app", EngineError::version("requested 1, stored 3"));
        assert_eq!(
            err.to_string(),
            "failed to open database 'app': VersionError: requested 1, stored 3"
        );
        assert_eq!(
            err.engine_error().map(|e| e.kind),
            Some(EngineErrorKind::Version)
        );
    }
}
