//! Error type shared by the object layer, the registrar and the workflow engine
//!
//! Every variant carries the realm (and key or field where one applies) so a
//! caller can render a message without parsing the display string.

/// Errors raised by testman operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no class provider is registered for realm '{realm}'")]
    UnknownRealm { realm: String },

    #[error("realm '{realm}' has no field named '{field}'")]
    UnknownField { realm: String, field: String },

    #[error("invalid state for {realm} {key}: {reason}")]
    InvalidState {
        realm: String,
        key: String,
        reason: String,
    },

    #[error("multi-value fields are not supported ({realm}.{field})")]
    UnsupportedValue { realm: String, field: String },

    #[error("transition of {realm} '{id}' from '{from}' to '{to}' was denied")]
    TransitionDenied {
        realm: String,
        id: String,
        from: String,
        to: String,
    },

    #[error("{realm} '{id}' changed state in the meantime: expected '{expected}', found '{actual}'")]
    ConcurrentModification {
        realm: String,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("no workflow action '{action}' is configured for realm '{realm}'")]
    UnknownAction { realm: String, action: String },

    #[error("action '{action}' is not available for {realm} in state '{state}'")]
    ActionNotAvailable {
        realm: String,
        action: String,
        state: String,
    },

    #[error("action '{action}' of realm '{realm}' uses unknown operation '{operation}'")]
    UnknownOperation {
        realm: String,
        action: String,
        operation: String,
    },

    #[error("workflow operation '{operation}' failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),

    #[error("Row decoding error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_state(realm: &str, key: impl ToString, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            realm: realm.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the two workflow errors a caller is expected to report
    /// to the user rather than treat as a bug.
    pub fn is_transition_conflict(&self) -> bool {
        matches!(
            self,
            Error::TransitionDenied { .. } | Error::ConcurrentModification { .. }
        )
    }

    /// True when an insert hit a row that already holds its key
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Error::Query(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
