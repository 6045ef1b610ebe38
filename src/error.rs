//! Error types for taskgrid.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// Compare-and-set precondition did not hold.
    #[error("Conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: String,
        id: String,
        reason: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by coordinator operations.
///
/// `QueueEmpty` and `NotFound` mean "try later" or "wrong id", never a fault.
/// `Conflict` tells a worker it lost ownership and must drop the task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("No tasks available")]
    QueueEmpty,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl DispatchError {
    pub fn task_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "task".into(),
            id: id.to_string(),
        }
    }

    pub fn worker_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "worker".into(),
            id: id.to_string(),
        }
    }

    /// Whether a caller may retry the same request after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Short machine-readable tag used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::QueueEmpty => "queue_empty",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "unavailable",
        }
    }
}

impl From<DatabaseError> for DispatchError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, id },
            DatabaseError::Conflict { reason, .. } => Self::Conflict(reason),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

/// Worker agent errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Registration failed after {attempts} attempts: {last_error}")]
    RegistrationExhausted { attempts: u32, last_error: String },

    #[error("Transport error talking to coordinator: {0}")]
    Transport(String),

    #[error("Coordinator rejected request: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invalid agent state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl AgentError {
    /// Whether the agent should back off and retry rather than give up.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Dispatch(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_conflict_maps_to_dispatch_conflict() {
        let err: DispatchError = DatabaseError::Conflict {
            entity: "task".into(),
            id: "7".into(),
            reason: "expected leased".into(),
        }
        .into();
        assert_eq!(err, DispatchError::Conflict("expected leased".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn query_failure_is_transient() {
        let err: DispatchError = DatabaseError::Query("disk I/O error".into()).into();
        assert!(err.is_transient());
        assert_eq!(err.kind(), "unavailable");
    }

    #[test]
    fn not_found_keeps_entity() {
        let err: DispatchError = DatabaseError::NotFound {
            entity: "worker".into(),
            id: "3".into(),
        }
        .into();
        assert_eq!(err, DispatchError::worker_not_found(3));
        assert_eq!(err.to_string(), "worker 3 not found");
    }

    #[test]
    fn agent_transport_errors_are_transient() {
        assert!(AgentError::Transport("connection refused".into()).is_transient());
        assert!(AgentError::Dispatch(DispatchError::StoreUnavailable("busy".into())).is_transient());
        assert!(!AgentError::Dispatch(DispatchError::Conflict("lost lease".into())).is_transient());
        assert!(
            !AgentError::RegistrationExhausted {
                attempts: 5,
                last_error: "refused".into()
            }
            .is_transient()
        );
    }
}
