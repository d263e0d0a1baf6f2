//! Error types for the dispatch core.

use carelink_db::DbError;

/// Errors surfaced by dispatch and session operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Malformed input. Nothing changed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The transition is not allowed from the current state.
    #[error("{entity} is {actual}")]
    StateConflict {
        /// Which record is in the way (`request`, `session`, `provider`).
        entity: &'static str,
        /// Its current status.
        actual: String,
    },

    /// Unknown request, session or party.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to trigger this transition.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A collaborator (store, distance, notifications) failed.
    #[error("dependency failed: {0}")]
    Dependency(String),
}

impl DispatchError {
    /// Build a state conflict from any displayable status.
    pub fn conflict(entity: &'static str, actual: impl ToString) -> Self {
        Self::StateConflict {
            entity,
            actual: actual.to_string(),
        }
    }

    /// The actual status carried by a state conflict.
    pub fn current_status(&self) -> Option<&str> {
        match self {
            Self::StateConflict { actual, .. } => Some(actual),
            _ => None,
        }
    }
}

impl From<DbError> for DispatchError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => Self::NotFound(what),
            DbError::Conflict { actual } => Self::StateConflict {
                entity: "request",
                actual,
            },
            other => Self::Dependency(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for DispatchError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_compare_and_set_becomes_conflict() {
        let err = DispatchError::from(DbError::Conflict {
            actual: String::from("accepted"),
        });
        assert_eq!(err.current_status(), Some("accepted"));
        assert_eq!(err.to_string(), "request is accepted");
    }

    #[test]
    fn store_outage_becomes_dependency() {
        let err = DispatchError::from(DbError::Unavailable(String::from("down")));
        assert!(matches!(err, DispatchError::Dependency(_)));
        assert!(err.current_status().is_none());
    }
}
