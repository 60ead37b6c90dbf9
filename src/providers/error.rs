/// Store-level error with retry classification.
///
/// Store implementations return this to tell the engine whether an
/// operation is worth retrying.
///
/// **Retryable**: database busy/locked, connection timeouts, pool
/// exhaustion. **Non-retryable**: constraint violations, corrupted rows,
/// invalid input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Operation that failed (e.g. "acquire_task_lock", "commit_attempt").
    pub operation: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether this error should be retried.
    pub retryable: bool,
}

impl StoreError {
    /// Create a retryable (transient) error.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_constructors() {
        let e = StoreError::retryable("fetch_due_tasks", "database is locked");
        assert!(e.is_retryable());
        let e = StoreError::permanent("insert_task", "UNIQUE constraint failed");
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "insert_task: UNIQUE constraint failed");
    }
}
