use uuid::Uuid;

// ============================================================================
// Event Store Errors
// ============================================================================
//
// Failures that affect correctness (ConcurrencyConflict, Persistence) are
// always surfaced to the caller. Snapshot failures are absorbed by the
// repository and only logged.
//
// ============================================================================

/// Boxed source error for storage backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// The aggregate's highest sequence number did not match `expected`.
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Storage unavailable, timed out or rejected the operation.
    #[error("persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("change feed shard {shard} does not exist (shard count {shard_count})")]
    UnknownShard { shard: u32, shard_count: u32 },

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    pub fn persistence<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<BoxError>,
    {
        move |e| EventStoreError::Persistence {
            operation,
            source: e.into(),
        }
    }

    /// A conflict is expected under contention; the caller should re-load and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    pub fn is_conflict(&self) -> bool {
        self.is_retryable()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("snapshot state could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot version race on aggregate {0}")]
    VersionRace(Uuid),
}

impl SnapshotError {
    pub fn persistence<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<BoxError>,
    {
        move |e| SnapshotError::Persistence {
            operation,
            source: e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let err = EventStoreError::ConcurrencyConflict {
            aggregate_id: Uuid::new_v4(),
            expected: 0,
            actual: 1,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("expected version 0, found 1"));
    }

    #[test]
    fn test_persistence_failure_is_not_retryable() {
        let err = EventStoreError::persistence("append")(std::io::Error::other("timeout"));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("append"));
    }
}
