use std::path::PathBuf;
use thiserror::Error;

/// Failure classes of a sweep run.
///
/// Only `Transient` is retried. Everything else is fatal for the operation
/// that produced it; per-row processing failures never surface here because
/// the executor records them as row data.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("transient storage failure at {}: {reason}", path.display())]
    Transient { path: PathBuf, reason: String },

    #[error("storage failure at {} after {attempts} attempts: {last}", path.display())]
    RetriesExhausted {
        path: PathBuf,
        attempts: u32,
        last: String,
    },

    #[error("storage failure at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt sweep data: {0}")]
    Corrupt(String),

    #[error("{missing} of {total} rows have no shard output (missing shards: {shards:?})")]
    Incomplete {
        missing: usize,
        total: usize,
        shards: Vec<usize>,
    },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SweepError {
    pub fn contract(msg: impl Into<String>) -> Self {
        SweepError::Contract(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        SweepError::Corrupt(msg.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SweepError::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SweepError::Transient { .. })
    }
}

pub type SweepResult<T> = std::result::Result<T, SweepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = SweepError::Transient {
            path: PathBuf::from("/tmp/x"),
            reason: "empty read".to_string(),
        };
        assert!(transient.is_transient());
        assert!(!SweepError::contract("rows_per_shard must be > 0").is_transient());
        assert!(!SweepError::corrupt("duplicate row").is_transient());
        let exhausted = SweepError::RetriesExhausted {
            path: PathBuf::from("/tmp/x"),
            attempts: 3,
            last: "empty read".to_string(),
        };
        assert!(!exhausted.is_transient());
    }

    #[test]
    fn incomplete_message_names_missing_shards() {
        let err = SweepError::Incomplete {
            missing: 4,
            total: 10,
            shards: vec![2],
        };
        let msg = err.to_string();
        assert!(msg.contains("4 of 10"), "unexpected message: {}", msg);
        assert!(msg.contains("[2]"), "unexpected message: {}", msg);
    }
}
