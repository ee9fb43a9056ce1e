//! Failure taxonomy for release steps.

use std::path::PathBuf;

/// Why a release step did not complete.
///
/// Only [`StepError::Transient`] and [`StepError::VerificationIncomplete`] are
/// retried by the [`RetryController`](crate::RetryController). Everything else
/// stops the step immediately.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The external script runner exited non-zero or could not be reached.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),

    /// Contracts are not yet deployed or not yet indexed by the block explorer.
    #[error(
        "verification incomplete: {deployed}/{total} deployed, {verified}/{total} verified"
    )]
    VerificationIncomplete {
        deployed: usize,
        verified: usize,
        total: usize,
    },

    /// The network configuration merge was aborted and the backup restored.
    #[error("config conflict: {0}")]
    ConfigConflict(#[from] MergeError),

    /// A failure that retrying cannot fix (missing secret, bad auth setup, ...).
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),

    /// The operator interrupted the release at a checkpoint.
    #[error("cancelled by operator")]
    Cancelled,
}

impl StepError {
    /// Whether the retry controller should attempt the step again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::VerificationIncomplete { .. }
        )
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

/// Errors raised by the network configuration merge protocol.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("network config not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load deployment artifact {path}: {source:#}")]
    Artifact {
        path: PathBuf,
        source: anyhow::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write {path}: {source:#}")]
    Write {
        path: PathBuf,
        source: anyhow::Error,
    },

    /// The config file changed on disk while the merge was in progress.
    #[error("{0} was modified during the merge")]
    ConcurrentModification(PathBuf),

    /// Restoring the backup did not reproduce the original bytes.
    #[error("restored {0} does not match its original content")]
    RestoreMismatch(PathBuf),

    #[error("failed to restore {path} from backup: {source}")]
    Restore {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The merge failed and the backup could not be put back either.
    #[error("{cause}; restoring the backup also failed: {restore}")]
    Unrestored {
        cause: Box<MergeError>,
        #[source]
        restore: Box<MergeError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StepError::transient(anyhow::anyhow!("exit code 1")).is_retryable());
        assert!(
            StepError::VerificationIncomplete {
                deployed: 3,
                verified: 1,
                total: 3
            }
            .is_retryable()
        );
        assert!(!StepError::fatal(anyhow::anyhow!("no key")).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
        assert!(
            !StepError::from(MergeError::ConcurrentModification(PathBuf::from("env/x.json")))
                .is_retryable()
        );
    }

    #[test]
    fn test_verification_message() {
        let err = StepError::VerificationIncomplete {
            deployed: 2,
            verified: 1,
            total: 4,
        };
        assert_eq!(
            err.to_string(),
            "verification incomplete: 2/4 deployed, 1/4 verified"
        );
    }
}
