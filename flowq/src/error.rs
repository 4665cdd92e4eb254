use std::fmt;

use thiserror::Error;

/// Status codes returned by the atomic scripts.
///
/// Each variant maps to a stable negative integer so that results can be
/// exchanged with stores that only speak numbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Error)]
pub enum ScriptError {
    #[error("job does not exist")]
    JobNotExist,
    #[error("job lock does not exist")]
    JobLockNotExist,
    #[error("job is not in the expected state")]
    JobNotInState,
    #[error("job has pending dependencies")]
    JobPendingDependencies,
    #[error("parent job does not exist")]
    ParentJobNotExist,
    #[error("job lock is held by another token")]
    JobLockMismatch,
    #[error("parent job cannot be replaced")]
    ParentJobCannotBeReplaced,
    #[error("job belongs to a job scheduler")]
    JobBelongsToJobScheduler,
    #[error("job has failed children")]
    JobHasFailedChildren,
    #[error("queue is not paused")]
    QueueNotPaused,
    #[error("queue has active jobs")]
    ActiveJobsExist,
}

impl ScriptError {
    /// Numeric status code of this error.
    pub fn code(self) -> i64 {
        match self {
            ScriptError::JobNotExist => -1,
            ScriptError::JobLockNotExist => -2,
            ScriptError::JobNotInState => -3,
            ScriptError::JobPendingDependencies => -4,
            ScriptError::ParentJobNotExist => -5,
            ScriptError::JobLockMismatch => -6,
            ScriptError::ParentJobCannotBeReplaced => -7,
            ScriptError::JobBelongsToJobScheduler => -8,
            ScriptError::JobHasFailedChildren => -9,
            ScriptError::QueueNotPaused => -10,
            ScriptError::ActiveJobsExist => -11,
        }
    }

    /// Map a numeric status code back to its error, if it is one.
    pub fn from_code(code: i64) -> Option<Self> {
        let err = match code {
            -1 => ScriptError::JobNotExist,
            -2 => ScriptError::JobLockNotExist,
            -3 => ScriptError::JobNotInState,
            -4 => ScriptError::JobPendingDependencies,
            -5 => ScriptError::ParentJobNotExist,
            -6 => ScriptError::JobLockMismatch,
            -7 => ScriptError::ParentJobCannotBeReplaced,
            -8 => ScriptError::JobBelongsToJobScheduler,
            -9 => ScriptError::JobHasFailedChildren,
            -10 => ScriptError::QueueNotPaused,
            -11 => ScriptError::ActiveJobsExist,
            _ => return None,
        };
        Some(err)
    }
}

/// Error surfaced by queue, job and worker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A script refused the transition.
    #[error("{command} failed for job {job_id}: {source}")]
    Script {
        command: &'static str,
        job_id: String,
        #[source]
        source: ScriptError,
    },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl QueueError {
    pub(crate) fn script(
        command: &'static str,
        job_id: impl Into<String>,
        source: ScriptError,
    ) -> Self {
        QueueError::Script {
            command,
            job_id: job_id.into(),
            source,
        }
    }

    /// The underlying script error, when the failure came from a script.
    pub fn script_error(&self) -> Option<ScriptError> {
        match self {
            QueueError::Script { source, .. } => Some(*source),
            _ => None,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Processor signal: fail the job now, ignoring any remaining attempts.
#[derive(Debug, Clone)]
pub struct UnrecoverableError(pub String);

impl UnrecoverableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for UnrecoverableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UnrecoverableError {}

/// Processor signal: the job already moved itself to `delayed`.
#[derive(Debug, Clone, Default, Error)]
#[error("job moved to delayed")]
pub struct DelayedError;

/// Processor signal: the job already moved itself to `waiting-children`.
#[derive(Debug, Clone, Default, Error)]
#[error("job moved to waiting-children")]
pub struct WaitingChildrenError;

/// Processor signal: the queue is rate limited; return the job to `wait`
/// without charging an attempt.
#[derive(Debug, Clone, Default, Error)]
#[error("rate limit exceeded")]
pub struct RateLimitError;

/// How the worker should treat an error returned by a processor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ProcessorSignal {
    Unrecoverable,
    Delayed,
    WaitingChildren,
    RateLimited,
    Failed,
}

impl ProcessorSignal {
    pub(crate) fn classify(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<UnrecoverableError>().is_some() {
            ProcessorSignal::Unrecoverable
        } else if err.downcast_ref::<DelayedError>().is_some() {
            ProcessorSignal::Delayed
        } else if err.downcast_ref::<WaitingChildrenError>().is_some() {
            ProcessorSignal::WaitingChildren
        } else if err.downcast_ref::<RateLimitError>().is_some() {
            ProcessorSignal::RateLimited
        } else {
            ProcessorSignal::Failed
        }
    }
}
