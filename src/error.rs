use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PKError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Integration failed at t={time}: {reason}")]
    Integration { time: f64, reason: String },

    #[error("Observation failed at t={time}: {reason}")]
    Observation { time: f64, reason: String },

    #[error("Scheduling conflict: {0}")]
    Scheduling(String),

    #[error("Simulation cancelled at t={time}")]
    Cancelled { time: f64 },
}

pub type PKResult<T> = Result<T, PKError>;

impl PKError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PKError::Configuration(msg.into())
    }

    pub(crate) fn scheduling(msg: impl Into<String>) -> Self {
        PKError::Scheduling(msg.into())
    }
}

/// Stage of the per-subject pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Individualization,
    Scheduling,
    Integration,
    Observation,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Individualization => "individualization",
            FailureKind::Scheduling => "scheduling",
            FailureKind::Integration => "integration",
            FailureKind::Observation => "observation",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A subject that did not produce records. Collected next to successful
/// results; never aborts the cohort.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectFailure {
    pub subject_id: usize,
    pub kind: FailureKind,
    pub reason: String,
    /// Last simulated time reached before the failure, when known.
    pub last_time: Option<f64>,
}

impl SubjectFailure {
    pub fn from_error(subject_id: usize, kind: FailureKind, err: &PKError) -> Self {
        let (kind, last_time) = match err {
            PKError::Integration { time, .. } => (FailureKind::Integration, Some(*time)),
            PKError::Observation { time, .. } => (FailureKind::Observation, Some(*time)),
            PKError::Cancelled { time } => (FailureKind::Cancelled, Some(*time)),
            PKError::Scheduling(_) => (FailureKind::Scheduling, None),
            _ => (kind, None),
        };
        Self {
            subject_id,
            kind,
            reason: err.to_string(),
            last_time,
        }
    }
}

impl fmt::Display for SubjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject {} ({}): {}", self.subject_id, self.kind, self.reason)?;
        if let Some(t) = self.last_time {
            write!(f, " [last t={}]", t)?;
        }
        Ok(())
    }
}
