//! Error types and soft stage outcomes
//!
//! Hard failures are [`EncodingError`]. Recoverable conditions that only skip
//! one delay candidate or one run are reported as a [`StageOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the encoding pipeline
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Invalid configuration, always fatal
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error with the offending path
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed transcript annotation
    #[error("malformed TextGrid {path}: {reason}")]
    TextGrid { path: PathBuf, reason: String },

    /// Unreadable or inconsistent embedding file
    #[error("embedding file {path}: {reason}")]
    Embedding { path: PathBuf, reason: String },

    /// Unreadable volumetric run file
    #[error("volume {path}: {reason}")]
    Volume { path: PathBuf, reason: String },

    /// Results table could not be read or written
    #[error("results table {path}: {reason}")]
    Results { path: PathBuf, reason: String },

    /// Matrices that should line up do not
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A numerical unit of work could not produce a result
    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl EncodingError {
    /// Wrap an `io::Error` with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should abort the whole batch rather than skip a run.
    ///
    /// Misconfiguration and failure to persist results are fatal; anything
    /// tied to one run's data only costs that run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Results { .. })
    }
}

pub type Result<T> = std::result::Result<T, EncodingError>;

/// Tagged outcome of a pipeline stage that may legitimately produce nothing
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    /// The stage produced a value
    Success(T),
    /// Input was missing or unreadable
    Unavailable(String),
    /// Input was present but statistically unusable
    Degenerate(String),
}

impl<T> StageOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Convert into an `Option`, dropping the reason
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Reason for a non-success outcome
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Unavailable(reason) | Self::Degenerate(reason) => Some(reason),
        }
    }

    /// Take the value of a success, or re-tag the skip for another payload
    /// type so it can be returned early.
    pub fn into_success<U>(self) -> std::result::Result<T, StageOutcome<U>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Unavailable(reason) => Err(StageOutcome::Unavailable(reason)),
            Self::Degenerate(reason) => Err(StageOutcome::Degenerate(reason)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            Self::Success(value) => StageOutcome::Success(f(value)),
            Self::Unavailable(reason) => StageOutcome::Unavailable(reason),
            Self::Degenerate(reason) => StageOutcome::Degenerate(reason),
        }
    }

    /// Chain a further stage onto a successful outcome
    pub fn and_then<U>(self, f: impl FnOnce(T) -> StageOutcome<U>) -> StageOutcome<U> {
        match self {
            Self::Success(value) => f(value),
            Self::Unavailable(reason) => StageOutcome::Unavailable(reason),
            Self::Degenerate(reason) => StageOutcome::Degenerate(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EncodingError::Config("folds".into()).is_fatal());
        assert!(EncodingError::Results {
            path: "x.csv".into(),
            reason: "disk full".into()
        }
        .is_fatal());
        assert!(!EncodingError::Numerical("singular".into()).is_fatal());
        assert!(!EncodingError::Volume {
            path: "run15.nii.gz".into(),
            reason: "truncated".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_outcome_chaining() {
        let ok: StageOutcome<usize> = StageOutcome::Success(3);
        assert_eq!(ok.clone().map(|n| n * 2), StageOutcome::Success(6));
        assert_eq!(ok.reason(), None);

        let missing: StageOutcome<usize> = StageOutcome::Unavailable("no file".into());
        let chained = missing.and_then(|n| StageOutcome::Success(n + 1));
        assert_eq!(chained.reason(), Some("no file"));
        assert!(!chained.is_success());
        assert_eq!(chained.success(), None);

        let skip: StageOutcome<usize> = StageOutcome::Degenerate("short".into());
        let retagged: std::result::Result<usize, StageOutcome<String>> = skip.into_success();
        assert_eq!(retagged, Err(StageOutcome::Degenerate("short".into())));
    }
}
