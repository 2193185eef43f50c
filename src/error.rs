//! Error types for binoc

use thiserror::Error;

use crate::capture::Eye;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("{0} is already started")]
    AlreadyStarted(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("No frame source configured")]
    NoSources,

    #[error("Source error ({source_name}): {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error("Source mismatch: {0}")]
    SourceMismatch(String),

    #[error("Unknown frame source kind '{0}'")]
    UnknownSource(String),

    #[error("Unknown processing pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Processing error ({eye:?}): {message}")]
    Processing { eye: Eye, message: String },

    #[error("Worker '{0}' stopped unexpectedly")]
    WorkerStopped(String),

    #[error("Worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{} tasks failed: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<TrackerError>),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    pub fn from_source(source_name: impl Into<String>, message: impl ToString) -> Self {
        TrackerError::Source {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    /// Folds collected faults: none is success, one is returned as is,
    /// several become `Aggregate`.
    pub fn combine(mut errors: Vec<TrackerError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TrackerError::Aggregate(errors)),
        }
    }
}

fn join_messages(errors: &[TrackerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_empty_is_ok() {
        assert!(TrackerError::combine(Vec::new()).is_ok());
    }

    #[test]
    fn test_combine_single_is_unwrapped() {
        let err = TrackerError::combine(vec![TrackerError::NoSources]).unwrap_err();
        assert!(matches!(err, TrackerError::NoSources));
    }

    #[test]
    fn test_combine_many_aggregates() {
        let err = TrackerError::combine(vec![
            TrackerError::WorkerPanicked("grab-left".into()),
            TrackerError::from_source("right", "disconnected"),
        ])
        .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("2 tasks failed"));
        assert!(message.contains("grab-left"));
        assert!(message.contains("disconnected"));
    }
}
