//! Custom error types for the pipeline.
//!
//! This module defines the primary error type, `StereoError`, for the entire
//! library. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the error classes the engine distinguishes:
//!
//! - **`Config` / `Configuration`**: parse-level and semantic configuration
//!   failures (unknown camera model, unreadable parameter file, out-of-range
//!   value). Fatal at init.
//! - **`Protocol`**: API misuse such as submitting after terminate. Surfaced
//!   immediately; pipeline state does not advance.
//! - **`Resource`**: thread or synchronisation primitive creation failure.
//!   Fatal at init.
//! - **`NoSlot` / `NoData`**: transient ring-full / ring-empty conditions.
//!   Non-fatal; the caller backs off.
//! - **`Stage`**: a stage reported a failure for one frame. Attached to the
//!   result; the pipeline continues.
//! - **`Hard`**: an invariant violation inside the worker. The slot is marked
//!   invalid and a diagnostic counter is incremented.
//!
//! Transient errors stay local to the caller, stage errors ride with the
//! result, everything else surfaces through the engine entry that triggered
//! it. There are no silent retries.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type StereoResult<T> = std::result::Result<T, StereoError>;

#[derive(Error, Debug)]
pub enum StereoError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("No free slot in the frame ring")]
    NoSlot,

    #[error("No data available")]
    NoData,

    #[error("Stage '{stage}' failed: {code}")]
    Stage {
        /// Stage that reported the failure.
        stage: String,
        /// Stage-specific error code carried on the result.
        code: i32,
    },

    #[error("Invariant violation in worker: {0}")]
    Hard(String),

    #[error("Unknown stage index: {0}")]
    UnknownStage(usize),

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
}

impl StereoError {
    /// True for the transient ring conditions the caller should retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StereoError::NoSlot | StereoError::NoData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StereoError::Stage {
            stage: "Stereo Matching".to_string(),
            code: -3,
        };
        assert_eq!(err.to_string(), "Stage 'Stereo Matching' failed: -3");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StereoError::NoSlot.is_transient());
        assert!(StereoError::NoData.is_transient());
        assert!(!StereoError::NotRunning.is_transient());
        assert!(!StereoError::Hard("bad slot state".into()).is_transient());
    }
}
