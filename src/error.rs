//! Error types for the limiter.
//!
//! Three classes: configuration errors (fatal at validation time),
//! collaborator failures (logged and swallowed on the admission path),
//! and admission-denied outcomes (semantic results reported through the
//! task's error channel).

use thiserror::Error;

/// A configuration rejected by [`validate`](crate::LatencyLimiterConfig::validate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `plugin_name` is empty or blank.
    #[error("invalid plugin name")]
    BlankPluginName,

    /// `plugins_concerned` is empty.
    #[error("invalid plugins concerned")]
    NoPluginsConcerned,

    /// An entry of `plugins_concerned` is empty or blank.
    #[error("invalid concerned plugin name")]
    BlankConcernedPlugin,

    /// `latency_threshold_msec` is below 1.
    #[error("invalid latency millisecond threshold")]
    InvalidLatencyThreshold,

    /// `backoff_timeout_msec` is below -1.
    #[error("invalid backoff timeout, must be >= -1")]
    InvalidBackOffTimeout,

    /// `backoff_timeout_msec` exceeds ten seconds.
    #[error("invalid backoff timeout millisecond (requires less than or equal to 10 seconds)")]
    BackOffTimeoutTooLong,

    /// `probe_percentage` is outside `[1, 99]`.
    #[error("invalid probe percentage (requires bigger than zero and less than 100)")]
    InvalidProbePercentage,
}

/// An admission denied by the limiter.
///
/// These are semantic outcomes, not implementation failures. They are also
/// reported through [`Task::set_error`](crate::pipeline::Task::set_error)
/// with the matching [`ResultKind`](crate::pipeline::ResultKind).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// Rejected without waiting because back-off is disabled.
    #[error("service is unavailable caused by latency limit")]
    Fused,

    /// Rejected after the back-off budget elapsed without recovery.
    #[error("service is unavailable caused by latency limit backoff timeout")]
    BackOffTimeout,

    /// The task's cancellation signal fired during back-off.
    #[error("task is cancelled by {cause}")]
    Cancelled {
        /// The cancellation cause reported by the task.
        cause: String,
    },
}

/// Raised when the statistics collaborator cannot produce a sample.
#[derive(Debug, Clone, Error)]
#[error("statistics unavailable: {reason}")]
pub struct StatisticsError {
    /// Host-provided description of the failure.
    pub reason: String,
}

impl StatisticsError {
    /// Wrap a host failure description.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Raised when shared state cannot be resolved from the pipeline's bucket.
#[derive(Debug, Clone, Error)]
#[error("state lookup failed: {reason}")]
pub struct StateError {
    /// Host-provided description of the failure.
    pub reason: String,
}

impl StateError {
    /// Wrap a host failure description.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
