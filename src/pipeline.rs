//! Contracts between the limiter and its host pipeline.
//!
//! The limiter runs inline in a request-processing pipeline it does not
//! own. Everything it needs from the host (throughput statistics,
//! execution-time percentiles, a keyed shared store, task lifecycle)
//! is consumed through the traits in this module, and the limiter hands
//! itself back to the host as a [`Plugin`].

use std::{any::Any, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{RunError, StateError, StatisticsError};

/// Aggregation scope for statistics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsScope {
    /// Aggregated across all plugin instances in the pipeline.
    All,
}

/// Scope of a shared data bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketScope {
    /// Shared between all instances of the owning plugin.
    AllInstances,
}

/// A value stored in a [`DataBucket`].
pub type Shared = Arc<dyn Any + Send + Sync>;

/// A callback fired by the task runtime when a task finishes, regardless
/// of outcome.
pub type FinishedCallback = Box<dyn Fn(&dyn Task) + Send + Sync>;

/// How a rejected task should be classified by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// The task was rejected as flow-controlled.
    FlowControl,
    /// The task's cancellation signal was observed.
    TaskCancelled,
}

/// Throughput and execution-time statistics maintained by the host.
pub trait Statistics: Send + Sync {
    /// Throughput (req/s) of the named plugin over a one-second window.
    fn plugin_throughput_rate1(
        &self,
        plugin: &str,
        scope: StatisticsScope,
    ) -> Result<f64, StatisticsError>;

    /// Execution-time percentile of the named plugin, in milliseconds.
    fn plugin_execution_time_percentile(
        &self,
        plugin: &str,
        scope: StatisticsScope,
        quantile: f64,
    ) -> Result<f64, StatisticsError>;
}

/// A keyed store shared across plugin instances, owned by the pipeline.
pub trait DataBucket: Send + Sync {
    /// Look up `key`, binding the value produced by `factory` if absent.
    fn query_or_bind(
        &self,
        key: &str,
        factory: &(dyn Fn() -> Shared + '_),
    ) -> Result<Shared, StateError>;
}

/// The pipeline a plugin instance is running in.
pub trait PipelineContext: Send + Sync {
    /// Name of the pipeline, for diagnostics.
    fn pipeline_name(&self) -> String;

    /// Names of the plugins currently part of the pipeline, in order.
    fn plugin_names(&self) -> Vec<String>;

    /// The pipeline's statistics collaborator.
    fn statistics(&self) -> Arc<dyn Statistics>;

    /// The shared bucket for the named plugin.
    fn data_bucket(&self, plugin_name: &str, scope: BucketScope) -> Arc<dyn DataBucket>;
}

/// A unit of work travelling through the pipeline.
pub trait Task: Send + Sync {
    /// Register a callback to fire when the task finishes. Callbacks are
    /// keyed by name; registering the same name twice replaces the first.
    fn add_finished_callback(&self, name: &str, callback: FinishedCallback);

    /// Annotate the task with a keyed value visible to downstream plugins.
    fn with_value(&self, key: &str, value: serde_json::Value);

    /// Record a terminal error with the result kind the host should report.
    fn set_error(&self, error: RunError, kind: ResultKind);

    /// The error recorded on the task, if any.
    fn error(&self) -> Option<RunError>;

    /// Signal fired when the task is cancelled.
    fn cancellation(&self) -> CancellationToken;

    /// Why the task was cancelled, once [`cancellation`](Task::cancellation)
    /// has fired.
    fn cancel_cause(&self) -> Option<String>;
}

/// The surface a plugin exposes back to the pipeline engine.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once when the plugin joins the pipeline.
    fn prepare(&self, ctx: &Arc<dyn PipelineContext>);

    /// Process one task. Admission plugins either return `Ok` (the task
    /// proceeds, possibly with an error recorded on it) or propagate the
    /// task's own terminal error.
    async fn run(&self, ctx: &Arc<dyn PipelineContext>, task: &dyn Task) -> Result<(), RunError>;

    /// Called when the plugin leaves the pipeline.
    fn cleanup(&self, ctx: &Arc<dyn PipelineContext>);

    /// Called when the plugin instance is torn down.
    fn close(&mut self);

    /// The plugin instance name.
    fn name(&self) -> &str;
}
