//! Completion-driven latency observation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    counter,
    pipeline::{FinishedCallback, PipelineContext, StatisticsScope, Task},
};

const PERCENTILE: f64 = 0.9;

/// Build the task-finished callback that keeps the shared counter fed.
///
/// Fired by the task runtime whenever a task finishes, regardless of
/// outcome, including tasks the limiter rejected. That is what keeps
/// the latency signal alive under high fusing rates. Sums the p90
/// execution times of the concerned plugins that are currently part of
/// the pipeline and nudges the counter accordingly: the threshold applies
/// to the aggregate, not to any single plugin.
pub(crate) fn latency_check(
    ctx: Arc<dyn PipelineContext>,
    plugins_concerned: Vec<String>,
    latency_threshold_msec: u32,
    allow_msec: u16,
    limiter_name: String,
) -> FinishedCallback {
    Box::new(move |_task: &dyn Task| {
        let present = ctx.plugin_names();

        let mut latency_msec = 0.0;
        let mut sampled = false;

        for plugin in &plugins_concerned {
            if !present.iter().any(|name| name == plugin) {
                continue; // plugin left the pipeline, ignore safely
            }

            let sample = match ctx.statistics().plugin_execution_time_percentile(
                plugin,
                StatisticsScope::All,
                PERCENTILE,
            ) {
                Ok(sample) => sample,
                Err(err) => {
                    warn!(
                        pipeline = %ctx.pipeline_name(),
                        plugin = %plugin,
                        %err,
                        "p90 execution time unavailable, skipping counter adjustment"
                    );
                    return;
                }
            };

            if sample < 0.0 {
                continue; // doesn't make sense, defensive
            }

            latency_msec += sample;
            sampled = true;
        }

        if !sampled {
            return;
        }

        let counter = match counter::shared_counter(&ctx, &limiter_name, allow_msec) {
            Ok(counter) => counter,
            Err(_) => return, // ignore safely
        };

        debug!(latency_msec, latency_threshold_msec, "observed downstream latency");

        if latency_msec < f64::from(latency_threshold_msec) {
            counter.decrease();
        } else {
            counter.increase();
        }
    })
}
