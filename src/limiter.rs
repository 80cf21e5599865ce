//! The admission-controlling plugin.

use std::{future, sync::Arc, time::Duration};

use async_trait::async_trait;
use conv::ConvAsUtil;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::{
    config::LatencyLimiterConfig,
    counter::{self, LatencyCounter},
    error::{ConfigError, RunError},
    observer,
    pipeline::{PipelineContext, Plugin, ResultKind, StatisticsScope, Task},
    probe::ProbePolicy,
    rates,
};

/// Throttles inbound tasks whenever downstream tail latency exceeds the
/// configured threshold.
///
/// Each task is admitted immediately, held in back-off until downstream
/// latency recovers, or rejected as flow-controlled. The decision is
/// driven by the shared [`LatencyCounter`], whose ceiling tracks
/// downstream capacity: a count above one allow-window's worth of
/// outbound service means the limiter has seen more slow completions than
/// downstream could have produced in that window.
///
/// Internal failures (statistics unavailable, bucket lookup failures)
/// degrade to "do not limit". The data path never pays for a broken
/// observability path.
#[derive(Debug)]
pub struct LatencyLimiter {
    conf: LatencyLimiterConfig,
    probe: ProbePolicy,
}

enum BackOff {
    Recovered,
    TimedOut,
    Cancelled(RunError),
}

impl LatencyLimiter {
    /// Validate `conf` and build the limiter.
    pub fn new(mut conf: LatencyLimiterConfig) -> Result<Self, ConfigError> {
        conf.validate()?;
        let probe = ProbePolicy::new(conf.probe_percentage);
        Ok(Self { conf, probe })
    }

    /// Wait for counter recovery, a timeout, or cancellation.
    async fn back_off(
        &self,
        task: &dyn Task,
        counter: &LatencyCounter,
        counter_threshold: u64,
    ) -> BackOff {
        let deadline = match self.conf.backoff_timeout_msec {
            -1 => None,
            timeout => Some(Instant::now() + Duration::from_millis(timeout as u64)),
        };
        let step = poll_step(self.conf.backoff_timeout_msec);
        let cancellation = task.cancellation();

        loop {
            tokio::select! {
                _ = deadline_elapsed(deadline) => return BackOff::TimedOut,
                _ = time::sleep(step) => {
                    if counter.count().await < counter_threshold {
                        debug!("passed latency limiter after back-off");
                        return BackOff::Recovered;
                    }
                }
                _ = cancellation.cancelled() => {
                    let cause = task
                        .cancel_cause()
                        .unwrap_or_else(|| String::from("unknown cause"));
                    return BackOff::Cancelled(RunError::Cancelled { cause });
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for LatencyLimiter {
    fn prepare(&self, ctx: &Arc<dyn PipelineContext>) {
        rates::bind_rate_entries(ctx, self.name());
    }

    async fn run(&self, ctx: &Arc<dyn PipelineContext>, task: &dyn Task) -> Result<(), RunError> {
        // Attached before any admission decision: rejected tasks still
        // fire the callback, keeping the counter fed while fused.
        task.add_finished_callback(
            &format!("{}-check-latency", self.name()),
            observer::latency_check(
                ctx.clone(),
                self.conf.plugins_concerned.clone(),
                self.conf.latency_threshold_msec,
                self.conf.allow_msec,
                self.name().to_owned(),
            ),
        );

        tokio::spawn(rates::refresh_inbound_rate(
            ctx.clone(),
            self.name().to_owned(),
        ));

        let counter = match counter::shared_counter(ctx, self.name(), self.conf.allow_msec) {
            Ok(counter) => counter,
            Err(err) => {
                warn!(
                    pipeline = %ctx.pipeline_name(),
                    %err,
                    "counter lookup failed, ignored to limit request"
                );
                return Ok(());
            }
        };

        let inbound_rate = match rates::inbound_rate(ctx, self.name()).await {
            Ok(rate) => rate,
            Err(err) => {
                warn!(
                    pipeline = %ctx.pipeline_name(),
                    %err,
                    "inbound rate unavailable, ignored to limit request"
                );
                return Ok(());
            }
        };

        let outbound_rate = match ctx
            .statistics()
            .plugin_throughput_rate1(self.name(), StatisticsScope::All)
        {
            Ok(rate) => rate,
            Err(err) => {
                warn!(
                    pipeline = %ctx.pipeline_name(),
                    %err,
                    "outbound rate unavailable, ignored to limit request"
                );
                return Ok(());
            }
        };

        // One allow-window's worth of outbound service. Sizing the
        // threshold on the window absorbs thrashing from the network,
        // upstream GC and other transients.
        let counter_threshold = threshold_for(outbound_rate, self.conf.allow_msec);
        let count = counter.count().await;
        debug!(
            pipeline = %ctx.pipeline_name(),
            inbound_rate,
            outbound_rate,
            count,
            counter_threshold,
            "admission check"
        );

        if count > counter_threshold {
            tokio::spawn(rates::refresh_flow_controlled_rate(
                ctx.clone(),
                self.name().to_owned(),
            ));

            if !self.probe.is_probe(outbound_rate, inbound_rate) {
                if self.conf.backoff_timeout_msec == 0 {
                    // Service fusing, no queuing configured.
                    task.set_error(RunError::Fused, ResultKind::FlowControl);
                    return Ok(());
                }

                match self.back_off(task, &counter, counter_threshold).await {
                    BackOff::Recovered => {}
                    BackOff::TimedOut => {
                        task.set_error(RunError::BackOffTimeout, ResultKind::FlowControl);
                        return Ok(());
                    }
                    BackOff::Cancelled(err) => {
                        task.set_error(err.clone(), ResultKind::TaskCancelled);
                        return Err(err);
                    }
                }
            }
        }

        if !self.conf.flow_control_percentage_key.is_empty() {
            match rates::flow_controlled_percentage(ctx, self.name()).await {
                Ok(percentage) => {
                    task.with_value(
                        &self.conf.flow_control_percentage_key,
                        serde_json::json!(percentage),
                    );
                }
                Err(err) => {
                    warn!(
                        pipeline = %ctx.pipeline_name(),
                        %err,
                        "flow-control percentage unavailable, ignored this output"
                    );
                }
            }
        }

        Ok(())
    }

    fn cleanup(&self, _ctx: &Arc<dyn PipelineContext>) {
        // Nothing to do: the counter and rate estimators belong to the
        // pipeline's bucket and die with it.
    }

    fn close(&mut self) {}

    fn name(&self) -> &str {
        &self.conf.plugin_name
    }
}

/// Ten polls per back-off budget; the 1 ms floor covers tiny and infinite
/// budgets alike.
fn poll_step(backoff_timeout_msec: i16) -> Duration {
    if backoff_timeout_msec <= 10 {
        Duration::from_millis(1)
    } else {
        Duration::from_millis((backoff_timeout_msec / 10) as u64)
    }
}

/// Pending forever when there is no deadline, like a receive on a nil
/// channel.
async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

fn threshold_for(outbound_rate: f64, allow_msec: u16) -> u64 {
    (f64::from(allow_msec) / 1000.0 * outbound_rate)
        .floor()
        .approx()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_step_is_a_tenth_of_the_budget() {
        assert_eq!(poll_step(100), Duration::from_millis(10));
        assert_eq!(poll_step(10_000), Duration::from_millis(1000));
    }

    #[test]
    fn poll_step_floors_at_one_milli() {
        assert_eq!(poll_step(10), Duration::from_millis(1));
        assert_eq!(poll_step(1), Duration::from_millis(1));
        assert_eq!(poll_step(-1), Duration::from_millis(1));
    }

    #[test]
    fn threshold_floors_the_window_share() {
        assert_eq!(threshold_for(50.0, 1000), 50);
        assert_eq!(threshold_for(50.9, 1000), 50);
        assert_eq!(threshold_for(20.0, 500), 10);
        assert_eq!(threshold_for(0.0, 1000), 0);
    }
}
