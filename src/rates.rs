//! Bucket-resident throughput estimators.
//!
//! The pipeline's statistics collaborator covers per-plugin rates, but
//! two signals belong to the limiter itself: how much traffic enters the
//! pipeline ahead of it, and how much it is rejecting. Both live in the
//! limiter's shared bucket so that every instance across pipeline workers
//! feeds the same estimate.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::{
    error::StateError,
    pipeline::{BucketScope, PipelineContext, Shared},
};

pub(crate) const INBOUND_RATE_KEY: &str = "inbound_throughput_rate";
pub(crate) const FLOW_CONTROLLED_RATE_KEY: &str = "flow_controlled_throughput_rate";

/// Events-per-second over one-second windows, smoothed exponentially.
///
/// The first completed window seeds the estimate directly; later windows
/// blend in, so a burst does not whipsaw the rate.
#[derive(Debug)]
pub struct ThroughputRate {
    inner: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    events: u64,
    rate: f64,
    primed: bool,
}

impl ThroughputRate {
    const WINDOW: Duration = Duration::from_secs(1);

    /// Weighting of the newest window.
    const SMOOTHING: f64 = 0.5;

    /// An estimator with no observations yet (rate 0).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Window {
                start: Instant::now(),
                events: 0,
                rate: 0.0,
                primed: false,
            }),
        }
    }

    /// Record one event.
    pub async fn update(&self) {
        let mut window = self.inner.lock().await;
        window.roll();
        window.events += 1;
    }

    /// The current rate estimate (events/s).
    pub async fn get(&self) -> f64 {
        let mut window = self.inner.lock().await;
        window.roll();
        window.rate
    }
}

impl Default for ThroughputRate {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    fn roll(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed < ThroughputRate::WINDOW {
            return;
        }

        let observed = self.events as f64 / elapsed.as_secs_f64();
        self.rate = if self.primed {
            self.rate + (observed - self.rate) * ThroughputRate::SMOOTHING
        } else {
            observed
        };
        self.primed = true;

        self.start = Instant::now();
        self.events = 0;
    }
}

fn rate_entry(
    ctx: &Arc<dyn PipelineContext>,
    limiter_name: &str,
    key: &str,
) -> Result<Arc<ThroughputRate>, StateError> {
    let bucket = ctx.data_bucket(limiter_name, BucketScope::AllInstances);

    let factory = || -> Shared { Arc::new(ThroughputRate::new()) };

    bucket
        .query_or_bind(key, &factory)?
        .downcast::<ThroughputRate>()
        .map_err(|_| StateError::new(format!("unexpected value bound under {key}")))
}

/// Eagerly bind both estimators so the first admission finds them warm.
pub(crate) fn bind_rate_entries(ctx: &Arc<dyn PipelineContext>, limiter_name: &str) {
    for key in [INBOUND_RATE_KEY, FLOW_CONTROLLED_RATE_KEY] {
        if let Err(err) = rate_entry(ctx, limiter_name, key) {
            debug!(pipeline = %ctx.pipeline_name(), %err, key, "rate estimator not bound");
        }
    }
}

/// Tick the pipeline's inbound estimator. Fire-and-forget.
pub(crate) async fn refresh_inbound_rate(ctx: Arc<dyn PipelineContext>, limiter_name: String) {
    match rate_entry(&ctx, &limiter_name, INBOUND_RATE_KEY) {
        Ok(rate) => rate.update().await,
        Err(err) => {
            debug!(pipeline = %ctx.pipeline_name(), %err, "inbound rate refresh skipped");
        }
    }
}

/// Tick the flow-controlled estimator. Fire-and-forget.
pub(crate) async fn refresh_flow_controlled_rate(
    ctx: Arc<dyn PipelineContext>,
    limiter_name: String,
) {
    match rate_entry(&ctx, &limiter_name, FLOW_CONTROLLED_RATE_KEY) {
        Ok(rate) => rate.update().await,
        Err(err) => {
            debug!(pipeline = %ctx.pipeline_name(), %err, "flow-controlled rate refresh skipped");
        }
    }
}

/// Traffic entering the pipeline, events/s.
pub(crate) async fn inbound_rate(
    ctx: &Arc<dyn PipelineContext>,
    limiter_name: &str,
) -> Result<f64, StateError> {
    Ok(rate_entry(ctx, limiter_name, INBOUND_RATE_KEY)?.get().await)
}

/// Share of inbound traffic currently being flow-controlled, in percent.
pub(crate) async fn flow_controlled_percentage(
    ctx: &Arc<dyn PipelineContext>,
    limiter_name: &str,
) -> Result<f64, StateError> {
    let inbound = rate_entry(ctx, limiter_name, INBOUND_RATE_KEY)?.get().await;
    let flow_controlled = rate_entry(ctx, limiter_name, FLOW_CONTROLLED_RATE_KEY)?
        .get()
        .await;

    if inbound <= 0.0 {
        return Ok(0.0);
    }
    Ok(100.0 * flow_controlled / inbound)
}
