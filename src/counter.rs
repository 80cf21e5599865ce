//! Saturation counter driven by task-completion callbacks.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use conv::ConvAsUtil;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    error::StateError,
    pipeline::{BucketScope, PipelineContext, Shared, Statistics, StatisticsScope},
};

/// Bucket key under which the shared counter of a limiter instance is bound.
pub const COUNTER_KEY: &str = "latency_limiter_counter";

const INBOX_CAPACITY: usize = 32_768;

/// Counts completions that observed the downstream above its latency
/// threshold.
///
/// The counter's ceiling is not fixed: every increment re-derives it from
/// the latest outbound throughput estimate, so the value can never exceed
/// one [`allow window`](crate::LatencyLimiterConfig::allow_msec) worth of
/// downstream service. A decrement halves the value, opening the gate
/// quickly once latency normalizes.
///
/// Increments and decrements are posted to a bounded inbox and serialized
/// by a single consumer, so writers never race each other. [`count`](Self::count)
/// enqueues a read barrier on the same inbox, which orders it after every
/// write submitted before the call.
#[derive(Debug)]
pub struct LatencyCounter {
    inbox: mpsc::Sender<Op>,
    closed: AtomicBool,
}

enum Op {
    Increase,
    Decrease,
    Snapshot(oneshot::Sender<u64>),
    Shutdown,
}

impl LatencyCounter {
    /// Create a counter whose ceiling follows the outbound rate of the
    /// named plugin, and spawn its consumer.
    pub fn new(stats: Arc<dyn Statistics>, plugin_name: impl Into<String>, allow_msec: u16) -> Self {
        let (inbox, worker_inbox) = mpsc::channel(INBOX_CAPACITY);

        tokio::spawn(consume(worker_inbox, stats, plugin_name.into(), allow_msec));

        Self {
            inbox,
            closed: AtomicBool::new(false),
        }
    }

    /// Record one completion that exceeded the latency threshold.
    ///
    /// The consumer samples the outbound rate before applying the
    /// increment; if the sample is unavailable the increment is skipped,
    /// so a broken statistics path can never push the counter up.
    pub fn increase(&self) {
        self.submit(Op::Increase);
    }

    /// Record one completion below the latency threshold. Halves the value.
    pub fn decrease(&self) {
        self.submit(Op::Decrease);
    }

    /// The current saturation level.
    ///
    /// Observes every increment and decrement submitted before this call.
    /// Returns 0 once the counter is closed.
    pub async fn count(&self) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let (reply, barrier) = oneshot::channel();
        if self.inbox.send(Op::Snapshot(reply)).await.is_err() {
            return 0;
        }
        barrier.await.unwrap_or(0)
    }

    /// Stop the consumer. Idempotent; later writes are dropped and later
    /// reads return 0.
    pub fn close(&self) {
        // The flag flips before the sentinel goes out, so a write racing
        // close either sees the flag or lands on a dropped receiver.
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inbox.try_send(Op::Shutdown);
        }
    }

    fn submit(&self, op: Op) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        match self.inbox.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("latency counter inbox full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn consume(
    mut inbox: mpsc::Receiver<Op>,
    stats: Arc<dyn Statistics>,
    plugin_name: String,
    allow_msec: u16,
) {
    let mut value: u64 = 0;

    while let Some(op) = inbox.recv().await {
        match op {
            Op::Increase => match stats.plugin_throughput_rate1(&plugin_name, StatisticsScope::All)
            {
                Ok(outbound_rate) => {
                    let ceiling = ceiling_for(outbound_rate, allow_msec);
                    // The ceiling moves with the outbound rate, so clamp
                    // even when not incrementing past it.
                    value = (value + 1).min(ceiling);
                    debug!(value, ceiling, outbound_rate, "latency counter increased");
                }
                Err(err) => {
                    warn!(plugin = %plugin_name, %err, "outbound rate unavailable, increase skipped");
                }
            },
            Op::Decrease => {
                if value > 0 {
                    value /= 2; // fast recovery
                }
            }
            Op::Snapshot(reply) => {
                let _ = reply.send(value);
            }
            Op::Shutdown => break,
        }
    }
}

/// One allow-window's worth of downstream service, never below 1.
fn ceiling_for(outbound_rate: f64, allow_msec: u16) -> u64 {
    let ceiling = (outbound_rate * f64::from(allow_msec) / 1000.0 + 0.5).floor();
    ceiling.approx().map_or(1, |c: u64| c.max(1))
}

/// Resolve the limiter's shared counter from the pipeline bucket, creating
/// it on first use.
pub(crate) fn shared_counter(
    ctx: &Arc<dyn PipelineContext>,
    limiter_name: &str,
    allow_msec: u16,
) -> Result<Arc<LatencyCounter>, StateError> {
    let bucket = ctx.data_bucket(limiter_name, BucketScope::AllInstances);

    let stats = ctx.statistics();
    let name = limiter_name.to_owned();
    let factory = move || -> Shared {
        Arc::new(LatencyCounter::new(stats.clone(), name.clone(), allow_msec))
    };

    bucket
        .query_or_bind(COUNTER_KEY, &factory)?
        .downcast::<LatencyCounter>()
        .map_err(|_| StateError::new(format!("unexpected value bound under {COUNTER_KEY}")))
}
