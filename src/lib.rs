//! Adaptive latency-based admission control for pipeline plugins.
//!
//! Sits inline in a request-processing pipeline and throttles inbound
//! tasks whenever the aggregate 90th-percentile latency of the concerned
//! downstream plugins exceeds a configured threshold: admit, hold in
//! back-off until latency recovers, or reject as flow-controlled. While
//! fused, a small share of traffic is leaked through as probes so the
//! latency signal stays alive.

#![deny(missing_docs)]

mod config;
mod counter;
mod error;
mod limiter;
mod observer;
pub mod pipeline;
mod probe;
mod rates;

pub use config::LatencyLimiterConfig;
pub use counter::{LatencyCounter, COUNTER_KEY};
pub use error::{ConfigError, RunError, StateError, StatisticsError};
pub use limiter::LatencyLimiter;
pub use probe::ProbePolicy;
pub use rates::ThroughputRate;
