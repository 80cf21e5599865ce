//! Limiter configuration.

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Configuration for a [`LatencyLimiter`](crate::LatencyLimiter) instance.
///
/// Immutable once [`validate`](Self::validate) has accepted it. Field
/// names are stable for interoperability with existing deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatencyLimiterConfig {
    /// Name of this plugin instance.
    #[serde(default)]
    pub plugin_name: String,

    /// Time window (ms) used to size the counter ceiling from the
    /// outbound rate.
    #[serde(default = "defaults::allow_msec")]
    pub allow_msec: u16,

    /// Maximum wait (ms) while fused. `0` fuses immediately, `-1` waits
    /// forever.
    #[serde(default = "defaults::backoff_timeout_msec")]
    pub backoff_timeout_msec: i16,

    /// If non-empty, admitted tasks are annotated with the observed
    /// flow-controlled percentage under this key.
    #[serde(default)]
    pub flow_control_percentage_key: String,

    /// Aggregate 90th-percentile latency (ms) above which the counter
    /// increases.
    #[serde(default = "defaults::latency_threshold_msec")]
    pub latency_threshold_msec: u32,

    /// Downstream plugins whose latency is summed against the threshold.
    #[serde(default)]
    pub plugins_concerned: Vec<String>,

    /// Target share of requests admitted as probes while fused, `[1, 99]`.
    #[serde(default = "defaults::probe_percentage")]
    pub probe_percentage: u8,
}

mod defaults {
    pub(super) fn allow_msec() -> u16 {
        1000
    }
    pub(super) fn backoff_timeout_msec() -> i16 {
        1000
    }
    pub(super) fn latency_threshold_msec() -> u32 {
        800
    }
    pub(super) fn probe_percentage() -> u8 {
        10
    }
}

impl Default for LatencyLimiterConfig {
    fn default() -> Self {
        Self {
            plugin_name: String::new(),
            allow_msec: defaults::allow_msec(),
            backoff_timeout_msec: defaults::backoff_timeout_msec(),
            flow_control_percentage_key: String::new(),
            latency_threshold_msec: defaults::latency_threshold_msec(),
            plugins_concerned: Vec::new(),
            probe_percentage: defaults::probe_percentage(),
        }
    }
}

impl LatencyLimiterConfig {
    /// Check the configuration and normalize it.
    ///
    /// Trims `flow_control_percentage_key`. The two easy-to-misconfigure
    /// legal values of `backoff_timeout_msec` (`-1` and `0`) are accepted
    /// with a warning.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.plugin_name.trim().is_empty() {
            return Err(ConfigError::BlankPluginName);
        }

        if self.plugins_concerned.is_empty() {
            return Err(ConfigError::NoPluginsConcerned);
        }
        if self.plugins_concerned.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::BlankConcernedPlugin);
        }

        if self.latency_threshold_msec < 1 {
            return Err(ConfigError::InvalidLatencyThreshold);
        }

        match self.backoff_timeout_msec {
            t if t < -1 => return Err(ConfigError::InvalidBackOffTimeout),
            -1 => warn!(
                plugin = %self.plugin_name,
                "infinite back-off timeout applied, no request can time out of back-off"
            ),
            0 => warn!(
                plugin = %self.plugin_name,
                "zero back-off timeout applied, no request will be backed off"
            ),
            t if t > 10_000 => return Err(ConfigError::BackOffTimeoutTooLong),
            _ => {}
        }

        if !(1..=99).contains(&self.probe_percentage) {
            return Err(ConfigError::InvalidProbePercentage);
        }

        self.flow_control_percentage_key = self.flow_control_percentage_key.trim().to_owned();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> LatencyLimiterConfig {
        LatencyLimiterConfig {
            plugin_name: "limiter".into(),
            plugins_concerned: vec!["upstream".into()],
            ..Default::default()
        }
    }

    #[test]
    fn accepts_defaults_with_name_and_concerned_plugins() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_blank_plugin_name() {
        let mut conf = valid();
        conf.plugin_name = "  ".into();
        assert_eq!(conf.validate(), Err(ConfigError::BlankPluginName));
    }

    #[test]
    fn rejects_empty_plugins_concerned() {
        let mut conf = valid();
        conf.plugins_concerned.clear();
        assert_eq!(conf.validate(), Err(ConfigError::NoPluginsConcerned));
    }

    #[test]
    fn rejects_blank_concerned_plugin() {
        let mut conf = valid();
        conf.plugins_concerned.push(" ".into());
        assert_eq!(conf.validate(), Err(ConfigError::BlankConcernedPlugin));
    }

    #[test]
    fn rejects_zero_latency_threshold() {
        let mut conf = valid();
        conf.latency_threshold_msec = 0;
        assert_eq!(conf.validate(), Err(ConfigError::InvalidLatencyThreshold));
    }

    #[test]
    fn backoff_timeout_bounds() {
        let mut conf = valid();
        conf.backoff_timeout_msec = -2;
        assert_eq!(conf.validate(), Err(ConfigError::InvalidBackOffTimeout));

        let mut conf = valid();
        conf.backoff_timeout_msec = 10_001;
        assert_eq!(conf.validate(), Err(ConfigError::BackOffTimeoutTooLong));

        // Legal but warned.
        for t in [-1, 0, 10_000] {
            let mut conf = valid();
            conf.backoff_timeout_msec = t;
            assert!(conf.validate().is_ok(), "timeout {t} should be legal");
        }
    }

    #[test]
    fn probe_percentage_bounds() {
        for p in [0, 100] {
            let mut conf = valid();
            conf.probe_percentage = p;
            assert_eq!(conf.validate(), Err(ConfigError::InvalidProbePercentage));
        }
        for p in [1, 99] {
            let mut conf = valid();
            conf.probe_percentage = p;
            assert!(conf.validate().is_ok());
        }
    }

    #[test]
    fn trims_flow_control_percentage_key() {
        let mut conf = valid();
        conf.flow_control_percentage_key = "  fc_pct  ".into();
        conf.validate().unwrap();
        assert_eq!(conf.flow_control_percentage_key, "fc_pct");
    }

    #[test]
    fn deserializes_wire_names() {
        let conf: LatencyLimiterConfig = serde_json::from_str(
            r#"{
                "plugin_name": "latency-limiter",
                "allow_msec": 500,
                "backoff_timeout_msec": 100,
                "flow_control_percentage_key": "fc",
                "latency_threshold_msec": 900,
                "plugins_concerned": ["a", "b"],
                "probe_percentage": 5
            }"#,
        )
        .unwrap();

        assert_eq!(conf.allow_msec, 500);
        assert_eq!(conf.backoff_timeout_msec, 100);
        assert_eq!(conf.latency_threshold_msec, 900);
        assert_eq!(conf.plugins_concerned, vec!["a", "b"]);
        assert_eq!(conf.probe_percentage, 5);
    }

    #[test]
    fn deserializes_with_defaults() {
        let conf: LatencyLimiterConfig = serde_json::from_str(
            r#"{"plugin_name": "l", "plugins_concerned": ["p"]}"#,
        )
        .unwrap();

        assert_eq!(conf.allow_msec, 1000);
        assert_eq!(conf.backoff_timeout_msec, 1000);
        assert_eq!(conf.latency_threshold_msec, 800);
        assert_eq!(conf.probe_percentage, 10);
    }
}
