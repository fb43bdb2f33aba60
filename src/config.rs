//! Engine configuration record. One instance is passed explicitly to the
//! execution engine at construction; nothing here is process-global.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Which reference scheduler the engine consults before propagating
/// start-like calls.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Honors `SchedulingConstraints` parents and requires all `Temporal`
    /// parents to have emitted.
    #[default]
    Basic,
    /// As `Basic`, plus the per-edge delay bounds of `Temporal` edges.
    Temporal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// Target cycle period in seconds. Accepts either a float or a string
    /// in configuration files.
    #[serde(deserialize_with = "float_or_string")]
    pub cycle_period: f64,
    /// Cycles whose duration exceeds `cycle_period * overrun_factor` are
    /// reported with a warning diagnostic.
    pub overrun_factor: f64,
    /// Surface the first unhandled plan-level exception as fatal and stop
    /// the engine instead of soft-stopping the missions.
    pub abort_on_exception: bool,
    /// Active scheduler.
    pub scheduler: SchedulerKind,
    /// Process Signal edges before Forwarding edges when both originate from
    /// the same emission. Per-edge order is always insertion order; this only
    /// fixes the inter-relation order, once, at engine construction.
    pub signal_first: bool,
    /// Cycles an unneeded finished object stays observable before removal.
    pub finalize_delay: u64,
    pub working_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Bounded capacity of the channel feeding the event logger thread.
    pub log_channel_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_period: 0.1,
            overrun_factor: 3.0,
            abort_on_exception: false,
            scheduler: SchedulerKind::default(),
            signal_first: true,
            finalize_delay: 1,
            working_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            log_channel_size: 65_536,
        }
    }
}

fn float_or_string<'deserialize, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FloatOrString {
        Float(f64),
        String(String),
    }

    match FloatOrString::deserialize(deserializer)? {
        FloatOrString::Float(v) => Ok(v),
        FloatOrString::String(v) => v.parse::<f64>().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, SchedulerKind};

    /// The cycle period must deserialize from both numbers and strings.
    #[test]
    fn test_cycle_period_float_or_string() {
        let from_float: EngineConfig =
            serde_json::from_value(serde_json::json!({
                "cycle_period": 0.25,
                "overrun_factor": 3.0,
                "abort_on_exception": false,
                "scheduler": "basic",
                "signal_first": true,
                "finalize_delay": 1,
                "working_dir": ".",
                "log_dir": "logs",
                "log_channel_size": 1024,
            }))
            .unwrap();
        assert_eq!(from_float.cycle_period, 0.25);

        let from_string: EngineConfig =
            serde_json::from_value(serde_json::json!({
                "cycle_period": "0.25",
                "overrun_factor": 3.0,
                "abort_on_exception": false,
                "scheduler": "temporal",
                "signal_first": true,
                "finalize_delay": 1,
                "working_dir": ".",
                "log_dir": "logs",
                "log_channel_size": 1024,
            }))
            .unwrap();
        assert_eq!(from_string.cycle_period, 0.25);
        assert_eq!(from_string.scheduler, SchedulerKind::Temporal);
    }
}
