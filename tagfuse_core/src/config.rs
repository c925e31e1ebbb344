//! Tracker configuration loaded from JSON.
//!
//! Every section is optional; missing fields take the defaults of their
//! config struct.
//!
//! ```json
//! {
//!   "yaw_reference": 90.0,
//!   "endpoint": { "position_latency": 0.07, "filter": { "speed_window": 0.2 } },
//!   "tags": [ { "uid": 258, "version": "v3" }, { "uid": 259, "secondary": true } ]
//! }
//! ```

use crate::endpoint::EndpointConfig;
use crate::handoff::DEFAULT_HANDOFF_DEPTH;
use crate::receiver::ReceiverConfig;
use crate::registry::{TagConfig, TrackerRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid(field, format!("must be positive, got {}", value)))
    }
}

/// Full configuration of a tracking client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Per-endpoint filter, clock and latency settings
    pub endpoint: EndpointConfig,

    /// Depth of each per-endpoint handoff queue (default: 10)
    pub handoff_depth: usize,

    pub receiver: ReceiverConfig,

    /// Room calibration heading in degrees
    pub yaw_reference: f64,

    /// Tags registered at startup
    pub tags: Vec<TagConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            handoff_depth: DEFAULT_HANDOFF_DEPTH,
            receiver: ReceiverConfig::default(),
            yaw_reference: 0.0,
            tags: Vec::new(),
        }
    }
}

impl TrackerConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), tags = config.tags.len(), "Loaded tracker config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.endpoint.filter;
        if f.history_capacity == 0 {
            return Err(invalid("filter.history_capacity", "must be at least 1"));
        }
        positive("filter.min_sample_interval", f.min_sample_interval)?;
        positive("filter.max_prediction_delay", f.max_prediction_delay)?;
        positive("filter.max_inertial_gap", f.max_inertial_gap)?;
        positive("filter.discard_speed", f.discard_speed)?;
        positive("filter.discard_distance", f.discard_distance)?;
        positive("filter.speed_window", f.speed_window)?;
        positive("filter.acceleration_only_delay", f.acceleration_only_delay)?;
        positive("filter.max_speed_viability", f.max_speed_viability)?;
        positive("filter.max_acceleration_viability", f.max_acceleration_viability)?;
        positive("filter.discrepancy_threshold", f.discrepancy_threshold)?;
        if f.inertial_decay_grace < 0.0 || f.inertial_decay_grace > f.acceleration_only_delay {
            return Err(invalid(
                "filter.inertial_decay_grace",
                "must lie between 0 and acceleration_only_delay",
            ));
        }
        if f.reacquisition_duration < 0.0 {
            return Err(invalid("filter.reacquisition_duration", "must not be negative"));
        }

        let s = &f.smoothing;
        positive("filter.smoothing.frequency", s.frequency)?;
        positive("filter.smoothing.min_cutoff", s.min_cutoff)?;
        positive("filter.smoothing.derivative_cutoff", s.derivative_cutoff)?;
        if s.beta < 0.0 {
            return Err(invalid("filter.smoothing.beta", "must not be negative"));
        }

        positive("clock.modulo", self.endpoint.clock.modulo)?;
        if self.endpoint.clock.window == 0 {
            return Err(invalid("clock.window", "must be at least 1"));
        }
        if self.endpoint.position_latency < 0.0 {
            return Err(invalid("position_latency", "must not be negative"));
        }
        if self.handoff_depth == 0 {
            return Err(invalid("handoff_depth", "must be at least 1"));
        }
        if self.receiver.poll_interval_ms == 0 {
            return Err(invalid("receiver.poll_interval_ms", "must be at least 1"));
        }

        let mut seen = BTreeSet::new();
        for tag in &self.tags {
            if !seen.insert(tag.uid) {
                return Err(invalid("tags", format!("duplicate uid {:#06x}", tag.uid)));
            }
        }
        Ok(())
    }

    /// Builds a registry with every configured tag registered.
    pub fn build_registry(&self) -> TrackerRegistry {
        let mut registry = TrackerRegistry::new(self.endpoint.clone(), self.handoff_depth);
        registry.set_yaw_reference(self.yaw_reference);
        for tag in &self.tags {
            registry.register(tag.clone());
        }
        registry
    }
}
