//! One-euro low-pass filter for the final position output.
//!
//! Cutoff frequency rises with the filtered speed of the signal: slow motion
//! is smoothed heavily, fast motion passes with little lag.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Initial sample rate estimate in Hz, replaced by observed timestamps
    pub frequency: f64,
    pub min_cutoff: f64,
    /// Speed coefficient
    pub beta: f64,
    pub derivative_cutoff: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            frequency: 90.0,
            min_cutoff: 0.7,
            beta: 25.0,
            derivative_cutoff: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LowPass {
    previous: Option<Vector3<f64>>,
}

impl LowPass {
    fn filter(&mut self, value: Vector3<f64>, alpha: f64) -> Vector3<f64> {
        let out = match self.previous {
            Some(prev) => prev + (value - prev) * alpha,
            None => value,
        };
        self.previous = Some(out);
        out
    }
}

/// One-euro filter over a 3D signal, each axis handled independently.
#[derive(Debug, Clone)]
pub struct OneEuroFilter {
    config: SmoothingConfig,
    frequency: f64,
    last_timestamp: Option<f64>,
    value: LowPass,
    derivative: LowPass,
}

impl OneEuroFilter {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            frequency: config.frequency,
            config,
            last_timestamp: None,
            value: LowPass::default(),
            derivative: LowPass::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SmoothingConfig::default())
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    fn alpha(&self, cutoff: f64) -> f64 {
        let te = 1.0 / self.frequency;
        let tau = 1.0 / (2.0 * PI * cutoff);
        1.0 / (1.0 + tau / te)
    }

    /// Filters `value` observed at `timestamp` (seconds).
    ///
    /// The first sample passes through. Repeated or backwards timestamps
    /// keep the previous frequency estimate.
    pub fn filter(&mut self, value: Vector3<f64>, timestamp: f64) -> Vector3<f64> {
        if let Some(last) = self.last_timestamp {
            let dt = timestamp - last;
            if dt > 0.0 {
                self.frequency = 1.0 / dt;
            }
        }
        self.last_timestamp = Some(timestamp);

        let slope = match self.value.previous {
            Some(prev) => (value - prev) * self.frequency,
            None => Vector3::zeros(),
        };
        let slope = self
            .derivative
            .filter(slope, self.alpha(self.config.derivative_cutoff));

        let alphas = slope.map(|d| self.alpha(self.config.min_cutoff + self.config.beta * d.abs()));
        let out = match self.value.previous {
            Some(prev) => prev + (value - prev).component_mul(&alphas),
            None => value,
        };
        self.value.previous = Some(out);
        out
    }

    pub fn reset(&mut self) {
        self.frequency = self.config.frequency;
        self.last_timestamp = None;
        self.value = LowPass::default();
        self.derivative = LowPass::default();
    }
}

impl Default for OneEuroFilter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
