//! Decaying position corrections.
//!
//! When re-integration moves the estimate, the jump is not shown directly.
//! Instead the difference is injected as an offset that fades to zero, so
//! the rendered position glides onto the corrected track.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Seconds of correction per metre of offset.
pub const DURATION_PER_METRE: f64 = 1.5;

/// A spatial correction injected at `start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOffset {
    pub start_time: f64,
    pub offset: Vector3<f64>,
    pub duration: f64,
}

impl PositionOffset {
    /// Offset whose duration scales with its magnitude.
    pub fn new(start_time: f64, offset: Vector3<f64>) -> Self {
        Self::with_duration(start_time, offset, DURATION_PER_METRE * offset.norm())
    }

    pub fn with_duration(start_time: f64, offset: Vector3<f64>, duration: f64) -> Self {
        Self {
            start_time,
            offset,
            duration: duration.max(0.0),
        }
    }

    /// Contribution at `now`: the full offset at `start_time`, zero from
    /// `start_time + duration` on, linear in between.
    pub fn contribution(&self, now: f64) -> Vector3<f64> {
        if self.duration <= 0.0 {
            return if now < self.start_time {
                self.offset
            } else {
                Vector3::zeros()
            };
        }
        let t = ((now - self.start_time) / self.duration).clamp(0.0, 1.0);
        self.offset.lerp(&Vector3::zeros(), t)
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now - self.start_time > self.duration
    }
}

/// The set of active offsets of one endpoint.
#[derive(Debug, Clone, Default)]
pub struct OffsetCorrector {
    active: Vec<PositionOffset>,
}

impl OffsetCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, offset: PositionOffset) {
        tracing::debug!(
            start = offset.start_time,
            magnitude = offset.offset.norm(),
            duration = offset.duration,
            "Scheduled position offset"
        );
        self.active.push(offset);
    }

    /// Sums all contributions at `now` and drops the expired offsets.
    pub fn sample(&mut self, now: f64) -> Vector3<f64> {
        let total = self
            .active
            .iter()
            .fold(Vector3::zeros(), |acc, o| acc + o.contribution(now));
        self.active.retain(|o| !o.is_expired(now));
        total
    }

    pub fn active(&self) -> &[PositionOffset] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
