//! The "FILTER" Engine - Inertial/Optical Position Fusion
//!
//! Fuses two asynchronous streams into one position estimate:
//! - Position fixes (low rate, high latency, absolute)
//! - World-frame accelerations (high rate, low latency, relative)
//!
//! Each insert runs the same pipeline:
//! 1. Ordered insertion into the history buffer
//! 2. Jump detection against the previous fix
//! 3. Velocity estimation (position window, or inertial fallback)
//! 4. Re-integration of every newer inertial sample
//! 5. Offset scheduling when the estimate moved
//!
//! Queries extrapolate the latest estimate to the render time, add the
//! active offsets and smooth the result with a one-euro filter.

use crate::smoothing::{OneEuroFilter, SmoothingConfig};
use crate::tagfuse_history::{HistoryBuffer, Sample, DEFAULT_HISTORY_CAPACITY};
use crate::tagfuse_offset::{OffsetCorrector, PositionOffset};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// What to do with the discrepancy offset when the fix causing it is a jump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpOffsetPolicy {
    /// Jumps schedule discrepancy offsets like any other fix
    #[default]
    Schedule,
    /// Jumps never schedule a discrepancy offset
    SuppressForJumps,
}

/// Configuration for the PositionFilter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Buffered samples (default: 100)
    pub history_capacity: usize,

    /// Samples of one kind closer than this are duplicates (default: 1 ms)
    pub min_sample_interval: f64,

    /// Without any sample for this long, queries hold (default: 0.5 s)
    pub max_prediction_delay: f64,

    /// Inertial samples further than this from their predecessor are stale (default: 0.1 s)
    pub max_inertial_gap: f64,

    /// Implied speed above which a fix may be a jump (default: 2.0 m/s)
    pub discard_speed: f64,

    /// Displacement above which a fix may be a jump (default: 0.15 m)
    pub discard_distance: f64,

    /// Span of the position window used for velocity (default: 0.14 s)
    pub speed_window: f64,

    /// Inertial-only tracking horizon (default: 0.30 s)
    pub acceleration_only_delay: f64,

    /// Velocity decay window at query time (default: 0.5 s)
    pub max_speed_viability: f64,

    /// Acceleration decay window at query time (default: 0.1 s)
    pub max_acceleration_viability: f64,

    /// Inertial integration runs undecayed this long after a fix (default: 0.11 s)
    pub inertial_decay_grace: f64,

    /// Estimate movement that triggers an offset (default: 0.04 m)
    pub discrepancy_threshold: f64,

    /// Duration of the offset bridging a re-acquired track (default: 0.4 s)
    pub reacquisition_duration: f64,

    pub jump_offset_policy: JumpOffsetPolicy,

    pub smoothing: SmoothingConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            min_sample_interval: 0.001,
            max_prediction_delay: 0.5,
            max_inertial_gap: 0.1,
            discard_speed: 2.0,
            discard_distance: 0.15,
            speed_window: 0.14,
            acceleration_only_delay: 0.30,
            max_speed_viability: 0.5,
            max_acceleration_viability: 0.1,
            inertial_decay_grace: 0.11,
            discrepancy_threshold: 0.04,
            reacquisition_duration: 0.4,
            jump_offset_policy: JumpOffsetPolicy::default(),
            smoothing: SmoothingConfig::default(),
        }
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of an insert. Rejections are reported, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Buffered at `index` and folded into the estimate
    Accepted { index: usize },
    /// Position fix flagged as a jump; buffered, velocity from inertial fallback
    Jump { index: usize },
    /// Dropped: within `min_sample_interval` of the newest sample of its kind
    TooClose,
    /// Dropped: older than the newest sample of its kind
    OutOfOrder,
    /// Inertial sample buffered but too far from its predecessor to integrate
    Stale { index: usize },
    /// Inertial sample buffered without a recent enough fix to integrate from
    NoRecentPosition { index: usize },
    /// Legacy Euler reading: orientation updated, nothing buffered
    OrientationOnly,
}

impl InsertOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, InsertOutcome::Accepted { .. } | InsertOutcome::Jump { .. })
    }

    pub fn is_buffered(&self) -> bool {
        !matches!(
            self,
            InsertOutcome::TooClose | InsertOutcome::OutOfOrder | InsertOutcome::OrientationOnly
        )
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, InsertOutcome::TooClose | InsertOutcome::OutOfOrder)
    }
}

/// Linear decay towards zero, `t` clamped to [0, 1].
#[inline]
fn decay(v: Vector3<f64>, t: f64) -> Vector3<f64> {
    v.lerp(&Vector3::zeros(), t.clamp(0.0, 1.0))
}

// ============================================================================
// POSITION FILTER
// ============================================================================

/// Per-endpoint fusion state.
#[derive(Debug, Clone)]
pub struct PositionFilter {
    config: FilterConfig,
    history: HistoryBuffer,
    offsets: OffsetCorrector,
    smoother: OneEuroFilter,

    /// Last calculated position, advanced on every query
    last_estimate: Vector3<f64>,
    last_estimate_timestamp: f64,
    has_estimate: bool,
}

impl PositionFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            history: HistoryBuffer::new(config.history_capacity),
            smoother: OneEuroFilter::new(config.smoothing.clone()),
            offsets: OffsetCorrector::new(),
            last_estimate: Vector3::zeros(),
            last_estimate_timestamp: 0.0,
            has_estimate: false,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FilterConfig::default())
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn active_offsets(&self) -> &[PositionOffset] {
        self.offsets.active()
    }

    /// Last calculated position, before offsets and smoothing.
    pub fn last_estimate(&self) -> Vector3<f64> {
        self.last_estimate
    }

    pub fn has_estimate(&self) -> bool {
        self.has_estimate
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.offsets.clear();
        self.smoother.reset();
        self.last_estimate = Vector3::zeros();
        self.last_estimate_timestamp = 0.0;
        self.has_estimate = false;
    }

    // ========================================================================
    // POSITION INSERT
    // ========================================================================

    /// Inserts a latency-compensated position fix.
    pub fn insert_position(&mut self, timestamp: f64, position: Vector3<f64>) -> InsertOutcome {
        if let Some(last) = self.history.latest_position_timestamp() {
            let gap = timestamp - last;
            if gap < 0.0 {
                warn!(timestamp, last, "Position older than newest buffered position, dropped");
                return InsertOutcome::OutOfOrder;
            }
            if gap < self.config.min_sample_interval {
                trace!(timestamp, last, "Position too close to previous, dropped");
                return InsertOutcome::TooClose;
            }
        }

        let index = self.history.insert(Sample::position_fix(timestamp, position));
        let previous = self
            .history
            .previous_position(index)
            .map(|(_, p)| (p.timestamp, p.position));

        // Jump detection
        let mut is_jump = false;
        match previous {
            Some((prev_ts, prev_pos)) => {
                let dt = timestamp - prev_ts;
                let distance = (position - prev_pos).norm();
                if dt > 0.0
                    && distance / dt > self.config.discard_speed
                    && distance > self.config.discard_distance
                {
                    is_jump = true;
                    if let Some(Sample::Position(p)) = self.history.get_mut(index) {
                        p.is_jump = true;
                    }
                    debug!(timestamp, speed = distance / dt, distance, "Position jump detected");
                }
            }
            None if self.has_estimate => {
                // Track re-acquired: glide from the old estimate to the new fix.
                self.offsets.schedule(PositionOffset::with_duration(
                    timestamp,
                    self.last_estimate - position,
                    self.config.reacquisition_duration,
                ));
            }
            None => {}
        }

        let velocity = if is_jump { None } else { self.window_velocity(index) };
        let velocity = velocity.unwrap_or_else(|| self.fallback_velocity(index));
        if let Some(sample) = self.history.get_mut(index) {
            sample.set_velocity(velocity);
        }

        let before = self.front_position();
        self.backpropagate(index);
        let after = self.front_position();

        let discrepancy = before - after;
        let suppressed =
            is_jump && self.config.jump_offset_policy == JumpOffsetPolicy::SuppressForJumps;
        if previous.is_some()
            && !suppressed
            && discrepancy.norm() > self.config.discrepancy_threshold
        {
            self.offsets.schedule(PositionOffset::new(timestamp, discrepancy));
        }

        self.update_estimate_from_front();

        if is_jump {
            InsertOutcome::Jump { index }
        } else {
            InsertOutcome::Accepted { index }
        }
    }

    /// Velocity from the fixes within `speed_window` of `index`, carried
    /// from the window midpoint to `index` through the inertial samples.
    fn window_velocity(&self, index: usize) -> Option<Vector3<f64>> {
        let window = self.history.positions_within(index, self.config.speed_window);
        if window.len() < 2 || window.iter().any(|p| p.is_jump) {
            return None;
        }
        let newest = window[0];
        let oldest = window[window.len() - 1];
        let span = newest.timestamp - oldest.timestamp;
        if span <= 0.0 {
            return None;
        }

        let mut velocity = (newest.position - oldest.position) / span;
        let mut t = (newest.timestamp + oldest.timestamp) / 2.0;

        let target = self.history.get(index)?.timestamp();
        let inertial = self.history.inertial_between(index, t);
        for sample in inertial.iter().rev() {
            velocity += sample.acceleration * (sample.timestamp - t);
            t = sample.timestamp;
        }
        if let Some(latest) = inertial.first() {
            velocity += latest.acceleration * (target - latest.timestamp);
        }
        Some(velocity)
    }

    /// Velocity carried over from the next older sample.
    fn fallback_velocity(&self, index: usize) -> Vector3<f64> {
        let Some(timestamp) = self.history.get(index).map(Sample::timestamp) else {
            return Vector3::zeros();
        };
        match self.history.get(index + 1) {
            Some(Sample::Inertial(prev)) => {
                prev.velocity + prev.acceleration * (timestamp - prev.timestamp)
            }
            Some(Sample::Position(prev)) => prev.velocity,
            None => Vector3::zeros(),
        }
    }

    /// Re-integrates every sample newer than `index`.
    fn backpropagate(&mut self, index: usize) {
        for i in (0..index).rev() {
            let Some(older) = self.history.get(i + 1) else {
                break;
            };
            let (older_ts, older_pos, older_vel) =
                (older.timestamp(), older.position(), older.velocity());

            let Some(sample) = self.history.get_mut(i) else {
                break;
            };
            // Fixes anchor the chain.
            let Some(a) = sample.acceleration() else {
                break;
            };
            let dt = sample.timestamp() - older_ts;
            sample.set_velocity(older_vel + a * dt);
            sample.set_position(older_pos + older_vel * dt + 0.5 * a * dt * dt);
        }
    }

    // ========================================================================
    // INERTIAL INSERT
    // ========================================================================

    /// Inserts a world-frame acceleration sample.
    pub fn insert_inertial(&mut self, timestamp: f64, acceleration: Vector3<f64>) -> InsertOutcome {
        if let Some(last) = self.history.latest_inertial_timestamp() {
            let gap = timestamp - last;
            if gap < 0.0 {
                debug!(timestamp, last, "Inertial sample older than newest buffered, dropped");
                return InsertOutcome::OutOfOrder;
            }
            if gap < self.config.min_sample_interval {
                trace!(timestamp, last, "Inertial sample too close to previous, dropped");
                return InsertOutcome::TooClose;
            }
        }

        let index = self.history.insert(Sample::inertial(timestamp, acceleration));

        // Hold the older neighbour's state until integrated.
        let Some((older_ts, older_pos, older_vel)) = self
            .history
            .get(index + 1)
            .map(|s| (s.timestamp(), s.position(), s.velocity()))
        else {
            return InsertOutcome::NoRecentPosition { index };
        };
        if let Some(sample) = self.history.get_mut(index) {
            sample.set_position(older_pos);
            sample.set_velocity(older_vel);
        }

        let gap = timestamp - older_ts;
        if gap > self.config.max_inertial_gap {
            debug!(timestamp, gap, "Stale inertial sample, not integrated");
            return InsertOutcome::Stale { index };
        }

        let since_position = match self.history.latest_position_timestamp() {
            Some(last) if timestamp - last <= self.config.acceleration_only_delay => timestamp - last,
            _ => {
                trace!(timestamp, "No recent position fix, inertial sample not integrated");
                return InsertOutcome::NoRecentPosition { index };
            }
        };

        let mut velocity = older_vel + acceleration * gap;
        let mut step = older_vel * gap + 0.5 * acceleration * gap * gap;
        if since_position >= self.config.inertial_decay_grace {
            let t = since_position / self.config.acceleration_only_delay;
            velocity = decay(velocity, t);
            step = decay(step, t);
        }
        if let Some(sample) = self.history.get_mut(index) {
            sample.set_velocity(velocity);
            sample.set_position(older_pos + step);
        }

        self.update_estimate_from_front();
        InsertOutcome::Accepted { index }
    }

    fn front_position(&self) -> Vector3<f64> {
        self.history
            .front()
            .map(Sample::position)
            .unwrap_or(self.last_estimate)
    }

    fn update_estimate_from_front(&mut self) {
        if let Some(front) = self.history.front() {
            self.last_estimate = front.position();
            self.last_estimate_timestamp = front.timestamp();
            self.has_estimate = true;
        }
    }

    // ========================================================================
    // PREDICTION
    // ========================================================================

    /// Position at `now`. Never fails: degrades to the last estimate when
    /// there is nothing to extrapolate from.
    pub fn predict(&mut self, now: f64) -> Vector3<f64> {
        let Some(position_index) = self.history.latest_position_index() else {
            return self.last_estimate;
        };
        let Some(front) = self.history.front() else {
            return self.last_estimate;
        };
        if now - front.timestamp() > self.config.max_prediction_delay {
            return self.last_estimate;
        }
        let front_velocity = front.velocity();

        let since_position = self
            .history
            .get(position_index)
            .map_or(self.config.max_speed_viability, |s| now - s.timestamp());
        let (acceleration, since_acceleration) = match self
            .history
            .latest_inertial_index()
            .and_then(|i| self.history.get(i))
        {
            Some(s) => (
                s.acceleration().unwrap_or_else(Vector3::zeros),
                now - s.timestamp(),
            ),
            None => (Vector3::zeros(), self.config.max_acceleration_viability),
        };

        let offset = self.offsets.sample(now);

        let dt = (now - self.last_estimate_timestamp).max(0.0);
        let velocity = decay(front_velocity, since_position / self.config.max_speed_viability);
        let acceleration = decay(
            acceleration,
            since_acceleration / self.config.max_acceleration_viability,
        );
        let advanced = self.last_estimate + velocity * dt + 0.5 * acceleration * dt * dt;
        let hold = (since_position / self.config.acceleration_only_delay).clamp(0.0, 1.0);
        self.last_estimate = advanced.lerp(&self.last_estimate, hold);
        self.last_estimate_timestamp = self.last_estimate_timestamp.max(now);

        self.smoother.filter(self.last_estimate + offset, now)
    }
}

impl Default for PositionFilter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn x(v: f64) -> Vector3<f64> {
        Vector3::new(v, 0.0, 0.0)
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_inertial(1.000, Vector3::zeros());
        filter.insert_inertial(1.012, Vector3::zeros());
        filter.insert_position(1.02, Vector3::zeros());
        filter.insert_inertial(1.02, Vector3::zeros());
        filter.insert_position(1.05, Vector3::zeros());
        let outcome = filter.insert_position(1.08, Vector3::zeros());
        assert_eq!(outcome, InsertOutcome::Accepted { index: 0 });

        assert!(filter
            .history()
            .iter()
            .filter_map(Sample::as_position)
            .all(|p| !p.is_jump));
        let front = filter.history().front().unwrap();
        assert_relative_eq!(front.velocity(), Vector3::zeros(), epsilon = 1e-9);

        let position = filter.predict(1.10);
        assert!(position.norm() < 0.01);
    }

    #[test]
    fn test_inertial_without_position_is_buffered_only() {
        let mut filter = PositionFilter::with_defaults();
        assert_eq!(
            filter.insert_inertial(1.0, x(1.0)),
            InsertOutcome::NoRecentPosition { index: 0 }
        );
        assert_eq!(
            filter.insert_inertial(1.01, x(1.0)),
            InsertOutcome::NoRecentPosition { index: 0 }
        );
        assert_eq!(filter.history().len(), 2);
        assert!(!filter.has_estimate());
        assert_eq!(filter.predict(1.02), Vector3::zeros());
    }

    #[test]
    fn test_first_position_sets_estimate() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(2.0, Vector3::new(1.0, 2.0, 3.0));
        assert!(filter.has_estimate());
        assert_eq!(filter.last_estimate(), Vector3::new(1.0, 2.0, 3.0));
        assert!(filter.active_offsets().is_empty());
    }

    #[test]
    fn test_duplicate_and_out_of_order_positions_dropped() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.0, Vector3::zeros());
        assert_eq!(filter.insert_position(1.0005, x(0.01)), InsertOutcome::TooClose);
        assert_eq!(filter.insert_position(0.9, x(0.01)), InsertOutcome::OutOfOrder);
        assert_eq!(filter.history().len(), 1);
    }

    #[test]
    fn test_duplicate_and_out_of_order_inertial_dropped() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.0, Vector3::zeros());
        filter.insert_inertial(1.01, Vector3::zeros());
        assert_eq!(filter.insert_inertial(1.0105, Vector3::zeros()), InsertOutcome::TooClose);
        assert_eq!(filter.insert_inertial(1.005, Vector3::zeros()), InsertOutcome::OutOfOrder);
        assert_eq!(filter.history().len(), 2);
    }

    #[test]
    fn test_jump_suppression() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.00, x(0.0));
        filter.insert_position(1.03, x(0.01));
        let before_velocity = filter.history().front().unwrap().velocity();

        let outcome = filter.insert_position(1.06, x(0.5));
        assert_eq!(outcome, InsertOutcome::Jump { index: 0 });

        let front = filter.history().front().unwrap();
        assert!(front.as_position().unwrap().is_jump);
        // Fallback path reuses the previous fix's velocity.
        assert_relative_eq!(front.velocity(), before_velocity, epsilon = 1e-12);
        assert!(front.velocity().norm() < 1.0);

        // The next fix sees a jump inside its window and falls back as well.
        filter.insert_position(1.09, x(0.5));
        let front = filter.history().front().unwrap();
        assert!(!front.as_position().unwrap().is_jump);
        assert_relative_eq!(front.velocity(), before_velocity, epsilon = 1e-12);
    }

    #[test]
    fn test_window_velocity() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.00, x(0.00));
        filter.insert_position(1.03, x(0.03));
        filter.insert_position(1.06, x(0.06));
        let front = filter.history().front().unwrap();
        assert_relative_eq!(front.velocity(), x(1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_late_fix_reintegrates_newer_samples() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.00, Vector3::zeros());
        for t in [1.01, 1.02, 1.03] {
            filter.insert_inertial(t, Vector3::zeros());
        }
        assert_relative_eq!(filter.last_estimate(), Vector3::zeros());

        let outcome = filter.insert_position(1.015, x(0.1));
        assert_eq!(outcome, InsertOutcome::Accepted { index: 2 });

        let speed = 0.1 / 0.015;
        let front = filter.history().front().unwrap();
        assert_relative_eq!(front.velocity(), x(speed), epsilon = 1e-9);
        assert_relative_eq!(filter.last_estimate(), x(0.1 + speed * 0.015), epsilon = 1e-9);

        // The estimate moved by 0.2 m, so an offset hides the correction.
        let offsets = filter.active_offsets();
        assert_eq!(offsets.len(), 1);
        assert_relative_eq!(offsets[0].offset, x(-0.2), epsilon = 1e-9);
        assert_relative_eq!(offsets[0].duration, 0.3, epsilon = 1e-9);
    }

    fn late_jump(policy: JumpOffsetPolicy) -> PositionFilter {
        let mut filter = PositionFilter::new(FilterConfig {
            jump_offset_policy: policy,
            ..FilterConfig::default()
        });
        filter.insert_position(1.00, Vector3::zeros());
        for t in [1.01, 1.02, 1.03] {
            filter.insert_inertial(t, Vector3::zeros());
        }
        let outcome = filter.insert_position(1.015, x(0.5));
        assert_eq!(outcome, InsertOutcome::Jump { index: 2 });
        filter
    }

    #[test]
    fn test_jump_offset_policy() {
        let scheduled = late_jump(JumpOffsetPolicy::Schedule);
        assert_eq!(scheduled.active_offsets().len(), 1);
        assert_relative_eq!(scheduled.active_offsets()[0].offset, x(-0.5), epsilon = 1e-9);

        let suppressed = late_jump(JumpOffsetPolicy::SuppressForJumps);
        assert!(suppressed.active_offsets().is_empty());
        assert_relative_eq!(suppressed.last_estimate(), x(0.5), epsilon = 1e-9);
    }

    #[test]
    fn test_reacquisition_schedules_bridge() {
        let mut filter = PositionFilter::new(FilterConfig {
            history_capacity: 3,
            ..FilterConfig::default()
        });
        filter.insert_position(1.00, x(1.0));
        // Inertial samples push the fix out of the small buffer.
        filter.insert_inertial(1.01, Vector3::zeros());
        filter.insert_inertial(1.02, Vector3::zeros());
        filter.insert_inertial(1.03, Vector3::zeros());
        assert!(filter.history().latest_position_index().is_none());

        filter.insert_position(1.04, x(1.3));
        let offsets = filter.active_offsets();
        assert_eq!(offsets.len(), 1);
        assert_relative_eq!(offsets[0].offset, x(-0.3), epsilon = 1e-9);
        assert_relative_eq!(offsets[0].duration, 0.4);
    }

    #[test]
    fn test_stale_inertial_kept_but_not_integrated() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.0, x(0.2));
        let outcome = filter.insert_inertial(1.2, x(5.0));
        assert_eq!(outcome, InsertOutcome::Stale { index: 0 });
        assert_eq!(filter.history().len(), 2);
        assert_relative_eq!(filter.last_estimate(), x(0.2));
    }

    #[test]
    fn test_inertial_needs_recent_position() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.0, Vector3::zeros());
        let mut last = InsertOutcome::TooClose;
        for i in 1..=7 {
            last = filter.insert_inertial(1.0 + i as f64 * 0.05, Vector3::zeros());
        }
        assert_eq!(last, InsertOutcome::NoRecentPosition { index: 0 });
    }

    #[test]
    fn test_inertial_coasting_decays_velocity() {
        let mut filter = PositionFilter::with_defaults();
        for i in 0..5 {
            let t = 0.94 + i as f64 * 0.02;
            filter.insert_position(t, x(t - 0.94));
        }
        assert_relative_eq!(filter.history().front().unwrap().velocity(), x(1.0), epsilon = 1e-9);

        for i in 1..=14 {
            filter.insert_inertial(1.02 + i as f64 * 0.02, Vector3::zeros());
        }
        let front = filter.history().front().unwrap();
        assert!(front.velocity().norm() < 0.1);
        assert!(front.position().x < 0.08 + 0.28);
    }

    #[test]
    fn test_staleness_hold() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.00, x(0.00));
        filter.insert_position(1.03, x(0.03));
        filter.insert_position(1.06, x(0.06));

        filter.predict(1.2);
        let held = filter.last_estimate();
        let first = filter.predict(1.7);
        let second = filter.predict(2.5);
        assert_eq!(first, held);
        assert_eq!(second, held);
    }

    #[test]
    fn test_prediction_extrapolates_velocity() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.00, x(0.00));
        filter.insert_position(1.03, x(0.03));
        filter.insert_position(1.06, x(0.06));

        filter.predict(1.06);
        filter.predict(1.07);
        assert!(filter.last_estimate().x > 0.06);
        assert!(filter.last_estimate().x < 0.07);
    }

    #[test]
    fn test_offset_contributes_to_prediction() {
        let mut filter = PositionFilter::with_defaults();
        filter.insert_position(1.00, Vector3::zeros());
        for t in [1.01, 1.02, 1.03] {
            filter.insert_inertial(t, Vector3::zeros());
        }
        filter.insert_position(1.015, x(0.1));
        let estimate = filter.last_estimate();

        // First query passes the smoother unchanged: estimate plus full offset.
        let out = filter.predict(1.03);
        assert_relative_eq!(out, filter.last_estimate() + x(-0.2) * (1.0 - 0.015 / 0.3), epsilon = 1e-6);
        assert!(out.x < estimate.x);

        filter.predict(1.4);
        assert!(filter.active_offsets().is_empty());
    }

    proptest! {
        #[test]
        fn prop_inertial_kinematics_round_trip(
            ax in -5.0f64..5.0, ay in -5.0f64..5.0, az in -5.0f64..5.0,
            vx in -1.0f64..1.0, vy in -1.0f64..1.0, vz in -1.0f64..1.0,
        ) {
            let a = Vector3::new(ax, ay, az);
            let v0 = Vector3::new(vx, vy, vz);
            let origin = Vector3::new(0.5, 1.0, -0.3);

            let mut filter = PositionFilter::with_defaults();
            for t in [0.90, 0.93, 0.96] {
                filter.insert_position(t, origin + v0 * (t - 0.90));
            }
            let p0 = origin + v0 * (0.96 - 0.90);
            let t0 = 0.96;

            for k in 1..=10 {
                let t = t0 + k as f64 * 0.01;
                let outcome = filter.insert_inertial(t, a);
                prop_assert_eq!(outcome, InsertOutcome::Accepted { index: 0 });

                let dt = t - t0;
                let expected = p0 + v0 * dt + 0.5 * a * dt * dt;
                let front = filter.history().front().unwrap().position();
                prop_assert!((front - expected).norm() < 1e-9);
            }
        }
    }
}
