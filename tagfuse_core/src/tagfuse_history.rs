//! The "HISTORY" Engine - Time-Ordered Measurement Buffer
//!
//! Position fixes and inertial samples arrive on different paths with
//! different latencies, so they are merged into one bounded buffer kept
//! sorted newest-first. Re-integration walks this buffer, which is why the
//! settle index of every insert is reported back to the caller.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of buffered samples per endpoint.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

// ============================================================================
// SAMPLES
// ============================================================================

/// An absolute position fix from the optical/RF tracking system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,

    /// Set when the fix was judged physically implausible
    pub is_jump: bool,
}

/// A world-frame acceleration reading from the IMU.
///
/// `position` and `velocity` are derived by integration, not measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InertialSample {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
}

/// One buffered measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    Position(PositionSample),
    Inertial(InertialSample),
}

impl Sample {
    pub fn position_fix(timestamp: f64, position: Vector3<f64>) -> Self {
        Sample::Position(PositionSample {
            timestamp,
            position,
            velocity: Vector3::zeros(),
            is_jump: false,
        })
    }

    pub fn inertial(timestamp: f64, acceleration: Vector3<f64>) -> Self {
        Sample::Inertial(InertialSample {
            timestamp,
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            acceleration,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> f64 {
        match self {
            Sample::Position(p) => p.timestamp,
            Sample::Inertial(i) => i.timestamp,
        }
    }

    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        match self {
            Sample::Position(p) => p.position,
            Sample::Inertial(i) => i.position,
        }
    }

    #[inline]
    pub fn velocity(&self) -> Vector3<f64> {
        match self {
            Sample::Position(p) => p.velocity,
            Sample::Inertial(i) => i.velocity,
        }
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        match self {
            Sample::Position(p) => p.position = position,
            Sample::Inertial(i) => i.position = position,
        }
    }

    pub fn set_velocity(&mut self, velocity: Vector3<f64>) {
        match self {
            Sample::Position(p) => p.velocity = velocity,
            Sample::Inertial(i) => i.velocity = velocity,
        }
    }

    /// Acceleration carried by an inertial sample; `None` for position fixes.
    #[inline]
    pub fn acceleration(&self) -> Option<Vector3<f64>> {
        match self {
            Sample::Position(_) => None,
            Sample::Inertial(i) => Some(i.acceleration),
        }
    }

    pub fn is_position(&self) -> bool {
        matches!(self, Sample::Position(_))
    }

    pub fn is_inertial(&self) -> bool {
        matches!(self, Sample::Inertial(_))
    }

    pub fn as_position(&self) -> Option<&PositionSample> {
        match self {
            Sample::Position(p) => Some(p),
            Sample::Inertial(_) => None,
        }
    }
}

// ============================================================================
// BUFFER
// ============================================================================

/// Fixed-capacity buffer ordered newest-first by timestamp.
///
/// Invariant: `get(i).timestamp() >= get(i + 1).timestamp()` for all `i`.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }

    /// Inserts a sample and returns the index it settled at.
    ///
    /// The sample is pushed at the front and swapped towards the back while
    /// its older neighbour is newer than it. Equal timestamps keep the new
    /// sample in front. When full, the oldest sample is evicted first.
    pub fn insert(&mut self, sample: Sample) -> usize {
        if self.samples.len() == self.capacity {
            self.samples.pop_back();
        }
        self.samples.push_front(sample);

        let mut index = 0;
        while index + 1 < self.samples.len()
            && self.samples[index].timestamp() < self.samples[index + 1].timestamp()
        {
            self.samples.swap(index, index + 1);
            index += 1;
        }
        index
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest sample.
    pub fn front(&self) -> Option<&Sample> {
        self.samples.front()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Sample> {
        self.samples.get_mut(index)
    }

    /// Iterates newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Index of the newest position fix.
    pub fn latest_position_index(&self) -> Option<usize> {
        self.samples.iter().position(Sample::is_position)
    }

    /// Index of the newest inertial sample.
    pub fn latest_inertial_index(&self) -> Option<usize> {
        self.samples.iter().position(Sample::is_inertial)
    }

    pub fn latest_position_timestamp(&self) -> Option<f64> {
        self.latest_position_index().map(|i| self.samples[i].timestamp())
    }

    pub fn latest_inertial_timestamp(&self) -> Option<f64> {
        self.latest_inertial_index().map(|i| self.samples[i].timestamp())
    }

    /// Nearest position fix strictly older (further back) than `index`.
    pub fn previous_position(&self, index: usize) -> Option<(usize, &PositionSample)> {
        self.samples
            .iter()
            .enumerate()
            .skip(index + 1)
            .find_map(|(i, s)| s.as_position().map(|p| (i, p)))
    }

    /// Position fixes from `index` (included) backwards whose timestamp is
    /// within `window` seconds of the sample at `index`. Newest first.
    pub fn positions_within(&self, index: usize, window: f64) -> Vec<&PositionSample> {
        let Some(start) = self.samples.get(index).map(Sample::timestamp) else {
            return Vec::new();
        };
        self.samples
            .iter()
            .skip(index)
            .take_while(|s| start - s.timestamp() < window)
            .filter_map(Sample::as_position)
            .collect()
    }

    /// Inertial samples older than `index` (excluded) and strictly newer
    /// than `since`. Newest first.
    pub fn inertial_between(&self, index: usize, since: f64) -> Vec<&InertialSample> {
        self.samples
            .iter()
            .skip(index + 1)
            .take_while(|s| s.timestamp() > since)
            .filter_map(|s| match s {
                Sample::Inertial(i) => Some(i),
                Sample::Position(_) => None,
            })
            .collect()
    }

    /// Whether the ordering invariant holds. Used by tests.
    pub fn is_sorted(&self) -> bool {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .all(|(newer, older)| newer.timestamp() >= older.timestamp())
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn timestamps(buffer: &HistoryBuffer) -> Vec<f64> {
        buffer.iter().map(Sample::timestamp).collect()
    }

    #[test]
    fn test_in_order_inserts_land_at_front() {
        let mut buffer = HistoryBuffer::new(10);
        assert_eq!(buffer.insert(Sample::inertial(1.0, Vector3::zeros())), 0);
        assert_eq!(buffer.insert(Sample::inertial(2.0, Vector3::zeros())), 0);
        assert_eq!(timestamps(&buffer), vec![2.0, 1.0]);
    }

    #[test]
    fn test_late_insert_reports_settle_index() {
        let mut buffer = HistoryBuffer::new(10);
        buffer.insert(Sample::inertial(1.0, Vector3::zeros()));
        buffer.insert(Sample::inertial(2.0, Vector3::zeros()));
        buffer.insert(Sample::inertial(3.0, Vector3::zeros()));

        let index = buffer.insert(Sample::position_fix(1.5, Vector3::zeros()));
        assert_eq!(index, 2);
        assert_eq!(timestamps(&buffer), vec![3.0, 2.0, 1.5, 1.0]);

        // Oldest of all settles at the very back.
        let index = buffer.insert(Sample::position_fix(0.5, Vector3::zeros()));
        assert_eq!(index, 4);
    }

    #[test]
    fn test_equal_timestamp_stays_in_front() {
        let mut buffer = HistoryBuffer::new(10);
        buffer.insert(Sample::inertial(1.0, Vector3::zeros()));
        let index = buffer.insert(Sample::position_fix(1.0, Vector3::zeros()));
        assert_eq!(index, 0);
        assert!(buffer.front().unwrap().is_position());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buffer = HistoryBuffer::new(3);
        for t in 1..=4 {
            buffer.insert(Sample::inertial(t as f64, Vector3::zeros()));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(timestamps(&buffer), vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_kind_queries() {
        let mut buffer = HistoryBuffer::new(10);
        buffer.insert(Sample::position_fix(1.0, Vector3::new(1.0, 0.0, 0.0)));
        buffer.insert(Sample::inertial(1.1, Vector3::zeros()));
        buffer.insert(Sample::position_fix(1.2, Vector3::new(2.0, 0.0, 0.0)));
        buffer.insert(Sample::inertial(1.3, Vector3::zeros()));

        assert_eq!(buffer.latest_position_index(), Some(1));
        assert_eq!(buffer.latest_inertial_index(), Some(0));
        assert_eq!(buffer.latest_position_timestamp(), Some(1.2));

        let (index, previous) = buffer.previous_position(1).unwrap();
        assert_eq!(index, 3);
        assert_eq!(previous.position.x, 1.0);
        assert!(buffer.previous_position(3).is_none());
    }

    #[test]
    fn test_positions_within_window() {
        let mut buffer = HistoryBuffer::new(10);
        for (i, t) in [1.00, 1.05, 1.10, 1.20].iter().enumerate() {
            buffer.insert(Sample::position_fix(*t, Vector3::new(i as f64, 0.0, 0.0)));
        }
        let window: Vec<f64> = buffer
            .positions_within(0, 0.14)
            .iter()
            .map(|p| p.timestamp)
            .collect();
        assert_eq!(window, vec![1.20, 1.10]);
    }

    #[test]
    fn test_inertial_between() {
        let mut buffer = HistoryBuffer::new(10);
        buffer.insert(Sample::inertial(1.00, Vector3::zeros()));
        buffer.insert(Sample::inertial(1.02, Vector3::zeros()));
        buffer.insert(Sample::position_fix(1.03, Vector3::zeros()));
        buffer.insert(Sample::inertial(1.04, Vector3::zeros()));
        buffer.insert(Sample::position_fix(1.05, Vector3::zeros()));

        let between: Vec<f64> = buffer
            .inertial_between(0, 1.01)
            .iter()
            .map(|i| i.timestamp)
            .collect();
        assert_eq!(between, vec![1.04, 1.02]);
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_stays_sorted(
            arrivals in prop::collection::vec((0.0f64..10.0, any::<bool>()), 1..250),
            capacity in 1usize..120,
        ) {
            let mut buffer = HistoryBuffer::new(capacity);
            for (t, is_position) in arrivals {
                let sample = if is_position {
                    Sample::position_fix(t, Vector3::zeros())
                } else {
                    Sample::inertial(t, Vector3::zeros())
                };
                let index = buffer.insert(sample);
                prop_assert!(buffer.is_sorted());
                prop_assert!(index < buffer.len());
                prop_assert!(buffer.len() <= capacity);
            }
        }
    }
}
