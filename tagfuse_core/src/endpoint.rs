//! Tracked endpoints: one sensor channel of one tag.
//!
//! An endpoint owns the full per-channel state (clock sync, orientation
//! pipeline, position filter) and turns decoded measurements into filter
//! inserts on the local time axis.

use crate::tagfuse_clock::{ClockConfig, ClockSync};
use crate::tagfuse_filter::{FilterConfig, InsertOutcome, PositionFilter};
use crate::tagfuse_orientation::{DeviceVersion, OrientationPipeline, RawOrientation};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Two-byte tag identifier as sent by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagUid(pub u16);

impl TagUid {
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        TagUid(u16::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [hi, lo] = self.to_bytes();
        write!(f, "{:02x}:{:02x}", hi, lo)
    }
}

/// A sensor channel on a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    pub tag: TagUid,
    pub channel: u8,
}

impl EndpointId {
    pub fn new(tag: TagUid, channel: u8) -> Self {
        Self { tag, channel }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tag, self.channel)
    }
}

// ============================================================================
// MEASUREMENTS
// ============================================================================

/// A decoded measurement, still in device units and frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Measurement {
    Position {
        /// Gateway timestamp in device ticks
        device_ticks: Option<u16>,
        position: Vector3<f64>,
    },
    Inertial {
        /// Tag timestamp in device ticks; `None` for untimestamped firmware
        device_ticks: Option<u16>,
        orientation: RawOrientation,
        /// Local-frame acceleration (m/s²), not yet remapped
        acceleration: Vector3<f64>,
    },
}

/// A measurement stamped with its local arrival time (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedMeasurement {
    pub arrival: f64,
    pub measurement: Measurement,
}

impl TimedMeasurement {
    pub fn new(arrival: f64, measurement: Measurement) -> Self {
        Self {
            arrival,
            measurement,
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Which clock places position fixes on the local axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionTimeSource {
    /// Arrival time minus `position_latency`
    #[default]
    Arrival,
    /// Gateway timestamp through its own clock sync, minus `position_latency`
    Device,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub filter: FilterConfig,
    pub clock: ClockConfig,

    /// Optical pipeline delay relative to the IMU path (default: 0.065 s)
    pub position_latency: f64,

    pub position_time_source: PositionTimeSource,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            clock: ClockConfig::default(),
            position_latency: 0.065,
            position_time_source: PositionTimeSource::default(),
        }
    }
}

/// Ingestion counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub positions: u64,
    pub inertials: u64,
    pub jumps: u64,
    /// Too close or out of order
    pub dropped: u64,
    pub stale: u64,
    /// Buffered without a recent fix
    pub unanchored: u64,
    /// Legacy Euler readings, orientation only
    pub orientation_only: u64,
}

impl EndpointStats {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Accepted { .. } => {}
            InsertOutcome::Jump { .. } => self.jumps += 1,
            InsertOutcome::TooClose | InsertOutcome::OutOfOrder => self.dropped += 1,
            InsertOutcome::Stale { .. } => self.stale += 1,
            InsertOutcome::NoRecentPosition { .. } => self.unanchored += 1,
            InsertOutcome::OrientationOnly => self.orientation_only += 1,
        }
    }
}

// ============================================================================
// TRACKED ENDPOINT
// ============================================================================

#[derive(Debug, Clone)]
pub struct TrackedEndpoint {
    id: EndpointId,
    version: DeviceVersion,
    secondary: bool,
    yaw_reference: f64,
    position_latency: f64,
    position_time_source: PositionTimeSource,

    filter: PositionFilter,
    imu_clock: ClockSync,
    position_clock: ClockSync,
    orientation: OrientationPipeline,

    /// Output of the last query, reused when queried again at the same time
    /// until new data is buffered
    last_query: Option<(f64, Vector3<f64>)>,
    stats: EndpointStats,
}

impl TrackedEndpoint {
    pub fn new(id: EndpointId, version: DeviceVersion, config: &EndpointConfig) -> Self {
        Self {
            id,
            version,
            secondary: false,
            yaw_reference: 0.0,
            position_latency: config.position_latency,
            position_time_source: config.position_time_source,
            filter: PositionFilter::new(config.filter.clone()),
            imu_clock: ClockSync::new(config.clock.clone()),
            position_clock: ClockSync::new(config.clock.clone()),
            orientation: OrientationPipeline::new(),
            last_query: None,
            stats: EndpointStats::default(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn version(&self) -> DeviceVersion {
        self.version
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    pub fn set_secondary(&mut self, secondary: bool) {
        self.secondary = secondary;
    }

    /// Room calibration heading in degrees.
    pub fn set_yaw_reference(&mut self, degrees: f64) {
        self.yaw_reference = degrees;
    }

    pub fn filter(&self) -> &PositionFilter {
        &self.filter
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Feeds one measurement into the endpoint.
    pub fn ingest(&mut self, timed: TimedMeasurement) -> InsertOutcome {
        let TimedMeasurement {
            arrival,
            measurement,
        } = timed;

        let outcome = match measurement {
            Measurement::Position {
                device_ticks,
                position,
            } => {
                self.stats.positions += 1;
                let base = match (self.position_time_source, device_ticks) {
                    (PositionTimeSource::Device, Some(ticks)) => {
                        self.position_clock.correct_ticks(ticks, arrival)
                    }
                    _ => arrival,
                };
                self.filter
                    .insert_position(base - self.position_latency, position)
            }
            Measurement::Inertial {
                device_ticks,
                orientation,
                acceleration,
            } => {
                self.stats.inertials += 1;
                let timestamp = match device_ticks {
                    Some(ticks) => self.imu_clock.correct_ticks(ticks, arrival),
                    None => arrival,
                };
                let legacy = matches!(orientation, RawOrientation::Euler(_));
                let update = self.orientation.update(
                    orientation,
                    acceleration,
                    self.version,
                    self.yaw_reference,
                    self.secondary,
                );
                // Legacy firmware acceleration is not in the frame the filter expects.
                if legacy {
                    InsertOutcome::OrientationOnly
                } else {
                    self.filter
                        .insert_inertial(timestamp, update.world_acceleration)
                }
            }
        };

        self.stats.record(outcome);
        if outcome.is_buffered() {
            self.last_query = None;
        } else if outcome.is_rejected() {
            tracing::trace!(endpoint = %self.id, ?outcome, "Measurement dropped");
        }
        outcome
    }

    /// Smoothed position at `now` (local seconds).
    pub fn position(&mut self, now: f64) -> Vector3<f64> {
        if let Some((at, value)) = self.last_query {
            if at == now {
                return value;
            }
        }
        let value = self.filter.predict(now);
        self.last_query = Some((now, value));
        value
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation.orientation()
    }

    pub fn capture_yaw_zero(&mut self) {
        self.orientation.capture_yaw_zero();
        tracing::info!(endpoint = %self.id, yaw_zero = ?self.orientation.yaw_zero(), "Captured yaw zero");
    }

    pub fn has_estimate(&self) -> bool {
        self.filter.has_estimate()
    }

    /// IMU clock offset (local minus device), for diagnostics.
    pub fn clock_offset(&self) -> f64 {
        self.imu_clock.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn endpoint(version: DeviceVersion) -> TrackedEndpoint {
        TrackedEndpoint::new(
            EndpointId::new(TagUid(0xab12), 0),
            version,
            &EndpointConfig::default(),
        )
    }

    fn position(arrival: f64, p: Vector3<f64>) -> TimedMeasurement {
        TimedMeasurement::new(
            arrival,
            Measurement::Position {
                device_ticks: None,
                position: p,
            },
        )
    }

    fn level_imu(arrival: f64, ticks: Option<u16>, acceleration: Vector3<f64>) -> TimedMeasurement {
        TimedMeasurement::new(
            arrival,
            Measurement::Inertial {
                device_ticks: ticks,
                orientation: RawOrientation::Quaternion {
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    w: 1.0,
                },
                acceleration,
            },
        )
    }

    #[test]
    fn test_display() {
        let id = EndpointId::new(TagUid(0xab12), 3);
        assert_eq!(id.to_string(), "ab:12/3");
        assert_eq!(TagUid::from_bytes([0xab, 0x12]), TagUid(0xab12));
    }

    #[test]
    fn test_position_latency_compensation() {
        let mut ep = endpoint(DeviceVersion::V3);
        ep.ingest(position(2.0, Vector3::new(1.0, 1.5, 0.0)));
        let front = ep.filter().history().front().unwrap();
        assert_relative_eq!(front.timestamp(), 2.0 - 0.065, epsilon = 1e-12);
        assert_eq!(ep.stats().positions, 1);
    }

    #[test]
    fn test_untimestamped_imu_uses_arrival() {
        let mut ep = endpoint(DeviceVersion::V2);
        ep.ingest(position(1.065, Vector3::zeros()));
        let outcome = ep.ingest(level_imu(1.01, None, Vector3::zeros()));
        assert_eq!(outcome, InsertOutcome::Accepted { index: 0 });
        let front = ep.filter().history().front().unwrap();
        assert_relative_eq!(front.timestamp(), 1.01, epsilon = 1e-12);
    }

    #[test]
    fn test_timestamped_imu_goes_through_clock_sync() {
        let mut ep = endpoint(DeviceVersion::V2);
        // Device clock runs 3 s behind local time.
        ep.ingest(level_imu(3.5, Some(5_000), Vector3::zeros()));
        assert_relative_eq!(ep.clock_offset(), 3.0, epsilon = 1e-9);
        let front = ep.filter().history().front().unwrap();
        assert_relative_eq!(front.timestamp(), 3.5, epsilon = 1e-9);
    }

    #[test]
    fn test_device_time_source_for_positions() {
        let config = EndpointConfig {
            position_time_source: PositionTimeSource::Device,
            ..EndpointConfig::default()
        };
        let mut ep = TrackedEndpoint::new(EndpointId::new(TagUid(1), 0), DeviceVersion::V3, &config);
        ep.ingest(TimedMeasurement::new(
            10.0,
            Measurement::Position {
                device_ticks: Some(10_000),
                position: Vector3::zeros(),
            },
        ));
        let front = ep.filter().history().front().unwrap();
        assert_relative_eq!(front.timestamp(), 10.0 - 0.065, epsilon = 1e-9);
    }

    #[test]
    fn test_acceleration_reaches_filter_in_world_frame() {
        let mut ep = endpoint(DeviceVersion::V2);
        ep.ingest(position(1.065, Vector3::zeros()));
        // V2 remaps (x, y, z) -> (x, z, y): device z becomes world y.
        ep.ingest(level_imu(1.01, None, Vector3::new(0.0, 0.0, 2.0)));
        let front = ep.filter().history().front().unwrap();
        assert_relative_eq!(
            front.acceleration().unwrap(),
            Vector3::new(0.0, 2.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_legacy_euler_updates_orientation_only() {
        let mut ep = endpoint(DeviceVersion::V2);
        ep.ingest(position(1.065, Vector3::zeros()));
        let outcome = ep.ingest(TimedMeasurement::new(
            1.01,
            Measurement::Inertial {
                device_ticks: None,
                orientation: RawOrientation::Euler(Vector3::new(10.0, 20.0, 30.0)),
                acceleration: Vector3::new(0.0, 0.0, 5.0),
            },
        ));

        assert_eq!(outcome, InsertOutcome::OrientationOnly);
        assert_eq!(ep.stats().orientation_only, 1);
        assert_eq!(ep.filter().history().len(), 1);
        assert!(ep.filter().history().latest_inertial_index().is_none());
        assert!(ep.orientation() != UnitQuaternion::identity());
    }

    #[test]
    fn test_repeated_query_is_cached() {
        let mut ep = endpoint(DeviceVersion::V3);
        ep.ingest(position(1.065, Vector3::zeros()));
        ep.ingest(position(1.095, Vector3::new(0.03, 0.0, 0.0)));
        let a = ep.position(1.05);
        let b = ep.position(1.05);
        assert_eq!(a, b);
    }

    #[test]
    fn test_new_fix_invalidates_cached_query() {
        let mut ep = endpoint(DeviceVersion::V3);
        assert_eq!(ep.position(2.0), Vector3::zeros());

        ep.ingest(position(1.9, Vector3::new(1.0, 1.0, 1.0)));
        assert_relative_eq!(ep.position(2.0), Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_dropped_fix_keeps_cached_query() {
        let mut ep = endpoint(DeviceVersion::V3);
        ep.ingest(position(1.0, Vector3::zeros()));
        let before = ep.position(1.5);
        // Same arrival as the first fix: rejected as too close.
        ep.ingest(position(1.0, Vector3::new(5.0, 0.0, 0.0)));
        assert_eq!(ep.position(1.5), before);
    }

    #[test]
    fn test_drop_counters() {
        let mut ep = endpoint(DeviceVersion::V3);
        ep.ingest(position(1.0, Vector3::zeros()));
        ep.ingest(position(1.0, Vector3::zeros()));
        assert_eq!(ep.stats().dropped, 1);
    }
}
