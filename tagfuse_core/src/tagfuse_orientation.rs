//! The "ORIENTATION" Engine - Device Frame to Room Frame
//!
//! Each tag hardware revision mounts its IMU differently, so raw quaternions
//! and accelerations are first remapped through a per-version table. The
//! orientation is then referenced to the room (yaw calibration) and used to
//! rotate the local acceleration into the world frame the position filter
//! integrates in.
//!
//! Frame convention: Y is up, yaw is a rotation about +Y, angles in degrees.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

// ============================================================================
// DEVICE VERSIONS
// ============================================================================

/// Tag hardware revision. Selects the axis remapping tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceVersion {
    V2,
    #[default]
    V3,
    Gun,
}

/// Axis permutation plus sign flip: `out[i] = signs[i] * in[axes[i]]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRemap {
    pub axes: [usize; 3],
    pub signs: [f64; 3],
}

impl AxisRemap {
    pub fn apply(&self, v: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            self.signs[0] * v[self.axes[0]],
            self.signs[1] * v[self.axes[1]],
            self.signs[2] * v[self.axes[2]],
        )
    }
}

impl DeviceVersion {
    /// Sign applied to each raw quaternion component, in `[x, y, z, w]` order.
    pub fn quaternion_signs(self) -> [f64; 4] {
        match self {
            DeviceVersion::V2 | DeviceVersion::Gun => [1.0, 1.0, 1.0, 1.0],
            DeviceVersion::V3 => [-1.0, 1.0, -1.0, 1.0],
        }
    }

    /// Mapping from the IMU's acceleration axes to the tag's local frame.
    pub fn acceleration_remap(self) -> AxisRemap {
        match self {
            DeviceVersion::V2 => AxisRemap {
                axes: [0, 2, 1],
                signs: [1.0, 1.0, 1.0],
            },
            DeviceVersion::V3 | DeviceVersion::Gun => AxisRemap {
                axes: [0, 2, 1],
                signs: [-1.0, 1.0, -1.0],
            },
        }
    }
}

// ============================================================================
// RAW ORIENTATION
// ============================================================================

/// Orientation as reported by the tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RawOrientation {
    /// Raw quaternion components, not yet remapped or normalized
    Quaternion { x: f64, y: f64, z: f64, w: f64 },

    /// Legacy firmware: Euler angles in degrees
    Euler(Vector3<f64>),
}

/// Builds a rotation from Euler angles in degrees, applied roll (Z), then
/// pitch (X), then yaw (Y).
pub fn euler_degrees(x: f64, y: f64, z: f64) -> UnitQuaternion<f64> {
    let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), y.to_radians());
    let pitch = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), x.to_radians());
    let roll = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), z.to_radians());
    yaw * pitch * roll
}

/// Rotation about the vertical axis.
pub fn yaw_rotation(degrees: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), degrees.to_radians())
}

/// Heading of an orientation in degrees, measured from +Z towards +X.
pub fn yaw_degrees(q: &UnitQuaternion<f64>) -> f64 {
    let forward = q * Vector3::z();
    forward.x.atan2(forward.z).to_degrees()
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Result of one orientation update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationUpdate {
    /// Room-referenced orientation
    pub orientation: UnitQuaternion<f64>,

    /// Acceleration in the world frame (m/s²)
    pub world_acceleration: Vector3<f64>,
}

/// Per-endpoint orientation state.
#[derive(Debug, Clone)]
pub struct OrientationPipeline {
    orientation: UnitQuaternion<f64>,
    world_acceleration: Vector3<f64>,

    /// Extra heading subtracted after room referencing (captured zero)
    yaw_zero: Option<f64>,
}

impl OrientationPipeline {
    pub fn new() -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            world_acceleration: Vector3::zeros(),
            yaw_zero: None,
        }
    }

    /// Runs one raw IMU reading through remapping, yaw referencing and the
    /// local-to-world acceleration transform.
    ///
    /// `yaw_reference` is the room calibration heading in degrees. It is not
    /// applied to secondary sensors, whose yaw stays device-relative.
    /// A degenerate (zero-norm) quaternion keeps the previous orientation.
    pub fn update(
        &mut self,
        raw_orientation: RawOrientation,
        raw_acceleration: Vector3<f64>,
        version: DeviceVersion,
        yaw_reference: f64,
        secondary: bool,
    ) -> OrientationUpdate {
        let device = match raw_orientation {
            RawOrientation::Quaternion { x, y, z, w } => {
                let [sx, sy, sz, sw] = version.quaternion_signs();
                let q = Quaternion::new(sw * w, sx * x, sy * y, sz * z);
                UnitQuaternion::try_new(q, 1e-9)
            }
            RawOrientation::Euler(angles) => Some(Self::legacy_euler(&angles)),
        };

        if let Some(device) = device {
            let mut orientation = device;
            if !secondary {
                orientation = yaw_rotation(-yaw_reference) * orientation;
            }
            if let Some(zero) = self.yaw_zero {
                orientation = yaw_rotation(-zero) * orientation;
            }
            self.orientation = orientation;
        }

        let local = version.acceleration_remap().apply(&raw_acceleration);
        self.world_acceleration = self.orientation * local;

        OrientationUpdate {
            orientation: self.orientation,
            world_acceleration: self.world_acceleration,
        }
    }

    /// Current room-referenced orientation.
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation
    }

    /// Most recent world-frame acceleration.
    pub fn world_acceleration(&self) -> Vector3<f64> {
        self.world_acceleration
    }

    /// Current heading in degrees.
    pub fn yaw_degrees(&self) -> f64 {
        yaw_degrees(&self.orientation)
    }

    /// Makes the current heading the new zero for subsequent updates.
    ///
    /// Used for body-worn IMU-only sensors that have no optical heading
    /// correction. Captures accumulate.
    pub fn capture_yaw_zero(&mut self) {
        let current = self.yaw_degrees();
        self.yaw_zero = Some(self.yaw_zero.unwrap_or(0.0) + current);
        self.orientation = yaw_rotation(-current) * self.orientation;
    }

    /// Heading captured by [`OrientationPipeline::capture_yaw_zero`], if any.
    pub fn yaw_zero(&self) -> Option<f64> {
        self.yaw_zero
    }

    pub fn clear_yaw_zero(&mut self) {
        self.yaw_zero = None;
    }

    /// Legacy Euler firmware reports angles in its own axis order; these
    /// fixed rotations bring it into the quaternion firmware's frame.
    fn legacy_euler(angles: &Vector3<f64>) -> UnitQuaternion<f64> {
        let flipped = euler_degrees(-angles.z, angles.x + 90.0, angles.y);
        flipped * euler_degrees(180.0, 0.0, 0.0) * euler_degrees(0.0, -90.0, 0.0)
    }
}

impl Default for OrientationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn raw_from(q: UnitQuaternion<f64>) -> RawOrientation {
        RawOrientation::Quaternion {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        }
    }

    #[test]
    fn test_acceleration_remap_tables() {
        let raw = Vector3::new(1.0, 2.0, 3.0);
        assert_eq!(
            DeviceVersion::V2.acceleration_remap().apply(&raw),
            Vector3::new(1.0, 3.0, 2.0)
        );
        assert_eq!(
            DeviceVersion::V3.acceleration_remap().apply(&raw),
            Vector3::new(-1.0, 3.0, -2.0)
        );
        assert_eq!(
            DeviceVersion::Gun.acceleration_remap(),
            DeviceVersion::V3.acceleration_remap()
        );
    }

    #[test]
    fn test_v3_quaternion_flip() {
        let mut pipeline = OrientationPipeline::new();
        let raw = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.5);
        let update = pipeline.update(raw_from(raw), Vector3::zeros(), DeviceVersion::V3, 0.0, false);

        // Negating x and z of a pure X rotation inverts it.
        assert_relative_eq!(update.orientation.angle_to(&raw.inverse()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_yaw_reference_subtracted() {
        let mut pipeline = OrientationPipeline::new();
        pipeline.update(raw_from(yaw_rotation(50.0)), Vector3::zeros(), DeviceVersion::V2, 30.0, false);

        assert_relative_eq!(pipeline.yaw_degrees(), 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_secondary_sensor_keeps_device_yaw() {
        let mut pipeline = OrientationPipeline::new();
        pipeline.update(raw_from(yaw_rotation(50.0)), Vector3::zeros(), DeviceVersion::V2, 30.0, true);

        assert_relative_eq!(pipeline.yaw_degrees(), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_acceleration_rotated_into_world() {
        let mut pipeline = OrientationPipeline::new();
        let update = pipeline.update(
            raw_from(yaw_rotation(90.0)),
            Vector3::new(1.0, 0.0, 0.0),
            DeviceVersion::V2,
            0.0,
            false,
        );

        assert_relative_eq!(update.world_acceleration, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_quaternion_keeps_previous() {
        let mut pipeline = OrientationPipeline::new();
        pipeline.update(raw_from(yaw_rotation(10.0)), Vector3::zeros(), DeviceVersion::V2, 0.0, false);
        let zero = RawOrientation::Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 0.0 };
        pipeline.update(zero, Vector3::zeros(), DeviceVersion::V2, 0.0, false);

        assert_relative_eq!(pipeline.yaw_degrees(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_capture_yaw_zero() {
        let mut pipeline = OrientationPipeline::new();
        pipeline.update(raw_from(yaw_rotation(40.0)), Vector3::zeros(), DeviceVersion::V2, 0.0, true);
        pipeline.capture_yaw_zero();
        assert_relative_eq!(pipeline.yaw_degrees(), 0.0, epsilon = 1e-9);

        pipeline.update(raw_from(yaw_rotation(55.0)), Vector3::zeros(), DeviceVersion::V2, 0.0, true);
        assert_relative_eq!(pipeline.yaw_degrees(), 15.0, epsilon = 1e-9);
        assert_relative_eq!(pipeline.yaw_zero().unwrap(), 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_euler_degrees_yaw_only() {
        let q = euler_degrees(0.0, 30.0, 0.0);
        assert_relative_eq!(yaw_degrees(&q), 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_legacy_euler_produces_unit_rotation() {
        let mut pipeline = OrientationPipeline::new();
        let update = pipeline.update(
            RawOrientation::Euler(Vector3::new(10.0, 20.0, 30.0)),
            Vector3::new(0.0, 9.8, 0.0),
            DeviceVersion::V2,
            0.0,
            false,
        );
        assert_relative_eq!(update.orientation.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(update.world_acceleration.norm(), 9.8, epsilon = 1e-9);
    }
}
