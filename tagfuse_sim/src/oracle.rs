//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the true state of every simulated tag:
//! - Analytic trajectories (position, velocity, acceleration at any time)
//! - A free-running device clock per tag that wraps every 2^16 ticks
//! - Sensor reading generation (IMU and optical fixes, with noise and jumps)
//!
//! Readings are expressed the way a tag reports them: device-frame
//! acceleration, version-specific quaternion signs and wrapping ticks.

use nalgebra::{UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use tagfuse_core::codec::{CodecError, DatagramEncoder};
use tagfuse_core::tagfuse_clock::DEVICE_TICKS_PER_SECOND;
use tagfuse_core::tagfuse_orientation::{yaw_rotation, DeviceVersion};
use tagfuse_core::{EndpointId, TagUid};

/// Sensor channel every simulated tag reports on.
pub const SIM_CHANNEL: u8 = 0;

// ============================================================================
// MOTION
// ============================================================================

/// Analytic trajectory in the room frame (Y up).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Motion {
    Stationary {
        position: Vector3<f64>,
    },
    /// Horizontal circle
    Circle {
        center: Vector3<f64>,
        radius: f64,
        /// rad/s
        angular_speed: f64,
        phase: f64,
    },
    /// Sinusoid along `amplitude`
    Oscillate {
        center: Vector3<f64>,
        amplitude: Vector3<f64>,
        /// Hz
        frequency: f64,
    },
}

impl Motion {
    pub fn position(&self, t: f64) -> Vector3<f64> {
        match *self {
            Motion::Stationary { position } => position,
            Motion::Circle {
                center,
                radius,
                angular_speed,
                phase,
            } => {
                let a = angular_speed * t + phase;
                center + Vector3::new(a.cos(), 0.0, a.sin()) * radius
            }
            Motion::Oscillate {
                center,
                amplitude,
                frequency,
            } => center + amplitude * (TAU * frequency * t).sin(),
        }
    }

    pub fn velocity(&self, t: f64) -> Vector3<f64> {
        match *self {
            Motion::Stationary { .. } => Vector3::zeros(),
            Motion::Circle {
                radius,
                angular_speed,
                phase,
                ..
            } => {
                let a = angular_speed * t + phase;
                Vector3::new(-a.sin(), 0.0, a.cos()) * radius * angular_speed
            }
            Motion::Oscillate {
                amplitude,
                frequency,
                ..
            } => {
                let w = TAU * frequency;
                amplitude * w * (w * t).cos()
            }
        }
    }

    pub fn acceleration(&self, t: f64) -> Vector3<f64> {
        match *self {
            Motion::Stationary { .. } => Vector3::zeros(),
            Motion::Circle {
                radius,
                angular_speed,
                phase,
                ..
            } => {
                let a = angular_speed * t + phase;
                -Vector3::new(a.cos(), 0.0, a.sin()) * radius * angular_speed * angular_speed
            }
            Motion::Oscillate {
                amplitude,
                frequency,
                ..
            } => {
                let w = TAU * frequency;
                -amplitude * w * w * (w * t).sin()
            }
        }
    }
}

// ============================================================================
// GROUND TRUTH TAG
// ============================================================================

/// A ground truth tag in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthTag {
    pub uid: TagUid,
    pub version: DeviceVersion,
    pub motion: Motion,

    /// Heading change in degrees per second
    pub yaw_rate: f64,

    /// Device clock reading at simulation time 0, in seconds
    pub clock_offset: f64,

    /// Tag is active (powered and reporting)
    pub active: bool,
}

impl GroundTruthTag {
    pub fn new(uid: TagUid, version: DeviceVersion, motion: Motion) -> Self {
        Self {
            uid,
            version,
            motion,
            yaw_rate: 0.0,
            clock_offset: 0.0,
            active: true,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        EndpointId::new(self.uid, SIM_CHANNEL)
    }

    pub fn orientation(&self, t: f64) -> UnitQuaternion<f64> {
        yaw_rotation(self.yaw_rate * t)
    }

    pub fn device_ticks(&self, t: f64) -> u16 {
        ticks_at(t + self.clock_offset)
    }
}

/// 16-bit device counter value at `seconds`.
pub fn ticks_at(seconds: f64) -> u16 {
    ((seconds * DEVICE_TICKS_PER_SECOND).round() as i64).rem_euclid(65_536) as u16
}

/// Expresses a world-frame orientation and acceleration the way a tag of
/// `version` reports them: quaternion `[x, y, z, w]` with the version's sign
/// convention and acceleration in raw IMU axes.
pub fn to_device(
    orientation: &UnitQuaternion<f64>,
    world_acceleration: &Vector3<f64>,
    version: DeviceVersion,
) -> ([f64; 4], Vector3<f64>) {
    let [sx, sy, sz, sw] = version.quaternion_signs();
    let q = orientation.quaternion();
    let raw_q = [sx * q.i, sy * q.j, sz * q.k, sw * q.w];

    let local = orientation.inverse() * world_acceleration;
    let remap = version.acceleration_remap();
    let mut raw = Vector3::zeros();
    for i in 0..3 {
        raw[remap.axes[i]] = remap.signs[i] * local[i];
    }
    (raw_q, raw)
}

// ============================================================================
// READINGS
// ============================================================================

/// One IMU sample as the tag sends it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImuReading {
    pub endpoint: EndpointId,
    pub ticks: u16,
    pub orientation: [f64; 4],
    pub acceleration: Vector3<f64>,
}

impl ImuReading {
    pub fn encode(&self) -> Vec<u8> {
        tagfuse_core::codec::encode_quaternion_imu(
            self.endpoint,
            Some(self.ticks),
            self.orientation,
            &self.acceleration,
        )
    }
}

/// One optical fix as the gateway sends it.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReading {
    pub endpoint: EndpointId,
    /// Gateway timestamp
    pub ticks: u16,
    pub position: Vector3<f64>,
    /// The fix was displaced on purpose
    pub is_jump: bool,
}

/// Packs several fixes into one gateway datagram.
pub fn encode_positions(readings: &[PositionReading]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DatagramEncoder::new();
    for reading in readings {
        encoder.position(reading.endpoint, reading.ticks, &reading.position)?;
    }
    Ok(encoder.finish())
}

// ============================================================================
// ORACLE
// ============================================================================

/// The Oracle - maintains ground truth and generates sensor readings.
pub struct Oracle {
    /// Master seed (separate from the delivery seed)
    physics_seed: u64,

    /// RNG for physics (noise, jumps)
    physics_rng: ChaCha8Rng,

    tags: BTreeMap<TagUid, GroundTruthTag>,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Optical fix noise standard deviation (meters)
    position_noise_std: f64,

    /// IMU acceleration noise standard deviation (m/s²)
    acceleration_noise_std: f64,

    /// Chance that a fix is displaced by `jump_distance`
    jump_probability: f64,
    jump_distance: f64,

    /// Gateway clock reading at simulation time 0
    gateway_clock_offset: f64,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_seed,
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            tags: BTreeMap::new(),
            current_time: 0.0,
            position_noise_std: 0.003,
            acceleration_noise_std: 0.05,
            jump_probability: 0.0,
            jump_distance: 0.0,
            gateway_clock_offset: 0.0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.physics_seed
    }

    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.position_noise_std = std_dev.max(0.0);
    }

    pub fn set_acceleration_noise(&mut self, std_dev: f64) {
        self.acceleration_noise_std = std_dev.max(0.0);
    }

    pub fn set_jumps(&mut self, probability: f64, distance: f64) {
        self.jump_probability = probability.clamp(0.0, 1.0);
        self.jump_distance = distance;
    }

    pub fn set_gateway_clock_offset(&mut self, seconds: f64) {
        self.gateway_clock_offset = seconds;
    }

    /// Adds a tag and returns its endpoint.
    pub fn spawn_tag(&mut self, tag: GroundTruthTag) -> EndpointId {
        let endpoint = tag.endpoint();
        self.tags.insert(tag.uid, tag);
        endpoint
    }

    /// Powers a tag off; it stops producing readings.
    pub fn remove_tag(&mut self, uid: TagUid) {
        if let Some(tag) = self.tags.get_mut(&uid) {
            tag.active = false;
        }
    }

    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
    }

    pub fn set_time(&mut self, t: f64) {
        self.current_time = t;
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn tag(&self, uid: TagUid) -> Option<&GroundTruthTag> {
        self.tags.get(&uid)
    }

    pub fn active_tags(&self) -> Vec<&GroundTruthTag> {
        self.tags.values().filter(|t| t.active).collect()
    }

    /// True position of `uid` now.
    pub fn truth(&self, uid: TagUid) -> Option<Vector3<f64>> {
        self.truth_at(uid, self.current_time)
    }

    pub fn truth_at(&self, uid: TagUid, t: f64) -> Option<Vector3<f64>> {
        self.tags.get(&uid).map(|tag| tag.motion.position(t))
    }

    fn gaussian(&mut self, std_dev: f64) -> Vector3<f64> {
        if std_dev == 0.0 {
            return Vector3::zeros();
        }
        let mut sample = || -> f64 { self.physics_rng.sample(StandardNormal) };
        Vector3::new(sample(), sample(), sample()) * std_dev
    }

    /// Generates the IMU sample `uid` takes now.
    pub fn imu_reading(&mut self, uid: TagUid) -> Option<ImuReading> {
        let tag = self.tags.get(&uid).filter(|t| t.active)?.clone();
        let t = self.current_time;
        let world = tag.motion.acceleration(t) + self.gaussian(self.acceleration_noise_std);
        let (orientation, acceleration) = to_device(&tag.orientation(t), &world, tag.version);
        Some(ImuReading {
            endpoint: tag.endpoint(),
            ticks: tag.device_ticks(t),
            orientation,
            acceleration,
        })
    }

    /// Generates the optical fix of `uid` captured now.
    pub fn position_reading(&mut self, uid: TagUid) -> Option<PositionReading> {
        let tag = self.tags.get(&uid).filter(|t| t.active)?.clone();
        let t = self.current_time;
        let mut position = tag.motion.position(t) + self.gaussian(self.position_noise_std);

        let is_jump = self.jump_probability > 0.0 && self.physics_rng.gen_bool(self.jump_probability);
        if is_jump {
            let angle = self.physics_rng.gen_range(0.0..TAU);
            position += Vector3::new(angle.cos(), 0.0, angle.sin()) * self.jump_distance;
        }

        Some(PositionReading {
            endpoint: tag.endpoint(),
            ticks: ticks_at(t + self.gateway_clock_offset),
            position,
            is_jump,
        })
    }

    /// Fixes for every active tag, in uid order.
    pub fn position_readings(&mut self) -> Vec<PositionReading> {
        let uids: Vec<TagUid> = self.active_tags().iter().map(|t| t.uid).collect();
        uids.into_iter()
            .filter_map(|uid| self.position_reading(uid))
            .collect()
    }
}
