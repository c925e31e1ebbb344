//! Gateway datagram codec.
//!
//! A datagram is a run of records. The first byte of a record carries the
//! record type (high nibble) and the sensor channel (low nibble). A two-byte
//! tag UID precedes the first record and every record that follows a
//! position record; other records inherit the tag of the one before.
//!
//! | type | record          | length          |
//! |------|-----------------|-----------------|
//! | 0    | position        | 10              |
//! | 1    | Euler IMU       | 16              |
//! | 2    | quaternion IMU  | byte 1 (16, 18) |
//! | 3    | trackpad        | 4, skipped      |
//! | 6    | gun buttons     | 4, skipped      |
//!
//! All multi-byte fields are big-endian.

use crate::endpoint::{EndpointId, Measurement, TagUid};
use crate::tagfuse_orientation::RawOrientation;
use nalgebra::Vector3;
use thiserror::Error;

/// Standard gravity; accelerations are sent in milli-g.
pub const GRAVITY: f64 = 9.80665;

const POSITION_LEN: usize = 10;
const EULER_IMU_LEN: usize = 16;
const QUATERNION_IMU_LEN: usize = 16;
const TIMESTAMPED_QUATERNION_IMU_LEN: usize = 18;
const SKIPPED_LEN: usize = 4;

const TYPE_POSITION: u8 = 0;
const TYPE_EULER_IMU: u8 = 1;
const TYPE_QUATERNION_IMU: u8 = 2;
const TYPE_TRACKPAD: u8 = 3;
const TYPE_GUN: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Record at offset {offset} needs {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Unknown record type {kind} at offset {offset}")]
    UnknownRecord { kind: u8, offset: usize },

    #[error("Invalid record length {length} at offset {offset}")]
    InvalidLength { length: usize, offset: usize },

    #[error("Record for tag {tag} cannot follow a non-position record of another tag")]
    Unaddressable { tag: TagUid },
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub endpoint: EndpointId,
    pub measurement: Measurement,
}

// ============================================================================
// DECODING
// ============================================================================

/// Decodes the records of one datagram.
///
/// Records decoded before an error are still yielded; decoding stops at the
/// first error.
pub fn decode_datagram(bytes: &[u8]) -> DatagramDecoder<'_> {
    DatagramDecoder {
        bytes,
        cursor: 0,
        tag: None,
        expect_uid: true,
        done: false,
    }
}

pub struct DatagramDecoder<'a> {
    bytes: &'a [u8],
    cursor: usize,
    tag: Option<TagUid>,
    expect_uid: bool,
    done: bool,
}

#[inline]
fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn be_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn acceleration(record: &[u8]) -> Vector3<f64> {
    let scale = GRAVITY / 1000.0;
    Vector3::new(
        f64::from(be_i16(record, 10)) * scale,
        f64::from(be_i16(record, 12)) * scale,
        f64::from(be_i16(record, 14)) * scale,
    )
}

/// Quaternion component sent as `(1 - c) * 10000`.
fn negated_component(record: &[u8], at: usize) -> f64 {
    -(f64::from(be_u16(record, at)) / 10_000.0 - 1.0)
}

impl<'a> DatagramDecoder<'a> {
    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        let available = self.bytes.len() - self.cursor;
        if available < needed {
            return Err(CodecError::Truncated {
                offset: self.cursor,
                needed,
                available,
            });
        }
        let slice = &self.bytes[self.cursor..self.cursor + needed];
        self.cursor += needed;
        Ok(slice)
    }

    fn next_record(&mut self) -> Result<Option<Record>, CodecError> {
        loop {
            if self.cursor >= self.bytes.len() {
                return Ok(None);
            }
            if self.expect_uid || self.tag.is_none() {
                let uid = self.take(2)?;
                self.tag = Some(TagUid::from_bytes([uid[0], uid[1]]));
                self.expect_uid = false;
            }
            let tag = self.tag.unwrap_or(TagUid(0));

            let offset = self.cursor;
            let header = *self.bytes.get(offset).ok_or(CodecError::Truncated {
                offset,
                needed: 1,
                available: 0,
            })?;
            let kind = header >> 4;
            let endpoint = EndpointId::new(tag, header & 0x0f);

            match kind {
                TYPE_POSITION => {
                    let record = self.take(POSITION_LEN)?;
                    self.expect_uid = true;
                    let mm = |at| f64::from(be_i16(record, at)) / 1000.0;
                    return Ok(Some(Record {
                        endpoint,
                        measurement: Measurement::Position {
                            device_ticks: Some(be_u16(record, 2)),
                            position: Vector3::new(mm(4), mm(8), mm(6)),
                        },
                    }));
                }
                TYPE_EULER_IMU => {
                    let record = self.take(EULER_IMU_LEN)?;
                    let degrees = |at| f64::from(be_u16(record, at)) / 100.0;
                    return Ok(Some(Record {
                        endpoint,
                        measurement: Measurement::Inertial {
                            device_ticks: None,
                            orientation: RawOrientation::Euler(Vector3::new(
                                degrees(4),
                                degrees(6),
                                degrees(8),
                            )),
                            acceleration: acceleration(record),
                        },
                    }));
                }
                TYPE_QUATERNION_IMU => {
                    let length = match self.bytes.get(offset + 1) {
                        Some(&len) => usize::from(len),
                        None => {
                            return Err(CodecError::Truncated {
                                offset,
                                needed: 2,
                                available: 1,
                            })
                        }
                    };
                    if length != QUATERNION_IMU_LEN && length != TIMESTAMPED_QUATERNION_IMU_LEN {
                        return Err(CodecError::InvalidLength { length, offset });
                    }
                    let record = self.take(length)?;
                    let device_ticks =
                        (length == TIMESTAMPED_QUATERNION_IMU_LEN).then(|| be_u16(record, 16));
                    return Ok(Some(Record {
                        endpoint,
                        measurement: Measurement::Inertial {
                            device_ticks,
                            orientation: RawOrientation::Quaternion {
                                w: f64::from(be_u16(record, 2)) / 10_000.0 - 1.0,
                                x: negated_component(record, 4),
                                z: negated_component(record, 6),
                                y: negated_component(record, 8),
                            },
                            acceleration: acceleration(record),
                        },
                    }));
                }
                TYPE_TRACKPAD | TYPE_GUN => {
                    self.take(SKIPPED_LEN)?;
                }
                _ => return Err(CodecError::UnknownRecord { kind, offset }),
            }
        }
    }
}

impl Iterator for DatagramDecoder<'_> {
    type Item = Result<Record, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ============================================================================
// ENCODING
// ============================================================================

fn quantize_i16(v: f64) -> [u8; 2] {
    (v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16).to_be_bytes()
}

fn quantize_u16(v: f64) -> [u8; 2] {
    (v.round().clamp(0.0, f64::from(u16::MAX)) as u16).to_be_bytes()
}

/// Builds datagrams following the UID placement rule.
#[derive(Debug, Default)]
pub struct DatagramEncoder {
    bytes: Vec<u8>,
    tag: Option<TagUid>,
    expect_uid: bool,
}

impl DatagramEncoder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            tag: None,
            expect_uid: true,
        }
    }

    fn address(&mut self, tag: TagUid) -> Result<(), CodecError> {
        if self.expect_uid || self.tag.is_none() {
            self.bytes.extend_from_slice(&tag.to_bytes());
            self.tag = Some(tag);
            self.expect_uid = false;
            Ok(())
        } else if self.tag == Some(tag) {
            Ok(())
        } else {
            Err(CodecError::Unaddressable { tag })
        }
    }

    /// Appends a position record. `position` is in metres, room frame.
    pub fn position(
        &mut self,
        endpoint: EndpointId,
        ticks: u16,
        position: &Vector3<f64>,
    ) -> Result<&mut Self, CodecError> {
        self.address(endpoint.tag)?;
        self.bytes
            .push((TYPE_POSITION << 4) | (endpoint.channel & 0x0f));
        self.bytes.push(POSITION_LEN as u8);
        self.bytes.extend_from_slice(&ticks.to_be_bytes());
        for v in [position.x, position.z, position.y] {
            self.bytes.extend_from_slice(&quantize_i16(v * 1000.0));
        }
        self.expect_uid = true;
        Ok(self)
    }

    /// Appends a quaternion IMU record. `orientation` is in decoded
    /// (post-codec) components, `acceleration` in m/s².
    pub fn quaternion_imu(
        &mut self,
        endpoint: EndpointId,
        ticks: Option<u16>,
        orientation: [f64; 4],
        acceleration: &Vector3<f64>,
    ) -> Result<&mut Self, CodecError> {
        self.address(endpoint.tag)?;
        let [x, y, z, w] = orientation;
        let length = if ticks.is_some() {
            TIMESTAMPED_QUATERNION_IMU_LEN
        } else {
            QUATERNION_IMU_LEN
        };
        self.bytes
            .push((TYPE_QUATERNION_IMU << 4) | (endpoint.channel & 0x0f));
        self.bytes.push(length as u8);
        self.bytes.extend_from_slice(&quantize_u16((w + 1.0) * 10_000.0));
        for c in [x, z, y] {
            self.bytes.extend_from_slice(&quantize_u16((1.0 - c) * 10_000.0));
        }
        for a in acceleration.iter() {
            self.bytes
                .extend_from_slice(&quantize_i16(a / GRAVITY * 1000.0));
        }
        if let Some(ticks) = ticks {
            self.bytes.extend_from_slice(&ticks.to_be_bytes());
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Single position record datagram.
pub fn encode_position(endpoint: EndpointId, ticks: u16, position: &Vector3<f64>) -> Vec<u8> {
    let mut encoder = DatagramEncoder::new();
    // A fresh encoder always accepts its first record.
    let _ = encoder.position(endpoint, ticks, position);
    encoder.finish()
}

/// Single quaternion IMU record datagram.
pub fn encode_quaternion_imu(
    endpoint: EndpointId,
    ticks: Option<u16>,
    orientation: [f64; 4],
    acceleration: &Vector3<f64>,
) -> Vec<u8> {
    let mut encoder = DatagramEncoder::new();
    let _ = encoder.quaternion_imu(endpoint, ticks, orientation, acceleration);
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ep(tag: u16, channel: u8) -> EndpointId {
        EndpointId::new(TagUid(tag), channel)
    }

    #[test]
    fn test_decode_position_record() {
        // uid ab:12, type 0 channel 1, len 10, ts 0x1234, x=1000 y=-500 z=250 (mm)
        let mut bytes = vec![0xab, 0x12, 0x01, 0x0a, 0x12, 0x34];
        bytes.extend_from_slice(&1000i16.to_be_bytes());
        bytes.extend_from_slice(&(-500i16).to_be_bytes());
        bytes.extend_from_slice(&250i16.to_be_bytes());

        let records: Vec<_> = decode_datagram(&bytes).collect();
        assert_eq!(records.len(), 1);
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.endpoint, ep(0xab12, 1));
        match &record.measurement {
            Measurement::Position {
                device_ticks,
                position,
            } => {
                assert_eq!(*device_ticks, Some(0x1234));
                // Wire (x, y, z) maps to room (x, z, y).
                assert_relative_eq!(*position, Vector3::new(1.0, 0.25, -0.5), epsilon = 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_quaternion_imu() {
        let bytes = encode_quaternion_imu(
            ep(7, 0),
            Some(4321),
            [0.1, -0.2, 0.3, 0.9],
            &Vector3::new(GRAVITY, 0.0, -GRAVITY / 2.0),
        );
        assert_eq!(bytes.len(), 2 + 18);

        let record = decode_datagram(&bytes).next().unwrap().unwrap();
        match record.measurement {
            Measurement::Inertial {
                device_ticks,
                orientation: RawOrientation::Quaternion { x, y, z, w },
                acceleration,
            } => {
                assert_eq!(device_ticks, Some(4321));
                assert_relative_eq!(x, 0.1, epsilon = 1e-4);
                assert_relative_eq!(y, -0.2, epsilon = 1e-4);
                assert_relative_eq!(z, 0.3, epsilon = 1e-4);
                assert_relative_eq!(w, 0.9, epsilon = 1e-4);
                assert_relative_eq!(acceleration.x, GRAVITY, epsilon = 1e-2);
                assert_relative_eq!(acceleration.z, -GRAVITY / 2.0, epsilon = 1e-2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_untimestamped_quaternion_imu() {
        let bytes = encode_quaternion_imu(ep(7, 2), None, [0.0, 0.0, 0.0, 1.0], &Vector3::zeros());
        assert_eq!(bytes.len(), 2 + 16);
        let record = decode_datagram(&bytes).next().unwrap().unwrap();
        assert_eq!(record.endpoint.channel, 2);
        assert!(matches!(
            record.measurement,
            Measurement::Inertial {
                device_ticks: None,
                ..
            }
        ));
    }

    #[test]
    fn test_uid_placement_rule() {
        let mut encoder = DatagramEncoder::new();
        encoder
            .quaternion_imu(ep(1, 0), Some(1), [0.0, 0.0, 0.0, 1.0], &Vector3::zeros())
            .unwrap()
            .position(ep(1, 0), 2, &Vector3::zeros())
            .unwrap()
            .position(ep(2, 0), 3, &Vector3::zeros())
            .unwrap()
            .quaternion_imu(ep(3, 1), None, [0.0, 0.0, 0.0, 1.0], &Vector3::zeros())
            .unwrap();
        // Another tag cannot follow a non-position record.
        assert_eq!(
            encoder
                .quaternion_imu(ep(4, 0), None, [0.0, 0.0, 0.0, 1.0], &Vector3::zeros())
                .err(),
            Some(CodecError::Unaddressable { tag: TagUid(4) })
        );
        let bytes = encoder.finish();
        // 2 + 18, 10, 2 + 10, 2 + 16
        assert_eq!(bytes.len(), 60);

        let endpoints: Vec<EndpointId> = decode_datagram(&bytes)
            .map(|r| r.unwrap().endpoint)
            .collect();
        assert_eq!(endpoints, vec![ep(1, 0), ep(1, 0), ep(2, 0), ep(3, 1)]);
    }

    #[test]
    fn test_skips_trackpad_and_gun_records() {
        let mut bytes = vec![0x00, 0x05, 0x30, 0x80, 0x80, 0x01, 0x60, 0x03, 0x00, 0x00];
        bytes.extend(
            encode_quaternion_imu(ep(5, 0), None, [0.0, 0.0, 0.0, 1.0], &Vector3::zeros())
                .into_iter()
                .skip(2),
        );
        let records: Vec<_> = decode_datagram(&bytes).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, ep(5, 0));
    }

    #[test]
    fn test_unknown_record_stops_decoding() {
        let mut bytes = encode_position(ep(1, 0), 10, &Vector3::zeros());
        bytes.extend_from_slice(&[0x00, 0x02, 0x90, 0x00]);
        bytes.extend(encode_position(ep(2, 0), 11, &Vector3::zeros()));

        let records: Vec<_> = decode_datagram(&bytes).collect();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert_eq!(
            records[1],
            Err(CodecError::UnknownRecord { kind: 9, offset: 14 })
        );
    }

    #[test]
    fn test_truncated_record() {
        let bytes = encode_position(ep(1, 0), 10, &Vector3::new(0.1, 0.2, 0.3));
        let records: Vec<_> = decode_datagram(&bytes[..8]).collect();
        assert_eq!(
            records,
            vec![Err(CodecError::Truncated {
                offset: 2,
                needed: 10,
                available: 6
            })]
        );
    }

    #[test]
    fn test_invalid_quaternion_length() {
        let bytes = [0x00, 0x01, 0x20, 0x11];
        let err = decode_datagram(&bytes).next().unwrap().unwrap_err();
        assert_eq!(err, CodecError::InvalidLength { length: 17, offset: 2 });
    }

    #[test]
    fn test_empty_datagram() {
        assert_eq!(decode_datagram(&[]).count(), 0);
    }
}
