//! Tag registry: the application-owned replacement for a global tracker
//! manager.
//!
//! Tags are registered by UID. Their endpoints come into existence the first
//! time a measurement for a new channel is seen, and are destroyed with the
//! tag. The registry also owns the inbox that the receive loop feeds and
//! drains it on every render tick.

use crate::endpoint::{EndpointConfig, EndpointId, TagUid, TimedMeasurement, TrackedEndpoint};
use crate::handoff::{Inbox, InboxSender};
use crate::tagfuse_filter::InsertOutcome;
use crate::tagfuse_orientation::DeviceVersion;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Tag {0} is not registered")]
    UnknownTag(TagUid),

    #[error("Endpoint {0} does not exist")]
    UnknownEndpoint(EndpointId),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Static description of a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    pub uid: u16,

    #[serde(default)]
    pub version: DeviceVersion,

    /// Auxiliary sensor: yaw stays device-relative
    #[serde(default)]
    pub secondary: bool,
}

impl TagConfig {
    pub fn new(uid: u16, version: DeviceVersion) -> Self {
        Self {
            uid,
            version,
            secondary: false,
        }
    }
}

// ============================================================================
// OBSERVERS
// ============================================================================

/// Push-style pose notifications.
///
/// Observers are called during [`TrackerRegistry::tick`], in registration
/// order, once per endpoint with an estimate. They get no access to the
/// registry, so they cannot re-enter it.
pub trait PoseObserver: Send {
    fn on_pose(
        &mut self,
        endpoint: EndpointId,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        now: f64,
    );
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Measurements drained from the inbox
    pub drained: usize,
    /// Drained measurements for unregistered tags
    pub unknown: usize,
    /// Handoff queues released for unregistered tags
    pub pruned: usize,
    /// Endpoints reported to observers
    pub notified: usize,
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug)]
struct TagEntry {
    version: DeviceVersion,
    secondary: bool,
    endpoints: BTreeMap<u8, TrackedEndpoint>,
}

pub struct TrackerRegistry {
    endpoint_config: EndpointConfig,
    yaw_reference: f64,
    tags: BTreeMap<TagUid, TagEntry>,
    inbox: Inbox,
    observers: Vec<Box<dyn PoseObserver>>,
}

impl TrackerRegistry {
    pub fn new(endpoint_config: EndpointConfig, handoff_depth: usize) -> Self {
        Self {
            endpoint_config,
            yaw_reference: 0.0,
            tags: BTreeMap::new(),
            inbox: Inbox::new(handoff_depth),
            observers: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EndpointConfig::default(), crate::handoff::DEFAULT_HANDOFF_DEPTH)
    }

    /// Producer handle for the receive context.
    pub fn inbox_sender(&self) -> InboxSender {
        self.inbox.sender()
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    // ========================================================================
    // TAGS
    // ========================================================================

    /// Registers a tag. Re-registering updates its version for new endpoints.
    pub fn register_tag(&mut self, uid: TagUid, version: DeviceVersion) {
        self.register(TagConfig::new(uid.0, version));
    }

    pub fn register(&mut self, config: TagConfig) {
        let uid = TagUid(config.uid);
        let entry = self.tags.entry(uid).or_insert_with(|| TagEntry {
            version: config.version,
            secondary: config.secondary,
            endpoints: BTreeMap::new(),
        });
        entry.version = config.version;
        entry.secondary = config.secondary;
        for endpoint in entry.endpoints.values_mut() {
            endpoint.set_secondary(config.secondary);
        }
        info!(tag = %uid, version = ?config.version, secondary = config.secondary, "Tag registered");
    }

    /// Removes a tag with all its endpoints and queued measurements.
    pub fn remove_tag(&mut self, uid: TagUid) -> bool {
        self.inbox.remove_tag(uid);
        let removed = self.tags.remove(&uid).is_some();
        if removed {
            info!(tag = %uid, "Tag removed");
        }
        removed
    }

    pub fn is_registered(&self, uid: TagUid) -> bool {
        self.tags.contains_key(&uid)
    }

    /// Room calibration heading in degrees, applied to every endpoint.
    pub fn set_yaw_reference(&mut self, degrees: f64) {
        self.yaw_reference = degrees;
        for endpoint in self.tags.values_mut().flat_map(|t| t.endpoints.values_mut()) {
            endpoint.set_yaw_reference(degrees);
        }
    }

    pub fn yaw_reference(&self) -> f64 {
        self.yaw_reference
    }

    pub fn set_secondary(&mut self, uid: TagUid, secondary: bool) -> Result<(), RegistryError> {
        let entry = self
            .tags
            .get_mut(&uid)
            .ok_or(RegistryError::UnknownTag(uid))?;
        entry.secondary = secondary;
        for endpoint in entry.endpoints.values_mut() {
            endpoint.set_secondary(secondary);
        }
        Ok(())
    }

    pub fn add_observer(&mut self, observer: Box<dyn PoseObserver>) {
        self.observers.push(observer);
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Feeds a measurement directly, on the render context.
    ///
    /// Creates the endpoint on first sight of its channel.
    pub fn ingest(
        &mut self,
        id: EndpointId,
        measurement: TimedMeasurement,
    ) -> Result<InsertOutcome, RegistryError> {
        let yaw_reference = self.yaw_reference;
        let config = &self.endpoint_config;
        let entry = self
            .tags
            .get_mut(&id.tag)
            .ok_or(RegistryError::UnknownTag(id.tag))?;
        let (version, secondary) = (entry.version, entry.secondary);

        let endpoint = entry.endpoints.entry(id.channel).or_insert_with(|| {
            info!(endpoint = %id, "New endpoint observed");
            let mut endpoint = TrackedEndpoint::new(id, version, config);
            endpoint.set_secondary(secondary);
            endpoint.set_yaw_reference(yaw_reference);
            endpoint
        });
        Ok(endpoint.ingest(measurement))
    }

    /// Render-tick entry point: drains the inbox, then notifies observers.
    pub fn tick(&mut self, now: f64) -> TickReport {
        let mut report = TickReport::default();

        for (id, measurements) in self.inbox.drain_all() {
            report.drained += measurements.len();
            for measurement in measurements {
                if let Err(e) = self.ingest(id, measurement) {
                    report.unknown += 1;
                    debug!(error = %e, "Measurement for unregistered tag dropped");
                }
            }
        }
        if report.unknown > 0 {
            warn!(count = report.unknown, "Dropped measurements for unregistered tags");
            let tags = &self.tags;
            report.pruned = self.inbox.prune(|tag| tags.contains_key(&tag));
        }

        if !self.observers.is_empty() {
            for endpoint in self
                .tags
                .values_mut()
                .flat_map(|t| t.endpoints.values_mut())
                .filter(|e| e.has_estimate())
            {
                let position = endpoint.position(now);
                let orientation = endpoint.orientation();
                for observer in self.observers.iter_mut() {
                    observer.on_pose(endpoint.id(), position, orientation, now);
                }
                report.notified += 1;
            }
        }

        report
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Smoothed position of an endpoint at `now`. `None` if it does not exist.
    pub fn position(&mut self, id: EndpointId, now: f64) -> Option<Vector3<f64>> {
        self.endpoint_mut(id).map(|e| e.position(now))
    }

    pub fn orientation(&self, id: EndpointId) -> Option<UnitQuaternion<f64>> {
        self.endpoint(id).map(TrackedEndpoint::orientation)
    }

    pub fn capture_yaw_zero(&mut self, id: EndpointId) -> Result<(), RegistryError> {
        self.endpoint_mut(id)
            .ok_or(RegistryError::UnknownEndpoint(id))?
            .capture_yaw_zero();
        Ok(())
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&TrackedEndpoint> {
        self.tags.get(&id.tag)?.endpoints.get(&id.channel)
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut TrackedEndpoint> {
        self.tags.get_mut(&id.tag)?.endpoints.get_mut(&id.channel)
    }

    /// All endpoint ids, in tag then channel order.
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.tags
            .values()
            .flat_map(|t| t.endpoints.values().map(TrackedEndpoint::id))
            .collect()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Measurement;
    use crate::tagfuse_orientation::RawOrientation;
    use std::sync::{Arc, Mutex};

    fn fix(x: f64) -> Measurement {
        Measurement::Position {
            device_ticks: None,
            position: Vector3::new(x, 0.0, 0.0),
        }
    }

    fn imu_yawed(degrees: f64) -> Measurement {
        let half = degrees.to_radians() / 2.0;
        Measurement::Inertial {
            device_ticks: None,
            orientation: RawOrientation::Quaternion {
                x: 0.0,
                y: half.sin(),
                z: 0.0,
                w: half.cos(),
            },
            acceleration: Vector3::zeros(),
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, EndpointId)>>>,
    }

    impl PoseObserver for Recorder {
        fn on_pose(&mut self, endpoint: EndpointId, _: Vector3<f64>, _: UnitQuaternion<f64>, _: f64) {
            self.log.lock().unwrap().push((self.name, endpoint));
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut registry = TrackerRegistry::with_defaults();
        let id = EndpointId::new(TagUid(9), 0);
        let err = registry.ingest(id, TimedMeasurement::new(1.0, fix(0.0)));
        assert_eq!(err, Err(RegistryError::UnknownTag(TagUid(9))));
        assert!(registry.position(id, 1.0).is_none());
    }

    #[test]
    fn test_endpoint_created_on_first_observation() {
        let mut registry = TrackerRegistry::with_defaults();
        registry.register_tag(TagUid(1), DeviceVersion::V3);
        assert!(registry.endpoint_ids().is_empty());

        let id = EndpointId::new(TagUid(1), 2);
        registry
            .ingest(id, TimedMeasurement::new(1.0, fix(0.5)))
            .unwrap();
        assert_eq!(registry.endpoint_ids(), vec![id]);
        assert!(registry.position(id, 1.0).is_some());
    }

    #[test]
    fn test_tick_drains_inbox() {
        let mut registry = TrackerRegistry::with_defaults();
        registry.register_tag(TagUid(1), DeviceVersion::V3);
        let sender = registry.inbox_sender();
        let id = EndpointId::new(TagUid(1), 0);
        let stranger = EndpointId::new(TagUid(2), 0);

        sender.push(id, 1.0, fix(0.0));
        sender.push(id, 1.03, fix(0.0));
        sender.push(stranger, 1.0, fix(0.0));

        let report = registry.tick(1.05);
        assert_eq!(report.drained, 3);
        assert_eq!(report.unknown, 1);
        assert_eq!(registry.endpoint(id).unwrap().stats().positions, 2);
        assert_eq!(registry.inbox().pending(), 0);
    }

    #[test]
    fn test_tick_releases_queues_of_unregistered_tags() {
        let mut registry = TrackerRegistry::with_defaults();
        registry.register_tag(TagUid(1), DeviceVersion::V3);
        let sender = registry.inbox_sender();
        sender.push(EndpointId::new(TagUid(1), 0), 1.0, fix(0.0));
        for uid in 100..1100u16 {
            sender.push(EndpointId::new(TagUid(uid), 0), 1.0, fix(0.0));
        }
        assert_eq!(registry.inbox().queue_count(), 1001);

        let report = registry.tick(1.05);
        assert_eq!(report.unknown, 1000);
        assert_eq!(report.pruned, 1000);
        assert_eq!(registry.inbox().queue_count(), 1);
    }

    #[test]
    fn test_remove_tag_destroys_endpoints() {
        let mut registry = TrackerRegistry::with_defaults();
        registry.register_tag(TagUid(1), DeviceVersion::V3);
        let id = EndpointId::new(TagUid(1), 0);
        registry
            .ingest(id, TimedMeasurement::new(1.0, fix(0.0)))
            .unwrap();
        registry.inbox_sender().push(id, 1.1, fix(0.0));

        assert!(registry.remove_tag(TagUid(1)));
        assert!(registry.endpoint(id).is_none());
        assert_eq!(registry.inbox().pending(), 0);
        assert!(!registry.remove_tag(TagUid(1)));
    }

    #[test]
    fn test_yaw_reference_and_secondary() {
        let mut registry = TrackerRegistry::with_defaults();
        registry.register_tag(TagUid(1), DeviceVersion::V2);
        registry.register(TagConfig {
            uid: 2,
            version: DeviceVersion::V2,
            secondary: true,
        });
        registry.set_yaw_reference(30.0);

        let primary = EndpointId::new(TagUid(1), 0);
        let secondary = EndpointId::new(TagUid(2), 0);
        registry
            .ingest(primary, TimedMeasurement::new(1.0, imu_yawed(50.0)))
            .unwrap();
        registry
            .ingest(secondary, TimedMeasurement::new(1.0, imu_yawed(50.0)))
            .unwrap();

        let yaw = |q: UnitQuaternion<f64>| crate::tagfuse_orientation::yaw_degrees(&q);
        assert!((yaw(registry.orientation(primary).unwrap()) - 20.0).abs() < 1e-9);
        assert!((yaw(registry.orientation(secondary).unwrap()) - 50.0).abs() < 1e-9);

        registry.set_secondary(TagUid(1), true).unwrap();
        assert!(registry.endpoint(primary).unwrap().is_secondary());
        assert_eq!(
            registry.set_secondary(TagUid(7), true),
            Err(RegistryError::UnknownTag(TagUid(7)))
        );
    }

    #[test]
    fn test_observers_notified_in_order() {
        let mut registry = TrackerRegistry::with_defaults();
        registry.register_tag(TagUid(1), DeviceVersion::V3);
        registry.register_tag(TagUid(2), DeviceVersion::V3);

        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            registry.add_observer(Box::new(Recorder {
                name,
                log: Arc::clone(&log),
            }));
        }

        let sender = registry.inbox_sender();
        sender.push(EndpointId::new(TagUid(2), 0), 1.0, fix(0.0));
        sender.push(EndpointId::new(TagUid(1), 0), 1.0, fix(0.0));
        let report = registry.tick(1.0);
        assert_eq!(report.notified, 2);

        let log = log.lock().unwrap();
        let order: Vec<_> = log.iter().map(|(n, id)| (*n, id.tag.0)).collect();
        assert_eq!(
            order,
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }
}
