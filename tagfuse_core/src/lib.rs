//! tagfuse Core - Low-Latency Pose Estimation for Room-Scale Tag Tracking
//!
//! This library fuses two unreliable streams into a smooth position per tracked
//! endpoint:
//! 1. **Late, jumpy optical fixes**: kept in a time-ordered history, checked for
//!    jumps, and re-integrated backwards when they arrive after newer IMU data
//! 2. **Fast inertial samples**: device timestamps unwrapped and synced to the
//!    local clock, rotated into the room frame, and integrated between fixes
//! 3. **Visible corrections**: blended in over time and smoothed by a one-euro
//!    filter so the rendered pose never snaps
//!
//! Datagrams arrive on a receive task and are handed to the render tick through
//! per-endpoint queues; all filter state is owned by the render side.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod handoff;
pub mod receiver;
pub mod registry;
pub mod smoothing;
pub mod tagfuse_clock;
pub mod tagfuse_filter;
pub mod tagfuse_history;
pub mod tagfuse_offset;
pub mod tagfuse_orientation;
pub mod validation;

// Re-export key types for convenience
pub use codec::{decode_datagram, CodecError, DatagramEncoder, Record};
pub use config::{ConfigError, TrackerConfig};
pub use endpoint::{EndpointConfig, EndpointId, Measurement, TagUid, TrackedEndpoint};
pub use handoff::{Inbox, InboxSender};
pub use receiver::{Receiver, ReceiverConfig, ReceiverHandle, ReceiverStats};
pub use registry::{PoseObserver, RegistryError, TagConfig, TrackerRegistry};
pub use tagfuse_clock::ClockSync;
pub use tagfuse_filter::{FilterConfig, InsertOutcome, PositionFilter};
pub use tagfuse_orientation::{DeviceVersion, OrientationPipeline};
pub use validation::{ValidationReport, ValidationSession};
