//! tagfuse Deterministic Replay Harness
//!
//! This crate replays synthetic tag traffic through the full client stack:
//! gateway datagram codec, receive-side handoff, per-endpoint filters and
//! render-tick queries.
//!
//! # Core Principle: Controlled Time
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advances in 1 ms steps
//! - **Delivery**: datagrams are ordered by simulated arrival time
//! - **Randomness**: all noise derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                        │
//! │  ┌────────────┐  datagrams   ┌──────────┐  tick(now)     │
//! │  │   Oracle   │ ───────────▶ │ Receiver │ ──────┐        │
//! │  │ (truth +   │  (in flight) └──────────┘       ▼        │
//! │  │  sensors)  │                          ┌────────────┐  │
//! │  └─────┬──────┘                          │  Registry  │  │
//! │        │ truth                           └─────┬──────┘  │
//! │        ▼                                       │ poses   │
//! │  ┌──────────────────────────────────────────────▼──────┐ │
//! │  │              ValidationSession                      │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tagfuse_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_duration(10.0).run(ScenarioId::Jumpy);
//! result.report.print();
//! ```

mod context;
mod exporter;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimClock;
pub use exporter::{SimEvent, SimExport, SimFrame, TagPosition};
pub use oracle::{encode_positions, GroundTruthTag, ImuReading, Motion, Oracle, PositionReading};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::{Criteria, ScenarioId};
