//! Scenario runner - replays generated tag traffic through the tracker.
//!
//! Time advances in 1 ms steps. Each step the oracle emits the IMU samples
//! and optical fixes that are due, every datagram whose arrival time has
//! passed is handed to the receive side, and on render ticks the registry is
//! ticked and its output scored against ground truth.
//!
//! The receive side is driven synchronously through [`Receiver::dispatch`],
//! stamped with a shared [`SimClock`], so runs are reproducible per seed.

use crate::context::SimClock;
use crate::exporter::{SimEvent, SimExport, SimFrame, TagPosition};
use crate::oracle::{encode_positions, GroundTruthTag, Motion, Oracle};
use crate::scenarios::ScenarioId;

use nalgebra::{UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, PoisonError};
use tagfuse_core::endpoint::PositionTimeSource;
use tagfuse_core::registry::PoseObserver;
use tagfuse_core::tagfuse_clock::DEVICE_TICKS_PER_SECOND;
use tagfuse_core::validation::{ValidationReport, ValidationSession};
use tagfuse_core::{
    DeviceVersion, EndpointId, Receiver, ReceiverConfig, TagConfig, TagUid, TrackerConfig,
};
use tagfuse_env::{ChannelTransport, TrackerClock};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Render ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Traffic counters collected during the run
    pub metrics: ScenarioMetrics,

    /// Accuracy against ground truth
    pub report: ValidationReport,
}

/// Traffic counters collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// IMU samples emitted
    pub imu_sent: u64,

    /// Optical fixes emitted
    pub fixes_sent: u64,

    /// Fixes displaced on purpose
    pub jumps_injected: u64,

    /// Fixes the tracker flagged as jumps
    pub jumps_detected: u64,

    /// Measurements the tracker dropped as duplicate or out of order
    pub dropped: u64,

    /// Datagrams handed to the receive side
    pub datagrams: u64,

    pub decode_errors: u64,

    /// Measurements lost to full handoff queues
    pub overwritten: u64,
}

/// Collects the poses the registry reports on each tick.
#[derive(Clone, Default)]
struct PoseCollector {
    poses: Arc<Mutex<Vec<(EndpointId, Vector3<f64>)>>>,
}

impl PoseCollector {
    fn take(&self) -> Vec<(EndpointId, Vector3<f64>)> {
        std::mem::take(&mut *self.poses.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl PoseObserver for PoseCollector {
    fn on_pose(
        &mut self,
        endpoint: EndpointId,
        position: Vector3<f64>,
        _orientation: UnitQuaternion<f64>,
        _now: f64,
    ) {
        self.poses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((endpoint, position));
    }
}

/// Scenario-specific traffic shaping.
#[derive(Debug, Clone, Default)]
struct Setup {
    tags: Vec<GroundTruthTag>,
    /// Upper bound of the random extra delay added to each fix datagram
    extra_fix_delay: f64,
    jumps: Option<(f64, f64)>,
    /// (period, length) of optical outages
    occlusion: Option<(f64, f64)>,
    /// (start, length) of a render stall
    stall: Option<(f64, f64)>,
    /// All fixes of one capture share a datagram
    batch_fixes: bool,
    gateway_clock_offset: f64,
    position_time_source: PositionTimeSource,
}

impl Setup {
    fn occluded(&self, t: f64) -> bool {
        self.occlusion
            .map(|(period, length)| t % period >= period - length)
            .unwrap_or(false)
    }

    fn stalled(&self, t: f64) -> bool {
        self.stall
            .map(|(start, length)| t >= start && t < start + length)
            .unwrap_or(false)
    }
}

/// A datagram in flight: (arrival ns, sequence, payload).
type Delivery = Reverse<(u64, u64, Vec<u8>)>;

/// Runs replay scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Render tick rate in Hz
    render_rate_hz: f64,

    /// IMU sample rate in Hz
    imu_rate_hz: f64,

    /// Optical fix rate in Hz
    position_rate_hz: f64,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Estimates before this time are not scored
    warmup_secs: f64,

    /// Optical pipeline delay
    position_latency: f64,

    /// Radio delay of IMU datagrams
    transport_latency: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            render_rate_hz: 90.0,
            imu_rate_hz: 100.0,
            position_rate_hz: 30.0,
            max_duration_secs: 10.0,
            warmup_secs: 0.5,
            position_latency: 0.065,
            transport_latency: 0.002,
        }
    }

    /// Sets the render tick rate.
    pub fn with_render_rate(mut self, hz: f64) -> Self {
        self.render_rate_hz = hz;
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and records every render frame.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.execute(scenario, Some(&mut export));
        export.finalize(result.passed, Some(result.report.global_metrics.rmse()));
        (result, export)
    }

    fn setup(&self, scenario: ScenarioId) -> Setup {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ 0x5eed_c10c);
        let wrap = 65_536.0 / DEVICE_TICKS_PER_SECOND;

        let mut circle_tag = |uid: u16, version, radius: f64, phase: f64| {
            let mut tag = GroundTruthTag::new(
                TagUid(uid),
                version,
                Motion::Circle {
                    center: Vector3::new(0.0, 1.2, 0.0),
                    radius,
                    angular_speed: 1.0,
                    phase,
                },
            );
            tag.yaw_rate = 20.0;
            tag.clock_offset = rng.gen_range(0.0..wrap);
            tag
        };

        let mut setup = Setup {
            tags: vec![circle_tag(0x0101, DeviceVersion::V3, 1.0, 0.0)],
            ..Setup::default()
        };

        match scenario {
            ScenarioId::Steady => {}
            ScenarioId::LateFixes => setup.extra_fix_delay = 0.04,
            ScenarioId::Jumpy => setup.jumps = Some((0.1, 0.4)),
            ScenarioId::Occlusion => setup.occlusion = Some((3.0, 0.8)),
            ScenarioId::ClockWrap => {
                for tag in &mut setup.tags {
                    tag.clock_offset = wrap - 0.5;
                }
                setup.gateway_clock_offset = wrap - 0.5;
                setup.position_time_source = PositionTimeSource::Device;
            }
            ScenarioId::Overload => setup.stall = Some((3.0, 0.25)),
            ScenarioId::Crowd => {
                let versions = [DeviceVersion::V2, DeviceVersion::V3, DeviceVersion::Gun];
                setup.tags = (0..6u16)
                    .map(|i| {
                        circle_tag(
                            0x0201 + i,
                            versions[usize::from(i) % versions.len()],
                            0.5 + 0.2 * f64::from(i),
                            f64::from(i) * TAU / 6.0,
                        )
                    })
                    .collect();
                setup.batch_fixes = true;
            }
        }
        setup
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
            report: ValidationSession::new().generate_report(),
        }
    }

    fn execute(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("{}", scenario.description());

        let setup = self.setup(scenario);
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut delivery_rng = ChaCha8Rng::seed_from_u64(self.seed);

        // Oracle
        let mut oracle = Oracle::new(physics_seed);
        oracle.set_gateway_clock_offset(setup.gateway_clock_offset);
        if let Some((probability, distance)) = setup.jumps {
            oracle.set_jumps(probability, distance);
        }
        for tag in &setup.tags {
            oracle.spawn_tag(tag.clone());
        }

        // Tracker
        let mut config = TrackerConfig::default();
        config.endpoint.position_latency = self.position_latency;
        config.endpoint.position_time_source = setup.position_time_source;
        config.tags = setup
            .tags
            .iter()
            .map(|t| TagConfig::new(t.uid.0, t.version))
            .collect();
        if let Err(e) = config.validate() {
            return self.failed(scenario, format!("invalid tracker config: {}", e));
        }
        let mut registry = config.build_registry();
        let collector = PoseCollector::default();
        registry.add_observer(Box::new(collector.clone()));

        // Receive side
        let clock = SimClock::shared();
        let (_feed, transport) = ChannelTransport::pair();
        let receiver = Receiver::new(
            Arc::clone(&clock),
            Arc::new(transport),
            registry.inbox_sender(),
            ReceiverConfig::default(),
        );

        let mut session = ValidationSession::with_warmup(self.warmup_secs);
        let mut metrics = ScenarioMetrics::default();
        let mut in_flight: BinaryHeap<Delivery> = BinaryHeap::new();
        let mut sequence = 0u64;
        let mut schedule = |heap: &mut BinaryHeap<Delivery>, arrival: f64, payload: Vec<u8>| {
            heap.push(Reverse(((arrival * 1e9).round() as u64, sequence, payload)));
            sequence += 1;
        };

        let imu_period = 1.0 / self.imu_rate_hz;
        let fix_period = 1.0 / self.position_rate_hz;
        let render_period = 1.0 / self.render_rate_hz;
        let (mut next_imu, mut next_fix, mut next_render) = (0.0, 0.0, 0.0);
        let mut was_occluded = false;
        let mut was_stalled = false;
        let mut events: Vec<SimEvent> = Vec::new();
        let mut total_ticks = 0u64;

        let total_steps = (self.max_duration_secs * 1000.0).round() as u64;
        for step in 0..=total_steps {
            let t = step as f64 / 1000.0;
            let t_ns = step * 1_000_000;
            oracle.set_time(t);

            // IMU samples
            if t + 1e-9 >= next_imu {
                next_imu += imu_period;
                let uids: Vec<TagUid> = oracle.active_tags().iter().map(|tag| tag.uid).collect();
                for uid in uids {
                    if let Some(reading) = oracle.imu_reading(uid) {
                        let arrival = t + self.transport_latency + delivery_rng.gen_range(0.0..0.001);
                        schedule(&mut in_flight, arrival, reading.encode());
                        metrics.imu_sent += 1;
                    }
                }
            }

            // Optical fixes
            if t + 1e-9 >= next_fix {
                next_fix += fix_period;
                let occluded = setup.occluded(t);
                if occluded != was_occluded {
                    events.push(SimEvent::info(if occluded {
                        "optical fixes lost"
                    } else {
                        "optical fixes restored"
                    }));
                    was_occluded = occluded;
                }
                if !occluded {
                    let readings = oracle.position_readings();
                    metrics.fixes_sent += readings.len() as u64;
                    metrics.jumps_injected += readings.iter().filter(|r| r.is_jump).count() as u64;

                    let batches: Vec<&[_]> = if setup.batch_fixes {
                        vec![&readings[..]]
                    } else {
                        readings.chunks(1).collect()
                    };
                    for batch in batches.into_iter().filter(|b| !b.is_empty()) {
                        let extra = if setup.extra_fix_delay > 0.0 {
                            delivery_rng.gen_range(0.0..setup.extra_fix_delay)
                        } else {
                            0.0
                        };
                        match encode_positions(batch) {
                            Ok(payload) => {
                                schedule(&mut in_flight, t + self.position_latency + extra, payload)
                            }
                            Err(e) => warn!(error = %e, "Failed to encode fixes"),
                        }
                    }
                }
            }

            // Deliveries
            while in_flight
                .peek()
                .map(|Reverse((arrival, _, _))| *arrival <= t_ns)
                .unwrap_or(false)
            {
                if let Some(Reverse((arrival, _, payload))) = in_flight.pop() {
                    clock.set_time(arrival);
                    receiver.dispatch(&payload, clock.now_secs());
                }
            }

            // Render tick
            if t + 1e-9 < next_render {
                continue;
            }
            next_render += render_period;

            let stalled = setup.stalled(t);
            if stalled != was_stalled {
                if stalled {
                    warn!(t, "Render loop stalled");
                    events.push(SimEvent::warn("render loop stalled"));
                } else {
                    events.push(SimEvent::info("render loop resumed"));
                }
                was_stalled = stalled;
            }
            if stalled {
                continue;
            }

            clock.set_time(t_ns);
            let now = clock.now_secs();
            registry.tick(now);
            let poses = collector.take();
            total_ticks += 1;

            let truths: Vec<(EndpointId, Vector3<f64>)> = oracle
                .active_tags()
                .iter()
                .map(|tag| (tag.endpoint(), tag.motion.position(now)))
                .collect();
            for (endpoint, truth) in &truths {
                match poses.iter().find(|(id, _)| id == endpoint) {
                    Some((_, estimate)) => session.record_estimate(*endpoint, *estimate, *truth, now),
                    None if now >= self.warmup_secs => session.record_missing(*endpoint),
                    None => {}
                }
            }
            session.end_frame();

            if let Some(export) = export.as_deref_mut() {
                export.add_frame(SimFrame {
                    time_sec: now,
                    ground_truth: truths
                        .iter()
                        .map(|(id, p)| TagPosition::new(id, *p))
                        .collect(),
                    estimates: poses.iter().map(|(id, p)| TagPosition::new(id, *p)).collect(),
                    events: std::mem::take(&mut events),
                });
            }
        }

        for id in registry.endpoint_ids() {
            if let Some(endpoint) = registry.endpoint(id) {
                let stats = endpoint.stats();
                metrics.jumps_detected += stats.jumps;
                metrics.dropped += stats.dropped;
                session.record_stats(id, stats);
            }
        }
        let receiver_stats = receiver.stats();
        metrics.datagrams = receiver_stats.datagrams;
        metrics.decode_errors = receiver_stats.decode_errors;
        metrics.overwritten = receiver_stats.overwritten;

        let report = session.generate_report();
        let failure_reason = self.check(scenario, &report, &metrics);
        let passed = failure_reason.is_none();

        info!(
            scenario = scenario.name(),
            rmse = report.global_metrics.rmse(),
            max_error = report.global_metrics.global_max_error,
            coverage = report.global_metrics.coverage(),
            passed,
            "Scenario finished"
        );

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks,
            final_time_secs: self.max_duration_secs,
            failure_reason,
            metrics,
            report,
        }
    }

    fn check(
        &self,
        scenario: ScenarioId,
        report: &ValidationReport,
        metrics: &ScenarioMetrics,
    ) -> Option<String> {
        let criteria = scenario.criteria();
        let g = &report.global_metrics;

        if metrics.decode_errors > 0 {
            return Some(format!("{} datagrams failed to decode", metrics.decode_errors));
        }
        if !report.passes_criteria(criteria.max_rmse, criteria.min_coverage) {
            return Some(format!(
                "RMSE {:.3} m (max {:.3}), coverage {:.1}% (min {:.1}%)",
                g.rmse(),
                criteria.max_rmse,
                g.coverage(),
                criteria.min_coverage
            ));
        }
        match scenario {
            ScenarioId::Jumpy if metrics.jumps_injected > 0 && metrics.jumps_detected == 0 => {
                Some(format!("{} jumps injected, none detected", metrics.jumps_injected))
            }
            ScenarioId::Overload if metrics.overwritten == 0 => {
                Some("stall did not overflow any handoff queue".to_string())
            }
            _ => None,
        }
    }
}
