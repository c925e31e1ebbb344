//! Validation Module - Ground Truth Comparison for Replayed Sessions
//! ==================================================================
//!
//! Scores the tracker's per-frame estimates against the ground-truth
//! trajectory of a replayed session.
//!
//! Key metrics:
//! - Position error (RMSE, max error) per endpoint and overall
//! - Jitter (largest frame-to-frame step of the estimate)
//! - Jump count (fixes discarded as jumps)
//! - Coverage (frames with an estimate vs. frames evaluated)
//!
//! Usage:
//! ```ignore
//! use tagfuse_core::validation::ValidationSession;
//!
//! let mut session = ValidationSession::new();
//! session.record_estimate(endpoint, estimate, truth, now);
//! session.record_missing(other_endpoint);
//! session.end_frame();
//!
//! let report = session.generate_report();
//! report.print();
//! ```

use crate::endpoint::{EndpointId, EndpointStats};
use nalgebra::Vector3;
use serde::Serialize;
use std::collections::BTreeMap;

// =============================================================================
// VALIDATION METRICS
// =============================================================================

/// Per-endpoint validation statistics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetrics {
    /// Frames with an estimate for this endpoint
    pub estimate_count: usize,
    /// Frames where ground truth existed but no estimate did
    pub missed_frames: usize,
    /// Sum of squared position errors (for RMSE)
    pub error_sum_squared: f64,
    /// Maximum position error observed
    pub max_error: f64,
    /// Minimum position error observed
    pub min_error: f64,
    /// Largest distance between two consecutive estimates
    pub max_step: f64,
    /// Fixes the filter discarded as jumps
    pub jumps: u64,
    /// Fixes the filter dropped as duplicate or out of order
    pub dropped: u64,
    #[serde(skip)]
    last_estimate: Option<Vector3<f64>>,
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self {
            estimate_count: 0,
            missed_frames: 0,
            error_sum_squared: 0.0,
            max_error: 0.0,
            min_error: f64::MAX,
            max_step: 0.0,
            jumps: 0,
            dropped: 0,
            last_estimate: None,
        }
    }
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate RMSE (Root Mean Square Error)
    pub fn rmse(&self) -> f64 {
        if self.estimate_count > 0 {
            (self.error_sum_squared / self.estimate_count as f64).sqrt()
        } else {
            0.0
        }
    }

    /// Fraction of evaluated frames that had an estimate
    pub fn coverage(&self) -> f64 {
        let total = self.estimate_count + self.missed_frames;
        if total > 0 {
            self.estimate_count as f64 / total as f64
        } else {
            0.0
        }
    }

    fn record(&mut self, estimate: Vector3<f64>, error: f64) {
        self.estimate_count += 1;
        self.error_sum_squared += error * error;
        self.max_error = self.max_error.max(error);
        self.min_error = self.min_error.min(error);
        if let Some(last) = self.last_estimate {
            self.max_step = self.max_step.max((estimate - last).norm());
        }
        self.last_estimate = Some(estimate);
    }
}

/// Global validation metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMetrics {
    /// Total frames processed
    pub total_frames: usize,
    /// Total estimates across all endpoints
    pub total_estimates: usize,
    /// Total frames with ground truth but no estimate
    pub total_missed: usize,
    /// Sum of all position errors
    pub global_error_sum: f64,
    /// Sum of all squared position errors
    pub global_error_sum_squared: f64,
    /// Maximum error observed globally
    pub global_max_error: f64,
    /// Jumps discarded across all endpoints
    pub total_jumps: u64,
}

impl GlobalMetrics {
    /// Calculate global average error
    pub fn avg_error(&self) -> f64 {
        if self.total_estimates > 0 {
            self.global_error_sum / self.total_estimates as f64
        } else {
            0.0
        }
    }

    pub fn rmse(&self) -> f64 {
        if self.total_estimates > 0 {
            (self.global_error_sum_squared / self.total_estimates as f64).sqrt()
        } else {
            0.0
        }
    }

    /// Percentage of evaluated frames with an estimate
    pub fn coverage(&self) -> f64 {
        let total = self.total_estimates + self.total_missed;
        if total > 0 {
            self.total_estimates as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

// =============================================================================
// VALIDATION SESSION
// =============================================================================

/// Collects estimates against ground truth over a replayed session
#[derive(Debug, Default)]
pub struct ValidationSession {
    per_endpoint: BTreeMap<EndpointId, EndpointMetrics>,
    global: GlobalMetrics,
    /// Estimates are only scored from this time on (filter warm-up)
    warmup: f64,
}

impl ValidationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore estimates before `warmup` seconds.
    pub fn with_warmup(warmup: f64) -> Self {
        Self {
            warmup,
            ..Self::default()
        }
    }

    /// Record the estimate of `endpoint` at `now` against the true position.
    pub fn record_estimate(
        &mut self,
        endpoint: EndpointId,
        estimate: Vector3<f64>,
        truth: Vector3<f64>,
        now: f64,
    ) {
        if now < self.warmup {
            return;
        }
        let error = (estimate - truth).norm();
        self.per_endpoint
            .entry(endpoint)
            .or_default()
            .record(estimate, error);

        self.global.total_estimates += 1;
        self.global.global_error_sum += error;
        self.global.global_error_sum_squared += error * error;
        self.global.global_max_error = self.global.global_max_error.max(error);
    }

    /// Record a frame where `endpoint` had ground truth but no estimate.
    pub fn record_missing(&mut self, endpoint: EndpointId) {
        self.per_endpoint.entry(endpoint).or_default().missed_frames += 1;
        self.global.total_missed += 1;
    }

    /// Copy the filter's ingestion counters for `endpoint`.
    pub fn record_stats(&mut self, endpoint: EndpointId, stats: &EndpointStats) {
        let metrics = self.per_endpoint.entry(endpoint).or_default();
        metrics.jumps = stats.jumps;
        metrics.dropped = stats.dropped;
    }

    /// Mark end of frame
    pub fn end_frame(&mut self) {
        self.global.total_frames += 1;
    }

    pub fn endpoint(&self, endpoint: EndpointId) -> Option<&EndpointMetrics> {
        self.per_endpoint.get(&endpoint)
    }

    /// Generate final validation report
    pub fn generate_report(&self) -> ValidationReport {
        let mut global = self.global.clone();
        global.total_jumps = self.per_endpoint.values().map(|m| m.jumps).sum();
        ValidationReport {
            global_metrics: global,
            per_endpoint_metrics: self
                .per_endpoint
                .iter()
                .map(|(id, m)| (id.to_string(), m.clone()))
                .collect(),
        }
    }
}

// =============================================================================
// VALIDATION REPORT
// =============================================================================

/// Final validation report with all metrics
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub global_metrics: GlobalMetrics,
    /// Keyed by the endpoint's display form, e.g. `01:02/0`
    pub per_endpoint_metrics: BTreeMap<String, EndpointMetrics>,
}

impl ValidationReport {
    /// Print formatted report to console
    pub fn print(&self) {
        let g = &self.global_metrics;
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║               TAGFUSE VALIDATION REPORT                      ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ SUMMARY                                                      ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Total Frames:          {:>10}                           ║", g.total_frames);
        println!("║ Estimates:             {:>10}                           ║", g.total_estimates);
        println!("║ Missed:                {:>10}                           ║", g.total_missed);
        println!("║ Jumps Discarded:       {:>10}                           ║", g.total_jumps);
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ ACCURACY                                                     ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Average Error:         {:>10.3} m                         ║", g.avg_error());
        println!("║ RMSE:                  {:>10.3} m                         ║", g.rmse());
        println!("║ Max Error:             {:>10.3} m                         ║", g.global_max_error);
        println!("║ Coverage:              {:>10.1}%                          ║", g.coverage());
        println!("╚══════════════════════════════════════════════════════════════╝");

        if !self.per_endpoint_metrics.is_empty() {
            println!();
            println!("Per Endpoint:");
            println!("─────────────────────────────────────────────────────────────");
            println!("  Endpoint    Estimates    RMSE (m)    Max (m)    Step (m)  Jumps");
            println!("─────────────────────────────────────────────────────────────");
            for (id, m) in &self.per_endpoint_metrics {
                println!(
                    "  {:>8}    {:>9}    {:>8.3}    {:>7.3}    {:>8.3}  {:>5}",
                    id,
                    m.estimate_count,
                    m.rmse(),
                    m.max_error,
                    m.max_step,
                    m.jumps
                );
            }
        }
    }

    /// Check if validation passes acceptance criteria
    pub fn passes_criteria(&self, max_rmse: f64, min_coverage: f64) -> bool {
        self.global_metrics.total_estimates > 0
            && self.global_metrics.rmse() <= max_rmse
            && self.global_metrics.coverage() >= min_coverage
    }
}

// =============================================================================
// TESTS
// =============================================================================
