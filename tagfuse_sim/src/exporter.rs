//! JSON exporter for replay runs.
//!
//! Exports ground truth and tracker output per render frame so a run can be
//! plotted offline.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A single render frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// True tag positions
    pub ground_truth: Vec<TagPosition>,

    /// Tracker output per endpoint
    pub estimates: Vec<TagPosition>,

    /// Events (occlusion, stalls, ...)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

/// Position of a tag or endpoint, keyed by its display id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPosition {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl TagPosition {
    pub fn new(id: impl ToString, pos: Vector3<f64>) -> Self {
        Self {
            id: id.to_string(),
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    /// Final RMS error if applicable
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_rms_error: Option<f64>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            final_rms_error: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, rms_error: Option<f64>) {
        self.passed = passed;
        self.final_rms_error = rms_error;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_json_shape() {
        let mut export = SimExport::new("steady", 7);
        export.add_frame(SimFrame {
            time_sec: 0.5,
            ground_truth: vec![TagPosition::new("01:02", Vector3::new(1.0, 2.0, 3.0))],
            estimates: Vec::new(),
            events: vec![SimEvent::warn("stall")],
        });
        export.finalize(true, Some(0.01));

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["duration_sec"], 0.5);
        assert_eq!(json["frames"][0]["ground_truth"][0]["id"], "01:02");
        assert_eq!(json["frames"][0]["events"][0]["level"], "warn");

        let back: SimExport = serde_json::from_value(json).unwrap();
        assert_eq!(back.frames.len(), 1);
    }
}
