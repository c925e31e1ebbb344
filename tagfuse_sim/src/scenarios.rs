//! Replay scenarios.

/// Acceptance thresholds for a scenario.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Criteria {
    /// Largest acceptable RMS position error (meters)
    pub max_rmse: f64,
    /// Smallest acceptable share of frames with an estimate (percent)
    pub min_coverage: f64,
}

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// One tag on a circle, clean delivery
    Steady,

    /// Fixes delayed by a random extra latency, so some arrive out of order
    LateFixes,

    /// A share of fixes displaced far enough to count as jumps
    Jumpy,

    /// Optical fixes lost periodically; IMU keeps reporting
    Occlusion,

    /// Device and gateway clocks start just before a wrap
    ClockWrap,

    /// Render loop stalls long enough for handoff queues to overflow
    Overload,

    /// Many tags sharing gateway datagrams
    Crowd,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Steady,
            ScenarioId::LateFixes,
            ScenarioId::Jumpy,
            ScenarioId::Occlusion,
            ScenarioId::ClockWrap,
            ScenarioId::Overload,
            ScenarioId::Crowd,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "steady",
            ScenarioId::LateFixes => "late_fixes",
            ScenarioId::Jumpy => "jumpy",
            ScenarioId::Occlusion => "occlusion",
            ScenarioId::ClockWrap => "clock_wrap",
            ScenarioId::Overload => "overload",
            ScenarioId::Crowd => "crowd",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "1 tag on a 1 m circle at 1 rad/s, 30 Hz fixes, 100 Hz IMU",
            ScenarioId::LateFixes => "Fixes delayed by an extra 0-40 ms, reordered in transit",
            ScenarioId::Jumpy => "10% of fixes displaced by 0.4 m",
            ScenarioId::Occlusion => "Optical fixes lost for 0.8 s every 3 s",
            ScenarioId::ClockWrap => "Clocks start 0.5 s before wrap, gateway time source",
            ScenarioId::Overload => "Render loop stalls for 250 ms, queues overflow",
            ScenarioId::Crowd => "6 tags, fixes batched into shared datagrams",
        }
    }

    pub fn criteria(&self) -> Criteria {
        let (max_rmse, min_coverage) = match self {
            ScenarioId::Steady => (0.08, 99.0),
            ScenarioId::LateFixes => (0.12, 99.0),
            ScenarioId::Jumpy => (0.15, 99.0),
            ScenarioId::Occlusion => (0.6, 99.0),
            ScenarioId::ClockWrap => (0.1, 99.0),
            ScenarioId::Overload => (0.4, 95.0),
            ScenarioId::Crowd => (0.1, 99.0),
        };
        Criteria {
            max_rmse,
            min_coverage,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "steady" => Ok(ScenarioId::Steady),
            "late_fixes" | "latefixes" | "late" => Ok(ScenarioId::LateFixes),
            "jumpy" | "jumps" => Ok(ScenarioId::Jumpy),
            "occlusion" => Ok(ScenarioId::Occlusion),
            "clock_wrap" | "clockwrap" | "wrap" => Ok(ScenarioId::ClockWrap),
            "overload" => Ok(ScenarioId::Overload),
            "crowd" => Ok(ScenarioId::Crowd),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
