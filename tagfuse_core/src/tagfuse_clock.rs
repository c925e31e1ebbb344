//! The "CLOCK" Engine - Device Timestamp Unwrapping and Synchronization
//!
//! Tags stamp inertial samples with a 16-bit counter (1 tick = 100 µs) that
//! wraps every 6.5536 s and runs on its own oscillator. This module turns
//! that counter into a continuous timestamp on the local monotonic axis:
//!
//! 1. **Unwrap**: count wraps so the device time keeps increasing
//! 2. **Synchronize**: add a moving-average offset between local arrival
//!    time and device time, which absorbs both the clock offset and slow
//!    drift while averaging out network jitter

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Device counter ticks per second.
pub const DEVICE_TICKS_PER_SECOND: f64 = 10_000.0;

/// Configuration for [`ClockSync`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Wrap period of the device counter in seconds (default: 6.5536 = 2^16 ticks)
    pub modulo: f64,

    /// Number of offset samples in the moving average (default: 20)
    pub window: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            modulo: 65_536.0 / DEVICE_TICKS_PER_SECOND,
            window: 20,
        }
    }
}

/// Converts wrapping device timestamps onto the local time axis.
#[derive(Debug, Clone)]
pub struct ClockSync {
    config: ClockConfig,

    /// How many times the device counter wrapped so far
    wrap_count: u64,

    /// Newest unwrapped device timestamp seen (before offset correction)
    last_unwrapped: Option<f64>,

    /// Local arrival time of the newest sample
    last_arrival: f64,

    /// Output of the previous `correct` call
    last_corrected: f64,

    /// Recent `local - device` offsets, newest at the back
    offsets: VecDeque<f64>,

    /// Mean of `offsets`
    offset_avg: f64,
}

impl ClockSync {
    pub fn new(config: ClockConfig) -> Self {
        let window = config.window.max(1);
        Self {
            config: ClockConfig { window, ..config },
            wrap_count: 0,
            last_unwrapped: None,
            last_arrival: 0.0,
            last_corrected: 0.0,
            offsets: VecDeque::with_capacity(window),
            offset_avg: 0.0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClockConfig::default())
    }

    /// Converts a raw 16-bit tick count to seconds.
    pub fn ticks_to_seconds(ticks: u16) -> f64 {
        f64::from(ticks) / DEVICE_TICKS_PER_SECOND
    }

    /// Corrects a raw tick counter reading. See [`ClockSync::correct`].
    pub fn correct_ticks(&mut self, ticks: u16, local_now: f64) -> f64 {
        self.correct(Self::ticks_to_seconds(ticks), local_now)
    }

    /// Maps a raw device timestamp (seconds, wrapping at `modulo`) onto the
    /// local time axis.
    ///
    /// `local_now` is the local monotonic time at which the sample arrived.
    /// Never fails; with a single offset sample the average is that sample.
    pub fn correct(&mut self, raw: f64, local_now: f64) -> f64 {
        let unwrapped = self.unwrap(raw, local_now);

        if self.offsets.len() == self.config.window {
            self.offsets.pop_front();
        }
        self.offsets.push_back(local_now - unwrapped);
        self.offset_avg = self.offsets.iter().sum::<f64>() / self.offsets.len() as f64;

        self.last_corrected = unwrapped + self.offset_avg;
        self.last_corrected
    }

    /// Current moving-average offset (local minus device time).
    pub fn offset(&self) -> f64 {
        self.offset_avg
    }

    /// Number of counter wraps detected so far.
    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    /// Output of the most recent [`ClockSync::correct`] call.
    pub fn last_corrected(&self) -> f64 {
        self.last_corrected
    }

    /// Forgets wraps and offsets, e.g. after a tag reboots.
    pub fn reset(&mut self) {
        self.wrap_count = 0;
        self.last_unwrapped = None;
        self.last_arrival = 0.0;
        self.last_corrected = 0.0;
        self.offsets.clear();
        self.offset_avg = 0.0;
    }

    fn unwrap(&mut self, raw: f64, local_now: f64) -> f64 {
        let modulo = self.config.modulo;
        let half = modulo / 2.0;
        let mut unwrapped = raw + self.wrap_count as f64 * modulo;

        let Some(last) = self.last_unwrapped else {
            self.last_unwrapped = Some(unwrapped);
            self.last_arrival = local_now;
            return unwrapped;
        };

        // After a silence longer than half a period the counter alone is
        // ambiguous; pick the period closest to the locally expected time.
        let silence = local_now - self.last_arrival;
        self.last_arrival = self.last_arrival.max(local_now);
        if silence > half && !self.offsets.is_empty() {
            let expected = local_now - self.offset_avg;
            let periods = ((expected - raw) / modulo).round().max(0.0) as u64;
            self.wrap_count = self.wrap_count.max(periods);
            let unwrapped = raw + periods as f64 * modulo;
            if unwrapped > last {
                self.last_unwrapped = Some(unwrapped);
            }
            return unwrapped;
        }

        while unwrapped < last - half {
            self.wrap_count += 1;
            unwrapped += modulo;
        }

        // Late sample from before the most recent wrap.
        if self.wrap_count > 0 && unwrapped - last > half {
            return unwrapped - modulo;
        }

        if unwrapped > last {
            self.last_unwrapped = Some(unwrapped);
        }
        unwrapped
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::with_defaults()
    }
}
