//! Clock interface for the tracking client.

use std::time::Duration;

/// The monotonic local time axis every measurement is placed on.
///
/// # Implementations
///
/// - **Production**: `SystemClock` - wraps `std::time::Instant`
/// - **Replay**: a manually advanced clock in the simulation harness
///
/// The receive context stamps arrival times with this clock and the render
/// context queries poses with it, so both sides must share one instance.
pub trait TrackerClock: Send + Sync + 'static {
    /// Returns the time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Returns [`TrackerClock::now`] as fractional seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}
