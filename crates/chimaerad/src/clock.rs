//! Network time to audio frame conversion
//!
//! Devices stamp their packets with NTP time tags taken from the wall clock.
//! The audio server counts in its own hardware ticks. Every sampling interval
//! the synchronizer reads both clocks back to back; the two most recent
//! samples give the drift rate (ticks per wall-clock second), and a time tag
//! is projected from the latest sample through that rate to ticks, then to an
//! absolute frame by the audio server.
//!
//! Frame 0 is reserved to mean "as soon as possible", so a real time that
//! lands on frame 0 is reported as frame 1.

use std::sync::{Arc, RwLock};

use chimaeraproto::time::{self, NTP_UNIX_OFFSET};
use chimaeraproto::OscTime;
use chrono::Utc;
use thiserror::Error;

/// Frame value meaning "emit at the start of the next cycle".
pub const IMMEDIATE_FRAME: u64 = 0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    /// One of the clocks stood still or went backwards between samples.
    #[error("clock step: {d_ticks} ticks over {d_wall:.6} s")]
    Step { d_ticks: f64, d_wall: f64 },

    #[error("drift rate {0:.1} ticks/s outside tolerance")]
    RateOutOfBounds(f64),

    #[error("clock state lock poisoned")]
    Poisoned,
}

/// Hardware clock of the audio server.
pub trait FrameClock: Send + Sync {
    /// Current hardware clock value in microseconds.
    fn ticks(&self) -> u64;

    /// Absolute frame position at hardware time `ticks`.
    fn ticks_to_frames(&self, ticks: u64) -> u64;

    fn sample_rate(&self) -> u32;
}

/// Host wall clock as NTP seconds.
pub fn wall_now() -> f64 {
    let now = Utc::now();
    (now.timestamp() + NTP_UNIX_OFFSET as i64) as f64
        + f64::from(now.timestamp_subsec_nanos()) / 1e9
}

/// Simultaneous reading of both clocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub ticks: u64,
    /// NTP seconds.
    pub wall: f64,
}

/// Drift-corrected mapping from wall-clock time to hardware ticks.
#[derive(Debug, Clone)]
pub struct ClockSync {
    previous: Option<ClockSample>,
    latest: Option<ClockSample>,
    /// Ticks per wall-clock second.
    rate: f64,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    /// Nominal rate of a microsecond hardware clock.
    pub const NOMINAL_RATE: f64 = 1_000_000.0;

    pub fn new() -> Self {
        Self {
            previous: None,
            latest: None,
            rate: Self::NOMINAL_RATE,
        }
    }

    /// Largest accepted deviation of the measured rate from nominal.
    pub const RATE_TOLERANCE: f64 = 0.1;

    /// Record a fresh pair and update the rate estimate.
    ///
    /// The pair is always kept as the new anchor. An error means the rate
    /// estimate was left unchanged.
    pub fn record(&mut self, sample: ClockSample) -> Result<(), ClockError> {
        let result = match self.latest {
            Some(latest) => Self::measure(latest, sample).map(|rate| self.rate = rate),
            None => Ok(()),
        };
        self.previous = self.latest;
        self.latest = Some(sample);
        result
    }

    fn measure(from: ClockSample, to: ClockSample) -> Result<f64, ClockError> {
        let d_wall = to.wall - from.wall;
        let d_ticks = to.ticks as f64 - from.ticks as f64;
        if d_wall <= 0.0 || d_ticks <= 0.0 {
            return Err(ClockError::Step { d_ticks, d_wall });
        }
        let rate = d_ticks / d_wall;
        if (rate / Self::NOMINAL_RATE - 1.0).abs() >= Self::RATE_TOLERANCE {
            return Err(ClockError::RateOutOfBounds(rate));
        }
        Ok(rate)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn latest(&self) -> Option<ClockSample> {
        self.latest
    }

    /// The sample before `latest`; no older history is kept.
    pub fn previous(&self) -> Option<ClockSample> {
        self.previous
    }

    /// Hardware ticks at wall time `wall` (NTP seconds).
    pub fn wall_to_ticks(&self, wall: f64) -> Option<u64> {
        let anchor = self.latest?;
        let ticks = anchor.ticks as f64 + (wall - anchor.wall) * self.rate;
        Some(ticks.max(0.0) as u64)
    }

    /// Frame at which an event stamped `time` should sound.
    pub fn desync(&self, time: &OscTime, clock: &dyn FrameClock) -> u64 {
        if time::is_immediate(time) {
            return IMMEDIATE_FRAME;
        }
        let Some(ticks) = self.wall_to_ticks(time::to_ntp_seconds(time)) else {
            return IMMEDIATE_FRAME;
        };
        clock.ticks_to_frames(ticks).max(1)
    }
}

/// Cloneable handle shared by the main loop (which samples) and device
/// workers (which convert).
#[derive(Clone)]
pub struct Desync {
    sync: Arc<RwLock<ClockSync>>,
    clock: Arc<dyn FrameClock>,
}

impl Desync {
    pub fn new(clock: Arc<dyn FrameClock>) -> Self {
        Self {
            sync: Arc::new(RwLock::new(ClockSync::new())),
            clock,
        }
    }

    /// Read both clocks and record the pair.
    pub fn sample(&self) -> Result<ClockSample, ClockError> {
        let sample = ClockSample {
            ticks: self.clock.ticks(),
            wall: wall_now(),
        };
        self.sync
            .write()
            .map_err(|_| ClockError::Poisoned)?
            .record(sample)?;
        Ok(sample)
    }

    pub fn frame_for(&self, time: &OscTime) -> u64 {
        match self.sync.read() {
            Ok(sync) => sync.desync(time, self.clock.as_ref()),
            Err(_) => IMMEDIATE_FRAME,
        }
    }

    pub fn rate(&self) -> f64 {
        self.sync.read().map(|s| s.rate()).unwrap_or(ClockSync::NOMINAL_RATE)
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    pub fn clock(&self) -> &Arc<dyn FrameClock> {
        &self.clock
    }
}

impl std::fmt::Debug for Desync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Desync").field("rate", &self.rate()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimaeraproto::time::{from_ntp_seconds, IMMEDIATE};

    /// Microsecond ticks, 48 kHz, frame 0 at tick 0.
    struct LinearClock;

    impl FrameClock for LinearClock {
        fn ticks(&self) -> u64 {
            0
        }

        fn ticks_to_frames(&self, ticks: u64) -> u64 {
            ticks * 48 / 1000
        }

        fn sample_rate(&self) -> u32 {
            48_000
        }
    }

    const WALL0: f64 = 3_900_000_000.0;

    fn synced() -> ClockSync {
        let mut sync = ClockSync::new();
        sync.record(ClockSample {
            ticks: 1_000_000,
            wall: WALL0,
        })
        .unwrap();
        sync.record(ClockSample {
            ticks: 1_500_000,
            wall: WALL0 + 0.5,
        })
        .unwrap();
        sync
    }

    #[test]
    fn test_immediate_is_frame_zero() {
        let sync = synced();
        assert_eq!(sync.desync(&IMMEDIATE, &LinearClock), IMMEDIATE_FRAME);
    }

    #[test]
    fn test_unsynced_clock_treats_everything_as_immediate() {
        let sync = ClockSync::new();
        let t = from_ntp_seconds(WALL0);
        assert_eq!(sync.desync(&t, &LinearClock), IMMEDIATE_FRAME);
    }

    #[test]
    fn test_projection_from_latest_sample() {
        let sync = synced();
        assert!((sync.rate() - 1_000_000.0).abs() < 1e-3);

        // 0.25 s after the latest sample: 1.75 s of ticks -> 84000 frames
        let t = from_ntp_seconds(WALL0 + 0.75);
        let frame = sync.desync(&t, &LinearClock);
        assert!((83_999..=84_001).contains(&frame), "frame {}", frame);
    }

    #[test]
    fn test_drift_rate_tracks_samples() {
        let mut sync = ClockSync::new();
        sync.record(ClockSample { ticks: 0, wall: WALL0 }).unwrap();
        sync.record(ClockSample {
            ticks: 1_001_000,
            wall: WALL0 + 1.0,
        })
        .unwrap();
        assert!((sync.rate() - 1_001_000.0).abs() < 1.0);
    }

    #[test]
    fn test_clock_step_keeps_previous_rate() {
        let mut sync = synced();
        let result = sync.record(ClockSample {
            ticks: 1_600_000,
            wall: WALL0 + 30.0,
        });
        assert!(matches!(result, Err(ClockError::RateOutOfBounds(_))));
        assert!((sync.rate() - 1_000_000.0).abs() < 1e-3);
        assert_eq!(sync.latest().map(|s| s.ticks), Some(1_600_000));
        assert_eq!(sync.previous().map(|s| s.ticks), Some(1_500_000));
    }

    #[test]
    fn test_desync_is_monotonic() {
        let sync = synced();
        let mut last = 0;
        for step in 0..2000 {
            let t = from_ntp_seconds(WALL0 - 1.0 + step as f64 * 0.001);
            let frame = sync.desync(&t, &LinearClock);
            assert!(frame >= last, "step {} went backwards", step);
            last = frame;
        }
    }

    #[test]
    fn test_real_time_never_maps_to_zero() {
        let sync = synced();
        let long_ago = from_ntp_seconds(WALL0 - 100.0);
        assert_eq!(sync.desync(&long_ago, &LinearClock), 1);
    }

    #[test]
    fn test_frozen_clock_is_a_step() {
        let mut sync = synced();
        let result = sync.record(ClockSample {
            ticks: 1_500_000,
            wall: WALL0 + 1.0,
        });
        assert!(matches!(result, Err(ClockError::Step { .. })));
    }

    #[test]
    fn test_wall_now_is_ntp_era() {
        assert!(wall_now() > NTP_UNIX_OFFSET as f64);
    }
}
