//! NTP time base for timetags.
//!
//! OSC timetags count seconds since 1900-01-01 UTC. The clock anchors a
//! monotonic `Instant` against the wall clock once at construction, so
//! timetags derived later cannot jump when the system clock is adjusted.
//! The session owns its clock; there is no process-wide anchor.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rosc::OscTime;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Monotonic-anchored NTP clock.
#[derive(Debug, Clone)]
pub struct NtpClock {
    anchor: Instant,
    anchor_ntp: f64,
}

impl NtpClock {
    /// Anchor "now" against the wall clock.
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            anchor: Instant::now(),
            anchor_ntp: wall + NTP_UNIX_OFFSET as f64,
        }
    }

    /// Anchor "now" to a caller-chosen NTP time. Used by tests and by
    /// `resume`, which re-anchors audio clock zero.
    pub fn with_start(anchor_ntp: f64) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ntp,
        }
    }

    /// Current NTP time in seconds.
    pub fn now(&self) -> f64 {
        self.anchor_ntp + self.anchor.elapsed().as_secs_f64()
    }

    /// The NTP time this clock maps to its monotonic zero.
    pub fn start_ntp(&self) -> f64 {
        self.anchor_ntp
    }

    /// Monotonic seconds since the anchor.
    pub fn elapsed_secs(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }

    /// Timetag for `offset_secs` from now.
    pub fn time_from_now(&self, offset_secs: f64) -> OscTime {
        ntp_to_timetag(self.now() + offset_secs)
    }

    /// Sleep-free helper for tests: an instant `duration` in the future
    /// expressed as NTP.
    pub fn after(&self, duration: Duration) -> f64 {
        self.now() + duration.as_secs_f64()
    }
}

impl Default for NtpClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The immediate timetag (0, 1): execute as soon as received.
pub fn immediate() -> OscTime {
    OscTime {
        seconds: 0,
        fractional: 1,
    }
}

/// Split an NTP f64 into the wire pair.
pub fn ntp_to_timetag(ntp: f64) -> OscTime {
    let seconds = ntp.floor() as u64 as u32;
    let fractional = (ntp.fract() * (u32::MAX as f64 + 1.0)) as u32;
    OscTime {
        seconds,
        fractional,
    }
}

/// Join a wire pair into an NTP f64.
pub fn timetag_to_ntp(seconds: u32, fractional: u32) -> f64 {
    seconds as f64 + fractional as f64 / (u32::MAX as f64 + 1.0)
}
