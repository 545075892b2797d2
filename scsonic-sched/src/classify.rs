//! Decides whether a datagram bypasses the prescheduler.
//!
//! Only far-future bundles are worth scheduling client-side; everything
//! else goes straight to the IN ring and lets the engine's own scheduler
//! sort out sub-lookahead timing.

use crate::ntp::timetag_to_ntp;

/// Leading bytes of every OSC bundle.
pub const BUNDLE_TAG: &[u8; 8] = b"#bundle\0";

/// Default bypass window in seconds.
pub const DEFAULT_BYPASS_LOOKAHEAD: f64 = 0.5;

/// Where a datagram lands relative to the bypass window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleCategory {
    /// A plain message (or a datagram too short to carry a timetag).
    NonBundle,
    /// Timetag (0, ≤1): execute on receipt.
    Immediate,
    /// Due within the bypass window.
    NearFuture,
    /// Execution time already passed.
    Late,
    /// Beyond the bypass window: must be scheduled.
    FarFuture,
}

impl BundleCategory {
    /// Everything except far-future skips the prescheduler.
    pub fn bypasses(self) -> bool {
        !matches!(self, BundleCategory::FarFuture)
    }

    /// Stable label for metrics attribution.
    pub fn label(self) -> &'static str {
        match self {
            BundleCategory::NonBundle => "nonBundle",
            BundleCategory::Immediate => "immediate",
            BundleCategory::NearFuture => "nearFuture",
            BundleCategory::Late => "late",
            BundleCategory::FarFuture => "farFuture",
        }
    }
}

/// Extract the raw (seconds, fraction) timetag of a bundle datagram.
/// `None` for non-bundles and undersized datagrams.
pub fn bundle_timetag(datagram: &[u8]) -> Option<(u32, u32)> {
    if datagram.len() < 16 || &datagram[..8] != BUNDLE_TAG {
        return None;
    }
    let seconds = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
    let fractional = u32::from_be_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]);
    Some((seconds, fractional))
}

/// Classify a datagram against the current NTP time. `now_ntp` is
/// caller-supplied; with no time base available everything executes
/// immediately.
pub fn classify(datagram: &[u8], now_ntp: Option<f64>, lookahead: f64) -> BundleCategory {
    let (seconds, fractional) = match bundle_timetag(datagram) {
        Some(tag) => tag,
        None => return BundleCategory::NonBundle,
    };

    if seconds == 0 && fractional <= 1 {
        return BundleCategory::Immediate;
    }

    let now = match now_ntp {
        Some(now) => now,
        None => return BundleCategory::Immediate,
    };

    let diff = timetag_to_ntp(seconds, fractional) - now;
    if diff < 0.0 {
        BundleCategory::Late
    } else if diff < lookahead {
        BundleCategory::NearFuture
    } else {
        BundleCategory::FarFuture
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntp::ntp_to_timetag;

    fn bundle_at(ntp: f64) -> Vec<u8> {
        let tag = ntp_to_timetag(ntp);
        let mut datagram = Vec::from(*BUNDLE_TAG);
        datagram.extend_from_slice(&tag.seconds.to_be_bytes());
        datagram.extend_from_slice(&tag.fractional.to_be_bytes());
        datagram
    }

    #[test]
    fn plain_message_is_non_bundle() {
        assert_eq!(
            classify(b"/status\0,\0\0\0", Some(1000.0), 0.5),
            BundleCategory::NonBundle
        );
    }

    #[test]
    fn truncated_bundle_is_non_bundle() {
        assert_eq!(
            classify(&BUNDLE_TAG[..], Some(1000.0), 0.5),
            BundleCategory::NonBundle
        );
    }

    #[test]
    fn zero_timetag_is_immediate() {
        let mut datagram = Vec::from(*BUNDLE_TAG);
        datagram.extend_from_slice(&0u32.to_be_bytes());
        datagram.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(
            classify(&datagram, Some(1000.0), 0.5),
            BundleCategory::Immediate
        );
    }

    #[test]
    fn missing_time_base_forces_immediate() {
        let datagram = bundle_at(5000.0);
        assert_eq!(classify(&datagram, None, 0.5), BundleCategory::Immediate);
    }

    #[test]
    fn boundaries_match_the_window() {
        let now = 1_000_000.0;
        let eps = 0.001;
        assert_eq!(
            classify(&bundle_at(now), Some(now), 0.5),
            BundleCategory::NearFuture,
            "diff = 0"
        );
        assert_eq!(
            classify(&bundle_at(now - eps), Some(now), 0.5),
            BundleCategory::Late
        );
        assert_eq!(
            classify(&bundle_at(now + 0.5 - eps), Some(now), 0.5),
            BundleCategory::NearFuture
        );
        assert_eq!(
            classify(&bundle_at(now + 0.5), Some(now), 0.5),
            BundleCategory::FarFuture
        );
    }

    #[test]
    fn only_far_future_is_scheduled() {
        assert!(BundleCategory::NonBundle.bypasses());
        assert!(BundleCategory::Immediate.bypasses());
        assert!(BundleCategory::NearFuture.bypasses());
        assert!(BundleCategory::Late.bypasses());
        assert!(!BundleCategory::FarFuture.bypasses());
    }
}
