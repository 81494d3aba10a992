//! Clock offset and latency estimation
//!
//! NTP-style round-trip exchanges against a reference peer. Each round
//! produces one `(t0, t1, t2)` triple; after the configured round count
//! the samples are aggregated into a single offset/latency estimate with
//! the worst-latency sample discarded to reject scheduling hiccups.

use std::time::Duration;

use thiserror::Error;

/// Calibration failures for a single peer. Isolated: one peer failing
/// never affects another peer's in-flight rounds or established offsets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("no sync reply within the retry budget")]
    RetriesExceeded,
    #[error("peer disconnected during calibration")]
    Disconnected,
}

/// Tunables for a calibration session.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Round-trip exchanges to average over.
    pub rounds: u32,
    /// How long to wait for each sync reply.
    pub reply_timeout: Duration,
    /// Additional attempts per round before the session fails.
    pub retry_cap: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rounds: 8,
            reply_timeout: Duration::from_millis(500),
            retry_cap: 3,
        }
    }
}

/// One round-trip measurement.
///
/// `t0`/`t2` are the local clock at send/receive; `t1` is the remote clock
/// when it answered. Nanoseconds throughout.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub t0: i64,
    pub t1: i64,
    pub t2: i64,
    /// remote - local, i.e. what must be added to the local clock to read
    /// the remote timeline.
    pub offset_ns: i64,
    /// One-way network delay, assuming a symmetric path.
    pub latency_ns: i64,
}

impl CalibrationSample {
    /// latency = (t2 - t0) / 2, offset = t1 - t0 - latency.
    /// Algebraically the two-timestamp NTP form ((t1-t0) + (t1-t2)) / 2.
    pub fn compute(t0: i64, t1: i64, t2: i64) -> Self {
        let latency_ns = ((t2 - t0) / 2).max(0);
        let offset_ns = t1 - t0 - latency_ns;
        Self {
            t0,
            t1,
            t2,
            offset_ns,
            latency_ns,
        }
    }
}

/// Where a peer is in its calibration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Calibrating,
    Calibrated,
    Failed,
}

/// Per-peer calibration state.
///
/// On the peer side this tracks the session against the host; on the host
/// side one record exists per peer that was asked to calibrate, filled in
/// when the peer reports completion.
#[derive(Debug)]
pub struct PeerCalibration {
    phase: CalibrationPhase,
    samples: Vec<CalibrationSample>,
    offset_ns: i64,
    latency_ns: i64,
}

impl PeerCalibration {
    /// A fresh record in the calibrating phase.
    pub fn new() -> Self {
        Self {
            phase: CalibrationPhase::Calibrating,
            samples: Vec::new(),
            offset_ns: 0,
            latency_ns: 0,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn is_calibrated(&self) -> bool {
        self.phase == CalibrationPhase::Calibrated
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn offset_ns(&self) -> i64 {
        self.offset_ns
    }

    pub fn latency_ns(&self) -> i64 {
        self.latency_ns
    }

    pub fn add_sample(&mut self, sample: CalibrationSample) {
        tracing::debug!(
            round = self.samples.len() + 1,
            offset_ns = sample.offset_ns,
            latency_ns = sample.latency_ns,
            "calibration sample"
        );
        self.samples.push(sample);
    }

    /// Aggregate the collected samples and transition to calibrated.
    ///
    /// Uses a trimmed mean: with more than two samples the one with the
    /// largest latency is discarded before averaging.
    pub fn finish(&mut self) -> (i64, i64) {
        let mut kept: Vec<&CalibrationSample> = self.samples.iter().collect();
        if kept.len() > 2 {
            if let Some(worst) = kept
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.latency_ns)
                .map(|(i, _)| i)
            {
                kept.remove(worst);
            }
        }

        if !kept.is_empty() {
            let n = kept.len() as i128;
            let offset_sum: i128 = kept.iter().map(|s| s.offset_ns as i128).sum();
            let latency_sum: i128 = kept.iter().map(|s| s.latency_ns as i128).sum();
            self.offset_ns = (offset_sum / n) as i64;
            self.latency_ns = (latency_sum / n) as i64;
        }

        self.phase = CalibrationPhase::Calibrated;
        (self.offset_ns, self.latency_ns)
    }

    /// Record completion reported by the remote side (host-side record).
    pub fn complete_reported(&mut self, offset_ns: i64, latency_ns: i64) {
        self.offset_ns = offset_ns;
        self.latency_ns = latency_ns;
        self.phase = CalibrationPhase::Calibrated;
    }

    pub fn fail(&mut self) {
        self.phase = CalibrationPhase::Failed;
    }
}

impl Default for PeerCalibration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_sample_recovers_skew_and_latency() {
        // Remote clock runs 50ms ahead, one-way latency 20ms.
        // Local sends at t0=0; remote answers at 0 + 50 + 20 = 70ms on its
        // clock; the reply lands locally at t2 = 40ms.
        let s = CalibrationSample::compute(0, 70 * MS, 40 * MS);
        assert_eq!(s.latency_ns, 20 * MS);
        assert_eq!(s.offset_ns, 50 * MS);
    }

    #[test]
    fn test_sample_negative_offset() {
        // Remote clock runs 100ms behind, latency 10ms.
        let t0 = 1_000 * MS;
        let t1 = t0 - 100 * MS + 10 * MS;
        let t2 = t0 + 20 * MS;
        let s = CalibrationSample::compute(t0, t1, t2);
        assert_eq!(s.latency_ns, 10 * MS);
        assert_eq!(s.offset_ns, -100 * MS);
    }

    #[test]
    fn test_trimmed_mean_discards_worst_latency() {
        let mut cal = PeerCalibration::new();
        // Three clean samples: skew 50ms, latency 10ms.
        for round in 0..3 {
            let t0 = round * 1_000 * MS;
            cal.add_sample(CalibrationSample::compute(t0, t0 + 60 * MS, t0 + 20 * MS));
        }
        // One hiccup: 400ms round trip drags the offset estimate off.
        cal.add_sample(CalibrationSample::compute(
            5_000 * MS,
            5_000 * MS + 60 * MS,
            5_000 * MS + 400 * MS,
        ));

        let (offset, latency) = cal.finish();
        assert_eq!(offset, 50 * MS);
        assert_eq!(latency, 10 * MS);
        assert!(cal.is_calibrated());
    }

    #[test]
    fn test_estimate_converges_with_jitter() {
        // Fixed skew 50ms and latency 20ms, with up to 4ms of one-sided
        // jitter on the return leg. The averaged estimate must land within
        // a few milliseconds of the truth.
        let skew = 50 * MS;
        let latency = 20 * MS;
        let mut cal = PeerCalibration::new();
        for round in 0i64..8 {
            let jitter = (round % 5) * MS; // deterministic pseudo-jitter
            let t0 = round * 500 * MS;
            let t1 = t0 + skew + latency;
            let t2 = t0 + 2 * latency + jitter;
            cal.add_sample(CalibrationSample::compute(t0, t1, t2));
        }
        let (offset, est_latency) = cal.finish();
        assert!((offset - skew).abs() < 3 * MS, "offset {} off", offset);
        assert!(
            (est_latency - latency).abs() < 3 * MS,
            "latency {} off",
            est_latency
        );
    }

    #[test]
    fn test_two_samples_are_not_trimmed() {
        let mut cal = PeerCalibration::new();
        cal.add_sample(CalibrationSample::compute(0, 60 * MS, 20 * MS));
        cal.add_sample(CalibrationSample::compute(0, 70 * MS, 40 * MS));
        let (offset, latency) = cal.finish();
        // Mean of 50ms/50ms offsets and 10ms/20ms latencies.
        assert_eq!(offset, 50 * MS);
        assert_eq!(latency, 15 * MS);
    }

    #[test]
    fn test_failed_phase() {
        let mut cal = PeerCalibration::new();
        assert_eq!(cal.phase(), CalibrationPhase::Calibrating);
        cal.fail();
        assert_eq!(cal.phase(), CalibrationPhase::Failed);
        assert!(!cal.is_calibrated());
    }

    #[test]
    fn test_reported_completion() {
        let mut cal = PeerCalibration::new();
        cal.complete_reported(-7 * MS, 3 * MS);
        assert!(cal.is_calibrated());
        assert_eq!(cal.offset_ns(), -7 * MS);
        assert_eq!(cal.latency_ns(), 3 * MS);
    }
}
