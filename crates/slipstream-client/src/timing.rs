//! Sub-segment timing ledger.
//!
//! Each half of a segment (reliable, unreliable) gets one timing record per
//! request. The estimator adapters sample aggregate views of the ledger; the
//! reporter prints the raw records.

use crate::transport::FetchOutcome;

/// Timing for one half of a segment request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SubSegmentTiming {
    /// Throughput of the transfer, kbps.
    pub throughput: f64,
    /// Bytes the response body carried.
    pub segment_size: u64,
    /// Bytes that actually arrived (losses excluded).
    pub received_size: u64,
    /// Transfer time used for the throughput figure, ms.
    pub time_ms: u64,
    /// Wall-clock time of the whole request, ms.
    pub time_rough_ms: u64,
}

impl SubSegmentTiming {
    /// Derive the record from a finished request.
    ///
    /// Fine-grained mode spans first-to-last frame arrival and counts only
    /// delivered bytes; coarse mode uses the wall clock and the body length.
    /// Both floor the divisor at one millisecond.
    pub fn from_outcome(outcome: &FetchOutcome, fine: bool) -> Self {
        let mut received_size = 0u64;
        let mut earliest: Option<u64> = None;
        let mut latest: Option<u64> = None;
        for timing in outcome.frame_timings.values() {
            if !timing.was_lost {
                received_size += timing.length;
            }
            if let Some(arrival) = timing.arrival_ms {
                earliest = Some(earliest.map_or(arrival, |e| e.min(arrival)));
                latest = Some(latest.map_or(arrival, |l| l.max(arrival)));
            }
        }
        let time_rough_ms = outcome.elapsed_ms.max(1);
        let fine_span = match (earliest, latest) {
            (Some(e), Some(l)) => (l - e).max(1),
            _ => 1,
        };
        let (time_ms, throughput) = if fine {
            (fine_span, (received_size * 8) as f64 / fine_span as f64)
        } else {
            (
                time_rough_ms,
                (outcome.body.len() as u64 * 8) as f64 / time_rough_ms as f64,
            )
        };
        Self {
            throughput,
            segment_size: outcome.body.len() as u64,
            received_size,
            time_ms,
            time_rough_ms,
        }
    }
}

/// Per-session record of every request's timing, split by half.
#[derive(Debug, Default)]
pub struct TimingLedger {
    reliable: Vec<SubSegmentTiming>,
    unreliable: Vec<SubSegmentTiming>,
}

impl TimingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn half(&self, unreliable: bool) -> &Vec<SubSegmentTiming> {
        if unreliable {
            &self.unreliable
        } else {
            &self.reliable
        }
    }

    pub fn record(&mut self, unreliable: bool, timing: SubSegmentTiming) {
        if unreliable {
            self.unreliable.push(timing);
        } else {
            self.reliable.push(timing);
        }
    }

    /// Forget the current segment's records.
    pub fn reset(&mut self) {
        self.reliable.clear();
        self.unreliable.clear();
    }

    pub fn last(&self, unreliable: bool) -> SubSegmentTiming {
        self.half(unreliable).last().copied().unwrap_or_default()
    }

    pub fn all(&self, unreliable: bool) -> &[SubSegmentTiming] {
        self.half(unreliable)
    }

    /// Time-weighted mean throughput of one half, with the total time in
    /// seconds it was measured over.
    pub fn mean_throughput(&self, unreliable: bool) -> (f64, f64) {
        let records = self.half(unreliable);
        if records.is_empty() {
            return (0.0, 0.0);
        }
        let mut weighted = 0.0;
        let mut seconds = 0.0;
        for timing in records {
            let secs = timing.time_ms as f64 / 1000.0;
            weighted += timing.throughput * secs;
            seconds += secs;
        }
        if seconds == 0.0 {
            (0.0, 0.0)
        } else {
            (weighted / seconds, seconds)
        }
    }

    /// Time-weighted mean throughput over both halves.
    pub fn combined_throughput(&self) -> f64 {
        let (rel, rel_secs) = self.mean_throughput(false);
        let (unrel, unrel_secs) = self.mean_throughput(true);
        if unrel > 0.0 {
            (rel * rel_secs + unrel * unrel_secs) / (rel_secs + unrel_secs)
        } else {
            rel
        }
    }

    /// Sum of one half's transfer times, ms.
    pub fn total_time(&self, unreliable: bool) -> u64 {
        self.half(unreliable).iter().map(|t| t.time_ms).sum()
    }

    /// Sum of both halves' transfer times, ms.
    pub fn total_time_all(&self) -> u64 {
        self.total_time(false) + self.total_time(true)
    }

    /// Sum of body sizes over both halves, bytes.
    pub fn total_segment_size(&self) -> f64 {
        self.reliable
            .iter()
            .chain(self.unreliable.iter())
            .map(|t| t.segment_size as f64)
            .sum()
    }

    /// Sum of delivered bytes over both halves.
    pub fn total_received(&self) -> f64 {
        self.reliable
            .iter()
            .chain(self.unreliable.iter())
            .map(|t| t.received_size as f64)
            .sum()
    }

    /// Wall-clock duration of the most recent request on one half, ms.
    pub fn last_rough_time(&self, unreliable: bool) -> u64 {
        self.last(unreliable).time_rough_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FetchOutcome, FrameTiming, FrameTimings};
    use bytes::Bytes;

    fn outcome(frames: &[(u64, Option<u64>, u64, bool)], body_len: usize, elapsed: u64) -> FetchOutcome {
        let mut timings = FrameTimings::new();
        for (offset, arrival, length, lost) in frames {
            timings.insert(
                *offset,
                FrameTiming {
                    arrival_ms: *arrival,
                    length: *length,
                    was_lost: *lost,
                },
            );
        }
        FetchOutcome {
            status: Some(200),
            body: Bytes::from(vec![0u8; body_len]),
            frame_timings: timings,
            elapsed_ms: elapsed,
            cancelled: false,
        }
    }

    #[test]
    fn coarse_timing_uses_wall_clock_and_body_length() {
        let o = outcome(&[(0, Some(10), 1000, false)], 1000, 100);
        let t = SubSegmentTiming::from_outcome(&o, false);
        assert_eq!(t.time_ms, 100);
        assert!((t.throughput - 80.0).abs() < 1e-9);
        assert_eq!(t.segment_size, 1000);
        assert_eq!(t.received_size, 1000);
    }

    #[test]
    fn fine_timing_spans_arrivals_and_skips_lost_frames() {
        let o = outcome(
            &[
                (0, Some(20), 600, false),
                (600, None, 200, true),
                (800, Some(120), 400, false),
            ],
            1200,
            500,
        );
        let t = SubSegmentTiming::from_outcome(&o, true);
        assert_eq!(t.received_size, 1000);
        assert_eq!(t.time_ms, 100);
        assert!((t.throughput - 80.0).abs() < 1e-9);
        assert_eq!(t.time_rough_ms, 500);
    }

    #[test]
    fn zero_durations_floor_to_one_millisecond() {
        let o = outcome(&[(0, Some(5), 100, false)], 100, 0);
        let coarse = SubSegmentTiming::from_outcome(&o, false);
        assert_eq!(coarse.time_ms, 1);
        let fine = SubSegmentTiming::from_outcome(&o, true);
        assert_eq!(fine.time_ms, 1);
    }

    #[test]
    fn ledger_aggregates_by_half() {
        let mut ledger = TimingLedger::new();
        ledger.record(
            false,
            SubSegmentTiming {
                throughput: 1000.0,
                segment_size: 500,
                received_size: 500,
                time_ms: 1000,
                time_rough_ms: 1100,
            },
        );
        ledger.record(
            true,
            SubSegmentTiming {
                throughput: 2000.0,
                segment_size: 1500,
                received_size: 1400,
                time_ms: 3000,
                time_rough_ms: 3100,
            },
        );
        let (rel_tp, rel_secs) = ledger.mean_throughput(false);
        assert!((rel_tp - 1000.0).abs() < 1e-9);
        assert!((rel_secs - 1.0).abs() < 1e-9);
        // Combined: (1000·1 + 2000·3) / 4.
        assert!((ledger.combined_throughput() - 1750.0).abs() < 1e-9);
        assert_eq!(ledger.total_time_all(), 4000);
        assert_eq!(ledger.total_segment_size(), 2000.0);
        assert_eq!(ledger.total_received(), 1900.0);
        assert_eq!(ledger.last_rough_time(true), 3100);

        ledger.reset();
        assert_eq!(ledger.last(false), SubSegmentTiming::default());
    }
}
