//! In-flight abandonment monitors.
//!
//! While a request runs, the transport periodically reports how many bytes
//! have arrived and how long the transfer has been going. The monitor decides
//! whether the download should be cancelled in favor of a re-plan, and if so
//! whether what arrived is worth keeping. Decisions travel back as
//! [`Verdict`] values together with a [`Replan`] describing the retry; the
//! monitor never calls back into the session.
//!
//! Four policies exist: the BPP check (moving-average ETA against the
//! remaining buffer, then a BOLA-E re-plan), the deadline check used by
//! hole-fill sub-requests, and the classic and size-aware BOLA checks kept
//! for comparison against prior art.

use crate::bola::{Bola, DownloadProgress};
use crate::error::ControlError;
use crate::estimator::BppMovingAverage;
use crate::ssim::{SsimKey, SsimMap};

/// Minimum in-flight time before any abandonment may fire, ms.
pub const GRACE_TIME_THRESHOLD_MS: f64 = 500.0;
/// Classic BOLA abandons when the full-download ETA exceeds this multiple of
/// the segment duration.
pub const ABANDON_MULTIPLIER: f64 = 1.8;
/// Classic BOLA needs this many throughput samples before judging.
pub const MIN_SAMPLES_TO_AVERAGE: usize = 5;
/// Discount applied to measured bandwidth before re-planning.
pub const BANDWIDTH_SAFETY_FACTOR: f64 = 0.9;
/// Evaluation cadence for the periodic checks, ms.
pub const TICK_INTERVAL_MS: u64 = 50;
/// Residual buffer that must survive any deadline-bounded sub-request, ms.
pub const SAFETY_MARGIN_MS: f64 = 2000.0;

/// Classic BOLA never abandons above this buffer occupancy, ms.
const CLASSIC_BUFFER_GATE_MS: f64 = 12_000.0;

/// What the monitor wants done with the in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the transfer keep running.
    Continue,
    /// Cancel and retry the segment under the re-plan.
    AbandonDiscard,
    /// Cancel but commit the bytes already received.
    AbandonKeep,
}

/// Per-request inputs the monitor judges against.
#[derive(Debug, Clone)]
pub struct AbandonPlan {
    /// Bytes this request must deliver.
    pub size: u64,
    /// Bytes a fallback plan would still need.
    pub fallback_size: u64,
    /// Buffer occupancy when the request was issued, ms.
    pub buffer_occ_ms: f64,
    /// Quality level being downloaded.
    pub quality: usize,
    /// True for the reliable half of a segment.
    pub reliable: bool,
    /// Segment duration, ms.
    pub segment_duration_ms: f64,
    /// Long-term bitrate ladder, kbps.
    pub bitrates: Vec<f64>,
    /// Actual per-quality sizes of the current segment, bits.
    pub segment_sizes_bits: Vec<f64>,
}

/// The retry plan filled in while a verdict is formed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replan {
    /// True when the partial download is acceptable as-is.
    pub kept: bool,
    /// Quality to retry at.
    pub quality: usize,
    /// SSIM entry to retry at, for map-aware policies.
    pub ssim: Option<SsimKey>,
    /// Pause the re-plan imposes, ms.
    pub pause_ms: f64,
}

/// Which abandonment rule a request runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPolicy {
    /// BPP: ETA against remaining buffer, then a BOLA-E re-plan.
    Bpp,
    /// Classic BOLA sample-window check.
    Bola,
    /// BOLA check re-planning against the segment's actual sizes.
    BolaEnhanced,
    /// Hard wall-clock budget for hole-fill sub-requests.
    Deadline,
    /// Never abandon (MPC / throughput policies).
    Passive,
}

/// Stateful monitor for a single request.
#[derive(Debug)]
pub struct AbandonMonitor {
    policy: MonitorPolicy,
    bpp_average: BppMovingAverage,
    samples: Vec<f64>,
}

impl AbandonMonitor {
    pub fn new(policy: MonitorPolicy) -> Self {
        Self {
            policy,
            bpp_average: BppMovingAverage::new(),
            samples: Vec::new(),
        }
    }

    pub fn policy(&self) -> MonitorPolicy {
        self.policy
    }

    /// Judge the transfer at `elapsed_ms` with `received` bytes on hand.
    ///
    /// `bola` carries the controller for the policies that re-plan through
    /// BOLA-E; `ssim_map` the current segment's map for the BPP rule.
    pub fn evaluate(
        &mut self,
        bola: Option<&mut Bola>,
        plan: &AbandonPlan,
        ssim_map: Option<&SsimMap>,
        received: u64,
        elapsed_ms: f64,
        replan: &mut Replan,
    ) -> Result<Verdict, ControlError> {
        match self.policy {
            MonitorPolicy::Passive => Ok(Verdict::Continue),
            MonitorPolicy::Deadline => Ok(Self::deadline(plan, received, elapsed_ms, replan)),
            MonitorPolicy::Bpp => self.bpp(bola, plan, ssim_map, received, elapsed_ms, replan),
            MonitorPolicy::Bola => self.classic(bola, plan, received, elapsed_ms, replan),
            MonitorPolicy::BolaEnhanced => {
                self.enhanced(bola, plan, received, elapsed_ms, replan)
            }
        }
    }

    fn deadline(plan: &AbandonPlan, received: u64, elapsed_ms: f64, replan: &mut Replan) -> Verdict {
        // Cancelling can beat the first byte; only keep what provably exists.
        if received > 0 {
            replan.kept = true;
        }
        let target_time = plan.buffer_occ_ms - elapsed_ms - SAFETY_MARGIN_MS;
        if target_time <= 0.0 {
            if replan.kept {
                Verdict::AbandonKeep
            } else {
                Verdict::AbandonDiscard
            }
        } else {
            Verdict::Continue
        }
    }

    fn bpp(
        &mut self,
        bola: Option<&mut Bola>,
        plan: &AbandonPlan,
        ssim_map: Option<&SsimMap>,
        received: u64,
        elapsed_ms: f64,
        replan: &mut Replan,
    ) -> Result<Verdict, ControlError> {
        self.bpp_average.add_measurement(received, elapsed_ms);

        if elapsed_ms <= GRACE_TIME_THRESHOLD_MS || received >= plan.size {
            return Ok(Verdict::Continue);
        }
        let measured = self.bpp_average.throughput();
        if measured == 0.0 {
            return Ok(Verdict::Continue);
        }
        let eta_remaining_ms = (plan.size - received) as f64 * 8.0 / measured;
        let remaining_buffer = plan.buffer_occ_ms - elapsed_ms;
        if eta_remaining_ms < remaining_buffer {
            return Ok(Verdict::Continue);
        }
        if plan.quality == 0 {
            return Ok(Verdict::Continue);
        }
        let (Some(bola), Some(map)) = (bola, ssim_map) else {
            return Ok(Verdict::Continue);
        };
        let progress = DownloadProgress {
            quality: Some(plan.quality),
            ssim: 0.0,
            downloaded: received,
            reliable: plan.reliable,
        };
        let choice = bola.bola_e(
            remaining_buffer,
            measured * BANDWIDTH_SAFETY_FACTOR,
            map,
            Some(&progress),
        )?;
        let entry = *map
            .get(&choice.key)
            .ok_or(ControlError::QualityMissing(plan.quality))?;
        replan.ssim = Some(choice.key);
        replan.quality = entry.quality;
        replan.pause_ms = choice.pause;
        if entry.quality < plan.quality {
            return Ok(Verdict::AbandonDiscard);
        }
        if !plan.reliable && entry.quality == plan.quality {
            // Received bytes only cover this half, so compare against the
            // entry's unreliable share.
            let required_on_half = entry.size.saturating_sub(entry.reliable_size);
            if received >= required_on_half {
                replan.kept = true;
                return Ok(Verdict::AbandonKeep);
            }
        }
        Ok(Verdict::Continue)
    }

    fn classic(
        &mut self,
        bola: Option<&mut Bola>,
        plan: &AbandonPlan,
        received: u64,
        elapsed_ms: f64,
        replan: &mut Replan,
    ) -> Result<Verdict, ControlError> {
        if plan.buffer_occ_ms > CLASSIC_BUFFER_GATE_MS {
            return Ok(Verdict::Continue);
        }
        self.samples
            .push(received as f64 * 8.0 / elapsed_ms.max(1.0));

        if self.samples.len() < MIN_SAMPLES_TO_AVERAGE
            || elapsed_ms <= GRACE_TIME_THRESHOLD_MS
            || received >= plan.size
        {
            return Ok(Verdict::Continue);
        }
        let measured =
            (self.samples.iter().sum::<f64>() / self.samples.len() as f64).round();
        let eta_full_ms = plan.size as f64 * 8.0 / measured;
        if eta_full_ms < plan.segment_duration_ms * ABANDON_MULTIPLIER || plan.quality == 0 {
            return Ok(Verdict::Continue);
        }
        let Some(bola) = bola else {
            return Ok(Verdict::Continue);
        };
        let frozen = DownloadProgress {
            quality: None,
            ssim: 0.0,
            downloaded: 0,
            reliable: true,
        };
        let quality = bola.bola_e_sizes(
            plan.buffer_occ_ms,
            measured * BANDWIDTH_SAFETY_FACTOR,
            None,
            Some(&frozen),
        )?;
        replan.quality = quality;
        let bytes_remaining = plan.size - received;
        let estimated_other_total =
            plan.size as f64 * plan.bitrates[quality] / plan.bitrates[plan.quality];
        if bytes_remaining as f64 > estimated_other_total {
            return Ok(Verdict::AbandonDiscard);
        }
        Ok(Verdict::Continue)
    }

    fn enhanced(
        &mut self,
        bola: Option<&mut Bola>,
        plan: &AbandonPlan,
        received: u64,
        elapsed_ms: f64,
        replan: &mut Replan,
    ) -> Result<Verdict, ControlError> {
        self.samples
            .push(received as f64 * 8.0 / elapsed_ms.max(1.0));

        if self.samples.len() < MIN_SAMPLES_TO_AVERAGE
            || elapsed_ms <= GRACE_TIME_THRESHOLD_MS
            || received >= plan.size
        {
            return Ok(Verdict::Continue);
        }
        let measured =
            (self.samples.iter().sum::<f64>() / self.samples.len() as f64).round();
        let eta_full_ms = plan.size as f64 * 8.0 / measured;
        if eta_full_ms < plan.segment_duration_ms * ABANDON_MULTIPLIER || plan.quality == 0 {
            return Ok(Verdict::Continue);
        }
        let Some(bola) = bola else {
            return Ok(Verdict::Continue);
        };
        let frozen = DownloadProgress {
            quality: None,
            ssim: 0.0,
            downloaded: 0,
            reliable: true,
        };
        let quality = bola.bola_e_sizes(
            plan.buffer_occ_ms - elapsed_ms,
            measured * BANDWIDTH_SAFETY_FACTOR,
            Some(&plan.segment_sizes_bits),
            Some(&frozen),
        )?;
        replan.quality = quality;
        let bytes_remaining = plan.size - received;
        let other_total_bytes = plan.segment_sizes_bits[quality] / 8.0;
        if bytes_remaining as f64 > other_total_bytes {
            return Ok(Verdict::AbandonDiscard);
        }
        Ok(Verdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssim::SsimEntry;

    fn plan(size: u64, buffer_occ: f64, quality: usize, reliable: bool) -> AbandonPlan {
        AbandonPlan {
            size,
            fallback_size: 0,
            buffer_occ_ms: buffer_occ,
            quality,
            reliable,
            segment_duration_ms: 4000.0,
            bitrates: vec![500.0, 1000.0, 2000.0, 4000.0],
            segment_sizes_bits: vec![2.0e6, 4.0e6, 8.0e6, 16.0e6],
        }
    }

    fn session_bola() -> Bola {
        let mut bola =
            Bola::new(4000.0, 20_000.0, vec![500.0, 1000.0, 2000.0, 4000.0], None)
                .expect("valid ladder");
        // Establish session state the way a running session would have.
        bola.choose(1500.0, None).expect("init decision");
        bola
    }

    fn segment_map() -> SsimMap {
        let mut map = SsimMap::new();
        for (ssim, size, rel, quality, frames) in [
            (0.80, 250_000u64, 20_000u64, 0usize, 20u32),
            (0.90, 500_000, 30_000, 1, 45),
            (0.95, 1_000_000, 40_000, 2, 70),
            (0.99, 2_000_000, 50_000, 3, 95),
        ] {
            map.insert(
                ssim,
                SsimEntry {
                    size,
                    reliable_size: rel,
                    quality,
                    required_frames: frames,
                },
            );
        }
        map
    }

    #[test]
    fn deadline_cancels_exactly_when_budget_is_gone() {
        let mut replan = Replan::default();
        let p = plan(100_000, 5000.0, 0, false);
        // 5000 − 2999 − 2000 > 0: keep running.
        assert_eq!(
            AbandonMonitor::deadline(&p, 10, 2999.0, &mut replan),
            Verdict::Continue
        );
        // 5000 − 3000 − 2000 == 0: cancel, keeping the received bytes.
        assert_eq!(
            AbandonMonitor::deadline(&p, 10, 3000.0, &mut replan),
            Verdict::AbandonKeep
        );
        assert!(replan.kept);
    }

    #[test]
    fn deadline_without_bytes_discards() {
        let mut replan = Replan::default();
        let p = plan(100_000, 1000.0, 0, false);
        assert_eq!(
            AbandonMonitor::deadline(&p, 0, 10.0, &mut replan),
            Verdict::AbandonDiscard
        );
        assert!(!replan.kept);
    }

    #[test]
    fn bpp_waits_out_the_grace_period() {
        let mut monitor = AbandonMonitor::new(MonitorPolicy::Bpp);
        let mut bola = session_bola();
        let map = segment_map();
        let mut replan = Replan::default();
        let p = plan(500_000, 16_000.0, 1, false);
        let verdict = monitor
            .evaluate(Some(&mut bola), &p, Some(&map), 2_000, 400.0, &mut replan)
            .expect("evaluate");
        assert_eq!(verdict, Verdict::Continue);
    }

    #[test]
    fn bpp_abandons_down_when_throughput_collapses() {
        let mut monitor = AbandonMonitor::new(MonitorPolicy::Bpp);
        let mut bola = session_bola();
        let map = segment_map();
        let mut replan = Replan::default();
        let p = plan(470_000, 16_000.0, 1, false);
        // 100 kbps: a trickle of 12.5 bytes/ms against a 470 KB target.
        let mut verdict = Verdict::Continue;
        for tick in 1..=12u64 {
            let elapsed = tick as f64 * 50.0;
            let received = (elapsed * 12.5) as u64;
            verdict = monitor
                .evaluate(Some(&mut bola), &p, Some(&map), received, elapsed, &mut replan)
                .expect("evaluate");
            if verdict != Verdict::Continue {
                break;
            }
        }
        assert_eq!(verdict, Verdict::AbandonDiscard);
        assert!(replan.quality < 1);
        assert!(replan.ssim.is_some());
        assert!(!replan.kept);
    }

    #[test]
    fn bpp_keeps_what_it_has_when_the_required_share_arrived() {
        let mut monitor = AbandonMonitor::new(MonitorPolicy::Bpp);
        let mut bola = session_bola();
        let mut map = SsimMap::new();
        // Two rungs at the same quality: the cheaper one is already covered
        // by what arrived.
        map.insert(
            0.90,
            SsimEntry {
                size: 430_000,
                reliable_size: 30_000,
                quality: 1,
                required_frames: 40,
            },
        );
        map.insert(
            0.95,
            SsimEntry {
                size: 530_000,
                reliable_size: 30_000,
                quality: 1,
                required_frames: 60,
            },
        );
        let mut replan = Replan::default();
        let p = plan(500_000, 9_000.0, 1, false);
        // Slow but not catastrophic: 400 kbps. The required share for the
        // cheaper rung (400 KB on the unreliable half) lands around t = 8 s.
        let mut verdict = Verdict::Continue;
        for tick in 1..=200u64 {
            let elapsed = tick as f64 * 50.0;
            let received = (elapsed * 50.0) as u64;
            verdict = monitor
                .evaluate(Some(&mut bola), &p, Some(&map), received, elapsed, &mut replan)
                .expect("evaluate");
            if verdict != Verdict::Continue {
                break;
            }
        }
        assert_eq!(verdict, Verdict::AbandonKeep);
        assert!(replan.kept);
        assert_eq!(replan.quality, 1);
    }

    #[test]
    fn classic_never_abandons_with_a_comfortable_buffer() {
        let mut monitor = AbandonMonitor::new(MonitorPolicy::Bola);
        let mut bola = session_bola();
        let mut replan = Replan::default();
        let p = plan(1_000_000, 15_000.0, 2, false);
        for tick in 1..=20u64 {
            let verdict = monitor
                .evaluate(Some(&mut bola), &p, None, tick * 100, tick as f64 * 50.0, &mut replan)
                .expect("evaluate");
            assert_eq!(verdict, Verdict::Continue);
        }
    }

    #[test]
    fn classic_abandons_when_the_smaller_plan_needs_fewer_bytes() {
        let mut monitor = AbandonMonitor::new(MonitorPolicy::Bola);
        let mut bola = session_bola();
        let mut replan = Replan::default();
        // 1 MB at quality 2 against a starved link and a thin buffer.
        let p = plan(1_000_000, 6_000.0, 2, false);
        let mut verdict = Verdict::Continue;
        for tick in 1..=20u64 {
            let elapsed = tick as f64 * 50.0;
            // 200 kbps → 25 bytes/ms.
            let received = (elapsed * 25.0) as u64;
            verdict = monitor
                .evaluate(Some(&mut bola), &p, None, received, elapsed, &mut replan)
                .expect("evaluate");
            if verdict != Verdict::Continue {
                break;
            }
        }
        assert_eq!(verdict, Verdict::AbandonDiscard);
        assert!(replan.quality < 2);
    }
}
