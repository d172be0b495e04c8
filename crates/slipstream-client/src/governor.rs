//! Per-request download governance.
//!
//! The governor is the [`TransferObserver`] the session hands to the
//! transport for each request. It self-gates the abandonment monitor to its
//! 50 ms cadence, runs the idle watchdog, keeps the cancel diagnostics
//! current, and collects the re-plan the monitor produces. The transport
//! only ever sees `Continue` or `Cancel`; everything the session needs
//! afterwards is read back out of the governor.

use slipstream_abr::{
    AbandonMonitor, AbandonPlan, Bola, ControlError, MonitorPolicy, Replan, SsimMap, Verdict,
    SAFETY_MARGIN_MS, TICK_INTERVAL_MS,
};

use crate::report::{CancelFields, Reporter};
use crate::transport::{TickDecision, TransferObserver, TransferSnapshot};

/// No new bytes for this long emits an `[idle]` diagnostic, ms.
const IDLE_THRESHOLD_MS: u64 = 15_000;
/// `[cancel-try]` progress lines are throttled to one per this many bytes.
const PROGRESS_PRINT_STEP: u64 = 50_000;

pub struct Governor<'a> {
    reporter: &'a mut Reporter,
    monitor: AbandonMonitor,
    plan: Option<AbandonPlan>,
    ssim_map: Option<&'a SsimMap>,
    bola: Option<&'a mut Bola>,
    replan: Replan,
    control_error: Option<ControlError>,
    last_eval_elapsed_ms: u64,
    idle_anchor_ms: u64,
    last_received: u64,
    print_helper: u64,
    fields: CancelFields,
}

impl<'a> Governor<'a> {
    /// Governor for requests without an abandonment policy (manifest, init
    /// segment): idle watchdog only.
    pub fn passive(reporter: &'a mut Reporter) -> Self {
        Self {
            reporter,
            monitor: AbandonMonitor::new(MonitorPolicy::Passive),
            plan: None,
            ssim_map: None,
            bola: None,
            replan: Replan::default(),
            control_error: None,
            last_eval_elapsed_ms: 0,
            idle_anchor_ms: 0,
            last_received: 0,
            print_helper: 0,
            fields: CancelFields::default(),
        }
    }

    /// Governor for a segment request under the given policy.
    pub fn with_plan(
        reporter: &'a mut Reporter,
        policy: MonitorPolicy,
        plan: AbandonPlan,
        ssim_map: Option<&'a SsimMap>,
        bola: Option<&'a mut Bola>,
    ) -> Self {
        let print_helper = plan.size;
        let reliable = plan.reliable;
        Self {
            reporter,
            monitor: AbandonMonitor::new(policy),
            plan: Some(plan),
            ssim_map,
            bola,
            replan: Replan::default(),
            control_error: None,
            last_eval_elapsed_ms: 0,
            idle_anchor_ms: 0,
            last_received: 0,
            print_helper,
            fields: CancelFields {
                reliable,
                ..CancelFields::default()
            },
        }
    }

    /// Called by the session after an uncancelled fetch: the download stands.
    pub fn finish(&mut self, elapsed_ms: u64) {
        self.replan.kept = true;
        match &self.plan {
            Some(_) => {
                self.fields.elapsed_ms = elapsed_ms;
                self.fields.kept = true;
                let fields = self.fields;
                self.reporter.cancel_fin(&fields);
            }
            None => self.reporter.cancel_fin_short(elapsed_ms),
        }
    }

    /// The re-plan collected while the verdicts were formed.
    pub fn replan(&self) -> Replan {
        self.replan
    }

    /// A control-invariant failure raised by the monitor mid-transfer.
    pub fn take_error(&mut self) -> Option<ControlError> {
        self.control_error.take()
    }

    fn refresh_fields(&mut self, snapshot: &TransferSnapshot) {
        let Some(plan) = &self.plan else { return };
        let remaining_time = plan.buffer_occ_ms - snapshot.elapsed_ms as f64;
        let lossy_remaining = plan.size as i64 - snapshot.progress_bytes as i64;
        self.fields.elapsed_ms = snapshot.elapsed_ms;
        self.fields.remaining_size = plan.size as i64 - snapshot.received_bytes as i64;
        self.fields.lossy_remaining_size = lossy_remaining;
        self.fields.target_time_ms = (remaining_time - SAFETY_MARGIN_MS) as i64;
        self.fields.kept = self.replan.kept;
        let throughput = snapshot.throughput_kbps;
        if throughput != 0.0 {
            self.fields.remaining_dl_time_ms =
                (((lossy_remaining / 1000) as f64 / (throughput / 8.0)) * 1000.0) as i64;
            self.fields.remaining_fallback_time_ms =
                (((plan.fallback_size / 1000) as f64 / (throughput / 8.0)) * 1000.0) as i64;
        }
    }

    fn watch_idle(&mut self, snapshot: &TransferSnapshot) {
        if snapshot.received_bytes == self.last_received {
            let idle = snapshot.elapsed_ms.saturating_sub(self.idle_anchor_ms);
            if idle > IDLE_THRESHOLD_MS {
                self.reporter.idle(idle);
                self.idle_anchor_ms = snapshot.elapsed_ms;
            }
        } else {
            self.last_received = snapshot.received_bytes;
            self.idle_anchor_ms = snapshot.elapsed_ms;
        }
    }
}

impl TransferObserver for Governor<'_> {
    fn on_tick(&mut self, snapshot: &TransferSnapshot) -> TickDecision {
        self.watch_idle(snapshot);
        let Some(plan) = self.plan.clone() else {
            return TickDecision::Continue;
        };
        self.refresh_fields(snapshot);

        // The deadline rule is a hard budget and is checked on every pass;
        // the periodic rules self-gate to their 50 ms cadence.
        let due = match self.monitor.policy() {
            MonitorPolicy::Deadline => true,
            MonitorPolicy::Passive => false,
            _ => snapshot.elapsed_ms - self.last_eval_elapsed_ms >= TICK_INTERVAL_MS,
        };
        if due {
            self.last_eval_elapsed_ms = snapshot.elapsed_ms;
            let verdict = self.monitor.evaluate(
                self.bola.as_deref_mut(),
                &plan,
                self.ssim_map,
                snapshot.received_bytes,
                snapshot.elapsed_ms as f64,
                &mut self.replan,
            );
            match verdict {
                Ok(Verdict::Continue) => {}
                Ok(_) => {
                    self.fields.kept = self.replan.kept;
                    let threshold = (plan.size as i64 - self.fields.lossy_remaining_size)
                        as f64
                        / plan.size as f64;
                    let fields = self.fields;
                    self.reporter.cancel_reason(&fields, threshold);
                    return TickDecision::Cancel;
                }
                Err(error) => {
                    self.control_error = Some(error);
                    return TickDecision::Cancel;
                }
            }
        }

        if self.print_helper >= PROGRESS_PRINT_STEP
            && (self.fields.lossy_remaining_size as u64)
                < self.print_helper - PROGRESS_PRINT_STEP
        {
            let fields = self.fields;
            self.reporter.cancel_try(&fields, snapshot.throughput_kbps);
            self.print_helper = self.fields.lossy_remaining_size.max(0) as u64;
        }
        TickDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn snapshot(elapsed: u64, received: u64) -> TransferSnapshot {
        TransferSnapshot {
            elapsed_ms: elapsed,
            received_bytes: received,
            progress_bytes: received,
            throughput_kbps: 800.0,
        }
    }

    fn deadline_plan(buffer_occ: f64) -> AbandonPlan {
        AbandonPlan {
            size: 100_000,
            fallback_size: 100_000,
            buffer_occ_ms: buffer_occ,
            quality: 0,
            reliable: false,
            segment_duration_ms: 4000.0,
            bitrates: vec![500.0, 1000.0],
            segment_sizes_bits: vec![2.0e6, 4.0e6],
        }
    }

    #[test]
    fn deadline_governor_cancels_when_the_budget_runs_out() {
        let capture = Capture::default();
        let mut reporter = Reporter::new(Box::new(capture.clone()));
        let mut governor = Governor::with_plan(
            &mut reporter,
            MonitorPolicy::Deadline,
            deadline_plan(5000.0),
            None,
            None,
        );
        assert_eq!(
            governor.on_tick(&snapshot(1000, 10_000)),
            TickDecision::Continue
        );
        assert_eq!(
            governor.on_tick(&snapshot(3200, 20_000)),
            TickDecision::Cancel
        );
        let replan = governor.replan();
        assert!(replan.kept);
        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("[cancel-reason] rel:0 t:3200"));
        assert!(out.contains("keep:1"));
    }

    #[test]
    fn passive_governor_never_cancels() {
        let capture = Capture::default();
        let mut reporter = Reporter::new(Box::new(capture.clone()));
        let mut governor = Governor::passive(&mut reporter);
        for tick in 1..100u64 {
            assert_eq!(
                governor.on_tick(&snapshot(tick * 100, tick)),
                TickDecision::Continue
            );
        }
        governor.finish(9900);
        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "[cancel-fin] t:9900\n");
    }

    #[test]
    fn idle_watchdog_reports_without_cancelling() {
        let capture = Capture::default();
        let mut reporter = Reporter::new(Box::new(capture.clone()));
        let mut governor = Governor::passive(&mut reporter);
        assert_eq!(
            governor.on_tick(&snapshot(100, 500)),
            TickDecision::Continue
        );
        // No new bytes for 16 seconds.
        assert_eq!(
            governor.on_tick(&snapshot(16_200, 500)),
            TickDecision::Continue
        );
        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("[idle] 16100"));
    }

    #[test]
    fn progress_prints_are_throttled_per_fifty_kilobytes() {
        let capture = Capture::default();
        let mut reporter = Reporter::new(Box::new(capture.clone()));
        let mut governor = Governor::with_plan(
            &mut reporter,
            MonitorPolicy::Deadline,
            deadline_plan(1_000_000.0),
            None,
            None,
        );
        governor.on_tick(&snapshot(100, 10_000));
        governor.on_tick(&snapshot(200, 20_000));
        governor.on_tick(&snapshot(300, 60_000));
        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out.matches("[cancel-try]").count(), 1);
    }
}
