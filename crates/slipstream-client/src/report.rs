//! Structured stderr lines.
//!
//! These lines are an output contract, not diagnostics: offline tooling
//! parses them field by field, so every format here is byte-exact and must
//! not change. Anything that is *not* part of the contract goes through
//! `tracing` instead.
//!
//! The reporter writes to any `io::Write`, which lets tests capture the
//! stream. Write failures on a diagnostics channel are deliberately ignored.

use std::io::Write;

use slipstream_abr::{SsimMap, Stall};

use crate::timing::SubSegmentTiming;

/// Fields shared by the `[cancel-reason]`, `[cancel-try]` and `[cancel-fin]`
/// lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelFields {
    pub reliable: bool,
    pub elapsed_ms: u64,
    pub remaining_size: i64,
    pub lossy_remaining_size: i64,
    pub remaining_dl_time_ms: i64,
    pub remaining_fallback_time_ms: i64,
    pub target_time_ms: i64,
    pub kept: bool,
}

/// Fields of the per-segment `[segment]` / `[trying-segment]` lines.
#[derive(Debug, Clone)]
pub struct SegmentFields {
    pub index: usize,
    pub ssim: f64,
    pub bitrate_kbps: u32,
    pub total_size: u64,
    pub reliable_size: u64,
    pub unreliable_size: u64,
    pub media_range: String,
    pub name: String,
}

/// Writer for the contractual stderr stream.
pub struct Reporter {
    sink: Box<dyn Write + Send>,
}

impl Reporter {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self { sink }
    }

    /// Reporter over the process stderr.
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    fn line(&mut self, line: std::fmt::Arguments<'_>) {
        let _ = writeln!(self.sink, "{line}");
    }

    pub fn blank(&mut self) {
        self.line(format_args!(""));
    }

    pub fn start(&mut self, epoch_ms: u128) {
        self.line(format_args!("[start] {epoch_ms}"));
    }

    pub fn connected(&mut self, peer: &str) {
        self.line(format_args!("[connected] {peer}"));
    }

    pub fn legend(&mut self) {
        self.line(format_args!(
            "[legend] bitrates/throughput:kbps durations/buffer/times:ms sizes/loss:bytes"
        ));
    }

    pub fn features(&mut self, raw: &str) {
        self.line(format_args!("[features] {raw}"));
    }

    pub fn bitrates(&mut self, bitrates: &[f64]) {
        let mut line = String::from("[bitrates] ");
        for rate in bitrates {
            line.push_str(&format!("{} ", *rate as u32));
        }
        self.line(format_args!("{line}"));
    }

    pub fn avg_ssims(&mut self, ssims: &[f64]) {
        let mut line = String::from("[avg-ssims]");
        for ssim in ssims {
            line.push_str(&format!(" {ssim}"));
        }
        self.line(format_args!("{line}"));
    }

    pub fn first_segment_map(&mut self, map: &SsimMap) {
        let mut line = String::from("First segment: ");
        for (key, entry) in map.iter() {
            line.push_str(&format!(
                " [{}:{}:{}]",
                key.value(),
                entry.required_frames,
                entry.quality
            ));
        }
        self.line(format_args!("{line}"));
    }

    pub fn segments(&mut self, count: usize, duration_ms: u64) {
        self.line(format_args!("[segments] num:{count} len:{duration_ms}"));
    }

    pub fn abr(&mut self, name: &str) {
        self.line(format_args!("[abr] {name}"));
    }

    pub fn fine(&mut self) {
        self.line(format_args!("[fine]"));
    }

    pub fn smooth(&mut self, alpha: f64) {
        self.line(format_args!("[smooth] {alpha}"));
    }

    pub fn harmonic(&mut self) {
        self.line(format_args!("[harmonic]"));
    }

    pub fn tp_window(&mut self, samples: impl Iterator<Item = f64>) {
        let mut line = String::from("[tp_window]");
        for tp in samples {
            line.push_str(&format!(" {tp}"));
        }
        self.line(format_args!("{line}"));
    }

    pub fn trying_segment(&mut self, fields: &SegmentFields, retry: u32) {
        self.line(format_args!(
            "[trying-segment] #:{} ssim:{} br:{} ss:{} ssr:{} ssu:{} @:{} n:{} re:{}",
            fields.index,
            fields.ssim,
            fields.bitrate_kbps,
            fields.total_size,
            fields.reliable_size,
            fields.unreliable_size,
            fields.media_range,
            fields.name,
            retry
        ));
    }

    pub fn bpp_request_sizes(&mut self, reliable: u64, unreliable: u64, optional: u64) {
        self.line(format_args!(
            "[bpp-request-sizes] ssr:{reliable} ssu:{unreliable} sso:{optional}"
        ));
    }

    /// The init-segment `[segment]` line has no ssim field.
    pub fn init_segment(&mut self, fields: &SegmentFields) {
        self.line(format_args!(
            "[segment] #:{} br:{} ss:{} ssr:{} ssu:0 loss:0 @:{} n:{}",
            fields.index,
            fields.bitrate_kbps,
            fields.total_size,
            fields.reliable_size,
            fields.media_range,
            fields.name
        ));
    }

    pub fn segment(&mut self, fields: &SegmentFields, loss: u64) {
        self.line(format_args!(
            "[segment] #:{} ssim:{} br:{} ss:{} ssr:{} ssu:{} loss:{} @:{} n:{}",
            fields.index,
            fields.ssim,
            fields.bitrate_kbps,
            fields.total_size,
            fields.reliable_size,
            fields.unreliable_size,
            loss,
            fields.media_range,
            fields.name
        ));
    }

    pub fn time(
        &mut self,
        since_start_ms: u64,
        reliable_ms: u64,
        unreliable_ms: u64,
        dl_reliable_ms: u64,
        dl_unreliable_ms: u64,
    ) {
        self.line(format_args!(
            "[time] s:{since_start_ms} r:{reliable_ms} u:{unreliable_ms} dlr:{dl_reliable_ms} dlu:{dl_unreliable_ms}"
        ));
    }

    pub fn throughput(&mut self, mavg: f64, reliable: f64, unreliable: f64) {
        self.line(format_args!(
            "[throughput] mavg:{mavg} r:{reliable} u:{unreliable}"
        ));
    }

    pub fn half_throughputs(&mut self, unreliable: bool, timings: &[SubSegmentTiming]) {
        if timings.is_empty() {
            return;
        }
        let mut line = String::from(if unreliable {
            "[unrel-throughputs]"
        } else {
            "[rel-throughputs]"
        });
        for timing in timings {
            line.push_str(&format!(" {}", timing.throughput));
        }
        self.line(format_args!("{line}"));
    }

    pub fn buffer(&mut self, level_ms: f64, retry: bool) {
        if retry {
            self.line(format_args!("[retry-buffer] {}", level_ms as i64));
        } else {
            self.line(format_args!("[buffer] {}", level_ms as i64));
        }
    }

    pub fn placeholder(&mut self, level_ms: f64) {
        self.line(format_args!("[placeholder] {}", level_ms as i64));
    }

    pub fn pause(&mut self, pause_ms: f64) {
        self.line(format_args!("[pause] {}", pause_ms as i64));
    }

    pub fn stall(&mut self, stall: Stall) {
        match stall {
            Stall::Startup(ms) => self.line(format_args!("[startup] {}", ms as i64)),
            Stall::Rebuffer(ms) => self.line(format_args!("[rebuffer] {}", ms as i64)),
        }
    }

    pub fn idle(&mut self, idle_ms: u64) {
        self.line(format_args!("[idle] {idle_ms}"));
    }

    pub fn cancel_reason(&mut self, f: &CancelFields, calculated_threshold: f64) {
        self.line(format_args!(
            "[cancel-reason] rel:{} t:{} rs:{} lrs:{} rt:{} rft:{} buf:{} keep:{} cthrsh:{}",
            f.reliable as u8,
            f.elapsed_ms,
            f.remaining_size,
            f.lossy_remaining_size,
            f.remaining_dl_time_ms,
            f.remaining_fallback_time_ms,
            f.target_time_ms,
            f.kept as u8,
            calculated_threshold
        ));
    }

    pub fn cancel_try(&mut self, f: &CancelFields, throughput: f64) {
        self.line(format_args!(
            "[cancel-try] rel:{} t:{} rs:{} lrs:{} rt:{} rft:{} buf:{} keep:{} tp:{}",
            f.reliable as u8,
            f.elapsed_ms,
            f.remaining_size,
            f.lossy_remaining_size,
            f.remaining_dl_time_ms,
            f.remaining_fallback_time_ms,
            f.target_time_ms,
            f.kept as u8,
            throughput
        ));
    }

    pub fn cancel_fin(&mut self, f: &CancelFields) {
        self.line(format_args!(
            "[cancel-fin] rel:{} t:{} rs:{} lrs:{} rt:{} rft:{} buf:{} keep:{}",
            f.reliable as u8,
            f.elapsed_ms,
            f.remaining_size,
            f.lossy_remaining_size,
            f.remaining_dl_time_ms,
            f.remaining_fallback_time_ms,
            f.target_time_ms,
            f.kept as u8
        ));
    }

    pub fn cancel_fin_short(&mut self, elapsed_ms: u64) {
        self.line(format_args!("[cancel-fin] t:{elapsed_ms}"));
    }

    pub fn abort_tp(&mut self, since_start_ms: u64, throughput: f64) {
        self.line(format_args!("[abort-tp] s:{since_start_ms} tp:{throughput}"));
    }

    pub fn hole_fill_request(&mut self, hole_range: &str, loss_size: u64) {
        self.line(format_args!("[hole-fill-request] {hole_range}"));
        self.line(format_args!("[hole-fill-request] {loss_size}"));
    }

    pub fn hole_fill(&mut self, fill: u64, loss: u64, dl_ms: u64, remaining_pause_ms: f64) {
        self.line(format_args!(
            "[hole-fill] fill:{fill} loss:{loss} dl:{dl_ms} rp:{}",
            remaining_pause_ms as i64
        ));
    }

    pub fn loss_report(&mut self, report: &str) {
        self.line(format_args!("{report}"));
    }

    pub fn loading_optional(&mut self) {
        self.line(format_args!("[loading-optional]"));
    }

    pub fn skipping_optional(&mut self, ranges: &str) {
        self.line(format_args!("[skipping-optional] {ranges}"));
    }

    pub fn done(&mut self) {
        self.line(format_args!("[done] Terminating"));
    }
}
