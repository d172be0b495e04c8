//! In-memory test fixtures: a deterministic media server behind the
//! `Transport` contract, a manifest generator, and log-parsing helpers.
//!
//! The fake transport advances simulated time in 50 ms ticks, reports
//! progress to the observer exactly like the wire client would, honours
//! cancellation, and scripts losses per request range so loss accounting and
//! hole-fill run against realistic frame-timing maps.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use slipstream_client::{
    ByteRange, FetchOutcome, FrameTiming, FrameTimings, RangeForm, SegmentRequest, TickDecision,
    Transport, TransportError, TransferObserver, TransferSnapshot,
};

/// Shared capture buffer for the reporter and the output sink.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The deterministic media byte at an absolute file offset.
fn media_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// A run of deterministic media bytes.
pub fn media_bytes(start: u64, len: u64) -> Vec<u8> {
    (start..start + len).map(media_byte).collect()
}

/// Shape of the generated fixture stream.
pub struct FixtureConfig {
    /// Bitrate ladder, ascending, kbps.
    pub bitrates_kbps: Vec<u32>,
    pub media_segments: usize,
    /// Unreliable frame ranges per segment.
    pub unreliable_ranges: usize,
    /// Emit per-segment `ssims` attributes (one entry per quality).
    pub ssims: bool,
    /// Required frame count for the ssims entries; `None` means all ranges.
    pub required_fraction: Option<usize>,
}

impl FixtureConfig {
    /// Total bytes of one media segment at the given quality:
    /// `kbps · 4000 ms / 8`.
    pub fn total_size(&self, quality: usize) -> u64 {
        self.bitrates_kbps[quality] as u64 * 500
    }

    pub fn reliable_size(&self, quality: usize) -> u64 {
        self.total_size(quality) / 5
    }

    pub fn unreliable_size(&self, quality: usize) -> u64 {
        self.total_size(quality) - self.reliable_size(quality)
    }

    /// Extent of media segment `index` (1-based) at `quality`.
    pub fn segment_extent(&self, quality: usize, index: usize) -> ByteRange {
        let total = self.total_size(quality);
        let start = 800 + (index as u64 - 1) * total;
        ByteRange::new(start, start + total - 1)
    }

    fn reliable_range(&self, quality: usize, index: usize) -> ByteRange {
        let extent = self.segment_extent(quality, index);
        ByteRange::new(extent.start, extent.start + self.reliable_size(quality) - 1)
    }

    fn unreliable_range_list(&self, quality: usize, index: usize) -> Vec<ByteRange> {
        let extent = self.segment_extent(quality, index);
        let first = extent.start + self.reliable_size(quality);
        let chunk = self.unreliable_size(quality) / self.unreliable_ranges as u64;
        (0..self.unreliable_ranges as u64)
            .map(|r| ByteRange::new(first + r * chunk, first + (r + 1) * chunk - 1))
            .collect()
    }

    /// The csv the session requests for the full unreliable half.
    pub fn unreliable_csv(&self, quality: usize, index: usize) -> String {
        self.unreliable_range_list(quality, index)
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn avg_ssim(&self, quality: usize) -> f64 {
        0.78 + 0.05 * quality as f64
    }
}

/// Render the fixture manifest, representations in descending bitrate order
/// the way encoders usually write them.
pub fn manifest_xml(config: &FixtureConfig) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MPD type=\"static\">\n  <Period>\n    <AdaptationSet>\n",
    );
    for quality in (0..config.bitrates_kbps.len()).rev() {
        let bw = config.bitrates_kbps[quality];
        xml.push_str(&format!(
            "      <Representation mimeType=\"video/mp4\" bandwidth=\"{}\" avgSSIM=\"{}\">\n",
            bw as u64 * 1000,
            config.avg_ssim(quality)
        ));
        xml.push_str(&format!("        <BaseURL>video_{bw}.mp4</BaseURL>\n"));
        xml.push_str("        <SegmentList timescale=\"1000\" duration=\"4000\">\n");
        xml.push_str("          <Initialization range=\"0-799\"/>\n");
        for index in 1..=config.media_segments {
            let extent = config.segment_extent(quality, index);
            let reliable = config.reliable_range(quality, index);
            let unreliable = config.unreliable_csv(quality, index);
            let mut ssims = String::new();
            if config.ssims {
                let frames = config
                    .required_fraction
                    .unwrap_or(config.unreliable_ranges);
                let chunk = config.unreliable_size(quality) / config.unreliable_ranges as u64;
                let size = frames as u64 * chunk;
                ssims = format!(
                    " ssims=\"{}:{}:{}\"",
                    config.avg_ssim(quality),
                    frames,
                    size
                );
            }
            xml.push_str(&format!(
                "          <SegmentURL mediaRange=\"{}\" reliable=\"{}\" unreliable=\"{}\" reliableSize=\"{}\"{}/>\n",
                extent,
                reliable,
                unreliable,
                config.reliable_size(quality),
                ssims
            ));
        }
        xml.push_str("        </SegmentList>\n      </Representation>\n");
    }
    xml.push_str("    </AdaptationSet>\n  </Period>\n</MPD>\n");
    xml
}

const TICK_MS: u64 = 50;

type ThroughputFn = Box<dyn Fn(usize) -> f64 + Send>;

/// Scripted transport: deterministic bytes, a per-request throughput
/// schedule and one-shot losses keyed by the requested range csv.
pub struct FakeTransport {
    manifest: String,
    throughput: ThroughputFn,
    losses: HashMap<String, Vec<(u64, u64)>>,
    not_found: HashSet<String>,
    request_index: usize,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl FakeTransport {
    pub fn new(manifest: String, _config: &FixtureConfig) -> Self {
        init_tracing();
        Self {
            manifest,
            throughput: Box::new(|_| 1000.0),
            losses: HashMap::new(),
            not_found: HashSet::new(),
            request_index: 0,
        }
    }

    /// Throughput by request index (manifest is request 0, init request 1).
    pub fn throughput(mut self, f: impl Fn(usize) -> f64 + Send + 'static) -> Self {
        self.throughput = Box::new(f);
        self
    }

    /// Script body-offset losses for the first request of the given range
    /// csv. Later identical requests (refills) see no loss.
    pub fn lose(mut self, range_csv: &str, losses: &[(u64, u64)]) -> Self {
        self.losses.insert(range_csv.to_string(), losses.to_vec());
        self
    }

    pub fn not_found(mut self, path: &str) -> Self {
        self.not_found.insert(path.to_string());
        self
    }

    fn instant_outcome(status: u16, body: Bytes) -> FetchOutcome {
        let mut frame_timings = FrameTimings::new();
        frame_timings.insert(
            0,
            FrameTiming {
                arrival_ms: Some(1),
                length: body.len() as u64,
                was_lost: false,
            },
        );
        FetchOutcome {
            status: Some(status),
            body,
            frame_timings,
            elapsed_ms: 1,
            cancelled: false,
        }
    }
}

fn lost_in_prefix(losses: &[(u64, u64)], prefix: u64) -> u64 {
    losses
        .iter()
        .map(|(start, len)| {
            if prefix <= *start {
                0
            } else {
                (prefix - start).min(*len)
            }
        })
        .sum()
}

fn absolute_offset(ranges: &[ByteRange], body_pos: u64) -> u64 {
    let mut remaining = body_pos;
    for range in ranges {
        if remaining < range.len() {
            return range.start + remaining;
        }
        remaining -= range.len();
    }
    ranges.last().map(|r| r.end).unwrap_or(0)
}

/// Delivered/lost runs over `[0, progress)`, keyed by body offset.
fn build_timings(losses: &[(u64, u64)], progress: u64, rate_bytes_per_ms: f64) -> FrameTimings {
    let mut cuts = vec![0u64, progress];
    for (start, len) in losses {
        if *start < progress {
            cuts.push(*start);
            cuts.push((start + len).min(progress));
        }
    }
    cuts.sort_unstable();
    cuts.dedup();

    let mut timings = FrameTimings::new();
    for window in cuts.windows(2) {
        let (run_start, run_end) = (window[0], window[1]);
        if run_start == run_end {
            continue;
        }
        let lost = losses
            .iter()
            .any(|(s, l)| *s <= run_start && run_start < s + l);
        timings.insert(
            run_start,
            FrameTiming {
                arrival_ms: (!lost).then(|| (run_end as f64 / rate_bytes_per_ms) as u64),
                length: run_end - run_start,
                was_lost: lost,
            },
        );
    }
    timings
}

#[async_trait]
impl Transport for FakeTransport {
    fn peer(&self) -> String {
        "127.0.0.1:6121".to_string()
    }

    async fn fetch(
        &mut self,
        request: &SegmentRequest,
        observer: &mut dyn TransferObserver,
    ) -> Result<FetchOutcome, TransportError> {
        let index = self.request_index;
        self.request_index += 1;

        if self.not_found.contains(&request.path) {
            return Ok(Self::instant_outcome(404, Bytes::from_static(b"not found")));
        }
        let Some(range) = &request.range else {
            return Ok(Self::instant_outcome(
                200,
                Bytes::from(self.manifest.clone().into_bytes()),
            ));
        };

        let (ranges, key): (Vec<ByteRange>, String) = match range {
            RangeForm::Bytes(r) => (vec![*r], r.to_string()),
            RangeForm::Multi(list) => (list.iter().copied().collect(), list.to_string()),
        };
        let total: u64 = ranges.iter().map(ByteRange::len).sum();
        let losses = if request.unreliable {
            self.losses.remove(&key).unwrap_or_default()
        } else {
            Vec::new()
        };
        let throughput = (self.throughput)(index);
        let rate = throughput / 8.0;

        let mut elapsed = 0u64;
        let mut progress = 0u64;
        let mut cancelled = false;
        while progress < total {
            elapsed += TICK_MS;
            if elapsed > 10_000_000 {
                return Err(TransportError::Other("simulation ran away".to_string()));
            }
            progress = ((rate * elapsed as f64) as u64).min(total);
            if progress >= total {
                break;
            }
            let snapshot = TransferSnapshot {
                elapsed_ms: elapsed,
                received_bytes: progress - lost_in_prefix(&losses, progress),
                progress_bytes: progress,
                throughput_kbps: throughput,
            };
            if observer.on_tick(&snapshot) == TickDecision::Cancel {
                cancelled = true;
                break;
            }
        }

        let mut body = Vec::with_capacity(progress as usize);
        for body_pos in 0..progress {
            let lost = losses
                .iter()
                .any(|(s, l)| body_pos >= *s && body_pos < s + l);
            body.push(if lost {
                0
            } else {
                media_byte(absolute_offset(&ranges, body_pos))
            });
        }
        Ok(FetchOutcome {
            status: Some(200),
            body: Bytes::from(body),
            frame_timings: build_timings(&losses, progress, rate),
            elapsed_ms: elapsed.max(1),
            cancelled,
        })
    }
}

/// Pull `key:` values from every log line starting with `tag `. An empty key
/// takes the first token after the tag.
pub fn parse_log_values(log: &str, tag: &str, key: &str) -> Vec<f64> {
    let prefix = format!("{tag} ");
    log.lines()
        .filter(|line| line.starts_with(&prefix))
        .filter_map(|line| {
            if key.is_empty() {
                line[prefix.len()..].split_whitespace().next()?.parse().ok()
            } else {
                let marker = format!(" {key}:");
                let at = line.find(&marker)? + marker.len();
                line[at..].split_whitespace().next()?.parse().ok()
            }
        })
        .collect()
}
