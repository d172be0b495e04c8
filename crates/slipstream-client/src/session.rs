//! The session orchestrator.
//!
//! Owns the transport, the policy, the estimator feed and the timing ledger,
//! and drives the whole download: manifest, init segment, then every media
//! segment through the scheduler. The structured stderr stream and the
//! reconstructed bytes on the output sink are the session's two products.

use std::io::Write;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use slipstream_abr::{Abr, AbrKind, MonitorPolicy, SsimMap};

use crate::error::{ClientError, ClientResult};
use crate::feed::ThroughputFeed;
use crate::governor::Governor;
use crate::manifest::parse_mpd;
use crate::model::Manifest;
use crate::report::{Reporter, SegmentFields};
use crate::settings::Settings;
use crate::timing::{SubSegmentTiming, TimingLedger};
use crate::transport::{FetchOutcome, RangeForm, SegmentRequest, Transport};

pub struct Session<T: Transport> {
    pub(crate) transport: T,
    pub(crate) settings: Settings,
    pub(crate) reporter: Reporter,
    pub(crate) output: Box<dyn Write + Send>,
    pub(crate) cancel: CancellationToken,
    pub(crate) abr: Abr,
    pub(crate) feed: ThroughputFeed,
    pub(crate) ledger: TimingLedger,
    pub(crate) manifest: Manifest,
    pub(crate) started: Instant,
    pub(crate) last_request_start_ms: u64,
}

impl<T: Transport> Session<T> {
    /// Run a complete session: manifest, init segment, every media segment,
    /// `[done]`.
    pub async fn run(
        transport: T,
        settings: Settings,
        reporter: Reporter,
        output: Box<dyn Write + Send>,
    ) -> ClientResult<()> {
        Self::run_with_cancel(transport, settings, reporter, output, CancellationToken::new())
            .await
    }

    /// Like [`Session::run`], stopping between segments once `cancel` fires.
    pub async fn run_with_cancel(
        mut transport: T,
        settings: Settings,
        mut reporter: Reporter,
        output: Box<dyn Write + Send>,
        cancel: CancellationToken,
    ) -> ClientResult<()> {
        let started = Instant::now();
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        reporter.start(epoch_ms);
        if !settings.features_raw.is_empty() {
            reporter.features(&settings.features_raw);
        }
        reporter.connected(&transport.peer());

        let manifest =
            Self::fetch_manifest(&mut transport, &settings, &mut reporter).await?;

        let bitrates = manifest.bitrates();
        reporter.legend();
        reporter.bitrates(&bitrates);
        reporter.avg_ssims(&manifest.avg_ssims);
        if let Some(first) = manifest.ssim_maps.first() {
            reporter.first_segment_map(first);
        }
        reporter.segments(
            manifest.segment_count().saturating_sub(1),
            manifest.segment_duration_ms,
        );

        if settings.uses_ssim_map() && manifest.ssim_maps.is_empty() {
            return Err(ClientError::invalid_manifest(
                "the selected abr needs per-segment ssims",
            ));
        }

        if settings.fine {
            reporter.fine();
        }
        match settings.abr {
            AbrKind::Tput => reporter.smooth(settings.smooth),
            AbrKind::Mpc => reporter.harmonic(),
            _ => {}
        }
        let feed = ThroughputFeed::for_abr(settings.abr, settings.smooth);
        let abr = Abr::new(
            settings.abr,
            manifest.segment_duration_ms as f64,
            settings.buffer_ms,
            bitrates,
            Some(manifest.avg_ssims.clone()).filter(|s| !s.is_empty()),
        )?;
        reporter.abr(settings.abr.as_str());

        let mut session = Session {
            transport,
            settings,
            reporter,
            output,
            cancel,
            abr,
            feed,
            ledger: TimingLedger::new(),
            manifest,
            started,
            last_request_start_ms: 0,
        };
        session.write_init_segment().await?;
        session.play_segments().await?;
        session.reporter.done();
        session.output.flush()?;
        Ok(())
    }

    async fn fetch_manifest(
        transport: &mut T,
        settings: &Settings,
        reporter: &mut Reporter,
    ) -> ClientResult<Manifest> {
        let request = SegmentRequest {
            path: settings.manifest_path.clone(),
            range: None,
            unreliable: false,
            fec: 0,
        };
        let mut governor = Governor::passive(reporter);
        let outcome = transport.fetch(&request, &mut governor).await?;
        governor.finish(outcome.elapsed_ms);
        drop(governor);
        match outcome.status {
            Some(404) => return Err(ClientError::NotFound(settings.manifest_path.clone())),
            Some(_) => {}
            None => return Err(ClientError::MissingStatus),
        }
        let xml = std::str::from_utf8(&outcome.body)
            .map_err(|e| ClientError::invalid_manifest(format!("manifest is not UTF-8: {e}")))?;
        let mut manifest = parse_mpd(xml)?;
        if settings.features.no_drop {
            let quality_count = manifest.representations.len();
            for map in &mut manifest.ssim_maps {
                map.reshape_no_drop(quality_count);
            }
        }
        Ok(manifest)
    }

    /// Issue one request, govern it, and fold its timing into the ledger.
    pub(crate) async fn execute(
        &mut self,
        request: SegmentRequest,
        policy: MonitorPolicy,
        plan: Option<slipstream_abr::AbandonPlan>,
        ssim_map: Option<SsimMap>,
    ) -> ClientResult<(FetchOutcome, slipstream_abr::Replan)> {
        let Session {
            transport,
            abr,
            reporter,
            ledger,
            settings,
            ..
        } = self;
        let mut governor = match plan {
            Some(plan) => Governor::with_plan(
                reporter,
                policy,
                plan,
                ssim_map.as_ref(),
                abr.as_bola_mut(),
            ),
            None => Governor::passive(reporter),
        };
        let outcome = transport.fetch(&request, &mut governor).await?;
        if let Some(error) = governor.take_error() {
            return Err(error.into());
        }
        if !outcome.cancelled {
            governor.finish(outcome.elapsed_ms);
        }
        let replan = governor.replan();
        drop(governor);

        ledger.record(
            request.unreliable,
            SubSegmentTiming::from_outcome(&outcome, settings.fine),
        );
        if outcome.frame_timings.is_empty() && replan.kept {
            return Err(ClientError::MissingFrameTimings);
        }
        Ok((outcome, replan))
    }

    pub(crate) fn check_status(
        &self,
        outcome: &FetchOutcome,
        kept: bool,
        path: &str,
    ) -> ClientResult<()> {
        match outcome.status {
            Some(404) => Err(ClientError::NotFound(path.to_string())),
            Some(_) => Ok(()),
            None if kept => Err(ClientError::MissingStatus),
            None => Ok(()),
        }
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub(crate) fn monitor_policy(&self) -> MonitorPolicy {
        match self.settings.abr {
            AbrKind::Bpp => MonitorPolicy::Bpp,
            AbrKind::Bola if self.settings.features.bola_enhanced => MonitorPolicy::BolaEnhanced,
            AbrKind::Bola => MonitorPolicy::Bola,
            AbrKind::Mpc | AbrKind::Tput => MonitorPolicy::Passive,
        }
    }

    async fn write_init_segment(&mut self) -> ClientResult<()> {
        self.reporter.blank();
        let representation = &self.manifest.representations[0];
        let bandwidth = representation.bandwidth_kbps;
        let base_url = representation.base_url.clone();
        let init = representation.segments[0].clone();
        let since_start = self.elapsed_ms();

        let request = SegmentRequest {
            path: format!("/{base_url}"),
            range: Some(RangeForm::Bytes(init.media_range)),
            unreliable: false,
            fec: 0,
        };
        let (outcome, _) = self
            .execute(request, MonitorPolicy::Passive, None, None)
            .await?;
        self.check_status(&outcome, true, &base_url)?;
        self.output.write_all(&outcome.body)?;
        self.output.flush()?;

        let timing = self.ledger.last(false);
        self.reporter.init_segment(&SegmentFields {
            index: 0,
            ssim: 0.0,
            bitrate_kbps: bandwidth,
            total_size: timing.segment_size,
            reliable_size: timing.segment_size,
            unreliable_size: 0,
            media_range: init.media_range.to_string(),
            name: base_url,
        });
        self.reporter.time(
            since_start,
            self.elapsed_ms() - since_start,
            0,
            timing.time_ms,
            0,
        );
        self.reporter.throughput(0.0, timing.throughput, 0.0);
        self.reporter.blank();
        self.reporter.buffer(0.0, false);
        Ok(())
    }
}
