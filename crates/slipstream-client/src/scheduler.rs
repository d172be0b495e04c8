//! The per-segment state machine.
//!
//! Per media segment: choose a quality (or reuse an abandoned plan on
//! retry), request the reliable frames, request the required unreliable
//! frames under the abandonment policy, translate losses, refill holes and
//! fetch optional enhancement bytes while the playback-buffer slack allows,
//! then commit the reconstructed body to the output sink.

use std::time::Duration;

use slipstream_abr::{
    AbandonPlan, AbrKind, DecisionInputs, MonitorPolicy, Replan, SsimEntry, SsimKey,
    SAFETY_MARGIN_MS,
};

use crate::error::{ClientError, ClientResult};
use crate::loss::{frame_order, generate_loss_information, splice_body, LossInfo};
use crate::model::{RangeList, Segment};
use crate::report::SegmentFields;
use crate::session::Session;
use crate::transport::{FrameTiming, RangeForm, SegmentRequest, Transport};

/// The quality decision driving one segment attempt.
#[derive(Debug, Clone, Copy)]
struct SegmentChoice {
    quality: usize,
    ssim: Option<SsimKey>,
    pause_ms: f64,
}

/// The byte slices one attempt will request.
#[derive(Debug, Clone)]
struct SlicePlan {
    required_unreliable: RangeList,
    optional_unreliable: RangeList,
    /// Cost estimate for the complete download, fed to the reliable-half
    /// abandonment plan.
    required_reliable_size: u64,
    required_unreliable_size: u64,
    optional_unreliable_size: u64,
}

enum SegmentOutcome {
    Committed,
    Abandoned(Replan),
}

impl<T: Transport> Session<T> {
    /// Iterate every media segment to completion.
    pub(crate) async fn play_segments(&mut self) -> ClientResult<()> {
        let segment_count = self.manifest.segment_count();
        let mut retry: u32 = 0;
        let mut carried = Replan::default();
        let mut index = 1;
        while index < segment_count {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            match self.play_one_segment(index, retry, carried).await? {
                SegmentOutcome::Committed => {
                    retry = 0;
                    carried = Replan::default();
                    index += 1;
                }
                SegmentOutcome::Abandoned(replan) => {
                    retry += 1;
                    carried = replan;
                }
            }
        }
        Ok(())
    }

    fn decide(&mut self, index: usize, retry: u32, carried: Replan) -> ClientResult<SegmentChoice> {
        if index == 1 {
            // The first media segment is always fetched at the lowest
            // quality; map-aware policies aim at its best entry.
            let ssim = self
                .manifest
                .ssim_maps
                .first()
                .and_then(|map| map.highest_for_quality(0))
                .filter(|_| self.settings.uses_ssim_map());
            return Ok(SegmentChoice {
                quality: 0,
                ssim,
                pause_ms: 0.0,
            });
        }
        if retry > 0 {
            // Keep the estimator fed, then reuse the abandoned plan without
            // consulting the policy again.
            self.feed
                .add_sample(&self.ledger, self.settings.fine, &mut self.reporter);
            return match self.settings.abr {
                AbrKind::Bpp => {
                    let throughput = self.ledger.combined_throughput();
                    self.reporter
                        .abort_tp(self.last_request_start_ms, throughput);
                    Ok(SegmentChoice {
                        quality: carried.quality,
                        ssim: carried.ssim,
                        pause_ms: carried.pause_ms,
                    })
                }
                AbrKind::Bola => Ok(SegmentChoice {
                    quality: carried.quality,
                    ssim: None,
                    pause_ms: carried.pause_ms,
                }),
                other => Err(ClientError::InvalidArgument(format!(
                    "abr '{other}' cannot retry a segment"
                ))),
            };
        }

        let throughput = self
            .feed
            .add_sample(&self.ledger, self.settings.fine, &mut self.reporter);
        let map = self
            .settings
            .uses_ssim_map()
            .then(|| self.manifest.ssim_maps.get(index - 1))
            .flatten();
        let decision = self.abr.decide(DecisionInputs {
            throughput,
            ssim_map: map,
            unreliable_time_ms: self.ledger.total_time(true) as f64,
            segment_bytes: self.ledger.total_segment_size(),
        })?;
        if let Some(stall) = decision.stall {
            self.reporter.stall(stall);
        }
        if decision.pause_ms > 0.0 {
            self.reporter.pause(decision.pause_ms);
        }
        self.reporter.buffer(decision.buffer_ms, false);
        if let Some(placeholder) = decision.placeholder_ms {
            self.reporter.placeholder(placeholder);
        }
        Ok(SegmentChoice {
            quality: decision.quality,
            ssim: decision.ssim,
            pause_ms: decision.pause_ms,
        })
    }

    fn plan_slices(
        &mut self,
        segment: &Segment,
        entry: Option<SsimEntry>,
    ) -> ClientResult<SlicePlan> {
        let mut plan = SlicePlan {
            required_unreliable: segment.unreliable_frames.clone(),
            optional_unreliable: RangeList::default(),
            required_reliable_size: segment.total_size,
            required_unreliable_size: segment.unreliable_size,
            optional_unreliable_size: 0,
        };
        if self.settings.abr == AbrKind::Bpp {
            let entry = entry.ok_or_else(|| {
                ClientError::invalid_manifest("bpp needs an ssim entry per segment")
            })?;
            let (required, optional) = segment
                .unreliable_frames
                .split_required(entry.required_frames as usize)?;
            plan.required_unreliable = required;
            plan.required_unreliable_size = entry.size - entry.reliable_size;
            plan.required_reliable_size = entry.size;
            if plan.required_unreliable.len() < segment.unreliable_frames.len() {
                plan.optional_unreliable = optional;
                plan.optional_unreliable_size =
                    segment.unreliable_size - plan.required_unreliable_size;
            }
            self.reporter.bpp_request_sizes(
                segment.reliable_size,
                plan.required_unreliable_size,
                plan.optional_unreliable_size,
            );
        }
        Ok(plan)
    }

    fn abandon_plan(
        &self,
        index: usize,
        size: u64,
        fallback_size: u64,
        quality: usize,
        reliable: bool,
    ) -> AbandonPlan {
        AbandonPlan {
            size,
            fallback_size,
            buffer_occ_ms: self.abr.buffer_level(),
            quality,
            reliable,
            segment_duration_ms: self.manifest.segment_duration_ms as f64,
            bitrates: self.manifest.bitrates(),
            segment_sizes_bits: self.manifest.segment_sizes_bits(index),
        }
    }

    /// Slack beyond one segment of headroom, available for refills.
    fn buffer_slack_ms(&self) -> f64 {
        let duration = self.manifest.segment_duration_ms as f64;
        self.abr.buffer_level() + duration - (self.abr.buffer_size() - duration)
    }

    async fn play_one_segment(
        &mut self,
        index: usize,
        retry: u32,
        carried: Replan,
    ) -> ClientResult<SegmentOutcome> {
        let choice = self.decide(index, retry, carried)?;
        if choice.pause_ms > 0.0 {
            tokio::time::sleep(Duration::from_millis(choice.pause_ms as u64)).await;
        }

        let quality = choice.quality;
        let representation = &self.manifest.representations[quality];
        let base_url = representation.base_url.clone();
        let bandwidth = representation.bandwidth_kbps;
        let segment = representation.segments[index].clone();
        let map = self.manifest.ssim_maps.get(index - 1).cloned();
        let entry = match (&map, choice.ssim) {
            (Some(map), Some(key)) => map.get(&key).copied(),
            _ => None,
        };

        let fields = SegmentFields {
            index,
            ssim: choice.ssim.map(|k| k.value()).unwrap_or(0.0),
            bitrate_kbps: bandwidth,
            total_size: segment.total_size,
            reliable_size: segment.reliable_size,
            unreliable_size: segment.unreliable_size,
            media_range: segment.media_range.to_string(),
            name: base_url.clone(),
        };
        self.reporter.blank();
        self.reporter.trying_segment(&fields, retry);

        let slices = self.plan_slices(&segment, entry)?;
        let path = format!("/{base_url}");
        self.ledger.reset();
        let mut body = vec![0u8; segment.total_size as usize];
        let request_start = self.elapsed_ms();
        self.last_request_start_ms = request_start;
        let policy = self.monitor_policy();

        // Reliable half.
        if !segment.reliable_frames.is_empty() {
            let plan =
                self.abandon_plan(index, slices.required_reliable_size, 0, quality, true);
            let request = SegmentRequest {
                path: path.clone(),
                range: Some(RangeForm::Multi(segment.reliable_frames.clone())),
                unreliable: false,
                fec: 0,
            };
            let (outcome, replan) =
                self.execute(request, policy, Some(plan), map.clone()).await?;
            self.check_status(&outcome, replan.kept, &path)?;
            self.abr.set_buffer_level(
                self.abr.buffer_level() - self.ledger.last_rough_time(false) as f64,
            );
            if !replan.kept {
                return Ok(SegmentOutcome::Abandoned(replan));
            }
            let order = frame_order(&segment.reliable_frames, segment.start_offset);
            splice_body(&mut body, &outcome.body, &order);
        }

        let reliable_done = self.elapsed_ms();
        let mut unreliable_done = reliable_done;

        // Required unreliable half.
        if !slices.required_unreliable.is_empty() {
            let plan = self.abandon_plan(
                index,
                slices.required_unreliable_size,
                0,
                quality,
                false,
            );
            let request = SegmentRequest {
                path: path.clone(),
                range: Some(RangeForm::Multi(slices.required_unreliable.clone())),
                unreliable: true,
                fec: 0,
            };
            let (outcome, replan) =
                self.execute(request, policy, Some(plan), map.clone()).await?;
            self.check_status(&outcome, replan.kept, &path)?;
            self.abr.set_buffer_level(
                self.abr.buffer_level() - self.ledger.last_rough_time(true) as f64,
            );
            if !replan.kept {
                return Ok(SegmentOutcome::Abandoned(replan));
            }

            let mut response = outcome.body.to_vec();
            let received_len = response.len() as u64;
            let tail_loss = slices.required_unreliable_size.saturating_sub(received_len);
            if received_len < slices.required_unreliable_size {
                response.resize(slices.required_unreliable_size as usize, 0);
            }
            let order = frame_order(&slices.required_unreliable, segment.start_offset);
            splice_body(&mut body, &response, &order);
            unreliable_done = self.elapsed_ms();

            let have_loss = slices
                .required_unreliable_size
                .saturating_sub(self.ledger.last(true).received_size);
            if have_loss > 0 {
                let mut timings = outcome.frame_timings.clone();
                if tail_loss > 0 {
                    timings.entry(received_len).or_insert(FrameTiming {
                        arrival_ms: None,
                        length: tail_loss,
                        was_lost: true,
                    });
                }
                let losses =
                    generate_loss_information(&timings, segment.start_offset, &order);
                if self.buffer_slack_ms() > SAFETY_MARGIN_MS {
                    let used = self
                        .fill_holes(&path, index, losses, segment.start_offset, &mut body)
                        .await?;
                    self.abr
                        .set_buffer_level(self.abr.buffer_level() - used as f64);
                } else {
                    self.reporter.loss_report(&losses.report);
                }
            }
        }

        // Optional enhancement frames, same machinery as hole refills.
        if !slices.optional_unreliable.is_empty() {
            if self.buffer_slack_ms() > SAFETY_MARGIN_MS {
                self.reporter.loading_optional();
                let optional = LossInfo {
                    hole_range: slices.optional_unreliable.clone(),
                    report: String::new(),
                    loss_size: slices.optional_unreliable_size,
                };
                let used = self
                    .fill_holes(&path, index, optional, segment.start_offset, &mut body)
                    .await?;
                self.abr
                    .set_buffer_level(self.abr.buffer_level() - used as f64);
            } else {
                self.reporter
                    .skipping_optional(&slices.optional_unreliable.to_string());
            }
        }

        self.output.write_all(&body)?;
        self.output.flush()?;

        let loss = segment
            .unreliable_size
            .saturating_sub(self.ledger.last(true).received_size);
        self.reporter.segment(&fields, loss);
        self.reporter.time(
            request_start,
            reliable_done - request_start,
            unreliable_done - reliable_done,
            self.ledger.last(false).time_ms,
            self.ledger.last(true).time_ms,
        );
        self.reporter.throughput(
            self.feed.throughput(),
            self.ledger.mean_throughput(false).0,
            self.ledger.mean_throughput(true).0,
        );
        self.reporter.half_throughputs(false, self.ledger.all(false));
        self.reporter.half_throughputs(true, self.ledger.all(true));
        Ok(SegmentOutcome::Committed)
    }

    /// Deadline-bounded refill rounds: request the current hole list, splice
    /// what arrives, re-derive the holes from newly-reported losses, and
    /// stop once the holes drain or the buffer budget is spent. Returns the
    /// wall time consumed.
    async fn fill_holes(
        &mut self,
        path: &str,
        index: usize,
        mut losses: LossInfo,
        segment_start: u64,
        body: &mut [u8],
    ) -> ClientResult<u64> {
        let mut used_time: u64 = 0;
        let mut remaining_pause = self.buffer_slack_ms();
        while !losses.hole_range.is_empty() && remaining_pause > SAFETY_MARGIN_MS {
            let hole_csv = losses.hole_range.to_string();
            self.reporter.hole_fill_request(&hole_csv, losses.loss_size);

            let mut plan =
                self.abandon_plan(index, losses.loss_size, losses.loss_size, 0, false);
            plan.buffer_occ_ms = remaining_pause;
            let request = SegmentRequest {
                path: path.to_string(),
                range: Some(RangeForm::Multi(losses.hole_range.clone())),
                unreliable: true,
                fec: 0,
            };
            let (outcome, replan) = self
                .execute(request, MonitorPolicy::Deadline, Some(plan), None)
                .await?;
            self.check_status(&outcome, replan.kept, path)?;

            let mut response = outcome.body.to_vec();
            let received_len = response.len() as u64;
            let tail_loss = losses.loss_size.saturating_sub(received_len);
            if received_len < losses.loss_size {
                response.resize(losses.loss_size as usize, 0);
            }
            let order = frame_order(&losses.hole_range, segment_start);
            splice_body(body, &response, &order);

            let round_received = self.ledger.last(true).received_size;
            let still_missing = losses.loss_size.saturating_sub(round_received);
            if still_missing > 0 {
                let mut timings = outcome.frame_timings.clone();
                if tail_loss > 0 {
                    timings.entry(received_len).or_insert(FrameTiming {
                        arrival_ms: None,
                        length: tail_loss,
                        was_lost: true,
                    });
                }
                losses = generate_loss_information(&timings, segment_start, &order);
            } else {
                losses = LossInfo::default();
            }

            let round_time = self.ledger.last_rough_time(true);
            used_time += round_time;
            remaining_pause -= round_time as f64;
            self.reporter.hole_fill(
                round_received,
                losses.loss_size,
                round_time,
                remaining_pause,
            );
        }
        if !losses.hole_range.is_empty() && !losses.report.is_empty() {
            self.reporter.loss_report(&losses.report);
        }
        Ok(used_time)
    }
}
