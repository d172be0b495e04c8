//! BOLA and its SSIM-map extension.
//!
//! The policy maximises a Lyapunov-style score per candidate,
//! `score = (Vp·(utility + gp) − buffer_level) / size_bits`, over the
//! segment's SSIM ladder. A placeholder buffer lets the controller behave as
//! if the buffer were partially pre-filled, which stabilises startup, and an
//! insufficient-buffer rule caps how many bits may be risked against the
//! current buffer. The same body serves three callers: classic BOLA (a
//! synthetic one-entry-per-quality map derived from the bitrate ladder),
//! BOLA-E over the manifest's SSIM map, and the in-flight re-evaluation used
//! by the abandonment monitors (`progress` set, state updates suppressed).

use crate::abr::AbrLogLine;
use crate::buffer::{PlaybackBuffer, Stall};
use crate::error::ControlError;
use crate::ssim::{SsimEntry, SsimKey, SsimMap};

pub(crate) const BUFFER_LOW_MS: f64 = 10_000.0;
pub(crate) const MIN_THRESHOLD_MS: f64 = 2_000.0;
pub(crate) const SAFETY_FACTOR: f64 = 0.9;
pub(crate) const IBR_SAFETY_FACTOR: f64 = 0.5;

/// State of a download being re-evaluated mid-flight.
///
/// `quality == None` re-plans without crediting the current download at all.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    /// Quality of the in-progress download, if it should be credited.
    pub quality: Option<usize>,
    /// SSIM the in-progress download is aiming for.
    pub ssim: f64,
    /// Bytes already received.
    pub downloaded: u64,
    /// True while the reliable half is still running.
    pub reliable: bool,
}

/// A selected SSIM entry together with the pause the decision imposes.
#[derive(Debug, Clone, Copy)]
pub struct BolaChoice {
    pub key: SsimKey,
    pub quality: usize,
    pub pause: f64,
}

/// BOLA / BOLA-E controller state.
#[derive(Debug)]
pub struct Bola {
    pub(crate) buffer: PlaybackBuffer,
    last_quality: Option<usize>,
    placeholder: f64,
    vp: f64,
    gp: f64,
    segment_duration: f64,
    buffer_size: f64,
    ibr_safety_factor: f64,
    ibr_safety_factor_target: f64,
    bitrates: Vec<f64>,
    utilities: Vec<f64>,
    pause: f64,
    log: Vec<AbrLogLine>,
}

impl Bola {
    /// Build the controller for a bitrate ladder sorted ascending (kbps).
    ///
    /// When per-quality average SSIMs are supplied they become the utility
    /// vector; otherwise utilities default to `ln(R[q] / R[0])`.
    pub fn new(
        segment_duration: f64,
        buffer_size: f64,
        bitrates: Vec<f64>,
        ssims: Option<Vec<f64>>,
    ) -> Result<Self, ControlError> {
        if bitrates.len() < 2 {
            return Err(ControlError::NotEnoughBitrates(bitrates.len()));
        }
        let utilities = match ssims {
            Some(s) if !s.is_empty() => s,
            _ => bitrates.iter().map(|r| (r / bitrates[0]).ln()).collect(),
        };

        let alpha = (bitrates[0] * utilities[1] - bitrates[1] * utilities[0])
            / (bitrates[1] - bitrates[0]);
        let minimum_target = BUFFER_LOW_MS + MIN_THRESHOLD_MS * bitrates.len() as f64;
        let buffer_target = (buffer_size - segment_duration).max(minimum_target);

        // Vp and gp are session constants and must not change mid-session.
        let top_utility = utilities[utilities.len() - 1];
        let vp = (buffer_target - BUFFER_LOW_MS) / (top_utility + alpha);
        let gp = (top_utility * BUFFER_LOW_MS + alpha * buffer_target)
            / (buffer_target - BUFFER_LOW_MS);
        tracing::debug!(alpha, vp, gp, "bola constants");

        Ok(Self {
            buffer: PlaybackBuffer::new(),
            last_quality: None,
            placeholder: 0.0,
            vp,
            gp,
            segment_duration,
            buffer_size,
            ibr_safety_factor: 1.0,
            ibr_safety_factor_target: SAFETY_FACTOR,
            bitrates,
            utilities,
            pause: 0.0,
            log: Vec::new(),
        })
    }

    pub fn buffer_level(&self) -> f64 {
        self.buffer.level()
    }

    pub fn set_buffer_level(&mut self, level: f64) {
        self.buffer.set_level(level);
    }

    pub fn buffer_size(&self) -> f64 {
        self.buffer_size
    }

    pub fn pause(&self) -> f64 {
        self.pause
    }

    pub fn placeholder(&self) -> f64 {
        self.placeholder
    }

    pub fn log(&self) -> &[AbrLogLine] {
        &self.log
    }

    pub(crate) fn pre_update(&mut self) -> Result<Option<Stall>, ControlError> {
        self.buffer.pre_update(self.segment_duration)
    }

    pub(crate) fn post_update(&mut self, pause: f64) {
        self.buffer.apply_pause(pause);
    }

    /// One decision over the given SSIM map; `None` synthesises the classic
    /// per-quality map from the bitrate ladder. Records the decision in the
    /// policy history.
    pub(crate) fn choose(
        &mut self,
        throughput: f64,
        ssim_map: Option<&SsimMap>,
    ) -> Result<BolaChoice, ControlError> {
        let synthesized;
        let map = match ssim_map {
            Some(map) => map,
            None => {
                synthesized = self.default_map(None);
                &synthesized
            }
        };
        let choice = self.bola_e(self.buffer.level(), throughput, map, None)?;

        self.push_log(throughput, choice.quality, choice.pause);
        self.pause = choice.pause;
        Ok(choice)
    }

    /// The BOLA-E body. With `progress` set the decision is evaluated against
    /// the remaining cost of the in-progress download and no controller state
    /// is mutated (the returned pause is always zero in that mode).
    pub fn bola_e(
        &mut self,
        buffer_level: f64,
        throughput: f64,
        ssim_map: &SsimMap,
        progress: Option<&DownloadProgress>,
    ) -> Result<BolaChoice, ControlError> {
        if ssim_map.is_empty() {
            return Err(ControlError::EmptyMap);
        }
        let adjusted;
        let map = match progress {
            Some(p) => match p.quality {
                Some(quality) => {
                    adjusted = ssim_map.adjusted(quality, p.ssim, p.downloaded, !p.reliable);
                    &adjusted
                }
                None => ssim_map,
            },
            None => ssim_map,
        };
        let in_progress = progress.is_some();

        let last_quality = match self.last_quality {
            Some(q) => q,
            None => return self.initial_choice(throughput, map),
        };

        // Oscillation damping, step one: the lowest rung the throughput does
        // not clearly exceed is sustainable enough for the long term. Step
        // two: never force a drop below where we already are.
        let max_quality = self
            .bitrates
            .iter()
            .position(|r| *r >= throughput)
            .unwrap_or(self.bitrates.len() - 1)
            .max(last_quality);

        let (mut key, mut quality) = self.quality_from_buffer_level(
            buffer_level + self.placeholder,
            map,
            max_quality,
            last_quality,
        )?;

        if map.one_entry_per_quality(self.bitrates.len()) {
            // Long-term sustainability clamp; only meaningful when the map
            // mirrors the bitrate ladder one-to-one.
            let sustainable_key = self.quality_from_throughput_map(throughput, map)?;
            let sustainable_quality = self.entry(map, &sustainable_key)?.quality;
            if quality > last_quality && quality > sustainable_quality {
                if sustainable_quality < last_quality {
                    quality = last_quality;
                    key = map
                        .lowest_for_quality(quality)
                        .ok_or(ControlError::QualityMissing(quality))?;
                } else {
                    quality = sustainable_quality;
                    key = sustainable_key;
                }
            }
        }

        // Insufficient-buffer rule over the map: walk down while the chosen
        // size exceeds the safe byte budget, preferring strictly smaller
        // entries.
        let safety_buffer_level = buffer_level.min(self.buffer_size - self.segment_duration);
        let safe_bytes = self.safe_download_size_bits(safety_buffer_level, throughput) / 8.0;
        let mut current_size = self.entry(map, &key)?.size as f64;
        for (candidate, entry) in map.iter().rev() {
            if *candidate >= key {
                continue;
            }
            if current_size <= safe_bytes {
                break;
            }
            if (entry.size as f64) < current_size {
                key = *candidate;
                quality = entry.quality;
                current_size = entry.size as f64;
            }
        }

        let mut pause = 0.0;
        if !in_progress {
            self.ibr_safety_factor =
                (SAFETY_FACTOR * self.ibr_safety_factor).max(self.ibr_safety_factor_target);

            // Shrink the placeholder toward the zero-score level for the
            // chosen ssim; any excess becomes an imposed pause.
            let mut level = self.buffer_level_for_zero_score(key.value());
            if level < BUFFER_LOW_MS {
                tracing::warn!(level, "zero-score level under the low-buffer floor");
                level = BUFFER_LOW_MS;
            }
            if buffer_level + self.placeholder > level {
                self.placeholder = level - buffer_level;
                if self.placeholder < 0.0 {
                    pause = -self.placeholder;
                    self.placeholder = 0.0;
                }
            }

            let overrun =
                self.buffer.level() - pause + self.segment_duration - self.buffer_size;
            if overrun > 0.0 {
                self.placeholder += overrun;
                pause += overrun;
            }

            self.last_quality = Some(quality);
        }

        Ok(BolaChoice {
            key,
            quality,
            pause,
        })
    }

    /// BOLA-E over a synthetic per-quality map: the abandonment monitors
    /// re-plan with the actual sizes of the current segment (in bits), or
    /// with the long-term bitrate ladder when `sizes_bits` is `None`.
    pub fn bola_e_sizes(
        &mut self,
        buffer_level: f64,
        throughput: f64,
        sizes_bits: Option<&[f64]>,
        progress: Option<&DownloadProgress>,
    ) -> Result<usize, ControlError> {
        let map = self.default_map(sizes_bits);
        let choice = self.bola_e(buffer_level, throughput, &map, progress)?;
        Ok(choice.quality)
    }

    /// Synthetic one-entry-per-quality map keyed by the utility vector.
    fn default_map(&self, sizes_bits: Option<&[f64]>) -> SsimMap {
        let mut map = SsimMap::new();
        for (quality, utility) in self.utilities.iter().enumerate() {
            let bits = match sizes_bits {
                Some(sizes) => sizes[quality],
                None => self.bitrates[quality] * self.segment_duration,
            };
            map.insert(
                *utility,
                SsimEntry {
                    size: (bits / 8.0) as u64,
                    reliable_size: 0,
                    quality,
                    // placeholder with no effect
                    required_frames: 100,
                },
            );
        }
        map
    }

    /// First decision of the session: derive the IBR target, seed the
    /// placeholder from the long-term throughput estimate and return the
    /// best entry for the seeded quality.
    fn initial_choice(
        &mut self,
        throughput: f64,
        map: &SsimMap,
    ) -> Result<BolaChoice, ControlError> {
        self.ibr_safety_factor = 1.0;
        self.ibr_safety_factor_target = if self.buffer_size > self.segment_duration {
            (self.segment_duration / (self.buffer_size - self.segment_duration))
                .clamp(IBR_SAFETY_FACTOR, SAFETY_FACTOR)
        } else {
            // A buffer of at least two segment durations is expected.
            SAFETY_FACTOR
        };
        let quality = self.quality_from_throughput_bitrates(SAFETY_FACTOR * throughput, None);
        self.placeholder = self.min_buffer_level_for_quality(quality);
        self.last_quality = Some(quality);
        let key = map
            .highest_for_quality(quality)
            .ok_or(ControlError::QualityMissing(quality))?;
        Ok(BolaChoice {
            key,
            quality,
            pause: 0.0,
        })
    }

    fn entry<'m>(
        &self,
        map: &'m SsimMap,
        key: &SsimKey,
    ) -> Result<&'m SsimEntry, ControlError> {
        map.get(key)
            .ok_or_else(|| ControlError::QualityMissing(self.last_quality.unwrap_or(0)))
    }

    pub(crate) fn score(&self, buffer_level: f64, size_bits: f64, utility: f64) -> f64 {
        (self.vp * (utility + self.gp) - buffer_level) / size_bits
    }

    /// Buffer level at which the chosen utility's score crosses zero.
    pub fn buffer_level_for_zero_score(&self, utility: f64) -> f64 {
        self.vp * (utility + self.gp)
    }

    /// Buffer level below which `quality` stops being preferable to the rung
    /// beneath it. Long-term calculation over the session utilities.
    pub(crate) fn min_buffer_level_for_quality(&self, quality: usize) -> f64 {
        if quality == 0 {
            return 0.0;
        }
        let a = (self.bitrates[quality - 1] * self.utilities[quality]
            - self.bitrates[quality] * self.utilities[quality - 1])
            / (self.bitrates[quality] - self.bitrates[quality - 1]);
        self.vp * (self.gp - a)
    }

    /// Score-maximising entry at the given (placeholder-augmented) buffer
    /// level. Qualities below `favor_quality` pay an SSIM penalty equal to
    /// the average utility step so the controller does not dither downward
    /// for marginal gains; ties resolve to the lower entry.
    fn quality_from_buffer_level(
        &self,
        buffer_level: f64,
        map: &SsimMap,
        max_quality: usize,
        favor_quality: usize,
    ) -> Result<(SsimKey, usize), ControlError> {
        let favor_penalty = (self.utilities[self.utilities.len() - 1] - self.utilities[0])
            / (self.utilities.len() - 1) as f64;
        let mut best: Option<(SsimKey, usize, f64)> = None;
        for (key, entry) in map.iter() {
            if entry.quality > max_quality {
                continue;
            }
            let mut effective_ssim = key.value();
            if entry.quality < favor_quality {
                effective_ssim -= favor_penalty;
            }
            let score = self.score(buffer_level, entry.size as f64 * 8.0, effective_ssim);
            if best.map_or(true, |(_, _, s)| score > s) {
                best = Some((*key, entry.quality, score));
            }
        }
        best.map(|(k, q, _)| (k, q)).ok_or(ControlError::EmptyMap)
    }

    /// Highest quality whose long-term rate stays under the throughput.
    fn quality_from_throughput_bitrates(&self, throughput: f64, sizes_bits: Option<&[f64]>) -> usize {
        for i in 1..self.bitrates.len() {
            let rate = match sizes_bits {
                Some(sizes) => sizes[i] / self.segment_duration,
                None => self.bitrates[i],
            };
            if rate > throughput {
                return i - 1;
            }
        }
        self.bitrates.len() - 1
    }

    /// Best SSIM whose rate fits under the throughput; falls back to the
    /// cheapest entry when nothing fits.
    fn quality_from_throughput_map(
        &self,
        throughput: f64,
        map: &SsimMap,
    ) -> Result<SsimKey, ControlError> {
        let mut cheapest: Option<(SsimKey, f64)> = None;
        for (key, entry) in map.iter().rev() {
            let rate = (8.0 * entry.size as f64) / self.segment_duration;
            if rate <= throughput {
                return Ok(*key);
            }
            if cheapest.map_or(true, |(_, min_rate)| rate < min_rate) {
                cheapest = Some((*key, rate));
            }
        }
        cheapest.map(|(k, _)| k).ok_or(ControlError::EmptyMap)
    }

    /// Bits that can safely be downloaded against the given buffer level.
    pub fn safe_download_size_bits(&self, buffer_level: f64, throughput: f64) -> f64 {
        throughput * self.ibr_safety_factor * buffer_level
    }

    fn push_log(&mut self, throughput: f64, quality: usize, pause: f64) {
        let buffer_level = self.buffer.level();
        let playhead_time = match self.log.last() {
            None => -buffer_level,
            Some(last) => {
                last.playhead_time + self.segment_duration + last.buffer_level - buffer_level
            }
        };
        self.log.push(AbrLogLine {
            playhead_time,
            buffer_level,
            throughput,
            quality,
            bitrate: self.bitrates[quality],
            pause,
        });
    }
}
