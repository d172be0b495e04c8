//! Throughput-matching rate selection.
//!
//! The simplest policy in the family: pick the highest rung whose bitrate
//! fits under a safety-discounted throughput estimate. Buffer handling is the
//! shared cycle plus a pause when the next segment would overrun the buffer.

use crate::abr::AbrLogLine;
use crate::bola::SAFETY_FACTOR;
use crate::buffer::{PlaybackBuffer, Stall};
use crate::error::ControlError;

#[derive(Debug)]
pub struct Throughput {
    pub(crate) buffer: PlaybackBuffer,
    segment_duration: f64,
    buffer_size: f64,
    bitrates: Vec<f64>,
    pause: f64,
    log: Vec<AbrLogLine>,
}

impl Throughput {
    pub fn new(segment_duration: f64, buffer_size: f64, bitrates: Vec<f64>) -> Self {
        Self {
            buffer: PlaybackBuffer::new(),
            segment_duration,
            buffer_size,
            bitrates,
            pause: 0.0,
            log: Vec::new(),
        }
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

    pub fn log(&self) -> &[AbrLogLine] {
        &self.log
    }

    pub(crate) fn pre_update(&mut self) -> Result<Option<Stall>, ControlError> {
        self.buffer.pre_update(self.segment_duration)
    }

    pub(crate) fn post_update(&mut self, pause: f64) {
        self.buffer.apply_pause(pause);
    }

    pub(crate) fn choose(&mut self, throughput: f64) -> (usize, f64) {
        let quality = self.quality_from_throughput(throughput * SAFETY_FACTOR);
        let pause = (self.buffer.level() + self.segment_duration - self.buffer_size).max(0.0);
        self.push_log(throughput, quality, pause);
        self.pause = pause;
        (quality, pause)
    }

    fn quality_from_throughput(&self, throughput: f64) -> usize {
        for i in 1..self.bitrates.len() {
            if self.bitrates[i] > throughput {
                return i - 1;
            }
        }
        self.bitrates.len() - 1
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
