//! The ABR policy family behind one operation surface.
//!
//! The session talks to one tagged variant instead of trait objects or
//! visitors: every policy answers `decide`, exposes its imposed pause and
//! owns the virtual buffer the scheduler debits download time from.

use std::fmt;
use std::str::FromStr;

use crate::bola::Bola;
use crate::buffer::Stall;
use crate::error::ControlError;
use crate::mpc::Mpc;
use crate::ssim::{SsimKey, SsimMap};
use crate::tput::Throughput;

/// Which controller the session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrKind {
    /// Classic BOLA (or BOLA-E when a feature hands it the SSIM map).
    Bola,
    /// BOLA-E plus the abandonment / hole-fill / optional-fetch machinery.
    Bpp,
    /// Model-predictive tree search.
    Mpc,
    /// Plain throughput matching.
    Tput,
}

impl AbrKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbrKind::Bola => "bola",
            AbrKind::Bpp => "bpp",
            AbrKind::Mpc => "mpc",
            AbrKind::Tput => "tput",
        }
    }
}

impl fmt::Display for AbrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbrKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bola" => Ok(AbrKind::Bola),
            "bpp" => Ok(AbrKind::Bpp),
            "mpc" => Ok(AbrKind::Mpc),
            "tput" => Ok(AbrKind::Tput),
            other => Err(other.to_string()),
        }
    }
}

/// One row of the per-decision history kept for offline analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbrLogLine {
    pub playhead_time: f64,
    pub buffer_level: f64,
    pub throughput: f64,
    pub quality: usize,
    pub bitrate: f64,
    pub pause: f64,
}

/// Ledger-derived observations handed to a decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    /// Filtered throughput estimate from the policy's adapter, kbps.
    pub throughput: f64,
    /// The SSIM map of the upcoming segment, for map-aware policies.
    pub ssim_map: Option<&'a SsimMap>,
    /// Wall time of the previous segment's unreliable half, ms (MPC).
    pub unreliable_time_ms: f64,
    /// Bytes committed for the previous segment (MPC).
    pub segment_bytes: f64,
}

/// Outcome of one decision cycle.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    /// Chosen quality level.
    pub quality: usize,
    /// Chosen SSIM entry, when the policy decided over a map.
    pub ssim: Option<SsimKey>,
    /// Pause to honor before issuing the request, ms.
    pub pause_ms: f64,
    /// Stall observed while clamping the buffer, if any.
    pub stall: Option<Stall>,
    /// Buffer level after the cycle, ms.
    pub buffer_ms: f64,
    /// Placeholder level after the cycle (BOLA family only), ms.
    pub placeholder_ms: Option<f64>,
}

/// Tagged policy dispatch.
#[derive(Debug)]
pub enum Abr {
    Bola(Bola),
    Mpc(Mpc),
    Tput(Throughput),
}

impl Abr {
    /// Build the controller for the requested policy. `bola` and `bpp` share
    /// the BOLA controller; they differ in the machinery around it.
    pub fn new(
        kind: AbrKind,
        segment_duration: f64,
        buffer_size: f64,
        bitrates: Vec<f64>,
        avg_ssims: Option<Vec<f64>>,
    ) -> Result<Self, ControlError> {
        Ok(match kind {
            AbrKind::Bola | AbrKind::Bpp => Abr::Bola(Bola::new(
                segment_duration,
                buffer_size,
                bitrates,
                avg_ssims,
            )?),
            AbrKind::Mpc => Abr::Mpc(Mpc::new(segment_duration, buffer_size, bitrates)),
            AbrKind::Tput => Abr::Tput(Throughput::new(segment_duration, buffer_size, bitrates)),
        })
    }

    /// Run one full decision cycle: buffer pre-update, quality selection and
    /// pause application.
    pub fn decide(&mut self, inputs: DecisionInputs<'_>) -> Result<Decision, ControlError> {
        match self {
            Abr::Bola(bola) => {
                let stall = bola.pre_update()?;
                let choice = bola.choose(inputs.throughput, inputs.ssim_map)?;
                bola.post_update(choice.pause);
                Ok(Decision {
                    quality: choice.quality,
                    ssim: inputs.ssim_map.map(|_| choice.key),
                    pause_ms: choice.pause,
                    stall,
                    buffer_ms: bola.buffer_level(),
                    placeholder_ms: Some(bola.placeholder()),
                })
            }
            Abr::Mpc(mpc) => {
                let stall = mpc.pre_update(inputs.unreliable_time_ms, inputs.segment_bytes)?;
                let (quality, pause) = mpc.choose(inputs.throughput);
                mpc.post_update(pause);
                Ok(Decision {
                    quality,
                    ssim: None,
                    pause_ms: pause,
                    stall,
                    buffer_ms: mpc.buffer_level(),
                    placeholder_ms: None,
                })
            }
            Abr::Tput(tput) => {
                let stall = tput.pre_update()?;
                let (quality, pause) = tput.choose(inputs.throughput);
                tput.post_update(pause);
                Ok(Decision {
                    quality,
                    ssim: None,
                    pause_ms: pause,
                    stall,
                    buffer_ms: tput.buffer_level(),
                    placeholder_ms: None,
                })
            }
        }
    }

    pub fn pause(&self) -> f64 {
        match self {
            Abr::Bola(b) => b.pause(),
            Abr::Mpc(m) => m.pause(),
            Abr::Tput(t) => t.pause(),
        }
    }

    pub fn buffer_level(&self) -> f64 {
        match self {
            Abr::Bola(b) => b.buffer_level(),
            Abr::Mpc(m) => m.buffer_level(),
            Abr::Tput(t) => t.buffer_level(),
        }
    }

    pub fn set_buffer_level(&mut self, level: f64) {
        match self {
            Abr::Bola(b) => b.set_buffer_level(level),
            Abr::Mpc(m) => m.set_buffer_level(level),
            Abr::Tput(t) => t.set_buffer_level(level),
        }
    }

    pub fn buffer_size(&self) -> f64 {
        match self {
            Abr::Bola(b) => b.buffer_size(),
            Abr::Mpc(m) => m.buffer_size(),
            Abr::Tput(t) => t.buffer_size(),
        }
    }

    pub fn log(&self) -> &[AbrLogLine] {
        match self {
            Abr::Bola(b) => b.log(),
            Abr::Mpc(m) => m.log(),
            Abr::Tput(t) => t.log(),
        }
    }

    /// The BOLA controller, when this policy carries one. The abandonment
    /// monitors re-plan through it mid-download.
    pub fn as_bola_mut(&mut self) -> Option<&mut Bola> {
        match self {
            Abr::Bola(b) => Some(b),
            _ => None,
        }
    }
}
