//! Adaptive bitrate control for partially-reliable segmented streaming.
//!
//! This crate holds the decision side of the client: throughput estimators,
//! the ABR policy family (BOLA and its SSIM-map extension, MPC, plain
//! throughput matching), the per-segment SSIM→(size, quality) map, the shared
//! playback-buffer bookkeeping and the in-flight abandonment monitors.
//!
//! Everything here is pure control logic. Nothing performs I/O, reads clocks
//! or spawns tasks: callers feed in measurements (bytes, milliseconds) and get
//! decisions back as values, which keeps every policy deterministic and
//! directly unit-testable.
//!
//! Units follow the wire conventions throughout: time in milliseconds, sizes
//! in bytes (bits where a name says so), throughput in kbps — which is
//! conveniently the same as bits per millisecond.
//!
//! This crate is composed of several modules:
//! - `estimator`: the four interchangeable throughput filters.
//! - `ssim`: the SSIM-indexed size map and its reshaping operations.
//! - `buffer`: virtual playback-buffer bookkeeping shared by all policies.
//! - `bola`: BOLA / BOLA-E (Lyapunov utility optimization with placeholder).
//! - `mpc`: model-predictive tree search over a fixed horizon.
//! - `tput`: throughput-matching rate selection.
//! - `abr`: the tagged policy dispatch and the common decision surface.
//! - `monitor`: the abandonment monitors driven during a download.

mod abr;
mod bola;
mod buffer;
mod error;
mod estimator;
mod monitor;
mod mpc;
mod ssim;
mod tput;

pub use crate::abr::{Abr, AbrKind, AbrLogLine, Decision, DecisionInputs};
pub use crate::bola::{Bola, BolaChoice, DownloadProgress};
pub use crate::buffer::{PlaybackBuffer, Stall};
pub use crate::error::ControlError;
pub use crate::estimator::{BppMovingAverage, Ewma, HarmonicMean, MovingAverage};
pub use crate::monitor::{
    AbandonMonitor, AbandonPlan, MonitorPolicy, Replan, Verdict, ABANDON_MULTIPLIER,
    BANDWIDTH_SAFETY_FACTOR, GRACE_TIME_THRESHOLD_MS, MIN_SAMPLES_TO_AVERAGE, SAFETY_MARGIN_MS,
    TICK_INTERVAL_MS,
};
pub use crate::mpc::Mpc;
pub use crate::ssim::{SsimEntry, SsimKey, SsimMap};
pub use crate::tput::Throughput;
