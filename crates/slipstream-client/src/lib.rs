//! Adaptive segmented-video download session over a partially-reliable
//! transport.
//!
//! This crate drives a DASH-style video download across an extended QUIC
//! that can flag individual streams unreliable. Per segment it picks a
//! quality through one of the `slipstream-abr` policies, issues the
//! reliable and unreliable halves of the request, watches the transfer for
//! abandonment, translates reported losses into hole ranges, refills them
//! while the playback-buffer budget allows, optionally fetches enhancement
//! bytes, and writes the reconstructed segment to the output sink.
//!
//! The transport itself is an external collaborator behind the
//! [`Transport`] trait; integration tests drive the full session against a
//! scripted in-memory implementation.
//!
//! This crate is composed of several modules:
//! - `model`: manifest-derived pure types (ranges, segments, manifest).
//! - `manifest`: the MPD reader.
//! - `transport`: the transport contract and request/outcome types.
//! - `timing`: sub-segment timing records and the per-session ledger.
//! - `feed`: estimator adapters sampling the ledger per decision.
//! - `loss`: body↔segment mapping, splicing and hole-range translation.
//! - `governor`: the per-request observer running the abandonment monitors.
//! - `scheduler`: the per-segment state machine and the hole-fill loop.
//! - `session`: the orchestrator.
//! - `report`: the contractual stderr lines.
//! - `settings` / `cli`: immutable configuration and its clap front end.
//! - `error`: unified error type and exit-code mapping.

mod cli;
mod error;
mod feed;
mod governor;
mod loss;
mod manifest;
mod model;
mod report;
mod scheduler;
mod session;
mod settings;
mod timing;
mod transport;

pub use crate::cli::Args;
pub use crate::error::{ClientError, ClientResult};
pub use crate::feed::ThroughputFeed;
pub use crate::governor::Governor;
pub use crate::loss::{frame_order, generate_loss_information, splice_body, FrameOrder, LossInfo};
pub use crate::manifest::parse_mpd;
pub use crate::model::{ByteRange, Manifest, RangeList, Representation, Segment};
pub use crate::report::{CancelFields, Reporter, SegmentFields};
pub use crate::session::Session;
pub use crate::settings::{Features, Settings};
pub use crate::timing::{SubSegmentTiming, TimingLedger};
pub use crate::transport::{
    FetchOutcome, FrameTiming, FrameTimings, RangeForm, SegmentRequest, TickDecision, Transport,
    TransportError, TransferObserver, TransferSnapshot, HEADER_FEC, HEADER_UNRELIABLE,
};
