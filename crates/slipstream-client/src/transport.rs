//! The transport contract.
//!
//! The QUIC stack that actually moves bytes is an external collaborator; this
//! module pins down the narrow interface the session consumes. A transport
//! executes one request at a time, drives its own event loop while a transfer
//! runs, and invokes the caller's observer on every pass so the abandonment
//! machinery can cancel mid-flight. Connection management (crypto handshake,
//! stateless-reject reconnect and resend, up to the implementation's hello
//! limit) stays inside the implementation; the session only sees the terminal
//! [`TransportError`] when recovery fails.
//!
//! Frame timings are keyed by body-relative stream offset. Lost frames carry
//! no arrival timestamp. For any received data at least one timing record
//! must exist — the session treats an empty map on a kept response as fatal.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::model::{ByteRange, RangeList};

/// Header marking a request for unreliable delivery.
pub const HEADER_UNRELIABLE: &str = "x-slipstream-unreliable";
/// Header carrying the forward-error-correction parameter; `0` (or absence —
/// the two are equivalent) disables FEC.
pub const HEADER_FEC: &str = "x-slipstream-fec";

/// Arrival record for one stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Arrival time relative to the request start; `None` for lost frames.
    pub arrival_ms: Option<u64>,
    /// Frame length in bytes.
    pub length: u64,
    /// True when the transport gave up on this frame.
    pub was_lost: bool,
}

/// Frame timings keyed by body-relative stream offset.
pub type FrameTimings = BTreeMap<u64, FrameTiming>;

/// The two `:range` wire forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeForm {
    /// `bytes=a-b`
    Bytes(ByteRange),
    /// `multibytes=a1-b1,a2-b2,…`
    Multi(RangeList),
}

impl RangeForm {
    pub fn header_value(&self) -> String {
        match self {
            RangeForm::Bytes(range) => format!("bytes={range}"),
            RangeForm::Multi(list) => format!("multibytes={list}"),
        }
    }

    /// Bytes the request asks for.
    pub fn total_bytes(&self) -> u64 {
        match self {
            RangeForm::Bytes(range) => range.len(),
            RangeForm::Multi(list) => list.total_bytes(),
        }
    }
}

/// One request against the media server.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    /// Request path (`/<base_url>` or the manifest path).
    pub path: String,
    /// Byte ranges to fetch; `None` fetches the whole resource.
    pub range: Option<RangeForm>,
    /// Deliver over the unreliable stream flag.
    pub unreliable: bool,
    /// FEC parameter echoed into [`HEADER_FEC`].
    pub fec: u8,
}

impl SegmentRequest {
    /// The header block for this request, pseudo-headers first.
    pub fn header_block(&self, scheme: &str, authority: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), scheme.to_string()),
            (":authority".to_string(), authority.to_string()),
            (":path".to_string(), self.path.clone()),
        ];
        if let Some(range) = &self.range {
            headers.push((":range".to_string(), range.header_value()));
        }
        headers.push((
            HEADER_UNRELIABLE.to_string(),
            if self.unreliable { "true" } else { "false" }.to_string(),
        ));
        headers.push((HEADER_FEC.to_string(), self.fec.to_string()));
        headers
    }
}

/// Mid-transfer state reported to the observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferSnapshot {
    /// Monotonic time since the request was issued, ms.
    pub elapsed_ms: u64,
    /// Bytes actually delivered so far.
    pub received_bytes: u64,
    /// Stream progress: delivered plus declared-lost bytes.
    pub progress_bytes: u64,
    /// The stream's own throughput estimate, kbps.
    pub throughput_kbps: f64,
}

/// Observer answer for one event-loop pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Continue,
    /// Reset the stream (`QUIC_STREAM_NO_ERROR`) and drain pending events.
    Cancel,
}

/// Per-pass hook a transport drives while a transfer runs.
pub trait TransferObserver: Send {
    fn on_tick(&mut self, snapshot: &TransferSnapshot) -> TickDecision;
}

/// Everything the session keeps from one finished (or cancelled) request.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// `:status`, when the response carried one.
    pub status: Option<u16>,
    /// Response body in request-emission order.
    pub body: Bytes,
    /// Per-frame arrival records for the body.
    pub frame_timings: FrameTimings,
    /// Wall-clock duration of the request, ms.
    pub elapsed_ms: u64,
    /// True when the observer cancelled the transfer.
    pub cancelled: bool,
}

/// Terminal transport failures. Policy-level cancellation is not an error —
/// it comes back as [`FetchOutcome::cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The crypto handshake was statelessly rejected more times than the
    /// implementation's hello limit allows.
    #[error("crypto handshake rejected too many times")]
    TooManyRejects,

    #[error("transport error: {0}")]
    Other(String),
}

/// A client for the extended QUIC server, able to flag streams unreliable.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable peer address for the connection log line.
    fn peer(&self) -> String;

    /// Execute one request to completion or cancellation, invoking
    /// `observer` once per event-loop pass (at least every 50 ms of wall
    /// time while data is flowing).
    async fn fetch(
        &mut self,
        request: &SegmentRequest,
        observer: &mut dyn TransferObserver,
    ) -> Result<FetchOutcome, TransportError>;
}
