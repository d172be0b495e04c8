//! Crate error type.

/// Errors surfaced by the control policies.
///
/// Policy-recoverable situations (abandonment, retry with a new plan) are not
/// errors — they travel as [`crate::Verdict`] values. This enum covers the
/// invariant violations that must take the session down.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The virtual buffer went more than 100 s negative, which means the
    /// bookkeeping around download times has diverged from reality.
    #[error("rebuffer of {0} ms exceeds the 100 s invariant")]
    RebufferOverflow(f64),

    /// A quality level chosen from the bitrate ladder has no entry in the
    /// segment's SSIM map.
    #[error("no ssim entry for quality {0}")]
    QualityMissing(usize),

    /// A decision was requested against an empty SSIM map.
    #[error("empty ssim map")]
    EmptyMap,

    /// Fewer than two bitrates were supplied; the BOLA constants are not
    /// defined for a single-rung ladder.
    #[error("at least two bitrates are required, got {0}")]
    NotEnoughBitrates(usize),
}
