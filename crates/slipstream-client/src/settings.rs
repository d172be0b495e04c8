//! Unified session configuration.
//!
//! One flattened, immutable settings value built at startup and handed by
//! reference to everything that consults it. Feature toggles in particular
//! are parsed once into [`Features`]; nothing in the session reads mutable
//! global state.

use slipstream_abr::AbrKind;

use crate::error::{ClientError, ClientResult};

/// Feature toggles recognised from the `--feature k:v#k:v#…` surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Switch classic BOLA to the SSIM-map decision path and the size-aware
    /// abandonment check.
    pub bola_enhanced: bool,
    /// Collapse each segment's SSIM map to one entry per quality, keeping
    /// the max-required-frames entry.
    pub no_drop: bool,
}

impl Features {
    /// Parse the `key:value#key:value` feature string. Unknown keys are
    /// tolerated (they may be aimed at other tools reading the same flag);
    /// a pair without a colon is an error.
    pub fn parse(raw: &str) -> ClientResult<Self> {
        let mut features = Features::default();
        if raw.is_empty() {
            return Ok(features);
        }
        for pair in raw.split('#') {
            let (key, _value) = pair.split_once(':').ok_or_else(|| {
                ClientError::InvalidArgument(format!("feature pair '{pair}' has no value"))
            })?;
            match key {
                "bola_enhanced" => features.bola_enhanced = true,
                "no_drop" => features.no_drop = true,
                other => tracing::debug!(feature = other, "ignoring unrecognised feature"),
            }
        }
        Ok(features)
    }
}

/// Immutable per-session settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Request scheme for the header block.
    pub scheme: String,
    /// Request authority for the header block.
    pub authority: String,
    /// Path of the manifest resource.
    pub manifest_path: String,
    /// Which ABR policy drives the session.
    pub abr: AbrKind,
    /// Playback buffer size in milliseconds.
    pub buffer_ms: f64,
    /// EWMA smoothing factor for the throughput policy's estimator.
    pub smooth: f64,
    /// Use the transport's fine-grained signal for throughput calculation.
    pub fine: bool,
    /// Parsed feature toggles.
    pub features: Features,
    /// The raw feature string, echoed into the log contract.
    pub features_raw: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            authority: "localhost".to_string(),
            manifest_path: "/manifest.mpd".to_string(),
            abr: AbrKind::Bola,
            buffer_ms: 20_000.0,
            smooth: 0.0,
            fine: false,
            features: Features::default(),
            features_raw: String::new(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest_path(mut self, path: impl Into<String>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn abr(mut self, abr: AbrKind) -> Self {
        self.abr = abr;
        self
    }

    pub fn buffer_ms(mut self, buffer_ms: f64) -> Self {
        self.buffer_ms = buffer_ms;
        self
    }

    pub fn smooth(mut self, smooth: f64) -> Self {
        self.smooth = smooth;
        self
    }

    pub fn fine(mut self, fine: bool) -> Self {
        self.fine = fine;
        self
    }

    pub fn features(mut self, raw: impl Into<String>) -> ClientResult<Self> {
        self.features_raw = raw.into();
        self.features = Features::parse(&self.features_raw)?;
        Ok(self)
    }

    /// True when decisions run over the segment SSIM map.
    pub fn uses_ssim_map(&self) -> bool {
        self.abr == AbrKind::Bpp || (self.abr == AbrKind::Bola && self.features.bola_enhanced)
    }
}
