//! Command-line surface.
//!
//! A `clap` front end that resolves to the immutable [`Settings`] value the
//! session runs on. The binary that owns a concrete transport wires this to
//! `std::env::args`; tests feed argument vectors directly.

use clap::Parser;
use url::Url;

use slipstream_abr::AbrKind;

use crate::error::{ClientError, ClientResult};
use crate::settings::Settings;

/// Adaptive video client over a partially-reliable transport.
#[derive(Debug, Parser)]
#[command(name = "slipstream-client", disable_help_flag = false)]
pub struct Args {
    /// Manifest URL, scheme included (e.g. https://host/video.mpd).
    pub url: String,

    /// IP address of the host to connect to, overriding the URL host.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to connect to, overriding the URL port.
    #[arg(long)]
    pub port: Option<u16>,

    /// ABR algorithm to use.
    #[arg(long, default_value = "bola")]
    pub abr: String,

    /// Playback buffer for the ABR, in milliseconds.
    #[arg(long = "abr_buf", default_value_t = 20_000)]
    pub abr_buf: u32,

    /// EWMA smoothing factor for the tput estimator.
    #[arg(long, default_value_t = 0.0)]
    pub smooth: f64,

    /// Use the transport's fine-grained throughput signal.
    #[arg(long)]
    pub fine: bool,

    /// Feature toggles, `key:value#key:value#…`.
    #[arg(long)]
    pub feature: Option<String>,

    /// Skip certificate verification (handled by the transport).
    #[arg(long = "disable-certificate-verification")]
    pub disable_certificate_verification: bool,
}

impl Args {
    /// Resolve the parsed arguments into session [`Settings`].
    pub fn into_settings(self) -> ClientResult<Settings> {
        let url = Url::parse(&self.url)
            .map_err(|e| ClientError::InvalidArgument(format!("invalid URL: {e}")))?;
        let abr: AbrKind = self
            .abr
            .parse()
            .map_err(|name| ClientError::UnknownAbr(name))?;
        let authority = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidArgument("URL has no host".to_string()))?
            .to_string();

        let mut settings = Settings::new()
            .scheme(url.scheme())
            .authority(authority)
            .manifest_path(url.path())
            .abr(abr)
            .buffer_ms(self.abr_buf as f64)
            .smooth(self.smooth)
            .fine(self.fine);
        if let Some(feature) = &self.feature {
            settings = settings.features(feature.clone())?;
        }
        Ok(settings)
    }

    /// The endpoint the transport should dial: `--host`/`--port` override
    /// the URL's own authority.
    pub fn endpoint(&self) -> ClientResult<(String, u16)> {
        let url = Url::parse(&self.url)
            .map_err(|e| ClientError::InvalidArgument(format!("invalid URL: {e}")))?;
        let host = match &self.host {
            Some(host) => host.clone(),
            None => url
                .host_str()
                .ok_or_else(|| ClientError::InvalidArgument("URL has no host".to_string()))?
                .to_string(),
        };
        let port = match self.port {
            Some(port) => port,
            None => url
                .port_or_known_default()
                .ok_or_else(|| ClientError::InvalidArgument("URL has no port".to_string()))?,
        };
        Ok((host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("slipstream-client").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_resolve_to_bola_with_a_twenty_second_buffer() {
        let settings = parse(&["https://cdn.example/video.mpd"])
            .into_settings()
            .unwrap();
        assert_eq!(settings.abr, AbrKind::Bola);
        assert_eq!(settings.buffer_ms, 20_000.0);
        assert_eq!(settings.manifest_path, "/video.mpd");
        assert_eq!(settings.authority, "cdn.example");
        assert!(!settings.fine);
    }

    #[test]
    fn flags_map_onto_settings() {
        let settings = parse(&[
            "https://cdn.example/video.mpd",
            "--abr",
            "bpp",
            "--abr_buf",
            "30000",
            "--smooth",
            "0.7",
            "--fine",
            "--feature",
            "no_drop:1",
        ])
        .into_settings()
        .unwrap();
        assert_eq!(settings.abr, AbrKind::Bpp);
        assert_eq!(settings.buffer_ms, 30_000.0);
        assert_eq!(settings.smooth, 0.7);
        assert!(settings.fine);
        assert!(settings.features.no_drop);
    }

    #[test]
    fn unknown_abr_maps_to_the_contractual_error() {
        let err = parse(&["https://cdn.example/video.mpd", "--abr", "pensieve"])
            .into_settings()
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownAbr(_)));
        assert_eq!(err.exit_code(), -1);
    }

    #[test]
    fn endpoint_prefers_explicit_host_and_port() {
        let args = parse(&[
            "https://cdn.example:6121/video.mpd",
            "--host",
            "10.0.0.7",
        ]);
        assert_eq!(args.endpoint().unwrap(), ("10.0.0.7".to_string(), 6121));
        let args = parse(&["https://cdn.example/video.mpd"]);
        assert_eq!(args.endpoint().unwrap(), ("cdn.example".to_string(), 443));
    }
}
