//! MPD manifest parsing.
//!
//! Event-driven reader over the DASH-style manifest. The attributes the core
//! consumes: `Representation[@mimeType,@bandwidth,@avgSSIM]`, `BaseURL`,
//! `SegmentList[@timescale,@duration]`, `Initialization[@range]` and
//! `SegmentURL[@mediaRange,@reliable,@unreliable,@ssims,@reliableSize]`.
//! The `ssims` attribute carries `ssim:frames:size` triplets.
//!
//! Representations arrive in document order; the assembled manifest orders
//! them by ascending bitrate and rewrites the SSIM maps' quality indices to
//! match. Audio representations are logged and skipped.

use std::collections::BTreeMap;

use quick_xml::events::attributes::Attributes;
use quick_xml::events::Event;
use quick_xml::Reader;

use slipstream_abr::{SsimEntry, SsimMap};

use crate::error::{ClientError, ClientResult};
use crate::model::{ByteRange, Manifest, RangeList, Representation, Segment};

#[derive(Debug, Default)]
struct RepresentationBuilder {
    bandwidth_kbps: u32,
    avg_ssim: f64,
    base_url: String,
    segments: Vec<Segment>,
}

fn attr_map(attributes: Attributes<'_>) -> ClientResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for attribute in attributes {
        let attribute =
            attribute.map_err(|e| ClientError::invalid_manifest(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
        let value = attribute
            .unescape_value()
            .map_err(|e| ClientError::invalid_manifest(format!("bad attribute value: {e}")))?
            .to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn required<'m>(map: &'m BTreeMap<String, String>, key: &str) -> ClientResult<&'m str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| ClientError::invalid_manifest(format!("missing attribute '{key}'")))
}

fn parse_u64(value: &str, what: &str) -> ClientResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::invalid_manifest(format!("bad {what} '{value}'")))
}

fn parse_f64(value: &str, what: &str) -> ClientResult<f64> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::invalid_manifest(format!("bad {what} '{value}'")))
}

/// Parse the `ssim:frames:size` triplet list into map entries. The sizes in
/// the manifest exclude the reliable prefix; entries store the full cost.
fn parse_ssims(
    raw: &str,
    reliable_size: u64,
    bandwidth_kbps: u32,
    map: &mut SsimMap,
) -> ClientResult<()> {
    for triplet in raw.split(',').filter(|t| !t.is_empty()) {
        let mut parts = triplet.split(':');
        let (Some(ssim), Some(frames), Some(size)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ClientError::invalid_manifest(format!(
                "bad ssims triplet '{triplet}'"
            )));
        };
        let ssim = parse_f64(ssim, "ssim")?;
        let frames = parse_u64(frames, "ssim frame count")? as u32;
        let size = parse_u64(size, "ssim size")?;
        map.insert(
            ssim,
            SsimEntry {
                size: size + reliable_size,
                reliable_size,
                // Bandwidth stands in for the quality index until the full
                // ladder is known.
                quality: bandwidth_kbps as usize,
                required_frames: frames,
            },
        );
    }
    Ok(())
}

/// Parse the manifest body into the session [`Manifest`].
pub fn parse_mpd(xml: &str) -> ClientResult<Manifest> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut current: Option<RepresentationBuilder> = None;
    let mut skipping_audio = false;
    let mut in_base_url = false;
    let mut finished: Vec<RepresentationBuilder> = Vec::new();
    let mut ssim_maps: Vec<SsimMap> = Vec::new();
    let mut segment_duration_ms = 0u64;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ClientError::invalid_manifest(format!("xml error: {e}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name();
                match name.as_ref() {
                    b"Representation" => {
                        let attrs = attr_map(e.attributes())?;
                        let mime = attrs.get("mimeType").cloned().unwrap_or_default();
                        if mime.starts_with("audio") {
                            tracing::warn!(mime = %mime, "skipping audio representation");
                            skipping_audio = true;
                            continue;
                        }
                        skipping_audio = false;
                        let bandwidth = parse_u64(required(&attrs, "bandwidth")?, "bandwidth")?;
                        let avg_ssim = parse_f64(required(&attrs, "avgSSIM")?, "avgSSIM")?;
                        current = Some(RepresentationBuilder {
                            bandwidth_kbps: (bandwidth / 1000) as u32,
                            avg_ssim,
                            ..Default::default()
                        });
                    }
                    b"BaseURL" if current.is_some() && !skipping_audio => {
                        in_base_url = true;
                    }
                    b"SegmentList" => {
                        let attrs = attr_map(e.attributes())?;
                        let timescale =
                            parse_u64(required(&attrs, "timescale")?, "timescale")?;
                        let duration = parse_u64(required(&attrs, "duration")?, "duration")?;
                        if timescale == 0 {
                            return Err(ClientError::invalid_manifest("zero timescale"));
                        }
                        segment_duration_ms = (duration / timescale) * 1000;
                    }
                    b"Initialization" => {
                        let Some(rep) = current.as_mut() else { continue };
                        let attrs = attr_map(e.attributes())?;
                        let range = ByteRange::parse(required(&attrs, "range")?)?;
                        let size = range.end + 1;
                        rep.segments.push(Segment {
                            media_range: range,
                            reliable_frames: RangeList::new(vec![range]),
                            unreliable_frames: RangeList::default(),
                            total_size: size,
                            reliable_size: size,
                            unreliable_size: 0,
                            start_offset: 0,
                        });
                    }
                    b"SegmentURL" => {
                        let Some(rep) = current.as_mut() else { continue };
                        let attrs = attr_map(e.attributes())?;
                        let media_range =
                            ByteRange::parse(required(&attrs, "mediaRange")?)?;
                        let reliable_frames =
                            RangeList::parse(required(&attrs, "reliable")?)?;
                        let unreliable_frames =
                            RangeList::parse(attrs.get("unreliable").map_or("", String::as_str))?;
                        let reliable_size =
                            parse_u64(required(&attrs, "reliableSize")?, "reliableSize")?;
                        let total_size = media_range.len();
                        let segment = Segment {
                            media_range,
                            reliable_frames,
                            unreliable_frames,
                            total_size,
                            reliable_size,
                            unreliable_size: total_size - reliable_size,
                            start_offset: media_range.start,
                        };
                        segment.validate()?;

                        if let Some(ssims) = attrs.get("ssims").filter(|s| !s.is_empty()) {
                            // Media segments start at index 1; the map vector
                            // does not cover the initialization segment.
                            let media_index =
                                rep.segments.len().checked_sub(1).ok_or_else(|| {
                                    ClientError::invalid_manifest(
                                        "SegmentURL before Initialization",
                                    )
                                })?;
                            if ssim_maps.len() < media_index + 1 {
                                ssim_maps.resize_with(media_index + 1, SsimMap::new);
                            }
                            parse_ssims(
                                ssims,
                                reliable_size,
                                rep.bandwidth_kbps,
                                &mut ssim_maps[media_index],
                            )?;
                        }
                        rep.segments.push(segment);
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) if in_base_url => {
                if let Some(rep) = current.as_mut() {
                    rep.base_url = t
                        .unescape()
                        .map_err(|e| {
                            ClientError::invalid_manifest(format!("bad BaseURL: {e}"))
                        })?
                        .to_string();
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"BaseURL" => in_base_url = false,
                b"Representation" => {
                    skipping_audio = false;
                    if let Some(rep) = current.take() {
                        finished.push(rep);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if finished.is_empty() {
        return Err(ClientError::invalid_manifest("no video representations"));
    }

    // Ascending bitrate order defines the quality indices.
    finished.sort_by_key(|r| r.bandwidth_kbps);
    let bitrates: Vec<u32> = finished.iter().map(|r| r.bandwidth_kbps).collect();
    for map in &mut ssim_maps {
        map.remap_qualities(|bandwidth| {
            bitrates
                .iter()
                .position(|b| *b as usize == bandwidth)
                .unwrap_or(0)
        });
    }
    for (index, map) in ssim_maps.iter().enumerate() {
        if !map.is_empty() && map.distinct_qualities() != bitrates.len() {
            tracing::warn!(
                segment = index + 1,
                qualities = map.distinct_qualities(),
                expected = bitrates.len(),
                "segment has missing quality entries"
            );
        }
    }

    let avg_ssims = finished.iter().map(|r| r.avg_ssim).collect();
    let representations = finished
        .into_iter()
        .map(|rep| Representation {
            bandwidth_kbps: rep.bandwidth_kbps,
            base_url: rep.base_url,
            segments: rep.segments,
        })
        .collect();

    Ok(Manifest {
        representations,
        avg_ssims,
        ssim_maps,
        segment_duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period>
    <AdaptationSet>
      <Representation mimeType="video/mp4" bandwidth="1000000" avgSSIM="0.93">
        <BaseURL>video_1000.mp4</BaseURL>
        <SegmentList timescale="1000" duration="4000">
          <Initialization range="0-799"/>
          <SegmentURL mediaRange="800-10799" reliable="800-2799" unreliable="2800-10799"
                      reliableSize="2000" ssims="0.85:1:4000,0.91:2:8000"/>
        </SegmentList>
      </Representation>
      <Representation mimeType="video/mp4" bandwidth="500000" avgSSIM="0.88">
        <BaseURL>video_500.mp4</BaseURL>
        <SegmentList timescale="1000" duration="4000">
          <Initialization range="0-799"/>
          <SegmentURL mediaRange="800-5799" reliable="800-1799" unreliable="1800-5799"
                      reliableSize="1000" ssims="0.80:1:2500"/>
        </SegmentList>
      </Representation>
      <Representation mimeType="audio/mp4" bandwidth="64000" avgSSIM="0">
        <BaseURL>audio.mp4</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>
"#;

    #[test]
    fn parses_representations_in_ascending_bitrate_order() {
        let manifest = parse_mpd(MPD).unwrap();
        assert_eq!(manifest.representations.len(), 2);
        assert_eq!(manifest.representations[0].bandwidth_kbps, 500);
        assert_eq!(manifest.representations[1].bandwidth_kbps, 1000);
        assert_eq!(manifest.representations[0].base_url, "video_500.mp4");
        assert_eq!(manifest.segment_duration_ms, 4000);
        assert_eq!(manifest.avg_ssims, vec![0.88, 0.93]);
    }

    #[test]
    fn init_segment_is_fully_reliable() {
        let manifest = parse_mpd(MPD).unwrap();
        let init = &manifest.representations[0].segments[0];
        assert_eq!(init.total_size, 800);
        assert_eq!(init.reliable_size, 800);
        assert_eq!(init.unreliable_size, 0);
        assert_eq!(init.start_offset, 0);
    }

    #[test]
    fn media_segments_carry_the_frame_partition() {
        let manifest = parse_mpd(MPD).unwrap();
        let segment = &manifest.representations[1].segments[1];
        assert_eq!(segment.total_size, 10_000);
        assert_eq!(segment.reliable_size, 2000);
        assert_eq!(segment.unreliable_size, 8000);
        assert_eq!(segment.start_offset, 800);
        assert_eq!(segment.reliable_frames.to_string(), "800-2799");
    }

    #[test]
    fn ssim_entries_are_remapped_to_quality_indices() {
        let manifest = parse_mpd(MPD).unwrap();
        assert_eq!(manifest.ssim_maps.len(), 1);
        let map = &manifest.ssim_maps[0];
        assert_eq!(map.len(), 3);
        let low = map.lowest_for_quality(0).expect("500 kbps entry");
        assert_eq!(low.value(), 0.80);
        // Full cost includes the reliable prefix.
        assert_eq!(map.get(&low).map(|e| e.size), Some(3500));
        let high = map.highest_for_quality(1).expect("1000 kbps entry");
        assert_eq!(high.value(), 0.91);
        assert_eq!(map.get(&high).map(|e| e.size), Some(10_000));
    }

    #[test]
    fn audio_representations_are_skipped() {
        let manifest = parse_mpd(MPD).unwrap();
        assert!(manifest
            .representations
            .iter()
            .all(|r| !r.base_url.contains("audio")));
    }

    #[test]
    fn a_manifest_without_video_is_an_error() {
        let err = parse_mpd("<MPD></MPD>").unwrap_err();
        assert!(matches!(err, ClientError::InvalidManifest(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
